//! 协调核心的错误类型
//!
//! 与降级策略配合：存储不可用时状态机返回安全默认值；执行失败记录为错误并推进调度；
//! 重复启动 / 停止只返回 false，不修改任何状态。

use std::time::Duration;

use thiserror::Error;

use crate::core::AgentId;
use crate::store::StoreError;

/// 面向调用方（HTTP 层等）的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Agent {agent} failed: {reason}")]
    ExecutorFailure { agent: AgentId, reason: String },

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// 已知智能体但没有注册执行器
    #[error("Agent {0} is not implemented")]
    NotImplemented(AgentId),

    /// ACTIVE 守卫：同一智能体不允许重复调用
    #[error("Agent {0} is already running")]
    AgentBusy(AgentId),

    #[error("Automated mode is already active")]
    ConcurrentStartRejected,

    #[error("Automated mode is not active")]
    ConcurrentStopRejected,
}

impl From<StoreError> for CoordinatorError {
    fn from(e: StoreError) -> Self {
        CoordinatorError::StoreUnavailable(e.to_string())
    }
}

/// 执行器失败原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("{0}")]
    Failed(String),

    #[error("executor returned no result")]
    EmptyResult,

    #[error("invocation timed out after {0:?}")]
    Timeout(Duration),

    #[error("executor panicked: {0}")]
    Panicked(String),
}
