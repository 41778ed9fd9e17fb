//! 协调器门面：供 HTTP 层 / 嵌入方调用的统一入口
//!
//! 名字在这里解析成 [`AgentId`]，未知名字返回 [`CoordinatorError::UnknownAgent`]；
//! 状态机的降级结果在这里转成显式错误。

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value;

use crate::core::automated_mode::{AutomatedModeController, AutomatedModeStatus};
use crate::core::schedule::ScheduleKind;
use crate::core::scheduler::Scheduler;
use crate::core::state::{AgentRecord, AgentState, ErrorRecord};
use crate::core::{AgentId, AgentStateMachine, CoordinatorError};

/// 状态快照中保留的最近日志条数
pub const STATUS_LOG_TAIL: usize = 20;

/// 单个智能体的状态快照
#[derive(Clone, Debug, Serialize)]
pub struct AgentStatus {
    pub agent: AgentId,
    pub state: Option<AgentState>,
    pub schedule: String,
    pub implemented: bool,
    pub last_activity: Option<NaiveDateTime>,
    pub last_run_time: Option<NaiveDateTime>,
    pub next_run_time: Option<NaiveDateTime>,
    pub last_result: Option<Value>,
    pub last_error: Option<ErrorRecord>,
    pub run_count: i64,
    pub failure_count: i64,
    pub recent_logs: Vec<String>,
}

pub struct Coordinator {
    state: Arc<AgentStateMachine>,
    scheduler: Arc<Scheduler>,
    automated: AutomatedModeController,
}

impl Coordinator {
    pub fn new(state: Arc<AgentStateMachine>, scheduler: Arc<Scheduler>) -> Self {
        let automated = AutomatedModeController::new(state.clone(), scheduler.clone());
        Self {
            state,
            scheduler,
            automated,
        }
    }

    pub fn state_machine(&self) -> &Arc<AgentStateMachine> {
        &self.state
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn automated(&self) -> &AutomatedModeController {
        &self.automated
    }

    /// 创建或迁移协调文档
    pub async fn initialize(&self) -> Result<(), CoordinatorError> {
        if self.state.initialize().await {
            Ok(())
        } else {
            Err(CoordinatorError::StoreUnavailable(
                "could not initialize coordination document".into(),
            ))
        }
    }

    // ---- 自动模式 ----

    pub async fn start_automated_mode(&self, duration: Option<Duration>) -> Result<(), CoordinatorError> {
        if self.automated.start(duration).await {
            Ok(())
        } else {
            Err(CoordinatorError::ConcurrentStartRejected)
        }
    }

    pub async fn stop_automated_mode(&self) -> Result<(), CoordinatorError> {
        if self.automated.stop().await {
            Ok(())
        } else {
            Err(CoordinatorError::ConcurrentStopRejected)
        }
    }

    pub async fn automated_mode_status(&self) -> AutomatedModeStatus {
        self.automated.status().await
    }

    /// 停止会话并等待循环退出
    pub async fn shutdown(&self) {
        if self.automated.stop_and_join().await {
            tracing::info!("Automated mode session closed for shutdown");
        }
    }

    // ---- 智能体 ----

    pub async fn agent_status(&self, name: &str) -> Result<AgentStatus, CoordinatorError> {
        let agent: AgentId = name.parse()?;
        let record = self.state.load_record(agent).await?;
        Ok(self.snapshot(record))
    }

    pub async fn agent_statuses(&self) -> Result<Vec<AgentStatus>, CoordinatorError> {
        let mut out = Vec::with_capacity(AgentId::ALL.len());
        for agent in AgentId::ALL {
            let record = self.state.load_record(agent).await?;
            out.push(self.snapshot(record));
        }
        Ok(out)
    }

    /// 手动触发：ACTIVE 时拒绝，否则同步执行一次并返回结果
    pub async fn trigger_agent(&self, name: &str) -> Result<Value, CoordinatorError> {
        let agent: AgentId = name.parse()?;
        let record = self.state.load_record(agent).await?;
        if record.is_active() {
            return Err(CoordinatorError::AgentBusy(agent));
        }
        tracing::info!(agent = %agent, "Manual trigger");
        self.scheduler.invoke(agent).await
    }

    pub async fn reset_agent(&self, name: &str) -> Result<(), CoordinatorError> {
        let agent: AgentId = name.parse()?;
        if self.state.reset_agent(agent).await {
            Ok(())
        } else {
            Err(CoordinatorError::StoreUnavailable(format!("could not reset {agent}")))
        }
    }

    pub async fn agent_logs(&self, name: &str, limit: Option<usize>) -> Result<Vec<String>, CoordinatorError> {
        let agent: AgentId = name.parse()?;
        let record = self.state.load_record(agent).await?;
        let logs = record.logs;
        Ok(match limit {
            Some(limit) => logs[logs.len().saturating_sub(limit)..].to_vec(),
            None => logs,
        })
    }

    pub async fn clear_agent_logs(&self, name: &str) -> Result<(), CoordinatorError> {
        let agent: AgentId = name.parse()?;
        if self.state.clear_logs(agent).await {
            Ok(())
        } else {
            Err(CoordinatorError::StoreUnavailable(format!(
                "could not clear logs for {agent}"
            )))
        }
    }

    fn snapshot(&self, record: AgentRecord) -> AgentStatus {
        let agent = record.agent;
        let tail = record.logs.len().saturating_sub(STATUS_LOG_TAIL);
        AgentStatus {
            agent,
            state: record.state,
            schedule: describe(self.state.policy().kind(agent)),
            implemented: self.scheduler.executors().contains(agent),
            last_activity: record.last_activity,
            last_run_time: record.last_run_time,
            next_run_time: record.next_run_time,
            last_result: record.last_result,
            last_error: record.last_error,
            run_count: record.run_count,
            failure_count: record.failure_count,
            recent_logs: record.logs[tail..].to_vec(),
        }
    }
}

fn describe(kind: ScheduleKind) -> String {
    match kind {
        ScheduleKind::Interval(every) => format!("every {}s", every.num_seconds()),
        ScheduleKind::AfterCompletion { predecessor, delay } => {
            format!("{}s after {}", delay.num_seconds(), predecessor)
        }
        ScheduleKind::Manual => "manual".to_string(),
    }
}
