//! 调度循环：每个 tick 依优先级询问「是否到期」，到期即调用执行器并把结果写回状态机
//!
//! 同一 tick 内按声明顺序串行调用；依赖链后继不会在前驱的同一 tick 内运行，
//! 前驱完成只写入后继的 next_run_time，后继在之后的 tick 中被拾起。
//! 停止在 tick_interval 内生效：循环只在 tick 间隙观察取消信号。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentId, AgentState, AgentStateMachine, CoordinatorError, ExecutorError};
use crate::executors::{instruction_for, is_empty_result, ExecutorRegistry};
use crate::store::Document;

pub const DEFAULT_TICK_SECS: u64 = 5;

/// 循环退出原因
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopExit {
    /// 会话被停止（取消信号）
    Cancelled,
    /// 有界会话到期
    Expired,
}

pub struct Scheduler {
    state: Arc<AgentStateMachine>,
    executors: ExecutorRegistry,
    tick_interval: Duration,
    /// 单次调用的截止时间；None 表示不设上限
    invocation_timeout: Option<Duration>,
}

impl Scheduler {
    pub fn new(state: Arc<AgentStateMachine>, executors: ExecutorRegistry) -> Self {
        Self {
            state,
            executors,
            tick_interval: Duration::from_secs(DEFAULT_TICK_SECS),
            invocation_timeout: None,
        }
    }

    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }

    pub fn with_invocation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    pub fn state(&self) -> &Arc<AgentStateMachine> {
        &self.state
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    /// 单个 tick：对每个可调度智能体判断到期并调用。返回本 tick 调用的智能体
    pub async fn tick(&self) -> Vec<AgentId> {
        let mut invoked = Vec::new();
        for agent in self.state.policy().schedulable() {
            if !self.state.is_due(agent).await {
                continue;
            }
            invoked.push(agent);
            if let Err(e) = self.invoke(agent).await {
                tracing::warn!(agent = %agent, error = %e, "Scheduled invocation failed");
            }
        }
        invoked
    }

    /// 调用一个智能体：置 ACTIVE、运行执行器、记录结果或错误
    pub async fn invoke(&self, agent: AgentId) -> Result<Value, CoordinatorError> {
        let mut meta = Document::new();
        meta.insert("trigger".into(), Value::from("run"));
        if !self.state.set_state(agent, AgentState::Active, Some(meta)).await {
            return Err(CoordinatorError::StoreUnavailable(format!(
                "could not mark {agent} active"
            )));
        }
        self.state.append_log(agent, "Run started").await;

        let Some(executor) = self.executors.get(agent) else {
            tracing::warn!(agent = %agent, "No executor registered");
            self.state.set_error(agent, "not implemented", None).await;
            self.state.append_log(agent, "Run failed: not implemented").await;
            return Err(CoordinatorError::NotImplemented(agent));
        };

        let started = Instant::now();
        let instruction = instruction_for(agent);
        let mut handle = tokio::spawn(async move { executor.execute(instruction).await });

        let joined = match self.invocation_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    Ok(Err(ExecutorError::Timeout(limit)))
                }
            },
            None => handle.await,
        };

        let outcome = match joined {
            Ok(Ok(value)) if is_empty_result(&value) => Err(ExecutorError::EmptyResult),
            Ok(result) => result,
            Err(join_error) => Err(join_failure(join_error)),
        };

        audit(agent, &outcome, started.elapsed());

        match outcome {
            Ok(value) => {
                self.state.set_result(agent, value.clone()).await;
                self.state.append_log(agent, "Run completed").await;
                Ok(value)
            }
            Err(e) => {
                let reason = e.to_string();
                let mut details = Document::new();
                details.insert("kind".into(), Value::from(error_kind(&e)));
                self.state.set_error(agent, &reason, Some(details)).await;
                self.state
                    .append_log(agent, &format!("Run failed: {reason}"))
                    .await;
                Err(CoordinatorError::ExecutorFailure { agent, reason })
            }
        }
    }

    /// 循环直到取消或会话到期
    pub async fn run_loop(&self, token: CancellationToken, duration: Option<Duration>) -> LoopExit {
        let started = Instant::now();
        tracing::info!(
            tick_secs = self.tick_interval.as_secs_f64(),
            bounded = duration.is_some(),
            "Scheduler loop started"
        );

        let exit = loop {
            if token.is_cancelled() {
                break LoopExit::Cancelled;
            }
            if let Some(limit) = duration {
                if started.elapsed() >= limit {
                    break LoopExit::Expired;
                }
            }

            let invoked = self.tick().await;
            if !invoked.is_empty() {
                tracing::debug!(agents = ?invoked, "Tick finished");
            }

            tokio::select! {
                _ = token.cancelled() => break LoopExit::Cancelled,
                _ = tokio::time::sleep(self.tick_interval) => {}
            }
        };

        tracing::info!(exit = ?exit, "Scheduler loop stopped");
        exit
    }
}

fn join_failure(e: JoinError) -> ExecutorError {
    if e.is_panic() {
        let payload = e.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        ExecutorError::Panicked(message)
    } else {
        ExecutorError::Failed("invocation cancelled".to_string())
    }
}

fn error_kind(e: &ExecutorError) -> &'static str {
    match e {
        ExecutorError::Failed(_) => "error",
        ExecutorError::EmptyResult => "empty",
        ExecutorError::Timeout(_) => "timeout",
        ExecutorError::Panicked(_) => "panic",
    }
}

/// 每次调用输出一行 JSON 审计日志
fn audit(agent: AgentId, outcome: &Result<Value, ExecutorError>, elapsed: Duration) {
    let (ok, kind) = match outcome {
        Ok(_) => (true, "ok"),
        Err(e) => (false, error_kind(e)),
    };
    let audit = serde_json::json!({
        "event": "agent_audit",
        "agent": agent.as_str(),
        "ok": ok,
        "outcome": kind,
        "duration_ms": elapsed.as_millis() as u64,
    });
    tracing::info!(audit = %audit.to_string(), "agent");
}
