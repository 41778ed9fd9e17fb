//! Shell 执行器：为某个智能体运行配置好的外部命令
//!
//! 指令通过环境变量 `AGENT_INSTRUCTION` 传入，智能体名通过 `AGENT_NAME` 传入；
//! 执行通过 sh -c / cmd /C，带超时。stdout 能解析成 JSON 就原样返回，否则包成 `{"output": ...}`。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::core::{AgentId, ExecutorError};
use crate::executors::AgentExecutor;

pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;

pub struct ShellExecutor {
    agent: AgentId,
    command: String,
    timeout_secs: u64,
}

impl ShellExecutor {
    pub fn new(agent: AgentId, command: impl Into<String>) -> Self {
        Self {
            agent,
            command: command.into(),
            timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

#[async_trait]
impl AgentExecutor for ShellExecutor {
    async fn execute(&self, instruction: &str) -> Result<Value, ExecutorError> {
        let command = self.command.trim();
        if command.is_empty() {
            return Err(ExecutorError::Failed("Empty command".to_string()));
        }

        tracing::info!(agent = %self.agent, command = %command, "shell executor run");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.env("AGENT_INSTRUCTION", instruction)
            .env("AGENT_NAME", self.agent.as_str())
            .kill_on_drop(true);

        let limit = Duration::from_secs(self.timeout_secs);
        let output = tokio::time::timeout(limit, cmd.output())
            .await
            .map_err(|_| ExecutorError::Timeout(limit))?
        .map_err(|e| ExecutorError::Failed(format!("Execution failed: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(ExecutorError::Failed(format!(
                "Exit {:?}\nstderr: {}",
                output.status.code(),
                stderr
            )));
        }

        Ok(parse_output(&stdout))
    }
}

fn parse_output(stdout: &str) -> Value {
    if stdout.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(stdout).unwrap_or_else(|_| serde_json::json!({ "output": stdout }))
}
