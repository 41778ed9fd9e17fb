//! 任务执行器：协调核心只关心「能被调用、可能失败、最终结束」
//!
//! 所有执行器实现 [`AgentExecutor`]，由 [`ExecutorRegistry`] 按 [`AgentId`] 注册与查找；
//! 调度器以固定指令调用执行器，并把结果写回状态机。

pub mod shell;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{AgentId, ExecutorError};

pub use shell::ShellExecutor;

/// 执行器 trait：接收文本指令，返回任意 JSON 结果
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, instruction: &str) -> Result<Value, ExecutorError>;
}

#[async_trait]
impl<T: AgentExecutor + ?Sized> AgentExecutor for Arc<T> {
    async fn execute(&self, instruction: &str) -> Result<Value, ExecutorError> {
        (**self).execute(instruction).await
    }
}

/// 把异步闭包包装成执行器（测试与嵌入方使用）
pub struct FnExecutor<F> {
    f: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ExecutorError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> AgentExecutor for FnExecutor<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ExecutorError>> + Send + 'static,
{
    async fn execute(&self, instruction: &str) -> Result<Value, ExecutorError> {
        (self.f)(instruction.to_string()).await
    }
}

/// 执行器注册表
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<AgentId, Arc<dyn AgentExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: AgentId, executor: impl AgentExecutor + 'static) {
        self.executors.insert(agent, Arc::new(executor));
    }

    pub fn get(&self, agent: AgentId) -> Option<Arc<dyn AgentExecutor>> {
        self.executors.get(&agent).cloned()
    }

    pub fn contains(&self, agent: AgentId) -> bool {
        self.executors.contains_key(&agent)
    }

    /// 已注册的智能体（声明顺序）
    pub fn agents(&self) -> Vec<AgentId> {
        AgentId::ALL
            .into_iter()
            .filter(|agent| self.executors.contains_key(agent))
            .collect()
    }
}

/// 每个智能体的固定指令（非用户输入）
pub fn instruction_for(agent: AgentId) -> &'static str {
    match agent {
        AgentId::Evaluation => {
            "Check for completed rotations that still need evaluations, generate the evaluations and queue them for review."
        }
        AgentId::Site => {
            "Review clinical site capacity and utilization, and flag sites with open issues or expiring agreements."
        }
        AgentId::Coa => {
            "Compare current student and program records against COA compliance requirements and report any gaps."
        }
        AgentId::Notification => {
            "Send notifications for evaluations generated since the last run and surface overdue items."
        }
        AgentId::Scenario => {
            "Generate new clinical training scenarios from the latest evaluation and notification results."
        }
        AgentId::Time => {
            "Summarize the time saved by automated work since the last report."
        }
    }
}

/// Null、空对象、空数组、空字符串都视为「没有结果」
pub fn is_empty_result(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_results() {
        assert!(is_empty_result(&Value::Null));
        assert!(is_empty_result(&json!({})));
        assert!(is_empty_result(&json!([])));
        assert!(is_empty_result(&json!("  ")));
        assert!(!is_empty_result(&json!(0)));
        assert!(!is_empty_result(&json!(false)));
        assert!(!is_empty_result(&json!({"n": 1})));
    }

    #[test]
    fn test_every_agent_has_instruction() {
        for agent in AgentId::ALL {
            assert!(!instruction_for(agent).is_empty());
        }
    }

    #[tokio::test]
    async fn test_fn_executor_receives_instruction() {
        let exec = FnExecutor::new(|instruction: String| async move {
            Ok::<Value, ExecutorError>(json!({ "echo": instruction }))
        });
        let out = exec.execute("hello").await.unwrap();
        assert_eq!(out, json!({"echo": "hello"}));
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut registry = ExecutorRegistry::new();
        registry.register(
            AgentId::Site,
            FnExecutor::new(|_: String| async { Ok::<Value, ExecutorError>(json!("ok")) }),
        );
        assert!(registry.contains(AgentId::Site));
        assert!(registry.get(AgentId::Coa).is_none());
        assert_eq!(registry.agents(), vec![AgentId::Site]);
        let out = registry.get(AgentId::Site).unwrap().execute("x").await.unwrap();
        assert_eq!(out, json!("ok"));
    }
}
