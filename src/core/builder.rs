//! 协调器构建器：统一的初始化逻辑
//!
//! 从 [`AppConfig`] 选择存储后端、套用调度覆盖、注册 shell 执行器；
//! 嵌入方与测试可以直接注入存储、时钟、执行器。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::config::{AppConfig, StoreBackend};
use crate::core::clock::{Clock, SystemClock};
use crate::core::schedule::SchedulePolicy;
use crate::core::scheduler::Scheduler;
use crate::core::{AgentId, AgentStateMachine, Coordinator};
use crate::executors::{AgentExecutor, ExecutorRegistry, ShellExecutor};
use crate::store::{DocumentStore, MemoryStore, SqliteStore};

/// 协调器构建器
pub struct CoordinatorBuilder {
    config: AppConfig,
    store: Option<Arc<dyn DocumentStore>>,
    clock: Arc<dyn Clock>,
    policy: Option<SchedulePolicy>,
    executors: ExecutorRegistry,
}

impl CoordinatorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: None,
            clock: Arc::new(SystemClock),
            policy: None,
            executors: ExecutorRegistry::new(),
        }
    }

    /// 注入存储（覆盖配置中的后端）
    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 注入完整调度表（覆盖配置中的间隔与依赖链延迟）
    pub fn with_policy(mut self, policy: SchedulePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// 注册执行器；优先于配置中的 shell 命令
    pub fn with_executor(mut self, agent: AgentId, executor: impl AgentExecutor + 'static) -> Self {
        self.executors.register(agent, executor);
        self
    }

    /// 按配置打开存储
    pub fn build_store(&self) -> anyhow::Result<Arc<dyn DocumentStore>> {
        if let Some(store) = &self.store {
            return Ok(store.clone());
        }
        let store: Arc<dyn DocumentStore> = match self.config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Sqlite => Arc::new(
                SqliteStore::open(&self.config.store.path).with_context(|| {
                    format!("Failed to open store at {}", self.config.store.path.display())
                })?,
            ),
        };
        Ok(store)
    }

    /// 默认调度表 + [schedules] 覆盖
    pub fn build_policy(&self) -> anyhow::Result<SchedulePolicy> {
        if let Some(policy) = &self.policy {
            policy.validate().map_err(anyhow::Error::msg)?;
            return Ok(policy.clone());
        }

        let chain_delay = config_seconds(
            self.config.scheduler.chain_delay_secs,
            "scheduler.chain_delay_secs",
        )?;
        let mut policy = SchedulePolicy::standard(chain_delay);
        for (name, secs) in &self.config.schedules {
            let agent: AgentId = name
                .parse()
                .with_context(|| format!("Invalid [schedules] entry '{name}'"))?;
            policy = policy.with_interval(agent, config_seconds(*secs, &format!("schedules.{name}"))?);
        }
        policy.validate().map_err(anyhow::Error::msg)?;
        Ok(policy)
    }

    /// 注入的执行器 + [executors.<agent>] 中的 shell 命令
    pub fn build_executors(&self) -> anyhow::Result<ExecutorRegistry> {
        let mut registry = self.executors.clone();
        for (name, section) in &self.config.executors {
            let agent: AgentId = name
                .parse()
                .with_context(|| format!("Invalid [executors] entry '{name}'"))?;
            if registry.contains(agent) {
                continue;
            }
            let mut shell = ShellExecutor::new(agent, section.command.clone());
            if let Some(secs) = section.timeout_secs {
                shell = shell.with_timeout(secs);
            }
            registry.register(agent, shell);
        }
        Ok(registry)
    }

    pub fn build(self) -> anyhow::Result<Coordinator> {
        let store = self.build_store()?;
        let policy = self.build_policy()?;
        let executors = self.build_executors()?;
        let cfg = &self.config.scheduler;

        let state = Arc::new(
            AgentStateMachine::new(store.clone(), policy, self.clock.clone())
                .with_max_log_entries(cfg.max_log_entries)
                .with_store_timeout(self.config.store.timeout()),
        );
        let scheduler = Arc::new(
            Scheduler::new(state.clone(), executors)
                .with_tick_interval(Duration::from_secs(cfg.tick_secs.max(1)))
                .with_invocation_timeout(cfg.invocation_timeout_secs.map(Duration::from_secs)),
        );

        tracing::info!(
            store = store.name(),
            tick_secs = cfg.tick_secs,
            executors = ?scheduler.executors().agents(),
            "Coordinator built"
        );
        Ok(Coordinator::new(state, scheduler))
    }
}

/// 配置中的秒数转换为 chrono 时长；超出表示范围时报错
fn config_seconds(secs: u64, key: &str) -> anyhow::Result<chrono::Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .with_context(|| format!("{key} = {secs} is out of range"))
}
