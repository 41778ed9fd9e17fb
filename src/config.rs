//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `EDU__*` 覆盖（双下划线表示嵌套，如 `EDU__STORE__BACKEND=sqlite`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreSection,
    pub scheduler: SchedulerSection,
    /// [schedules] 段：固定间隔智能体的间隔覆盖（秒），键为智能体名
    pub schedules: HashMap<String, u64>,
    /// [executors.<agent>] 段
    pub executors: HashMap<String, ExecutorSection>,
    pub automated: AutomatedSection,
}

/// 存储后端
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

/// [store] 段：后端、SQLite 路径、单次调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl StoreSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/agent_states.db")
}

fn default_store_timeout_ms() -> u64 {
    3000
}

/// [scheduler] 段：tick 间隔、日志上限、依赖链延迟、调用截止时间
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
    #[serde(default = "default_chain_delay_secs")]
    pub chain_delay_secs: u64,
    /// 未设置时不限制单次调用时长
    pub invocation_timeout_secs: Option<u64>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            max_log_entries: default_max_log_entries(),
            chain_delay_secs: default_chain_delay_secs(),
            invocation_timeout_secs: None,
        }
    }
}

fn default_tick_secs() -> u64 {
    5
}

fn default_max_log_entries() -> usize {
    200
}

fn default_chain_delay_secs() -> u64 {
    5
}

/// [executors.<agent>] 段：为智能体运行的 shell 命令
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    pub command: String,
    /// 命令超时（秒）
    pub timeout_secs: Option<u64>,
}

/// [automated] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AutomatedSection {
    /// 进程启动后立即开启自动模式
    #[serde(default)]
    pub start_on_boot: bool,
    /// 会话时长（秒）；未设置表示一直运行到手动停止
    pub duration_secs: Option<u64>,
}

/// 从 config 目录加载配置，环境变量 EDU__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 EDU__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("EDU")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 加载失败时回退到默认配置
pub fn load_config_or_default(config_path: Option<PathBuf>) -> AppConfig {
    load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    })
}
