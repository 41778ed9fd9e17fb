//! edu-coordinator - 教学自动化智能体的调度与状态协调核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 智能体状态机、调度策略、调度循环、自动模式控制器、协调器门面
//! - **executors**: 执行器 trait、注册表与 shell 执行器
//! - **observability**: tracing 日志初始化
//! - **store**: 文档存储抽象与内存 / SQLite 实现

pub mod config;
pub mod core;
pub mod executors;
pub mod observability;
pub mod store;

pub use crate::core::{AgentId, Coordinator, CoordinatorBuilder, CoordinatorError};
