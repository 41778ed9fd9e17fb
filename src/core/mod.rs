//! 协调核心：智能体标识与状态、调度策略、状态机、调度循环、自动模式、门面与关闭

pub mod agent_id;
pub mod automated_mode;
pub mod builder;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod schedule;
pub mod scheduler;
pub mod shutdown;
pub mod state;
pub mod state_machine;

pub use agent_id::AgentId;
pub use automated_mode::{AutomatedModeController, AutomatedModeStatus};
pub use builder::CoordinatorBuilder;
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{AgentStatus, Coordinator};
pub use error::{CoordinatorError, ExecutorError};
pub use schedule::{DueDecision, ScheduleKind, SchedulePolicy};
pub use scheduler::{LoopExit, Scheduler};
pub use shutdown::{run_with_graceful_shutdown, ShutdownManager};
pub use state::{AgentField, AgentRecord, AgentState, AutomatedMode, ErrorRecord};
pub use state_machine::{AgentStateMachine, PersistedAutomatedMode};
