//! 状态定义：智能体状态、协调文档字段、记录投影
//!
//! 所有智能体共享一个协调文档（`agent_states/all_states`），字段按 `<agent>_<field>` 命名。
//! 字段名只在存储边界拼接；核心内部通过 [`AgentField`] 做类型化访问。

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentId;
use crate::store::{format_timestamp, parse_timestamp, Document};

pub const STATE_COLLECTION: &str = "agent_states";
pub const STATE_DOCUMENT: &str = "all_states";

pub const AUTOMATED_MODE_FIELD: &str = "automated_mode";
pub const AUTOMATED_MODE_START_FIELD: &str = "automated_mode_start_time";
pub const AUTOMATED_MODE_END_FIELD: &str = "automated_mode_end_time";
pub const CREATED_AT_FIELD: &str = "created_at";

/// 智能体生命周期状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    #[serde(rename = "IDLE")]
    Idle,
    /// 恰有一次调用尚未结束
    #[serde(rename = "ACTIVE")]
    Active,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Idle => "IDLE",
            AgentState::Active => "ACTIVE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "IDLE" => Some(AgentState::Idle),
            "ACTIVE" => Some(AgentState::Active),
            _ => None,
        }
    }
}

/// 自动模式的持久化镜像
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutomatedMode {
    #[serde(rename = "OFF")]
    Off,
    #[serde(rename = "ON")]
    On,
}

impl AutomatedMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AutomatedMode::Off => "OFF",
            AutomatedMode::On => "ON",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "OFF" => Some(AutomatedMode::Off),
            "ON" => Some(AutomatedMode::On),
            _ => None,
        }
    }
}

/// 每个智能体在协调文档中的字段
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentField {
    State,
    LastActivity,
    LastResult,
    LastError,
    Logs,
    LastRunTime,
    NextRunTime,
    RunCount,
    FailureCount,
}

impl AgentField {
    /// 初始化 / 迁移时需要存在的字段
    pub const ALL: [AgentField; 9] = [
        AgentField::State,
        AgentField::LastActivity,
        AgentField::LastResult,
        AgentField::LastError,
        AgentField::Logs,
        AgentField::LastRunTime,
        AgentField::NextRunTime,
        AgentField::RunCount,
        AgentField::FailureCount,
    ];

    fn suffix(self) -> &'static str {
        match self {
            AgentField::State => "state",
            AgentField::LastActivity => "last_activity",
            AgentField::LastResult => "last_result",
            AgentField::LastError => "last_error",
            AgentField::Logs => "logs",
            AgentField::LastRunTime => "last_run_time",
            AgentField::NextRunTime => "next_run_time",
            AgentField::RunCount => "run_count",
            AgentField::FailureCount => "failure_count",
        }
    }

    /// 新文档中的初始值
    pub fn initial_value(self) -> Value {
        match self {
            AgentField::State => Value::String(AgentState::Idle.as_str().to_string()),
            AgentField::Logs => Value::Array(Vec::new()),
            AgentField::RunCount | AgentField::FailureCount => Value::from(0),
            _ => Value::Null,
        }
    }
}

impl AgentId {
    /// 协调文档中的字段名，如 `evaluation_agent_next_run_time`
    pub fn field(self, field: AgentField) -> String {
        format!("{}_{}", self.as_str(), field.suffix())
    }

    /// 附加元数据的扁平字段名
    pub fn metadata_field(self, key: &str) -> String {
        format!("{}_{}", self.as_str(), key)
    }
}

/// 最近一次失败的记录
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorRecord {
    pub message: String,
    pub timestamp: NaiveDateTime,
    pub details: Document,
}

impl ErrorRecord {
    pub fn new(message: impl Into<String>, timestamp: NaiveDateTime) -> Self {
        Self {
            message: message.into(),
            timestamp,
            details: Document::new(),
        }
    }

    pub fn with_details(mut self, details: Document) -> Self {
        self.details = details;
        self
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.details.clone();
        map.insert("message".into(), Value::String(self.message.clone()));
        map.insert("timestamp".into(), Value::String(format_timestamp(self.timestamp)));
        Value::Object(map)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let message = map.get("message")?.as_str()?.to_string();
        let timestamp = map.get("timestamp").and_then(parse_timestamp)?;
        let details = map
            .iter()
            .filter(|(k, _)| k.as_str() != "message" && k.as_str() != "timestamp")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Some(Self {
            message,
            timestamp,
            details,
        })
    }
}

impl Serialize for ErrorRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// 单个智能体的记录投影（从协调文档读出）
#[derive(Clone, Debug, Serialize)]
pub struct AgentRecord {
    pub agent: AgentId,
    pub state: Option<AgentState>,
    pub last_activity: Option<NaiveDateTime>,
    pub last_result: Option<Value>,
    pub last_error: Option<ErrorRecord>,
    pub last_run_time: Option<NaiveDateTime>,
    pub next_run_time: Option<NaiveDateTime>,
    pub run_count: i64,
    pub failure_count: i64,
    /// 从旧到新
    pub logs: Vec<String>,
}

impl AgentRecord {
    pub fn from_document(agent: AgentId, doc: &Document) -> Self {
        let get = |field: AgentField| doc.get(&agent.field(field)).filter(|v| !v.is_null());
        let timestamp = |field: AgentField| get(field).and_then(parse_timestamp);
        let count = |field: AgentField| get(field).and_then(Value::as_i64).unwrap_or(0);

        Self {
            agent,
            state: get(AgentField::State)
                .and_then(Value::as_str)
                .and_then(AgentState::parse),
            last_activity: timestamp(AgentField::LastActivity),
            last_result: get(AgentField::LastResult).cloned(),
            last_error: get(AgentField::LastError).and_then(ErrorRecord::from_value),
            last_run_time: timestamp(AgentField::LastRunTime),
            next_run_time: timestamp(AgentField::NextRunTime),
            run_count: count(AgentField::RunCount),
            failure_count: count(AgentField::FailureCount),
            logs: read_logs(get(AgentField::Logs)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == Some(AgentState::Active)
    }
}

fn read_logs(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// 时间戳字段值（None 写成 null）
pub(crate) fn timestamp_value(ts: Option<NaiveDateTime>) -> Value {
    ts.map(|t| Value::String(format_timestamp(t)))
        .unwrap_or(Value::Null)
}
