//! 已知智能体标识：集合在编译期固定

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::CoordinatorError;

/// 协调器管理的智能体
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgentId {
    /// 评估生成
    #[serde(rename = "evaluation_agent")]
    Evaluation,
    /// 站点 / 实习点监控
    #[serde(rename = "site_agent")]
    Site,
    /// 合规（COA）跟踪
    #[serde(rename = "coa_agent")]
    Coa,
    /// 通知监控
    #[serde(rename = "notification_agent")]
    Notification,
    /// 情景生成
    #[serde(rename = "scenario_agent")]
    Scenario,
    /// 节省时间统计
    #[serde(rename = "time_agent")]
    Time,
}

impl AgentId {
    /// 声明顺序即调度优先级
    pub const ALL: [AgentId; 6] = [
        AgentId::Evaluation,
        AgentId::Site,
        AgentId::Coa,
        AgentId::Notification,
        AgentId::Scenario,
        AgentId::Time,
    ];

    /// 协调文档中的字段前缀
    pub fn as_str(self) -> &'static str {
        match self {
            AgentId::Evaluation => "evaluation_agent",
            AgentId::Site => "site_agent",
            AgentId::Coa => "coa_agent",
            AgentId::Notification => "notification_agent",
            AgentId::Scenario => "scenario_agent",
            AgentId::Time => "time_agent",
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentId {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        AgentId::ALL
            .into_iter()
            .find(|id| id.as_str() == wanted)
            .ok_or_else(|| CoordinatorError::UnknownAgent(wanted.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_names() {
        for id in AgentId::ALL {
            assert_eq!(id.as_str().parse::<AgentId>().unwrap(), id);
        }
    }

    #[test]
    fn test_parse_unknown_name() {
        let err = "grading_agent".parse::<AgentId>().unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownAgent(name) if name == "grading_agent"));
    }

    #[test]
    fn test_serde_uses_document_prefix() {
        let json = serde_json::to_string(&AgentId::Coa).unwrap();
        assert_eq!(json, "\"coa_agent\"");
    }
}
