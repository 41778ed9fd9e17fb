//! 调度策略：根据智能体与上次运行时间计算下次到期时间
//!
//! 三种调度：固定间隔、依赖链（前驱完成后延迟 N 秒触发）、仅手动。
//! 本模块是纯函数，不读写存储；到期判断所需的持久化由状态机完成。

use chrono::{Duration, NaiveDateTime};

use crate::core::{AgentId, AgentRecord};

/// 单个智能体的调度方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleKind {
    /// 每隔固定时长运行一次
    Interval(Duration),
    /// 前驱完成后 delay 触发，没有独立间隔
    AfterCompletion { predecessor: AgentId, delay: Duration },
    /// 从不自动调度
    Manual,
}

/// is_due 的判断结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DueDecision {
    Due,
    NotDue,
    /// 运行过但丢失了 next_run_time：写回该时间，本 tick 不运行
    Reschedule(NaiveDateTime),
}

/// 调度表（声明顺序即优先级）
#[derive(Clone, Debug)]
pub struct SchedulePolicy {
    entries: Vec<(AgentId, ScheduleKind)>,
}

pub const DEFAULT_CHAIN_DELAY_SECS: i64 = 5;

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self::standard(Duration::seconds(DEFAULT_CHAIN_DELAY_SECS))
    }
}

impl SchedulePolicy {
    /// 默认调度表：评估 5 分钟、站点 1 小时、COA 2 小时；评估 → 通知 → 情景 依次链式触发；time 仅手动
    pub fn standard(chain_delay: Duration) -> Self {
        Self {
            entries: vec![
                (AgentId::Evaluation, ScheduleKind::Interval(Duration::minutes(5))),
                (AgentId::Site, ScheduleKind::Interval(Duration::hours(1))),
                (AgentId::Coa, ScheduleKind::Interval(Duration::hours(2))),
                (
                    AgentId::Notification,
                    ScheduleKind::AfterCompletion {
                        predecessor: AgentId::Evaluation,
                        delay: chain_delay,
                    },
                ),
                (
                    AgentId::Scenario,
                    ScheduleKind::AfterCompletion {
                        predecessor: AgentId::Notification,
                        delay: chain_delay,
                    },
                ),
                (AgentId::Time, ScheduleKind::Manual),
            ],
        }
    }

    /// 空调度表，配合 with_schedule 逐个声明
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// 声明或覆盖某个智能体的调度；新声明的排在最后
    pub fn with_schedule(mut self, agent: AgentId, kind: ScheduleKind) -> Self {
        match self.entries.iter_mut().find(|(id, _)| *id == agent) {
            Some(entry) => entry.1 = kind,
            None => self.entries.push((agent, kind)),
        }
        self
    }

    /// 覆盖固定间隔；只对已是固定间隔的智能体生效
    pub fn with_interval(mut self, agent: AgentId, interval: Duration) -> Self {
        if let Some((_, kind @ ScheduleKind::Interval(_))) =
            self.entries.iter_mut().find(|(id, _)| *id == agent)
        {
            *kind = ScheduleKind::Interval(interval);
        } else {
            tracing::warn!(agent = %agent, "Interval override ignored: agent has no fixed interval");
        }
        self
    }

    /// 未声明的智能体视为仅手动
    pub fn kind(&self, agent: AgentId) -> ScheduleKind {
        self.entries
            .iter()
            .find(|(id, _)| *id == agent)
            .map(|(_, kind)| *kind)
            .unwrap_or(ScheduleKind::Manual)
    }

    /// 下次运行时间：固定间隔返回 (last_run 或 now) + interval；依赖链与手动返回 None
    ///
    /// 相加越界时同样返回 None（记一条 warn），该智能体不再被自动调度。
    pub fn compute_next_run(
        &self,
        agent: AgentId,
        last_run: Option<NaiveDateTime>,
        now: NaiveDateTime,
    ) -> Option<NaiveDateTime> {
        match self.kind(agent) {
            ScheduleKind::Interval(interval) => {
                let base = last_run.unwrap_or(now);
                let next = base.checked_add_signed(interval);
                if next.is_none() {
                    tracing::warn!(
                        agent = %agent,
                        interval_secs = interval.num_seconds(),
                        "Next run time out of range; agent left unscheduled"
                    );
                }
                next
            }
            ScheduleKind::AfterCompletion { .. } | ScheduleKind::Manual => None,
        }
    }

    /// 以 agent 为前驱的依赖链后继及其延迟
    pub fn successors(&self, agent: AgentId) -> Vec<(AgentId, Duration)> {
        self.entries
            .iter()
            .filter_map(|(id, kind)| match kind {
                ScheduleKind::AfterCompletion { predecessor, delay } if *predecessor == agent => {
                    Some((*id, *delay))
                }
                _ => None,
            })
            .collect()
    }

    /// 调度循环需要轮询的智能体（固定间隔与依赖链），按声明顺序
    pub fn schedulable(&self) -> Vec<AgentId> {
        self.entries
            .iter()
            .filter(|(_, kind)| !matches!(kind, ScheduleKind::Manual))
            .map(|(id, _)| *id)
            .collect()
    }

    /// 到期判断（不含存储访问）
    ///
    /// 1. ACTIVE 时永不到期；
    /// 2. next_run_time 为空：从未运行过的固定间隔智能体立即到期；运行过的则补算并写回、本 tick 不跑；
    ///    依赖链智能体在等待前驱，不到期；
    /// 3. 否则 now >= next_run_time 即到期。
    pub fn due_decision(&self, record: &AgentRecord, now: NaiveDateTime) -> DueDecision {
        if record.is_active() {
            return DueDecision::NotDue;
        }
        match record.next_run_time {
            Some(next) if now >= next => DueDecision::Due,
            Some(_) => DueDecision::NotDue,
            None => match self.kind(record.agent) {
                ScheduleKind::Interval(_) if record.last_run_time.is_none() => DueDecision::Due,
                ScheduleKind::Interval(_) => self
                    .compute_next_run(record.agent, record.last_run_time, now)
                    .map(DueDecision::Reschedule)
                    .unwrap_or(DueDecision::NotDue),
                ScheduleKind::AfterCompletion { .. } | ScheduleKind::Manual => DueDecision::NotDue,
            },
        }
    }

    /// 校验调度表：间隔为正、延迟非负；依赖链的前驱必须已声明，且不能成环
    pub fn validate(&self) -> Result<(), String> {
        for (agent, kind) in &self.entries {
            match kind {
                ScheduleKind::Interval(interval) if *interval <= Duration::zero() => {
                    return Err(format!("{agent} interval must be positive"));
                }
                ScheduleKind::AfterCompletion { delay, .. } if *delay < Duration::zero() => {
                    return Err(format!("{agent} chain delay must not be negative"));
                }
                _ => {}
            }
            if let ScheduleKind::AfterCompletion { predecessor, .. } = kind {
                if !self.entries.iter().any(|(id, _)| id == predecessor) {
                    return Err(format!("{agent} depends on undeclared agent {predecessor}"));
                }
            }

            let mut current = *agent;
            for _ in 0..=self.entries.len() {
                match self.kind(current) {
                    ScheduleKind::AfterCompletion { predecessor, .. } => {
                        if predecessor == *agent {
                            return Err(format!("dependency cycle through {agent}"));
                        }
                        current = predecessor;
                    }
                    _ => break,
                }
            }
        }
        Ok(())
    }
}
