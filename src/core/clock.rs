//! 时钟：核心中所有时间戳都来自注入的 Clock
//!
//! 生产环境用 SystemClock；测试用 ManualClock 显式推进时间，保证调度判断可复现。

use std::sync::{Arc, Mutex};

use chrono::{Duration, NaiveDateTime, SubsecRound, Utc};

/// 存储中的时间戳只保留微秒，时钟输出先截到同一精度，写入后读回保持相等
pub fn to_store_precision(ts: NaiveDateTime) -> NaiveDateTime {
    ts.trunc_subsecs(6)
}

pub trait Clock: Send + Sync {
    /// 当前时间（naive UTC）
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        to_store_precision(Utc::now().naive_utc())
    }
}

/// 手动时钟：只有调用 advance / set 时才前进
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<NaiveDateTime>>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// 从当前系统时间开始
    pub fn starting_now() -> Self {
        Self::new(Utc::now().naive_utc())
    }

    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += delta;
    }

    pub fn set(&self, at: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        to_store_precision(*self.now.lock().unwrap_or_else(|e| e.into_inner()))
    }
}
