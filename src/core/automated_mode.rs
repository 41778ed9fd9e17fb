//! 自动模式控制器：启动 / 停止调度循环会话，维护内存中的 active 标志与存储镜像
//!
//! 内存标志是唯一准绳，存储中的 `automated_mode` 只是尽力而为的镜像；
//! 控制器是进程内的，多进程部署时每个进程各有一个实例，只能靠镜像互相感知。
//!
//! 会话锁只保护 active 标志与任务句柄，从不跨存储调用持有，也从不等待镜像锁。
//! 每次切换在会话锁内领取一个递增序号；镜像写入按序号排序，过期的切换直接跳过，
//! 保证存储中留下的是最后一次切换。status 只读原子标志与存储镜像，从不等锁。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::scheduler::{LoopExit, Scheduler};
use crate::core::state::AutomatedMode;
use crate::core::AgentStateMachine;

/// 自动模式状态查询结果
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AutomatedModeStatus {
    /// 内存标志
    pub active: bool,
    /// 存储镜像；读取失败时为 None
    pub persisted_mode: Option<AutomatedMode>,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub session_id: Option<String>,
}

struct Session {
    id: Uuid,
    token: CancellationToken,
    loop_handle: Option<JoinHandle<()>>,
    expiry: Option<JoinHandle<()>>,
}

struct ControllerInner {
    state: Arc<AgentStateMachine>,
    scheduler: Arc<Scheduler>,
    active: AtomicBool,
    session: Mutex<Option<Session>>,
    /// 会话切换序号，只在会话锁内递增
    transitions: AtomicU64,
    /// 最后一次落盘的切换序号
    mirror: Mutex<u64>,
}

/// 自动模式控制器（Clone 共享同一份内部状态）
#[derive(Clone)]
pub struct AutomatedModeController {
    inner: Arc<ControllerInner>,
}

impl AutomatedModeController {
    pub fn new(state: Arc<AgentStateMachine>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                state,
                scheduler,
                active: AtomicBool::new(false),
                session: Mutex::new(None),
                transitions: AtomicU64::new(0),
                mirror: Mutex::new(0),
            }),
        }
    }

    /// 内存中的 active 标志
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// 启动会话；已在运行时返回 false 且不做任何修改
    pub async fn start(&self, duration: Option<Duration>) -> bool {
        let mut guard = self.inner.session.lock().await;
        if guard.is_some() {
            tracing::info!("Automated mode already active; start rejected");
            return false;
        }

        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        self.inner.active.store(true, Ordering::SeqCst);

        let expiry = duration.map(|d| {
            let controller = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(d).await;
                tracing::info!(session = %id, "Automated mode duration elapsed");
                controller.finish(Some(id), false).await;
            })
        });

        let loop_handle = {
            let controller = self.clone();
            let scheduler = self.inner.scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move {
                if scheduler.run_loop(token, duration).await == LoopExit::Expired {
                    controller.finish(Some(id), true).await;
                }
            })
        };

        *guard = Some(Session {
            id,
            token,
            loop_handle: Some(loop_handle),
            expiry,
        });

        let seq = self.next_transition();
        drop(guard);

        let start = self.inner.state.now();
        let end = duration
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .and_then(|d| start.checked_add_signed(d));
        if let Some(mut last) = self.claim_mirror(seq).await {
            self.inner.state.persist_automated_start(start, end).await;
            *last = seq;
        }

        tracing::info!(
            session = %id,
            duration_secs = duration.map(|d| d.as_secs()),
            "Automated mode started"
        );
        true
    }

    /// 停止会话；未运行时返回 false。循环在 tick_interval 内观察到停止
    pub async fn stop(&self) -> bool {
        self.finish(None, true).await.is_some()
    }

    /// 停止并等待循环退出（关闭流程用）
    pub async fn stop_and_join(&self) -> bool {
        let Some(mut session) = self.finish(None, true).await else {
            return false;
        };
        if let Some(handle) = session.loop_handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Scheduler loop ended abnormally");
            }
        }
        true
    }

    /// 结束当前会话。expected 给出时只结束该会话，避免过期计时器误伤新会话
    async fn finish(&self, expected: Option<Uuid>, abort_timer: bool) -> Option<Session> {
        let mut guard = self.inner.session.lock().await;
        match guard.as_ref() {
            Some(session) if expected.map_or(true, |id| id == session.id) => {}
            _ => return None,
        }
        let mut session = guard.take()?;

        self.inner.active.store(false, Ordering::SeqCst);
        session.token.cancel();
        if abort_timer {
            if let Some(timer) = session.expiry.take() {
                timer.abort();
            }
        }

        let seq = self.next_transition();
        drop(guard);

        if let Some(mut last) = self.claim_mirror(seq).await {
            let end = self.inner.state.now();
            self.inner.state.persist_automated_stop(end).await;
            *last = seq;
        }

        tracing::info!(session = %session.id, "Automated mode stopped");
        Some(session)
    }

    /// 调用方必须持有会话锁
    fn next_transition(&self) -> u64 {
        self.inner.transitions.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 取得镜像写入权；已有更新的切换落盘时返回 None
    async fn claim_mirror(&self, seq: u64) -> Option<tokio::sync::MutexGuard<'_, u64>> {
        let last = self.inner.mirror.lock().await;
        if *last > seq {
            tracing::debug!(seq, latest = *last, "Skipping stale automated mode mirror write");
            return None;
        }
        Some(last)
    }

    /// 状态查询：active 取自内存；存储镜像读不到时只返回内存标志
    pub async fn status(&self) -> AutomatedModeStatus {
        let active = self.is_active();
        let session_id = match self.inner.session.try_lock() {
            Ok(guard) => guard.as_ref().map(|s| s.id.to_string()),
            Err(_) => None,
        };
        let mirror = self.inner.state.read_automated_mode().await;

        AutomatedModeStatus {
            active,
            persisted_mode: mirror.as_ref().and_then(|m| m.mode),
            start_time: mirror.as_ref().and_then(|m| m.start_time),
            end_time: mirror.as_ref().and_then(|m| m.end_time),
            session_id,
        }
    }
}
