//! 智能体状态机：协调文档的唯一写入者
//!
//! 负责每个智能体的 IDLE/ACTIVE 状态、最近结果 / 错误、运行时间与有界日志，以及自动模式的持久化镜像。
//! 所有公开方法遵循降级约定：存储不可用或超时时记录 warn 日志并返回安全默认值（false / None / 空），
//! 从不把存储错误抛给调用方，调度循环因此可以在存储抖动时继续运转。
//!
//! 同一智能体记录的并发写（例如手动触发与调度循环竞争）只按存储端写入顺序排序；
//! ACTIVE 守卫是先读后写的乐观检查，不是分布式锁。

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::NaiveDateTime;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::schedule::{DueDecision, SchedulePolicy};
use crate::core::state::{
    timestamp_value, AgentField, AgentRecord, AgentState, AutomatedMode, ErrorRecord,
    AUTOMATED_MODE_END_FIELD, AUTOMATED_MODE_FIELD, AUTOMATED_MODE_START_FIELD, CREATED_AT_FIELD,
    STATE_COLLECTION, STATE_DOCUMENT,
};
use crate::core::AgentId;
use crate::store::{format_timestamp, parse_timestamp, Document, DocumentStore, StoreError};

pub const DEFAULT_MAX_LOG_ENTRIES: usize = 200;
pub const DEFAULT_STORE_TIMEOUT: StdDuration = StdDuration::from_secs(3);

/// 自动模式在存储中的镜像（仅供参考，内存标志才是准绳）
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct PersistedAutomatedMode {
    pub mode: Option<AutomatedMode>,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
}

/// 一次运行的结束方式
enum Completion {
    Success { result: Value, state: AgentState },
    Failure(ErrorRecord),
}

pub struct AgentStateMachine {
    store: Arc<dyn DocumentStore>,
    policy: SchedulePolicy,
    clock: Arc<dyn Clock>,
    max_log_entries: usize,
    store_timeout: StdDuration,
    initialized: AtomicBool,
    /// 串行化首次初始化，避免并发的整体写入互相覆盖
    init_lock: Mutex<()>,
}

impl AgentStateMachine {
    pub fn new(store: Arc<dyn DocumentStore>, policy: SchedulePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
            max_log_entries: DEFAULT_MAX_LOG_ENTRIES,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
        }
    }

    /// 每个智能体保留的日志条数
    pub fn with_max_log_entries(mut self, max: usize) -> Self {
        self.max_log_entries = max.max(1);
        self
    }

    /// 单次存储调用的超时
    pub fn with_store_timeout(mut self, timeout: StdDuration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.policy
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    // ---- 存储访问 ----

    /// 给存储调用加超时，超时映射为 StoreError::Timeout
    async fn guarded<T>(&self, fut: impl Future<Output = Result<T, StoreError>>) -> Result<T, StoreError> {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout.as_millis() as u64)),
        }
    }

    /// 初始化协调文档；已存在时只补齐缺失字段。返回是否成功
    pub async fn initialize(&self) -> bool {
        match self.try_initialize().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to initialize coordination document");
                false
            }
        }
    }

    async fn try_initialize(&self) -> Result<(), StoreError> {
        let _init = self.init_lock.lock().await;
        self.initialize_document().await
    }

    async fn initialize_document(&self) -> Result<(), StoreError> {
        let existing = self
            .guarded(self.store.get_document(STATE_COLLECTION, STATE_DOCUMENT))
            .await?;

        match existing {
            None => {
                let doc = initial_document(self.clock.now());
                self.guarded(
                    self.store
                        .set_document(STATE_COLLECTION, STATE_DOCUMENT, doc, false),
                )
                .await?;
                info!(store = self.store.name(), "Created coordination document");
            }
            Some(doc) => {
                let missing = missing_fields(&doc, self.clock.now());
                if !missing.is_empty() {
                    let count = missing.len();
                    self.guarded(
                        self.store
                            .set_document(STATE_COLLECTION, STATE_DOCUMENT, missing, true),
                    )
                    .await?;
                    info!(fields = count, "Back-filled missing coordination fields");
                }
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ensure_initialized(&self) -> Result<(), StoreError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _init = self.init_lock.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.initialize_document().await
    }

    async fn read_document(&self) -> Result<Document, StoreError> {
        self.ensure_initialized().await?;
        let doc = self
            .guarded(self.store.get_document(STATE_COLLECTION, STATE_DOCUMENT))
            .await?;
        Ok(doc.unwrap_or_default())
    }

    /// 部分字段写入；文档被外部删除时重新初始化后重试一次
    async fn write_fields(&self, fields: Document) -> Result<(), StoreError> {
        self.ensure_initialized().await?;
        let first = self
            .guarded(
                self.store
                    .update_fields(STATE_COLLECTION, STATE_DOCUMENT, fields.clone()),
            )
            .await;
        match first {
            Err(StoreError::NotFound { .. }) => {
                self.initialized.store(false, Ordering::SeqCst);
                self.try_initialize().await?;
                self.guarded(
                    self.store
                        .update_fields(STATE_COLLECTION, STATE_DOCUMENT, fields),
                )
                .await
            }
            other => other,
        }
    }

    /// 读取单个智能体的记录（不降级，错误交给调用方）
    pub async fn load_record(&self, agent: AgentId) -> Result<AgentRecord, StoreError> {
        let doc = self.read_document().await?;
        Ok(AgentRecord::from_document(agent, &doc))
    }

    // ---- 状态 ----

    /// 写入 state 与 last_activity；metadata 以 `<agent>_<key>` 扁平写入
    pub async fn set_state(&self, agent: AgentId, state: AgentState, metadata: Option<Document>) -> bool {
        let mut fields = Document::new();
        if let Some(metadata) = metadata {
            for (key, value) in metadata {
                fields.insert(agent.metadata_field(&key), value);
            }
        }
        fields.insert(agent.field(AgentField::State), Value::from(state.as_str()));
        fields.insert(
            agent.field(AgentField::LastActivity),
            timestamp_value(Some(self.clock.now())),
        );

        match self.write_fields(fields).await {
            Ok(()) => {
                debug!(agent = %agent, state = state.as_str(), "State updated");
                true
            }
            Err(e) => {
                warn!(agent = %agent, error = %e, "Failed to set state");
                false
            }
        }
    }

    pub async fn get_state(&self, agent: AgentId) -> Option<AgentState> {
        self.get_record(agent).await.and_then(|r| r.state)
    }

    /// 所有智能体的状态；存储不可用或超时时返回空映射
    pub async fn get_all_states(&self) -> BTreeMap<AgentId, AgentState> {
        match self.read_document().await {
            Ok(doc) => AgentId::ALL
                .into_iter()
                .filter_map(|agent| {
                    AgentRecord::from_document(agent, &doc)
                        .state
                        .map(|state| (agent, state))
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to read agent states");
                BTreeMap::new()
            }
        }
    }

    /// 整条记录；读取失败时返回 None
    pub async fn get_record(&self, agent: AgentId) -> Option<AgentRecord> {
        match self.load_record(agent).await {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(agent = %agent, error = %e, "Failed to read agent record");
                None
            }
        }
    }

    /// 所有智能体的记录（声明顺序）；读取失败时返回空
    pub async fn get_all_records(&self) -> Vec<AgentRecord> {
        match self.read_document().await {
            Ok(doc) => AgentId::ALL
                .into_iter()
                .map(|agent| AgentRecord::from_document(agent, &doc))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to read agent records");
                Vec::new()
            }
        }
    }

    // ---- 结果与错误 ----

    /// 记录成功结果并置为 IDLE
    pub async fn set_result(&self, agent: AgentId, result: Value) -> bool {
        self.set_result_with_state(agent, result, AgentState::Idle).await
    }

    /// 记录成功结果：写 last_result、last_run_time=now、按策略计算 next_run_time，并触发依赖链
    pub async fn set_result_with_state(&self, agent: AgentId, result: Value, state: AgentState) -> bool {
        self.complete(agent, Completion::Success { result, state }).await
    }

    /// 记录失败：与 set_result 相同的簿记，但强制 IDLE；失败同样推进调度并触发依赖链
    pub async fn set_error(&self, agent: AgentId, message: &str, details: Option<Document>) -> bool {
        let record = ErrorRecord::new(message, self.clock.now()).with_details(details.unwrap_or_default());
        self.complete(agent, Completion::Failure(record)).await
    }

    async fn complete(&self, agent: AgentId, completion: Completion) -> bool {
        let now = self.clock.now();
        let next = self.policy.compute_next_run(agent, Some(now), now);
        let failed = matches!(completion, Completion::Failure(_));

        let mut fields = Document::new();
        match completion {
            Completion::Success { result, state } => {
                fields.insert(agent.field(AgentField::State), Value::from(state.as_str()));
                fields.insert(agent.field(AgentField::LastResult), result);
            }
            Completion::Failure(record) => {
                fields.insert(
                    agent.field(AgentField::State),
                    Value::from(AgentState::Idle.as_str()),
                );
                fields.insert(agent.field(AgentField::LastError), record.to_value());
            }
        }
        fields.insert(agent.field(AgentField::LastActivity), timestamp_value(Some(now)));
        fields.insert(agent.field(AgentField::LastRunTime), timestamp_value(Some(now)));
        fields.insert(agent.field(AgentField::NextRunTime), timestamp_value(next));

        if let Err(e) = self.write_fields(fields).await {
            warn!(agent = %agent, error = %e, "Failed to record completion");
            return false;
        }

        self.bump_counter(agent, AgentField::RunCount).await;
        if failed {
            self.bump_counter(agent, AgentField::FailureCount).await;
        }

        self.schedule_successors(agent, now).await;
        true
    }

    async fn bump_counter(&self, agent: AgentId, field: AgentField) {
        let key = agent.field(field);
        let result = self
            .guarded(
                self.store
                    .atomic_increment(STATE_COLLECTION, STATE_DOCUMENT, &key, 1),
            )
            .await;
        if let Err(e) = result {
            warn!(agent = %agent, field = %key, error = %e, "Failed to increment counter");
        }
    }

    /// 依赖链：前驱完成后，给后继写入 next_run_time = now + delay 并留一条日志
    async fn schedule_successors(&self, agent: AgentId, now: NaiveDateTime) {
        for (successor, delay) in self.policy.successors(agent) {
            let Some(due) = now.checked_add_signed(delay) else {
                warn!(agent = %successor, predecessor = %agent, "Chained run time out of range; not scheduled");
                continue;
            };
            let mut fields = Document::new();
            fields.insert(successor.field(AgentField::NextRunTime), timestamp_value(Some(due)));

            match self.write_fields(fields).await {
                Ok(()) => {
                    info!(agent = %successor, predecessor = %agent, due = %due, "Chained run scheduled");
                    self.append_log(
                        successor,
                        &format!(
                            "Scheduled to run at {} after {} completed",
                            format_timestamp(due),
                            agent
                        ),
                    )
                    .await;
                }
                Err(e) => {
                    warn!(agent = %successor, predecessor = %agent, error = %e, "Failed to schedule chained run");
                }
            }
        }
    }

    pub async fn get_result(&self, agent: AgentId) -> Option<Value> {
        self.get_record(agent).await.and_then(|r| r.last_result)
    }

    pub async fn get_error(&self, agent: AgentId) -> Option<ErrorRecord> {
        self.get_record(agent).await.and_then(|r| r.last_error)
    }

    // ---- 日志 ----

    /// 追加带时间戳的日志，保留最近 max_log_entries 条
    pub async fn append_log(&self, agent: AgentId, message: &str) -> bool {
        self.append_log_capped(agent, message, self.max_log_entries).await
    }

    /// 追加日志并截断到最近 max_entries 条（最旧的先丢弃）
    pub async fn append_log_capped(&self, agent: AgentId, message: &str, max_entries: usize) -> bool {
        let entry = format!("[{}] {}", format_timestamp(self.clock.now()), message);
        let key = agent.field(AgentField::Logs);

        let result = async {
            self.ensure_initialized().await?;
            self.guarded(self.store.append_to_list(
                STATE_COLLECTION,
                STATE_DOCUMENT,
                &key,
                Value::String(entry),
                max_entries.max(1),
            ))
            .await
        }
        .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(agent = %agent, error = %e, "Failed to append log");
                false
            }
        }
    }

    /// 日志从旧到新；limit 只取最近的 limit 条
    pub async fn get_logs(&self, agent: AgentId, limit: Option<usize>) -> Vec<String> {
        let logs = self
            .get_record(agent)
            .await
            .map(|r| r.logs)
            .unwrap_or_default();
        match limit {
            Some(limit) => logs[logs.len().saturating_sub(limit)..].to_vec(),
            None => logs,
        }
    }

    pub async fn clear_logs(&self, agent: AgentId) -> bool {
        let mut fields = Document::new();
        fields.insert(agent.field(AgentField::Logs), Value::Array(Vec::new()));
        match self.write_fields(fields).await {
            Ok(()) => true,
            Err(e) => {
                warn!(agent = %agent, error = %e, "Failed to clear logs");
                false
            }
        }
    }

    // ---- 运行时间 ----

    pub async fn get_last_run_time(&self, agent: AgentId) -> Option<NaiveDateTime> {
        self.get_record(agent).await.and_then(|r| r.last_run_time)
    }

    pub async fn get_next_run_time(&self, agent: AgentId) -> Option<NaiveDateTime> {
        self.get_record(agent).await.and_then(|r| r.next_run_time)
    }

    /// 是否到期。读不到记录时返回 false：无法确认 ACTIVE 时不调用
    pub async fn is_due(&self, agent: AgentId) -> bool {
        let record = match self.load_record(agent).await {
            Ok(record) => record,
            Err(e) => {
                warn!(agent = %agent, error = %e, "Cannot evaluate schedule");
                return false;
            }
        };

        match self.policy.due_decision(&record, self.clock.now()) {
            DueDecision::Due => true,
            DueDecision::NotDue => false,
            DueDecision::Reschedule(next) => {
                let mut fields = Document::new();
                fields.insert(agent.field(AgentField::NextRunTime), timestamp_value(Some(next)));
                match self.write_fields(fields).await {
                    Ok(()) => info!(agent = %agent, next = %next, "Restored missing schedule"),
                    Err(e) => warn!(agent = %agent, error = %e, "Failed to restore schedule"),
                }
                false
            }
        }
    }

    /// 手动复位卡在 ACTIVE 的智能体
    pub async fn reset_agent(&self, agent: AgentId) -> bool {
        if !self.set_state(agent, AgentState::Idle, None).await {
            return false;
        }
        self.append_log(agent, "State manually reset to IDLE").await;
        true
    }

    // ---- 自动模式镜像 ----

    pub async fn persist_automated_start(&self, start: NaiveDateTime, end: Option<NaiveDateTime>) -> bool {
        let mut fields = Document::new();
        fields.insert(AUTOMATED_MODE_FIELD.into(), Value::from(AutomatedMode::On.as_str()));
        fields.insert(AUTOMATED_MODE_START_FIELD.into(), timestamp_value(Some(start)));
        fields.insert(AUTOMATED_MODE_END_FIELD.into(), timestamp_value(end));
        self.write_mode(fields).await
    }

    pub async fn persist_automated_stop(&self, end: NaiveDateTime) -> bool {
        let mut fields = Document::new();
        fields.insert(AUTOMATED_MODE_FIELD.into(), Value::from(AutomatedMode::Off.as_str()));
        fields.insert(AUTOMATED_MODE_END_FIELD.into(), timestamp_value(Some(end)));
        self.write_mode(fields).await
    }

    async fn write_mode(&self, fields: Document) -> bool {
        match self.write_fields(fields).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to persist automated mode");
                false
            }
        }
    }

    pub async fn read_automated_mode(&self) -> Option<PersistedAutomatedMode> {
        match self.read_document().await {
            Ok(doc) => Some(PersistedAutomatedMode {
                mode: doc
                    .get(AUTOMATED_MODE_FIELD)
                    .and_then(Value::as_str)
                    .and_then(AutomatedMode::parse),
                start_time: doc.get(AUTOMATED_MODE_START_FIELD).and_then(parse_timestamp),
                end_time: doc.get(AUTOMATED_MODE_END_FIELD).and_then(parse_timestamp),
            }),
            Err(e) => {
                warn!(error = %e, "Failed to read automated mode");
                None
            }
        }
    }
}

fn expected_fields(now: NaiveDateTime) -> Vec<(String, Value)> {
    let mut fields = vec![
        (CREATED_AT_FIELD.to_string(), timestamp_value(Some(now))),
        (
            AUTOMATED_MODE_FIELD.to_string(),
            Value::from(AutomatedMode::Off.as_str()),
        ),
        (AUTOMATED_MODE_START_FIELD.to_string(), Value::Null),
        (AUTOMATED_MODE_END_FIELD.to_string(), Value::Null),
    ];
    for agent in AgentId::ALL {
        for field in AgentField::ALL {
            fields.push((agent.field(field), field.initial_value()));
        }
    }
    fields
}

fn initial_document(now: NaiveDateTime) -> Document {
    expected_fields(now).into_iter().collect()
}

/// 只挑出缺失的字段，从不覆盖已有数据
fn missing_fields(doc: &Document, now: NaiveDateTime) -> Document {
    expected_fields(now)
        .into_iter()
        .filter(|(key, _)| !doc.contains_key(key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::json;

    fn machine() -> (AgentStateMachine, ManualClock, Arc<MemoryStore>) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(MemoryStore::new());
        let sm = AgentStateMachine::new(store.clone(), SchedulePolicy::default(), Arc::new(clock.clone()));
        (sm, clock, store)
    }

    /// 每次调用都失败的存储
    struct DownStore;

    #[async_trait]
    impl DocumentStore for DownStore {
        async fn get_document(&self, _: &str, _: &str) -> Result<Option<Document>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn set_document(&self, _: &str, _: &str, _: Document, _: bool) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn update_fields(&self, _: &str, _: &str, _: Document) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn delete_document(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn atomic_increment(&self, _: &str, _: &str, _: &str, _: i64) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn append_to_list(&self, _: &str, _: &str, _: &str, _: Value, _: usize) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        fn name(&self) -> &'static str {
            "down"
        }
    }

    /// 永不返回的存储
    struct HangingStore;

    #[async_trait]
    impl DocumentStore for HangingStore {
        async fn get_document(&self, _: &str, _: &str) -> Result<Option<Document>, StoreError> {
            std::future::pending().await
        }
        async fn set_document(&self, _: &str, _: &str, _: Document, _: bool) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn update_fields(&self, _: &str, _: &str, _: Document) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn delete_document(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn atomic_increment(&self, _: &str, _: &str, _: &str, _: i64) -> Result<i64, StoreError> {
            std::future::pending().await
        }
        async fn append_to_list(&self, _: &str, _: &str, _: &str, _: Value, _: usize) -> Result<usize, StoreError> {
            std::future::pending().await
        }
        fn name(&self) -> &'static str {
            "hanging"
        }
    }

    /// 创建文档较慢的内存存储
    struct SlowCreateStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl DocumentStore for SlowCreateStore {
        async fn get_document(&self, c: &str, id: &str) -> Result<Option<Document>, StoreError> {
            self.inner.get_document(c, id).await
        }
        async fn set_document(&self, c: &str, id: &str, f: Document, merge: bool) -> Result<(), StoreError> {
            tokio::time::sleep(StdDuration::from_millis(50)).await;
            self.inner.set_document(c, id, f, merge).await
        }
        async fn update_fields(&self, c: &str, id: &str, f: Document) -> Result<(), StoreError> {
            self.inner.update_fields(c, id, f).await
        }
        async fn delete_document(&self, c: &str, id: &str) -> Result<bool, StoreError> {
            self.inner.delete_document(c, id).await
        }
        async fn atomic_increment(&self, c: &str, id: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
            self.inner.atomic_increment(c, id, field, delta).await
        }
        async fn append_to_list(&self, c: &str, id: &str, field: &str, entry: Value, max_len: usize) -> Result<usize, StoreError> {
            self.inner.append_to_list(c, id, field, entry, max_len).await
        }
        fn name(&self) -> &'static str {
            "slow-create"
        }
    }

    #[tokio::test]
    async fn test_concurrent_first_writes_do_not_clobber_each_other() {
        let store = Arc::new(SlowCreateStore { inner: MemoryStore::new() });
        let sm = AgentStateMachine::new(store.clone(), SchedulePolicy::default(), Arc::new(ManualClock::starting_now()));

        let (site, coa) = tokio::join!(
            sm.set_state(AgentId::Site, AgentState::Active, None),
            sm.set_state(AgentId::Coa, AgentState::Active, None),
        );
        assert!(site && coa);
        assert_eq!(sm.get_state(AgentId::Site).await, Some(AgentState::Active));
        assert_eq!(sm.get_state(AgentId::Coa).await, Some(AgentState::Active));
    }

    #[tokio::test]
    async fn test_initialize_creates_idle_agents() {
        let (sm, _, store) = machine();
        assert!(sm.initialize().await);
        let doc = store.get_document(STATE_COLLECTION, STATE_DOCUMENT).await.unwrap().unwrap();
        assert_eq!(doc["automated_mode"], json!("OFF"));
        assert!(doc["created_at"].is_string());
        for agent in AgentId::ALL {
            assert_eq!(sm.get_state(agent).await, Some(AgentState::Idle));
            assert!(sm.get_next_run_time(agent).await.is_none());
            assert!(sm.get_logs(agent, None).await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_initialize_twice_preserves_progress() {
        let (sm, _, store) = machine();
        assert!(sm.initialize().await);
        sm.set_state(AgentId::Coa, AgentState::Active, None).await;
        sm.append_log(AgentId::Coa, "working").await;
        sm.set_result(AgentId::Site, json!({"checked": 3})).await;

        let restarted = AgentStateMachine::new(
            store.clone(),
            SchedulePolicy::default(),
            Arc::new(ManualClock::starting_now()),
        );
        assert!(restarted.initialize().await);
        assert_eq!(restarted.get_state(AgentId::Coa).await, Some(AgentState::Active));
        assert_eq!(restarted.get_logs(AgentId::Coa, None).await.len(), 1);
        assert_eq!(restarted.get_result(AgentId::Site).await, Some(json!({"checked": 3})));
    }

    #[tokio::test]
    async fn test_migration_fills_only_missing_fields() {
        let (sm, _, store) = machine();
        let mut legacy = Document::new();
        legacy.insert("evaluation_agent_state".into(), json!("ACTIVE"));
        legacy.insert("automated_mode".into(), json!("ON"));
        store
            .set_document(STATE_COLLECTION, STATE_DOCUMENT, legacy, false)
            .await
            .unwrap();

        assert!(sm.initialize().await);
        let doc = store.get_document(STATE_COLLECTION, STATE_DOCUMENT).await.unwrap().unwrap();
        assert_eq!(doc["evaluation_agent_state"], json!("ACTIVE"));
        assert_eq!(doc["automated_mode"], json!("ON"));
        assert_eq!(doc["evaluation_agent_logs"], json!([]));
        assert!(doc.contains_key("evaluation_agent_next_run_time"));
        assert_eq!(doc["site_agent_state"], json!("IDLE"));
    }

    #[tokio::test]
    async fn test_set_state_flattens_metadata() {
        let (sm, _, store) = machine();
        let mut meta = Document::new();
        meta.insert("trigger".into(), json!("manual"));
        assert!(sm.set_state(AgentId::Site, AgentState::Active, Some(meta)).await);

        let doc = store.get_document(STATE_COLLECTION, STATE_DOCUMENT).await.unwrap().unwrap();
        assert_eq!(doc["site_agent_trigger"], json!("manual"));
        assert_eq!(sm.get_state(AgentId::Site).await, Some(AgentState::Active));
        assert!(sm.get_record(AgentId::Site).await.unwrap().last_activity.is_some());
    }

    #[tokio::test]
    async fn test_active_agent_is_not_due_until_completion() {
        let (sm, clock, _) = machine();
        for agent in [AgentId::Evaluation, AgentId::Site, AgentId::Coa] {
            assert!(sm.is_due(agent).await);
            sm.set_state(agent, AgentState::Active, None).await;
            assert!(!sm.is_due(agent).await);
            clock.advance(Duration::hours(10));
            assert!(!sm.is_due(agent).await);
            sm.set_result(agent, json!("done")).await;
            assert_eq!(sm.get_state(agent).await, Some(AgentState::Idle));
        }
    }

    #[tokio::test]
    async fn test_set_result_advances_fixed_interval() {
        let (sm, clock, _) = machine();
        let t = clock.now();
        assert!(sm.set_result(AgentId::Site, json!({"ok": true})).await);
        assert_eq!(sm.get_last_run_time(AgentId::Site).await, Some(t));
        assert_eq!(sm.get_next_run_time(AgentId::Site).await, Some(t + Duration::hours(1)));
        assert!(!sm.is_due(AgentId::Site).await);

        clock.advance(Duration::hours(1));
        assert!(sm.is_due(AgentId::Site).await);
    }

    #[tokio::test]
    async fn test_set_result_chains_successor_with_one_log() {
        let (sm, clock, _) = machine();
        let t = clock.now();
        sm.set_result(AgentId::Evaluation, json!({"generated": 2})).await;

        assert_eq!(
            sm.get_next_run_time(AgentId::Notification).await,
            Some(t + Duration::seconds(5))
        );
        let logs = sm.get_logs(AgentId::Notification, None).await;
        assert_eq!(logs.len(), 1);
        assert!(logs[0].contains("evaluation_agent"));
        assert!(sm.get_logs(AgentId::Scenario, None).await.is_empty());

        assert!(!sm.is_due(AgentId::Notification).await);
        clock.advance(Duration::seconds(5));
        assert!(sm.is_due(AgentId::Notification).await);
    }

    #[tokio::test]
    async fn test_out_of_range_schedule_degrades_without_panic() {
        let huge = Duration::seconds(10_i64.pow(13));
        let policy = SchedulePolicy::standard(huge).with_interval(AgentId::Evaluation, huge);
        let clock = ManualClock::starting_now();
        let sm = AgentStateMachine::new(Arc::new(MemoryStore::new()), policy, Arc::new(clock.clone()));

        assert!(sm.set_result(AgentId::Evaluation, json!({"generated": 1})).await);
        assert_eq!(sm.get_last_run_time(AgentId::Evaluation).await, Some(clock.now()));
        assert_eq!(sm.get_next_run_time(AgentId::Evaluation).await, None);
        assert_eq!(sm.get_next_run_time(AgentId::Notification).await, None);
        assert!(sm.get_logs(AgentId::Notification, None).await.is_empty());
        assert!(!sm.is_due(AgentId::Evaluation).await);
    }

    #[tokio::test]
    async fn test_chained_agent_completion_clears_its_schedule() {
        let (sm, clock, _) = machine();
        sm.set_result(AgentId::Evaluation, json!(1)).await;
        clock.advance(Duration::seconds(5));
        sm.set_result(AgentId::Notification, json!(2)).await;

        assert_eq!(sm.get_next_run_time(AgentId::Notification).await, None);
        assert!(!sm.is_due(AgentId::Notification).await);
        assert_eq!(
            sm.get_next_run_time(AgentId::Scenario).await,
            Some(clock.now() + Duration::seconds(5))
        );
    }

    #[tokio::test]
    async fn test_set_error_forces_idle_and_advances_schedule() {
        let (sm, clock, _) = machine();
        sm.set_state(AgentId::Coa, AgentState::Active, None).await;
        let t = clock.now();
        let mut details = Document::new();
        details.insert("attempt".into(), json!(1));
        assert!(sm.set_error(AgentId::Coa, "upstream exploded", Some(details)).await);

        let err = sm.get_error(AgentId::Coa).await.unwrap();
        assert_eq!(err.message, "upstream exploded");
        assert_eq!(err.timestamp, t);
        assert_eq!(err.details["attempt"], json!(1));
        assert_eq!(sm.get_state(AgentId::Coa).await, Some(AgentState::Idle));
        assert_eq!(sm.get_next_run_time(AgentId::Coa).await, Some(t + Duration::hours(2)));

        let record = sm.get_record(AgentId::Coa).await.unwrap();
        assert_eq!(record.run_count, 1);
        assert_eq!(record.failure_count, 1);
    }

    #[tokio::test]
    async fn test_error_on_predecessor_still_chains() {
        let (sm, clock, _) = machine();
        sm.set_error(AgentId::Evaluation, "boom", None).await;
        assert_eq!(
            sm.get_next_run_time(AgentId::Notification).await,
            Some(clock.now() + Duration::seconds(5))
        );
    }

    #[tokio::test]
    async fn test_later_success_keeps_error_record() {
        let (sm, _, _) = machine();
        sm.set_error(AgentId::Site, "first failed", None).await;
        sm.set_result(AgentId::Site, json!("second ok")).await;
        assert_eq!(sm.get_result(AgentId::Site).await, Some(json!("second ok")));
        assert!(sm.get_error(AgentId::Site).await.is_some());
    }

    #[tokio::test]
    async fn test_log_cap_keeps_most_recent() {
        let (sm, _, _) = machine();
        let max = 10;
        for i in 0..max + 7 {
            assert!(sm.append_log_capped(AgentId::Time, &format!("entry {i}"), max).await);
        }
        let logs = sm.get_logs(AgentId::Time, None).await;
        assert_eq!(logs.len(), max);
        for (offset, line) in logs.iter().enumerate() {
            assert!(line.ends_with(&format!("entry {}", offset + 7)), "{line}");
            assert!(line.starts_with('['));
        }

        let recent = sm.get_logs(AgentId::Time, Some(3)).await;
        assert_eq!(recent.len(), 3);
        assert!(recent[2].ends_with("entry 16"));
        assert_eq!(sm.get_logs(AgentId::Time, Some(100)).await.len(), max);
    }

    #[tokio::test]
    async fn test_default_log_cap_is_200() {
        let (sm, _, _) = machine();
        for i in 0..205 {
            sm.append_log(AgentId::Site, &format!("line {i}")).await;
        }
        let logs = sm.get_logs(AgentId::Site, None).await;
        assert_eq!(logs.len(), DEFAULT_MAX_LOG_ENTRIES);
        assert!(logs[0].ends_with("line 5"));
    }

    #[tokio::test]
    async fn test_clear_logs() {
        let (sm, _, _) = machine();
        sm.append_log(AgentId::Site, "a").await;
        assert!(sm.clear_logs(AgentId::Site).await);
        assert!(sm.get_logs(AgentId::Site, None).await.is_empty());
    }

    #[tokio::test]
    async fn test_lost_schedule_restored_without_running() {
        let (sm, clock, store) = machine();
        sm.set_result(AgentId::Evaluation, json!(1)).await;
        let last = sm.get_last_run_time(AgentId::Evaluation).await.unwrap();

        let mut wipe = Document::new();
        wipe.insert("evaluation_agent_next_run_time".into(), Value::Null);
        store.update_fields(STATE_COLLECTION, STATE_DOCUMENT, wipe).await.unwrap();
        clock.advance(Duration::hours(1));

        assert!(!sm.is_due(AgentId::Evaluation).await);
        assert_eq!(
            sm.get_next_run_time(AgentId::Evaluation).await,
            Some(last + Duration::minutes(5))
        );
        assert!(sm.is_due(AgentId::Evaluation).await);
    }

    #[tokio::test]
    async fn test_reset_agent() {
        let (sm, _, _) = machine();
        sm.set_state(AgentId::Scenario, AgentState::Active, None).await;
        assert!(sm.reset_agent(AgentId::Scenario).await);
        assert_eq!(sm.get_state(AgentId::Scenario).await, Some(AgentState::Idle));
        assert_eq!(sm.get_logs(AgentId::Scenario, None).await.len(), 1);
    }

    #[tokio::test]
    async fn test_recreates_document_deleted_underneath() {
        let (sm, _, store) = machine();
        assert!(sm.initialize().await);
        store.delete_document(STATE_COLLECTION, STATE_DOCUMENT).await.unwrap();
        assert!(sm.set_state(AgentId::Site, AgentState::Active, None).await);
        assert_eq!(sm.get_state(AgentId::Site).await, Some(AgentState::Active));
        assert_eq!(sm.get_state(AgentId::Coa).await, Some(AgentState::Idle));
    }

    #[tokio::test]
    async fn test_automated_mode_mirror() {
        let (sm, clock, _) = machine();
        let start = clock.now();
        assert!(sm.persist_automated_start(start, Some(start + Duration::minutes(30))).await);
        let mirror = sm.read_automated_mode().await.unwrap();
        assert_eq!(mirror.mode, Some(AutomatedMode::On));
        assert_eq!(mirror.start_time, Some(start));
        assert_eq!(mirror.end_time, Some(start + Duration::minutes(30)));

        clock.advance(Duration::minutes(2));
        assert!(sm.persist_automated_stop(clock.now()).await);
        let mirror = sm.read_automated_mode().await.unwrap();
        assert_eq!(mirror.mode, Some(AutomatedMode::Off));
        assert_eq!(mirror.start_time, Some(start));
        assert_eq!(mirror.end_time, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_degraded_store_returns_safe_defaults() {
        let sm = AgentStateMachine::new(
            Arc::new(DownStore),
            SchedulePolicy::default(),
            Arc::new(ManualClock::starting_now()),
        );
        let agent = AgentId::Evaluation;
        assert!(!sm.initialize().await);
        assert!(!sm.set_state(agent, AgentState::Active, None).await);
        assert_eq!(sm.get_state(agent).await, None);
        assert!(sm.get_all_states().await.is_empty());
        assert!(sm.get_all_records().await.is_empty());
        assert!(!sm.set_result(agent, json!(1)).await);
        assert!(!sm.set_error(agent, "x", None).await);
        assert_eq!(sm.get_result(agent).await, None);
        assert!(sm.get_error(agent).await.is_none());
        assert!(!sm.append_log(agent, "x").await);
        assert!(sm.get_logs(agent, Some(5)).await.is_empty());
        assert!(!sm.clear_logs(agent).await);
        assert_eq!(sm.get_last_run_time(agent).await, None);
        assert_eq!(sm.get_next_run_time(agent).await, None);
        assert!(!sm.is_due(agent).await);
        assert!(!sm.reset_agent(agent).await);
        assert!(!sm.persist_automated_stop(sm.now()).await);
        assert!(sm.read_automated_mode().await.is_none());
    }

    #[tokio::test]
    async fn test_hanging_store_times_out() {
        let sm = AgentStateMachine::new(
            Arc::new(HangingStore),
            SchedulePolicy::default(),
            Arc::new(ManualClock::starting_now()),
        )
        .with_store_timeout(StdDuration::from_millis(20));

        let started = std::time::Instant::now();
        assert!(sm.get_all_states().await.is_empty());
        assert!(!sm.is_due(AgentId::Site).await);
        assert!(started.elapsed() < StdDuration::from_secs(2));
    }
}
