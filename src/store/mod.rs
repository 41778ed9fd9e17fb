//! 运行时存储层：按 (collection, id) 寻址的文档存储
//!
//! 协调核心只把它当作持久化与协调底座：单文档读写、字段合并、原子计数、带上限的列表追加。
//! 所有写操作都会盖上服务端的 `updated_at` 时间戳；连接 / 权限类失败统一映射为
//! [`StoreError::Unavailable`]，由上层降级处理。

pub mod memory;
pub mod sqlite;
pub mod timestamp;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use timestamp::{format_timestamp, parse_timestamp};

/// 一个文档的全部字段
pub type Document = serde_json::Map<String, Value>;

/// 每次写入时由存储层填写的字段
pub const UPDATED_AT_FIELD: &str = "updated_at";

/// 存储层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// 连接、权限、I/O 等失败
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store call timed out after {0}ms")]
    Timeout(u64),

    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(collection: &str, id: &str) -> Self {
        Self::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    /// 是否属于「存储不可用」（可在下一个 tick 重试的瞬时故障）
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// 文档存储接口：所有操作都是单文档的，不需要跨文档事务
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// 读取整个文档；不存在时返回 None
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// 写入文档；merge=true 时只覆盖给出的字段，否则整体替换
    async fn set_document(
        &self,
        collection: &str,
        id: &str,
        fields: Document,
        merge: bool,
    ) -> Result<(), StoreError>;

    /// 更新部分字段；文档不存在时返回 NotFound
    async fn update_fields(&self, collection: &str, id: &str, fields: Document) -> Result<(), StoreError>;

    /// 删除文档，返回是否确实删除了
    async fn delete_document(&self, collection: &str, id: &str) -> Result<bool, StoreError>;

    /// 原子地给整数字段加 delta，返回新值；字段缺失按 0 处理
    async fn atomic_increment(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError>;

    /// 向列表字段追加一项并截断到最近 max_len 项（最旧的先丢弃），返回追加后的长度
    async fn append_to_list(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        entry: Value,
        max_len: usize,
    ) -> Result<usize, StoreError>;

    /// 后端名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 盖上服务端更新时间
pub(crate) fn stamp_updated_at(fields: &mut Document) {
    fields.insert(
        UPDATED_AT_FIELD.to_string(),
        Value::String(format_timestamp(chrono::Utc::now().naive_utc())),
    );
}

/// 合并写入：给出的字段覆盖已有字段
pub(crate) fn merge_into(target: &mut Document, fields: Document) {
    for (key, value) in fields {
        target.insert(key, value);
    }
}

pub(crate) fn increment_in(doc: &mut Document, field: &str, delta: i64) -> i64 {
    let current = doc.get(field).and_then(Value::as_i64).unwrap_or(0);
    let next = current.saturating_add(delta);
    doc.insert(field.to_string(), Value::from(next));
    next
}

/// FIFO 截断：只保留最近 max_len 项
pub(crate) fn append_capped(doc: &mut Document, field: &str, entry: Value, max_len: usize) -> usize {
    let mut list = match doc.remove(field) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };
    list.push(entry);
    if list.len() > max_len {
        let overflow = list.len() - max_len;
        list.drain(0..overflow);
    }
    let len = list.len();
    doc.insert(field.to_string(), Value::Array(list));
    len
}
