//! SQLite 文档存储
//!
//! 每个 (collection, id) 一行，body 为 JSON 对象。读-改-写类操作（合并、计数、追加）
//! 在连接锁内开一个事务完成，因此在单进程内是原子的。

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;

use super::{
    append_capped, format_timestamp, increment_in, merge_into, stamp_updated_at, Document,
    DocumentStore, StoreError,
};

pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("{}: {}", parent.display(), e)))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            )",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }
}

fn load(conn: &Connection, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
            |row| row.get(0),
        )
        .optional()?;
    match body {
        None => Ok(None),
        Some(raw) => match serde_json::from_str::<Value>(&raw)? {
            Value::Object(map) => Ok(Some(map)),
            other => Err(StoreError::Serialization(format!(
                "{collection}/{id} is not an object: {other}"
            ))),
        },
    }
}

fn save(conn: &Connection, collection: &str, id: &str, doc: &Document) -> Result<(), StoreError> {
    let body = serde_json::to_string(doc)?;
    let now = format_timestamp(chrono::Utc::now().naive_utc());
    conn.execute(
        "INSERT INTO documents (collection, id, body, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(collection, id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
        params![collection, id, body, now],
    )?;
    Ok(())
}

impl SqliteStore {
    /// 在事务内读出已存在的文档、修改并写回
    async fn modify_existing<T>(
        &self,
        collection: &str,
        id: &str,
        f: impl FnOnce(&mut Document) -> T,
    ) -> Result<T, StoreError> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let mut doc = load(&tx, collection, id)?.ok_or_else(|| StoreError::not_found(collection, id))?;
        let out = f(&mut doc);
        stamp_updated_at(&mut doc);
        save(&tx, collection, id, &doc)?;
        tx.commit()?;
        Ok(out)
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let db = self.db.lock().await;
        load(&db, collection, id)
    }

    async fn set_document(
        &self,
        collection: &str,
        id: &str,
        mut fields: Document,
        merge: bool,
    ) -> Result<(), StoreError> {
        stamp_updated_at(&mut fields);
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let doc = if merge {
            let mut existing = load(&tx, collection, id)?.unwrap_or_default();
            merge_into(&mut existing, fields);
            existing
        } else {
            fields
        };
        save(&tx, collection, id, &doc)?;
        tx.commit()?;
        Ok(())
    }

    async fn update_fields(&self, collection: &str, id: &str, fields: Document) -> Result<(), StoreError> {
        self.modify_existing(collection, id, |doc| merge_into(doc, fields))
            .await
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        Ok(rows > 0)
    }

    async fn atomic_increment(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError> {
        self.modify_existing(collection, id, |doc| increment_in(doc, field, delta))
            .await
    }

    async fn append_to_list(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        entry: Value,
        max_len: usize,
    ) -> Result<usize, StoreError> {
        self.modify_existing(collection, id, |doc| append_capped(doc, field, entry, max_len))
            .await
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
