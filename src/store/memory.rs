//! 内存文档存储：进程内 HashMap，每个调用在写锁内完成，天然原子

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{
    append_capped, increment_in, merge_into, stamp_updated_at, Document, DocumentStore, StoreError,
};

type DocKey = (String, String);

/// 内存存储（测试、单进程部署）
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<DocKey, Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(collection: &str, id: &str) -> DocKey {
    (collection.to_string(), id.to_string())
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.docs.read().await.get(&key(collection, id)).cloned())
    }

    async fn set_document(
        &self,
        collection: &str,
        id: &str,
        mut fields: Document,
        merge: bool,
    ) -> Result<(), StoreError> {
        stamp_updated_at(&mut fields);
        let mut docs = self.docs.write().await;
        let slot = docs.entry(key(collection, id)).or_default();
        if merge {
            merge_into(slot, fields);
        } else {
            *slot = fields;
        }
        Ok(())
    }

    async fn update_fields(&self, collection: &str, id: &str, mut fields: Document) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        let doc = docs
            .get_mut(&key(collection, id))
            .ok_or_else(|| StoreError::not_found(collection, id))?;
        stamp_updated_at(&mut fields);
        merge_into(doc, fields);
        Ok(())
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self.docs.write().await.remove(&key(collection, id)).is_some())
    }

    async fn atomic_increment(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError> {
        let mut docs = self.docs.write().await;
        let doc = docs
            .get_mut(&key(collection, id))
            .ok_or_else(|| StoreError::not_found(collection, id))?;
        let value = increment_in(doc, field, delta);
        stamp_updated_at(doc);
        Ok(value)
    }

    async fn append_to_list(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        entry: Value,
        max_len: usize,
    ) -> Result<usize, StoreError> {
        let mut docs = self.docs.write().await;
        let doc = docs
            .get_mut(&key(collection, id))
            .ok_or_else(|| StoreError::not_found(collection, id))?;
        let len = append_capped(doc, field, entry, max_len);
        stamp_updated_at(doc);
        Ok(len)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(pairs: &[(&str, Value)]) -> Document {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_set_merge_and_replace() {
        let store = MemoryStore::new();
        store
            .set_document("c", "d", doc(&[("a", json!(1)), ("b", json!(2))]), false)
            .await
            .unwrap();
        store
            .set_document("c", "d", doc(&[("b", json!(3))]), true)
            .await
            .unwrap();
        let got = store.get_document("c", "d").await.unwrap().unwrap();
        assert_eq!(got["a"], json!(1));
        assert_eq!(got["b"], json!(3));
        assert!(got.contains_key("updated_at"));

        store
            .set_document("c", "d", doc(&[("z", json!(true))]), false)
            .await
            .unwrap();
        let got = store.get_document("c", "d").await.unwrap().unwrap();
        assert!(!got.contains_key("a"));
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.update_fields("c", "missing", Document::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_increment_and_append() {
        let store = MemoryStore::new();
        store.set_document("c", "d", Document::new(), false).await.unwrap();
        assert_eq!(store.atomic_increment("c", "d", "n", 1).await.unwrap(), 1);
        assert_eq!(store.atomic_increment("c", "d", "n", 4).await.unwrap(), 5);

        for i in 0..4 {
            store.append_to_list("c", "d", "l", json!(i), 2).await.unwrap();
        }
        let got = store.get_document("c", "d").await.unwrap().unwrap();
        assert_eq!(got["l"], json!([2, 3]));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        store.set_document("c", "d", Document::new(), false).await.unwrap();
        assert!(store.delete_document("c", "d").await.unwrap());
        assert!(!store.delete_document("c", "d").await.unwrap());
        assert_eq!(store.get_document("c", "d").await.unwrap(), None);
    }
}
