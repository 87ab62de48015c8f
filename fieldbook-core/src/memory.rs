//! In-memory document store
//!
//! A faithful stand-in for the replicating store: revision tokens,
//! optimistic-concurrency conflicts, bulk reads and the named logical
//! indexes the repository layer depends on. Backs every test in the
//! workspace; conflict injection lets tests exercise the retry discipline
//! without a second writer.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

use crate::error::{DataError, Result};
use crate::store::{
    AllDocsOptions, DocRow, DocumentStore, JsonDoc, PutResult, doc_id, doc_rev,
    AVPS_INDEX, MIGRATIONS_BY_DB_INDEX, RECORDS_INDEX, RECORD_REVISIONS_INDEX, REVISIONS_INDEX,
};

/// In-memory revision-tracked document store.
#[derive(Default)]
pub struct MemoryStore {
    /// Id-ordered storage; `all_docs` pagination relies on the ordering.
    docs: RwLock<BTreeMap<String, JsonDoc>>,
    /// Number of upcoming `put` calls to fail with `Conflict`.
    injected_conflicts: AtomicU32,
    /// When set, `all_docs`/`query`/`find` fail with a backend error. Lets
    /// tests simulate an unreachable database.
    fail_reads: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with `Conflict` regardless of the
    /// supplied token.
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` read queries fail as if the database were
    /// unreachable.
    pub fn fail_reads(&self, count: u32) {
        self.fail_reads.store(count, Ordering::SeqCst);
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }

    fn next_rev(current: Option<&str>) -> String {
        let generation = current
            .and_then(|rev| rev.split('-').next())
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0);
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", generation + 1, &suffix[..12])
    }

    fn take_read_failure(&self) -> Option<DataError> {
        let remaining = self.fail_reads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_reads.store(remaining - 1, Ordering::SeqCst);
            return Some(DataError::Backend("database unreachable".to_string()));
        }
        None
    }

    fn put_locked(
        docs: &mut BTreeMap<String, JsonDoc>,
        mut doc: JsonDoc,
    ) -> Result<PutResult> {
        let id = doc_id(&doc)
            .ok_or_else(|| DataError::Backend("document missing _id".to_string()))?
            .to_string();

        let stored_rev = docs.get(&id).and_then(doc_rev).map(str::to_string);
        let supplied_rev = doc_rev(&doc).map(str::to_string);
        if stored_rev != supplied_rev {
            return Err(DataError::Conflict(id));
        }

        let new_rev = Self::next_rev(stored_rev.as_deref());
        doc["_rev"] = Value::String(new_rev.clone());
        docs.insert(id.clone(), doc);
        Ok(PutResult { id, rev: new_rev })
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<JsonDoc> {
        let docs = self.docs.read().await;
        docs.get(id)
            .cloned()
            .ok_or_else(|| DataError::NotFound(id.to_string()))
    }

    async fn put(&self, doc: JsonDoc) -> Result<PutResult> {
        let remaining = self.injected_conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.injected_conflicts.store(remaining - 1, Ordering::SeqCst);
            let id = doc_id(&doc).unwrap_or("<missing id>").to_string();
            return Err(DataError::Conflict(id));
        }

        let mut docs = self.docs.write().await;
        Self::put_locked(&mut docs, doc)
    }

    async fn bulk_put(&self, batch: Vec<JsonDoc>) -> Result<Vec<Result<PutResult>>> {
        let mut docs = self.docs.write().await;
        Ok(batch
            .into_iter()
            .map(|doc| Self::put_locked(&mut docs, doc))
            .collect())
    }

    async fn all_docs(&self, options: AllDocsOptions) -> Result<Vec<DocRow>> {
        if let Some(err) = self.take_read_failure() {
            return Err(err);
        }
        let docs = self.docs.read().await;

        let row = |id: &str, doc: &JsonDoc| DocRow {
            id: id.to_string(),
            key: Value::String(id.to_string()),
            doc: options.include_docs.then(|| doc.clone()),
        };

        if let Some(keys) = &options.keys {
            // Requested-key order is preserved; absent ids yield no row.
            return Ok(keys
                .iter()
                .filter_map(|key| docs.get(key).map(|doc| row(key, doc)))
                .collect());
        }

        let mut rows: Vec<DocRow> = docs
            .iter()
            .skip_while(|(id, _)| {
                options
                    .start_key
                    .as_ref()
                    .is_some_and(|start| id.as_str() < start.as_str())
            })
            .map(|(id, doc)| row(id, doc))
            .collect();
        if options.skip > 0 {
            rows.drain(..options.skip.min(rows.len()));
        }
        if let Some(limit) = options.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn query(&self, index: &str, keys: Option<Vec<Value>>) -> Result<Vec<DocRow>> {
        if let Some(err) = self.take_read_failure() {
            return Err(err);
        }
        let docs = self.docs.read().await;

        let discriminant_rows = |field: &str| -> Vec<DocRow> {
            docs.values()
                .filter(|doc| doc.get(field).is_some())
                .map(|doc| DocRow {
                    id: doc_id(doc).unwrap_or_default().to_string(),
                    key: Value::String(doc_id(doc).unwrap_or_default().to_string()),
                    doc: Some(doc.clone()),
                })
                .collect()
        };

        let mut rows = match index {
            RECORDS_INDEX => discriminant_rows("record_format_version"),
            REVISIONS_INDEX => discriminant_rows("revision_format_version"),
            AVPS_INDEX => discriminant_rows("avp_format_version"),
            RECORD_REVISIONS_INDEX => {
                // One row per record, carrying the record's first head
                // revision document.
                docs.values()
                    .filter(|doc| doc.get("record_format_version").is_some())
                    .filter_map(|record| {
                        let record_id = doc_id(record)?.to_string();
                        let head = record.get("heads")?.get(0)?.as_str()?;
                        let revision = docs.get(head)?;
                        Some(DocRow {
                            id: record_id.clone(),
                            key: Value::String(record_id),
                            doc: Some(revision.clone()),
                        })
                    })
                    .collect()
            }
            MIGRATIONS_BY_DB_INDEX => docs
                .values()
                .filter(|doc| doc.get("db_type").is_some() && doc.get("db_name").is_some())
                .map(|doc| DocRow {
                    id: doc_id(doc).unwrap_or_default().to_string(),
                    key: Value::Array(vec![
                        doc["db_type"].clone(),
                        doc["db_name"].clone(),
                    ]),
                    doc: Some(doc.clone()),
                })
                .collect(),
            other => {
                return Err(DataError::Backend(format!("unknown index {other}")));
            }
        };

        if let Some(keys) = keys {
            rows.retain(|row| keys.contains(&row.key));
        }
        Ok(rows)
    }

    async fn find(&self, selector: Value, limit: Option<usize>) -> Result<Vec<JsonDoc>> {
        if let Some(err) = self.take_read_failure() {
            return Err(err);
        }
        let criteria = selector
            .as_object()
            .ok_or_else(|| DataError::Backend("selector must be an object".to_string()))?
            .clone();

        let docs = self.docs.read().await;
        let mut out: Vec<JsonDoc> = docs
            .values()
            .filter(|doc| criteria.iter().all(|(field, want)| doc.get(field) == Some(want)))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn delete(&self, id: &str, rev: &str) -> Result<()> {
        let mut docs = self.docs.write().await;
        let stored_rev = docs
            .get(id)
            .and_then(doc_rev)
            .map(str::to_string)
            .ok_or_else(|| DataError::NotFound(id.to_string()))?;
        if stored_rev != rev {
            return Err(DataError::Conflict(id.to_string()));
        }
        docs.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::safe_write;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryStore::new();
        let result = store
            .put(json!({"_id": "doc-1", "value": 42}))
            .await
            .unwrap();
        assert!(result.rev.starts_with("1-"));

        let doc = store.get("doc-1").await.unwrap();
        assert_eq!(doc["value"], 42);
        assert_eq!(doc_rev(&doc), Some(result.rev.as_str()));
    }

    #[tokio::test]
    async fn test_stale_token_conflicts() {
        let store = MemoryStore::new();
        store.put(json!({"_id": "doc-1", "value": 1})).await.unwrap();
        let current = store.get("doc-1").await.unwrap();
        store.put(current.clone()).await.unwrap();

        // Writing with the now-stale token must conflict.
        let err = store.put(current).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_missing_token_conflicts_on_existing_doc() {
        let store = MemoryStore::new();
        store.put(json!({"_id": "doc-1"})).await.unwrap();
        let err = store.put(json!({"_id": "doc-1"})).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_all_docs_keys_preserve_order() {
        let store = MemoryStore::new();
        for id in ["b", "a", "c"] {
            store.put(json!({"_id": id})).await.unwrap();
        }
        let rows = store
            .all_docs(AllDocsOptions::docs_for_keys(vec![
                "c".to_string(),
                "a".to_string(),
                "missing".to_string(),
            ]))
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_all_docs_pagination() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.put(json!({"_id": format!("doc-{i}")})).await.unwrap();
        }
        let first = store
            .all_docs(AllDocsOptions::page(None, 2))
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, "doc-0");

        let second = store
            .all_docs(AllDocsOptions::page(Some(first[1].id.clone()), 2))
            .await
            .unwrap();
        assert_eq!(second[0].id, "doc-2");
    }

    #[tokio::test]
    async fn test_safe_write_retries_injected_conflicts() {
        let store = MemoryStore::new();
        store.put(json!({"_id": "doc-1", "count": 0})).await.unwrap();
        store.inject_conflicts(2);

        let result = safe_write(&store, "doc-1", 5, |current| {
            let mut doc = current.expect("doc exists");
            let count = doc["count"].as_u64().unwrap_or(0);
            doc["count"] = json!(count + 1);
            Ok(doc)
        })
        .await
        .unwrap();
        assert!(result.rev.starts_with("2-"));

        let doc = store.get("doc-1").await.unwrap();
        assert_eq!(doc["count"], 1);
    }

    #[tokio::test]
    async fn test_safe_write_gives_up_after_bound() {
        let store = MemoryStore::new();
        store.put(json!({"_id": "doc-1"})).await.unwrap();
        store.inject_conflicts(10);

        let err = safe_write(&store, "doc-1", 3, |current| {
            Ok(current.expect("doc exists"))
        })
        .await
        .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_find_equality_selector() {
        let store = MemoryStore::new();
        store
            .put(json!({"_id": "a", "record_format_version": 1}))
            .await
            .unwrap();
        store.put(json!({"_id": "b", "other": true})).await.unwrap();

        let docs = store
            .find(json!({"record_format_version": 1}), None)
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(doc_id(&docs[0]), Some("a"));
    }
}
