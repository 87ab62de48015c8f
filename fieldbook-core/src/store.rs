//! Document store adapter
//!
//! The core runs against a multi-master replicating document database that
//! it does not implement: every document carries an opaque revision token,
//! writes are optimistic (a stale token yields `Conflict`), and reads go
//! through bulk fetches and named secondary indexes. This module defines the
//! trait the rest of the crate consumes plus the retrying "safe write"
//! helper used by every read-modify-write path.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{DataError, Result};

/// Logical index over record documents (`record_format_version`
/// discriminant).
pub const RECORDS_INDEX: &str = "index/records";
/// Logical index over revision documents.
pub const REVISIONS_INDEX: &str = "index/revisions";
/// Logical index over AVP documents.
pub const AVPS_INDEX: &str = "index/avps";
/// Composite record → latest-head-revision index used for paginated
/// listing. Rows are keyed by record id; `doc` is the head revision.
pub const RECORD_REVISIONS_INDEX: &str = "index/record_revisions";
/// Index over migration documents keyed by `[db_type, db_name]`.
pub const MIGRATIONS_BY_DB_INDEX: &str = "index/migrations_by_db";

/// Design-document id prefix; these are store machinery and never data.
pub const DESIGN_DOC_PREFIX: &str = "_design/";

/// A raw JSON document as stored. Contains `_id` and, once written, `_rev`.
pub type JsonDoc = Value;

/// Outcome of a successful write.
#[derive(Debug, Clone)]
pub struct PutResult {
    pub id: String,
    /// The new revision token; must be supplied back on the next update.
    pub rev: String,
}

/// One row of an `all_docs` or index query response.
#[derive(Debug, Clone)]
pub struct DocRow {
    pub id: String,
    pub key: Value,
    /// Present when the query requested `include_docs`.
    pub doc: Option<JsonDoc>,
}

/// Options for `all_docs`.
#[derive(Debug, Clone, Default)]
pub struct AllDocsOptions {
    pub include_docs: bool,
    /// Fetch exactly these ids, in order; missing ids yield no row.
    pub keys: Option<Vec<String>>,
    /// Start listing from this id (inclusive). Used for batch pagination.
    pub start_key: Option<String>,
    /// Skip this many rows after `start_key`; `skip: 1` resumes past a
    /// bookmark.
    pub skip: usize,
    pub limit: Option<usize>,
}

impl AllDocsOptions {
    /// Fetch the given ids with their documents.
    pub fn docs_for_keys(keys: Vec<String>) -> Self {
        Self {
            include_docs: true,
            keys: Some(keys),
            ..Default::default()
        }
    }

    /// Page of `limit` documents starting after `bookmark`.
    pub fn page(bookmark: Option<String>, limit: usize) -> Self {
        let skip = usize::from(bookmark.is_some());
        Self {
            include_docs: true,
            keys: None,
            start_key: bookmark,
            skip,
            limit: Some(limit),
        }
    }
}

/// Revision-tracked document CRUD and queries, as exposed by the underlying
/// store. All operations are suspension points; the store is the sole
/// arbiter of write ordering.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document by id.
    async fn get(&self, id: &str) -> Result<JsonDoc>;

    /// Write one document. The document's `_rev` must match the stored
    /// token (or be absent for a create); otherwise `Conflict`.
    async fn put(&self, doc: JsonDoc) -> Result<PutResult>;

    /// Write a batch of documents. Per-document conflicts are reported in
    /// the corresponding result slot.
    async fn bulk_put(&self, docs: Vec<JsonDoc>) -> Result<Vec<Result<PutResult>>>;

    /// List documents by id order, optionally restricted to `keys`.
    async fn all_docs(&self, options: AllDocsOptions) -> Result<Vec<DocRow>>;

    /// Query a named secondary index, optionally restricted to `keys`.
    /// Omitting `keys` returns everything visible through the index.
    async fn query(&self, index: &str, keys: Option<Vec<Value>>) -> Result<Vec<DocRow>>;

    /// Field-selector query (equality match on top-level fields).
    async fn find(&self, selector: Value, limit: Option<usize>) -> Result<Vec<JsonDoc>>;

    /// Delete a document at a specific revision token.
    async fn delete(&self, id: &str, rev: &str) -> Result<()>;
}

/// Extract the `_id` of a raw document.
pub fn doc_id(doc: &JsonDoc) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}

/// Extract the `_rev` token of a raw document.
pub fn doc_rev(doc: &JsonDoc) -> Option<&str> {
    doc.get("_rev").and_then(Value::as_str)
}

/// Default retry bound for `safe_write`.
pub const DEFAULT_WRITE_ATTEMPTS: u32 = 5;

/// Retrying transactional write.
///
/// Fetches the current version of `id` (or `None` when absent), lets the
/// caller's `patch` build the replacement document, stamps the latest
/// revision token onto it and writes. On `Conflict` the whole cycle is
/// replayed against the refreshed document, up to `max_attempts` times.
/// Callers must supply an idempotent patch: it may run several times and
/// must produce a correct document from whatever state it is given.
pub async fn safe_write<F>(
    store: &dyn DocumentStore,
    id: &str,
    max_attempts: u32,
    mut patch: F,
) -> Result<PutResult>
where
    F: FnMut(Option<JsonDoc>) -> Result<JsonDoc> + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = match store.get(id).await {
            Ok(doc) => Some(doc),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };
        let current_rev = current
            .as_ref()
            .and_then(doc_rev)
            .map(str::to_string);

        let mut replacement = patch(current)?;
        match current_rev {
            Some(rev) => {
                replacement["_rev"] = Value::String(rev);
            }
            None => {
                if let Some(map) = replacement.as_object_mut() {
                    map.remove("_rev");
                }
            }
        }

        match store.put(replacement).await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_conflict() && attempt < max_attempts => {
                tracing::debug!(id, attempt, "write conflict, retrying");
                continue;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Serialize a typed document for writing.
pub fn to_doc<T: serde::Serialize>(value: &T) -> Result<JsonDoc> {
    Ok(serde_json::to_value(value)?)
}

/// Deserialize a raw document, first checking that it carries the expected
/// format-version discriminant. A present-but-wrong document maps to
/// `TypeMismatch`, never to a serde error.
pub fn from_typed_doc<T: serde::de::DeserializeOwned>(
    doc: JsonDoc,
    discriminant: &'static str,
) -> Result<T> {
    if doc.get(discriminant).is_none() {
        let id = doc_id(&doc).unwrap_or("<missing id>").to_string();
        return Err(DataError::TypeMismatch {
            id,
            expected: discriminant,
        });
    }
    Ok(serde_json::from_value(doc)?)
}
