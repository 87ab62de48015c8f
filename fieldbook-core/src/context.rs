//! Per-process context and field-type registry
//!
//! All dispatch that used to live in ambient registries is carried by an
//! explicit `DataContext` constructed once per process (or per test) and
//! passed into every repository, merge and migration call. Field types
//! declare their serialization and comparison behaviour through the
//! `FieldTypeHandler` trait; unregistered types get the identity handler,
//! which keeps data inline and compares values structurally.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::store::DocumentStore;
use crate::types::{Attachment, AttributeValuePair, RecordMetadata};

/// How one field type serializes attachments and compares values.
///
/// `dump` runs whenever an AVP is written: it may externalize the payload
/// into attachment documents, leaving `data` null and `attachment_refs`
/// populated. `load` runs on hydration with whichever referenced
/// attachments could be fetched; it must tolerate missing ones. `equals`
/// drives change detection when a new revision is saved.
pub trait FieldTypeHandler: Send + Sync {
    /// Split an AVP into its stored form plus attachment documents.
    fn dump(&self, avp: AttributeValuePair) -> Result<(AttributeValuePair, Vec<Attachment>)>;

    /// Rebuild an AVP's `data` from the fetched attachment documents.
    fn load(
        &self,
        avp: AttributeValuePair,
        attachments: Vec<Attachment>,
    ) -> Result<AttributeValuePair>;

    /// Value equality for change detection.
    fn equals(&self, a: &Value, b: &Value) -> bool {
        a == b
    }
}

/// Default handler: no attachments, structural equality.
pub struct IdentityHandler;

impl FieldTypeHandler for IdentityHandler {
    fn dump(&self, avp: AttributeValuePair) -> Result<(AttributeValuePair, Vec<Attachment>)> {
        Ok((avp, Vec::new()))
    }

    fn load(
        &self,
        avp: AttributeValuePair,
        _attachments: Vec<Attachment>,
    ) -> Result<AttributeValuePair> {
        Ok(avp)
    }
}

/// Registry of field-type handlers keyed by type tag.
pub struct TypeRegistry {
    handlers: HashMap<String, Arc<dyn FieldTypeHandler>>,
    identity: Arc<dyn FieldTypeHandler>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            identity: Arc::new(IdentityHandler),
        }
    }

    /// Register a handler for a field type tag, replacing any existing one.
    pub fn register(&mut self, type_tag: impl Into<String>, handler: Arc<dyn FieldTypeHandler>) {
        self.handlers.insert(type_tag.into(), handler);
    }

    /// Handler for a type tag; identity when unregistered.
    pub fn handler_for(&self, type_tag: &str) -> Arc<dyn FieldTypeHandler> {
        self.handlers
            .get(type_tag)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.identity))
    }

    /// Whether a non-identity handler is registered for the tag.
    pub fn is_registered(&self, type_tag: &str) -> bool {
        self.handlers.contains_key(type_tag)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a data-layer call needs: the document store for one database
/// plus the field-type registry.
#[derive(Clone)]
pub struct DataContext {
    store: Arc<dyn DocumentStore>,
    types: Arc<TypeRegistry>,
}

impl DataContext {
    pub fn new(store: Arc<dyn DocumentStore>, types: Arc<TypeRegistry>) -> Self {
        Self { store, types }
    }

    /// Context with no registered field types.
    pub fn with_store(store: Arc<dyn DocumentStore>) -> Self {
        Self::new(store, Arc::new(TypeRegistry::new()))
    }

    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }
}

/// Parsed authorization token of the caller, opaque to this crate beyond
/// the fields the display filter needs.
#[derive(Debug, Clone, Default)]
pub struct TokenContents {
    pub user_id: String,
    pub roles: Vec<String>,
}

/// Decouples the core from how a project's database is obtained and from
/// permission filtering. Supplied by the embedding application.
#[async_trait::async_trait]
pub trait DatabaseResolver: Send + Sync {
    /// The data database for a project.
    async fn data_db(&self, project_id: &str) -> Result<Arc<dyn DocumentStore>>;

    /// Whether the caller may see this record in listings.
    fn should_display_record(
        &self,
        token: &TokenContents,
        project_id: &str,
        metadata: &RecordMetadata,
    ) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::{AvpId, RecordId, RevisionId};
    use crate::types::AVP_FORMAT_VERSION;
    use serde_json::json;

    fn sample_avp() -> AttributeValuePair {
        AttributeValuePair {
            id: AvpId::generate(),
            rev: None,
            avp_format_version: AVP_FORMAT_VERSION,
            avp_type: "core::string".to_string(),
            data: json!("hello"),
            revision_id: RevisionId::generate(),
            record_id: RecordId::generate(),
            annotations: Value::Null,
            created: chrono::Utc::now(),
            created_by: "tester".to_string(),
            attachment_refs: None,
        }
    }

    #[test]
    fn test_identity_handler_passes_through() {
        let handler = IdentityHandler;
        let avp = sample_avp();
        let data = avp.data.clone();
        let (dumped, attachments) = handler.dump(avp).unwrap();
        assert!(attachments.is_empty());
        assert_eq!(dumped.data, data);
    }

    #[test]
    fn test_unregistered_type_gets_identity() {
        let registry = TypeRegistry::new();
        assert!(!registry.is_registered("custom::type"));
        let handler = registry.handler_for("custom::type");
        assert!(handler.equals(&json!(1), &json!(1)));
        assert!(!handler.equals(&json!(1), &json!(2)));
    }
}
