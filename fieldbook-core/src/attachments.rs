//! Attachment subsystem
//!
//! Splits binary payloads out of AVP documents on write and joins them back
//! on read, driven by the per-type handler registry. Attachment documents
//! are fetched on demand, never eagerly; a missing attachment degrades the
//! affected list entry to its reference object instead of failing the whole
//! hydration.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use tracing::warn;

use crate::context::{DataContext, FieldTypeHandler};
use crate::error::{DataError, Result};
use crate::ident::AttachmentId;
use crate::store::{AllDocsOptions, from_typed_doc};
use crate::types::{
    ATTACHMENT_FORMAT_VERSION, Attachment, AttachmentReference, AttributeValuePair,
};

/// Type tag handled by [`FileAttachmentHandler`].
pub const FILES_TYPE: &str = "fieldbook-attachment::files";

/// Run the registered dumper for the AVP's type. Unregistered types pass
/// through unchanged with no attachment documents.
pub fn dump_avp(
    context: &DataContext,
    avp: AttributeValuePair,
) -> Result<(AttributeValuePair, Vec<Attachment>)> {
    context.types().handler_for(&avp.avp_type).dump(avp)
}

/// Hydrate an AVP: when it carries attachment references, fetch the
/// attachment documents and run the registered loader. Attachments that
/// cannot be fetched are simply absent from the set handed to the loader.
pub async fn load_avp(
    context: &DataContext,
    avp: AttributeValuePair,
) -> Result<AttributeValuePair> {
    let refs = match &avp.attachment_refs {
        Some(refs) if !refs.is_empty() => refs.clone(),
        _ => return Ok(avp),
    };
    if !context.types().is_registered(&avp.avp_type) {
        return Ok(avp);
    }

    let keys: Vec<String> = refs.iter().map(|r| r.attachment_id.to_string()).collect();
    let rows = context
        .store()
        .all_docs(AllDocsOptions::docs_for_keys(keys))
        .await?;

    let mut attachments = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(doc) = row.doc else { continue };
        match from_typed_doc::<Attachment>(doc, "attachment_format_version") {
            Ok(attachment) => attachments.push(attachment),
            Err(err) => {
                warn!(avp = %avp.id, attachment = %row.id, %err, "skipping malformed attachment");
            }
        }
    }
    if attachments.len() < refs.len() {
        warn!(
            avp = %avp.id,
            expected = refs.len(),
            loaded = attachments.len(),
            "some attachments could not be fetched, degrading to references"
        );
    }

    context.types().handler_for(&avp.avp_type).load(avp, attachments)
}

/// Handler for file-list fields. The inline form of `data` is a JSON array
/// of `{filename, file_type, data}` objects with base64 payloads; the
/// dumped form externalizes each file into its own attachment document.
pub struct FileAttachmentHandler;

impl FileAttachmentHandler {
    fn file_entry(attachment: &Attachment) -> Value {
        json!({
            "filename": attachment.filename,
            "file_type": attachment.content_type,
            "data": attachment.data,
        })
    }

    /// Degraded form for a file whose attachment document is missing.
    fn reference_entry(reference: &AttachmentReference) -> Value {
        json!({
            "attachment_id": reference.attachment_id,
            "filename": reference.filename,
            "file_type": reference.file_type,
        })
    }
}

impl FieldTypeHandler for FileAttachmentHandler {
    fn dump(&self, mut avp: AttributeValuePair) -> Result<(AttributeValuePair, Vec<Attachment>)> {
        if avp.data.is_null() {
            // Already externalized (e.g. an AVP being rewritten untouched).
            return Ok((avp, Vec::new()));
        }
        let files = avp
            .data
            .as_array()
            .cloned()
            .ok_or_else(|| DataError::Backend(format!("file AVP {} data is not a list", avp.id)))?;

        let mut refs = Vec::with_capacity(files.len());
        let mut attachments = Vec::with_capacity(files.len());
        for file in files {
            let filename = file
                .get("filename")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let content_type = file
                .get("file_type")
                .and_then(Value::as_str)
                .unwrap_or("application/octet-stream")
                .to_string();
            let data = file
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            // Validate the payload is real base64 before persisting it.
            BASE64
                .decode(&data)
                .map_err(|e| DataError::Backend(format!("file payload is not base64: {e}")))?;

            let attachment_id = AttachmentId::generate();
            refs.push(AttachmentReference {
                attachment_id: attachment_id.clone(),
                filename: filename.clone(),
                file_type: content_type.clone(),
            });
            attachments.push(Attachment {
                id: attachment_id,
                rev: None,
                attachment_format_version: ATTACHMENT_FORMAT_VERSION,
                avp_id: avp.id.clone(),
                revision_id: avp.revision_id.clone(),
                record_id: avp.record_id.clone(),
                filename,
                content_type,
                data,
                created: avp.created,
                created_by: avp.created_by.clone(),
            });
        }

        avp.data = Value::Null;
        avp.attachment_refs = Some(refs);
        Ok((avp, attachments))
    }

    fn load(
        &self,
        mut avp: AttributeValuePair,
        attachments: Vec<Attachment>,
    ) -> Result<AttributeValuePair> {
        let refs = avp.attachment_refs.clone().unwrap_or_default();
        let entries: Vec<Value> = refs
            .iter()
            .map(|reference| {
                attachments
                    .iter()
                    .find(|a| a.id == reference.attachment_id)
                    .map(Self::file_entry)
                    .unwrap_or_else(|| Self::reference_entry(reference))
            })
            .collect();
        avp.data = Value::Array(entries);
        Ok(avp)
    }

    fn equals(&self, a: &Value, b: &Value) -> bool {
        // File lists compare by content, which structural equality covers
        // for both the inline and degraded forms.
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::{AvpId, RecordId, RevisionId};
    use crate::types::AVP_FORMAT_VERSION;

    fn file_avp(data: Value) -> AttributeValuePair {
        AttributeValuePair {
            id: AvpId::generate(),
            rev: None,
            avp_format_version: AVP_FORMAT_VERSION,
            avp_type: FILES_TYPE.to_string(),
            data,
            revision_id: RevisionId::generate(),
            record_id: RecordId::generate(),
            annotations: Value::Null,
            created: chrono::Utc::now(),
            created_by: "tester".to_string(),
            attachment_refs: None,
        }
    }

    fn encoded(payload: &[u8]) -> String {
        BASE64.encode(payload)
    }

    #[test]
    fn test_dump_externalizes_files() {
        let avp = file_avp(json!([
            {"filename": "a.jpg", "file_type": "image/jpeg", "data": encoded(b"jpeg")},
            {"filename": "b.png", "file_type": "image/png", "data": encoded(b"png")},
        ]));
        let (dumped, attachments) = FileAttachmentHandler.dump(avp).unwrap();

        assert!(dumped.data.is_null());
        let refs = dumped.attachment_refs.unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].id, refs[0].attachment_id);
        assert_eq!(attachments[0].filename, "a.jpg");
        assert!(refs[0].attachment_id.has_valid_prefix());
    }

    #[test]
    fn test_load_restores_files() {
        let avp = file_avp(json!([
            {"filename": "a.jpg", "file_type": "image/jpeg", "data": encoded(b"jpeg")},
        ]));
        let (dumped, attachments) = FileAttachmentHandler.dump(avp).unwrap();
        let loaded = FileAttachmentHandler.load(dumped, attachments).unwrap();

        let files = loaded.data.as_array().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0]["filename"], "a.jpg");
        assert_eq!(files[0]["data"], encoded(b"jpeg"));
    }

    #[test]
    fn test_load_degrades_missing_attachment() {
        let avp = file_avp(json!([
            {"filename": "a.jpg", "file_type": "image/jpeg", "data": encoded(b"jpeg")},
            {"filename": "b.png", "file_type": "image/png", "data": encoded(b"png")},
        ]));
        let (dumped, mut attachments) = FileAttachmentHandler.dump(avp).unwrap();
        // Drop the second attachment as if replication has not caught up.
        attachments.truncate(1);
        let loaded = FileAttachmentHandler.load(dumped, attachments).unwrap();

        let files = loaded.data.as_array().unwrap();
        assert_eq!(files[0]["filename"], "a.jpg");
        // Degraded entry is the bare reference, no payload.
        assert_eq!(files[1]["filename"], "b.png");
        assert!(files[1].get("data").is_none());
        assert!(files[1].get("attachment_id").is_some());
    }

    #[test]
    fn test_dump_rejects_non_base64() {
        let avp = file_avp(json!([
            {"filename": "a.bin", "file_type": "application/octet-stream", "data": "not base64!!"},
        ]));
        assert!(FileAttachmentHandler.dump(avp).is_err());
    }
}
