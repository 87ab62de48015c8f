//! Persisted document model
//!
//! A mutable "record" is an append-only DAG of immutable "revisions". Each
//! revision maps field names to attribute-value-pair (AVP) documents; an AVP
//! that did not change between revisions is shared by id rather than copied,
//! which is what makes merging cheap. Binary payloads live in separate
//! attachment documents referenced from the owning AVP.
//!
//! Wire format notes: documents serialize to JSON with a `_id`/`_rev` pair
//! (the store's opaque revision token), a numeric `*_format_version`
//! discriminant and RFC 3339 timestamps. These encodings are shared with
//! other consumers of the same databases and must be preserved bit-exact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::ident::{AttachmentId, AvpId, RecordId, RevisionId};

/// Discriminant value for record documents.
pub const RECORD_FORMAT_VERSION: u32 = 1;
/// Discriminant value for revision documents.
pub const REVISION_FORMAT_VERSION: u32 = 1;
/// Discriminant value for AVP documents.
pub const AVP_FORMAT_VERSION: u32 = 1;
/// Discriminant value for attachment documents.
pub const ATTACHMENT_FORMAT_VERSION: u32 = 1;

/// Field-name prefix that marks a field as the human-readable identifier
/// source for its record type.
pub const HRID_PREFIX: &str = "hrid";

/// Map of field name to the AVP holding that field's value.
pub type AvpIdMap = BTreeMap<String, AvpId>;

/// A link to another record through a named field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedRelation {
    pub record_id: RecordId,
    pub field_id: String,
    /// Forward/reverse labels for the relation, e.g. `["is child of",
    /// "is parent of"]`.
    pub relation_type_vocab: Vec<String>,
}

/// Relationship block carried on a revision: at most one parent link plus
/// any number of sideways links.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<LinkedRelation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked: Option<Vec<LinkedRelation>>,
}

/// Record aggregate root. Created on first write, mutated only by head
/// advancement, never deleted (deletion is a revision flag).
///
/// Invariant: `heads` is a subset of `revisions`, both sorted; `heads` is
/// non-empty for any record that has been written at least once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "_id")]
    pub id: RecordId,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub record_format_version: u32,
    pub created: DateTime<Utc>,
    pub created_by: String,
    /// Every revision id ever attached to this record, sorted.
    pub revisions: Vec<RevisionId>,
    /// Current leaf revisions of the DAG, sorted.
    pub heads: Vec<RevisionId>,
    #[serde(rename = "type")]
    pub record_type: String,
}

impl Record {
    /// `heads ⊆ revisions` with both lists sorted and duplicate-free.
    pub fn invariants_hold(&self) -> bool {
        self.heads.iter().all(|h| self.revisions.contains(h))
            && self.heads.windows(2).all(|w| w[0] < w[1])
            && self.revisions.windows(2).all(|w| w[0] < w[1])
    }
}

/// Immutable snapshot of a record at one point in its history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    #[serde(rename = "_id")]
    pub id: RevisionId,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub revision_format_version: u32,
    /// Field name to AVP id. AVPs are shared across revisions when the
    /// field did not change.
    pub avps: AvpIdMap,
    pub record_id: RecordId,
    /// Zero parents for the root revision, two for a merge.
    pub parents: Vec<RevisionId>,
    pub created: DateTime<Utc>,
    pub created_by: String,
    #[serde(rename = "type")]
    pub record_type: String,
    /// Logical deletion marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<Relationship>,
}

impl Revision {
    pub fn is_deleted(&self) -> bool {
        self.deleted.unwrap_or(false)
    }
}

/// Reference from an AVP to an externalized attachment document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentReference {
    pub attachment_id: AttachmentId,
    pub filename: String,
    pub file_type: String,
}

/// One field's value at the time of a particular revision. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeValuePair {
    #[serde(rename = "_id")]
    pub id: AvpId,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub avp_format_version: u32,
    #[serde(rename = "type")]
    pub avp_type: String,
    /// The field value; `null` when the payload has been externalized into
    /// attachment documents.
    pub data: Value,
    pub revision_id: RevisionId,
    pub record_id: RecordId,
    pub annotations: Value,
    pub created: DateTime<Utc>,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_refs: Option<Vec<AttachmentReference>>,
}

/// Binary payload document owned by a single AVP. Loaded on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "_id")]
    pub id: AttachmentId,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub attachment_format_version: u32,
    pub avp_id: AvpId,
    pub revision_id: RevisionId,
    pub record_id: RecordId,
    pub filename: String,
    pub content_type: String,
    /// Base64-encoded payload.
    pub data: String,
    pub created: DateTime<Utc>,
    pub created_by: String,
}

/// A form snapshot coming in from a caller: the full set of field values
/// for a new revision of a record.
#[derive(Debug, Clone)]
pub struct FormRecord {
    pub record_id: RecordId,
    /// The revision this edit is based on; `None` for a brand-new record.
    pub base_revision_id: Option<RevisionId>,
    pub record_type: String,
    pub data: BTreeMap<String, Value>,
    pub annotations: BTreeMap<String, Value>,
    pub field_types: BTreeMap<String, String>,
    pub updated: DateTime<Utc>,
    pub updated_by: String,
    pub relationship: Option<Relationship>,
}

/// Hydrated field values of one revision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormData {
    pub data: BTreeMap<String, Value>,
    pub annotations: BTreeMap<String, Value>,
    pub types: BTreeMap<String, String>,
}

/// Fully hydrated record data for one revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullRecord {
    pub record_id: RecordId,
    pub revision_id: RevisionId,
    #[serde(rename = "type")]
    pub record_type: String,
    pub data: BTreeMap<String, Value>,
    pub annotations: BTreeMap<String, Value>,
    pub field_types: BTreeMap<String, String>,
    pub created: DateTime<Utc>,
    pub created_by: String,
    pub updated: DateTime<Utc>,
    pub updated_by: String,
    pub deleted: bool,
    pub relationship: Option<Relationship>,
}

/// Summary row for record listings. `hrid` falls back to the record id when
/// the revision carries no HRID field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub record_id: RecordId,
    pub revision_id: RevisionId,
    pub created: DateTime<Utc>,
    pub created_by: String,
    pub updated: DateTime<Utc>,
    pub updated_by: String,
    /// True when the record currently has more than one head.
    pub conflicts: bool,
    pub deleted: bool,
    pub hrid: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub relationship: Option<Relationship>,
}

/// Hydrated view of one field for the manual-merge UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMergeInformation {
    pub data: Value,
    #[serde(rename = "type")]
    pub field_type: String,
    pub annotations: Value,
    pub created: DateTime<Utc>,
    pub created_by: String,
    pub avp_id: AvpId,
}

/// Hydrated view of one head revision for the manual-merge UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMergeInformation {
    pub record_id: RecordId,
    pub revision_id: RevisionId,
    #[serde(rename = "type")]
    pub record_type: String,
    pub updated: DateTime<Utc>,
    pub updated_by: String,
    pub fields: BTreeMap<String, FieldMergeInformation>,
    pub deleted: bool,
    pub relationship: Relationship,
}

/// Summary of one head offered to the manual-merge UI before it picks a
/// side to hydrate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionInitialDetails {
    #[serde(rename = "type")]
    pub record_type: String,
    pub created: DateTime<Utc>,
    pub created_by: String,
    pub deleted: bool,
}

/// Starting state for a manual merge: one fully hydrated head plus a
/// summary of every available head.
#[derive(Debug, Clone)]
pub struct InitialMergeDetails {
    pub initial_head: RevisionId,
    pub initial_head_data: RecordMergeInformation,
    pub available_heads: BTreeMap<RevisionId, RevisionInitialDetails>,
}

/// An operator's resolution of a conflicted record: one AVP choice per
/// field, `None` meaning "neither side" (materialized as a fresh null AVP).
#[derive(Debug, Clone)]
pub struct UserMergeResult {
    pub record_id: RecordId,
    /// The head revisions this resolution supersedes.
    pub parents: Vec<RevisionId>,
    pub updated: DateTime<Utc>,
    pub updated_by: String,
    pub record_type: String,
    pub field_choices: BTreeMap<String, Option<AvpId>>,
    pub field_types: BTreeMap<String, String>,
    pub relationship: Relationship,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> Record {
        Record {
            id: RecordId::from_string("rec-1"),
            rev: None,
            record_format_version: RECORD_FORMAT_VERSION,
            created: Utc::now(),
            created_by: "tester".to_string(),
            revisions: vec![
                RevisionId::from_string("frev-a"),
                RevisionId::from_string("frev-b"),
            ],
            heads: vec![RevisionId::from_string("frev-b")],
            record_type: "Survey".to_string(),
        }
    }

    #[test]
    fn test_record_invariants() {
        let mut record = sample_record();
        assert!(record.invariants_hold());

        record.heads = vec![RevisionId::from_string("frev-z")];
        assert!(!record.invariants_hold());
    }

    #[test]
    fn test_record_json_shape() {
        let record = sample_record();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["_id"], "rec-1");
        assert_eq!(json["record_format_version"], 1);
        assert_eq!(json["type"], "Survey");
        // _rev is omitted for unwritten documents
        assert!(json.get("_rev").is_none());
    }

    #[test]
    fn test_revision_deleted_flag_optional() {
        let json = serde_json::json!({
            "_id": "frev-a",
            "revision_format_version": 1,
            "avps": {},
            "record_id": "rec-1",
            "parents": [],
            "created": "2024-01-01T00:00:00Z",
            "created_by": "tester",
            "type": "Survey",
        });
        let revision: Revision = serde_json::from_value(json).unwrap();
        assert!(!revision.is_deleted());
        assert!(revision.relationship.is_none());
    }
}
