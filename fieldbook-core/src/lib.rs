//! Fieldbook Core Library
//!
//! Offline-first record storage for field data collection:
//! - Persisted document model (records, revisions, AVPs, attachments)
//! - Document store abstraction with optimistic-concurrency safe writes
//! - In-memory store for tests
//! - Repository operations (create, revise, hydrate, list, delete)
//! - Attachment externalization driven by a field-type registry
//! - Pairwise three-way merge engine with manual-merge support
//!
//! Every record is an append-only DAG of immutable revisions replicated
//! between devices; concurrent edits surface as multiple heads that the
//! merge engine reduces, or an operator resolves, back to one.

pub mod attachments;
pub mod context;
pub mod error;
pub mod ident;
pub mod memory;
pub mod merge;
pub mod repository;
pub mod store;
pub mod types;

pub use attachments::{FILES_TYPE, FileAttachmentHandler, dump_avp, load_avp};
pub use context::{
    DataContext, DatabaseResolver, FieldTypeHandler, IdentityHandler, TokenContents, TypeRegistry,
};
pub use error::{DataError, Result};
pub use ident::{AttachmentId, AvpId, RecordId, RevisionId};
pub use memory::MemoryStore;
pub use merge::{
    MergeResult, MergeState, RevisionCache, find_conflicting_fields,
    get_initial_merge_details, get_merge_information_for_head, merge_heads, merge_revisions,
    save_user_merge_result,
};
pub use store::{
    AllDocsOptions, DEFAULT_WRITE_ATTEMPTS, DocRow, DocumentStore, JsonDoc, PutResult,
    safe_write,
};
pub use types::{
    Attachment, AttachmentReference, AttributeValuePair, AvpIdMap, FieldMergeInformation,
    FormData, FormRecord, FullRecord, InitialMergeDetails, LinkedRelation, Record,
    RecordMergeInformation, RecordMetadata, Relationship, Revision, RevisionInitialDetails,
    UserMergeResult,
};
