//! Error taxonomy for the data layer
//!
//! Structural problems (missing documents, broken invariants, incomplete
//! migration paths) are errors. An unmergeable pair of heads is NOT an
//! error: the merge engine reports it as a `no_merge` result because it is
//! a normal, user-actionable condition.

use crate::ident::{RecordId, RevisionId};

/// Result type for data-layer operations.
pub type Result<T> = std::result::Result<T, DataError>;

/// Errors that can occur in the repository, merge and migration layers.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// The document does not exist in the store.
    #[error("document not found: {0}")]
    NotFound(String),

    /// The document exists but lacks the expected type discriminant.
    #[error("document {id} is not a {expected} document")]
    TypeMismatch { id: String, expected: &'static str },

    /// Optimistic-concurrency conflict (stale revision token). Retryable.
    #[error("write conflict on document {0}")]
    Conflict(String),

    /// The merge base search exhausted both ancestries without a match.
    #[error("no shared revision between {us} and {them}")]
    NoSharedRevision { us: RevisionId, them: RevisionId },

    /// The two heads have differing record types; type changes are not
    /// mergeable.
    #[error("merging revisions with differing types is unsupported ({us} vs {them})")]
    UnsupportedMerge { us: String, them: String },

    /// `is_successful` was read from a merge result before any transition.
    #[error("merge was not attempted")]
    MergeNotAttempted,

    /// Delete/undelete require a single head; the caller must pick one.
    #[error("record {0} has multiple heads, a specific head must be chosen")]
    TooManyHeads(RecordId),

    /// The migration registry cannot produce a chain from the current
    /// version to the target, or the stored version is ahead of the target.
    #[error("migration path error: {0}")]
    MigrationPath(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Document store backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl DataError {
    /// Whether a retry with a refreshed revision token may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DataError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DataError::NotFound(_))
    }
}
