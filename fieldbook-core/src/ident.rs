//! Typed document identifiers
//!
//! Every persisted document carries a string identifier with a fixed prefix
//! that doubles as a cheap discriminant: `rec-` for records, `frev-` for
//! revisions, `avp-` for attribute-value-pairs and `att-` for attachments.
//! The generated suffix is a random v4 UUID. These prefixes are part of the
//! wire format and must never change.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix for record document ids.
pub const RECORD_PREFIX: &str = "rec-";
/// Prefix for revision document ids.
pub const REVISION_PREFIX: &str = "frev-";
/// Prefix for attribute-value-pair document ids.
pub const AVP_PREFIX: &str = "avp-";
/// Prefix for attachment document ids.
pub const ATTACHMENT_PREFIX: &str = "att-";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh identifier with the standard prefix.
            pub fn generate() -> Self {
                Self(format!("{}{}", $prefix, uuid::Uuid::new_v4()))
            }

            /// Wrap an existing identifier string as read from storage.
            pub fn from_string(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// The raw identifier string.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier carries the expected prefix.
            pub fn has_valid_prefix(&self) -> bool {
                self.0.starts_with($prefix)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a record aggregate (`rec-` prefix).
    RecordId,
    RECORD_PREFIX
);
string_id!(
    /// Identifier of an immutable revision (`frev-` prefix).
    RevisionId,
    REVISION_PREFIX
);
string_id!(
    /// Identifier of an attribute-value-pair (`avp-` prefix).
    AvpId,
    AVP_PREFIX
);
string_id!(
    /// Identifier of an attachment document (`att-` prefix).
    AttachmentId,
    ATTACHMENT_PREFIX
);
