//! Canonical ID types for the overseer core.
//!
//! IDs are opaque String wrappers (serde-transparent). The default generation
//! strategy is UUID v4; anything that round-trips as a string is accepted, so
//! clients may supply their own correlation identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new_uuid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Unique identifier for a supervisor or worker run.
    RunId
);
typed_id!(
    /// Unique identifier for a single trace event.
    EventId
);
typed_id!(
    /// Unique identifier for a worker group (one fan-out cohort).
    GroupId
);
typed_id!(
    /// Stable spawn identifier for a worker within its group.
    WorkerId
);
typed_id!(
    /// Unique identifier for one tool invocation.
    ToolCallId
);
typed_id!(
    /// Client-originated identifier linking all events of one user
    /// interaction across run boundaries.
    CorrelationId
);

/// Monotonic sequence number within a run. Assigned by the trace store and
/// used for stream resumption.
pub type SeqNo = u64;
