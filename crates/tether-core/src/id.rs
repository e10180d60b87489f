//! Strongly-typed identifiers for tether entities.
//!
//! All identifiers are:
//! - **Strongly typed**: A `TaskId` can never be passed where a
//!   `TransactionId` is expected
//! - **Lexicographically sortable**: ULIDs encode creation time and sort
//!   naturally
//! - **Globally unique**: No coordination required for generation
//!
//! Callers outside the engine only ever hold these opaque ids; the engine
//! registries own the records they name.
//!
//! # Example
//!
//! ```rust
//! use tether_core::id::{TaskId, TransactionId};
//!
//! let task = TaskId::generate();
//! let tx = TransactionId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: TaskId = tx;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique identifier.
            ///
            /// Uses ULID generation which is lexicographically sortable by
            /// creation time and globally unique without coordination.
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Creates an identifier from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the creation timestamp encoded in the ID.
            #[must_use]
            pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(0);
                chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
            }

            /// Returns a short prefix of the ID suitable for log lines and
            /// generated display names.
            #[must_use]
            pub fn short(&self) -> String {
                let s = self.0.to_string();
                s[..8.min(s.len())].to_ascii_lowercase()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!(concat!("invalid ", $label, " ID '{}': {}"), s, e),
                })
            }
        }
    };
}

entity_id!(
    /// A unique identifier for a queued task.
    ///
    /// Tasks are the unit of asynchronous work: submitted from any thread,
    /// executed once on the host's apply thread.
    TaskId,
    "task"
);

entity_id!(
    /// A unique identifier for a single command invocation.
    ///
    /// Every pass through the dispatch pipeline gets its own command id,
    /// so retried or repeated invocations remain distinguishable in the
    /// execution history.
    CommandId,
    "command"
);

entity_id!(
    /// A unique identifier for a transaction.
    ///
    /// Transactions are ordered command batches executed as a unit with
    /// optional snapshot rollback.
    TransactionId,
    "transaction"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_roundtrip() {
        let id = TaskId::generate();
        let s = id.to_string();
        let parsed: TaskId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn transaction_id_roundtrip() {
        let id = TransactionId::generate();
        let s = id.to_string();
        let parsed: TransactionId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_are_unique() {
        let id1 = CommandId::generate();
        let id2 = CommandId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn invalid_id_returns_error() {
        let result: Result<TaskId> = "not-a-valid-ulid".parse();
        assert!(result.is_err());
    }

    #[test]
    fn short_prefix_is_eight_chars() {
        let id = TaskId::generate();
        assert_eq!(id.short().len(), 8);
    }
}
