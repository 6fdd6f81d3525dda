//! # Error Handling for WatchDB
//!
//! A single error enum ([`Error`]) covers every failure mode in the crate,
//! which keeps call sites uniform: most callers either propagate with `?`
//! or match on one of the structured variants.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical response |
//! |----------|----------|------------------|
//! | Lookup | `NotFound`, `Exists` | Handle in business logic |
//! | Contention | `Conflict` | Retry the whole transaction |
//! | Watch stream | `Canceled`, `Overflow`, `Reconnect` | Re-issue the watch |
//! | Internal | `Sqlite`, `Encoding`, `Fatal` | Log and investigate |
//! | Caller-defined | `User` | Propagated unchanged |
//!
//! Every variant maps to a stable wire-level code via [`Error::code`], so
//! RPC layers can translate errors without string matching.
//!
//! ## The `Break` Sentinel
//!
//! Iteration callbacks (`list`, `watch_f` and friends) stop cleanly by
//! returning [`Error::Break`]. The iterating function swallows the
//! sentinel and returns `Ok`; any other error aborts iteration and is
//! surfaced (and, inside a transaction, rolls the transaction back).
//! `Break` itself never escapes to callers.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in WatchDB operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested key does not exist in the collection.
    ///
    /// Returned by `get`, `update`, and `delete`. Inside a transaction
    /// this aborts and rolls back the transaction unless the caller
    /// handles it.
    #[error("{collection}: key '{key}' not found")]
    NotFound {
        /// Collection that was queried.
        collection: String,
        /// Key that was not present.
        key: String,
    },

    /// A `create` targeted a key that already exists.
    ///
    /// State is unchanged: the failed insert is rolled back with the
    /// enclosing transaction.
    #[error("{collection}: key '{key}' already exists")]
    Exists {
        /// Collection that was written.
        collection: String,
        /// Key that was already present.
        key: String,
    },

    /// The write could not be committed after exhausting retries.
    ///
    /// The writer retries busy/locked failures with backoff before
    /// surfacing this. Seeing it means something outside this process is
    /// holding the database write lock persistently.
    #[error("write conflict: transaction retries exhausted")]
    Conflict,

    /// The operation's cancellation token fired.
    ///
    /// For watchers this is a terminal stream event: it is delivered
    /// exactly once and no further events follow.
    #[error("operation canceled")]
    Canceled,

    /// A watcher fell too far behind and its event buffer overflowed.
    ///
    /// The buffer was discarded and the subscription removed; intermediate
    /// events are unrecoverable. Re-watching starts over from a fresh
    /// snapshot. Other watchers are unaffected.
    #[error("watcher overflowed its event buffer")]
    Overflow,

    /// The notification listener lost its connection.
    ///
    /// The listener reconnects on its own, but events may have been
    /// missed in the gap, so every live watcher is terminated with this
    /// error. Re-watching re-snapshots and resumes.
    #[error("notification listener reconnected; re-watch to resume")]
    Reconnect,

    /// An underlying SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A record failed to encode or decode.
    ///
    /// Stored bytes that no longer match the record type indicate either
    /// corruption or an incompatible schema change; both are fatal for
    /// the affected row.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// An invariant violation that is not recoverable by retrying.
    ///
    /// Examples: registering two collections under one name, an invalid
    /// collection identifier, an index referencing a field the record
    /// does not have.
    #[error("fatal: {0}")]
    Fatal(String),

    /// An error returned by a caller-supplied callback.
    ///
    /// Transaction bodies, `update`/`upsert` mutators, and `list`/`watch`
    /// callbacks may fail with their own error types; those are carried
    /// here unchanged (and abort the enclosing transaction). Use
    /// [`Error::downcast_user`] to recover the original type.
    #[error("{0}")]
    User(Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Sentinel for ending iteration early. Never surfaced to callers.
    #[error("iteration stopped")]
    Break,
}

impl Error {
    /// Wraps a caller-defined error for propagation through WatchDB.
    pub fn user<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::User(Box::new(err))
    }

    /// Returns the wrapped caller error if this is `User` of type `E`.
    pub fn downcast_user<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Error::User(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// True if this is a `NotFound` error (for any collection/key).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True if this is an `Exists` error (for any collection/key).
    pub fn is_exists(&self) -> bool {
        matches!(self, Error::Exists { .. })
    }

    /// Stable wire-level code for this error.
    ///
    /// These strings are part of the external interface and must not
    /// change between releases.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::Exists { .. } => "exists",
            Error::Conflict => "conflict",
            Error::Canceled => "canceled",
            Error::Overflow => "overflow",
            Error::Reconnect => "reconnect",
            Error::Sqlite(_) | Error::Encoding(_) | Error::Fatal(_) => "fatal",
            Error::User(_) => "user",
            Error::Break => "break",
        }
    }

    /// True for errors the writer may transparently retry.
    pub(crate) fn is_retryable_write(&self) -> bool {
        match self {
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

// Watch events are cloneable, and terminal errors ride inside them. The
// wrapped source errors (`rusqlite`, caller-defined) are not `Clone`, so
// cloning maps those to a `Fatal` carrying their message; the structured
// variants clone losslessly.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::NotFound { collection, key } => Error::NotFound {
                collection: collection.clone(),
                key: key.clone(),
            },
            Error::Exists { collection, key } => Error::Exists {
                collection: collection.clone(),
                key: key.clone(),
            },
            Error::Conflict => Error::Conflict,
            Error::Canceled => Error::Canceled,
            Error::Overflow => Error::Overflow,
            Error::Reconnect => Error::Reconnect,
            Error::Fatal(msg) => Error::Fatal(msg.clone()),
            Error::Break => Error::Break,
            other => Error::Fatal(other.to_string()),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("app-level failure")]
    struct AppError;

    #[test]
    fn test_error_display() {
        let not_found = Error::NotFound {
            collection: "items".to_string(),
            key: "42".to_string(),
        };
        assert_eq!(not_found.to_string(), "items: key '42' not found");

        let exists = Error::Exists {
            collection: "items".to_string(),
            key: "42".to_string(),
        };
        assert_eq!(exists.to_string(), "items: key '42' already exists");
    }

    #[test]
    fn test_predicates() {
        let not_found = Error::NotFound {
            collection: "items".to_string(),
            key: "a".to_string(),
        };
        assert!(not_found.is_not_found());
        assert!(!not_found.is_exists());

        let exists = Error::Exists {
            collection: "items".to_string(),
            key: "a".to_string(),
        };
        assert!(exists.is_exists());
        assert!(!exists.is_not_found());
    }

    #[test]
    fn test_wire_codes_are_stable() {
        assert_eq!(
            Error::NotFound {
                collection: String::new(),
                key: String::new()
            }
            .code(),
            "not_found"
        );
        assert_eq!(Error::Conflict.code(), "conflict");
        assert_eq!(Error::Canceled.code(), "canceled");
        assert_eq!(Error::Overflow.code(), "overflow");
        assert_eq!(Error::Reconnect.code(), "reconnect");
        assert_eq!(Error::Fatal(String::new()).code(), "fatal");
    }

    #[test]
    fn test_user_error_round_trip() {
        let err = Error::user(AppError);
        assert_eq!(err.to_string(), "app-level failure");
        assert!(err.downcast_user::<AppError>().is_some());
        assert!(err.downcast_user::<std::fmt::Error>().is_none());
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("p".to_string());
        let err: Error = sqlite_err.into();
        assert!(matches!(err, Error::Sqlite(_)));
        assert_eq!(err.code(), "fatal");
    }

    #[test]
    fn test_busy_is_retryable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(Error::from(busy).is_retryable_write());

        let misuse = rusqlite::Error::InvalidQuery;
        assert!(!Error::from(misuse).is_retryable_write());
    }
}
