//! # Domain Types for WatchDB
//!
//! Core types shared across the crate: revisions, raw storage rows, and
//! the notification records that travel from the writer to live watchers.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Revisions are wrapped in a newtype rather than passed as bare `i64`.
//! Function signatures then document themselves, and a revision cannot be
//! confused with a timestamp or a row count.
//!
//! ## Invariants
//!
//! - [`Revision`] values come from a single database sequence shared by
//!   all collections. They strictly increase in commit order and are
//!   never reused.
//! - A row's `created_rev` is assigned once, on insert, and never changes;
//!   `updated_rev` changes on every write to the row.
//! - Each committed mutation produces exactly one [`Notification`] per
//!   affected key, carrying that mutation's revision.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Channel name prefix shared by every collection.
///
/// The notification channel for collection `C` is `pach.C`. The prefix is
/// part of the external protocol and must not change.
pub const CHANNEL_PREFIX: &str = "pach.";

/// Returns the notification channel name for a collection.
pub fn channel_for(collection: &str) -> String {
    format!("{CHANNEL_PREFIX}{collection}")
}

/// Returns the current time in milliseconds since the Unix epoch.
pub(crate) fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as u64
}

// =============================================================================
// Revision
// =============================================================================

/// A global write revision.
///
/// Every mutating statement draws the next value from the shared revision
/// sequence, so revisions totally order writes across all collections.
/// Watchers use them to deduplicate the overlap between an initial
/// snapshot and the live tail: an event whose revision is at or below the
/// snapshot cutoff is already reflected in the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(i64);

impl Revision {
    /// Zero revision: sorts before every real revision. Used as the
    /// cutoff of a snapshot taken before any write.
    pub const NONE: Revision = Revision(0);

    /// Wraps a raw sequence value.
    pub fn from_raw(value: i64) -> Self {
        Revision(value)
    }

    /// Returns the raw sequence value.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Storage Rows
// =============================================================================

/// A raw row as stored in a collection's row table.
///
/// The value is the record's encoded bytes; typed decoding happens in the
/// collection layer. Readers hand these back so the reader pool stays
/// generic over record types.
#[derive(Debug, Clone)]
pub struct RowEntry {
    /// Primary key, unique within the collection.
    pub key: String,
    /// Encoded record bytes.
    pub value: Vec<u8>,
    /// Revision assigned when the row was first inserted.
    pub created_rev: Revision,
    /// Revision assigned by the most recent write.
    pub updated_rev: Revision,
}

// =============================================================================
// Notifications
// =============================================================================

/// The kind of change a notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationOp {
    /// The row was inserted or replaced.
    Put,
    /// The row was removed.
    Delete,
}

/// A change notification, written to the outbox in the same transaction
/// as the mutation it describes and routed to subscribers after commit.
///
/// ## Wire format
///
/// The outbox payload is JSON: `{"op", "key", "ts", "rev", "value"?,
/// "indexes"?}`. The record's JSON is inlined in `value` when it fits
/// under the configured payload limit; oversized values are omitted and
/// watchers back-read the row. `indexes` maps index name to the row's
/// index value so index-filtered watchers can decide membership without a
/// database round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// What happened to the row.
    pub op: NotificationOp,
    /// The affected key.
    pub key: String,
    /// Milliseconds since epoch at write time.
    pub ts: u64,
    /// Revision assigned to this write.
    pub rev: Revision,
    /// Inline record JSON, if it fit under the payload limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Index name → index value for the affected row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexes: Option<std::collections::BTreeMap<String, String>>,
}

impl Notification {
    /// Serializes the notification for the outbox.
    pub(crate) fn to_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parses an outbox payload.
    pub(crate) fn from_payload(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

// =============================================================================
// Tests
// =============================================================================
