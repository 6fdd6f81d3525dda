//! # WatchDB - Transactional Watchable Collections
//!
//! WatchDB gives higher layers a uniform, strongly-consistent, typed
//! key/value interface over SQLite with:
//!
//! - **Typed collections**: serde-encoded records behind opaque rows
//! - **Atomic transactions**: closures spanning any number of collections
//! - **Live watches**: snapshot-then-tail event streams per collection,
//!   per key, or per secondary-index value
//! - **Secondary indexes**: named field indexes kept consistent with
//!   every write, queryable and watchable
//! - **Deterministic ordering**: a global revision sequence totally
//!   orders writes; watch streams deliver in commit order
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Async API Layer                         │
//! │           (collections, transactions, watches)                  │
//! └───────────┬─────────────────────┬───────────────────┬───────────┘
//!             │                     │                   │
//!             ▼                     ▼                   ▼
//! ┌──────────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │  Writer Thread   │   │   Reader Pool    │   │  Listener Thread │
//! │ (single thread,  │   │ (N threads, one  │   │ (drains outbox,  │
//! │  owns rw conn,   │   │  read-only conn  │   │  fans out to     │
//! │  runs closures)  │   │  each)           │   │  watchers)       │
//! └────────┬─────────┘   └────────┬─────────┘   └────────┬─────────┘
//!          │                      │                      │
//!          ▼                      ▼                      ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          SQLite (WAL)                           │
//! │        row tables · index tables · rev sequence · outbox        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Single writer**: all mutations serialize through one connection
//! 2. **Revision order**: the global revision strictly increases and is
//!    never reused; notification order matches commit order
//! 3. **Atomic notification**: a mutation's notification commits with it
//!    (same transaction) or not at all
//! 4. **Gap-free watches**: between a watcher's snapshot cutoff and its
//!    close, every matching committed change is delivered, or the
//!    watcher ends with a terminal error
//! 5. **Index consistency**: index tables always agree with their row
//!    table within any committed state
//!
//! ## Module Organization
//!
//! - [`error`]: the error taxonomy and wire-level codes
//! - [`types`]: revisions, raw rows, notification records
//! - [`record`]: the [`Record`] trait and codec
//! - [`options`]: list sort options
//! - `schema`: DDL and database initialization (internal)
//! - `reader`: direct row reads and the reader pool (internal)
//! - [`writer`]: the write actor and [`WriteTxn`]
//! - `listener`: notification fan-out (internal)
//! - [`collection`]: typed collection facades
//! - [`watch`]: watcher state machine and events
//! - [`api`]: the [`WatchDb`] entry point and [`Config`]

pub mod api;
pub mod collection;
pub mod error;
mod listener;
pub mod options;
mod reader;
pub mod record;
mod schema;
pub mod types;
pub mod watch;
pub mod writer;

pub use api::{Config, WatchDb};
pub use collection::{Collection, IndexSpec, ReadOnlyCollection, ReadWriteCollection};
pub use error::{Error, Result};
pub use options::{Options, SortOrder, SortTarget};
pub use record::Record;
pub use types::{channel_for, Notification, NotificationOp, Revision};
pub use watch::{WatchEvent, Watcher};
pub use writer::WriteTxn;

// Watch and transaction cancellation uses the tokio-util token; re-export
// it so callers don't need the extra dependency line.
pub use tokio_util::sync::CancellationToken;
