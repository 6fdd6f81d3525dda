//! # Write Transactions
//!
//! All writes go through a single dedicated thread that owns the sole
//! read-write connection. Async callers hand it a whole transaction (a
//! closure over a [`WriteTxn`]) and await the outcome:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Async Tasks                           │
//! │   db.write(|txn| { ... })  ──┐                               │
//! │   db.write(|txn| { ... })  ──┼── tokio mpsc ──► oneshot ◄──┐ │
//! └──────────────────────────────┼─────────────────────────────┼─┘
//!                                ▼                             │
//!                     ┌─────────────────────┐                  │
//!                     │   Writer Thread     │──────────────────┘
//!                     │                     │
//!                     │  BEGIN IMMEDIATE    │
//!                     │  closure(&mut txn)  │
//!                     │  COMMIT / ROLLBACK  │──► outbox signal
//!                     └─────────────────────┘
//! ```
//!
//! Serializing writes through one connection gives three properties at
//! once: transactions observe program order, `BEGIN IMMEDIATE` never
//! deadlocks against another in-process writer, and the revision sequence
//! is bumped without contention.
//!
//! ## Retry Semantics
//!
//! A busy/locked failure (an external process holding the file lock)
//! retries the whole closure with exponential backoff, up to a bounded
//! attempt count, then surfaces `Conflict`. The closure therefore must be
//! effect-free outside the transaction: it may run more than once.
//! Errors other than busy/locked, including any error returned by the
//! closure itself, roll back immediately and are returned unchanged.
//!
//! ## Notifications
//!
//! Mutations append their notification records to the outbox table inside
//! the open transaction, so a rollback discards them with everything
//! else. After a successful commit the writer nudges the listener's drain
//! thread; the committed outbox rows are the hand-off.

use std::thread::JoinHandle;

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::api::Config;
use crate::error::{Error, Result};
use crate::reader;
use crate::schema;
use crate::types::{Notification, Revision};

/// A transaction body, boxed for transport to the writer thread.
///
/// `FnMut` rather than `FnOnce`: the writer may re-run the body when the
/// database is busy.
pub(crate) type TxnFn = Box<dyn for<'t> FnMut(&mut WriteTxn<'t>) -> Result<()> + Send>;

// =============================================================================
// Write Transaction
// =============================================================================

/// An open write transaction.
///
/// Handed to transaction closures; collections borrow it to produce
/// read-write handles. All reads through it see the transaction's own
/// uncommitted writes.
pub struct WriteTxn<'t> {
    conn: &'t Connection,
    payload_value_limit: usize,
}

impl<'t> WriteTxn<'t> {
    pub(crate) fn conn(&self) -> &'t Connection {
        self.conn
    }

    /// Largest encoded record that still gets inlined into notification
    /// payloads.
    pub(crate) fn payload_value_limit(&self) -> usize {
        self.payload_value_limit
    }

    /// Draws the next value from the global revision sequence.
    ///
    /// Runs inside the open transaction, so a rollback also returns the
    /// revision: committed revisions have no gaps in commit order.
    pub(crate) fn next_rev(&self) -> Result<Revision> {
        self.conn
            .execute("UPDATE watch_rev_seq SET rev = rev + 1", [])?;
        reader::current_rev(self.conn)
    }

    /// Appends a notification record to the outbox, inside the open
    /// transaction.
    pub(crate) fn append_outbox(&self, channel: &str, notification: &Notification) -> Result<()> {
        let payload = notification.to_payload()?;
        self.conn.execute(
            "INSERT INTO watch_outbox (channel, payload) VALUES (?1, ?2)",
            rusqlite::params![channel, payload],
        )?;
        Ok(())
    }
}

// =============================================================================
// Requests and Handle
// =============================================================================

/// A request processed by the writer thread.
pub(crate) enum WriteRequest {
    /// Run a transaction closure to commit or rollback.
    Txn {
        work: TxnFn,
        resp: oneshot::Sender<Result<()>>,
    },
    /// Create the tables for a newly registered collection.
    Register {
        collection: String,
        indexes: Vec<String>,
        resp: oneshot::Sender<Result<()>>,
    },
    /// Exit the writer loop.
    Shutdown,
}

/// Async handle to the writer thread. Cheap to clone.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriterHandle {
    /// Submits a transaction closure and awaits commit or rollback.
    pub(crate) async fn transact(&self, work: TxnFn) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(WriteRequest::Txn { work, resp })
            .await
            .map_err(|_| Error::Fatal("writer is shut down".to_string()))?;
        rx.await
            .map_err(|_| Error::Fatal("writer dropped a transaction".to_string()))?
    }

    /// Creates the tables backing a collection.
    pub(crate) async fn register(&self, collection: String, indexes: Vec<String>) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(WriteRequest::Register {
                collection,
                indexes,
                resp,
            })
            .await
            .map_err(|_| Error::Fatal("writer is shut down".to_string()))?;
        rx.await
            .map_err(|_| Error::Fatal("writer dropped a registration".to_string()))?
    }

    /// Asks the writer thread to exit once queued requests are served.
    pub(crate) async fn shutdown(&self) {
        let _ = self.tx.send(WriteRequest::Shutdown).await;
    }
}

// =============================================================================
// Writer Thread
// =============================================================================

/// Spawns the writer thread over an initialized connection.
///
/// `outbox_signal` is nudged after every successful commit so the
/// listener drains the outbox promptly rather than on its poll interval.
pub(crate) fn spawn_writer(
    conn: Connection,
    config: Config,
    outbox_signal: std::sync::mpsc::Sender<()>,
) -> Result<(WriterHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(config.write_queue_depth);

    let handle = std::thread::Builder::new()
        .name("watchdb-writer".to_string())
        .spawn(move || run_writer(conn, rx, config, outbox_signal))
        .map_err(|e| Error::Fatal(format!("failed to spawn writer thread: {e}")))?;

    Ok((WriterHandle { tx }, handle))
}

fn run_writer(
    conn: Connection,
    mut rx: mpsc::Receiver<WriteRequest>,
    config: Config,
    outbox_signal: std::sync::mpsc::Sender<()>,
) {
    debug!("writer started");
    while let Some(request) = rx.blocking_recv() {
        match request {
            WriteRequest::Txn { mut work, resp } => {
                let result = execute_txn(&conn, &mut work, &config);
                let committed = result.is_ok();
                let _ = resp.send(result);
                if committed {
                    // Listener gone just means nobody is watching.
                    let _ = outbox_signal.send(());
                }
            }
            WriteRequest::Register {
                collection,
                indexes,
                resp,
            } => {
                let index_refs: Vec<&str> = indexes.iter().map(String::as_str).collect();
                let result = schema::create_collection_tables(&conn, &collection, &index_refs);
                let _ = resp.send(result);
            }
            WriteRequest::Shutdown => break,
        }
    }
    debug!("writer stopped");
}

/// Runs one transaction closure with busy retries.
fn execute_txn(conn: &Connection, work: &mut TxnFn, config: &Config) -> Result<()> {
    let mut backoff = config.busy_backoff;
    for attempt in 0..=config.busy_retries {
        match run_once(conn, work, config) {
            Err(e) if e.is_retryable_write() => {
                if attempt == config.busy_retries {
                    warn!(attempt, "write transaction still busy; giving up");
                    return Err(Error::Conflict);
                }
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, "write busy; retrying");
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(config.busy_backoff_max);
            }
            other => return other,
        }
    }
    // The loop always returns from within.
    Err(Error::Conflict)
}

fn run_once(conn: &Connection, work: &mut TxnFn, config: &Config) -> Result<()> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let mut txn = WriteTxn {
        conn,
        payload_value_limit: config.payload_value_limit,
    };
    match work(&mut txn) {
        Ok(()) => match conn.execute_batch("COMMIT") {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e.into())
            }
        },
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
