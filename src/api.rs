//! # WatchDB Handle
//!
//! The public entry point. Opening a database spawns the three moving
//! parts and wires them together; the returned [`WatchDb`] is a cheap
//! clone-and-share handle over all of them.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                           Async Tasks                              │
//! │        write(|txn| …)        get / list / count        watch       │
//! └───────────┬──────────────────────────┬───────────────────┬─────────┘
//!             ▼                          ▼                   ▼
//!     ┌──────────────┐          ┌─────────────────┐   ┌─────────────┐
//!     │ Writer Thread│          │   Reader Pool   │   │  Listener   │
//!     │  (1 thread,  │─ commit ─│  (N threads,    │   │ (1 thread,  │
//!     │   rw conn)   │  signal  │   ro conns)     │   │  rw conn)   │
//!     └──────┬───────┘     │    └────────┬────────┘   └──────┬──────┘
//!            │             └─────────────┼───────────────────┘
//!            ▼                           ▼
//!     ┌──────────────────────────────────────────────┐
//!     │                 SQLite (WAL)                 │
//!     │   coll_* tables · rev sequence · outbox      │
//!     └──────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use watchdb::{WatchDb, IndexSpec, Options};
//!
//! let db = WatchDb::open("state.db").await?;
//! let repos = db
//!     .collection::<RepoInfo>("repos", vec![IndexSpec::on_field("owner")])
//!     .await?;
//!
//! // Transactions span collections and roll back on any error.
//! let handle = repos.clone();
//! db.write(move |txn| {
//!     let repos = handle.read_write(txn);
//!     repos.put("images", &RepoInfo::new("images", "alice"))?;
//!     Ok(())
//! })
//! .await?;
//!
//! // Reads and watches run against committed state.
//! let ro = repos.read_only();
//! let info = ro.get("images").await?;
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::collection::{Collection, CollectionSpec, IndexSpec};
use crate::error::{Error, Result};
use crate::listener::{self, ListenerHandle};
use crate::reader::{self, ReaderHandle};
use crate::record::Record;
use crate::schema::{self, DbLocation};
use crate::writer::{self, TxnFn, WriteTxn, WriterHandle};

// =============================================================================
// Configuration
// =============================================================================

/// Tunables for one database instance. `Config::default()` is sized for
/// typical metadata workloads.
#[derive(Debug, Clone)]
pub struct Config {
    /// Depth of the write request channel.
    pub write_queue_depth: usize,

    /// Reader pool size; `0` picks from the host's parallelism.
    pub reader_threads: usize,

    /// Depth of the shared read request channel.
    pub read_queue_depth: usize,

    /// Per-watcher staging buffer depth. A watcher that falls this many
    /// events behind is terminated with `Overflow`.
    pub watch_buffer_depth: usize,

    /// Rows fetched per page during `list` scans.
    pub list_batch_size: usize,

    /// Largest encoded record inlined into notification payloads; larger
    /// values make watchers back-read the row.
    pub payload_value_limit: usize,

    /// Busy/locked retry attempts before a write fails `Conflict`.
    pub busy_retries: u32,

    /// Initial backoff between busy retries; doubles per attempt.
    pub busy_backoff: Duration,

    /// Backoff ceiling for busy retries and listener reconnects.
    pub busy_backoff_max: Duration,

    /// How often the listener polls the outbox absent a commit signal.
    pub drain_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            write_queue_depth: 1024,
            reader_threads: 0,
            read_queue_depth: 4096,
            watch_buffer_depth: 1000,
            list_batch_size: 1000,
            payload_value_limit: 7 * 1024,
            busy_retries: 10,
            busy_backoff: Duration::from_millis(5),
            busy_backoff_max: Duration::from_millis(500),
            drain_poll_interval: Duration::from_millis(100),
        }
    }
}

impl Config {
    fn resolved_reader_threads(&self) -> usize {
        if self.reader_threads > 0 {
            return self.reader_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .clamp(2, 8)
    }
}

// =============================================================================
// WatchDb
// =============================================================================

/// The main handle. `Clone`, `Send`, and `Sync`; all clones share the
/// same writer, reader pool, and listener.
#[derive(Clone)]
pub struct WatchDb {
    inner: Arc<DbInner>,
}

struct DbInner {
    config: Config,
    writer: WriterHandle,
    reader: ReaderHandle,
    listener: ListenerHandle,
    shutdown: CancellationToken,
    registered: Mutex<HashSet<String>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    reader_thread_count: usize,
}

impl WatchDb {
    /// Opens (creating if needed) a database file with default
    /// configuration.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_location(DbLocation::file(path), Config::default())
    }

    /// Opens a database file with explicit configuration.
    pub async fn open_with_config(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        Self::open_location(DbLocation::file(path), config)
    }

    /// Opens a fresh in-memory database. Intended for tests; contents are
    /// lost on shutdown.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open_location(DbLocation::memory(), Config::default())
    }

    fn open_location(location: DbLocation, config: Config) -> Result<Self> {
        // The writer's connection is opened first: it initializes the
        // schema and, for in-memory databases, anchors the shared cache.
        let conn = location.connect()?;
        schema::initialize(&conn)?;

        let shutdown = CancellationToken::new();
        let (signal_tx, signal_rx) = std::sync::mpsc::channel();

        let (listener, listener_thread) =
            listener::spawn_listener(&location, &config, signal_rx, shutdown.clone())?;
        let (writer, writer_thread) = writer::spawn_writer(conn, config.clone(), signal_tx)?;
        let reader_thread_count = config.resolved_reader_threads();
        let (reader, reader_threads) =
            reader::spawn_readers(&location, reader_thread_count, config.read_queue_depth)?;

        let mut threads = vec![writer_thread, listener_thread];
        threads.extend(reader_threads);

        info!(readers = reader_thread_count, "watchdb open");
        Ok(WatchDb {
            inner: Arc::new(DbInner {
                config,
                writer,
                reader,
                listener,
                shutdown,
                registered: Mutex::new(HashSet::new()),
                threads: Mutex::new(threads),
                reader_thread_count,
            }),
        })
    }

    /// Registers a typed collection, creating its row and index tables if
    /// they do not exist yet.
    ///
    /// Collection names are unique per database handle; registering a
    /// name twice is a `Fatal` error.
    pub async fn collection<R: Record>(
        &self,
        name: &str,
        indexes: Vec<IndexSpec>,
    ) -> Result<Collection<R>> {
        let spec = CollectionSpec {
            name: name.to_string(),
            indexes,
        };
        spec.validate()?;

        {
            let mut registered = self
                .inner
                .registered
                .lock()
                .expect("collection registry poisoned");
            if !registered.insert(spec.name.clone()) {
                return Err(Error::Fatal(format!(
                    "collection '{}' is already registered",
                    spec.name
                )));
            }
        }

        let index_names: Vec<String> = spec
            .indexes
            .iter()
            .map(|index| index.name.clone())
            .collect();
        if let Err(e) = self
            .inner
            .writer
            .register(spec.name.to_string(), index_names)
            .await
        {
            self.inner
                .registered
                .lock()
                .expect("collection registry poisoned")
                .remove(&spec.name);
            return Err(e);
        }

        debug!(collection = %spec.name, "collection registered");
        Ok(Collection::new(
            Arc::new(spec),
            self.inner.reader.clone(),
            self.inner.listener.clone(),
            self.inner.config.list_batch_size,
        ))
    }

    /// Runs a transaction: the closure's collection operations commit
    /// atomically if it returns `Ok`, and roll back (emitting no
    /// notifications) if it returns any error.
    ///
    /// The closure may run more than once when the database is busy; it
    /// must be effect-free outside the transaction.
    pub async fn write<F>(&self, body: F) -> Result<()>
    where
        F: for<'t> FnMut(&mut WriteTxn<'t>) -> Result<()> + Send + 'static,
    {
        self.inner.writer.transact(Box::new(body) as TxnFn).await
    }

    /// Like [`WatchDb::write`], with cancellation. A token cancelled
    /// before the transaction starts rolls it back with `Canceled`; once
    /// the body is running it completes normally and a cancelled caller
    /// merely stops waiting for the result.
    pub async fn write_with_token<F>(&self, token: &CancellationToken, mut body: F) -> Result<()>
    where
        F: for<'t> FnMut(&mut WriteTxn<'t>) -> Result<()> + Send + 'static,
    {
        if token.is_cancelled() {
            return Err(Error::Canceled);
        }
        let guard = token.clone();
        let wrapped: TxnFn = Box::new(move |txn: &mut WriteTxn<'_>| {
            if guard.is_cancelled() {
                return Err(Error::Canceled);
            }
            body(txn)
        });

        tokio::select! {
            result = self.inner.writer.transact(wrapped) => result,
            _ = token.cancelled() => Err(Error::Canceled),
        }
    }

    /// Stops the writer, reader pool, and listener, then joins their
    /// threads. Live watchers see a clean end of stream.
    pub async fn shutdown(&self) {
        info!("watchdb shutting down");
        self.inner.shutdown.cancel();
        self.inner.writer.shutdown().await;
        self.inner
            .reader
            .shutdown(self.inner.reader_thread_count)
            .await;

        let threads: Vec<JoinHandle<()>> = {
            let mut guard = self.inner.threads.lock().expect("thread registry poisoned");
            guard.drain(..).collect()
        };
        let _ = tokio::task::spawn_blocking(move || {
            for thread in threads {
                let _ = thread.join();
            }
        })
        .await;
    }
}

// =============================================================================
// Tests
// =============================================================================
