//! # Listener Multiplexer
//!
//! One background thread drains committed notifications from the outbox
//! and fans them out to every in-process subscriber. Subscribers are
//! keyed by channel name (`pach.<collection>`); each has its own bounded
//! staging queue, so one slow watcher can never stall the drain thread or
//! any other watcher.
//!
//! ```text
//!  writer commit ──► outbox rows ──► drain thread ──► routing table
//!                                        │                 │
//!                                 parse + delete      per-channel
//!                                                     subscriber list
//!                                                          │
//!                                              bounded queue per watcher
//! ```
//!
//! ## Bounded Buffer Policy
//!
//! A push onto a full queue does not block and does not drop just one
//! event, since partial delivery would silently violate the gap-free stream
//! guarantee. Instead the queue is cleared, marked overflowed, and the
//! subscriber is removed from the routing table; its watcher observes a
//! terminal `Overflow` error and must re-snapshot.
//!
//! ## Recovery
//!
//! If draining fails (connection lost), the thread reopens its connection
//! with backoff and terminates every subscriber with `Reconnect`:
//! notifications may have been missed while disconnected, so live
//! watchers cannot trust their streams and must re-snapshot. Committed
//! outbox rows survive the reconnect and are routed to new subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::api::Config;
use crate::error::{Error, Result};
use crate::schema::DbLocation;
use crate::types::Notification;

/// Rows fetched from the outbox per drain query.
const DRAIN_BATCH_SIZE: usize = 256;

// =============================================================================
// Close Reasons
// =============================================================================

/// Why a subscriber queue was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// The queue filled; its contents were discarded.
    Overflow,
    /// The drain thread lost and reopened its connection.
    Reconnect,
    /// Orderly teardown of the whole listener.
    Shutdown,
}

impl CloseReason {
    /// Terminal error delivered to the watcher, if any. `Shutdown` ends
    /// the stream cleanly.
    pub(crate) fn into_error(self) -> Option<Error> {
        match self {
            CloseReason::Overflow => Some(Error::Overflow),
            CloseReason::Reconnect => Some(Error::Reconnect),
            CloseReason::Shutdown => None,
        }
    }
}

// =============================================================================
// Subscriber Queue
// =============================================================================

/// Single-producer single-consumer bounded queue between the drain thread
/// and one watcher task.
///
/// The producer side never blocks: a full queue closes with `Overflow`
/// instead. The consumer side awaits on a `Notify`.
pub(crate) struct EventQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

struct QueueState {
    items: VecDeque<Notification>,
    closed: Option<CloseReason>,
}

impl EventQueue {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(EventQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: None,
            }),
            notify: Notify::new(),
            capacity,
        })
    }

    /// Enqueues a notification. Returns `false` once the queue is closed
    /// (including by this call overflowing it), telling the router to
    /// drop the subscriber.
    pub(crate) fn push(&self, notification: Notification) -> bool {
        let mut state = self.state.lock().expect("event queue poisoned");
        if state.closed.is_some() {
            return false;
        }
        if state.items.len() >= self.capacity {
            state.items.clear();
            state.closed = Some(CloseReason::Overflow);
            drop(state);
            self.notify.notify_one();
            return false;
        }
        state.items.push_back(notification);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Closes the queue. Queued items remain deliverable; the close is
    /// observed after they drain, except for `Overflow` which has already
    /// discarded them.
    pub(crate) fn close(&self, reason: CloseReason) {
        let mut state = self.state.lock().expect("event queue poisoned");
        if state.closed.is_none() {
            state.closed = Some(reason);
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Receives the next notification.
    ///
    /// `Ok(Some(_))` is an event; `Ok(None)` is a clean end of stream;
    /// `Err(_)` is the terminal `Overflow`/`Reconnect` error.
    pub(crate) async fn pop(&self) -> Result<Option<Notification>> {
        loop {
            {
                let mut state = self.state.lock().expect("event queue poisoned");
                if let Some(item) = state.items.pop_front() {
                    return Ok(Some(item));
                }
                if let Some(reason) = state.closed {
                    return match reason.into_error() {
                        Some(err) => Err(err),
                        None => Ok(None),
                    };
                }
            }
            self.notify.notified().await;
        }
    }
}

// =============================================================================
// Routing Table
// =============================================================================

struct SubscriberEntry {
    id: u64,
    queue: Arc<EventQueue>,
}

/// Channel-name → subscriber routing, shared between the drain thread
/// (route) and watcher tasks (register/unregister).
pub(crate) struct Router {
    channels: Mutex<HashMap<String, Vec<SubscriberEntry>>>,
    next_id: AtomicU64,
}

impl Router {
    fn new() -> Arc<Self> {
        Arc::new(Router {
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn register(self: &Arc<Self>, channel: &str, capacity: usize) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = EventQueue::new(capacity);
        let mut channels = self.channels.lock().expect("routing table poisoned");
        channels
            .entry(channel.to_string())
            .or_default()
            .push(SubscriberEntry {
                id,
                queue: Arc::clone(&queue),
            });
        debug!(channel, id, "subscriber registered");
        Subscription {
            router: Arc::clone(self),
            channel: channel.to_string(),
            id,
            queue,
        }
    }

    fn unregister(&self, channel: &str, id: u64) {
        let mut channels = self.channels.lock().expect("routing table poisoned");
        if let Some(subs) = channels.get_mut(channel) {
            subs.retain(|entry| entry.id != id);
            if subs.is_empty() {
                channels.remove(channel);
            }
        }
    }

    /// Delivers one notification to every subscriber of `channel`,
    /// dropping subscribers whose queues have closed (overflowed).
    fn route(&self, channel: &str, notification: &Notification) {
        let mut channels = self.channels.lock().expect("routing table poisoned");
        if let Some(subs) = channels.get_mut(channel) {
            subs.retain(|entry| {
                let alive = entry.queue.push(notification.clone());
                if !alive {
                    warn!(channel, id = entry.id, "subscriber dropped from routing table");
                }
                alive
            });
            if subs.is_empty() {
                channels.remove(channel);
            }
        }
    }

    /// Closes every subscriber with `reason` and empties the table.
    fn close_all(&self, reason: CloseReason) {
        let mut channels = self.channels.lock().expect("routing table poisoned");
        for (_, subs) in channels.drain() {
            for entry in subs {
                entry.queue.close(reason);
            }
        }
    }
}

/// A registered subscription. Unregisters itself on drop.
pub(crate) struct Subscription {
    router: Arc<Router>,
    channel: String,
    id: u64,
    queue: Arc<EventQueue>,
}

impl Subscription {
    pub(crate) fn queue(&self) -> &EventQueue {
        &self.queue
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.router.unregister(&self.channel, self.id);
    }
}

// =============================================================================
// Listener Handle and Drain Thread
// =============================================================================

/// Async-side handle to the listener. Cheap to clone.
#[derive(Clone)]
pub(crate) struct ListenerHandle {
    router: Arc<Router>,
    buffer_depth: usize,
}

impl ListenerHandle {
    /// Subscribes to a collection's channel. Events committed from this
    /// point on are staged in the subscription's queue.
    pub(crate) fn subscribe(&self, channel: &str) -> Subscription {
        self.router.register(channel, self.buffer_depth)
    }
}

/// Spawns the drain thread.
///
/// `signal` is nudged by the writer after each commit; the thread also
/// polls on `config.drain_poll_interval` as a backstop. `shutdown`
/// cancellation closes every subscriber cleanly and stops the thread.
pub(crate) fn spawn_listener(
    location: &DbLocation,
    config: &Config,
    signal: std::sync::mpsc::Receiver<()>,
    shutdown: CancellationToken,
) -> Result<(ListenerHandle, JoinHandle<()>)> {
    let conn = location.connect()?;
    let router = Router::new();
    let handle = ListenerHandle {
        router: Arc::clone(&router),
        buffer_depth: config.watch_buffer_depth,
    };

    let location = location.clone();
    let poll_interval = config.drain_poll_interval;
    let reconnect_backoff = config.busy_backoff_max;
    let thread = std::thread::Builder::new()
        .name("watchdb-listener".to_string())
        .spawn(move || {
            run_listener(
                conn,
                location,
                router,
                signal,
                shutdown,
                poll_interval,
                reconnect_backoff,
            )
        })
        .map_err(|e| Error::Fatal(format!("failed to spawn listener thread: {e}")))?;

    Ok((handle, thread))
}

fn run_listener(
    mut conn: Connection,
    location: DbLocation,
    router: Arc<Router>,
    signal: std::sync::mpsc::Receiver<()>,
    shutdown: CancellationToken,
    poll_interval: Duration,
    reconnect_backoff: Duration,
) {
    debug!("listener started");
    // Highest outbox seq already routed. Survives drain retries and
    // reconnects so a row is never delivered twice, even when the
    // post-route delete fails.
    let mut last_routed: i64 = 0;
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        if let Err(e) = drain_outbox(&conn, &router, &mut last_routed) {
            if e.is_retryable_write() {
                // Another connection holds the lock; the next signal or
                // poll retries the drain.
                debug!(error = %e, "outbox drain contended; will retry");
            } else {
                error!(error = %e, "outbox drain failed; reconnecting");
                match reopen(&location, &shutdown, reconnect_backoff) {
                    Some(new_conn) => {
                        conn = new_conn;
                        // Subscribers may have missed events while the
                        // connection was down; they must re-snapshot.
                        router.close_all(CloseReason::Reconnect);
                        continue;
                    }
                    None => break,
                }
            }
        }

        match signal.recv_timeout(poll_interval) {
            Ok(()) | Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    router.close_all(CloseReason::Shutdown);
    debug!("listener stopped");
}

/// Routes and deletes all committed outbox rows, oldest first. Rows at or
/// below `last_routed` were already delivered by an earlier attempt and
/// are only deleted.
fn drain_outbox(conn: &Connection, router: &Router, last_routed: &mut i64) -> Result<()> {
    loop {
        let mut stmt = conn.prepare_cached(
            "SELECT seq, channel, payload FROM watch_outbox ORDER BY seq LIMIT ?1",
        )?;
        let batch: Vec<(i64, String, String)> = stmt
            .query_map([DRAIN_BATCH_SIZE as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<_>>()?;

        let Some(&(last_seq, _, _)) = batch.last() else {
            return Ok(());
        };

        for (seq, channel, payload) in &batch {
            if *seq <= *last_routed {
                continue;
            }
            match Notification::from_payload(payload) {
                Ok(notification) => router.route(channel, &notification),
                // A malformed payload cannot be replayed into anything
                // useful; skip it rather than wedging the drain loop.
                Err(e) => warn!(seq, error = %e, "dropping malformed outbox payload"),
            }
            *last_routed = *seq;
        }

        conn.execute(
            "DELETE FROM watch_outbox WHERE seq <= ?1",
            [last_seq],
        )?;
    }
}

fn reopen(
    location: &DbLocation,
    shutdown: &CancellationToken,
    max_backoff: Duration,
) -> Option<Connection> {
    let mut backoff = Duration::from_millis(10);
    loop {
        if shutdown.is_cancelled() {
            return None;
        }
        match location.connect() {
            Ok(conn) => {
                debug!("listener reconnected");
                return Some(conn);
            }
            Err(e) => {
                warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "listener reconnect failed");
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
