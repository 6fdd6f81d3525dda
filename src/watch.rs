//! # Watchers
//!
//! A watcher turns a collection filter into an ordered event stream:
//! first a snapshot of the matching rows as `Put` events, then a gap-free
//! live tail of committed changes. Each watcher runs as one task driving
//! a small state machine:
//!
//! ```text
//!            register(filter)
//!   (init) ────────────────────► Snapshotting
//!                                     │ snapshot drained,
//!                                     │ cutoff recorded
//!                                     ▼
//!                                    Live
//!                    ┌────────────────┼────────────────┐
//!           overflow │       token cancelled           │ listener reconnect
//!                    ▼                ▼                 ▼
//!                 Errored          Closed            Errored
//! ```
//!
//! ## The Cutoff
//!
//! The watcher registers with the listener *before* reading its snapshot,
//! so any event that commits during the read is staged in its queue. The
//! snapshot also records the revision sequence value it observed, the
//! cutoff. Staged events at or below the cutoff are already reflected in
//! the snapshot and are discarded; everything above it is delivered.
//! Revisions strictly increase, so this deduplication is exact.
//!
//! ## Terminal Events
//!
//! A stream ends in exactly one of three ways: cleanly (consumer closed
//! the watcher, or the database shut down), with a single
//! `Error(Canceled)` after the watcher's token fires, or with a single
//! `Error(Overflow)`/`Error(Reconnect)` from the listener. After an error
//! event no further events are delivered; the caller re-watches to
//! resume, which re-snapshots.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::collection::{CollectionSpec, IndexSpec};
use crate::error::{Error, Result};
use crate::listener::ListenerHandle;
use crate::reader::ReaderHandle;
use crate::record::{self, Record};
use crate::types::{channel_for, Notification, NotificationOp, Revision};

/// Depth of the consumer-facing event channel. Kept small: sustained
/// backpressure belongs in the subscriber queue, where falling behind is
/// detected and surfaced as `Overflow`.
const EVENT_CHANNEL_DEPTH: usize = 64;

// =============================================================================
// Events and Filters
// =============================================================================

/// One event on a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<R> {
    /// A row was inserted or replaced.
    Put {
        /// The affected key.
        key: String,
        /// The row's value after the write.
        value: R,
        /// Revision of the write.
        rev: Revision,
    },
    /// A row was removed.
    Delete {
        /// The affected key.
        key: String,
        /// Revision of the delete.
        rev: Revision,
    },
    /// Terminal failure; the stream ends after this event.
    Error(Error),
}

impl<R> WatchEvent<R> {
    /// The affected key, for `Put` and `Delete` events.
    pub fn key(&self) -> Option<&str> {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key, .. } => Some(key),
            WatchEvent::Error(_) => None,
        }
    }

    /// The event's revision, for `Put` and `Delete` events.
    pub fn rev(&self) -> Option<Revision> {
        match self {
            WatchEvent::Put { rev, .. } | WatchEvent::Delete { rev, .. } => Some(*rev),
            WatchEvent::Error(_) => None,
        }
    }
}

/// Which events a watcher receives.
#[derive(Debug, Clone)]
pub(crate) enum WatchFilter {
    /// Every key in the collection.
    All,
    /// One key.
    Key(String),
    /// Every key whose index value matches.
    Index {
        /// The declared index consulted for membership.
        index: IndexSpec,
        /// The index value to match.
        value: String,
    },
}

// =============================================================================
// Watcher (channel consumer)
// =============================================================================

/// The channel form of a watch subscription.
///
/// Receive with [`Watcher::recv`] or through the `Stream` impl. Dropping
/// the watcher ends the subscription; the backing task unregisters from
/// the listener as soon as it notices.
pub struct Watcher<R> {
    rx: mpsc::Receiver<WatchEvent<R>>,
}

impl<R> Watcher<R> {
    /// Receives the next event, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<WatchEvent<R>> {
        self.rx.recv().await
    }

    /// Ends the subscription without waiting for remaining events.
    pub fn close(self) {}
}

impl<R> Stream for Watcher<R> {
    type Item = WatchEvent<R>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// =============================================================================
// Spawning
// =============================================================================

/// Spawns the task backing one watch subscription and returns its
/// consumer handle.
pub(crate) fn spawn<R: Record>(
    spec: Arc<CollectionSpec>,
    reader: ReaderHandle,
    listener: ListenerHandle,
    filter: WatchFilter,
    token: CancellationToken,
) -> Watcher<R> {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
    tokio::spawn(run_watch(spec, reader, listener, filter, token, tx));
    Watcher { rx }
}

/// Drives a watcher through a callback.
///
/// Put/Delete events go to `f`; a terminal error event becomes this
/// function's error instead of a callback invocation. `f` returning
/// [`Error::Break`] ends the subscription cleanly with `Ok`.
pub(crate) async fn drive<R, F>(mut watcher: Watcher<R>, mut f: F) -> Result<()>
where
    F: FnMut(&WatchEvent<R>) -> Result<()>,
{
    while let Some(event) = watcher.recv().await {
        if let WatchEvent::Error(e) = event {
            return Err(e);
        }
        match f(&event) {
            Ok(()) => {}
            Err(Error::Break) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// =============================================================================
// Watch Task
// =============================================================================

async fn run_watch<R: Record>(
    spec: Arc<CollectionSpec>,
    reader: ReaderHandle,
    listener: ListenerHandle,
    filter: WatchFilter,
    token: CancellationToken,
    tx: mpsc::Sender<WatchEvent<R>>,
) {
    if token.is_cancelled() {
        let _ = tx.send(WatchEvent::Error(Error::Canceled)).await;
        return;
    }

    // Register before the snapshot read so nothing can commit unseen in
    // between: concurrent events stage in the queue and the cutoff sorts
    // out the overlap.
    let subscription = listener.subscribe(&channel_for(&spec.name));

    let (snap_key, snap_index) = match &filter {
        WatchFilter::All => (None, None),
        WatchFilter::Key(key) => (Some(key.clone()), None),
        WatchFilter::Index { index, value } => {
            (None, Some((index.name.clone(), value.clone())))
        }
    };

    let snapshot = tokio::select! {
        _ = token.cancelled() => {
            let _ = tx.send(WatchEvent::Error(Error::Canceled)).await;
            return;
        }
        result = reader.snapshot(&spec.name, snap_key, snap_index) => result,
    };
    let (rows, cutoff) = match snapshot {
        Ok(snapshot) => snapshot,
        Err(e) => {
            let _ = tx.send(WatchEvent::Error(e)).await;
            return;
        }
    };
    debug!(
        collection = %spec.name,
        rows = rows.len(),
        cutoff = %cutoff,
        "watch snapshot complete"
    );

    for row in rows {
        let value: R = match record::decode(&row.value) {
            Ok(value) => value,
            Err(e) => {
                let _ = tx.send(WatchEvent::Error(e)).await;
                return;
            }
        };
        let event = WatchEvent::Put {
            key: row.key,
            value,
            rev: row.updated_rev,
        };
        if tx.send(event).await.is_err() {
            return;
        }
        if token.is_cancelled() {
            let _ = tx.send(WatchEvent::Error(Error::Canceled)).await;
            return;
        }
    }

    live_tail(&spec, &reader, &filter, &token, &tx, &subscription, cutoff).await;
}

async fn live_tail<R: Record>(
    spec: &CollectionSpec,
    reader: &ReaderHandle,
    filter: &WatchFilter,
    token: &CancellationToken,
    tx: &mpsc::Sender<WatchEvent<R>>,
    subscription: &crate::listener::Subscription,
    cutoff: Revision,
) {
    loop {
        let popped = tokio::select! {
            _ = token.cancelled() => {
                let _ = tx.send(WatchEvent::Error(Error::Canceled)).await;
                return;
            }
            _ = tx.closed() => return,
            popped = subscription.queue().pop() => popped,
        };

        let notification = match popped {
            Ok(Some(notification)) => notification,
            // Clean listener shutdown: end the stream without an error.
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(WatchEvent::Error(e)).await;
                return;
            }
        };

        if notification.rev <= cutoff {
            // Already reflected in the snapshot.
            continue;
        }

        let event = match build_event::<R>(spec, reader, filter, notification).await {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                let _ = tx.send(WatchEvent::Error(e)).await;
                return;
            }
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

/// Applies the filter to one live notification and materializes the
/// event, back-reading the row when the payload has no inline value.
async fn build_event<R: Record>(
    spec: &CollectionSpec,
    reader: &ReaderHandle,
    filter: &WatchFilter,
    notification: Notification,
) -> Result<Option<WatchEvent<R>>> {
    let Notification {
        op,
        key,
        rev,
        value,
        indexes,
        ..
    } = notification;

    match filter {
        WatchFilter::All => {}
        WatchFilter::Key(wanted) => {
            if &key != wanted {
                return Ok(None);
            }
        }
        WatchFilter::Index { index, value: wanted } => {
            match indexes.as_ref().and_then(|map| map.get(&index.name)) {
                Some(actual) => {
                    if actual != wanted {
                        return Ok(None);
                    }
                }
                // Payload predates inline index values: resolve
                // membership against the stored row.
                None => match op {
                    NotificationOp::Put => {
                        let Some(row) = reader.get(&spec.name, &key).await? else {
                            // Row already gone; its delete is in flight.
                            return Ok(None);
                        };
                        let json: serde_json::Value = serde_json::from_slice(&row.value)?;
                        if record::index_value(&json, &index.field)? != *wanted {
                            return Ok(None);
                        }
                        let decoded: R = record::decode(&row.value)?;
                        return Ok(Some(WatchEvent::Put {
                            key,
                            value: decoded,
                            rev,
                        }));
                    }
                    NotificationOp::Delete => {
                        // Membership is undecidable once the row is gone.
                        warn!(
                            collection = %spec.name,
                            key = %key,
                            "dropping index-filtered delete without inline index values"
                        );
                        return Ok(None);
                    }
                },
            }
        }
    }

    match op {
        NotificationOp::Delete => Ok(Some(WatchEvent::Delete { key, rev })),
        NotificationOp::Put => {
            let decoded: R = match value {
                Some(json) => record::from_json(json)?,
                None => {
                    // Value exceeded the inline payload limit; back-read.
                    let Some(row) = reader.get(&spec.name, &key).await? else {
                        return Ok(None);
                    };
                    record::decode(&row.value)?
                }
            };
            Ok(Some(WatchEvent::Put {
                key,
                value: decoded,
                rev,
            }))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let put: WatchEvent<String> = WatchEvent::Put {
            key: "a".to_string(),
            value: "v".to_string(),
            rev: Revision::from_raw(3),
        };
        assert_eq!(put.key(), Some("a"));
        assert_eq!(put.rev(), Some(Revision::from_raw(3)));

        let delete: WatchEvent<String> = WatchEvent::Delete {
            key: "a".to_string(),
            rev: Revision::from_raw(4),
        };
        assert_eq!(delete.key(), Some("a"));

        let error: WatchEvent<String> = WatchEvent::Error(Error::Canceled);
        assert_eq!(error.key(), None);
        assert_eq!(error.rev(), None);
    }

    #[test]
    fn test_error_clone_preserves_structured_variants() {
        let cloned = Error::Canceled.clone();
        assert!(matches!(cloned, Error::Canceled));

        let cloned = Error::NotFound {
            collection: "items".to_string(),
            key: "k".to_string(),
        }
        .clone();
        assert!(cloned.is_not_found());

        let cloned = Error::Fatal("boom".to_string()).clone();
        assert!(matches!(cloned, Error::Fatal(_)));
    }
}
