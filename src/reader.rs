//! # Read Operations
//!
//! Two layers live here. The bottom layer is a set of direct SQL
//! functions over a `rusqlite::Connection`; they are used both by the
//! reader pool (on read-only connections) and by read-write collections
//! (on the writer's connection, inside an open transaction, which is what
//! makes read-your-own-writes hold). The top layer is the reader pool: a
//! handful of threads, each owning a read-only connection, competing for
//! requests on a shared channel.
//!
//! ## Load Balancing
//!
//! All reader threads share one request channel behind a mutex and
//! compete for the next request: whichever thread is free picks up work.
//! Each thread has its own connection, so queries run in parallel.
//!
//! ## Pagination
//!
//! `list` never materializes a whole collection at once. Pages are keyed
//! by the sort column of the previous page's last row, so a scan holds no
//! database resources between pages and early termination (the `Break`
//! sentinel) is free.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::options::{Options, SortOrder, SortTarget};
use crate::schema::{self, DbLocation};
use crate::types::{Revision, RowEntry};

// =============================================================================
// Direct SQL Layer
// =============================================================================

fn row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<RowEntry> {
    Ok(RowEntry {
        key: row.get(0)?,
        value: row.get(1)?,
        created_rev: Revision::from_raw(row.get(2)?),
        updated_rev: Revision::from_raw(row.get(3)?),
    })
}

const ROW_COLUMNS: &str = "key, value, created_rev, updated_rev";

/// Fetches a single row by key, or `None` if absent.
pub(crate) fn get_row(
    conn: &Connection,
    collection: &str,
    key: &str,
) -> Result<Option<RowEntry>> {
    let sql = format!(
        "SELECT {ROW_COLUMNS} FROM {} WHERE key = ?1",
        schema::row_table(collection)
    );
    Ok(conn.query_row(&sql, [key], row_from).optional()?)
}

/// Counts the rows of a collection.
pub(crate) fn count_rows(conn: &Connection, collection: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", schema::row_table(collection));
    Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}

/// Reads the current value of the global revision sequence.
pub(crate) fn current_rev(conn: &Connection) -> Result<Revision> {
    let rev: i64 = conn.query_row("SELECT rev FROM watch_rev_seq", [], |row| row.get(0))?;
    Ok(Revision::from_raw(rev))
}

/// Where to resume a paged scan: the sort-column value of the previous
/// page's last row.
#[derive(Debug, Clone)]
pub(crate) enum PageCursor {
    /// Resume after this key (key-ordered scans).
    Key(String),
    /// Resume after this revision (revision-ordered scans).
    Rev(i64),
}

/// Returns the cursor that resumes a scan after `row`.
pub(crate) fn cursor_after(opts: &Options, row: &RowEntry) -> PageCursor {
    match effective_target(opts) {
        SortTarget::Key => PageCursor::Key(row.key.clone()),
        SortTarget::CreatedRev => PageCursor::Rev(row.created_rev.as_raw()),
        SortTarget::UpdatedRev => PageCursor::Rev(row.updated_rev.as_raw()),
    }
}

/// `SortOrder::None` scans in primary-key order, the cheapest
/// deterministic order for these tables.
fn effective_target(opts: &Options) -> SortTarget {
    match opts.order {
        SortOrder::None => SortTarget::Key,
        _ => opts.target,
    }
}

fn sort_column(target: SortTarget) -> &'static str {
    match target {
        SortTarget::Key => "key",
        SortTarget::CreatedRev => "created_rev",
        SortTarget::UpdatedRev => "updated_rev",
    }
}

/// Fetches one page of a collection scan in the requested order.
pub(crate) fn list_page(
    conn: &Connection,
    collection: &str,
    opts: &Options,
    after: Option<&PageCursor>,
    limit: usize,
) -> Result<Vec<RowEntry>> {
    let table = schema::row_table(collection);
    let col = sort_column(effective_target(opts));
    let ascending = !matches!(opts.order, SortOrder::Descend);
    let dir = if ascending { "ASC" } else { "DESC" };
    let cmp = if ascending { ">" } else { "<" };

    let sql = match after {
        None => format!("SELECT {ROW_COLUMNS} FROM {table} ORDER BY {col} {dir} LIMIT ?1"),
        Some(_) => format!(
            "SELECT {ROW_COLUMNS} FROM {table} WHERE {col} {cmp} ?2 ORDER BY {col} {dir} LIMIT ?1"
        ),
    };

    let mut stmt = conn.prepare(&sql)?;
    let limit = limit as i64;
    let entries: Vec<RowEntry> = match after {
        None => stmt
            .query_map(params![limit], row_from)?
            .collect::<rusqlite::Result<_>>()?,
        Some(PageCursor::Key(k)) => stmt
            .query_map(params![limit, k], row_from)?
            .collect::<rusqlite::Result<_>>()?,
        Some(PageCursor::Rev(r)) => stmt
            .query_map(params![limit, r], row_from)?
            .collect::<rusqlite::Result<_>>()?,
    };
    Ok(entries)
}

/// Fetches one page of rows whose `index` value equals `value`, in key
/// order.
pub(crate) fn list_index_page(
    conn: &Connection,
    collection: &str,
    index: &str,
    value: &str,
    after_key: Option<&str>,
    limit: usize,
) -> Result<Vec<RowEntry>> {
    let row_table = schema::row_table(collection);
    let idx_table = schema::index_table(collection, index);

    let sql = match after_key {
        None => format!(
            "SELECT r.key, r.value, r.created_rev, r.updated_rev
             FROM {row_table} r JOIN {idx_table} i ON i.key = r.key
             WHERE i.index_value = ?1 ORDER BY r.key ASC LIMIT ?2"
        ),
        Some(_) => format!(
            "SELECT r.key, r.value, r.created_rev, r.updated_rev
             FROM {row_table} r JOIN {idx_table} i ON i.key = r.key
             WHERE i.index_value = ?1 AND r.key > ?3 ORDER BY r.key ASC LIMIT ?2"
        ),
    };

    let mut stmt = conn.prepare(&sql)?;
    let limit = limit as i64;
    let entries: Vec<RowEntry> = match after_key {
        None => stmt
            .query_map(params![value, limit], row_from)?
            .collect::<rusqlite::Result<_>>()?,
        Some(k) => stmt
            .query_map(params![value, limit, k], row_from)?
            .collect::<rusqlite::Result<_>>()?,
    };
    Ok(entries)
}

/// Reads a consistent snapshot for a watch: the matching rows (key order)
/// and the revision cutoff, both observed in a single read transaction.
///
/// The cutoff is the sequence value itself, not the max row revision: it
/// also masks deletes that committed before the snapshot, which leave no
/// row behind to take a maximum over.
pub(crate) fn snapshot(
    conn: &Connection,
    collection: &str,
    key: Option<&str>,
    index: Option<(&str, &str)>,
) -> Result<(Vec<RowEntry>, Revision)> {
    conn.execute_batch("BEGIN")?;
    let result = snapshot_inner(conn, collection, key, index);
    // A read transaction has nothing to roll back, but the connection
    // must not be left inside one.
    if conn.execute_batch("COMMIT").is_err() {
        let _ = conn.execute_batch("ROLLBACK");
        if result.is_ok() {
            return Err(Error::Fatal(
                "failed to close snapshot read transaction".to_string(),
            ));
        }
    }
    result
}

fn snapshot_inner(
    conn: &Connection,
    collection: &str,
    key: Option<&str>,
    index: Option<(&str, &str)>,
) -> Result<(Vec<RowEntry>, Revision)> {
    let cutoff = current_rev(conn)?;
    let rows = match (key, index) {
        (Some(k), _) => get_row(conn, collection, k)?.into_iter().collect(),
        (None, Some((idx, val))) => {
            list_index_page(conn, collection, idx, val, None, i64::MAX as usize)?
        }
        (None, None) => {
            let opts = Options::default();
            list_page(conn, collection, &opts, None, i64::MAX as usize)?
        }
    };
    Ok((rows, cutoff))
}

// =============================================================================
// Reader Pool
// =============================================================================

/// A request served by the reader pool.
pub(crate) enum ReadRequest {
    Get {
        collection: String,
        key: String,
        resp: oneshot::Sender<Result<Option<RowEntry>>>,
    },
    ListPage {
        collection: String,
        opts: Options,
        after: Option<PageCursor>,
        limit: usize,
        resp: oneshot::Sender<Result<Vec<RowEntry>>>,
    },
    ListIndexPage {
        collection: String,
        index: String,
        value: String,
        after_key: Option<String>,
        limit: usize,
        resp: oneshot::Sender<Result<Vec<RowEntry>>>,
    },
    Count {
        collection: String,
        resp: oneshot::Sender<Result<i64>>,
    },
    Snapshot {
        collection: String,
        key: Option<String>,
        index: Option<(String, String)>,
        resp: oneshot::Sender<Result<(Vec<RowEntry>, Revision)>>,
    },
    Shutdown,
}

/// Async handle to the reader pool. Cheap to clone; all clones feed the
/// same pool.
#[derive(Clone)]
pub(crate) struct ReaderHandle {
    tx: mpsc::Sender<ReadRequest>,
}

impl ReaderHandle {
    async fn submit<T>(
        &self,
        req: ReadRequest,
        rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        self.tx
            .send(req)
            .await
            .map_err(|_| Error::Fatal("reader pool is shut down".to_string()))?;
        rx.await
            .map_err(|_| Error::Fatal("reader pool dropped a request".to_string()))?
    }

    pub(crate) async fn get(&self, collection: &str, key: &str) -> Result<Option<RowEntry>> {
        let (resp, rx) = oneshot::channel();
        self.submit(
            ReadRequest::Get {
                collection: collection.to_string(),
                key: key.to_string(),
                resp,
            },
            rx,
        )
        .await
    }

    pub(crate) async fn list_page(
        &self,
        collection: &str,
        opts: Options,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<RowEntry>> {
        let (resp, rx) = oneshot::channel();
        self.submit(
            ReadRequest::ListPage {
                collection: collection.to_string(),
                opts,
                after,
                limit,
                resp,
            },
            rx,
        )
        .await
    }

    pub(crate) async fn list_index_page(
        &self,
        collection: &str,
        index: &str,
        value: &str,
        after_key: Option<String>,
        limit: usize,
    ) -> Result<Vec<RowEntry>> {
        let (resp, rx) = oneshot::channel();
        self.submit(
            ReadRequest::ListIndexPage {
                collection: collection.to_string(),
                index: index.to_string(),
                value: value.to_string(),
                after_key,
                limit,
                resp,
            },
            rx,
        )
        .await
    }

    pub(crate) async fn count(&self, collection: &str) -> Result<i64> {
        let (resp, rx) = oneshot::channel();
        self.submit(
            ReadRequest::Count {
                collection: collection.to_string(),
                resp,
            },
            rx,
        )
        .await
    }

    pub(crate) async fn snapshot(
        &self,
        collection: &str,
        key: Option<String>,
        index: Option<(String, String)>,
    ) -> Result<(Vec<RowEntry>, Revision)> {
        let (resp, rx) = oneshot::channel();
        self.submit(
            ReadRequest::Snapshot {
                collection: collection.to_string(),
                key,
                index,
                resp,
            },
            rx,
        )
        .await
    }

    /// Asks every pool thread to exit. Used by `WatchDb::shutdown`.
    pub(crate) async fn shutdown(&self, threads: usize) {
        for _ in 0..threads {
            if self.tx.send(ReadRequest::Shutdown).await.is_err() {
                break;
            }
        }
    }
}

/// Spawns the reader pool: `threads` OS threads, each owning a read-only
/// connection, competing for requests on one shared channel.
pub(crate) fn spawn_readers(
    location: &DbLocation,
    threads: usize,
    channel_depth: usize,
) -> Result<(ReaderHandle, Vec<JoinHandle<()>>)> {
    let (tx, rx) = mpsc::channel(channel_depth);
    let rx = Arc::new(Mutex::new(rx));

    let mut handles = Vec::with_capacity(threads);
    for i in 0..threads {
        let conn = location.connect_read_only()?;
        let rx = Arc::clone(&rx);
        let handle = std::thread::Builder::new()
            .name(format!("watchdb-reader-{i}"))
            .spawn(move || run_reader(conn, rx))
            .map_err(|e| Error::Fatal(format!("failed to spawn reader thread: {e}")))?;
        handles.push(handle);
    }

    debug!(threads, "reader pool started");
    Ok((ReaderHandle { tx }, handles))
}

/// Reader thread main loop. Threads compete for the receiver lock; each
/// request is served on this thread's own connection.
fn run_reader(conn: Connection, rx: Arc<Mutex<mpsc::Receiver<ReadRequest>>>) {
    loop {
        let request = {
            let mut guard = match rx.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    warn!("reader request channel poisoned; reader exiting");
                    return;
                }
            };
            guard.blocking_recv()
        };

        match request {
            Some(ReadRequest::Get {
                collection,
                key,
                resp,
            }) => {
                let _ = resp.send(get_row(&conn, &collection, &key));
            }
            Some(ReadRequest::ListPage {
                collection,
                opts,
                after,
                limit,
                resp,
            }) => {
                let _ = resp.send(list_page(&conn, &collection, &opts, after.as_ref(), limit));
            }
            Some(ReadRequest::ListIndexPage {
                collection,
                index,
                value,
                after_key,
                limit,
                resp,
            }) => {
                let _ = resp.send(list_index_page(
                    &conn,
                    &collection,
                    &index,
                    &value,
                    after_key.as_deref(),
                    limit,
                ));
            }
            Some(ReadRequest::Count { collection, resp }) => {
                let _ = resp.send(count_rows(&conn, &collection));
            }
            Some(ReadRequest::Snapshot {
                collection,
                key,
                index,
                resp,
            }) => {
                let index = index
                    .as_ref()
                    .map(|(i, v)| (i.as_str(), v.as_str()));
                let _ = resp.send(snapshot(&conn, &collection, key.as_deref(), index));
            }
            Some(ReadRequest::Shutdown) | None => return,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    /// Sets up an initialized connection with an `items` collection and a
    /// `value` index.
    fn test_conn() -> Connection {
        let loc = DbLocation::memory();
        let conn = loc.connect().unwrap();
        schema::initialize(&conn).unwrap();
        schema::create_collection_tables(&conn, "items", &["value"]).unwrap();
        conn
    }

    fn insert_row(conn: &Connection, key: &str, value: &str, rev: i64) {
        conn.execute(
            "INSERT INTO coll_items (key, value, created_rev, updated_rev, created_ms, updated_ms)
             VALUES (?1, ?2, ?3, ?3, 0, 0)",
            params![key, value.as_bytes(), rev],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO coll_items_idx_value (index_value, key) VALUES (?1, ?2)",
            params![value, key],
        )
        .unwrap();
        conn.execute("UPDATE watch_rev_seq SET rev = ?1", params![rev])
            .unwrap();
    }

    #[test]
    fn test_get_row() {
        let conn = test_conn();
        insert_row(&conn, "a", "old", 1);

        let row = get_row(&conn, "items", "a").unwrap().unwrap();
        assert_eq!(row.key, "a");
        assert_eq!(row.value, b"old");
        assert_eq!(row.created_rev, Revision::from_raw(1));

        assert!(get_row(&conn, "items", "missing").unwrap().is_none());
    }

    #[test]
    fn test_count() {
        let conn = test_conn();
        assert_eq!(count_rows(&conn, "items").unwrap(), 0);
        insert_row(&conn, "a", "old", 1);
        insert_row(&conn, "b", "old", 2);
        assert_eq!(count_rows(&conn, "items").unwrap(), 2);
    }

    #[test]
    fn test_list_pagination_by_key() {
        let conn = test_conn();
        for (i, key) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            insert_row(&conn, key, "old", i as i64 + 1);
        }

        let opts = Options::default();
        let page1 = list_page(&conn, "items", &opts, None, 2).unwrap();
        assert_eq!(
            page1.iter().map(|r| r.key.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        let cursor = cursor_after(&opts, page1.last().unwrap());
        let page2 = list_page(&conn, "items", &opts, Some(&cursor), 2).unwrap();
        assert_eq!(
            page2.iter().map(|r| r.key.as_str()).collect::<Vec<_>>(),
            vec!["c", "d"]
        );
    }

    #[test]
    fn test_list_by_created_rev_descending() {
        let conn = test_conn();
        insert_row(&conn, "z", "old", 1);
        insert_row(&conn, "a", "old", 2);
        insert_row(&conn, "m", "old", 3);

        let opts = Options::by_created_rev(SortOrder::Descend);
        let rows = list_page(&conn, "items", &opts, None, 10).unwrap();
        assert_eq!(
            rows.iter().map(|r| r.key.as_str()).collect::<Vec<_>>(),
            vec!["m", "a", "z"]
        );
    }

    #[test]
    fn test_list_index_page() {
        let conn = test_conn();
        insert_row(&conn, "a", "red", 1);
        insert_row(&conn, "b", "blue", 2);
        insert_row(&conn, "c", "red", 3);

        let rows = list_index_page(&conn, "items", "value", "red", None, 10).unwrap();
        assert_eq!(
            rows.iter().map(|r| r.key.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );

        let rows = list_index_page(&conn, "items", "value", "red", Some("a"), 10).unwrap();
        assert_eq!(
            rows.iter().map(|r| r.key.as_str()).collect::<Vec<_>>(),
            vec!["c"]
        );
    }

    #[test]
    fn test_snapshot_cutoff_is_sequence_value() {
        let conn = test_conn();
        insert_row(&conn, "a", "old", 1);
        // Bump the sequence past the last row revision, as a delete would.
        conn.execute("UPDATE watch_rev_seq SET rev = 5", []).unwrap();

        let (rows, cutoff) = snapshot(&conn, "items", None, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(cutoff, Revision::from_raw(5));
    }

    #[test]
    fn test_snapshot_filters() {
        let conn = test_conn();
        insert_row(&conn, "a", "red", 1);
        insert_row(&conn, "b", "blue", 2);

        let (rows, _) = snapshot(&conn, "items", Some("b"), None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "b");

        let (rows, _) = snapshot(&conn, "items", None, Some(("value", "red"))).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "a");

        let (rows, _) = snapshot(&conn, "items", Some("missing"), None).unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_reader_pool_round_trip() {
        let loc = DbLocation::memory();
        let conn = loc.connect().unwrap();
        schema::initialize(&conn).unwrap();
        schema::create_collection_tables(&conn, "items", &[]).unwrap();
        conn.execute(
            "INSERT INTO coll_items (key, value, created_rev, updated_rev, created_ms, updated_ms)
             VALUES ('a', x'22786822', 1, 1, 0, 0)",
            [],
        )
        .unwrap();

        let (handle, threads) = spawn_readers(&loc, 2, 16).unwrap();

        let row = handle.get("items", "a").await.unwrap().unwrap();
        assert_eq!(row.key, "a");
        assert_eq!(handle.count("items").await.unwrap(), 1);

        handle.shutdown(2).await;
        for t in threads {
            t.join().unwrap();
        }
        // Keep the owning connection alive until the end of the test.
        drop(conn);
    }
}
