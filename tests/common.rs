#![allow(dead_code)] // Each suite uses its own subset of these helpers.

//! Shared fixtures for the integration suites.
//!
//! Most tests run against a file-backed database in a temp directory (the
//! reader pool and listener each hold their own connections, and WAL mode
//! is only available on files) with a standard `items` collection of ten
//! rows keyed `"0"`..`"9"`, value `"old"`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use watchdb::{
    CancellationToken, Collection, Config, Error, IndexSpec, Options, ReadOnlyCollection, Record,
    Result, WatchDb, WatchEvent, Watcher,
};

pub const DEFAULT_COLLECTION_SIZE: usize = 10;
pub const ORIGINAL_VALUE: &str = "old";
pub const CHANGED_VALUE: &str = "new";

// =============================================================================
// Test Record
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestItem {
    pub id: String,
    pub value: String,
}

impl Record for TestItem {
    fn key(&self) -> String {
        self.id.clone()
    }
}

/// The item a plain write produces: `{id, value: "new"}`.
pub fn make_item(id: &str) -> TestItem {
    TestItem {
        id: id.to_string(),
        value: CHANGED_VALUE.to_string(),
    }
}

pub fn make_id(i: usize) -> String {
    format!("{i}")
}

pub fn id_range(start: usize, end: usize) -> Vec<String> {
    (start..end).map(make_id).collect()
}

// =============================================================================
// Database Fixture
// =============================================================================

pub struct Fixture {
    pub db: WatchDb,
    pub items: Collection<TestItem>,
    // Held for the fixture's lifetime; dropping it deletes the database.
    _dir: TempDir,
}

/// A fresh database with an empty `items` collection indexed on `value`.
pub async fn new_collection() -> Fixture {
    new_collection_with_config(Config::default()).await
}

pub async fn new_collection_with_config(config: Config) -> Fixture {
    let dir = tempfile::tempdir().expect("create temp dir");
    let db = WatchDb::open_with_config(dir.path().join("test.db"), config)
        .await
        .expect("open database");
    let items = db
        .collection::<TestItem>("items", vec![IndexSpec::on_field("value")])
        .await
        .expect("register items collection");
    Fixture {
        db,
        items,
        _dir: dir,
    }
}

/// Writes the ten standard rows (`"0"`..`"9"`, value `"old"`) in one
/// transaction.
pub async fn populate(fx: &Fixture) {
    let items = fx.items.clone();
    fx.db
        .write(move |txn| {
            let rw = items.read_write(txn);
            for id in id_range(0, DEFAULT_COLLECTION_SIZE) {
                rw.create(
                    &id,
                    &TestItem {
                        id: id.clone(),
                        value: ORIGINAL_VALUE.to_string(),
                    },
                )?;
            }
            Ok(())
        })
        .await
        .expect("populate collection");
}

/// Puts `{id, value: "new"}` under `id` in its own transaction.
pub async fn do_write(fx: &Fixture, id: &str) -> Result<()> {
    let items = fx.items.clone();
    let record = make_item(id);
    fx.db
        .write(move |txn| items.read_write(txn).put_record(&record))
        .await
}

/// Deletes `id` in its own transaction.
pub async fn do_delete(fx: &Fixture, id: &str) -> Result<()> {
    let items = fx.items.clone();
    let id = id.to_string();
    fx.db
        .write(move |txn| items.read_write(txn).delete(&id))
        .await
}

/// Deletes every row in its own transaction.
pub async fn do_delete_all(fx: &Fixture) -> Result<()> {
    let items = fx.items.clone();
    fx.db
        .write(move |txn| items.read_write(txn).delete_all())
        .await
}

// =============================================================================
// State Checking
// =============================================================================

/// Expected difference from the standard populated collection.
#[derive(Default)]
pub struct RowDiff {
    pub deleted: Vec<String>,
    pub changed: Vec<String>,
    pub created: Vec<String>,
}

/// Asserts the collection contents equal the standard ten rows adjusted
/// by `diff` (changed/created rows carry `"new"`).
pub async fn check_default_collection(ro: &ReadOnlyCollection<TestItem>, diff: RowDiff) {
    let mut expected: HashMap<String, String> = id_range(0, DEFAULT_COLLECTION_SIZE)
        .into_iter()
        .map(|id| (id, ORIGINAL_VALUE.to_string()))
        .collect();
    for id in &diff.deleted {
        assert!(
            expected.remove(id).is_some(),
            "diff deleted a row not in the original set: {id}"
        );
    }
    for id in &diff.changed {
        assert!(
            expected.contains_key(id),
            "diff changed a row not in the original set: {id}"
        );
        expected.insert(id.clone(), CHANGED_VALUE.to_string());
    }
    for id in &diff.created {
        assert!(
            !expected.contains_key(id),
            "diff created a row already in the original set: {id}"
        );
        expected.insert(id.clone(), CHANGED_VALUE.to_string());
    }
    check_collection(ro, expected).await;
}

pub async fn check_collection(
    ro: &ReadOnlyCollection<TestItem>,
    expected: HashMap<String, String>,
) {
    let mut actual = HashMap::new();
    ro.list(&Options::default(), |item: &TestItem| {
        actual.insert(item.id.clone(), item.value.clone());
        Ok(())
    })
    .await
    .expect("list collection");

    for (key, value) in &expected {
        match actual.get(key) {
            Some(actual_value) => assert_eq!(
                actual_value, value,
                "row '{key}' had an unexpected value"
            ),
            None => panic!("row '{key}' was expected but not found"),
        }
    }
    for key in actual.keys() {
        assert!(
            expected.contains_key(key),
            "row '{key}' was present but not expected"
        );
    }
}

// =============================================================================
// Watch Helpers
// =============================================================================

/// A caller-defined error for exercising user-error propagation.
#[derive(Debug, thiserror::Error)]
#[error("TestError")]
pub struct TestError;

pub fn is_test_error(err: &Error) -> bool {
    err.downcast_user::<TestError>().is_some()
}

/// An already-cancelled token.
pub fn canceled_token() -> CancellationToken {
    let token = CancellationToken::new();
    token.cancel();
    token
}

/// Receives the next event or panics after five seconds.
pub async fn recv_event(watcher: &mut Watcher<TestItem>) -> WatchEvent<TestItem> {
    tokio::time::timeout(Duration::from_secs(5), watcher.recv())
        .await
        .expect("timed out waiting for a watch event")
        .expect("watch stream ended unexpectedly")
}

/// Runs `writes` after a short delay, so a watch registered in the
/// meantime observes them as live events.
pub fn async_writes(
    fx: &Fixture,
    writes: Vec<WriteOp>,
) -> tokio::task::JoinHandle<()> {
    let db = fx.db.clone();
    let items = fx.items.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        for op in writes {
            let items = items.clone();
            db.write(move |txn| {
                let rw = items.read_write(txn);
                match &op {
                    WriteOp::Put(id) => rw.put_record(&make_item(id)),
                    WriteOp::Delete(id) => rw.delete(id),
                    WriteOp::DeleteAll => rw.delete_all(),
                }
            })
            .await
            .expect("async write");
        }
    })
}

#[derive(Clone)]
pub enum WriteOp {
    Put(String),
    Delete(String),
    DeleteAll,
}

pub fn put_op(id: &str) -> WriteOp {
    WriteOp::Put(id.to_string())
}

pub fn delete_op(id: &str) -> WriteOp {
    WriteOp::Delete(id.to_string())
}

// Assertion helpers over received events.

pub fn assert_put(event: &WatchEvent<TestItem>, id: &str) {
    match event {
        WatchEvent::Put { key, value, .. } => {
            assert_eq!(key, id, "put event for the wrong key");
            assert_eq!(value, &make_item(id), "put event with the wrong value");
        }
        other => panic!("expected Put({id}), got {other:?}"),
    }
}

pub fn assert_put_value(event: &WatchEvent<TestItem>, id: &str, value: &str) {
    match event {
        WatchEvent::Put {
            key,
            value: actual, ..
        } => {
            assert_eq!(key, id);
            assert_eq!(actual.value, value);
        }
        other => panic!("expected Put({id}), got {other:?}"),
    }
}

pub fn assert_delete(event: &WatchEvent<TestItem>, id: &str) {
    match event {
        WatchEvent::Delete { key, .. } => assert_eq!(key, id, "delete event for the wrong key"),
        other => panic!("expected Delete({id}), got {other:?}"),
    }
}

pub fn assert_canceled(event: &WatchEvent<TestItem>) {
    match event {
        WatchEvent::Error(Error::Canceled) => {}
        other => panic!("expected Error(Canceled), got {other:?}"),
    }
}
