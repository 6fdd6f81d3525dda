//! # Typed Collections
//!
//! A collection is a named, typed key/value space backed by one row table
//! and zero or more index tables. This module provides the typed facades
//! over the raw storage layer:
//!
//! - [`Collection`]: the registered handle; cheap to clone and share.
//! - [`ReadOnlyCollection`]: async reads and watches, served by the
//!   reader pool against committed state.
//! - [`ReadWriteCollection`]: synchronous reads and writes scoped to an
//!   open transaction; reads observe the transaction's own writes.
//!
//! ## Indexes
//!
//! Each declared index names a scalar field of the record. Writes keep
//! the index tables consistent in the same transaction as the row, and
//! notifications carry the row's index values inline so index-filtered
//! watchers can decide membership without a read.
//!
//! ## Error contract
//!
//! The operation table (preconditions and errors) follows the collection
//! semantics exactly: `create` fails `Exists`, `update`/`delete` fail
//! `NotFound`, mutator and list-callback errors propagate unchanged and
//! abort the enclosing transaction, and the `Break` sentinel ends `list`
//! early with success.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use rusqlite::params;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::listener::ListenerHandle;
use crate::options::Options;
use crate::reader::{self, PageCursor, ReaderHandle};
use crate::record::{self, Record};
use crate::schema;
use crate::types::{channel_for, current_time_ms, Notification, NotificationOp, RowEntry};
use crate::watch::{self, WatchEvent, WatchFilter, Watcher};
use crate::writer::WriteTxn;

// =============================================================================
// Descriptors
// =============================================================================

/// A named secondary index over one scalar field of the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// Index name, unique within the collection.
    pub name: String,
    /// Record field the index is computed from.
    pub field: String,
}

impl IndexSpec {
    /// An index with an explicit name.
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        IndexSpec {
            name: name.into(),
            field: field.into(),
        }
    }

    /// An index named after the field it covers.
    pub fn on_field(field: impl Into<String>) -> Self {
        let field = field.into();
        IndexSpec {
            name: field.clone(),
            field,
        }
    }
}

/// Immutable descriptor of a registered collection.
#[derive(Debug)]
pub(crate) struct CollectionSpec {
    pub(crate) name: String,
    pub(crate) indexes: Vec<IndexSpec>,
}

impl CollectionSpec {
    pub(crate) fn validate(&self) -> Result<()> {
        schema::validate_identifier(&self.name)?;
        for index in &self.indexes {
            schema::validate_identifier(&index.name)?;
        }
        Ok(())
    }

    /// Resolves an index name to its spec, or fails `Fatal`: querying an
    /// undeclared index is a programming error, not an empty result.
    pub(crate) fn index(&self, name: &str) -> Result<&IndexSpec> {
        self.indexes
            .iter()
            .find(|index| index.name == name)
            .ok_or_else(|| {
                Error::Fatal(format!(
                    "collection '{}' has no index named '{name}'",
                    self.name
                ))
            })
    }
}

// =============================================================================
// Collection Handle
// =============================================================================

/// A registered, typed collection. Clones share the registration.
pub struct Collection<R: Record> {
    spec: Arc<CollectionSpec>,
    reader: ReaderHandle,
    listener: ListenerHandle,
    list_batch_size: usize,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> std::fmt::Debug for Collection<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.spec.name)
            .finish()
    }
}

impl<R: Record> Clone for Collection<R> {
    fn clone(&self) -> Self {
        Collection {
            spec: Arc::clone(&self.spec),
            reader: self.reader.clone(),
            listener: self.listener.clone(),
            list_batch_size: self.list_batch_size,
            _record: PhantomData,
        }
    }
}

impl<R: Record> Collection<R> {
    pub(crate) fn new(
        spec: Arc<CollectionSpec>,
        reader: ReaderHandle,
        listener: ListenerHandle,
        list_batch_size: usize,
    ) -> Self {
        Collection {
            spec,
            reader,
            listener,
            list_batch_size,
            _record: PhantomData,
        }
    }

    /// The collection name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// A read-only handle serving committed state.
    pub fn read_only(&self) -> ReadOnlyCollection<R> {
        ReadOnlyCollection {
            spec: Arc::clone(&self.spec),
            reader: self.reader.clone(),
            listener: self.listener.clone(),
            list_batch_size: self.list_batch_size,
            _record: PhantomData,
        }
    }

    /// A read-write handle scoped to an open transaction.
    pub fn read_write<'a>(&self, txn: &'a WriteTxn<'a>) -> ReadWriteCollection<'a, R> {
        ReadWriteCollection {
            spec: Arc::clone(&self.spec),
            txn,
            list_batch_size: self.list_batch_size,
            _record: PhantomData,
        }
    }
}

// =============================================================================
// Read-Only Collection
// =============================================================================

/// Async read and watch surface over committed state.
pub struct ReadOnlyCollection<R: Record> {
    spec: Arc<CollectionSpec>,
    reader: ReaderHandle,
    listener: ListenerHandle,
    list_batch_size: usize,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> Clone for ReadOnlyCollection<R> {
    fn clone(&self) -> Self {
        ReadOnlyCollection {
            spec: Arc::clone(&self.spec),
            reader: self.reader.clone(),
            listener: self.listener.clone(),
            list_batch_size: self.list_batch_size,
            _record: PhantomData,
        }
    }
}

impl<R: Record> ReadOnlyCollection<R> {
    /// Fetches the record stored under `key`.
    pub async fn get(&self, key: &str) -> Result<R> {
        let row = self
            .reader
            .get(&self.spec.name, key)
            .await?
            .ok_or_else(|| self.not_found(key))?;
        record::decode(&row.value)
    }

    /// Invokes `f` for each record, in the requested order.
    ///
    /// `f` may return [`Error::Break`] to stop early (list then returns
    /// `Ok`); any other error aborts and is returned.
    pub async fn list<F>(&self, opts: &Options, mut f: F) -> Result<()>
    where
        F: FnMut(&R) -> Result<()>,
    {
        let mut after: Option<PageCursor> = None;
        loop {
            let page = self
                .reader
                .list_page(&self.spec.name, *opts, after.take(), self.list_batch_size)
                .await?;
            let full = page.len() == self.list_batch_size;
            if let Some(last) = page.last() {
                after = Some(reader::cursor_after(opts, last));
            }
            match deliver_page::<R, F>(&page, &mut f)? {
                PageOutcome::Stop => return Ok(()),
                PageOutcome::Continue => {}
            }
            if !full {
                return Ok(());
            }
        }
    }

    /// Invokes `f` for each record whose `index` value equals `value`,
    /// in key order. `Break` semantics match [`ReadOnlyCollection::list`].
    pub async fn list_by_index<F>(&self, index: &str, value: &str, mut f: F) -> Result<()>
    where
        F: FnMut(&R) -> Result<()>,
    {
        let index = self.spec.index(index)?.name.clone();
        let mut after: Option<String> = None;
        loop {
            let page = self
                .reader
                .list_index_page(
                    &self.spec.name,
                    &index,
                    value,
                    after.take(),
                    self.list_batch_size,
                )
                .await?;
            let full = page.len() == self.list_batch_size;
            if let Some(last) = page.last() {
                after = Some(last.key.clone());
            }
            match deliver_page::<R, F>(&page, &mut f)? {
                PageOutcome::Stop => return Ok(()),
                PageOutcome::Continue => {}
            }
            if !full {
                return Ok(());
            }
        }
    }

    /// Number of rows in the collection.
    pub async fn count(&self) -> Result<i64> {
        self.reader.count(&self.spec.name).await
    }

    /// Watches every key in the collection: a snapshot of current rows as
    /// `Put` events, then the live tail.
    pub async fn watch(&self, token: CancellationToken) -> Result<Watcher<R>> {
        self.spawn_watch(token, WatchFilter::All)
    }

    /// Watches a single key.
    pub async fn watch_one(&self, token: CancellationToken, key: &str) -> Result<Watcher<R>> {
        self.spawn_watch(token, WatchFilter::Key(key.to_string()))
    }

    /// Watches the keys whose `index` value equals `value`.
    pub async fn watch_by_index(
        &self,
        token: CancellationToken,
        index: &str,
        value: &str,
    ) -> Result<Watcher<R>> {
        let index = self.spec.index(index)?.clone();
        self.spawn_watch(
            token,
            WatchFilter::Index {
                index,
                value: value.to_string(),
            },
        )
    }

    /// Callback form of [`ReadOnlyCollection::watch`]: drives the watcher
    /// until `f` breaks, `f` fails, or a terminal event arrives.
    pub async fn watch_f<F>(&self, token: CancellationToken, f: F) -> Result<()>
    where
        F: FnMut(&WatchEvent<R>) -> Result<()>,
    {
        let watcher = self.watch(token).await?;
        watch::drive(watcher, f).await
    }

    /// Callback form of [`ReadOnlyCollection::watch_one`].
    pub async fn watch_one_f<F>(&self, token: CancellationToken, key: &str, f: F) -> Result<()>
    where
        F: FnMut(&WatchEvent<R>) -> Result<()>,
    {
        let watcher = self.watch_one(token, key).await?;
        watch::drive(watcher, f).await
    }

    /// Callback form of [`ReadOnlyCollection::watch_by_index`].
    pub async fn watch_by_index_f<F>(
        &self,
        token: CancellationToken,
        index: &str,
        value: &str,
        f: F,
    ) -> Result<()>
    where
        F: FnMut(&WatchEvent<R>) -> Result<()>,
    {
        let watcher = self.watch_by_index(token, index, value).await?;
        watch::drive(watcher, f).await
    }

    fn spawn_watch(&self, token: CancellationToken, filter: WatchFilter) -> Result<Watcher<R>> {
        Ok(watch::spawn(
            Arc::clone(&self.spec),
            self.reader.clone(),
            self.listener.clone(),
            filter,
            token,
        ))
    }

    fn not_found(&self, key: &str) -> Error {
        Error::NotFound {
            collection: self.spec.name.clone(),
            key: key.to_string(),
        }
    }
}

enum PageOutcome {
    Continue,
    Stop,
}

fn deliver_page<R: Record, F>(page: &[RowEntry], f: &mut F) -> Result<PageOutcome>
where
    F: FnMut(&R) -> Result<()>,
{
    for row in page {
        let decoded: R = record::decode(&row.value)?;
        match f(&decoded) {
            Ok(()) => {}
            Err(Error::Break) => return Ok(PageOutcome::Stop),
            Err(e) => return Err(e),
        }
    }
    Ok(PageOutcome::Continue)
}

// =============================================================================
// Read-Write Collection
// =============================================================================

/// Synchronous read/write surface scoped to an open transaction.
///
/// All reads run on the transaction's connection and therefore observe
/// the transaction's own uncommitted writes.
pub struct ReadWriteCollection<'a, R: Record> {
    spec: Arc<CollectionSpec>,
    txn: &'a WriteTxn<'a>,
    list_batch_size: usize,
    _record: PhantomData<fn() -> R>,
}

impl<'a, R: Record> ReadWriteCollection<'a, R> {
    /// Fetches the record stored under `key`, including rows written
    /// earlier in this transaction.
    pub fn get(&self, key: &str) -> Result<R> {
        let row = reader::get_row(self.txn.conn(), &self.spec.name, key)?
            .ok_or_else(|| self.not_found(key))?;
        record::decode(&row.value)
    }

    /// Invokes `f` for each record, in the requested order, observing
    /// this transaction's writes. `Break` semantics match the read-only
    /// form.
    pub fn list<F>(&self, opts: &Options, mut f: F) -> Result<()>
    where
        F: FnMut(&R) -> Result<()>,
    {
        let mut after: Option<PageCursor> = None;
        loop {
            let page = reader::list_page(
                self.txn.conn(),
                &self.spec.name,
                opts,
                after.as_ref(),
                self.list_batch_size,
            )?;
            let full = page.len() == self.list_batch_size;
            if let Some(last) = page.last() {
                after = Some(reader::cursor_after(opts, last));
            }
            match deliver_page::<R, F>(&page, &mut f)? {
                PageOutcome::Stop => return Ok(()),
                PageOutcome::Continue => {}
            }
            if !full {
                return Ok(());
            }
        }
    }

    /// Number of rows, observing this transaction's writes.
    pub fn count(&self) -> Result<i64> {
        reader::count_rows(self.txn.conn(), &self.spec.name)
    }

    /// Inserts a new row. Fails `Exists` if the key is present.
    pub fn create(&self, key: &str, value: &R) -> Result<()> {
        if reader::get_row(self.txn.conn(), &self.spec.name, key)?.is_some() {
            return Err(Error::Exists {
                collection: self.spec.name.clone(),
                key: key.to_string(),
            });
        }
        self.write_row(key, value)
    }

    /// Inserts or replaces the row under `key`.
    pub fn put(&self, key: &str, value: &R) -> Result<()> {
        self.write_row(key, value)
    }

    /// Inserts or replaces a record under its own primary key.
    pub fn put_record(&self, value: &R) -> Result<()> {
        self.put(&value.key(), value)
    }

    /// Reads the row under `key`, lets `mutator` modify it, and writes
    /// the result back. Fails `NotFound` if the key is absent; a mutator
    /// error propagates unchanged and aborts the transaction.
    pub fn update<F>(&self, key: &str, mutator: F) -> Result<R>
    where
        F: FnOnce(&mut R) -> Result<()>,
    {
        let mut current = self.get(key)?;
        mutator(&mut current)?;
        self.write_row(key, &current)?;
        Ok(current)
    }

    /// Like [`ReadWriteCollection::update`], but an absent key hands the
    /// mutator the record's default value instead of failing.
    pub fn upsert<F>(&self, key: &str, mutator: F) -> Result<R>
    where
        F: FnOnce(&mut R) -> Result<()>,
    {
        let mut current = match self.get(key) {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => R::default(),
            Err(e) => return Err(e),
        };
        mutator(&mut current)?;
        self.write_row(key, &current)?;
        Ok(current)
    }

    /// Removes the row under `key`. Fails `NotFound` if absent.
    pub fn delete(&self, key: &str) -> Result<()> {
        let row = reader::get_row(self.txn.conn(), &self.spec.name, key)?
            .ok_or_else(|| self.not_found(key))?;
        self.delete_row(&row)
    }

    /// Removes every row in the collection.
    ///
    /// One delete notification is emitted per removed key; the order of
    /// those notifications across keys is unspecified and consumers must
    /// not depend on it.
    pub fn delete_all(&self) -> Result<()> {
        let mut after: Option<PageCursor> = None;
        let opts = Options::default();
        loop {
            let page = reader::list_page(
                self.txn.conn(),
                &self.spec.name,
                &opts,
                after.as_ref(),
                self.list_batch_size,
            )?;
            let Some(last) = page.last() else {
                return Ok(());
            };
            after = Some(reader::cursor_after(&opts, last));
            for row in &page {
                self.delete_row(row)?;
            }
        }
    }

    // =========================================================================
    // Write internals
    // =========================================================================

    /// Upserts one row, refreshes its index entries, and appends the
    /// notification record, all inside the open transaction.
    fn write_row(&self, key: &str, value: &R) -> Result<()> {
        let bytes = record::encode(value)?;
        let json = record::to_json(value)?;
        // Resolve all index values first so a schema error surfaces
        // before any statement runs.
        let index_map = self.index_map(&json)?;

        let rev = self.txn.next_rev()?;
        let now = current_time_ms();

        self.txn.conn().execute(
            &format!(
                "INSERT INTO {} (key, value, created_rev, updated_rev, created_ms, updated_ms)
                 VALUES (?1, ?2, ?3, ?3, ?4, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     updated_rev = excluded.updated_rev,
                     updated_ms = excluded.updated_ms",
                schema::row_table(&self.spec.name)
            ),
            params![key, bytes, rev.as_raw(), now as i64],
        )?;

        for index in &self.spec.indexes {
            self.txn.conn().execute(
                &format!(
                    "DELETE FROM {} WHERE key = ?1",
                    schema::index_table(&self.spec.name, &index.name)
                ),
                params![key],
            )?;
            let index_value = index_map
                .get(&index.name)
                .expect("index map covers every declared index");
            self.txn.conn().execute(
                &format!(
                    "INSERT INTO {} (index_value, key) VALUES (?1, ?2)",
                    schema::index_table(&self.spec.name, &index.name)
                ),
                params![index_value, key],
            )?;
        }

        let inline = bytes.len() <= self.txn.payload_value_limit();
        let notification = Notification {
            op: NotificationOp::Put,
            key: key.to_string(),
            ts: now,
            rev,
            value: inline.then_some(json),
            indexes: (!index_map.is_empty()).then_some(index_map),
        };
        self.txn
            .append_outbox(&channel_for(&self.spec.name), &notification)
    }

    /// Removes one known-present row, its index entries, and appends the
    /// delete notification.
    fn delete_row(&self, row: &RowEntry) -> Result<()> {
        let json: serde_json::Value = serde_json::from_slice(&row.value)?;
        let index_map = self.index_map(&json)?;

        let rev = self.txn.next_rev()?;
        let now = current_time_ms();

        self.txn.conn().execute(
            &format!(
                "DELETE FROM {} WHERE key = ?1",
                schema::row_table(&self.spec.name)
            ),
            params![row.key],
        )?;
        for index in &self.spec.indexes {
            self.txn.conn().execute(
                &format!(
                    "DELETE FROM {} WHERE key = ?1",
                    schema::index_table(&self.spec.name, &index.name)
                ),
                params![row.key],
            )?;
        }

        let notification = Notification {
            op: NotificationOp::Delete,
            key: row.key.clone(),
            ts: now,
            rev,
            value: None,
            indexes: (!index_map.is_empty()).then_some(index_map),
        };
        self.txn
            .append_outbox(&channel_for(&self.spec.name), &notification)
    }

    fn index_map(&self, json: &serde_json::Value) -> Result<BTreeMap<String, String>> {
        let mut map = BTreeMap::new();
        for index in &self.spec.indexes {
            map.insert(index.name.clone(), record::index_value(json, &index.field)?);
        }
        Ok(map)
    }

    fn not_found(&self, key: &str) -> Error {
        Error::NotFound {
            collection: self.spec.name.clone(),
            key: key.to_string(),
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
    fn test_index_spec_constructors() {
        let explicit = IndexSpec::new("by_state", "state");
        assert_eq!(explicit.name, "by_state");
        assert_eq!(explicit.field, "state");

        let shorthand = IndexSpec::on_field("state");
        assert_eq!(shorthand.name, "state");
        assert_eq!(shorthand.field, "state");
    }

    #[test]
    fn test_spec_index_lookup() {
        let spec = CollectionSpec {
            name: "items".to_string(),
            indexes: vec![IndexSpec::on_field("value")],
        };
        assert!(spec.index("value").is_ok());
        let err = spec.index("missing").unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[test]
    fn test_spec_validation() {
        let good = CollectionSpec {
            name: "items".to_string(),
            indexes: vec![IndexSpec::on_field("value")],
        };
        assert!(good.validate().is_ok());

        let bad_name = CollectionSpec {
            name: "Items!".to_string(),
            indexes: vec![],
        };
        assert!(bad_name.validate().is_err());

        let bad_index = CollectionSpec {
            name: "items".to_string(),
            indexes: vec![IndexSpec::on_field("no good")],
        };
        assert!(bad_index.validate().is_err());
    }
}
