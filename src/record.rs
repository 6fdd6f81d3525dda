//! # Record Encoding and Index Extraction
//!
//! Collections store opaque bytes; this module is the boundary where
//! typed records become those bytes and come back out unchanged. It also
//! extracts index values from records by structural field reference, so
//! the storage layer never needs to know concrete record types.
//!
//! ## Encoding
//!
//! Records are encoded as canonical JSON via serde. The encoding is
//! lossless for any type whose `Serialize`/`Deserialize` implementations
//! round-trip, which the [`Record`] bounds require in practice. All row
//! metadata (key, revisions, timestamps) lives in table columns, not in
//! the blob, so the stored bytes are exactly the record and nothing else.
//!
//! ## Index Extraction
//!
//! An index names a field of the record. Rather than requiring per-type
//! accessor code, the field is looked up structurally in the record's
//! JSON form: `IndexSpec { field: "state" }` reads the `state` field of
//! whatever record type the collection holds. Scalar fields (strings,
//! numbers, booleans) become the index value; anything else is a schema
//! error surfaced as `Fatal` at write time.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

// =============================================================================
// Record Trait
// =============================================================================

/// A typed value storable in a collection.
///
/// The trait is deliberately small: serde provides the codec, `Default`
/// provides the zero value that `upsert` hands to its mutator for absent
/// rows, and [`Record::key`] exposes the record's primary-key field so
/// helpers can accept record-only writes.
pub trait Record:
    Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static
{
    /// Returns the record's primary-key value.
    ///
    /// Must be stable: two calls on an unmodified record return the same
    /// string, and the string equals the row key the record is stored
    /// under when written through the record-only helpers.
    fn key(&self) -> String;
}

// =============================================================================
// Codec
// =============================================================================

/// Encodes a record to its canonical stored bytes.
pub fn encode<R: Record>(record: &R) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}

/// Decodes stored bytes back into a record.
pub fn decode<R: Record>(bytes: &[u8]) -> Result<R> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Converts a record to its JSON form for index extraction and inline
/// notification values.
pub fn to_json<R: Record>(record: &R) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(record)?)
}

/// Decodes a record from an inline notification value.
pub fn from_json<R: Record>(value: serde_json::Value) -> Result<R> {
    Ok(serde_json::from_value(value)?)
}

/// Extracts the comparable index value for `field` from a record's JSON
/// form.
///
/// Strings index as themselves; numbers and booleans index as their
/// display form. A missing, null, or composite field is a schema error:
/// indexes must be derivable from every record in the collection.
pub fn index_value(record_json: &serde_json::Value, field: &str) -> Result<String> {
    let value = record_json.get(field).ok_or_else(|| {
        Error::Fatal(format!("index field '{field}' missing from record"))
    })?;
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        other => Err(Error::Fatal(format!(
            "index field '{field}' is not a scalar: {other}"
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================
