//! Composite key handling and record formatting.

use crate::error::{Result, StoreError};
use crate::types::Record;
use serde_json::Value;

/// Separator between the type and id halves of a composite key.
pub const KEY_SEPARATOR: char = '!';

/// Build the composite key for a type/id pair.
///
/// The type must not contain the separator; a violation would corrupt key
/// parsing on every later read, so it is rejected at build time.
pub fn composite_key(record_type: &str, id: &str) -> Result<String> {
    if record_type.contains(KEY_SEPARATOR) {
        return Err(StoreError::InvalidType(record_type.to_string()));
    }
    Ok(format!("{record_type}{KEY_SEPARATOR}{id}"))
}

/// Split a composite key into its type and id halves.
///
/// Splits on the FIRST separator. Both halves must be non-empty; anything
/// else is reported as [`StoreError::MalformedKey`], never silently dropped.
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once(KEY_SEPARATOR) {
        Some((record_type, id)) if !record_type.is_empty() && !id.is_empty() => {
            Ok((record_type, id))
        }
        _ => Err(StoreError::MalformedKey(key.to_string())),
    }
}

/// Reconstitute a typed record from a composite key and a raw store node.
///
/// Nodes written through [`RecordStore::write`](crate::store::RecordStore::write)
/// carry the `{timestamp, value}` wrapper, which is lifted into the record;
/// a wrapper without a value (a delete tombstone) yields a null value. Any
/// other shape becomes the record value unchanged, with no timestamp.
pub fn format_record(key: &str, raw: Value) -> Result<Record> {
    let (record_type, id) = split_key(key)?;
    let (timestamp, value) = split_wrapper(raw);
    Ok(Record {
        record_type: record_type.to_string(),
        id: id.to_string(),
        timestamp,
        value,
    })
}

/// Detect and lift the `{timestamp, value}` write wrapper.
fn split_wrapper(raw: Value) -> (Option<i64>, Value) {
    match raw {
        Value::Object(mut fields)
            if fields.contains_key("timestamp")
                && fields.keys().all(|k| k == "timestamp" || k == "value") =>
        {
            // The timestamp may still be the server-substitution marker if a
            // read races the write; treat that as not-yet-assigned.
            let timestamp = fields.get("timestamp").and_then(Value::as_i64);
            let value = fields.remove("value").unwrap_or(Value::Null);
            (timestamp, value)
        }
        other => (None, other),
    }
}

impl Record {
    /// Re-derive the composite key this record lives under.
    pub fn key(&self) -> Result<String> {
        composite_key(&self.record_type, &self.id)
    }
}
