//! Range-query parameter construction.

use crate::ids::boundary_id;
use crate::records::keys::KEY_SEPARATOR;
use serde_json::Value;

/// Largest limit the store accepts, used whenever the caller gives none.
///
/// The store only guarantees ordered range results when a limit is present,
/// so every query carries one.
pub const MAX_LIMIT: i64 = i32::MAX as i64;

/// Index a range query is ordered by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderBy {
    /// Native composite-key order.
    Key,
    /// The server-assigned write timestamp.
    Timestamp,
}

impl OrderBy {
    fn as_literal(self) -> &'static str {
        match self {
            OrderBy::Key => "$key",
            OrderBy::Timestamp => "timestamp",
        }
    }
}

/// Parameters for one ordered range read.
#[derive(Clone, Debug)]
pub struct RangeQuery {
    order_by: OrderBy,
    start_at: Option<String>,
    end_at: Option<String>,
    limit_to_last: i64,
}

impl RangeQuery {
    /// Everything strictly after `cursor` in native key order.
    ///
    /// The start bound is the cursor with the separator appended: the
    /// separator is the smallest symbol in the keyspace, and generated ids
    /// have a fixed length, so no stored key sorts between the cursor and
    /// that bound.
    pub fn after_key(cursor: &str) -> Self {
        Self {
            order_by: OrderBy::Key,
            start_at: Some(format!("{cursor}{KEY_SEPARATOR}")),
            end_at: None,
            limit_to_last: MAX_LIMIT,
        }
    }

    /// Records whose ids were minted between `start` and `end` millis,
    /// inclusive on both ends.
    ///
    /// Bounds are synthetic boundary ids one millisecond outside the window,
    /// which keeps every real id minted inside it between them regardless of
    /// its random suffix.
    pub fn time_window(start: i64, end: i64, limit: Option<i64>) -> Self {
        let limit_to_last = match limit {
            Some(n) if n > 0 => n,
            _ => MAX_LIMIT,
        };
        Self {
            order_by: OrderBy::Key,
            start_at: Some(boundary_id((start - 1).max(0))),
            end_at: Some(boundary_id(end + 1)),
            limit_to_last,
        }
    }

    /// The `n` most recent records by server timestamp.
    pub fn latest(n: i64) -> Self {
        Self {
            order_by: OrderBy::Timestamp,
            start_at: None,
            end_at: None,
            limit_to_last: n,
        }
    }

    /// Render the REST query pairs for this range.
    ///
    /// String parameter values are JSON-quoted on the wire, so `orderBy`
    /// is sent as `"$key"` rather than `$key`.
    pub fn params(&self) -> Vec<(String, String)> {
        let mut params = vec![("orderBy".to_string(), quoted(self.order_by.as_literal()))];
        if let Some(start) = &self.start_at {
            params.push(("startAt".to_string(), quoted(start)));
        }
        if let Some(end) = &self.end_at {
            params.push(("endAt".to_string(), quoted(end)));
        }
        params.push(("limitToLast".to_string(), self.limit_to_last.to_string()));
        params
    }
}

fn quoted(literal: &str) -> String {
    Value::String(literal.to_string()).to_string()
}
