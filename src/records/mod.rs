//! Composite keys, record formatting, and range queries.
//!
//! Records live under `<type>!<id>` composite keys whose lexicographic
//! order is the store's native sort order. Range reads lean on that order
//! and therefore always carry an explicit limit.

mod keys;
mod query;

pub use keys::{composite_key, format_record, split_key, KEY_SEPARATOR};
pub use query::{OrderBy, RangeQuery, MAX_LIMIT};
