//! # Emberstore
//!
//! Async client for a hierarchical record store with live change
//! propagation.
//!
//! ## Core Concepts
//!
//! - **Records**: Typed values under `<type>!<id>` composite keys, stamped
//!   with server-assigned timestamps
//! - **Push channel**: Server-sent change stream fanned out through a
//!   notification hub (`put`, `patch`, `update`, `connect`, `close`, `error`)
//! - **Sortable ids**: Generated identifiers whose prefix encodes the mint
//!   time, so key order is chronological order
//! - **Range reads**: Cursor and time-window queries over the native key
//!   order
//!
//! ## Example
//!
//! ```ignore
//! use emberstore::{RecordStore, StoreConfig};
//!
//! let store = RecordStore::new(StoreConfig::new("https://example.test/rooms/lobby"))?;
//! store.connect().await?;
//!
//! // Write a record under a freshly minted id
//! let id = store.generate_id();
//! let record = store.write("chat", &id, json!({"text": "Hello, world!"})).await?;
//!
//! // Everything after a sync cursor
//! let newer = store.list_after_cursor(&record.key()?).await?;
//!
//! // React to live changes
//! store.notifications().on("update", |notice| println!("{notice:?}"));
//! ```

pub mod connection;
pub mod error;
pub mod hub;
pub mod ids;
pub mod records;
pub mod store;
pub mod transport;
pub mod types;

// Re-exports
pub use connection::{
    ChannelEvent, ChannelStream, EventStreamConnection, PushChannelOpener, SseDecoder, SseFrame,
    SseOpener,
};
pub use error::{Result, StoreError};
pub use hub::{HandlerId, NotificationHub};
pub use ids::{boundary_id, decode_time, IdGenerator, ALPHABET, ID_LEN};
pub use records::{
    composite_key, format_record, split_key, OrderBy, RangeQuery, KEY_SEPARATOR, MAX_LIMIT,
};
pub use store::{DeleteBehavior, RecordStore, StoreConfig};
pub use transport::{HttpTransport, Method, PointRequest};
pub use types::*;
