//! Error types for the store client.

use crate::transport::Method;
use thiserror::Error;

/// Main error type for client operations.
///
/// Steady-state stream failures are not represented here: after the push
/// channel has opened, errors are delivered as `error` notifications rather
/// than failed results. Identifier-space exhaustion is a fatal invariant
/// violation and panics instead of returning an error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A point request returned a non-200 status. Carries the raw response
    /// body; never retried automatically.
    #[error("Request failed: {method} {url} returned {status}: {body}")]
    Request {
        method: Method,
        url: String,
        status: u16,
        body: String,
    },

    /// The push channel failed before reporting open. Errors after open are
    /// delivered as `error` notifications instead.
    #[error("Connection failed before open: {0}")]
    Connection(String),

    /// A composite key without the `<type>!<id>` shape.
    #[error("Malformed composite key: {0:?}")]
    MalformedKey(String),

    /// A record type containing the key separator.
    #[error("Invalid record type {0:?}: must not contain '!'")]
    InvalidType(String),

    /// The configured base URL could not be parsed.
    #[error("Invalid base URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, StoreError>;
