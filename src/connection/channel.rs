//! Push-channel abstraction.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::EventKind;

/// One event from an open push channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The server accepted the subscription; always the first event.
    Open,
    /// A named data frame carrying an undecoded JSON payload.
    Message { kind: EventKind, data: String },
    /// The server cancelled the subscription.
    Cancel,
    /// The server revoked the credentials behind the subscription.
    AuthRevoked,
    /// The transport failed mid-stream.
    Error(String),
    /// The server closed the channel cleanly.
    Closed,
}

/// Events produced by an open channel, in arrival order.
pub type ChannelStream = BoxStream<'static, ChannelEvent>;

/// Opens a push channel against the store.
///
/// Failures after the channel is open travel through the stream as
/// [`ChannelEvent`]s rather than through this trait.
#[async_trait]
pub trait PushChannelOpener: Send + Sync {
    async fn open(&self) -> Result<ChannelStream>;
}
