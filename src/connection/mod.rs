//! Live push channel: wire decoding and connection lifecycle.

mod channel;
mod sse;
mod stream;

pub use channel::{ChannelEvent, ChannelStream, PushChannelOpener};
pub use sse::{SseDecoder, SseFrame, SseOpener};
pub use stream::EventStreamConnection;
