//! Server-sent-events wire format.
//!
//! The store pushes changes over a long-lived HTTP response in the SSE
//! framing: `event:`/`data:` field lines terminated by a blank line, with
//! `:` comment lines as keep-alive padding. [`SseDecoder`] turns raw bytes
//! into frames incrementally, so frames split across transport chunks come
//! out whole.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, stream, Stream, StreamExt};
use reqwest::{header, Client};
use tracing::{debug, warn};

use crate::connection::channel::{ChannelEvent, ChannelStream, PushChannelOpener};
use crate::error::{Result, StoreError};
use crate::records::RangeQuery;
use crate::types::EventKind;

/// One decoded SSE frame: the event name and its joined data payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    pub name: String,
    pub data: String,
}

/// Incremental SSE frame decoder.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event_name: String,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return every frame it completes.
    ///
    /// Bytes after the last newline stay buffered until the rest of their
    /// line arrives.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let mut line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(frame) = self.take_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn take_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_name = value.to_string(),
            "data" => self.data_lines.push(value.to_string()),
            // id, retry and unknown fields carry nothing the store uses
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.event_name.is_empty() && self.data_lines.is_empty() {
            return None;
        }
        let name = std::mem::take(&mut self.event_name);
        let data = std::mem::take(&mut self.data_lines).join("\n");
        Some(SseFrame { name, data })
    }
}

/// Map a decoded frame onto the channel event model.
///
/// Keep-alive frames are dropped here; unrecognized names are logged and
/// dropped rather than tearing the channel down.
fn map_frame(frame: SseFrame) -> Option<ChannelEvent> {
    if let Some(kind) = EventKind::from_name(&frame.name) {
        return Some(ChannelEvent::Message {
            kind,
            data: frame.data,
        });
    }
    match frame.name.as_str() {
        "keep-alive" => None,
        "cancel" => Some(ChannelEvent::Cancel),
        "auth_revoked" => Some(ChannelEvent::AuthRevoked),
        name => {
            warn!(event = %name, "unrecognized push channel event");
            None
        }
    }
}

struct Pump {
    bytes: futures::stream::BoxStream<'static, std::result::Result<Bytes, PumpError>>,
    decoder: SseDecoder,
    pending: VecDeque<ChannelEvent>,
    ended: bool,
}

struct PumpError(String);

impl fmt::Display for PumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decode a raw byte stream into channel events.
///
/// The output always terminates with exactly one of [`ChannelEvent::Error`]
/// or [`ChannelEvent::Closed`].
fn decode_channel<S, E>(bytes: S) -> ChannelStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + 'static,
{
    let pump = Pump {
        bytes: bytes
            .map(|item| item.map_err(|err| PumpError(err.to_string())))
            .boxed(),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        ended: false,
    };
    stream::unfold(pump, |mut pump| async move {
        loop {
            if let Some(event) = pump.pending.pop_front() {
                return Some((event, pump));
            }
            if pump.ended {
                return None;
            }
            match pump.bytes.next().await {
                Some(Ok(chunk)) => {
                    for frame in pump.decoder.feed(&chunk) {
                        if let Some(event) = map_frame(frame) {
                            pump.pending.push_back(event);
                        }
                    }
                }
                Some(Err(err)) => {
                    pump.ended = true;
                    pump.pending.push_back(ChannelEvent::Error(err.to_string()));
                }
                None => {
                    pump.ended = true;
                    pump.pending.push_back(ChannelEvent::Closed);
                }
            }
        }
    })
    .boxed()
}

/// Production channel opener speaking SSE over HTTP.
pub struct SseOpener {
    client: Client,
    url: String,
}

impl SseOpener {
    /// Build an opener for the store at `base_url` (no `.json` suffix).
    ///
    /// Only the connect phase is bounded by `connect_timeout`; an overall
    /// request timeout would kill the long-lived stream.
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self {
            client,
            url: format!("{base_url}.json"),
        })
    }
}

#[async_trait]
impl PushChannelOpener for SseOpener {
    async fn open(&self) -> Result<ChannelStream> {
        let response = self
            .client
            .get(&self.url)
            .header(header::ACCEPT, "text/event-stream")
            .query(&RangeQuery::latest(1).params())
            .send()
            .await
            .map_err(|err| StoreError::Connection(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Connection(format!(
                "push channel refused with {status}: {body}"
            )));
        }

        debug!(url = %self.url, "push channel open");
        let events = stream::once(future::ready(ChannelEvent::Open))
            .chain(decode_channel(response.bytes_stream()));
        Ok(events.boxed())
    }
}
