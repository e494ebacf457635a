//! Push connection lifecycle.
//!
//! [`EventStreamConnection`] owns at most one live channel at a time. Every
//! channel gets a generation number when it is installed, and the pump task
//! draining it checks that number before touching shared state, so frames
//! from a superseded channel can never be observed after a reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::channel::{ChannelEvent, ChannelStream, PushChannelOpener};
use crate::error::{Result, StoreError};
use crate::hub::NotificationHub;
use crate::types::{events, CloseReason, ConnectionState, EventKind, Notice, StreamEvent};

/// Wire shape of a `put`/`patch` frame payload.
#[derive(Deserialize)]
struct PushPayload {
    path: String,
    data: Value,
}

struct LiveChannel {
    generation: u64,
    pump: JoinHandle<()>,
}

struct ConnState {
    phase: ConnectionState,
    live: Option<LiveChannel>,
}

/// A single logical push connection to the store.
///
/// Notifications fan out through the shared hub; handlers always run
/// outside the connection's state lock. An unexpected close reports
/// `reset` but leaves the dead channel installed by default, so the next
/// `close()` or `connect()` still observes it and tears it down.
pub struct EventStreamConnection {
    opener: Arc<dyn PushChannelOpener>,
    hub: Arc<NotificationHub<Notice>>,
    state: Mutex<ConnState>,
    generation: AtomicU64,
    clear_live_on_reset: bool,
}

impl EventStreamConnection {
    pub fn new(
        opener: Arc<dyn PushChannelOpener>,
        hub: Arc<NotificationHub<Notice>>,
    ) -> Arc<Self> {
        Self::with_reset_policy(opener, hub, false)
    }

    /// Build a connection with an explicit unexpected-close policy: when
    /// `clear_live_on_reset` is set, a reset drops the channel reference
    /// instead of leaving it installed for a later `close()` or reconnect
    /// to tear down.
    pub fn with_reset_policy(
        opener: Arc<dyn PushChannelOpener>,
        hub: Arc<NotificationHub<Notice>>,
        clear_live_on_reset: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            opener,
            hub,
            state: Mutex::new(ConnState {
                phase: ConnectionState::Disconnected,
                live: None,
            }),
            generation: AtomicU64::new(0),
            clear_live_on_reset,
        })
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> ConnectionState {
        self.state.lock().phase
    }

    /// Open the push channel and start draining it.
    ///
    /// A second connect while a channel is installed, live or dead after a
    /// reset, tears the old one down with a `reconnect` close before
    /// opening the new one. Open failures leave the connection
    /// disconnected and are returned to the caller.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.state.lock().live.is_some() {
            warn!("push channel already installed; replacing it");
            self.close_with(CloseReason::Reconnect);
        }

        let generation = {
            let mut state = self.state.lock();
            state.phase = ConnectionState::Connecting;
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        let mut channel = match self.opener.open().await {
            Ok(channel) => channel,
            Err(err) => {
                self.mark_disconnected(generation);
                return Err(err);
            }
        };

        match channel.next().await {
            Some(ChannelEvent::Open) => {}
            Some(ChannelEvent::Error(message)) => {
                self.mark_disconnected(generation);
                return Err(StoreError::Connection(message));
            }
            _ => {
                self.mark_disconnected(generation);
                return Err(StoreError::Connection(
                    "push channel ended before opening".to_string(),
                ));
            }
        }

        let installed = {
            let mut state = self.state.lock();
            if self.generation.load(Ordering::SeqCst) == generation {
                let pump = tokio::spawn(run_pump(Arc::downgrade(self), generation, channel));
                state.live = Some(LiveChannel { generation, pump });
                state.phase = ConnectionState::Connected;
                true
            } else {
                false
            }
        };

        if installed {
            self.hub.emit(events::CONNECT, &Notice::Connected);
            Ok(())
        } else {
            Err(StoreError::Connection(
                "connection closed while opening".to_string(),
            ))
        }
    }

    /// Tear the channel down on the caller's initiative.
    pub fn close(&self) {
        self.close_with(CloseReason::Closed);
    }

    pub(crate) fn close_with(&self, reason: CloseReason) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let closed_live = {
            let mut state = self.state.lock();
            let live = state.live.take();
            if let Some(live) = &live {
                live.pump.abort();
            }
            // Without a live channel there is nothing to tear down; the
            // phase only moves for an in-flight connect, whose install is
            // now doomed by the generation bump.
            if live.is_some() || state.phase == ConnectionState::Connecting {
                state.phase = ConnectionState::Closed(reason);
            }
            live.is_some()
        };
        if closed_live {
            self.hub.emit(events::CLOSE, &Notice::Closed { reason });
        } else {
            warn!(reason = %reason, "close requested with no live push channel");
        }
    }

    fn mark_disconnected(&self, generation: u64) {
        let mut state = self.state.lock();
        if self.generation.load(Ordering::SeqCst) == generation {
            state.phase = ConnectionState::Disconnected;
        }
    }

    /// True while `generation` is the installed channel.
    fn is_current(&self, generation: u64) -> bool {
        self.state
            .lock()
            .live
            .as_ref()
            .is_some_and(|live| live.generation == generation)
    }

    /// Server-initiated teardown, reported by the pump of `generation`.
    fn finish(&self, generation: u64, reason: CloseReason) {
        let should_emit = {
            let mut state = self.state.lock();
            match &state.live {
                Some(live) if live.generation == generation => {
                    // An unexpected close keeps the dead channel installed
                    // unless configured otherwise; the next close() or
                    // connect() tears it down under its own reason.
                    if reason != CloseReason::Reset || self.clear_live_on_reset {
                        state.live = None;
                    }
                    state.phase = ConnectionState::Closed(reason);
                    true
                }
                _ => false,
            }
        };
        if should_emit {
            warn!(reason = %reason, "push channel closed by server");
            self.hub.emit(events::CLOSE, &Notice::Closed { reason });
        }
    }

    /// Decode one data frame and fan it out.
    ///
    /// Undecodable frames surface as `error` notices; the channel stays up.
    fn dispatch_message(&self, kind: EventKind, data: &str) {
        match serde_json::from_str::<PushPayload>(data) {
            Ok(payload) => {
                let event = StreamEvent {
                    kind,
                    path: payload.path,
                    data: payload.data,
                };
                self.hub.emit(kind.as_str(), &Notice::Stream(event));
            }
            Err(err) => {
                warn!(kind = %kind, error = %err, "undecodable push frame");
                self.hub.emit(
                    events::ERROR,
                    &Notice::Error(format!("undecodable {kind} frame: {err}")),
                );
            }
        }
    }
}

impl Drop for EventStreamConnection {
    fn drop(&mut self) {
        if let Some(live) = self.state.get_mut().live.take() {
            live.pump.abort();
        }
    }
}

async fn run_pump(conn: Weak<EventStreamConnection>, generation: u64, mut channel: ChannelStream) {
    while let Some(event) = channel.next().await {
        let Some(conn) = conn.upgrade() else { return };
        if !conn.is_current(generation) {
            debug!(generation, "dropping event from superseded channel");
            return;
        }
        match event {
            // The opener already consumed the opening event; a repeat is
            // server noise.
            ChannelEvent::Open => debug!("duplicate open event ignored"),
            ChannelEvent::Message { kind, data } => conn.dispatch_message(kind, &data),
            ChannelEvent::Cancel => {
                conn.finish(generation, CloseReason::Cancel);
                return;
            }
            ChannelEvent::AuthRevoked => {
                conn.finish(generation, CloseReason::AuthRevoked);
                return;
            }
            ChannelEvent::Error(message) => {
                warn!(error = %message, "push channel transport error");
                conn.hub.emit(events::ERROR, &Notice::Error(message));
            }
            ChannelEvent::Closed => {
                conn.finish(generation, CloseReason::Reset);
                return;
            }
        }
    }
    if let Some(conn) = conn.upgrade() {
        conn.finish(generation, CloseReason::Reset);
    }
}
