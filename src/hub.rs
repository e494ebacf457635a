//! Named-event notification hub.
//!
//! One reusable publish/subscribe mechanism shared by the connection and the
//! store facade. Handlers are invoked synchronously, in registration order,
//! against a snapshot of the registrations taken when `emit` is called: a
//! handler registered during an emission never sees that emission, and
//! removing or adding handlers from inside a handler is safe.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Identity of one registration, returned by [`NotificationHub::on`].
///
/// Closures have no structural equality in Rust, so removal is by handle
/// rather than by value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration<T> {
    id: HandlerId,
    handler: Handler<T>,
}

/// Minimal named-event publish/subscribe registry.
///
/// No persistence and no history replay: `emit` reaches exactly the handlers
/// registered at that moment.
pub struct NotificationHub<T> {
    registry: Mutex<HashMap<String, Vec<Registration<T>>>>,
    next_id: AtomicU64,
}

impl<T> NotificationHub<T> {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` for `event`. Handlers run in registration order on
    /// every emission of that event until removed via [`off`](Self::off).
    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut registry = self.registry.lock();
        registry
            .entry(event.to_string())
            .or_default()
            .push(Registration {
                id,
                handler: Arc::new(handler),
            });
        id
    }

    /// Remove the registration identified by `id`. Removing an id that is
    /// not registered for `event` is a no-op; returns whether a registration
    /// was removed.
    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        let mut registry = self.registry.lock();
        if let Some(entries) = registry.get_mut(event) {
            if let Some(pos) = entries.iter().position(|r| r.id == id) {
                entries.remove(pos);
                if entries.is_empty() {
                    registry.remove(event);
                }
                return true;
            }
        }
        false
    }

    /// Invoke every handler currently registered for `event`, in order,
    /// passing `payload`. A panicking handler is isolated and logged so the
    /// remaining handlers still run.
    pub fn emit(&self, event: &str, payload: &T) {
        // Snapshot outside the lock so handlers may re-enter on/off/emit.
        let snapshot: Vec<Handler<T>> = {
            let registry = self.registry.lock();
            match registry.get(event) {
                Some(entries) => entries.iter().map(|r| Arc::clone(&r.handler)).collect(),
                None => return,
            }
        };

        for handler in snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(payload)));
            if outcome.is_err() {
                warn!(event = %event, "notification handler panicked; continuing with remaining handlers");
            }
        }
    }

    /// Number of handlers currently registered for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.registry.lock().get(event).map_or(0, Vec::len)
    }
}

impl<T> Default for NotificationHub<T> {
    fn default() -> Self {
        Self::new()
    }
}
