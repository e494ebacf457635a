//! Store facade tying point operations, range reads, identifier minting
//! and the push connection together.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::connection::{EventStreamConnection, PushChannelOpener, SseOpener};
use crate::error::{Result, StoreError};
use crate::hub::NotificationHub;
use crate::ids::IdGenerator;
use crate::records::{composite_key, format_record, RangeQuery};
use crate::transport::{HttpTransport, Method, PointRequest};
use crate::types::{events, now_millis, CloseReason, ConnectionState, Notice, Record, StreamEvent};

// --- Configuration ---

/// What a delete leaves at the record's key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeleteBehavior {
    /// Keep a timestamp-only tombstone so live subscribers observe the
    /// deletion as a change.
    #[default]
    Tombstone,
    /// Remove the node entirely.
    Remove,
}

/// Store client configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Root URL of the store, without the `.json` suffix.
    pub base_url: String,
    /// Timeout applied to every point request.
    pub request_timeout: Duration,
    /// Record type floated to the front of cursor reads.
    pub priority_record_type: Option<String>,
    /// What `delete` leaves behind.
    pub delete_behavior: DeleteBehavior,
    /// Forget the channel after a server reset: the connection drops the
    /// dead channel reference and the store drops its connection handle.
    /// When unset both stay installed, and a later `close()` or reconnect
    /// tears the dead channel down under its own reason.
    pub clear_connection_on_reset: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            request_timeout: Duration::from_secs(10),
            priority_record_type: None,
            delete_behavior: DeleteBehavior::default(),
            clear_connection_on_reset: false,
        }
    }
}

impl StoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_priority_record_type(mut self, record_type: impl Into<String>) -> Self {
        self.priority_record_type = Some(record_type.into());
        self
    }

    pub fn with_delete_behavior(mut self, behavior: DeleteBehavior) -> Self {
        self.delete_behavior = behavior;
        self
    }

    pub fn with_clear_connection_on_reset(mut self, clear: bool) -> Self {
        self.clear_connection_on_reset = clear;
        self
    }
}

// --- Store ---

/// Client for one hierarchical record store.
///
/// All point and range operations go through the REST surface; live
/// changes arrive over the push connection and fan out through
/// [`notifications`](RecordStore::notifications).
pub struct RecordStore {
    config: StoreConfig,
    transport: Arc<dyn PointRequest>,
    opener: Arc<dyn PushChannelOpener>,
    hub: Arc<NotificationHub<Notice>>,
    connection: Mutex<Option<Arc<EventStreamConnection>>>,
    generator: Mutex<IdGenerator>,
    /// Server clock minus local clock, learned from snapshots.
    clock_skew: AtomicI64,
}

impl RecordStore {
    /// Build a store client over HTTP.
    pub fn new(config: StoreConfig) -> Result<Arc<Self>> {
        if config.base_url.trim_end_matches('/').is_empty() {
            return Err(StoreError::InvalidUrl(config.base_url));
        }
        let transport = Arc::new(HttpTransport::new(config.request_timeout)?);
        let opener = Arc::new(SseOpener::new(
            config.base_url.trim_end_matches('/'),
            config.request_timeout,
        )?);
        Ok(Self::with_parts(config, transport, opener))
    }

    /// Build a store over caller-supplied transport and channel opener.
    pub fn with_parts(
        mut config: StoreConfig,
        transport: Arc<dyn PointRequest>,
        opener: Arc<dyn PushChannelOpener>,
    ) -> Arc<Self> {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        let store = Arc::new(Self {
            config,
            transport,
            opener,
            hub: Arc::new(NotificationHub::new()),
            connection: Mutex::new(None),
            generator: Mutex::new(IdGenerator::new()),
            clock_skew: AtomicI64::new(0),
        });
        store.install_handlers();
        store
    }

    /// Notification hub carrying `put`, `patch`, `update`, `connect`,
    /// `close` and `error` events.
    pub fn notifications(&self) -> &Arc<NotificationHub<Notice>> {
        &self.hub
    }

    // --- Connection lifecycle ---

    /// Open the push connection, reusing the existing connection object
    /// when one is present.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let conn = {
            let mut slot = self.connection.lock();
            Arc::clone(slot.get_or_insert_with(|| {
                EventStreamConnection::with_reset_policy(
                    Arc::clone(&self.opener),
                    Arc::clone(&self.hub),
                    self.config.clear_connection_on_reset,
                )
            }))
        };
        conn.connect().await
    }

    /// Close the push connection on the caller's initiative.
    pub fn close(&self) {
        let conn = self.connection.lock().clone();
        match conn {
            Some(conn) => conn.close(),
            None => warn!("close requested before any connection was opened"),
        }
    }

    /// Lifecycle phase of the push connection.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection
            .lock()
            .as_ref()
            .map_or(ConnectionState::Disconnected, |conn| conn.state())
    }

    // --- Point operations ---

    /// Write `value` under `<record_type>!<id>`, stamped with the server's
    /// clock, and return the stored record.
    pub async fn write(&self, record_type: &str, id: &str, value: Value) -> Result<Record> {
        let key = composite_key(record_type, id)?;
        let body = json!({ "timestamp": { ".sv": "timestamp" }, "value": value });
        let stored = self
            .transport
            .request(Method::Put, &self.node_url(&key), &[], Some(body))
            .await?;
        format_record(&key, stored)
    }

    /// Fetch one record; `Ok(None)` when nothing lives at the key.
    pub async fn read(&self, record_type: &str, id: &str) -> Result<Option<Record>> {
        let key = composite_key(record_type, id)?;
        let raw = self
            .transport
            .request(Method::Get, &self.node_url(&key), &[], None)
            .await?;
        if raw.is_null() {
            return Ok(None);
        }
        Ok(Some(format_record(&key, raw)?))
    }

    /// Delete the record and return what now lives at its key: the
    /// formatted tombstone under [`DeleteBehavior::Tombstone`], or a
    /// null-valued record once [`DeleteBehavior::Remove`] has taken the
    /// node out entirely.
    pub async fn delete(&self, record_type: &str, id: &str) -> Result<Record> {
        let key = composite_key(record_type, id)?;
        let stored = match self.config.delete_behavior {
            DeleteBehavior::Tombstone => {
                let body = json!({ "timestamp": { ".sv": "timestamp" } });
                self.transport
                    .request(Method::Put, &self.node_url(&key), &[], Some(body))
                    .await?
            }
            DeleteBehavior::Remove => {
                self.transport
                    .request(Method::Delete, &self.node_url(&key), &[], None)
                    .await?;
                Value::Null
            }
        };
        debug!(key = %key, "record deleted");
        format_record(&key, stored)
    }

    // --- Range reads ---

    /// Records strictly after `cursor` in native key order.
    ///
    /// With a priority type configured, records of that type move to the
    /// front of the result; relative order within each group is preserved.
    pub async fn list_after_cursor(&self, cursor: &str) -> Result<Vec<Record>> {
        let query = RangeQuery::after_key(cursor);
        let raw = self
            .transport
            .request(Method::Get, &self.root_url(), &query.params(), None)
            .await?;
        let mut records = collect_records(raw);
        if let Some(priority) = &self.config.priority_record_type {
            records.sort_by_key(|record| record.record_type != *priority);
        }
        Ok(records)
    }

    /// Records whose ids were minted between `start` and `end` millis,
    /// inclusive, in native key order.
    pub async fn list_in_time_window(
        &self,
        start: i64,
        end: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Record>> {
        let query = RangeQuery::time_window(start, end, limit);
        let raw = self
            .transport
            .request(Method::Get, &self.root_url(), &query.params(), None)
            .await?;
        Ok(collect_records(raw))
    }

    // --- Identifiers and time ---

    /// Estimate of the server's current clock, in millis since the epoch.
    pub fn server_time_millis(&self) -> i64 {
        now_millis() + self.clock_skew.load(Ordering::SeqCst)
    }

    /// Mint a sortable identifier aligned to the server clock estimate.
    pub fn generate_id(&self) -> String {
        let now = self.server_time_millis();
        self.generator.lock().generate(now)
    }

    // --- Internals ---

    fn node_url(&self, key: &str) -> String {
        format!("{}/{}.json", self.config.base_url, key)
    }

    fn root_url(&self) -> String {
        format!("{}/.json", self.config.base_url)
    }

    /// Subscribe the store to its own hub for update re-emission and for
    /// the reset policy. Handlers hold a weak reference so the hub never
    /// keeps the store alive.
    fn install_handlers(self: &Arc<Self>) {
        for event in [events::PUT, events::PATCH] {
            let store = Arc::downgrade(self);
            self.hub.on(event, move |notice: &Notice| {
                let Some(store) = store.upgrade() else { return };
                if let Notice::Stream(stream_event) = notice {
                    store.apply_stream_event(stream_event);
                }
            });
        }

        let store = Arc::downgrade(self);
        self.hub.on(events::CLOSE, move |notice: &Notice| {
            let Some(store) = store.upgrade() else { return };
            if matches!(
                notice,
                Notice::Closed {
                    reason: CloseReason::Reset
                }
            ) && store.config.clear_connection_on_reset
            {
                store.connection.lock().take();
                info!("push connection handle cleared after server reset");
            }
        });
    }

    /// Re-emit a raw stream change as formatted `update` notices.
    ///
    /// Only whole-record paths are formatted; changes below a record are
    /// left to raw `put`/`patch` subscribers.
    fn apply_stream_event(&self, event: &StreamEvent) {
        if event.is_snapshot() {
            self.apply_snapshot(&event.data);
            return;
        }
        let key = event.path.trim_start_matches('/');
        if key.contains('/') {
            debug!(path = %event.path, "sub-record change left to raw subscribers");
            return;
        }
        match format_record(key, event.data.clone()) {
            Ok(record) => self.hub.emit(events::UPDATE, &Notice::Update(record)),
            Err(err) => {
                warn!(path = %event.path, error = %err, "unformattable change notification");
            }
        }
    }

    /// Fan out an initial snapshot and learn the server clock from it.
    fn apply_snapshot(&self, data: &Value) {
        let Value::Object(fields) = data else { return };
        let mut newest = None;
        for (key, node) in fields {
            match format_record(key, node.clone()) {
                Ok(record) => {
                    if let Some(ts) = record.timestamp {
                        newest = Some(newest.map_or(ts, |n: i64| n.max(ts)));
                    }
                    self.hub.emit(events::UPDATE, &Notice::Update(record));
                }
                Err(err) => warn!(key = %key, error = %err, "skipping malformed snapshot entry"),
            }
        }
        if let Some(server_now) = newest {
            let skew = server_now - now_millis();
            self.clock_skew.store(skew, Ordering::SeqCst);
            debug!(skew_ms = skew, "server clock skew updated");
        }
    }
}

/// Fold a range-read body into records, preserving native key order.
fn collect_records(raw: Value) -> Vec<Record> {
    let Value::Object(fields) = raw else {
        return Vec::new();
    };
    let mut records = Vec::with_capacity(fields.len());
    for (key, node) in fields {
        match format_record(&key, node) {
            Ok(record) => records.push(record),
            Err(err) => warn!(key = %key, error = %err, "skipping malformed range entry"),
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelStream;
    use crate::ids::decode_time;
    use crate::types::EventKind;
    use serde_json::json;
    use std::collections::VecDeque;

    struct RecordedCall {
        method: Method,
        url: String,
        query: Vec<(String, String)>,
        body: Option<Value>,
    }

    struct MockTransport {
        calls: Mutex<Vec<RecordedCall>>,
        responses: Mutex<VecDeque<Result<Value>>>,
    }

    #[async_trait::async_trait]
    impl PointRequest for MockTransport {
        async fn request(
            &self,
            method: Method,
            url: &str,
            query: &[(String, String)],
            body: Option<Value>,
        ) -> Result<Value> {
            self.calls.lock().push(RecordedCall {
                method,
                url: url.to_string(),
                query: query.to_vec(),
                body,
            });
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(Value::Null))
        }
    }

    struct NullOpener;

    #[async_trait::async_trait]
    impl PushChannelOpener for NullOpener {
        async fn open(&self) -> Result<ChannelStream> {
            Err(StoreError::Connection("no channel".to_string()))
        }
    }

    fn test_store_with(
        config: StoreConfig,
        responses: Vec<Result<Value>>,
    ) -> (Arc<RecordStore>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport {
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(responses.into()),
        });
        let store = RecordStore::with_parts(
            config,
            Arc::clone(&transport) as Arc<dyn PointRequest>,
            Arc::new(NullOpener),
        );
        (store, transport)
    }

    fn test_store(responses: Vec<Result<Value>>) -> (Arc<RecordStore>, Arc<MockTransport>) {
        test_store_with(StoreConfig::new("http://store.test/root"), responses)
    }

    fn query_param(call: &RecordedCall, name: &str) -> Option<String> {
        call.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }

    #[tokio::test]
    async fn test_write_wraps_value_and_formats_response() {
        let (store, transport) = test_store(vec![Ok(
            json!({"timestamp": 1234, "value": {"text": "hi"}}),
        )]);

        let record = store.write("chat", "A1", json!({"text": "hi"})).await.unwrap();
        assert_eq!(record.record_type, "chat");
        assert_eq!(record.id, "A1");
        assert_eq!(record.timestamp, Some(1234));
        assert_eq!(record.value, json!({"text": "hi"}));

        let calls = transport.calls.lock();
        assert_eq!(calls[0].method, Method::Put);
        assert_eq!(calls[0].url, "http://store.test/root/chat!A1.json");
        assert_eq!(
            calls[0].body,
            Some(json!({"timestamp": {".sv": "timestamp"}, "value": {"text": "hi"}}))
        );
    }

    #[tokio::test]
    async fn test_read_missing_record_returns_none() {
        let (store, transport) = test_store(vec![Ok(Value::Null)]);

        let found = store.read("chat", "MISSING").await.unwrap();
        assert_eq!(found, None);

        let calls = transport.calls.lock();
        assert_eq!(calls[0].method, Method::Get);
        assert_eq!(calls[0].url, "http://store.test/root/chat!MISSING.json");
    }

    #[tokio::test]
    async fn test_read_lifts_stored_wrapper() {
        let (store, _) = test_store(vec![Ok(json!({"timestamp": 7, "value": 41}))]);

        let record = store.read("counter", "X").await.unwrap().unwrap();
        assert_eq!(record.timestamp, Some(7));
        assert_eq!(record.value, json!(41));
    }

    #[tokio::test]
    async fn test_invalid_type_rejected_before_any_request() {
        let (store, transport) = test_store(vec![]);

        let err = store.write("bad!type", "A", json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidType(_)));
        assert!(transport.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone_by_default() {
        let (store, transport) = test_store(vec![Ok(json!({"timestamp": 99}))]);

        let removed = store.delete("chat", "A1").await.unwrap();
        assert_eq!(removed.record_type, "chat");
        assert_eq!(removed.id, "A1");
        assert_eq!(removed.timestamp, Some(99));
        assert!(removed.value.is_null());

        let calls = transport.calls.lock();
        assert_eq!(calls[0].method, Method::Put);
        assert_eq!(calls[0].body, Some(json!({"timestamp": {".sv": "timestamp"}})));
    }

    #[tokio::test]
    async fn test_delete_remove_behavior_issues_delete() {
        let config = StoreConfig::new("http://store.test/root")
            .with_delete_behavior(DeleteBehavior::Remove);
        let (store, transport) = test_store_with(config, vec![Ok(Value::Null)]);

        let removed = store.delete("chat", "A1").await.unwrap();
        assert_eq!(removed.timestamp, None);
        assert!(removed.value.is_null());

        let calls = transport.calls.lock();
        assert_eq!(calls[0].method, Method::Delete);
        assert_eq!(calls[0].body, None);
    }

    #[tokio::test]
    async fn test_list_after_cursor_preserves_key_order() {
        let (store, transport) = test_store(vec![Ok(json!({
            "chat!B": {"timestamp": 2, "value": "b"},
            "chat!C": {"timestamp": 3, "value": "c"},
            "note!A": {"timestamp": 1, "value": "a"},
        }))]);

        let records = store.list_after_cursor("chat!A").await.unwrap();
        let keys: Vec<String> = records.iter().map(|r| r.key().unwrap()).collect();
        assert_eq!(keys, vec!["chat!B", "chat!C", "note!A"]);

        let calls = transport.calls.lock();
        assert_eq!(calls[0].url, "http://store.test/root/.json");
        assert_eq!(query_param(&calls[0], "orderBy").as_deref(), Some("\"$key\""));
        assert_eq!(
            query_param(&calls[0], "startAt").as_deref(),
            Some("\"chat!A!\"")
        );
    }

    #[tokio::test]
    async fn test_list_after_cursor_floats_priority_type() {
        let config = StoreConfig::new("http://store.test/root")
            .with_priority_record_type("task");
        let (store, _) = test_store_with(
            config,
            vec![Ok(json!({
                "chat!B": {"timestamp": 2, "value": "b"},
                "note!A": {"timestamp": 1, "value": "a"},
                "task!A": {"timestamp": 4, "value": "t1"},
                "task!C": {"timestamp": 5, "value": "t2"},
            }))],
        );

        let records = store.list_after_cursor("chat!A").await.unwrap();
        let keys: Vec<String> = records.iter().map(|r| r.key().unwrap()).collect();
        assert_eq!(keys, vec!["task!A", "task!C", "chat!B", "note!A"]);
    }

    #[tokio::test]
    async fn test_list_after_cursor_skips_malformed_entries() {
        let (store, _) = test_store(vec![Ok(json!({
            "chat!B": {"timestamp": 2, "value": "b"},
            "no-separator": {"timestamp": 1, "value": "x"},
        }))]);

        let records = store.list_after_cursor("chat!A").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "B");
    }

    #[tokio::test]
    async fn test_list_in_time_window_brackets_the_window() {
        let (store, transport) = test_store(vec![Ok(Value::Null)]);

        let records = store.list_in_time_window(5_000, 6_000, Some(25)).await.unwrap();
        assert!(records.is_empty());

        let calls = transport.calls.lock();
        let start = query_param(&calls[0], "startAt").unwrap();
        let end = query_param(&calls[0], "endAt").unwrap();
        assert_eq!(decode_time(start.trim_matches('"')), Some(4_999));
        assert_eq!(decode_time(end.trim_matches('"')), Some(6_001));
        assert_eq!(query_param(&calls[0], "limitToLast").as_deref(), Some("25"));
    }

    #[tokio::test]
    async fn test_empty_base_url_rejected() {
        assert!(matches!(
            RecordStore::new(StoreConfig::new("/")),
            Err(StoreError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_trailing_slash_trimmed_from_base_url() {
        let (store, transport) = test_store_with(
            StoreConfig::new("http://store.test/root/"),
            vec![Ok(Value::Null)],
        );

        store.read("chat", "A").await.unwrap();
        assert_eq!(
            transport.calls.lock()[0].url,
            "http://store.test/root/chat!A.json"
        );
    }

    #[tokio::test]
    async fn test_snapshot_re_emits_updates_and_learns_clock() {
        let (store, _) = test_store(vec![]);
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        store.notifications().on(events::UPDATE, move |notice: &Notice| {
            if let Notice::Update(record) = notice {
                sink.lock().push(record.clone());
            }
        });

        let server_now = now_millis() + 120_000;
        let snapshot = StreamEvent {
            kind: EventKind::Put,
            path: "/".to_string(),
            data: json!({
                "chat!A": {"timestamp": server_now - 10, "value": "a"},
                "chat!B": {"timestamp": server_now, "value": "b"},
            }),
        };
        store
            .notifications()
            .emit(events::PUT, &Notice::Stream(snapshot));

        assert_eq!(updates.lock().len(), 2);

        // The skew estimate comes from the newest snapshot timestamp.
        let estimated = store.server_time_millis();
        assert!((estimated - server_now).abs() < 5_000);
    }

    #[tokio::test]
    async fn test_generated_ids_follow_server_clock() {
        let (store, _) = test_store(vec![]);

        let server_now = now_millis() + 300_000;
        let snapshot = StreamEvent {
            kind: EventKind::Put,
            path: "/".to_string(),
            data: json!({"chat!A": {"timestamp": server_now, "value": 1}}),
        };
        store
            .notifications()
            .emit(events::PUT, &Notice::Stream(snapshot));

        let id = store.generate_id();
        let minted_at = decode_time(&id).unwrap();
        assert!((minted_at - server_now).abs() < 5_000);
    }

    #[tokio::test]
    async fn test_single_record_change_re_emitted_as_update() {
        let (store, _) = test_store(vec![]);
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        store.notifications().on(events::UPDATE, move |notice: &Notice| {
            if let Notice::Update(record) = notice {
                sink.lock().push(record.clone());
            }
        });

        let change = StreamEvent {
            kind: EventKind::Put,
            path: "/chat!A".to_string(),
            data: json!({"timestamp": 10, "value": {"t": "hi"}}),
        };
        store
            .notifications()
            .emit(events::PUT, &Notice::Stream(change));

        let seen = updates.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].record_type, "chat");
        assert_eq!(seen[0].id, "A");
        assert_eq!(seen[0].timestamp, Some(10));
    }

    #[tokio::test]
    async fn test_sub_record_change_not_re_emitted() {
        let (store, _) = test_store(vec![]);
        let updates = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&updates);
        store.notifications().on(events::UPDATE, move |_: &Notice| {
            *sink.lock() += 1;
        });

        let change = StreamEvent {
            kind: EventKind::Patch,
            path: "/chat!A/value/text".to_string(),
            data: json!("edited"),
        };
        store
            .notifications()
            .emit(events::PATCH, &Notice::Stream(change));

        assert_eq!(*updates.lock(), 0);
    }

    #[tokio::test]
    async fn test_request_failures_propagate() {
        let (store, _) = test_store(vec![Err(StoreError::Request {
            method: Method::Get,
            url: "http://store.test/root/chat!A.json".to_string(),
            status: 401,
            body: "{\"error\":\"Permission denied\"}".to_string(),
        })]);

        let err = store.read("chat", "A").await.unwrap_err();
        assert!(matches!(err, StoreError::Request { status: 401, .. }));
    }
}
