//! Runtime tunnel hub
//!
//! A desktop machine-agent opens an outbound WebSocket as *provider*; web
//! and mobile clients connect as *consumers* and execute code through the
//! active provider. One room per user holds any number of providers and
//! consumers and at most one active machine.
//!
//! Invariants:
//! - `active_machine_id` always names a currently-connected provider or is
//!   `None`,
//! - when providers exist and none is active, auto-select picks the first
//!   connected (insertion order),
//! - consumer payloads go to the active provider only; provider payloads
//!   fan out to every consumer.

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use notehub_core::error::{Error, Result};
use notehub_core::model::MachineStatus;
use notehub_core::PostgresStore;

use crate::auth;
use crate::hub::{next_conn_id, DocKey};
use crate::metrics::RelayMetrics;
use crate::state::RelayState;

/// One bridge request per (user, project, doc) per minute.
const BRIDGE_REQUEST_WINDOW: Duration = Duration::from_secs(60);

const OUTBOX_DEPTH: usize = 64;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderMeta {
    #[serde(rename = "machineName")]
    pub machine_name: Option<String>,
    pub hostname: Option<String>,
    pub capabilities: Vec<String>,
}

struct Provider {
    conn_id: u64,
    machine_id: String,
    meta: ProviderMeta,
    sender: mpsc::Sender<WsMessage>,
}

/// All tunnel state for one user.
#[derive(Default)]
struct TunnelRoom {
    /// Insertion order doubles as the auto-select order.
    providers: Vec<Provider>,
    active_machine_id: Option<String>,
    consumers: HashMap<u64, mpsc::Sender<WsMessage>>,
}

impl TunnelRoom {
    fn is_empty(&self) -> bool {
        self.providers.is_empty() && self.consumers.is_empty()
    }

    fn auto_select(&mut self) {
        let connected = |id: &str| self.providers.iter().any(|p| p.machine_id == id);
        match &self.active_machine_id {
            Some(active) if connected(active) => {}
            _ => {
                self.active_machine_id = self.providers.first().map(|p| p.machine_id.clone());
            }
        }
    }

    fn status_message(&self) -> serde_json::Value {
        let machines: Vec<serde_json::Value> = self
            .providers
            .iter()
            .map(|p| {
                json!({
                    "machineId": p.machine_id,
                    "machineName": p.meta.machine_name,
                    "hostname": p.meta.hostname,
                    "capabilities": p.meta.capabilities,
                    "active": self.active_machine_id.as_deref() == Some(p.machine_id.as_str()),
                })
            })
            .collect();
        json!({
            "t": "provider-status",
            "activeMachineId": self.active_machine_id,
            "machines": machines,
        })
    }
}

/// Serializable tunnel status for the control API.
#[derive(Debug, Serialize)]
pub struct TunnelStatus {
    #[serde(rename = "activeMachineId")]
    pub active_machine_id: Option<String>,
    pub machines: Vec<serde_json::Value>,
    #[serde(rename = "consumerCount")]
    pub consumer_count: usize,
}

pub struct TunnelHub {
    rooms: DashMap<Uuid, TunnelRoom>,
    bridge_marks: DashMap<(Uuid, String, String), Instant>,
    store: PostgresStore,
}

impl TunnelHub {
    pub fn new(store: PostgresStore) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            rooms: DashMap::new(),
            bridge_marks: DashMap::new(),
            store,
        })
    }

    /// Register a provider. Returns the displaced connection's sender when a
    /// provider for the same machine was already connected.
    fn connect_provider(
        &self,
        user_id: Uuid,
        provider: Provider,
    ) -> (Option<mpsc::Sender<WsMessage>>, Vec<mpsc::Sender<WsMessage>>, serde_json::Value) {
        let mut room = self.rooms.entry(user_id).or_default();

        let displaced = room
            .providers
            .iter()
            .position(|p| p.machine_id == provider.machine_id)
            .map(|idx| room.providers.remove(idx).sender);

        room.providers.push(provider);
        room.auto_select();

        let status = room.status_message();
        let consumers = room.consumers.values().cloned().collect();
        (displaced, consumers, status)
    }

    /// Remove a provider connection. A stale disconnect (the machine was
    /// already replaced by a newer socket) leaves the room untouched.
    fn disconnect_provider(
        &self,
        user_id: Uuid,
        conn_id: u64,
    ) -> Option<(String, bool, Vec<mpsc::Sender<WsMessage>>, serde_json::Value)> {
        let mut room = self.rooms.get_mut(&user_id)?;
        let idx = room.providers.iter().position(|p| p.conn_id == conn_id)?;
        let removed = room.providers.remove(idx);

        if room.active_machine_id.as_deref() == Some(removed.machine_id.as_str()) {
            room.active_machine_id = None;
            room.auto_select();
        }

        let machine_still_connected = room
            .providers
            .iter()
            .any(|p| p.machine_id == removed.machine_id);
        let message = if room.providers.is_empty() {
            json!({ "t": "provider-gone" })
        } else {
            room.status_message()
        };
        let consumers: Vec<_> = room.consumers.values().cloned().collect();

        let empty = room.is_empty();
        drop(room);
        if empty {
            self.rooms.remove_if(&user_id, |_, room| room.is_empty());
        }

        Some((removed.machine_id, machine_still_connected, consumers, message))
    }

    /// Apply a `provider-info` payload to the provider's metadata.
    fn update_provider_meta(&self, user_id: Uuid, conn_id: u64, meta: ProviderMeta) {
        if let Some(mut room) = self.rooms.get_mut(&user_id) {
            if let Some(provider) = room.providers.iter_mut().find(|p| p.conn_id == conn_id) {
                provider.meta = meta;
            }
        }
    }

    fn connect_consumer(
        &self,
        user_id: Uuid,
        conn_id: u64,
        sender: mpsc::Sender<WsMessage>,
    ) -> serde_json::Value {
        let mut room = self.rooms.entry(user_id).or_default();
        room.consumers.insert(conn_id, sender);
        room.status_message()
    }

    fn disconnect_consumer(&self, user_id: Uuid, conn_id: u64) {
        if let Some(mut room) = self.rooms.get_mut(&user_id) {
            room.consumers.remove(&conn_id);
            let empty = room.is_empty();
            drop(room);
            if empty {
                self.rooms.remove_if(&user_id, |_, room| room.is_empty());
            }
        }
    }

    fn consumer_senders(&self, user_id: Uuid) -> Vec<mpsc::Sender<WsMessage>> {
        self.rooms
            .get(&user_id)
            .map(|room| room.consumers.values().cloned().collect())
            .unwrap_or_default()
    }

    fn active_provider_sender(&self, user_id: Uuid) -> Option<mpsc::Sender<WsMessage>> {
        let room = self.rooms.get(&user_id)?;
        let active = room.active_machine_id.as_deref()?;
        room.providers
            .iter()
            .find(|p| p.machine_id == active)
            .map(|p| p.sender.clone())
    }

    fn provider_senders(&self, user_id: Uuid) -> Vec<mpsc::Sender<WsMessage>> {
        self.rooms
            .get(&user_id)
            .map(|room| room.providers.iter().map(|p| p.sender.clone()).collect())
            .unwrap_or_default()
    }

    pub fn status(&self, user_id: Uuid) -> TunnelStatus {
        match self.rooms.get(&user_id) {
            Some(room) => {
                let message = room.status_message();
                TunnelStatus {
                    active_machine_id: room.active_machine_id.clone(),
                    machines: message["machines"].as_array().cloned().unwrap_or_default(),
                    consumer_count: room.consumers.len(),
                }
            }
            None => TunnelStatus {
                active_machine_id: None,
                machines: Vec::new(),
                consumer_count: 0,
            },
        }
    }

    /// Switch the active machine. `None` re-runs auto-select. Naming a
    /// machine that is not connected is a 404.
    pub async fn set_active(&self, user_id: Uuid, machine_id: Option<String>) -> Result<TunnelStatus> {
        let (consumers, status_frame) = {
            let mut room = self
                .rooms
                .get_mut(&user_id)
                .ok_or_else(|| Error::NotFound("no tunnel for user".to_string()))?;

            match machine_id {
                Some(id) => {
                    if !room.providers.iter().any(|p| p.machine_id == id) {
                        return Err(Error::NotFound(format!("machine {id} is not connected")));
                    }
                    room.active_machine_id = Some(id);
                }
                None => {
                    room.active_machine_id = None;
                    room.auto_select();
                }
            }
            (
                room.consumers.values().cloned().collect::<Vec<_>>(),
                room.status_message(),
            )
        };

        broadcast_json(&consumers, &status_frame).await;
        Ok(self.status(user_id))
    }

    /// Ask the user's online providers to inject state for a document the
    /// relay just loaded. Rate-limited per doc.
    pub async fn request_bridge(&self, key: &DocKey) {
        let mark = (key.user_id, key.project.clone(), key.doc_path.clone());
        let now = Instant::now();
        let allowed = match self.bridge_marks.entry(mark) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if now.duration_since(*occupied.get()) >= BRIDGE_REQUEST_WINDOW {
                    occupied.insert(now);
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        };
        if !allowed {
            return;
        }

        let providers = self.provider_senders(key.user_id);
        if providers.is_empty() {
            return;
        }
        let frame = json!({
            "t": "bridge-request",
            "project": key.project,
            "docPath": key.doc_path,
        });
        broadcast_json(&providers, &frame).await;
        tracing::debug!(doc = %key, providers = providers.len(), "bridge requested");
    }
}

async fn broadcast_json(senders: &[mpsc::Sender<WsMessage>], frame: &serde_json::Value) {
    let text = frame.to_string();
    for sender in senders {
        let _ = sender.send(WsMessage::Text(text.clone().into())).await;
    }
}

// ----------------------------------------------------------------------
// WebSocket endpoint
// ----------------------------------------------------------------------

/// `GET /tunnel/{user_id}?role=provider|consumer&machine_id=...`
pub async fn tunnel_upgrade(
    State(state): State<RelayState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = auth::authorize(&state, &headers, &query, user_id).await {
        tracing::warn!(user_id = %user_id, error = %e, "tunnel upgrade rejected");
        return e.into_response();
    }

    let role = query.get("role").map(String::as_str).unwrap_or("consumer").to_string();
    if role == "provider" && !query.contains_key("machine_id") {
        return Error::BadRequest("provider requires machine_id".to_string()).into_response();
    }

    ws.on_upgrade(move |socket| async move {
        RelayMetrics::incr(&state.metrics.connections_opened);
        if role == "provider" {
            run_provider(state.clone(), socket, user_id, query).await;
        } else {
            run_consumer(state.clone(), socket, user_id).await;
        }
        RelayMetrics::incr(&state.metrics.connections_closed);
    })
}

async fn run_provider(
    state: RelayState,
    socket: WebSocket,
    user_id: Uuid,
    query: HashMap<String, String>,
) {
    let conn_id = next_conn_id();
    let machine_id = query.get("machine_id").cloned().unwrap_or_default();
    let meta = ProviderMeta {
        machine_name: query.get("machine_name").cloned(),
        hostname: query.get("hostname").cloned(),
        capabilities: Vec::new(),
    };

    let (outbox, mut outbox_rx) = mpsc::channel::<WsMessage>(OUTBOX_DEPTH);
    let (displaced, consumers, status) = state.tunnels.connect_provider(
        user_id,
        Provider {
            conn_id,
            machine_id: machine_id.clone(),
            meta: meta.clone(),
            sender: outbox,
        },
    );

    // A newer socket for the same machine replaces the old one cleanly.
    if let Some(old) = displaced {
        let _ = old
            .send(WsMessage::Close(Some(CloseFrame {
                code: 1000,
                reason: "replaced by newer connection".into(),
            })))
            .await;
    }

    if let Err(e) = state
        .store
        .upsert_machine(
            &user_id,
            &machine_id,
            meta.machine_name.as_deref(),
            meta.hostname.as_deref(),
            &[],
            MachineStatus::Online,
        )
        .await
    {
        tracing::warn!(user_id = %user_id, machine_id, error = %e, "machine upsert failed");
    }

    broadcast_json(&consumers, &status).await;
    tracing::info!(user_id = %user_id, machine_id, conn_id, "provider connected");

    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(30));
    heartbeat.tick().await;
    let mut awaiting_pong = false;
    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        RelayMetrics::incr(&state.metrics.messages_in);
                        handle_provider_message(&state, user_id, conn_id, text.as_str()).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => awaiting_pong = false,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(conn_id, error = %e, "provider socket error");
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                // Half-open sockets must flip the machine offline promptly.
                if awaiting_pong {
                    break;
                }
                if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
            outgoing = outbox_rx.recv() => {
                match outgoing {
                    Some(message) => {
                        let closing = matches!(message, WsMessage::Close(_));
                        if sink.send(message).await.is_err() || closing {
                            break;
                        }
                        RelayMetrics::incr(&state.metrics.messages_out);
                    }
                    None => break,
                }
            }
            _ = state.shutdown.cancelled() => {
                let _ = sink
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "relay shutting down".into(),
                    })))
                    .await;
                break;
            }
        }
    }

    if let Some((machine_id, still_connected, consumers, message)) =
        state.tunnels.disconnect_provider(user_id, conn_id)
    {
        // Replacement sockets keep the machine online in the store.
        if !still_connected {
            if let Err(e) = state.store.set_machine_offline(&user_id, &machine_id).await {
                tracing::warn!(user_id = %user_id, machine_id, error = %e, "machine offline update failed");
            }
        }
        broadcast_json(&consumers, &message).await;
        tracing::info!(user_id = %user_id, machine_id, conn_id, "provider disconnected");
    }
}

/// Intercept `provider-info` to refresh metadata, then forward the raw
/// payload to every consumer.
async fn handle_provider_message(state: &RelayState, user_id: Uuid, conn_id: u64, text: &str) {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
        if value.get("t").and_then(|t| t.as_str()) == Some("provider-info") {
            let meta = ProviderMeta {
                machine_name: value
                    .get("machineName")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                hostname: value.get("hostname").and_then(|v| v.as_str()).map(String::from),
                capabilities: value
                    .get("capabilities")
                    .and_then(|v| v.as_array())
                    .map(|caps| {
                        caps.iter()
                            .filter_map(|c| c.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default(),
            };
            state.tunnels.update_provider_meta(user_id, conn_id, meta);
        }
    }

    let consumers = state.tunnels.consumer_senders(user_id);
    for consumer in consumers {
        let _ = consumer.send(WsMessage::Text(text.to_string().into())).await;
        RelayMetrics::incr(&state.metrics.messages_out);
    }
}

async fn run_consumer(state: RelayState, socket: WebSocket, user_id: Uuid) {
    let conn_id = next_conn_id();
    let (outbox, mut outbox_rx) = mpsc::channel::<WsMessage>(OUTBOX_DEPTH);

    let snapshot = state.tunnels.connect_consumer(user_id, conn_id, outbox);
    tracing::debug!(user_id = %user_id, conn_id, "consumer connected");

    let (mut sink, mut stream) = socket.split();

    // Immediate provider snapshot so the client can render machine state.
    if sink
        .send(WsMessage::Text(snapshot.to_string().into()))
        .await
        .is_err()
    {
        state.tunnels.disconnect_consumer(user_id, conn_id);
        return;
    }

    let mut heartbeat = tokio::time::interval(Duration::from_secs(30));
    heartbeat.tick().await;
    let mut awaiting_pong = false;
    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        RelayMetrics::incr(&state.metrics.messages_in);
                        // Consumer traffic goes to the active provider only.
                        if let Some(provider) = state.tunnels.active_provider_sender(user_id) {
                            let _ = provider.send(WsMessage::Text(text)).await;
                            RelayMetrics::incr(&state.metrics.messages_out);
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => awaiting_pong = false,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(conn_id, error = %e, "consumer socket error");
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if awaiting_pong {
                    break;
                }
                if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
            outgoing = outbox_rx.recv() => {
                match outgoing {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = state.shutdown.cancelled() => {
                let _ = sink
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "relay shutting down".into(),
                    })))
                    .await;
                break;
            }
        }
    }

    state.tunnels.disconnect_consumer(user_id, conn_id);
    tracing::debug!(user_id = %user_id, conn_id, "consumer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(conn_id: u64, machine_id: &str) -> (Provider, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (
            Provider {
                conn_id,
                machine_id: machine_id.to_string(),
                meta: ProviderMeta::default(),
                sender: tx,
            },
            rx,
        )
    }

    fn test_hub() -> std::sync::Arc<TunnelHub> {
        // Store is only touched by the socket handlers, not the room logic
        // under test, so a lazily-connecting pool is fine here.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/notehub_test")
            .expect("lazy pool");
        TunnelHub::new(PostgresStore::from_pool(pool, 200))
    }

    #[tokio::test]
    async fn first_provider_is_auto_selected() {
        let hub = test_hub();
        let user = Uuid::new_v4();

        let (p1, _rx1) = provider(1, "m1");
        let (displaced, _, status) = hub.connect_provider(user, p1);
        assert!(displaced.is_none());
        assert_eq!(status["activeMachineId"], "m1");

        let (p2, _rx2) = provider(2, "m2");
        let (_, _, status) = hub.connect_provider(user, p2);
        // m1 stays active; m2 is merely available.
        assert_eq!(status["activeMachineId"], "m1");
        assert_eq!(status["machines"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_machine_displaces_old_connection() {
        let hub = test_hub();
        let user = Uuid::new_v4();

        let (p1, _rx1) = provider(1, "m1");
        hub.connect_provider(user, p1);
        let (p1b, _rx2) = provider(2, "m1");
        let (displaced, _, status) = hub.connect_provider(user, p1b);

        assert!(displaced.is_some());
        assert_eq!(status["machines"].as_array().unwrap().len(), 1);

        // The old connection's disconnect must not tear down the new one.
        let result = hub.disconnect_provider(user, 1);
        assert!(result.is_none());
        assert_eq!(hub.status(user).machines.len(), 1);
    }

    #[tokio::test]
    async fn active_failover_on_disconnect() {
        let hub = test_hub();
        let user = Uuid::new_v4();

        let (p1, _rx1) = provider(1, "m1");
        let (p2, _rx2) = provider(2, "m2");
        hub.connect_provider(user, p1);
        hub.connect_provider(user, p2);

        let (machine_id, still_connected, _, message) =
            hub.disconnect_provider(user, 1).expect("removed");
        assert_eq!(machine_id, "m1");
        assert!(!still_connected);
        assert_eq!(message["t"], "provider-status");
        assert_eq!(message["activeMachineId"], "m2");
    }

    #[tokio::test]
    async fn last_provider_broadcasts_gone() {
        let hub = test_hub();
        let user = Uuid::new_v4();

        let (p1, _rx1) = provider(1, "m1");
        hub.connect_provider(user, p1);
        let (_, _, _, message) = hub.disconnect_provider(user, 1).expect("removed");
        assert_eq!(message["t"], "provider-gone");
    }

    #[tokio::test]
    async fn set_active_rejects_unknown_machine() {
        let hub = test_hub();
        let user = Uuid::new_v4();
        let (p1, _rx1) = provider(1, "m1");
        hub.connect_provider(user, p1);

        let err = hub
            .set_active(user, Some("m9".to_string()))
            .await
            .expect_err("unknown machine");
        assert!(matches!(err, Error::NotFound(_)));

        let status = hub.set_active(user, Some("m1".to_string())).await.unwrap();
        assert_eq!(status.active_machine_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn set_active_null_reselects() {
        let hub = test_hub();
        let user = Uuid::new_v4();
        let (p1, _rx1) = provider(1, "m1");
        let (p2, _rx2) = provider(2, "m2");
        hub.connect_provider(user, p1);
        hub.connect_provider(user, p2);

        hub.set_active(user, Some("m2".to_string())).await.unwrap();
        let status = hub.set_active(user, None).await.unwrap();
        // Auto-select returns to the first connected provider.
        assert_eq!(status.active_machine_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn consumer_messages_reach_active_provider_only() {
        let hub = test_hub();
        let user = Uuid::new_v4();
        let (p1, mut rx1) = provider(1, "m1");
        let (p2, mut rx2) = provider(2, "m2");
        hub.connect_provider(user, p1);
        hub.connect_provider(user, p2);
        hub.set_active(user, Some("m2".to_string())).await.unwrap();

        let active = hub.active_provider_sender(user).expect("active sender");
        active
            .send(WsMessage::Text("{\"t\":\"run\"}".to_string().into()))
            .await
            .unwrap();

        assert!(rx2.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn bridge_requests_are_rate_limited() {
        let hub = test_hub();
        let user = Uuid::new_v4();
        let (p1, mut rx1) = provider(1, "m1");
        hub.connect_provider(user, p1);

        let key = DocKey {
            user_id: user,
            project: "Scratch".to_string(),
            doc_path: "a.md".to_string(),
        };
        hub.request_bridge(&key).await;
        hub.request_bridge(&key).await;

        let first = rx1.try_recv().expect("first bridge request");
        match first {
            WsMessage::Text(text) => assert!(text.as_str().contains("bridge-request")),
            other => panic!("unexpected frame: {other:?}"),
        }
        // Second within the window is suppressed.
        assert!(rx1.try_recv().is_err());
    }
}
