//! Yjs sync WebSocket endpoint
//!
//! `GET /sync/{user_id}/{project}/{*doc_path}` upgrades into the standard
//! Yjs binary protocol. Incoming frames run through the `yrs` sync message
//! codec; updates are applied with a per-socket origin so the doc observer
//! can fan them out to every peer except the sender.

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;
use yrs::sync::{Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, Transact, Update};

use notehub_core::error::{Error, Result};

use crate::auth;
use crate::hub::{conn_origin, next_conn_id, DocEntry, DocFrame, DocKey};
use crate::metrics::RelayMetrics;
use crate::state::RelayState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Close codes: 1001 = going away (shutdown), 1008 = policy (auth),
/// 1011 = internal error, 1013 = try again later (over capacity).
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_INTERNAL: u16 = 1011;
const CLOSE_OVERLOADED: u16 = 1013;

pub async fn sync_upgrade(
    State(state): State<RelayState>,
    Path((user_id, project, doc_path)): Path<(Uuid, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = auth::authorize(&state, &headers, &query, user_id).await {
        tracing::warn!(user_id = %user_id, error = %e, "sync upgrade rejected");
        return e.into_response();
    }

    let key = DocKey {
        user_id,
        project,
        doc_path,
    };
    ws.on_upgrade(move |socket| handle_sync_socket(state, socket, key))
}

async fn handle_sync_socket(state: RelayState, mut socket: WebSocket, key: DocKey) {
    // Connection cap: accept the upgrade, then close with a non-1000 code.
    let snapshot = state.metrics.snapshot();
    if snapshot.active_connections as usize >= state.config.max_sync_connections {
        tracing::warn!(doc = %key, "connection cap reached, refusing sync socket");
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_OVERLOADED,
                reason: "relay at capacity".into(),
            })))
            .await;
        return;
    }

    let conn_id = next_conn_id();
    RelayMetrics::incr(&state.metrics.connections_opened);

    // Fetch the doc entry; an entry mid-eviction bounces registration, in
    // which case the hub is asked again for a fresh one.
    let (entry, frames) = loop {
        let (entry, created) = state.docs.get_or_create(&key);
        if let Err(e) = entry.ensure_hydrated(&state.store, &state.metrics).await {
            tracing::error!(doc = %key, error = %e, "hydration failed");
            RelayMetrics::incr(&state.metrics.errors);
            let _ = socket
                .send(WsMessage::Close(Some(CloseFrame {
                    code: CLOSE_INTERNAL,
                    reason: "document unavailable".into(),
                })))
                .await;
            RelayMetrics::incr(&state.metrics.connections_closed);
            return;
        }
        if let Some(frames) = entry.register(conn_id) {
            if created {
                // A live provider may hold a fresher copy of this file.
                state.tunnels.request_bridge(&key).await;
            }
            break (entry, frames);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    tracing::debug!(doc = %key, conn_id, "sync socket connected");

    if let Err(e) = send_hello(&mut socket, &state, &entry).await {
        tracing::debug!(doc = %key, conn_id, error = %e, "hello failed");
    } else {
        run_sync_loop(&state, &mut socket, &entry, conn_id, frames).await;
    }

    entry.unregister(conn_id, &state.docs).await;
    RelayMetrics::incr(&state.metrics.connections_closed);
    tracing::debug!(doc = %key, conn_id, "sync socket disconnected");
}

/// Initial handshake: sync step-1 carrying the server state vector, then
/// the current awareness states if any.
async fn send_hello(socket: &mut WebSocket, state: &RelayState, entry: &DocEntry) -> Result<()> {
    let step1 = {
        let txn = entry.doc().transact();
        Message::Sync(SyncMessage::SyncStep1(txn.state_vector())).encode_v1()
    };
    socket
        .send(WsMessage::Binary(step1.into()))
        .await
        .map_err(|e| Error::Internal(format!("ws send: {e}")))?;
    RelayMetrics::incr(&state.metrics.messages_out);

    let awareness_frame = {
        let awareness = entry.awareness().read().await;
        match awareness.update() {
            Ok(update) if !update.clients.is_empty() => {
                Some(Message::Awareness(update).encode_v1())
            }
            _ => None,
        }
    };
    if let Some(frame) = awareness_frame {
        socket
            .send(WsMessage::Binary(frame.into()))
            .await
            .map_err(|e| Error::Internal(format!("ws send: {e}")))?;
        RelayMetrics::incr(&state.metrics.messages_out);
    }
    Ok(())
}

async fn run_sync_loop(
    state: &RelayState,
    socket: &mut WebSocket,
    entry: &DocEntry,
    conn_id: u64,
    mut frames: tokio::sync::broadcast::Receiver<DocFrame>,
) {
    let origin = conn_origin(conn_id);
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // first tick fires immediately
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        tracing::debug!(conn_id, error = %e, "sync socket error");
                        break;
                    }
                    None => break,
                };
                match message {
                    WsMessage::Binary(data) => {
                        RelayMetrics::incr(&state.metrics.messages_in);
                        match handle_frame(entry, conn_id, &data).await {
                            Ok(replies) => {
                                for reply in replies {
                                    if socket.send(WsMessage::Binary(reply.into())).await.is_err() {
                                        return;
                                    }
                                    RelayMetrics::incr(&state.metrics.messages_out);
                                }
                            }
                            Err(e) => {
                                RelayMetrics::incr(&state.metrics.errors);
                                tracing::warn!(conn_id, error = %e, "bad sync frame");
                            }
                        }
                    }
                    WsMessage::Pong(_) => {
                        awaiting_pong = false;
                    }
                    WsMessage::Close(_) => break,
                    // Pings are answered by the protocol layer; text frames
                    // are not part of the sync protocol.
                    _ => {}
                }
            }
            frame = frames.recv() => {
                match frame {
                    Ok(frame) => {
                        if frame.origin.as_ref() == Some(&origin) {
                            continue;
                        }
                        if socket.send(WsMessage::Binary(frame.data.into())).await.is_err() {
                            break;
                        }
                        RelayMetrics::incr(&state.metrics.messages_out);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        // Slow consumer; peers resync via step-1 on reconnect.
                        tracing::warn!(conn_id, skipped, "sync fan-out lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = heartbeat.tick() => {
                if awaiting_pong {
                    tracing::debug!(conn_id, "heartbeat missed, terminating");
                    break;
                }
                if socket.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
            _ = state.shutdown.cancelled() => {
                let _ = socket
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: CLOSE_GOING_AWAY,
                        reason: "relay shutting down".into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

/// Decode one protocol frame and run it through the sync state machine.
/// Returns the frames to send back on this socket.
async fn handle_frame(entry: &DocEntry, conn_id: u64, data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let message = Message::decode_v1(data)
        .map_err(|e| Error::BadRequest(format!("malformed sync message: {e}")))?;

    let mut replies = Vec::new();
    match message {
        Message::Sync(SyncMessage::SyncStep1(remote_sv)) => {
            let diff = {
                let txn = entry.doc().transact();
                txn.encode_state_as_update_v1(&remote_sv)
            };
            replies.push(Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1());
        }
        Message::Sync(SyncMessage::SyncStep2(update)) | Message::Sync(SyncMessage::Update(update)) => {
            let update = Update::decode_v1(&update)
                .map_err(|e| Error::BadRequest(format!("malformed update: {e}")))?;
            let mut txn = entry.doc().transact_mut_with(conn_origin(conn_id));
            txn.apply_update(update)
                .map_err(|e| Error::BadRequest(format!("update rejected: {e}")))?;
        }
        Message::Awareness(update) => {
            entry.track_awareness_clients(conn_id, update.clients.keys().copied());
            {
                let awareness = entry.awareness().write().await;
                awareness
                    .apply_update(update)
                    .map_err(|e| Error::BadRequest(format!("awareness rejected: {e}")))?;
            }
            // Relay the original frame to every peer; awareness is not
            // observed on the doc, so fan-out happens here.
            entry.broadcast(DocFrame {
                origin: Some(conn_origin(conn_id)),
                data: data.to_vec(),
            });
        }
        Message::AwarenessQuery => {
            let update = {
                let awareness = entry.awareness().read().await;
                awareness.update().ok()
            };
            if let Some(update) = update {
                replies.push(Message::Awareness(update).encode_v1());
            }
        }
        // Auth and custom messages are not used by this deployment.
        Message::Auth(_) | Message::Custom(..) => {}
    }

    Ok(replies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Doc, GetString, StateVector, Text};

    /// Drive the step-1/step-2 handshake by hand and check convergence.
    #[test]
    fn step1_reply_carries_missing_updates() {
        let server = Doc::new();
        let text = server.get_or_insert_text("content");
        {
            let mut txn = server.transact_mut();
            text.insert(&mut txn, 0, "persisted");
        }

        // Client starts empty and sends step-1 with an empty state vector.
        let diff = {
            let txn = server.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        let reply = Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1();

        // Client applies the step-2 payload.
        let client = Doc::new();
        let client_text = client.get_or_insert_text("content");
        match Message::decode_v1(&reply).unwrap() {
            Message::Sync(SyncMessage::SyncStep2(update)) => {
                let mut txn = client.transact_mut();
                txn.apply_update(Update::decode_v1(&update).unwrap()).unwrap();
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let txn = client.transact();
        assert_eq!(client_text.get_string(&txn), "persisted");
    }

    /// Two docs exchanging updates through encoded frames converge.
    #[test]
    fn concurrent_inserts_converge() {
        let a = Doc::new();
        let b = Doc::new();
        let ta = a.get_or_insert_text("content");
        let tb = b.get_or_insert_text("content");

        {
            let mut txn = a.transact_mut();
            ta.insert(&mut txn, 0, "Hello ");
        }
        // Ship A's state to B.
        let a_state = {
            let txn = a.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        {
            let mut txn = b.transact_mut();
            txn.apply_update(Update::decode_v1(&a_state).unwrap()).unwrap();
        }
        {
            let mut txn = b.transact_mut();
            let len = yrs::Text::len(&tb, &txn);
            tb.insert(&mut txn, len, "world");
        }
        // Ship B's state back to A.
        let b_state = {
            let txn = b.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        {
            let mut txn = a.transact_mut();
            txn.apply_update(Update::decode_v1(&b_state).unwrap()).unwrap();
        }

        let txn_a = a.transact();
        let txn_b = b.transact();
        assert_eq!(ta.get_string(&txn_a), "Hello world");
        assert_eq!(ta.get_string(&txn_a), tb.get_string(&txn_b));
    }
}
