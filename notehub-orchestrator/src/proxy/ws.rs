//! WebSocket upgrade routing and the bidirectional proxy primitive
//!
//! Three upgrade families:
//! - `/sync/{uid}/{project}/{*doc}` — straight to the sync relay with the
//!   validated identity attached,
//! - `/tunnel/{uid}` — to the relay's tunnel endpoint, query preserved,
//! - `/u/{uid}/...` — to the user's editor container, except legacy editor
//!   sync paths, which honor `SYNC_MODE` (mirror / relay-primary).
//!
//! The proxy dials the upstream before completing the client upgrade, so a
//! dead upstream is a plain 502 rather than an open-then-slam socket.

use axum::extract::ws::{
    CloseFrame as AxCloseFrame, Message as AxMessage, WebSocket, WebSocketUpgrade,
};
use axum::extract::{Path, State};
use axum::http::Uri;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TgCloseFrame;
use tokio_tungstenite::tungstenite::Message as TgMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use notehub_core::error::Error;
use notehub_core::SyncMode;

use crate::proxy::path_and_query;
use crate::session::AuthedUser;
use crate::state::AppState;

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frames replicated into a mirror connection buffer while (and after) the
/// mirror dials. Bounded: a stuck mirror never backpressures the primary.
const MIRROR_BUFFER: usize = 64;

// ----------------------------------------------------------------------
// Route handlers
// ----------------------------------------------------------------------

/// `/sync/{user_id}/{project}/{*doc_path}` — direct relay path.
pub async fn sync_ws(
    State(state): State<AppState>,
    Path((user_id, project, doc_path)): Path<(Uuid, String, String)>,
    authed: AuthedUser,
    upgrade: WebSocketUpgrade,
) -> Response {
    if authed.user.id != user_id {
        return Error::Forbidden("not your document".to_string()).into_response();
    }

    let target = format!(
        "{}/sync/{}/{}/{}",
        state.config.relay_ws_url(),
        user_id,
        project,
        doc_path
    );
    proxy_upgrade(state, upgrade, target, identity_headers(&authed), None).await
}

/// `/tunnel/{user_id}` — relay tunnel path, query string preserved
/// (`role`, machine metadata).
pub async fn tunnel_ws(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    authed: AuthedUser,
    uri: Uri,
    upgrade: WebSocketUpgrade,
) -> Response {
    if authed.user.id != user_id {
        return Error::Forbidden("not your tunnel".to_string()).into_response();
    }

    let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
    let target = format!("{}/tunnel/{}{}", state.config.relay_ws_url(), user_id, query);
    proxy_upgrade(state, upgrade, target, identity_headers(&authed), None).await
}

/// WebSocket leg of `/u/{uid}/{rest}`; the caller already authenticated
/// and tenant-checked.
pub(crate) async fn editor_ws(
    state: AppState,
    authed: AuthedUser,
    user_id: Uuid,
    rest: String,
    uri: Uri,
    upgrade: WebSocketUpgrade,
) -> Response {
    let legacy_doc = legacy_sync_doc(&rest);

    // Legacy editor sync upgrades are where the sync modes bite.
    if let Some(doc_path) = legacy_doc {
        let relay_target = format!(
            "{}/sync/{}/default/{}",
            state.config.relay_ws_url(),
            user_id,
            doc_path
        );

        match state.config.sync_mode {
            SyncMode::RelayPrimary => {
                // The editor container is bypassed entirely.
                return proxy_upgrade(state.clone(), upgrade, relay_target, identity_headers(&authed), None)
                    .await;
            }
            SyncMode::Mirror => {
                let Some(editor) = active_editor(&state, &authed).await else {
                    return Error::upstream("editor", 502, "no editor for user").into_response();
                };
                let primary = format!(
                    "ws://localhost:{}{}",
                    editor.editor_port,
                    path_and_query(&uri)
                );
                let mirror = MirrorSpec {
                    target: relay_target,
                    headers: identity_headers(&authed),
                };
                return proxy_upgrade(state.clone(), upgrade, primary, Vec::new(), Some(mirror)).await;
            }
            SyncMode::Legacy => {}
        }
    }

    let Some(editor) = active_editor(&state, &authed).await else {
        return Error::upstream("editor", 502, "no editor for user").into_response();
    };
    let target = format!("ws://localhost:{}{}", editor.editor_port, path_and_query(&uri));
    proxy_upgrade(state, upgrade, target, Vec::new(), None).await
}

async fn active_editor(
    state: &AppState,
    authed: &AuthedUser,
) -> Option<crate::lifecycle::EditorInfo> {
    match state.lifecycle.ensure_editor(&authed.user).await {
        Ok(editor) => Some(editor),
        Err(e) => {
            tracing::warn!(user_id = %authed.user.id, error = %e, "editor unavailable for ws");
            None
        }
    }
}

/// Identity the relay trusts from us: the validated user id plus the
/// original bearer token.
fn identity_headers(authed: &AuthedUser) -> Vec<(String, String)> {
    vec![
        ("x-user-id".to_string(), authed.user.id.to_string()),
        (
            "authorization".to_string(),
            format!("Bearer {}", authed.token),
        ),
    ]
}

/// The legacy editor sync path is `sync/<port>/<docPath+>`; the URL does
/// not carry a project, so mirror/relay-primary map it to `"default"`.
fn legacy_sync_doc(rest: &str) -> Option<String> {
    let mut segments = rest.split('/');
    if segments.next() != Some("sync") {
        return None;
    }
    let port = segments.next()?;
    if port.parse::<u16>().is_err() {
        return None;
    }
    let doc: Vec<&str> = segments.collect();
    if doc.is_empty() || doc.iter().all(|s| s.is_empty()) {
        return None;
    }
    Some(doc.join("/"))
}

// ----------------------------------------------------------------------
// Proxy primitive
// ----------------------------------------------------------------------

pub(crate) struct MirrorSpec {
    pub target: String,
    pub headers: Vec<(String, String)>,
}

/// Dial the upstream, then complete the client upgrade and pump frames
/// both ways. Dial failures surface as 502 with throttled logging.
pub(crate) async fn proxy_upgrade(
    state: AppState,
    upgrade: WebSocketUpgrade,
    target: String,
    headers: Vec<(String, String)>,
    mirror: Option<MirrorSpec>,
) -> Response {
    let upstream = match dial(&target, &headers).await {
        Ok(upstream) => upstream,
        Err(e) => {
            state
                .ws_log
                .warn(&format!("{target}|dial"), &format!("ws upstream dial failed: {e}"));
            return Error::upstream("ws-upstream", 502, e).into_response();
        }
    };

    upgrade.on_upgrade(move |client| pump(state, client, upstream, target, mirror))
}

async fn dial(target: &str, headers: &[(String, String)]) -> Result<Upstream, String> {
    let mut request = target
        .into_client_request()
        .map_err(|e| format!("bad upstream url: {e}"))?;
    for (name, value) in headers {
        let name: tokio_tungstenite::tungstenite::http::HeaderName =
            name.parse().map_err(|_| format!("bad header {name}"))?;
        let value = value.parse().map_err(|_| format!("bad value for {name}"))?;
        request.headers_mut().insert(name, value);
    }

    let (upstream, _) = connect_async(request).await.map_err(|e| e.to_string())?;
    Ok(upstream)
}

/// Bidirectional pump with optional best-effort mirroring of every binary
/// frame in each direction. Either side closing closes both, symmetric.
async fn pump(
    state: AppState,
    client: WebSocket,
    upstream: Upstream,
    target: String,
    mirror: Option<MirrorSpec>,
) {
    let mirror_tx = mirror.map(|spec| spawn_mirror(state.clone(), spec));

    let (mut up_sink, mut up_stream) = upstream.split();
    let (mut cl_sink, mut cl_stream) = client.split();

    loop {
        tokio::select! {
            from_client = cl_stream.next() => {
                let Some(Ok(message)) = from_client else { break };
                if let (Some(tx), AxMessage::Binary(data)) = (&mirror_tx, &message) {
                    // Bounded try_send: the mirror never blocks the primary.
                    let _ = tx.try_send(data.clone().to_vec());
                }
                let closing = matches!(message, AxMessage::Close(_));
                match client_to_upstream(message) {
                    Some(message) => {
                        if up_sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => continue,
                }
                if closing {
                    break;
                }
            }
            from_upstream = up_stream.next() => {
                let message = match from_upstream {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        state.ws_log.warn(
                            &format!("{target}|stream"),
                            &format!("ws upstream error: {e}"),
                        );
                        break;
                    }
                    None => break,
                };
                if let (Some(tx), TgMessage::Binary(data)) = (&mirror_tx, &message) {
                    let _ = tx.try_send(data.clone().to_vec());
                }
                let closing = matches!(message, TgMessage::Close(_));
                match upstream_to_client(message) {
                    Some(message) => {
                        if cl_sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => continue,
                }
                if closing {
                    break;
                }
            }
            _ = state.shutdown.cancelled() => {
                let frame = AxCloseFrame { code: 1001, reason: "shutting down".into() };
                let _ = cl_sink.send(AxMessage::Close(Some(frame))).await;
                let _ = up_sink.send(TgMessage::Close(Some(TgCloseFrame {
                    code: CloseCode::Away,
                    reason: "shutting down".into(),
                }))).await;
                return;
            }
        }
    }

    // Symmetric teardown: whichever side is still open gets a close.
    let _ = cl_sink.send(AxMessage::Close(None)).await;
    let _ = up_sink.send(TgMessage::Close(None)).await;
}

/// Open the mirror after the primary is up and drain replicated frames
/// into it. Errors are logged and the mirror is abandoned; the primary
/// never notices.
fn spawn_mirror(state: AppState, spec: MirrorSpec) -> mpsc::Sender<Vec<u8>> {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(MIRROR_BUFFER);

    tokio::spawn(async move {
        let mirror = match dial(&spec.target, &spec.headers).await {
            Ok(mirror) => mirror,
            Err(e) => {
                state
                    .ws_log
                    .warn(&format!("{}|mirror-dial", spec.target), &format!("mirror dial failed: {e}"));
                return;
            }
        };
        tracing::debug!(target = %spec.target, "mirror connected");

        let (mut sink, mut stream) = mirror.split();
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = sink.send(TgMessage::Binary(frame.into())).await {
                        state.ws_log.warn(
                            &format!("{}|mirror-send", spec.target),
                            &format!("mirror send failed: {e}"),
                        );
                        break;
                    }
                }
                // The relay answers with its own protocol frames; a mirror
                // has no client to give them to.
                reply = stream.next() => {
                    match reply {
                        Some(Ok(_)) => {}
                        _ => break,
                    }
                }
            }
        }
        let _ = sink.send(TgMessage::Close(None)).await;
    });

    tx
}

// ----------------------------------------------------------------------
// Frame conversion (axum <-> tungstenite)
// ----------------------------------------------------------------------

fn client_to_upstream(message: AxMessage) -> Option<TgMessage> {
    Some(match message {
        AxMessage::Binary(data) => TgMessage::Binary(data),
        AxMessage::Text(text) => TgMessage::Text(text.as_str().into()),
        AxMessage::Ping(data) => TgMessage::Ping(data),
        AxMessage::Pong(data) => TgMessage::Pong(data),
        AxMessage::Close(frame) => TgMessage::Close(frame.map(|f| TgCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.as_str().into(),
        })),
    })
}

fn upstream_to_client(message: TgMessage) -> Option<AxMessage> {
    Some(match message {
        TgMessage::Binary(data) => AxMessage::Binary(data),
        TgMessage::Text(text) => AxMessage::Text(text.as_str().into()),
        TgMessage::Ping(data) => AxMessage::Ping(data),
        TgMessage::Pong(data) => AxMessage::Pong(data),
        TgMessage::Close(frame) => AxMessage::Close(frame.map(|f| AxCloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().into(),
        })),
        // Raw frames never surface from a completed handshake.
        TgMessage::Frame(_) => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_sync_paths_are_detected() {
        assert_eq!(
            legacy_sync_doc("sync/34567/notes/today.md").as_deref(),
            Some("notes/today.md")
        );
        assert_eq!(legacy_sync_doc("sync/34567/d").as_deref(), Some("d"));
    }

    #[test]
    fn non_sync_paths_pass_through() {
        assert_eq!(legacy_sync_doc("api/files/list"), None);
        assert_eq!(legacy_sync_doc("sync/not-a-port/d"), None);
        assert_eq!(legacy_sync_doc("sync/34567"), None);
        assert_eq!(legacy_sync_doc("sync/34567/"), None);
    }

    #[test]
    fn close_frames_round_trip() {
        let ax = AxMessage::Close(Some(AxCloseFrame {
            code: 1001,
            reason: "bye".into(),
        }));
        match client_to_upstream(ax).unwrap() {
            TgMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1001);
                assert_eq!(frame.reason.as_str(), "bye");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn binary_frames_pass_untouched() {
        let payload = vec![0u8, 1, 2, 3];
        match client_to_upstream(AxMessage::Binary(payload.clone().into())).unwrap() {
            TgMessage::Binary(data) => assert_eq!(data.to_vec(), payload),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
