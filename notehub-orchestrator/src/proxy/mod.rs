//! Authenticated reverse proxy
//!
//! HTTP requests under `/u/{user_id}/*` are forwarded to that user's editor
//! container, starting it on demand. WebSocket upgrades on the same prefix
//! (and on `/sync`, `/tunnel`) route through [`ws`], including the three
//! sync modes.

pub mod throttle;
pub mod ws;

use axum::body::Body;
use axum::extract::{ConnectInfo, FromRequestParts, Path, State, WebSocketUpgrade};
use axum::http::{header, request::Parts, HeaderMap, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use std::net::SocketAddr;
use uuid::Uuid;

use notehub_core::error::Error;

use crate::lifecycle::EditorInfo;
use crate::session::{wants_html, AuthedUser};
use crate::state::AppState;

/// `/u/{user_id}` without a trailing slash: send the browser to the
/// editor's base path.
pub async fn editor_root(Path(user_id): Path<Uuid>) -> Redirect {
    Redirect::permanent(&format!("/u/{user_id}/"))
}

/// `/u/{user_id}/{*rest}` — HTTP proxy or WebSocket router, depending on
/// the upgrade header.
pub async fn editor_entry(
    State(state): State<AppState>,
    Path((user_id, rest)): Path<(Uuid, String)>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    authed: AuthedUser,
    request: Request<Body>,
) -> Response {
    if authed.user.id != user_id {
        return Error::Forbidden("not your workspace".to_string()).into_response();
    }

    if is_ws_upgrade(request.headers()) {
        let (mut parts, _body) = request.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(upgrade) => {
                ws::editor_ws(state, authed, user_id, rest, parts.uri.clone(), upgrade).await
            }
            Err(rejection) => rejection.into_response(),
        };
    }

    editor_http(state, authed, user_id, rest, peer, request).await
}

fn is_ws_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Forward one HTTP request to the user's editor container.
async fn editor_http(
    state: AppState,
    authed: AuthedUser,
    user_id: Uuid,
    rest: String,
    peer: SocketAddr,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();

    let editor = match ensure_editor_for(&state, &authed, &parts).await {
        Ok(editor) => editor,
        Err(response) => return response,
    };

    let query = parts
        .uri
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let url = format!(
        "http://localhost:{}/u/{}/{}{}",
        editor.editor_port, user_id, rest, query
    );

    let mut upstream = state
        .http
        .request(parts.method.clone(), &url)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    upstream = upstream.headers(forwarded_headers(&parts.headers, peer, state.config.secure_cookies()));

    match upstream.send().await {
        Ok(response) => {
            let status = response.status();
            let mut builder = Response::builder().status(status);
            if let Some(headers) = builder.headers_mut() {
                copy_response_headers(response.headers(), headers);
            }
            builder
                .body(Body::from_stream(response.bytes_stream()))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
        }
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "editor upstream failed");
            Error::upstream("editor", 502, e.to_string()).into_response()
        }
    }
}

/// The user's active editor, starting the pair on demand. The error arm is
/// a ready response: dashboard redirect for browsers, 502 for API callers.
pub(crate) async fn ensure_editor_for(
    state: &AppState,
    authed: &AuthedUser,
    parts: &Parts,
) -> Result<EditorInfo, Response> {
    match state.lifecycle.ensure_editor(&authed.user).await {
        Ok(editor) => Ok(editor),
        Err(e) => {
            tracing::error!(user_id = %authed.user.id, error = %e, "on-demand editor start failed");
            if wants_html(parts) {
                Err(Redirect::to("/dashboard").into_response())
            } else {
                Err(e.into_response())
            }
        }
    }
}

/// Request headers for the upstream hop: host stripped (reqwest derives
/// it), forwarding headers appended.
fn forwarded_headers(original: &HeaderMap, peer: SocketAddr, secure: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in original {
        if name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let forwarded_for = match original.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {}", peer.ip()),
        None => peer.ip().to_string(),
    };
    if let Ok(value) = forwarded_for.parse() {
        headers.insert("x-forwarded-for", value);
    }
    let proto = if secure { "https" } else { "http" };
    if let Ok(value) = proto.parse() {
        headers.insert("x-forwarded-proto", value);
    }
    headers
}

/// Response headers minus hop-by-hop fields.
fn copy_response_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        let skip = name == header::CONNECTION
            || name == header::TRANSFER_ENCODING
            || name.as_str() == "keep-alive";
        if !skip {
            to.append(name.clone(), value.clone());
        }
    }
}

/// Reconstruct the path+query a request arrived with.
pub(crate) fn path_and_query(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_headers_strip_host_and_add_proto() {
        let mut original = HeaderMap::new();
        original.insert(header::HOST, "notehub.dev".parse().unwrap());
        original.insert(header::ACCEPT, "text/html".parse().unwrap());
        let peer: SocketAddr = "203.0.113.9:50000".parse().unwrap();

        let headers = forwarded_headers(&original, peer, true);
        assert!(headers.get(header::HOST).is_none());
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.9");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(headers.get(header::ACCEPT).unwrap(), "text/html");
    }

    #[test]
    fn forwarded_for_chains() {
        let mut original = HeaderMap::new();
        original.insert("x-forwarded-for", "198.51.100.7".parse().unwrap());
        let peer: SocketAddr = "203.0.113.9:50000".parse().unwrap();

        let headers = forwarded_headers(&original, peer, false);
        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "198.51.100.7, 203.0.113.9"
        );
    }

    #[test]
    fn hop_by_hop_headers_dropped() {
        let mut from = HeaderMap::new();
        from.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        from.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        let mut to = HeaderMap::new();
        copy_response_headers(&from, &mut to);
        assert!(to.get(header::CONNECTION).is_none());
        assert!(to.get(header::CONTENT_TYPE).is_some());
    }
}
