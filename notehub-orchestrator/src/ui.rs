//! Login, dashboard and sandbox pages plus the auth flows
//!
//! OAuth code exchange and magic links are AuthService's job; these
//! handlers only relay codes and set/clear the session cookie.

use axum::extract::{Path, Query, State};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

use notehub_core::clients::AuthSession;
use notehub_core::error::{Error, Result};

use crate::session::{AuthedUser, SESSION_COOKIE};
use crate::state::AppState;

pub async fn login_page(State(state): State<AppState>) -> Html<String> {
    let github = state
        .config
        .github_client_id
        .as_deref()
        .map(|_| r#"<a class="btn" href="/login/github">Continue with GitHub</a>"#)
        .unwrap_or("");
    let google = state
        .config
        .google_client_id
        .as_deref()
        .map(|_| r#"<a class="btn" href="/login/google">Continue with Google</a>"#)
        .unwrap_or("");

    Html(format!(
        r#"<!doctype html>
<html><head><title>notehub — sign in</title>{STYLE}</head>
<body><main>
<h1>notehub</h1>
<p>Notebooks with a runtime attached.</p>
{github}
{google}
<form method="post" action="/auth/magic-link">
  <input type="email" name="email" placeholder="you@example.com" required>
  <button type="submit">Email me a sign-in link</button>
</form>
<p><a href="/sandbox">Try the sandbox without an account</a></p>
</main></body></html>"#
    ))
}

pub async fn dashboard(State(state): State<AppState>, authed: AuthedUser) -> Html<String> {
    let editor = state.lifecycle.get(&authed.user.id);
    let status = match &editor {
        Some(info) => format!(
            r#"<p>Your editor is <strong>{:?}</strong>. <a class="btn" href="/u/{}/">Open workspace</a></p>"#,
            info.state, authed.user.id
        ),
        None => format!(
            r#"<p>No editor running yet. <a class="btn" href="/u/{}/">Start one</a></p>"#,
            authed.user.id
        ),
    };

    Html(format!(
        r#"<!doctype html>
<html><head><title>notehub — dashboard</title>{STYLE}</head>
<body><main>
<h1>Hello, {name}</h1>
{status}
<form method="post" action="/logout"><button type="submit">Sign out</button></form>
</main></body></html>"#,
        name = if authed.user.name.is_empty() {
            &authed.user.email
        } else {
            &authed.user.name
        },
    ))
}

/// The guest sandbox is fully client-side (IndexedDB editor); this just
/// serves its shell.
pub async fn sandbox() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html><head><title>notehub — sandbox</title></head>
<body>
<div id="sandbox-root"></div>
<script type="module" src="/static/sandbox.js"></script>
</body></html>"#,
    )
}

// ----------------------------------------------------------------------
// OAuth
// ----------------------------------------------------------------------

pub async fn login_github(State(state): State<AppState>) -> Result<Redirect> {
    let client_id = state
        .config
        .github_client_id
        .as_deref()
        .ok_or_else(|| Error::BadRequest("github login not configured".to_string()))?;
    let redirect_uri = callback_url(&state, "github");
    Ok(Redirect::to(&format!(
        "https://github.com/login/oauth/authorize?client_id={client_id}&redirect_uri={redirect_uri}&scope=read:user%20user:email"
    )))
}

pub async fn login_google(State(state): State<AppState>) -> Result<Redirect> {
    let client_id = state
        .config
        .google_client_id
        .as_deref()
        .ok_or_else(|| Error::BadRequest("google login not configured".to_string()))?;
    let redirect_uri = callback_url(&state, "google");
    Ok(Redirect::to(&format!(
        "https://accounts.google.com/o/oauth2/v2/auth?client_id={client_id}&redirect_uri={redirect_uri}&response_type=code&scope=openid%20email%20profile"
    )))
}

fn callback_url(state: &AppState, provider: &str) -> String {
    let scheme = if state.config.secure_cookies() { "https" } else { "http" };
    let host = if state.config.secure_cookies() {
        state.config.domain.clone()
    } else {
        format!("{}:{}", state.config.domain, state.config.port)
    };
    format!("{scheme}://{host}/auth/callback/{provider}")
}

pub async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    jar: CookieJar,
) -> Response {
    let Some(code) = query.get("code") else {
        return Error::BadRequest("missing oauth code".to_string()).into_response();
    };

    let session = match provider.as_str() {
        "github" => state.auth.github_auth(code).await,
        "google" => state.auth.google_auth(code).await,
        other => Err(Error::NotFound(format!("unknown provider {other}"))),
    };

    finish_login(&state, jar, session).await
}

// ----------------------------------------------------------------------
// Magic links
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct MagicLinkRequest {
    pub email: String,
}

pub async fn send_magic_link(
    State(state): State<AppState>,
    axum::extract::Form(request): axum::extract::Form<MagicLinkRequest>,
) -> Result<Json<serde_json::Value>> {
    state.auth.send_magic_link(&request.email).await?;
    Ok(Json(json!({ "sent": true })))
}

pub async fn verify_magic_link(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    jar: CookieJar,
) -> Response {
    let Some(token) = query.get("token") else {
        return Error::BadRequest("missing token".to_string()).into_response();
    };
    let session = state.auth.verify_magic_link(token).await;
    finish_login(&state, jar, session).await
}

async fn finish_login(state: &AppState, jar: CookieJar, session: Result<AuthSession>) -> Response {
    match session {
        Ok(session) => {
            tracing::info!(user_id = %session.user.id, "login");
            let cookie = session_cookie(state, session.token);
            (jar.add(cookie), Redirect::to("/dashboard")).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "login failed");
            e.into_response()
        }
    }
}

fn session_cookie(state: &AppState, token: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(state.config.secure_cookies())
        .build()
}

// ----------------------------------------------------------------------
// Logout & account deletion
// ----------------------------------------------------------------------

/// Tear down the user's containers, then let AuthService erase the
/// account. The cookie cleanup mirrors logout.
pub async fn delete_account(
    State(state): State<AppState>,
    authed: AuthedUser,
    jar: CookieJar,
) -> Response {
    if let Err(e) = state.lifecycle.stop_user(&authed.user.id).await {
        tracing::warn!(user_id = %authed.user.id, error = %e, "container teardown before delete failed");
    }
    if let Err(e) = state.auth.delete_account(&authed.token).await {
        tracing::error!(user_id = %authed.user.id, error = %e, "account deletion failed");
        return e.into_response();
    }
    state.tokens.invalidate(&authed.token);
    tracing::info!(user_id = %authed.user.id, "account deleted");
    (clear_session_cookies(&state, jar), Redirect::to("/login")).into_response()
}

pub async fn logout(State(state): State<AppState>, authed: AuthedUser, jar: CookieJar) -> Response {
    if let Err(e) = state.auth.logout(&authed.token).await {
        tracing::warn!(user_id = %authed.user.id, error = %e, "auth service logout failed");
    }
    state.tokens.invalidate(&authed.token);
    tracing::info!(user_id = %authed.user.id, "logout");
    (clear_session_cookies(&state, jar), Redirect::to("/login")).into_response()
}

/// Clear the current cookie plus the legacy leading-dot-domain variant
/// some older clients still carry.
fn clear_session_cookies(state: &AppState, jar: CookieJar) -> CookieJar {
    let bare = Cookie::build((SESSION_COOKIE, ""))
        .path("/")
        .domain(state.config.domain.clone())
        .build();
    let dotted = Cookie::build((SESSION_COOKIE, ""))
        .path("/")
        .domain(format!(".{}", state.config.domain))
        .build();
    jar.remove(Cookie::build((SESSION_COOKIE, "")).path("/").build())
        .remove(bare)
        .remove(dotted)
}

const STYLE: &str = r#"<style>
body{font-family:system-ui,sans-serif;display:flex;justify-content:center;padding-top:10vh;background:#fafafa}
main{max-width:420px;width:100%}
h1{font-weight:600}
.btn{display:block;margin:.5rem 0;padding:.6rem 1rem;border:1px solid #ccc;border-radius:6px;text-decoration:none;color:#222;background:#fff;text-align:center}
form{margin-top:1rem;display:flex;gap:.5rem}
input{flex:1;padding:.5rem;border:1px solid #ccc;border-radius:6px}
button{padding:.5rem 1rem;border:1px solid #888;border-radius:6px;background:#fff;cursor:pointer}
</style>"#;

#[cfg(test)]
mod tests {
    use super::*;
    use notehub_core::Config;

    #[tokio::test]
    async fn callback_url_matches_scheme() {
        let mut config = Config::default();
        config.domain = "notehub.dev".to_string();
        let state = test_state(config);
        assert_eq!(
            callback_url(&state, "github"),
            "https://notehub.dev/auth/callback/github"
        );

        let mut config = Config::default();
        config.port = 3000;
        let state = test_state(config);
        assert_eq!(
            callback_url(&state, "google"),
            "http://localhost:3000/auth/callback/google"
        );
    }

    fn test_state(config: Config) -> AppState {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/notehub_test")
            .expect("lazy pool");
        AppState::new(config, notehub_core::PostgresStore::from_pool(pool, 200))
    }
}
