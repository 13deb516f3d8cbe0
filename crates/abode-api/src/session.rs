// Auth session lifecycle: login, token refresh, periodic renewal.
//
// `SessionManager` owns the only mutable `AuthState`. All mutation happens
// behind one RwLock and the state is only ever replaced as a unit, so a
// reader can never observe a half-populated set of secrets. Failed login
// attempts leave the state fully cleared.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::Method;
use reqwest::header::SET_COOKIE;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{self, AuthState, ClientIdentity, Credentials, RequestClass};
use crate::config::ClientConfig;
use crate::error::Error;

pub(crate) const LOGIN_PATH: &str = "/api/auth2/login";
pub(crate) const CLAIMS_PATH: &str = "/api/auth2/claims";
pub(crate) const SESSION_PATH: &str = "/api/v1/session";

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    token: String,
}

#[derive(Debug, Deserialize)]
struct ClaimsResponse {
    #[serde(default)]
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    #[serde(default)]
    id: String,
}

/// Owns the Abode auth session: credentials, client identity, and the
/// three derived secrets. Hands out signed requests to the REST layer
/// and the push channel handshake.
pub struct SessionManager {
    http: reqwest::Client,
    config: ClientConfig,
    credentials: Credentials,
    identity: ClientIdentity,
    state: RwLock<AuthState>,
    /// Single-flight gate: overlapping `renew` calls collapse into one.
    renew_gate: Mutex<()>,
    timer_started: AtomicBool,
    cancel: CancellationToken,
}

impl SessionManager {
    /// Build a manager. No network traffic happens here; call
    /// [`start`](Self::start) to sign in.
    pub fn new(
        config: ClientConfig,
        credentials: Credentials,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(Error::Transport)?;

        Ok(Self {
            http,
            config,
            credentials,
            identity: ClientIdentity::generate(),
            state: RwLock::new(AuthState::default()),
            renew_gate: Mutex::new(()),
            timer_started: AtomicBool::new(false),
            cancel,
        })
    }

    /// The process-lifetime client identity scoping the session cookie.
    pub fn identity(&self) -> ClientIdentity {
        self.identity
    }

    /// Snapshot of the current auth state.
    pub async fn auth_state(&self) -> AuthState {
        self.state.read().await.clone()
    }

    /// The transport cookie header for the current state:
    /// `SESSION=<value>;uuid=<identity>`. Callable in any state.
    pub async fn cookie_header(&self) -> String {
        auth::cookie_header(&*self.state.read().await, self.identity)
    }

    /// Perform the initial login and start the periodic renewal timer.
    ///
    /// The timer is spawned whether or not the initial login succeeds, so
    /// a caller choosing to proceed degraded still self-heals on the next
    /// renewal tick. The login error, if any, is returned for the caller
    /// to act on.
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        let result = self.login().await;
        self.spawn_renewal_timer();
        result
    }

    /// Signal the renewal timer to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn spawn_renewal_timer(self: &Arc<Self>) {
        if self.timer_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let manager = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.renew_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately; we just logged in
            interval.tick().await;
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => manager.renew().await,
                }
            }
            debug!("renewal timer stopped");
        });
    }

    // ── Login ────────────────────────────────────────────────────────

    /// Full (re-)authentication.
    ///
    /// Clears the auth state before the first network send, so no reader
    /// can observe secrets from a previous identity while the new login is
    /// in flight. On success all three secrets are stored as a unit; on
    /// any failure the state stays cleared and the cause is wrapped in
    /// [`Error::Auth`].
    pub async fn login(&self) -> Result<(), Error> {
        self.state.write().await.clear();

        match self.login_inner().await {
            Ok(fresh) => {
                *self.state.write().await = fresh;
                info!("signed into Abode account");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "login failed");
                self.state.write().await.clear();
                Err(Error::Auth { source: Box::new(e) })
            }
        }
    }

    async fn login_inner(&self) -> Result<AuthState, Error> {
        if self.credentials.email.is_empty() {
            return Err(Error::MissingCredential { what: "email" });
        }
        if self.credentials.password.expose_secret().is_empty() {
            return Err(Error::MissingCredential { what: "password" });
        }

        debug!("signing into Abode account");

        let body = json!({
            "id": self.credentials.email,
            "password": self.credentials.password.expose_secret(),
            "uuid": self.identity.to_string(),
        });

        let resp = self
            .send(Method::POST, LOGIN_PATH, Some(&body), &AuthState::default())
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Protocol {
                message: format!("login failed (HTTP {status})"),
            });
        }

        // The session travels in a response header, the API key in the
        // body. Absence of either is fatal for this attempt.
        let session = extract_session_cookie(resp.headers()).ok_or_else(|| Error::Protocol {
            message: "login response did not contain a SESSION cookie".into(),
        })?;

        let login: LoginResponse = resp.json().await.map_err(Error::Transport)?;
        if login.token.is_empty() {
            return Err(Error::Protocol {
                message: "login response did not contain an API key".into(),
            });
        }

        // The claims endpoint derives the bearer token from the session
        // cookie, so sign with the pending secrets -- the shared state is
        // only written once everything is in hand.
        let pending = AuthState {
            session,
            api_key: login.token,
            oauth_token: String::new(),
        };
        let oauth_token = self.fetch_oauth_token_with(&pending).await?;

        Ok(AuthState {
            oauth_token,
            ..pending
        })
    }

    // ── Refresh ──────────────────────────────────────────────────────

    /// Fetch a fresh OAuth bearer token from the claims endpoint.
    ///
    /// Does not mutate the auth state -- callers decide where it goes.
    pub async fn fetch_oauth_token(&self) -> Result<String, Error> {
        let snapshot = self.auth_state().await;
        self.fetch_oauth_token_with(&snapshot).await
    }

    async fn fetch_oauth_token_with(&self, state: &AuthState) -> Result<String, Error> {
        debug!("fetching OAuth token");

        let resp = self.send(Method::GET, CLAIMS_PATH, None, state).await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Protocol {
                message: format!("claims request failed (HTTP {status})"),
            });
        }

        let claims: ClaimsResponse = resp.json().await.map_err(Error::Transport)?;
        if claims.access_token.is_empty() {
            return Err(Error::Protocol {
                message: "claims response did not contain an access token".into(),
            });
        }

        Ok(claims.access_token)
    }

    /// Refresh the session value via the lightweight session-check call.
    async fn fetch_session(&self) -> Result<String, Error> {
        debug!("refreshing session");

        let snapshot = self.auth_state().await;
        let resp = self
            .send(Method::GET, SESSION_PATH, None, &snapshot)
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Protocol {
                message: format!("session check failed (HTTP {status})"),
            });
        }

        let session: SessionResponse = resp.json().await.map_err(Error::Transport)?;
        if session.id.is_empty() {
            return Err(Error::Protocol {
                message: "session response did not contain an id".into(),
            });
        }

        Ok(session.id)
    }

    /// Best-effort renewal: cheap token/session refresh first, full login
    /// as the fallback. Never fails -- a failed fallback login leaves the
    /// state cleared, which surfaces as [`Error::MissingCredential`] on
    /// the next REST attempt.
    ///
    /// Safe to call concurrently with itself: overlapping calls collapse
    /// into the one already in flight.
    pub async fn renew(&self) {
        let Ok(_gate) = self.renew_gate.try_lock() else {
            debug!("renewal already in flight, skipping");
            return;
        };

        if self.state.read().await.is_authenticated() {
            match self.try_refresh().await {
                Ok(()) => return,
                Err(e) => debug!(error = %e, "session refresh failed, re-signing in"),
            }
        }

        if let Err(e) = self.login().await {
            debug!(error = %e, "failed to renew session");
        }
    }

    /// Token refresh then session refresh, each updating only its own
    /// field. Only called while authenticated, so the partial updates
    /// never violate the all-or-nothing invariant.
    async fn try_refresh(&self) -> Result<(), Error> {
        let token = self.fetch_oauth_token().await?;
        self.state.write().await.oauth_token = token;

        let session = self.fetch_session().await?;
        self.state.write().await.session = session;

        Ok(())
    }

    // ── Request plumbing ─────────────────────────────────────────────

    fn url(&self, path: &str) -> Result<Url, Error> {
        self.config.base_url.join(path).map_err(Error::InvalidUrl)
    }

    /// Classify, sign, and send. Every request carries the given auth
    /// snapshot at send time; there is no retry at this layer.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        state: &AuthState,
    ) -> Result<reqwest::Response, Error> {
        let class = RequestClass::classify(path);
        let url = self.url(path)?;

        debug!("{method} {url}");

        let mut builder = self.http.request(method, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let builder = auth::sign(builder, class, state, self.identity, &self.config.user_agent)?;

        builder.send().await.map_err(Error::Transport)
    }

    /// Signed GET against the current auth snapshot.
    pub(crate) async fn get(&self, path: &str) -> Result<reqwest::Response, Error> {
        let snapshot = self.auth_state().await;
        self.send(Method::GET, path, None, &snapshot).await
    }

    /// Signed PUT with a JSON body against the current auth snapshot.
    pub(crate) async fn put(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, Error> {
        let snapshot = self.auth_state().await;
        self.send(Method::PUT, path, Some(body), &snapshot).await
    }
}

/// Pull the `SESSION` value out of the login response's `set-cookie`
/// headers. Only the leading `name=value` pair of each cookie matters;
/// attributes like `Path` are ignored.
fn extract_session_cookie(headers: &reqwest::header::HeaderMap) -> Option<String> {
    for value in headers.get_all(SET_COOKIE) {
        let Ok(cookie) = value.to_str() else { continue };
        let pair = cookie.split(';').next().unwrap_or_default();
        if let Some((name, value)) = pair.split_once('=') {
            if name.trim() == "SESSION" && !value.trim().is_empty() {
                return Some(value.trim().to_owned());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use reqwest::header::{HeaderMap, HeaderValue};

    use super::*;

    fn headers(values: &[&str]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for v in values {
            map.append(SET_COOKIE, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn extracts_session_value() {
        let map = headers(&["SESSION=xyz; Path=/; HttpOnly"]);
        assert_eq!(extract_session_cookie(&map).as_deref(), Some("xyz"));
    }

    #[test]
    fn skips_unrelated_cookies() {
        let map = headers(&["theme=dark; Path=/", "SESSION=abc123; Secure"]);
        assert_eq!(extract_session_cookie(&map).as_deref(), Some("abc123"));
    }

    #[test]
    fn missing_session_cookie() {
        let map = headers(&["theme=dark; Path=/"]);
        assert!(extract_session_cookie(&map).is_none());
    }

    #[test]
    fn empty_session_value_is_missing() {
        let map = headers(&["SESSION=; Path=/"]);
        assert!(extract_session_cookie(&map).is_none());
    }
}
