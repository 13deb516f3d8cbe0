// Credential material and per-request header signing.
//
// Three derived secrets back an authenticated session: the SESSION cookie,
// the ABODE-API-KEY, and an OAuth bearer token. Which of them a request
// needs depends on its path; `RequestClass` captures that and `sign`
// enforces it locally, before anything goes over the wire.

use std::fmt;

use reqwest::header;
use secrecy::SecretString;
use uuid::Uuid;

use crate::error::Error;

/// Plaintext login credentials. Set once at startup, read-only after.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<SecretString>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

/// Stable random identifier minted once per process lifetime.
///
/// The server scopes the SESSION cookie to this value, so it must stay
/// constant for as long as the session manager lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIdentity(Uuid);

impl ClientIdentity {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The three derived secrets, as a unit.
///
/// Invariant: either all three are empty (unauthenticated) or all three are
/// populated (authenticated). `SessionManager` owns the only mutable copy
/// and replaces it atomically; everything else works on snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub session: String,
    pub api_key: String,
    pub oauth_token: String,
}

impl AuthState {
    pub fn clear(&mut self) {
        self.session.clear();
        self.api_key.clear();
        self.oauth_token.clear();
    }

    /// `true` when all three secrets are held.
    pub fn is_authenticated(&self) -> bool {
        !self.session.is_empty() && !self.api_key.is_empty() && !self.oauth_token.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.session.is_empty() && self.api_key.is_empty() && self.oauth_token.is_empty()
    }
}

/// Which secrets an outbound request must carry, derived from its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Login and claims endpoints -- identity headers only.
    Unauthenticated,
    /// The session-check endpoint -- session cookie + API key.
    SessionOnly,
    /// Everything else -- session cookie + API key + bearer token.
    FullyAuthenticated,
}

impl RequestClass {
    pub fn classify(path: &str) -> Self {
        if path.starts_with("/api/auth2/") {
            Self::Unauthenticated
        } else if path == "/api/v1/session" {
            Self::SessionOnly
        } else {
            Self::FullyAuthenticated
        }
    }
}

/// Format the transport cookie header: `SESSION=<value>;uuid=<identity>`.
///
/// Callable in any auth state -- an empty session yields `SESSION=;uuid=...`,
/// which is what the login handshake itself sends.
pub(crate) fn cookie_header(state: &AuthState, identity: ClientIdentity) -> String {
    format!("SESSION={};uuid={identity}", state.session)
}

/// Attach identity and secret headers for the request's class.
///
/// Fails fast with [`Error::MissingCredential`] when a required secret is
/// absent -- a request known to be rejected by the server is never sent.
/// No retry happens here; callers renew and re-issue.
pub(crate) fn sign(
    builder: reqwest::RequestBuilder,
    class: RequestClass,
    state: &AuthState,
    identity: ClientIdentity,
    user_agent: &str,
) -> Result<reqwest::RequestBuilder, Error> {
    let builder = builder
        .header(header::USER_AGENT, user_agent)
        .header(header::COOKIE, cookie_header(state, identity));

    if class == RequestClass::Unauthenticated {
        return Ok(builder);
    }

    if state.session.is_empty() {
        return Err(Error::MissingCredential { what: "session" });
    }
    if state.api_key.is_empty() {
        return Err(Error::MissingCredential { what: "API key" });
    }
    let builder = builder.header("ABODE-API-KEY", &state.api_key);

    if class == RequestClass::SessionOnly {
        return Ok(builder);
    }

    if state.oauth_token.is_empty() {
        return Err(Error::MissingCredential {
            what: "OAuth token",
        });
    }
    Ok(builder.header(header::AUTHORIZATION, format!("Bearer {}", state.oauth_token)))
}
