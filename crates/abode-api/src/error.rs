use thiserror::Error;

/// Top-level error type for the `abode-api` crate.
///
/// Covers every failure mode across the REST surface and the push channel.
/// Renewal (`SessionManager::renew`) absorbs all of these internally; REST
/// calls propagate them to the caller unchanged.
#[derive(Debug, Error)]
pub enum Error {
    // ── Local preconditions ─────────────────────────────────────────
    /// A request class requires a secret that is not currently held.
    /// Raised before anything is sent over the wire.
    #[error("missing credential: {what}")]
    MissingCredential { what: &'static str },

    // ── Authentication ──────────────────────────────────────────────
    /// A login attempt failed. The original cause is attached.
    /// Auth state is guaranteed to be fully cleared when this is returned.
    #[error("failed to sign into Abode account")]
    Auth {
        #[source]
        source: Box<Error>,
    },

    // ── Server contract ─────────────────────────────────────────────
    /// The server responded, but without the expected status or shape
    /// (missing token, missing session cookie, non-2xx status).
    #[error("protocol error: {message}")]
    Protocol { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, timeout).
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Push channel ────────────────────────────────────────────────
    /// Push channel connection failed or dropped mid-stream.
    #[error("push channel connection failed: {0}")]
    SocketConnect(String),

    /// An inbound push frame could not be decoded. Absorbed by the
    /// stream loop; never propagates past it.
    #[error("frame decode error: {message}")]
    Decode { message: String },
}

impl Error {
    /// Returns `true` if this error came from the authentication path
    /// and a fresh login might resolve it.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::MissingCredential { .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::SocketConnect(_) => true,
            _ => false,
        }
    }
}
