// ── Runtime connection configuration ──
//
// These types describe *how* to reach the Abode cloud: base origin, push
// channel URL, and the timing knobs for renewal, keepalive, backoff, and
// burst coalescing. Credentials live in `auth::Credentials`, not here.

use std::time::Duration;

use url::Url;

/// Default REST origin for the Abode cloud.
pub const DEFAULT_BASE_URL: &str = "https://my.goabode.com";

/// Default push channel endpoint. `EIO=3` selects the engine.io wire
/// sub-protocol version; `transport=websocket` skips the polling upgrade.
pub const DEFAULT_SOCKET_URL: &str = "wss://my.goabode.com/socket.io/?EIO=3&transport=websocket";

/// `Origin` header presented on the push channel handshake.
pub const DEFAULT_ORIGIN: &str = "https://my.goabode.com/";

const DEFAULT_USER_AGENT: &str = concat!("abode-api/", env!("CARGO_PKG_VERSION"));

/// Configuration for a single client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// REST base origin.
    pub base_url: Url,
    /// Push channel URL (websocket upgrade).
    pub socket_url: Url,
    /// `Origin` header for the push channel handshake.
    pub origin: String,
    /// `User-Agent` sent on every REST call and the push handshake.
    pub user_agent: String,
    /// Per-request timeout on the shared HTTP client. The upstream API
    /// has no deadline of its own; without this a stuck login call would
    /// wedge the renewal timer indefinitely.
    pub timeout: Duration,
    /// How often the session/token renewal timer fires.
    pub renew_interval: Duration,
    /// Push channel tuning.
    pub socket: SocketConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.parse().expect("valid default base URL"),
            socket_url: DEFAULT_SOCKET_URL.parse().expect("valid default socket URL"),
            origin: DEFAULT_ORIGIN.into(),
            user_agent: DEFAULT_USER_AGENT.into(),
            timeout: Duration::from_secs(30),
            renew_interval: Duration::from_secs(25 * 60),
            socket: SocketConfig::default(),
        }
    }
}

/// Tuning for the push channel connection loop.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Keepalive ping cadence while connected.
    pub ping_interval: Duration,
    /// Delay before the first reconnection attempt.
    pub initial_backoff: Duration,
    /// Upper bound on the reconnect delay. The delay doubles per failed
    /// attempt and would otherwise grow without bound.
    pub max_backoff: Duration,
    /// Cooldown during which repeat device-update notifications are
    /// suppressed (burst coalescing).
    pub dedupe_window: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5 * 60),
            dedupe_window: Duration::from_millis(500),
        }
    }
}
