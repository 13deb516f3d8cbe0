// Client facade tying the pieces together.
//
// `AbodeClient` owns the session manager, the push channel task, and the
// event bus. Device-control code talks to this type only: REST calls are
// signed with the current auth snapshot, and state-change notifications
// arrive through `subscribe`.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::auth::Credentials;
use crate::config::ClientConfig;
use crate::devices::{ControlLockResponse, Device, LockAction};
use crate::error::Error;
use crate::events::{AbodeEvent, EventBus};
use crate::session::SessionManager;
use crate::socket::EventStream;

pub(crate) const DEVICES_PATH: &str = "/api/v1/devices";

/// Client for the Abode home-security cloud.
///
/// Construct with [`new`](Self::new), then [`start`](Self::start) to sign
/// in and open the push channel. REST calls fail with
/// [`Error::MissingCredential`] until a login has succeeded.
pub struct AbodeClient {
    session: Arc<SessionManager>,
    stream: Arc<EventStream>,
    bus: EventBus,
    cancel: CancellationToken,
}

impl AbodeClient {
    /// Build a client. No network traffic happens here.
    pub fn new(config: ClientConfig, credentials: Credentials) -> Result<Self, Error> {
        let cancel = CancellationToken::new();
        let session = Arc::new(SessionManager::new(
            config.clone(),
            credentials,
            cancel.child_token(),
        )?);
        let bus = EventBus::new();
        let stream = Arc::new(EventStream::new(
            Arc::clone(&session),
            bus.clone(),
            &config,
            cancel.child_token(),
        ));

        Ok(Self {
            session,
            stream,
            bus,
            cancel,
        })
    }

    /// Sign in, start the renewal timer, and open the push channel.
    ///
    /// An initial login failure is returned, but the renewal timer and the
    /// push channel's reconnect loop are running either way -- a caller
    /// choosing to proceed degraded will recover once the service accepts
    /// a later login.
    pub async fn start(&self) -> Result<(), Error> {
        let login = self.session.start().await;
        self.stream.start();
        login
    }

    /// Convenience: [`new`](Self::new) + [`start`](Self::start), failing
    /// on the initial login.
    pub async fn connect(config: ClientConfig, credentials: Credentials) -> Result<Self, Error> {
        let client = Self::new(config, credentials)?;
        client.start().await?;
        Ok(client)
    }

    /// Subscribe to connection-state and device-update events.
    pub fn subscribe(&self) -> broadcast::Receiver<AbodeEvent> {
        self.bus.subscribe()
    }

    /// Direct access to the session manager, for callers that want to
    /// renew-and-retry after an authentication failure.
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Release the renewal timer and the push channel.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // ── Device REST surface ──────────────────────────────────────────

    /// Fetch all devices on the account.
    ///
    /// `GET /api/v1/devices`
    pub async fn get_devices(&self) -> Result<Vec<Device>, Error> {
        debug!("fetching devices");
        let resp = self.session.get(DEVICES_PATH).await?;
        parse_json(resp).await
    }

    /// Drive a lock to the requested state.
    ///
    /// `PUT /api/v1/control/lock/{id}` with `{"status": 0|1}`
    pub async fn control_lock(
        &self,
        id: &str,
        action: LockAction,
    ) -> Result<ControlLockResponse, Error> {
        debug!(id, ?action, "controlling lock");
        let path = format!("/api/v1/control/lock/{id}");
        let body = json!({ "status": action.status_code() });
        let resp = self.session.put(&path, &body).await?;
        parse_json(resp).await
    }
}

impl Drop for AbodeClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn parse_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let status = resp.status();
    if !status.is_success() {
        return Err(Error::Protocol {
            message: format!("request failed (HTTP {status})"),
        });
    }
    resp.json().await.map_err(Error::Transport)
}
