// Push channel: persistent websocket to the Abode socket.io endpoint.
//
// One background task owns the connection. It presents the same identity
// headers as REST calls, keeps the stream alive with engine.io pings, and
// on any close drives an exponential-backoff reconnect loop that renews
// the session before each attempt. Decoded device updates go out through
// the `EventBus`; decode and transport failures never leave this module.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::{ClientConfig, SocketConfig};
use crate::error::Error;
use crate::events::{AbodeEvent, EventBus};
use crate::session::SessionManager;

/// engine.io ping frame, sent as a keepalive while connected.
const PING_FRAME: &str = "2";

/// engine.io handshake envelope prefix. Seeing anything *other* than this
/// is evidence of a healthy, fully-established stream.
const HANDSHAKE_PREFIX: &str = "0{";

/// Marker the server embeds in a frame when the session is rejected.
const UNAUTHORIZED_MARKER: &str = "\"Not Authorized\"";

/// Event tag of a device-update notification.
const DEVICE_UPDATE_EVENT: &str = "com.goabode.device.update";

/// Push channel connection lifecycle. Owned by the stream task; consumers
/// observe transitions only through bus events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Transient: an unauthorized frame arrived and the close handshake
    /// is in flight. Reconnection happens via the normal close path.
    Closing,
}

// ── Backoff ──────────────────────────────────────────────────────────

/// Exponential reconnect delay: doubles after each attempt that drops
/// before producing a healthy frame, resets to base on one, capped.
#[derive(Debug)]
struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, current: base }
    }

    /// The delay to wait before the next attempt. Doubles the stored
    /// delay for the attempt after that.
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

// ── Dedupe window ────────────────────────────────────────────────────

/// Single-slot cooldown coalescing bursts of update notifications.
///
/// Deliberately not keyed per device: neighboring updates within the
/// window are dropped whichever device they name, matching the service's
/// observed notification behavior.
#[derive(Debug)]
struct DedupeWindow {
    window: Duration,
    last_emit: Option<Instant>,
}

impl DedupeWindow {
    fn new(window: Duration) -> Self {
        Self { window, last_emit: None }
    }

    /// `true` if an emission is admitted at `now`, opening the window.
    /// Suppressed notifications are dropped, not queued.
    fn admit(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.window => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

// ── Frame decoding ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum FrameKind {
    /// The initial `0{...}` handshake envelope.
    Handshake,
    /// The server rejected our session.
    Unauthorized,
    /// A device-update notification with a non-empty device id.
    DeviceUpdate(String),
    /// Any other well-formed frame (pongs, unrelated events).
    Other,
}

/// Decode a text frame from its engine.io envelope.
///
/// The numeric prefix is stripped and the remainder parsed as JSON; a
/// two-element `["<tag>", "<device-id>"]` array with the device-update
/// tag becomes [`FrameKind::DeviceUpdate`].
fn decode_frame(text: &str) -> Result<FrameKind, Error> {
    if text.contains(UNAUTHORIZED_MARKER) {
        return Ok(FrameKind::Unauthorized);
    }
    if text.starts_with(HANDSHAKE_PREFIX) {
        return Ok(FrameKind::Handshake);
    }

    let payload = text.trim_start_matches(|c: char| c.is_ascii_digit() || c == ':');
    if payload.is_empty() {
        // bare engine.io control frame, e.g. the "3" pong
        return Ok(FrameKind::Other);
    }

    let value: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| Error::Decode {
            message: e.to_string(),
        })?;

    if let Some([tag, id]) = value.as_array().map(Vec::as_slice) {
        if tag.as_str() == Some(DEVICE_UPDATE_EVENT) {
            if let Some(id) = id.as_str() {
                if !id.is_empty() {
                    return Ok(FrameKind::DeviceUpdate(id.to_owned()));
                }
            }
        }
    }

    Ok(FrameKind::Other)
}

#[derive(Debug, PartialEq, Eq)]
enum FrameAction {
    Continue,
    Close,
}

// ── Stream manager ───────────────────────────────────────────────────

/// Owns the push channel connection loop.
pub(crate) struct EventStream {
    session: Arc<SessionManager>,
    bus: EventBus,
    config: SocketConfig,
    url: Url,
    origin: String,
    user_agent: String,
    running: AtomicBool,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl EventStream {
    pub(crate) fn new(
        session: Arc<SessionManager>,
        bus: EventBus,
        config: &ClientConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            session,
            bus,
            config: config.socket.clone(),
            url: config.socket_url.clone(),
            origin: config.origin.clone(),
            user_agent: config.user_agent.clone(),
            running: AtomicBool::new(false),
            state,
            cancel,
        }
    }

    /// Spawn the connection task. Idempotent: at most one live channel
    /// exists at a time, so starting while already running is a no-op.
    pub(crate) fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("push channel already running");
            return;
        }

        let stream = Arc::clone(self);
        tokio::spawn(async move {
            stream.run().await;
        });
    }

    /// Connect → read → on close, backoff + renew → reconnect.
    async fn run(&self) {
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let mut dedupe = DedupeWindow::new(self.config.dedupe_window);

        loop {
            self.state.send_replace(ConnectionState::Connecting);

            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                result = self.connect_and_read(&mut backoff, &mut dedupe) => result,
            };

            self.state.send_replace(ConnectionState::Disconnected);
            match result {
                Ok(()) => info!("push channel closed"),
                Err(e) => warn!(error = %e, "push channel error"),
            }
            self.bus.emit(AbodeEvent::SocketDisconnected);

            let delay = backoff.next_delay();
            info!(?delay, "waiting before reconnect");
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }

            // Refresh the session before presenting handshake headers
            // again. Best-effort: renew swallows its own failures.
            self.session.renew().await;
        }

        self.state.send_replace(ConnectionState::Disconnected);
        self.running.store(false, Ordering::SeqCst);
        debug!("push channel loop exiting");
    }

    /// Establish one websocket connection and read frames until it drops.
    async fn connect_and_read(
        &self,
        backoff: &mut Backoff,
        dedupe: &mut DedupeWindow,
    ) -> Result<(), Error> {
        debug!(url = %self.url, "connecting to push channel");

        let uri: tungstenite::http::Uri = self
            .url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::SocketConnect(e.to_string()))?;

        // Same identity headers as REST calls; no API key or bearer
        // token is needed for the handshake.
        let request = ClientRequestBuilder::new(uri)
            .with_header("Cookie", self.session.cookie_header().await)
            .with_header("Origin", self.origin.clone())
            .with_header("User-Agent", self.user_agent.clone());

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::SocketConnect(e.to_string()))?;

        info!("push channel connected");
        self.state.send_replace(ConnectionState::Connected);
        self.bus.emit(AbodeEvent::SocketConnected);

        let (mut write, mut read) = ws_stream.split();

        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ping.tick().await;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    let _ = write.close().await;
                    return Ok(());
                }
                _ = ping.tick() => {
                    write
                        .send(tungstenite::Message::Text(PING_FRAME.into()))
                        .await
                        .map_err(|e| Error::SocketConnect(e.to_string()))?;
                    trace!("keepalive ping sent");
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            if handle_frame(&text, &self.bus, backoff, dedupe) == FrameAction::Close {
                                self.state.send_replace(ConnectionState::Closing);
                                let _ = write.close().await;
                                // keep draining; the close path below runs
                                // once the server acks
                            }
                        }
                        Some(Ok(tungstenite::Message::Ping(_))) => {
                            // tungstenite replies with pongs automatically
                            trace!("websocket ping");
                        }
                        Some(Ok(tungstenite::Message::Close(_))) => {
                            debug!("close frame received");
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            return Err(Error::SocketConnect(e.to_string()));
                        }
                        None => {
                            debug!("push channel stream ended");
                            return Ok(());
                        }
                        _ => {
                            // binary, pong, raw frames -- ignore
                        }
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

/// React to one decoded text frame: close on an unauthorized signal,
/// reset backoff on healthy frames, and feed admitted device updates to
/// the bus.
fn handle_frame(
    text: &str,
    bus: &EventBus,
    backoff: &mut Backoff,
    dedupe: &mut DedupeWindow,
) -> FrameAction {
    match decode_frame(text) {
        Ok(FrameKind::Unauthorized) => {
            warn!("push channel not authorized, closing");
            FrameAction::Close
        }
        Ok(FrameKind::Handshake) => FrameAction::Continue,
        Ok(FrameKind::DeviceUpdate(id)) => {
            backoff.reset();
            if dedupe.admit(Instant::now()) {
                debug!(device_id = %id, "device updated");
                bus.emit(AbodeEvent::DeviceUpdated(id));
            } else {
                debug!(device_id = %id, "device update coalesced");
            }
            FrameAction::Continue
        }
        Ok(FrameKind::Other) => {
            backoff.reset();
            FrameAction::Continue
        }
        Err(e) => {
            // malformed frames are dropped without touching backoff
            // or the connection
            debug!(error = %e, "failed to decode frame");
            FrameAction::Continue
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    // ── Backoff ──────────────────────────────────────────────────────

    #[test]
    fn backoff_doubles_per_attempt() {
        let mut backoff = Backoff::new(Duration::from_millis(1000), Duration::from_secs(300));

        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(4000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(8000));
    }

    #[test]
    fn backoff_resets_to_base() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(300));

        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_caps_at_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));

        for _ in 0..10 {
            backoff.next_delay();
        }

        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
    }

    // ── Dedupe window ────────────────────────────────────────────────

    #[test]
    fn dedupe_suppresses_within_window() {
        let mut dedupe = DedupeWindow::new(Duration::from_millis(500));
        let start = Instant::now();

        assert!(dedupe.admit(start));
        assert!(!dedupe.admit(start + Duration::from_millis(100)));
        assert!(dedupe.admit(start + Duration::from_millis(600)));
    }

    #[test]
    fn dedupe_is_not_keyed_per_device() {
        // the slot is process-global: a second device inside the window
        // is coalesced away too
        let mut dedupe = DedupeWindow::new(Duration::from_millis(500));
        let start = Instant::now();

        assert!(dedupe.admit(start));
        assert!(!dedupe.admit(start + Duration::from_millis(50)));
    }

    #[test]
    fn dedupe_first_event_always_admitted() {
        let mut dedupe = DedupeWindow::new(Duration::from_millis(500));
        assert!(dedupe.admit(Instant::now()));
    }

    // ── Frame decoding ───────────────────────────────────────────────

    #[test]
    fn decode_handshake_envelope() {
        let frame = r#"0{"sid":"abc","upgrades":[],"pingInterval":25000}"#;
        assert_eq!(decode_frame(frame).unwrap(), FrameKind::Handshake);
    }

    #[test]
    fn decode_unauthorized_marker() {
        let frame = r#"44{"message":"Not Authorized"}"#;
        assert_eq!(decode_frame(frame).unwrap(), FrameKind::Unauthorized);
    }

    #[test]
    fn decode_device_update() {
        let frame = r#"42["com.goabode.device.update","ZW:0000a1"]"#;
        assert_eq!(
            decode_frame(frame).unwrap(),
            FrameKind::DeviceUpdate("ZW:0000a1".into())
        );
    }

    #[test]
    fn decode_device_update_empty_id_is_other() {
        let frame = r#"42["com.goabode.device.update",""]"#;
        assert_eq!(decode_frame(frame).unwrap(), FrameKind::Other);
    }

    #[test]
    fn decode_unrelated_event_is_other() {
        let frame = r#"42["com.goabode.gateway.timeline","ZW:0000a1"]"#;
        assert_eq!(decode_frame(frame).unwrap(), FrameKind::Other);
    }

    #[test]
    fn decode_wrong_arity_is_other() {
        let frame = r#"42["com.goabode.device.update","ZW:0000a1","extra"]"#;
        assert_eq!(decode_frame(frame).unwrap(), FrameKind::Other);
    }

    #[test]
    fn decode_bare_pong_is_other() {
        assert_eq!(decode_frame("3").unwrap(), FrameKind::Other);
    }

    #[test]
    fn decode_malformed_payload_is_error() {
        assert!(matches!(
            decode_frame("42[not json"),
            Err(Error::Decode { .. })
        ));
    }

    // ── Frame handling ───────────────────────────────────────────────

    fn fixtures() -> (EventBus, Backoff, DedupeWindow) {
        (
            EventBus::new(),
            Backoff::new(Duration::from_secs(1), Duration::from_secs(300)),
            DedupeWindow::new(Duration::from_millis(500)),
        )
    }

    #[test]
    fn unauthorized_frame_closes_without_emitting() {
        let (bus, mut backoff, mut dedupe) = fixtures();
        let mut rx = bus.subscribe();

        let action = handle_frame(
            r#"44{"message":"Not Authorized"}"#,
            &bus,
            &mut backoff,
            &mut dedupe,
        );

        assert_eq!(action, FrameAction::Close);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn device_update_reaches_the_bus() {
        let (bus, mut backoff, mut dedupe) = fixtures();
        let mut rx = bus.subscribe();

        let action = handle_frame(
            r#"42["com.goabode.device.update","ZW:0000a1"]"#,
            &bus,
            &mut backoff,
            &mut dedupe,
        );

        assert_eq!(action, FrameAction::Continue);
        assert_eq!(
            rx.try_recv().unwrap(),
            AbodeEvent::DeviceUpdated("ZW:0000a1".into())
        );
    }

    #[test]
    fn update_burst_is_coalesced_on_the_bus() {
        let (bus, mut backoff, mut dedupe) = fixtures();
        let mut rx = bus.subscribe();

        handle_frame(
            r#"42["com.goabode.device.update","ZW:0000a1"]"#,
            &bus,
            &mut backoff,
            &mut dedupe,
        );
        // the slot is global, so a different device inside the window is
        // dropped too
        handle_frame(
            r#"42["com.goabode.device.update","ZW:0000b2"]"#,
            &bus,
            &mut backoff,
            &mut dedupe,
        );

        assert_eq!(
            rx.try_recv().unwrap(),
            AbodeEvent::DeviceUpdated("ZW:0000a1".into())
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn healthy_frame_resets_backoff() {
        let (bus, mut backoff, mut dedupe) = fixtures();
        backoff.next_delay();
        backoff.next_delay();

        handle_frame("3", &bus, &mut backoff, &mut dedupe);

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn malformed_frame_preserves_backoff() {
        let (bus, mut backoff, mut dedupe) = fixtures();
        backoff.next_delay();

        handle_frame("42[not json", &bus, &mut backoff, &mut dedupe);

        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancelled_stream_task_exits() {
        use crate::auth::Credentials;

        let cancel = CancellationToken::new();
        let config = ClientConfig::default();
        let session = Arc::new(
            SessionManager::new(
                config.clone(),
                Credentials::new("user@example.com", "hunter2".to_string()),
                cancel.child_token(),
            )
            .unwrap(),
        );
        let stream = EventStream::new(session, EventBus::new(), &config, cancel.clone());
        let mut state = stream.watch_state();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), stream.run())
            .await
            .expect("stream loop should exit once cancelled");

        assert_eq!(*state.borrow_and_update(), ConnectionState::Disconnected);
    }
}
