// In-process event bus decoupling the push channel from consumers.
//
// Thin wrapper over `tokio::sync::broadcast`: synchronous fan-out to the
// subscribers present at emission time, no replay for late subscribers.

use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events published by the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbodeEvent {
    /// The push channel finished its websocket handshake.
    SocketConnected,
    /// The push channel closed; a reconnect is being scheduled.
    SocketDisconnected,
    /// A device reported a state change. Carries the device id.
    DeviceUpdated(String),
}

/// Cheaply cloneable pub/sub handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AbodeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to events emitted from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<AbodeEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: AbodeEvent) {
        // a send error just means no subscribers right now
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
