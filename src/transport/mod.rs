// Broker transport contract

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Callback invoked with the raw text of each frame received on a topic
pub type MessageCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Lifecycle events a transport emits onto the connection manager's queue
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The broker accepted the connection; the session is ready
    Established,
    /// The broker reported a protocol-level error
    ProtocolError(String),
    /// The connection terminated, cleanly or not
    Closed,
}

/// Opaque identifier for a live topic subscription
///
/// Valid only for the connection that issued it; invalidated on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(Uuid);

impl SubscriptionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Heartbeat intervals negotiated with the broker
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatIntervals {
    pub outgoing: Duration,
    pub incoming: Duration,
}

/// Parameters for opening a broker connection
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub url: String,
    /// Connection headers, including the Authorization header when present
    pub headers: Vec<(String, String)>,
    pub heartbeat: HeartbeatIntervals,
}

/// A broker transport: opens persistent bidirectional connections that speak
/// the wire protocol.
///
/// Implementations own framing, handshakes, and heartbeat mechanics. The core
/// treats payloads as opaque text. Lifecycle events are emitted through the
/// `events` sender handed to [`Transport::open`]; they are processed on the
/// connection manager's serialized queue, so implementations never touch
/// manager state directly.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to the broker.
    ///
    /// Establishment is signalled by [`TransportEvent::Established`] on
    /// `events`, not by this method returning. Implementations must emit
    /// [`TransportEvent::Closed`] only for transport-initiated termination,
    /// never in response to [`TransportConnection::close`].
    async fn open(
        &self,
        options: OpenOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn TransportConnection>>;
}

/// A live broker connection
#[async_trait]
pub trait TransportConnection: Send {
    /// Subscribe to a topic; `on_message` receives the raw text of each frame
    async fn subscribe_topic(
        &mut self,
        topic: &str,
        on_message: MessageCallback,
    ) -> Result<SubscriptionHandle>;

    /// Drop a topic subscription
    async fn unsubscribe_topic(&mut self, handle: SubscriptionHandle) -> Result<()>;

    /// Send a frame to a topic
    async fn publish(&mut self, topic: &str, payload: String) -> Result<()>;

    /// Tear down the connection
    async fn close(&mut self) -> Result<()>;
}
