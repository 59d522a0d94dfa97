use crate::auth::{self, CredentialSource};
use crate::config::TetherConfig;
use crate::reconnect::ReconnectPolicy;
use crate::state::{ConnectionState, ConnectionStateStore, StateStream};
use crate::subscription::registry::{RegisteredSubscription, SubscriptionRegistry};
use crate::subscription::stream::{Payload, TopicStream};
use crate::transport::{
    HeartbeatIntervals, MessageCallback, OpenOptions, Transport, TransportConnection,
    TransportEvent,
};
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

/// Per-topic fan-out buffer; consumers that fall further behind skip messages
const TOPIC_CHANNEL_CAPACITY: usize = 100;

/// Requests processed on the manager's serialized queue
pub(crate) enum Command {
    Connect,
    Disconnect,
    SubscribeTopic { topic: String },
    CompleteSubscribe { topic: String },
    ConsumerDetached { topic: String },
    Publish { topic: String, payload: String },
    RetryTimerFired { epoch: u64 },
}

/// Manages the single shared broker connection and the topic subscriptions
/// multiplexed over it.
///
/// One instance is constructed at session start and owns the connection for
/// the life of the session; `disconnect()` is the session-end call. The
/// handle is cheap to clone and safe to hand to every dashboard component.
///
/// All mutation happens on one background task: transport events, reconnect
/// timer firings, and subscribe/detach/publish requests are messages on a
/// single queue, so no two state changes race. Public operations return
/// immediately and never fail; connection trouble surfaces only through
/// [`ConnectionManager::observe_connection_state`].
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<ConnectionStateStore>,
    channels: Arc<DashMap<String, broadcast::Sender<Payload>>>,
}

impl ConnectionManager {
    pub fn new(
        config: TetherConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ConnectionStateStore::new());
        let channels = Arc::new(DashMap::new());

        let task = ManagerTask {
            policy: ReconnectPolicy::from_config(&config.reconnect),
            config,
            transport,
            credentials,
            state: state.clone(),
            channels: channels.clone(),
            registry: SubscriptionRegistry::new(),
            connection: None,
            attempts: 0,
            ever_connected: false,
            epoch: 0,
            command_tx: command_tx.clone(),
            event_tx,
        };
        tokio::spawn(task.run(command_rx, event_rx));

        Self {
            commands: command_tx,
            state,
            channels,
        }
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Observe connection state: the current value, then every transition
    pub fn observe_connection_state(&self) -> StateStream {
        self.state.observe()
    }

    /// Open the broker connection. No-op when already connected.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Tear down the connection and stop automatic reconnection until the
    /// next `connect()` call. Registered topics survive and are replayed on
    /// the next established connection.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Subscribe to a topic.
    ///
    /// Returns immediately. The first consumer of a topic triggers the
    /// transport-level subscribe, deferred until the connection is
    /// established if necessary; additional consumers share the same
    /// subscription. Dropping the last consumer's stream tears the
    /// subscription down.
    pub fn subscribe(&self, topic: impl Into<String>) -> TopicStream {
        let topic = topic.into();
        let receiver = self
            .channels
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(TOPIC_CHANNEL_CAPACITY).0)
            .subscribe();
        let _ = self.commands.send(Command::SubscribeTopic {
            topic: topic.clone(),
        });
        TopicStream::new(topic, receiver, self.commands.clone())
    }

    /// Publish a payload to a topic.
    ///
    /// Messages sent while not connected are dropped silently: no queuing,
    /// no error. The surrounding UI is expected to gate its sends on the
    /// observed connection state.
    pub fn send<T: Serialize>(&self, topic: &str, payload: &T) {
        match serde_json::to_string(payload) {
            Ok(json) => {
                let _ = self.commands.send(Command::Publish {
                    topic: topic.to_string(),
                    payload: json,
                });
            }
            Err(e) => warn!(topic = %topic, error = %e, "failed to serialize outbound payload"),
        }
    }
}

/// State owned by the manager task
struct ManagerTask {
    config: TetherConfig,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    state: Arc<ConnectionStateStore>,
    channels: Arc<DashMap<String, broadcast::Sender<Payload>>>,
    registry: SubscriptionRegistry,
    connection: Option<Box<dyn TransportConnection>>,
    policy: ReconnectPolicy,
    /// Failed attempts since the last successful establishment
    attempts: u32,
    /// True once any connection has reached Connected; gates replay
    ever_connected: bool,
    /// Bumped by disconnect(); reconnect timers from an older epoch are stale
    epoch: u64,
    command_tx: mpsc::UnboundedSender<Command>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl ManagerTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // Every handle and stream is gone; the session is over
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }

        if let Some(mut connection) = self.connection.take() {
            let _ = connection.close().await;
        }
        debug!("connection manager task stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                if self.state.get() == ConnectionState::Connected {
                    debug!("connect requested while connected, ignoring");
                    return;
                }
                // An explicit connect resets the attempt budget
                self.attempts = 0;
                self.open_transport().await;
            }
            Command::Disconnect => self.disconnect_transport().await,
            Command::SubscribeTopic { topic } => self.subscribe_topic(topic).await,
            Command::CompleteSubscribe { topic } => self.complete_subscribe(topic).await,
            Command::ConsumerDetached { topic } => self.consumer_detached(topic).await,
            Command::Publish { topic, payload } => self.publish(topic, payload).await,
            Command::RetryTimerFired { epoch } => {
                if epoch != self.epoch {
                    // Scheduled before a disconnect() that cancelled
                    // automatic reconnection
                    debug!("stale reconnect timer, skipping");
                    return;
                }
                // Re-check at fire time: a connection may have been
                // established while the timer was pending
                if self.state.get() == ConnectionState::Connected {
                    debug!("reconnect timer fired while connected, skipping");
                    return;
                }
                self.open_transport().await;
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Established => {
                info!("broker connection established");
                self.attempts = 0;
                let reconnection = self.ever_connected;
                self.ever_connected = true;
                self.state.set(ConnectionState::Connected);
                if reconnection {
                    // Subscriptions made before the first connection are
                    // completed by their parked observers instead
                    self.replay_subscriptions().await;
                }
            }
            TransportEvent::ProtocolError(message) => {
                warn!(message = %message, "broker protocol error");
                self.drop_connection().await;
                self.state.set(ConnectionState::Error);
                self.schedule_reconnect();
            }
            TransportEvent::Closed => {
                info!("broker connection closed");
                self.drop_connection().await;
                self.state.set(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    async fn open_transport(&mut self) {
        // Drop any half-open previous connection so nothing leaks
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.close().await;
        }

        self.state.set(ConnectionState::Connecting);

        let token = self.credentials.access_token();
        let options = OpenOptions {
            url: self.config.broker.url.clone(),
            headers: auth::auth_headers(token.as_deref()),
            heartbeat: HeartbeatIntervals {
                outgoing: Duration::from_millis(self.config.broker.heartbeat_out_ms),
                incoming: Duration::from_millis(self.config.broker.heartbeat_in_ms),
            },
        };

        info!(url = %options.url, "opening broker connection");
        match self.transport.open(options, self.event_tx.clone()).await {
            Ok(connection) => self.connection = Some(connection),
            Err(e) => {
                warn!(error = %e, "failed to open broker connection");
                self.state.set(ConnectionState::Error);
                self.schedule_reconnect();
            }
        }
    }

    async fn disconnect_transport(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            // Best-effort teardown: one failing unsubscribe must not stop
            // the others
            for (topic, entry) in self.registry.iter_mut() {
                if let Some(handle) = entry.handle.take() {
                    if let Err(e) = connection.unsubscribe_topic(handle).await {
                        warn!(topic = %topic, error = %e, "unsubscribe failed during disconnect");
                    }
                }
            }
            let _ = connection.close().await;
        }

        self.state.set(ConnectionState::Disconnected);
        // Exhaust the attempt budget and invalidate pending timers: no
        // automatic reconnect fires until the next explicit connect()
        self.attempts = self.policy.max_attempts();
        self.epoch += 1;
        info!("disconnected from broker");
    }

    async fn drop_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.close().await;
        }
        // Handles died with the connection; callbacks stay for replay
        self.registry.clear_handles();
    }

    async fn replay_subscriptions(&mut self) {
        if self.registry.is_empty() {
            return;
        }
        info!(topics = self.registry.len(), "replaying topic subscriptions");

        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        for (topic, entry) in self.registry.iter_mut() {
            match connection
                .subscribe_topic(topic, entry.callback.clone())
                .await
            {
                Ok(handle) => entry.handle = Some(handle),
                Err(e) => warn!(topic = %topic, error = %e, "resubscribe failed"),
            }
        }
    }

    async fn subscribe_topic(&mut self, topic: String) {
        if let Some(entry) = self.registry.get(&topic) {
            if entry.handle.is_some() {
                // Additional consumer on a live topic; nothing to do
                return;
            }
            // Registered but handle-less: an earlier subscribe failed or is
            // still parked. Retry now if we can, otherwise the pending path
            // completes on its own.
            if self.state.get() == ConnectionState::Connected {
                self.issue_subscribe(&topic).await;
            }
            return;
        }

        let Some(sender) = self.channels.get(&topic).map(|entry| entry.value().clone()) else {
            // Consumer already detached before this request was processed
            return;
        };

        let callback = forward_into(topic.clone(), sender);
        self.registry
            .put(topic.clone(), RegisteredSubscription::new(callback));

        if self.state.get() == ConnectionState::Connected {
            self.issue_subscribe(&topic).await;
        } else {
            self.park_subscribe(topic);
        }
    }

    /// Park a subscribe request until the connection is established: a
    /// one-shot observer on the state store completes the subscribe the
    /// instant Connected is observed, then detaches.
    fn park_subscribe(&self, topic: String) {
        debug!(topic = %topic, "not connected, parking subscribe");
        let mut states = self.state.observe();
        let commands = self.command_tx.clone();
        tokio::spawn(async move {
            while let Some(state) = states.next().await {
                if state == ConnectionState::Connected {
                    let _ = commands.send(Command::CompleteSubscribe { topic });
                    break;
                }
            }
        });
    }

    async fn complete_subscribe(&mut self, topic: String) {
        let pending = self
            .registry
            .get(&topic)
            .is_some_and(|entry| entry.handle.is_none());
        if !pending {
            // Unsubscribed in the meantime, or the resubscription replay got
            // there first
            return;
        }
        if self.state.get() != ConnectionState::Connected {
            // Connection dropped again before the parked subscribe ran; the
            // next replay covers this entry
            return;
        }
        self.issue_subscribe(&topic).await;
    }

    async fn issue_subscribe(&mut self, topic: &str) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        let Some(entry) = self.registry.get_mut(topic) else {
            return;
        };

        debug!(topic = %topic, "subscribing to topic");
        match connection
            .subscribe_topic(topic, entry.callback.clone())
            .await
        {
            Ok(handle) => entry.handle = Some(handle),
            Err(e) => {
                // Non-fatal: the entry stays registered and is retried by
                // the next resubscription replay
                warn!(topic = %topic, error = %e, "subscribe failed");
            }
        }
    }

    async fn consumer_detached(&mut self, topic: String) {
        // Tear down only if this was the last consumer; a concurrent
        // subscribe re-creates its own entry afterwards if needed
        let removed = self
            .channels
            .remove_if(&topic, |_, sender| sender.receiver_count() == 0)
            .is_some();
        if !removed {
            return;
        }

        let Some(entry) = self.registry.remove(&topic) else {
            return;
        };
        debug!(topic = %topic, "last consumer detached, dropping subscription");

        if self.state.get() != ConnectionState::Connected {
            return;
        }
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if let Some(handle) = entry.handle {
            if let Err(e) = connection.unsubscribe_topic(handle).await {
                warn!(topic = %topic, error = %e, "unsubscribe failed");
            }
        }
    }

    async fn publish(&mut self, topic: String, payload: String) {
        if self.state.get() != ConnectionState::Connected {
            // Dropped silently; see ConnectionManager::send
            debug!(topic = %topic, "not connected, dropping outbound message");
            return;
        }
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if let Err(e) = connection.publish(&topic, payload).await {
            warn!(topic = %topic, error = %e, "publish failed");
        }
    }

    fn schedule_reconnect(&mut self) {
        if !self.policy.should_retry(self.attempts) {
            warn!(
                attempts = self.attempts,
                "reconnect attempts exhausted, giving up until next connect()"
            );
            return;
        }

        let delay = self.policy.next_delay(self.attempts);
        self.attempts += 1;
        info!(
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );

        let commands = self.command_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(Command::RetryTimerFired { epoch });
        });
    }
}

/// Durable per-topic callback: decodes the frame and fans it out to every
/// consumer of the topic
fn forward_into(topic: String, sender: broadcast::Sender<Payload>) -> MessageCallback {
    Arc::new(move |raw: String| {
        trace!(topic = %topic, bytes = raw.len(), "frame received");
        let _ = sender.send(Payload::from_raw(raw)); // no consumers is fine
    })
}
