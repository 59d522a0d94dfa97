use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

/// Connection lifecycle state
///
/// Exactly one value is live at a time. A move from Disconnected to
/// Connected always passes through Connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

const STATE_CHANNEL_CAPACITY: usize = 16;

/// Holds and publishes the current connection state.
///
/// Transitions are broadcast to every observer in the order they occur.
/// There is no history beyond the single current value; a late observer
/// sees the current state and everything after it, nothing before.
pub struct ConnectionStateStore {
    current: Mutex<ConnectionState>,
    tx: broadcast::Sender<ConnectionState>,
}

impl ConnectionStateStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            current: Mutex::new(ConnectionState::Disconnected),
            tx,
        }
    }

    /// Current state
    pub fn get(&self) -> ConnectionState {
        *self.current.lock().expect("state lock poisoned")
    }

    /// Overwrite the state and notify all current observers
    pub fn set(&self, state: ConnectionState) {
        // The lock is held across the send so observe() cannot slip between
        // the overwrite and the notification.
        let mut current = self.current.lock().expect("state lock poisoned");
        *current = state;
        let _ = self.tx.send(state); // no observers is fine
    }

    /// Observe the state: yields the current value immediately, then every
    /// subsequent transition until the stream is dropped.
    pub fn observe(&self) -> StateStream {
        let current = self.current.lock().expect("state lock poisoned");
        let rx = self.tx.subscribe();
        StateStream {
            first: Some(*current),
            inner: BroadcastStream::new(rx),
        }
    }
}

impl Default for ConnectionStateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream of connection state transitions, starting from the state that was
/// current when `observe()` was called.
pub struct StateStream {
    first: Option<ConnectionState>,
    inner: BroadcastStream<ConnectionState>,
}

impl Stream for StateStream {
    type Item = ConnectionState;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(state) = self.first.take() {
            return Poll::Ready(Some(state));
        }

        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(state))) => return Poll::Ready(Some(state)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(skipped = skipped, "state observer lagged, transitions skipped");
                    // Continue with the next available transition
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
