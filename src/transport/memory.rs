//! In-process transport for tests and local development.
//!
//! [`LoopbackBroker`] stands in for the real broker: frames published by the
//! client are recorded, frames injected with [`LoopbackBroker::deliver`] reach
//! live subscribers, and [`LoopbackBroker::drop_sessions`] terminates every
//! open session the way a broker restart would. No wire protocol is involved.

use super::{
    MessageCallback, OpenOptions, SubscriptionHandle, Transport, TransportConnection,
    TransportEvent,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
struct BrokerInner {
    /// Live subscriptions in subscribe order: (session, handle, topic, callback)
    subscriptions: Mutex<Vec<(u64, SubscriptionHandle, String, MessageCallback)>>,
    /// Frames published by clients: (topic, payload)
    published: Mutex<Vec<(String, String)>>,
    /// Event senders for open sessions
    sessions: Mutex<Vec<(u64, mpsc::UnboundedSender<TransportEvent>)>>,
    next_session: AtomicU64,
}

/// An in-process broker
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    inner: Arc<BrokerInner>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that connects to this broker
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(LoopbackTransport {
            inner: self.inner.clone(),
        })
    }

    /// Inject a frame for every live subscriber of `topic`
    pub fn deliver(&self, topic: &str, frame: &str) {
        let subscriptions = self.inner.subscriptions.lock().expect("broker lock poisoned");
        for (_, _, subscribed, callback) in subscriptions.iter() {
            if subscribed == topic {
                callback(frame.to_string());
            }
        }
    }

    /// Topics with at least one live subscription, in subscribe order
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.inner
            .subscriptions
            .lock()
            .expect("broker lock poisoned")
            .iter()
            .map(|(_, _, topic, _)| topic.clone())
            .collect()
    }

    /// Frames published by clients, in publish order
    pub fn published(&self) -> Vec<(String, String)> {
        self.inner
            .published
            .lock()
            .expect("broker lock poisoned")
            .clone()
    }

    /// Terminate every open session broker-side, as a broker restart would.
    /// Subscriptions are forgotten; each session receives `Closed`.
    pub fn drop_sessions(&self) {
        self.inner
            .subscriptions
            .lock()
            .expect("broker lock poisoned")
            .clear();
        let sessions: Vec<_> = self
            .inner
            .sessions
            .lock()
            .expect("broker lock poisoned")
            .drain(..)
            .collect();
        debug!(sessions = sessions.len(), "loopback broker dropping sessions");
        for (_, events) in sessions {
            let _ = events.send(TransportEvent::Closed);
        }
    }
}

struct LoopbackTransport {
    inner: Arc<BrokerInner>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(
        &self,
        options: OpenOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn TransportConnection>> {
        let session = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        debug!(session = session, url = %options.url, "loopback session opened");
        self.inner
            .sessions
            .lock()
            .expect("broker lock poisoned")
            .push((session, events.clone()));

        // The loopback broker accepts instantly
        let _ = events.send(TransportEvent::Established);

        Ok(Box::new(LoopbackConnection {
            inner: self.inner.clone(),
            session,
        }))
    }
}

struct LoopbackConnection {
    inner: Arc<BrokerInner>,
    session: u64,
}

#[async_trait]
impl TransportConnection for LoopbackConnection {
    async fn subscribe_topic(
        &mut self,
        topic: &str,
        on_message: MessageCallback,
    ) -> Result<SubscriptionHandle> {
        let handle = SubscriptionHandle::new();
        self.inner
            .subscriptions
            .lock()
            .expect("broker lock poisoned")
            .push((self.session, handle, topic.to_string(), on_message));
        Ok(handle)
    }

    async fn unsubscribe_topic(&mut self, handle: SubscriptionHandle) -> Result<()> {
        let mut subscriptions = self.inner.subscriptions.lock().expect("broker lock poisoned");
        let before = subscriptions.len();
        subscriptions.retain(|(_, h, _, _)| *h != handle);
        if subscriptions.len() == before {
            bail!("unknown subscription handle");
        }
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: String) -> Result<()> {
        self.inner
            .published
            .lock()
            .expect("broker lock poisoned")
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // Client-initiated close: forget this session without emitting Closed
        self.inner
            .subscriptions
            .lock()
            .expect("broker lock poisoned")
            .retain(|(session, _, _, _)| *session != self.session);
        self.inner
            .sessions
            .lock()
            .expect("broker lock poisoned")
            .retain(|(session, _)| *session != self.session);
        Ok(())
    }
}
