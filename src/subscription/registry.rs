use crate::transport::{MessageCallback, SubscriptionHandle};
use indexmap::IndexMap;

/// A registered topic subscription
pub(crate) struct RegisteredSubscription {
    /// Live transport-level handle; None while disconnected or pending
    pub handle: Option<SubscriptionHandle>,
    /// Durable callback, re-attached to the transport after reconnection
    pub callback: MessageCallback,
}

impl RegisteredSubscription {
    pub fn new(callback: MessageCallback) -> Self {
        Self {
            handle: None,
            callback,
        }
    }
}

/// Tracks, per topic, the live transport subscription handle and the durable
/// callback that outlives it.
///
/// Iteration order is insertion order, which makes resubscription replay
/// deterministic. The connection manager task is the single owner; nothing
/// else mutates the registry.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: IndexMap<String, RegisteredSubscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, topic: String, entry: RegisteredSubscription) {
        self.entries.insert(topic, entry);
    }

    pub fn get(&self, topic: &str) -> Option<&RegisteredSubscription> {
        self.entries.get(topic)
    }

    pub fn get_mut(&mut self, topic: &str) -> Option<&mut RegisteredSubscription> {
        self.entries.get_mut(topic)
    }

    pub fn remove(&mut self, topic: &str) -> Option<RegisteredSubscription> {
        // shift_remove keeps the order of the remaining entries
        self.entries.shift_remove(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    /// Entries in insertion order
    pub fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (&String, &mut RegisteredSubscription)> {
        self.entries.iter_mut()
    }

    /// Invalidate every transport handle, keeping the callbacks
    pub fn clear_handles(&mut self) {
        for entry in self.entries.values_mut() {
            entry.handle = None;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
