use crate::subscription::manager::Command;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

/// A message delivered on a topic.
///
/// Broker frames are parsed as JSON. A frame that fails to parse is delivered
/// to consumers as raw text rather than dropped or reported; decode failure is
/// not an error. Consumers that expect structured payloads can use
/// [`Payload::decode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Frame body parsed as JSON
    Json(Value),
    /// Frame body that did not parse, delivered unchanged
    Text(String),
}

impl Payload {
    pub(crate) fn from_raw(raw: String) -> Self {
        match serde_json::from_str(&raw) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(raw),
        }
    }

    /// Decode into a typed payload.
    ///
    /// Returns None for raw text and for JSON that does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        match self {
            Payload::Json(value) => serde_json::from_value(value.clone()).ok(),
            Payload::Text(_) => None,
        }
    }
}

/// Stream of payloads for one topic.
///
/// Dropping the stream detaches the consumer; when the last consumer for a
/// topic detaches, the transport-level subscription is torn down. A consumer
/// that falls behind the topic buffer skips messages with a warning instead
/// of blocking delivery to others.
pub struct TopicStream {
    topic: String,
    inner: Option<BroadcastStream<Payload>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl TopicStream {
    pub(crate) fn new(
        topic: String,
        receiver: broadcast::Receiver<Payload>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            topic,
            inner: Some(BroadcastStream::new(receiver)),
            commands,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Stream for TopicStream {
    type Item = Payload;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        loop {
            match Pin::new(&mut *inner).poll_next(cx) {
                Poll::Ready(Some(Ok(payload))) => return Poll::Ready(Some(payload)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(
                        topic = %this.topic,
                        skipped = skipped,
                        "consumer lagged, messages skipped"
                    );
                    // Continue with the next available message
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for TopicStream {
    fn drop(&mut self) {
        // Release the receiver before notifying, so the manager observes an
        // accurate consumer count when it processes the detach.
        self.inner = None;
        let _ = self.commands.send(Command::ConsumerDetached {
            topic: self.topic.clone(),
        });
    }
}
