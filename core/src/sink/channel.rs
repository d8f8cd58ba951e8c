use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;

use crate::sink::{EventSource, ReceiverIdentity};
use crate::source::Metadata;

/// A payload handed downstream, still encoded.
#[derive(Debug, Clone)]
pub struct EncodedEvent {
    pub receiver: String,
    pub payload: Vec<u8>,
    pub metadata: Option<Metadata>,
    pub received_at: DateTime<Utc>,
}

/// Forwards payloads into a bounded channel drained by the decoding stage.
///
/// A full channel applies backpressure to the receiver's worker. Once the consuming
/// side is gone events are dropped with a warning.
pub struct ChannelEventSource {
    source_id: String,
    sender: mpsc::Sender<EncodedEvent>,
}

impl ChannelEventSource {
    pub fn new(
        source_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<EncodedEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let source = Self {
            source_id: source_id.into(),
            sender,
        };
        (source, receiver)
    }
}

impl EventSource for ChannelEventSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn on_encoded_event_received(
        &self,
        receiver: &ReceiverIdentity,
        payload: Vec<u8>,
        metadata: Option<Metadata>,
    ) {
        let event = EncodedEvent {
            receiver: receiver.display_name.clone(),
            payload,
            metadata,
            received_at: Utc::now(),
        };
        if self.sender.send(event).await.is_err() {
            warn!(
                "Event source {} has no consumer, dropping payload from {}",
                self.source_id, receiver.display_name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ReceiverIdentity {
        ReceiverIdentity {
            display_name: "tcp://localhost:1883/t1".to_string(),
            topic: "t1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_forwards_payload_and_metadata() {
        let (source, mut events) = ChannelEventSource::new("source-1", 4);
        let metadata = Metadata::from([("k".to_string(), "v".to_string())]);

        source
            .on_encoded_event_received(&identity(), b"abc".to_vec(), Some(metadata.clone()))
            .await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.receiver, "tcp://localhost:1883/t1");
        assert_eq!(event.payload, b"abc");
        assert_eq!(event.metadata, Some(metadata));
        assert_eq!(source.source_id(), "source-1");
    }

    #[tokio::test]
    async fn test_closed_consumer_drops_event() {
        let (source, events) = ChannelEventSource::new("source-1", 1);
        drop(events);

        // must return rather than block or panic
        source
            .on_encoded_event_received(&identity(), b"lost".to_vec(), None)
            .await;
    }
}
