use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::errors::ConnectionError;
use crate::lifecycle::signalled;
use crate::receiver::Forwarder;
use crate::sink::EventSource;
use crate::source::Connection;

/// Outcome of one pass through the receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Forwarded,
    Skipped,
    Cancelled,
}

/// Pulls messages from one connection, acknowledges them and forwards the payloads.
///
/// A message is acknowledged before it is forwarded. A crash between the two loses
/// that message downstream even though the broker considers it delivered.
pub(crate) struct Worker<C, E> {
    name: String,
    connection: Arc<C>,
    forwarder: Arc<Forwarder<E>>,
    shutdown: watch::Receiver<bool>,
    retry_delay: Duration,
}

impl<C, E> Worker<C, E>
where
    C: Connection,
    E: EventSource,
{
    pub(crate) fn new(
        name: String,
        connection: Arc<C>,
        forwarder: Arc<Forwarder<E>>,
        shutdown: watch::Receiver<bool>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            name,
            connection,
            forwarder,
            shutdown,
            retry_delay,
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) async fn run(mut self) {
        info!("Started MQTT subscription processing for {}", self.name);
        while self.step().await != Step::Cancelled {}
        info!("Stopped MQTT subscription processing for {}", self.name);
    }

    pub(crate) async fn step(&mut self) -> Step {
        if self.is_cancelled() {
            return Step::Cancelled;
        }

        let received = tokio::select! {
            biased;
            _ = signalled(&mut self.shutdown) => return Step::Cancelled,
            received = self.connection.receive() => received,
        };
        let message = match received {
            Ok(message) => message,
            Err(e) => return self.recover("receiving", e).await,
        };

        if let Err(e) = self.connection.acknowledge(&message.handle).await {
            return self.recover("acknowledging", e).await;
        }
        debug!(
            "Received message on {} (packet {})",
            message.topic, message.handle.packet_id
        );

        self.forwarder
            .forward(message.payload, message.metadata)
            .await;
        Step::Forwarded
    }

    async fn recover(&mut self, operation: &str, err: ConnectionError) -> Step {
        if self.is_cancelled() {
            debug!("{} interrupted by shutdown: {}", operation, err);
            return Step::Cancelled;
        }
        if err.is_closed() {
            warn!("Connection for {} closed, leaving receive loop", self.name);
            self.forwarder.stats().record_connection_lost();
            return Step::Cancelled;
        }

        error!("Error {} MQTT message on {}: {:?}", operation, self.name, err);
        self.forwarder.stats().record_receive_error();

        tokio::select! {
            biased;
            _ = signalled(&mut self.shutdown) => Step::Cancelled,
            _ = tokio::time::sleep(self.retry_delay) => Step::Skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReceiverConfig;
    use crate::sink::ReceiverIdentity;
    use crate::sink::channel::{ChannelEventSource, EncodedEvent};
    use crate::source::memory::{MemoryBroker, MemoryConnection};
    use crate::source::{Connector, Qos};
    use crate::telemetry::ReceiverStats;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct Harness {
        broker: MemoryBroker,
        connection: Arc<MemoryConnection>,
        stats: Arc<ReceiverStats>,
        shutdown: watch::Sender<bool>,
        events: mpsc::Receiver<EncodedEvent>,
        worker: Worker<MemoryConnection, ChannelEventSource>,
    }

    async fn harness() -> Harness {
        let broker = MemoryBroker::new();
        let connection = Arc::new(broker.connect(&ReceiverConfig::default()).await.unwrap());
        connection.subscribe("t1", Qos::AtLeastOnce).await.unwrap();

        let (source, events) = ChannelEventSource::new("source-1", 16);
        let stats = Arc::new(ReceiverStats::default());
        let identity = ReceiverIdentity {
            display_name: "tcp://localhost:1883/t1".to_string(),
            topic: "t1".to_string(),
        };
        let forwarder = Arc::new(Forwarder::new(identity, Arc::new(source), stats.clone()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = Worker::new(
            "test worker".to_string(),
            connection.clone(),
            forwarder,
            shutdown_rx,
            Duration::ZERO,
        );

        Harness {
            broker,
            connection,
            stats,
            shutdown,
            events,
            worker,
        }
    }

    #[tokio::test]
    async fn test_step_acknowledges_then_forwards() {
        let mut h = harness().await;
        h.broker.publish("t1", b"a", None);

        assert_eq!(h.worker.step().await, Step::Forwarded);
        assert_eq!(h.broker.acknowledged().len(), 1);
        assert_eq!(h.stats.events_received(), 1);

        let event = h.events.recv().await.unwrap();
        assert_eq!(event.payload, b"a");
        assert_eq!(event.metadata, None);
    }

    #[tokio::test]
    async fn test_step_skips_transient_error() {
        let mut h = harness().await;
        h.broker.inject_receive_error("t1", "malformed packet");

        assert_eq!(h.worker.step().await, Step::Skipped);
        assert_eq!(h.stats.snapshot().receive_errors, 1);
        assert_eq!(h.stats.events_received(), 0);
    }

    #[tokio::test]
    async fn test_step_cancelled_while_waiting() {
        let mut h = harness().await;
        let shutdown = h.shutdown;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            shutdown.send_replace(true);
        });

        let step = timeout(Duration::from_secs(1), h.worker.step())
            .await
            .expect("cancellation should interrupt receive");
        assert_eq!(step, Step::Cancelled);
        assert_eq!(h.stats.snapshot().connections_lost, 0);
    }

    #[tokio::test]
    async fn test_run_exits_when_connection_terminated() {
        let h = harness().await;
        let connection = h.connection.clone();
        let running = tokio::spawn(h.worker.run());

        connection.terminate().await.unwrap();
        timeout(Duration::from_secs(1), running)
            .await
            .expect("worker should exit once the connection is gone")
            .unwrap();
        // shutdown sender is still alive: the loop ended on the closed connection
        assert!(!*h.shutdown.borrow());
        assert_eq!(h.stats.snapshot().connections_lost, 1);
    }
}
