use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::ReceiverConfig;
use crate::errors::{ConnectionError, ReceiverError};
use crate::lifecycle::{LifecycleComponent, LifecycleStatus, ProgressMonitor};
use crate::sink::{EventSource, ReceiverIdentity};
use crate::source::{Connection, Connector, Metadata};
use crate::telemetry::{ReceiverMetrics, ReceiverStats};
use crate::worker::Worker;

/// Subscribes to an MQTT topic and pushes every payload to its event source.
///
/// The receiver owns one connection and one worker task per start/stop cycle.
/// `start` and `stop` are expected to be called sequentially by the owning framework.
pub struct Receiver<C: Connector, E: EventSource> {
    config: ReceiverConfig,
    connector: C,
    event_source: Option<Arc<E>>,
    connection: Option<Arc<C::Connection>>,
    worker: Option<WorkerHandle>,
    stats: Arc<ReceiverStats>,
    status: LifecycleStatus,
}

struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    async fn cancel(mut self, wait: Duration) {
        self.shutdown.send_replace(true);
        match timeout(wait, &mut self.task).await {
            Ok(Ok(())) => debug!("Worker {} finished", self.name),
            Ok(Err(e)) => error!("Worker {} ended abnormally: {}", self.name, e),
            Err(_) => {
                warn!(
                    "Worker {} did not stop within {:?}, aborting it",
                    self.name, wait
                );
                self.task.abort();
            }
        }
    }
}

/// Hands payloads from the worker to the event source.
pub(crate) struct Forwarder<E> {
    identity: ReceiverIdentity,
    event_source: Arc<E>,
    stats: Arc<ReceiverStats>,
}

impl<E: EventSource> Forwarder<E> {
    pub(crate) fn new(
        identity: ReceiverIdentity,
        event_source: Arc<E>,
        stats: Arc<ReceiverStats>,
    ) -> Self {
        Self {
            identity,
            event_source,
            stats,
        }
    }

    pub(crate) fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    pub(crate) async fn forward(&self, payload: Vec<u8>, metadata: Option<Metadata>) {
        self.stats.record_event();
        self.event_source
            .on_encoded_event_received(&self.identity, payload, metadata)
            .await;
    }
}

impl<C, E> Receiver<C, E>
where
    C: Connector,
    E: EventSource,
{
    pub fn new(config: ReceiverConfig, connector: C) -> Self {
        Self {
            config,
            connector,
            event_source: None,
            connection: None,
            worker: None,
            stats: Arc::new(ReceiverStats::default()),
            status: LifecycleStatus::Created,
        }
    }

    pub fn with_event_source(mut self, event_source: Arc<E>) -> Self {
        self.event_source = Some(event_source);
        self
    }

    /// Takes effect on the next `start`.
    pub fn set_event_source(&mut self, event_source: Arc<E>) {
        self.event_source = Some(event_source);
    }

    pub fn event_source(&self) -> Option<&Arc<E>> {
        self.event_source.as_ref()
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn identity(&self) -> ReceiverIdentity {
        ReceiverIdentity {
            display_name: self.config.display_name(),
            topic: self.config.topic.clone(),
        }
    }

    pub fn events_received(&self) -> u64 {
        self.stats.events_received()
    }

    pub fn metrics(&self) -> ReceiverMetrics {
        self.stats.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Name of the live worker, if any.
    pub fn worker_name(&self) -> Option<&str> {
        self.worker.as_ref().map(|worker| worker.name.as_str())
    }

    fn fail_connect(&mut self, source: ConnectionError) -> ReceiverError {
        self.status = LifecycleStatus::Errored;
        error!(
            "Receiver failed to connect to MQTT broker at '{}': {}",
            self.config.broker_info(),
            source
        );
        ReceiverError::Connection {
            broker: self.config.broker_info(),
            topic: self.config.topic.clone(),
            source,
        }
    }
}

impl<C, E> LifecycleComponent for Receiver<C, E>
where
    C: Connector,
    E: EventSource,
{
    async fn start(&mut self, monitor: &dyn ProgressMonitor) -> Result<(), ReceiverError> {
        let status = self.status();
        if !status.can_start() {
            return Err(ReceiverError::InvalidState { status });
        }
        if self.worker.is_some() || self.connection.is_some() {
            // the previous connection was lost while running
            self.stop(monitor).await;
        }
        let event_source = self
            .event_source
            .clone()
            .ok_or(ReceiverError::MissingEventSource)?;
        self.config.validate()?;

        let display_name = self.display_name();
        let topic = self.config.topic.clone();
        let timeouts = self.config.timeouts.clone();

        self.status = LifecycleStatus::Connecting;
        monitor.progress(&display_name, "Connecting to MQTT broker");
        info!(
            "Receiver connecting to MQTT broker at '{}'...",
            self.config.broker_info()
        );
        let connected = timeout(timeouts.connect(), self.connector.connect(&self.config)).await;
        let connection = match connected {
            Ok(Ok(connection)) => Arc::new(connection),
            Ok(Err(e)) => return Err(self.fail_connect(e)),
            Err(_) => {
                let e = ConnectionError::timeout("CONNACK", timeouts.connect_timeout_ms);
                return Err(self.fail_connect(e));
            }
        };
        info!("Receiver connected to MQTT broker.");

        self.status = LifecycleStatus::Subscribing;
        monitor.progress(&display_name, "Subscribing to topic");
        let subscribed = timeout(
            timeouts.subscribe(),
            connection.subscribe(&topic, self.config.qos()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ConnectionError::timeout(
                "SUBACK",
                timeouts.subscribe_timeout_ms,
            ))
        });
        if let Err(source) = subscribed {
            error!("Unable to subscribe to MQTT topic {}: {}", topic, source);
            release(connection.as_ref(), timeouts.shutdown()).await;
            self.status = LifecycleStatus::Errored;
            return Err(ReceiverError::Subscription { topic, source });
        }
        info!("Subscribed to events on MQTT topic: {}", topic);

        let ordinal = self.stats.record_worker_started();
        let name = format!(
            "MQTT({} - {}) Receiver {}",
            event_source.source_id(),
            topic,
            ordinal
        );
        let forwarder = Arc::new(Forwarder::new(
            self.identity(),
            event_source,
            self.stats.clone(),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = Worker::new(
            name.clone(),
            connection.clone(),
            forwarder,
            shutdown_rx,
            timeouts.receive_retry_delay(),
        );
        let span = info_span!("receiver_worker", worker = %name);
        let task = tokio::spawn(worker.run().instrument(span));

        self.connection = Some(connection);
        self.worker = Some(WorkerHandle {
            name,
            shutdown,
            task,
        });
        self.status = LifecycleStatus::Running;
        monitor.progress(&display_name, "Receiver started");
        Ok(())
    }

    async fn stop(&mut self, monitor: &dyn ProgressMonitor) {
        let display_name = self.display_name();
        if self.worker.is_none() && self.connection.is_none() {
            if self.status == LifecycleStatus::Stopped {
                info!("Receiver {} has already been shut down.", display_name);
            } else {
                debug!("Receiver {} is {}, nothing to stop", display_name, self.status);
            }
            return;
        }

        self.status = LifecycleStatus::Stopping;
        monitor.progress(&display_name, "Stopping receiver");
        let wait = self.config.timeouts.shutdown();

        if let Some(worker) = self.worker.take() {
            worker.cancel(wait).await;
        }
        if let Some(connection) = self.connection.take() {
            release(connection.as_ref(), wait).await;
        }

        self.status = LifecycleStatus::Stopped;
        monitor.progress(&display_name, "Receiver stopped");
        info!(
            "Receiver {} stopped after {} event(s)",
            display_name,
            self.stats.events_received()
        );
    }

    /// A running receiver whose worker has exited on a lost connection reports `Errored`.
    fn status(&self) -> LifecycleStatus {
        let lost = self.status == LifecycleStatus::Running
            && self
                .worker
                .as_ref()
                .is_some_and(|worker| worker.task.is_finished());
        if lost {
            LifecycleStatus::Errored
        } else {
            self.status
        }
    }

    fn display_name(&self) -> String {
        self.config.display_name()
    }
}

/// Disconnects, then terminates. Never fails: an already closed transport is logged
/// as informational, anything else as an error.
async fn release<T: Connection>(connection: &T, wait: Duration) {
    match timeout(wait, connection.disconnect()).await {
        Ok(Ok(())) => debug!("Disconnected from MQTT broker"),
        Ok(Err(e)) if e.is_already_closed() => {
            info!("Dispatcher has already been shut down.");
            return;
        }
        Ok(Err(e)) => error!("Error disconnecting MQTT event receiver: {:?}", e),
        Err(_) => error!("Timed out after {:?} disconnecting MQTT event receiver", wait),
    }

    match timeout(wait, connection.terminate()).await {
        Ok(Ok(())) => debug!("MQTT connection terminated"),
        Ok(Err(e)) if e.is_already_closed() => info!("Dispatcher has already been shut down."),
        Ok(Err(e)) => error!("Error shutting down MQTT event receiver: {:?}", e),
        Err(_) => error!("Timed out after {:?} terminating MQTT connection", wait),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::TracingProgressMonitor;
    use crate::sink::channel::ChannelEventSource;
    use crate::source::memory::MemoryBroker;

    fn receiver(broker: &MemoryBroker) -> Receiver<MemoryBroker, ChannelEventSource> {
        let mut config = ReceiverConfig::default();
        config.topic = "t1".to_string();
        Receiver::new(config, broker.clone())
    }

    #[tokio::test]
    async fn test_start_without_event_source_fails() {
        let broker = MemoryBroker::new();
        let mut receiver = receiver(&broker);

        let err = receiver.start(&TracingProgressMonitor).await.unwrap_err();
        assert!(matches!(err, ReceiverError::MissingEventSource));
        assert_eq!(receiver.status(), LifecycleStatus::Created);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let broker = MemoryBroker::new();
        let (source, _events) = ChannelEventSource::new("source-1", 4);
        let mut receiver = receiver(&broker).with_event_source(Arc::new(source));
        receiver.config.topic.clear();

        let err = receiver.start(&TracingProgressMonitor).await.unwrap_err();
        assert!(matches!(err, ReceiverError::Config(_)));
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_second_start_while_running_is_rejected() {
        let broker = MemoryBroker::new();
        let (source, _events) = ChannelEventSource::new("source-1", 4);
        let mut receiver = receiver(&broker).with_event_source(Arc::new(source));

        receiver.start(&TracingProgressMonitor).await.unwrap();
        let err = receiver.start(&TracingProgressMonitor).await.unwrap_err();
        assert!(matches!(
            err,
            ReceiverError::InvalidState {
                status: LifecycleStatus::Running
            }
        ));
        assert_eq!(broker.open_connections(), 1);

        receiver.stop(&TracingProgressMonitor).await;
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_worker_named_after_source_and_topic() {
        let broker = MemoryBroker::new();
        let (source, _events) = ChannelEventSource::new("source-1", 4);
        let mut receiver = receiver(&broker).with_event_source(Arc::new(source));

        receiver.start(&TracingProgressMonitor).await.unwrap();
        assert_eq!(receiver.worker_name(), Some("MQTT(source-1 - t1) Receiver 1"));
        receiver.stop(&TracingProgressMonitor).await;
        assert_eq!(receiver.worker_name(), None);

        receiver.start(&TracingProgressMonitor).await.unwrap();
        assert_eq!(receiver.worker_name(), Some("MQTT(source-1 - t1) Receiver 2"));
        receiver.stop(&TracingProgressMonitor).await;
    }
}
