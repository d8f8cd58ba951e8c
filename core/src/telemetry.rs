use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "receiver_core=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Diagnostic counters shared between a receiver and its worker.
/// Not authoritative for delivery guarantees.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    events_received: AtomicU64,
    receive_errors: AtomicU64,
    workers_started: AtomicU64,
    connections_lost: AtomicU64,
    last_event_millis: AtomicI64,
}

impl ReceiverStats {
    pub fn record_event(&self) -> u64 {
        self.last_event_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.events_received.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// The transport closed underneath a running worker.
    pub fn record_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the 1-based ordinal of the new worker.
    pub fn record_worker_started(&self) -> u64 {
        self.workers_started.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ReceiverMetrics {
        let last_event = self.last_event_millis.load(Ordering::Relaxed);
        ReceiverMetrics {
            events_received: self.events_received(),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            workers_started: self.workers_started.load(Ordering::Relaxed),
            connections_lost: self.connections_lost.load(Ordering::Relaxed),
            last_event_at: if last_event == 0 {
                None
            } else {
                DateTime::from_timestamp_millis(last_event)
            },
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ReceiverMetrics {
    pub events_received: u64,
    pub receive_errors: u64,
    pub workers_started: u64,
    pub connections_lost: u64,
    pub last_event_at: Option<DateTime<Utc>>,
}
