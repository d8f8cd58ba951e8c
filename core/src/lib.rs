//! MQTT inbound event receiver.
//!
//! A [`receiver::Receiver`] subscribes to one broker topic, acknowledges every message it
//! pulls and forwards the raw payload to a downstream [`sink::EventSource`]. Broker access
//! goes through the [`source::Connector`] and [`source::Connection`] traits so the same
//! lifecycle runs against a real broker ([`source::mqtt`]) or an in-process one
//! ([`source::memory`]).

pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod receiver;
pub mod sink;
pub mod source;
pub mod telemetry;
mod worker;

pub use config::{IngestConfig, ReceiverConfig};
pub use errors::{ConnectionError, ReceiverError, Result};
pub use lifecycle::{LifecycleComponent, LifecycleStatus, ProgressMonitor, TracingProgressMonitor};
pub use receiver::Receiver;
