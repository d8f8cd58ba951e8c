use thiserror::Error;

use crate::lifecycle::LifecycleStatus;

#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("No event source configured for receiver")]
    MissingEventSource,

    #[error("Receiver cannot be started while {status}")]
    InvalidState { status: LifecycleStatus },

    #[error("Unable to connect to MQTT broker at {broker} for topic {topic}")]
    Connection {
        broker: String,
        topic: String,
        #[source]
        source: ConnectionError,
    },

    #[error("Exception while attempting to subscribe to MQTT topic: {topic}")]
    Subscription {
        topic: String,
        #[source]
        source: ConnectionError,
    },
}

/// Failures reported by a broker transport.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Broker refused the connection: {reason}")]
    Refused { reason: String },

    #[error("Timed out after {timeout_ms}ms waiting for {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Broker rejected subscription to topic {topic}")]
    Rejected { topic: String },

    #[error("Connection closed")]
    Closed,

    #[error("Connection has already been shut down")]
    AlreadyClosed,

    #[error("Transport failure")]
    Transport {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T> = std::result::Result<T, ReceiverError>;

impl ConnectionError {
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ConnectionError::Transport {
            source: Box::new(err),
        }
    }

    pub fn timeout(operation: &str, timeout_ms: u64) -> Self {
        ConnectionError::Timeout {
            operation: operation.to_string(),
            timeout_ms,
        }
    }

    /// Teardown found the transport already gone. Benign during shutdown.
    pub fn is_already_closed(&self) -> bool {
        matches!(self, ConnectionError::AlreadyClosed)
    }

    /// The connection can no longer deliver messages.
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionError::Closed | ConnectionError::AlreadyClosed)
    }
}

impl ReceiverError {
    /// Whether the owning framework may retry `start` with the same config.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReceiverError::Connection { .. } => true,
            ReceiverError::Subscription { source, .. } => {
                !matches!(source, ConnectionError::Rejected { .. })
            }
            ReceiverError::Config(_) => false,
            ReceiverError::MissingEventSource => false,
            ReceiverError::InvalidState { .. } => false,
        }
    }
}
