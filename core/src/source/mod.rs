pub mod memory;
pub mod mqtt;

use std::collections::HashMap;
use std::future::Future;

use crate::config::ReceiverConfig;
use crate::errors::ConnectionError;

/// Optional key/value metadata travelling with a payload.
pub type Metadata = HashMap<String, String>;

/// Delivery guarantee requested for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// An opaque handle used to acknowledge a message to the broker.
/// For MQTT this is the packet id of the PUBLISH together with its QoS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckHandle {
    pub packet_id: u16,
    pub qos: Qos,
}

/// A message pulled from the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// raw payload of message, never decoded here
    pub payload: Vec<u8>,
    /// Topic the message was published on.
    pub topic: String,
    pub metadata: Option<Metadata>,
    /// Must be passed to [`Connection::acknowledge`] before the broker treats the
    /// message as consumed.
    pub handle: AckHandle,
}

/// Opens connections to a broker.
pub trait Connector: Send + Sync {
    type Connection: Connection;

    /// Connects to the broker described by `config`, returning once the broker
    /// accepted the session.
    fn connect(
        &self,
        config: &ReceiverConfig,
    ) -> impl Future<Output = Result<Self::Connection, ConnectionError>> + Send;
}

/// A live broker connection.
///
/// Only one task may call [`Connection::receive`] at a time. Teardown methods may be
/// called from another task while a receive is pending and must make it return.
pub trait Connection: Send + Sync + 'static {
    /// Subscribes to `topic`, returning once the broker confirmed the subscription.
    fn subscribe(
        &self,
        topic: &str,
        qos: Qos,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Waits for the next message. Returns [`ConnectionError::Closed`] once terminated.
    fn receive(&self) -> impl Future<Output = Result<InboundMessage, ConnectionError>> + Send;

    fn acknowledge(
        &self,
        handle: &AckHandle,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Graceful disconnect. [`ConnectionError::AlreadyClosed`] if the transport is already down.
    fn disconnect(&self) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Forcibly releases the transport and unblocks any pending receive.
    /// [`ConnectionError::AlreadyClosed`] if it was already terminated.
    fn terminate(&self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}
