pub mod channel;

use std::future::Future;

use crate::source::Metadata;

/// Identifies the receiver that forwarded a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverIdentity {
    pub display_name: String,
    pub topic: String,
}

/// The downstream pipeline stage fed by a receiver.
///
/// Decoding and enrichment of payloads happen behind this trait. It is called from the
/// receiver's worker task, one payload at a time and in receive order.
pub trait EventSource: Send + Sync + 'static {
    /// Identifier used when naming the receiver's worker.
    fn source_id(&self) -> &str;

    fn on_encoded_event_received(
        &self,
        receiver: &ReceiverIdentity,
        payload: Vec<u8>,
        metadata: Option<Metadata>,
    ) -> impl Future<Output = ()> + Send;
}
