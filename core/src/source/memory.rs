//! In-process broker.
//!
//! Behaves like a single MQTT broker living inside the process: connections subscribe
//! with topic filters, published messages are routed to every matching subscription and
//! must be acknowledged through their handle. Faults can be injected to exercise the
//! receiver's error paths without a network.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::config::ReceiverConfig;
use crate::errors::ConnectionError;
use crate::lifecycle::signalled;
use crate::source::{AckHandle, Connection, Connector, InboundMessage, Metadata, Qos};

enum Delivery {
    Message(InboundMessage),
    Fault(String),
}

struct Subscription {
    connection_id: u64,
    filter: String,
    qos: Qos,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BrokerState {
    refuse_reason: Option<String>,
    stall_subscriptions: bool,
    reject_subscriptions: bool,
    disconnect_failure: Option<String>,
    stall_disconnects: bool,
    next_connection_id: u64,
    next_packet_id: u16,
    open: HashSet<u64>,
    closers: Vec<(u64, Arc<watch::Sender<bool>>)>,
    subscriptions: Vec<Subscription>,
    acknowledged: Vec<u16>,
}

impl BrokerState {
    fn packet_id(&mut self) -> u16 {
        // packet id 0 is reserved
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        self.next_packet_id
    }

    fn release(&mut self, connection_id: u64) {
        self.open.remove(&connection_id);
        self.closers.retain(|(id, _)| *id != connection_id);
        self.subscriptions
            .retain(|sub| sub.connection_id != connection_id);
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refuses every following connection attempt with `reason`.
    pub fn refuse_connections(&self, reason: &str) {
        self.lock().refuse_reason = Some(reason.to_string());
    }

    pub fn accept_connections(&self) {
        self.lock().refuse_reason = None;
    }

    /// Subscription requests are never confirmed.
    pub fn stall_subscriptions(&self) {
        self.lock().stall_subscriptions = true;
    }

    /// Subscription requests are answered with a failure return code.
    pub fn reject_subscriptions(&self) {
        self.lock().reject_subscriptions = true;
    }

    /// Disconnect requests fail with a transport error carrying `reason`.
    pub fn fail_disconnects(&self, reason: &str) {
        self.lock().disconnect_failure = Some(reason.to_string());
    }

    /// Disconnect requests never complete.
    pub fn stall_disconnects(&self) {
        self.lock().stall_disconnects = true;
    }

    /// Routes a message to every matching subscription. Returns the number of deliveries.
    pub fn publish(&self, topic: &str, payload: &[u8], metadata: Option<Metadata>) -> usize {
        let mut state = self.lock();
        let mut delivered = 0;
        let targets: Vec<(Qos, mpsc::UnboundedSender<Delivery>)> = state
            .subscriptions
            .iter()
            .filter(|sub| topic_matches(&sub.filter, topic))
            .map(|sub| (sub.qos, sub.sender.clone()))
            .collect();

        for (qos, sender) in targets {
            let message = InboundMessage {
                payload: payload.to_vec(),
                topic: topic.to_string(),
                metadata: metadata.clone(),
                handle: AckHandle {
                    packet_id: state.packet_id(),
                    qos,
                },
            };
            if sender.send(Delivery::Message(message)).is_ok() {
                delivered += 1;
            }
        }
        debug!("Published to {} on {} subscription(s)", topic, delivered);
        delivered
    }

    /// Makes the next receive of every subscription matching `topic` fail with `reason`.
    pub fn inject_receive_error(&self, topic: &str, reason: &str) -> usize {
        let state = self.lock();
        state
            .subscriptions
            .iter()
            .filter(|sub| topic_matches(&sub.filter, topic))
            .filter(|sub| sub.sender.send(Delivery::Fault(reason.to_string())).is_ok())
            .count()
    }

    /// Drops every connection from the broker side, as a network failure would.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        for (_, closer) in state.closers.drain(..) {
            closer.send_replace(true);
        }
        state.open.clear();
        state.subscriptions.clear();
    }

    /// Connections opened and not yet terminated.
    pub fn open_connections(&self) -> usize {
        self.lock().open.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Packet ids acknowledged so far, in acknowledgement order.
    pub fn acknowledged(&self) -> Vec<u16> {
        self.lock().acknowledged.clone()
    }
}

impl Connector for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self, config: &ReceiverConfig) -> Result<MemoryConnection, ConnectionError> {
        let mut state = self.lock();
        if let Some(reason) = &state.refuse_reason {
            return Err(ConnectionError::Refused {
                reason: reason.clone(),
            });
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        let (sender, inbox) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        state.open.insert(id);
        state.closers.push((id, closed.clone()));
        debug!("Memory broker accepted connection {} for {}", id, config.broker_info());

        Ok(MemoryConnection {
            id,
            broker: self.clone(),
            sender,
            inbox: tokio::sync::Mutex::new(inbox),
            closed,
            disconnected: AtomicBool::new(false),
        })
    }
}

pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    sender: mpsc::UnboundedSender<Delivery>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    closed: Arc<watch::Sender<bool>>,
    disconnected: AtomicBool,
}

impl MemoryConnection {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl Connection for MemoryConnection {
    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let (stall, reject) = {
            let state = self.broker.lock();
            (state.stall_subscriptions, state.reject_subscriptions)
        };
        if stall {
            std::future::pending::<()>().await;
        }
        if reject {
            return Err(ConnectionError::Rejected {
                topic: topic.to_string(),
            });
        }

        self.broker.lock().subscriptions.push(Subscription {
            connection_id: self.id,
            filter: topic.to_string(),
            qos,
            sender: self.sender.clone(),
        });
        Ok(())
    }

    async fn receive(&self) -> Result<InboundMessage, ConnectionError> {
        let mut closed = self.closed.subscribe();
        let mut inbox = self.inbox.lock().await;
        tokio::select! {
            biased;
            _ = signalled(&mut closed) => Err(ConnectionError::Closed),
            delivery = inbox.recv() => match delivery {
                Some(Delivery::Message(message)) => Ok(message),
                Some(Delivery::Fault(reason)) => {
                    Err(ConnectionError::transport(std::io::Error::other(reason)))
                }
                None => Err(ConnectionError::Closed),
            },
        }
    }

    async fn acknowledge(&self, handle: &AckHandle) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        if handle.qos != Qos::AtMostOnce {
            self.broker.lock().acknowledged.push(handle.packet_id);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        if self.is_closed() || self.disconnected.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyClosed);
        }
        let (failure, stall) = {
            let state = self.broker.lock();
            (state.disconnect_failure.clone(), state.stall_disconnects)
        };
        if let Some(reason) = failure {
            return Err(ConnectionError::transport(std::io::Error::other(reason)));
        }
        if stall {
            std::future::pending::<()>().await;
        }

        let id = self.id;
        self.broker
            .lock()
            .subscriptions
            .retain(|sub| sub.connection_id != id);
        Ok(())
    }

    async fn terminate(&self) -> Result<(), ConnectionError> {
        if self.closed.send_replace(true) {
            return Err(ConnectionError::AlreadyClosed);
        }
        self.broker.lock().release(self.id);
        Ok(())
    }
}

/// MQTT topic filter matching with `+` (one level) and `#` (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
