use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS,
    SubscribeReasonCode, Transport,
};
use tokio::sync::{Mutex, watch};
use tracing::debug;

use crate::config::ReceiverConfig;
use crate::errors::ConnectionError;
use crate::lifecycle::signalled;
use crate::source::{AckHandle, Connection, Connector, InboundMessage, Metadata, Qos};

/// Metadata key carrying the topic a message was published on.
pub const TOPIC_METADATA_KEY: &str = "topic";

const REQUEST_CAPACITY: usize = 16;

static CLIENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
            Qos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

impl From<QoS> for Qos {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => Qos::AtMostOnce,
            QoS::AtLeastOnce => Qos::AtLeastOnce,
            QoS::ExactlyOnce => Qos::ExactlyOnce,
        }
    }
}

/// Builds client options for `config`. Acknowledgements are always manual.
pub fn mqtt_options(config: &ReceiverConfig) -> MqttOptions {
    let client_id = config.client_id.clone().unwrap_or_else(|| {
        format!(
            "receiver-{}-{}",
            std::process::id(),
            CLIENT_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1
        )
    });

    let mut options = MqttOptions::new(client_id, config.hostname.clone(), config.port);
    options
        .set_keep_alive(Duration::from_secs(config.keep_alive_secs))
        .set_clean_session(config.clean_session)
        .set_manual_acks(true);

    if let Some(username) = &config.username {
        let password = config.password.clone().unwrap_or_default();
        options.set_credentials(username.clone(), password);
    }
    if config.uses_tls() {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

struct EventState {
    eventloop: EventLoop,
    /// Publishes that arrived while waiting for an acknowledgement packet.
    pending: VecDeque<Publish>,
    subscription: Option<(String, QoS)>,
}

impl EventState {
    async fn next_packet(&mut self) -> Result<Packet, ConnectionError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(packet)) => return Ok(packet),
                Ok(Event::Outgoing(_)) => continue,
                Err(rumqttc::ConnectionError::ConnectionRefused(code)) => {
                    return Err(ConnectionError::Refused {
                        reason: format!("{:?}", code),
                    });
                }
                Err(e) => return Err(ConnectionError::transport(e)),
            }
        }
    }
}

/// Connects to an MQTT broker with `rumqttc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttConnector;

impl Connector for MqttConnector {
    type Connection = MqttConnection;

    async fn connect(&self, config: &ReceiverConfig) -> Result<MqttConnection, ConnectionError> {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);
        let mut events = EventState {
            eventloop,
            pending: VecDeque::new(),
            subscription: None,
        };

        loop {
            match events.next_packet().await? {
                Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => break,
                Packet::ConnAck(ack) => {
                    return Err(ConnectionError::Refused {
                        reason: format!("{:?}", ack.code),
                    });
                }
                other => debug!("Ignoring {:?} before CONNACK", other),
            }
        }

        let (closed, _) = watch::channel(false);
        Ok(MqttConnection {
            client,
            events: Mutex::new(Some(events)),
            closed,
        })
    }
}

/// A session with an MQTT broker.
///
/// The event loop is driven by whichever call currently holds it: `subscribe` while
/// waiting for the SUBACK, then the worker's `receive`, and finally `disconnect`.
/// `acknowledge` takes it over when the request queue is full, which happens while
/// a backlog buffered during subscription is handed out.
pub struct MqttConnection {
    client: AsyncClient,
    events: Mutex<Option<EventState>>,
    closed: watch::Sender<bool>,
}

impl Connection for MqttConnection {
    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), ConnectionError> {
        let mut guard = self.events.lock().await;
        let events = guard.as_mut().ok_or(ConnectionError::Closed)?;
        self.client
            .subscribe(topic, qos.into())
            .await
            .map_err(ConnectionError::transport)?;

        loop {
            match events.next_packet().await? {
                Packet::SubAck(ack) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        return Err(ConnectionError::Rejected {
                            topic: topic.to_string(),
                        });
                    }
                    events.subscription = Some((topic.to_string(), qos.into()));
                    return Ok(());
                }
                Packet::Publish(publish) => events.pending.push_back(publish),
                other => debug!("Ignoring {:?} while waiting for SUBACK", other),
            }
        }
    }

    async fn receive(&self) -> Result<InboundMessage, ConnectionError> {
        let mut closed = self.closed.subscribe();
        let mut guard = tokio::select! {
            biased;
            _ = signalled(&mut closed) => return Err(ConnectionError::Closed),
            guard = self.events.lock() => guard,
        };
        let events = guard.as_mut().ok_or(ConnectionError::Closed)?;
        if let Some(publish) = events.pending.pop_front() {
            return Ok(inbound(publish));
        }

        loop {
            let packet = tokio::select! {
                biased;
                _ = signalled(&mut closed) => return Err(ConnectionError::Closed),
                packet = events.next_packet() => packet?,
            };
            if let Some(publish) = self.absorb(events, packet)? {
                return Ok(inbound(publish));
            }
        }
    }

    async fn acknowledge(&self, handle: &AckHandle) -> Result<(), ConnectionError> {
        if *self.closed.borrow() {
            return Err(ConnectionError::Closed);
        }
        // only the packet id and QoS are needed to build the PUBACK
        let mut publish = Publish::new("", handle.qos.into(), Vec::<u8>::new());
        publish.pkid = handle.packet_id;
        if self.client.try_ack(&publish).is_ok() {
            return Ok(());
        }

        // the request queue is full: drive the event loop until the PUBACK fits
        let mut guard = self.events.lock().await;
        let events = guard.as_mut().ok_or(ConnectionError::Closed)?;
        let ack = self.client.ack(&publish);
        tokio::pin!(ack);
        loop {
            let packet = tokio::select! {
                biased;
                sent = &mut ack => return sent.map_err(ConnectionError::transport),
                packet = events.next_packet() => packet?,
            };
            if let Some(publish) = self.absorb(events, packet)? {
                events.pending.push_back(publish);
            }
        }
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        if *self.closed.borrow() {
            return Err(ConnectionError::AlreadyClosed);
        }
        let mut guard = self.events.lock().await;
        let events = guard.as_mut().ok_or(ConnectionError::AlreadyClosed)?;
        self.client
            .try_disconnect()
            .map_err(ConnectionError::transport)?;

        // drive the event loop until the DISCONNECT is on the wire
        loop {
            match events.eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                Ok(_) => continue,
                Err(e) => {
                    debug!("Connection ended before DISCONNECT was sent: {}", e);
                    return Err(ConnectionError::AlreadyClosed);
                }
            }
        }
    }

    async fn terminate(&self) -> Result<(), ConnectionError> {
        if self.closed.send_replace(true) {
            return Err(ConnectionError::AlreadyClosed);
        }
        // a pending receive has been woken and releases the lock
        let events = self.events.lock().await.take();
        drop(events);
        Ok(())
    }
}

impl MqttConnection {
    /// Handles a control packet and hands back publishes.
    fn absorb(
        &self,
        events: &EventState,
        packet: Packet,
    ) -> Result<Option<Publish>, ConnectionError> {
        match packet {
            Packet::Publish(publish) => return Ok(Some(publish)),
            // the event loop reconnected without a persistent session
            Packet::ConnAck(ack) if !ack.session_present => {
                if let Some((topic, qos)) = &events.subscription {
                    debug!("Reconnected to broker, resubscribing to {}", topic);
                    self.client
                        .try_subscribe(topic.clone(), *qos)
                        .map_err(ConnectionError::transport)?;
                }
            }
            _ => {}
        }
        Ok(None)
    }
}

fn inbound(publish: Publish) -> InboundMessage {
    let metadata = Metadata::from([(TOPIC_METADATA_KEY.to_string(), publish.topic.clone())]);
    InboundMessage {
        payload: publish.payload.to_vec(),
        topic: publish.topic,
        metadata: Some(metadata),
        handle: AckHandle {
            packet_id: publish.pkid,
            qos: publish.qos.into(),
        },
    }
}
