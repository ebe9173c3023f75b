//! Acknowledged publishing to the broker
//!
//! `rumqttc` only reports acknowledgements through its event loop, so the
//! loop runs in a driver task and forwards the packet ids it sees. A publish
//! is complete when the PUBACK for the packet id assigned to it arrives.
//!
//! Payloads dropped by earlier ticks stay in the client queue and are sent
//! (or sent again after a reconnect) later; `AckTracker` keeps those from
//! completing the current publish.

use async_trait::async_trait;
use rsm_common::broker::{
    client_id, mqtt_options, wait_for_connack, Backoff, DISCONNECT_FLUSH, REQUEST_CAPACITY,
};
use rsm_common::config::Config;
use rsm_common::{Error, Result};
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Broker publishing collaborator
#[async_trait]
pub trait Transport: Send {
    /// Publish one message and wait for the broker's acknowledgement
    ///
    /// Bounded in time: a broker that is down fails the call, it never
    /// blocks the caller until the connection returns.
    async fn publish(&mut self, payload: Vec<u8>) -> Result<()>;

    /// Disconnect cleanly, bounded in time
    async fn shutdown(&mut self);
}

/// Delivery events forwarded from the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckEvent {
    /// PUBLISH written to the socket with this packet id
    Sent(u16),
    /// PUBACK received for this packet id
    Acked(u16),
    ConnectionLost(String),
}

/// Matches forwarded events to the newest request handed to the client
#[derive(Debug, Default)]
pub struct AckTracker {
    /// Requests handed to the client whose first PUBLISH has not gone out
    queued: usize,
    /// Packet ids sent and not yet acknowledged
    unacked: HashSet<u16>,
}

impl AckTracker {
    /// Count a request the client accepted
    pub fn enqueued(&mut self) {
        self.queued += 1;
    }

    /// Requests still waiting in the client queue
    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Record a PUBLISH; true when it is the first send of the newest request
    ///
    /// Requests leave the client queue in order, so the newest one is the
    /// last of the queued ones to be sent. A packet id that is already
    /// unacknowledged is a retransmission.
    fn sent(&mut self, pkid: u16) -> bool {
        if !self.unacked.insert(pkid) {
            debug!("Packet {} sent again after reconnect", pkid);
            return false;
        }
        match self.queued {
            0 => false,
            1 => {
                self.queued = 0;
                true
            }
            _ => {
                self.queued -= 1;
                false
            }
        }
    }

    fn acked(&mut self, pkid: u16) {
        self.unacked.remove(&pkid);
    }

    /// Apply events left over from earlier ticks
    pub fn absorb(&mut self, events: &mut mpsc::UnboundedReceiver<AckEvent>) {
        while let Ok(stale) = events.try_recv() {
            debug!("Stale broker event {:?}", stale);
            match stale {
                AckEvent::Sent(pkid) => {
                    self.sent(pkid);
                }
                AckEvent::Acked(pkid) => self.acked(pkid),
                AckEvent::ConnectionLost(_) => {}
            }
        }
    }

    /// Wait for the PUBACK of the newest request
    ///
    /// Returns the acknowledged packet id.
    pub async fn await_ack(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<AckEvent>,
        timeout: Duration,
    ) -> Result<u16> {
        let wait = async {
            let mut ours = None;
            while let Some(event) = events.recv().await {
                match event {
                    AckEvent::Sent(pkid) => {
                        if self.sent(pkid) {
                            ours = Some(pkid);
                        }
                    }
                    AckEvent::Acked(pkid) => {
                        self.acked(pkid);
                        if ours == Some(pkid) {
                            return Ok(pkid);
                        }
                        debug!("Ignoring PUBACK for packet {}", pkid);
                    }
                    AckEvent::ConnectionLost(reason) => {
                        return Err(Error::Transport(format!(
                            "connection lost before PUBACK: {}",
                            reason
                        )))
                    }
                }
            }
            Err(Error::Transport("broker event loop stopped".to_string()))
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Transport(format!("no PUBACK within {:?}", timeout)))?
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    topic: String,
    ack_timeout: Duration,
    events: mpsc::UnboundedReceiver<AckEvent>,
    tracker: AckTracker,
    driver: Option<JoinHandle<()>>,
}

impl MqttTransport {
    /// Connect and wait for CONNACK
    ///
    /// Fails if the broker does not accept the connection within the
    /// configured connect timeout; callers treat that as fatal at startup.
    pub async fn connect(config: &Config) -> Result<Self> {
        let id = client_id("rsm-ep");
        let options = mqtt_options(config, &id);
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        info!(
            "Connecting to broker {}:{} as {}",
            config.broker.host, config.broker.port, id
        );
        wait_for_connack(&mut eventloop, config.broker.connect_timeout()).await?;
        info!("Broker connection established");

        Ok(Self::start(
            client,
            eventloop,
            config.topic(),
            config.broker.ack_timeout(),
        ))
    }

    /// Spawn the driver for an event loop
    fn start(client: AsyncClient, eventloop: EventLoop, topic: String, ack_timeout: Duration) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(eventloop, tx));

        Self {
            client,
            topic,
            ack_timeout,
            events,
            tracker: AckTracker::default(),
            driver: Some(driver),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&mut self, payload: Vec<u8>) -> Result<()> {
        self.tracker.absorb(&mut self.events);

        // The client queue does not drain while the broker is unreachable
        self.client
            .try_publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .map_err(|_| {
                Error::Transport(format!(
                    "client queue full ({} requests waiting for the broker)",
                    self.tracker.queued()
                ))
            })?;
        self.tracker.enqueued();

        let pkid = self
            .tracker
            .await_ack(&mut self.events, self.ack_timeout)
            .await?;
        debug!("PUBACK received for packet {}", pkid);
        Ok(())
    }

    async fn shutdown(&mut self) {
        let Some(mut driver) = self.driver.take() else {
            return;
        };

        if let Err(e) = self.client.try_disconnect() {
            warn!("Failed to request broker disconnect: {}", e);
            driver.abort();
            return;
        }

        match tokio::time::timeout(DISCONNECT_FLUSH, &mut driver).await {
            Ok(_) => info!("Disconnected from broker"),
            Err(_) => {
                warn!("Broker disconnect not confirmed within {:?}", DISCONNECT_FLUSH);
                driver.abort();
            }
        }
    }
}

/// Poll the event loop until DISCONNECT goes out
///
/// Connection errors are reported and retried with backoff; rumqttc
/// reconnects on the next poll.
async fn drive(mut eventloop: EventLoop, events: mpsc::UnboundedSender<AckEvent>) {
    let mut backoff = Backoff::default();
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let _ = events.send(AckEvent::Sent(pkid));
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let _ = events.send(AckEvent::Acked(ack.pkid));
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Reconnected to broker");
                backoff.reset();
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent; stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let delay = backoff.next_delay();
                warn!("Broker connection error: {} (retrying in {:?})", e, delay);
                let _ = events.send(AckEvent::ConnectionLost(e.to_string()));
                tokio::time::sleep(delay).await;
            }
        }
    }
}
