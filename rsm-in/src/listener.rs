//! Broker subscription loop
//!
//! Messages are handled one at a time inside the event-loop task, so store
//! writes from this process never overlap.

use rsm_common::broker::{
    client_id, flush_disconnect, mqtt_options, wait_for_connack, Backoff, REQUEST_CAPACITY,
};
use rsm_common::config::Config;
use rsm_common::{Error, Result};
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS, SubscribeReasonCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handler::IngestHandler;

/// What the loop should do with one event-loop event
#[derive(Debug, PartialEq)]
pub enum Action {
    /// New session: subscriptions must be re-established
    Resubscribe,
    Deliver(Vec<u8>),
    SubscribeRejected,
    Ignore,
}

/// Map an event-loop event to a loop action
pub fn action_for(event: Event, topic: &str) -> Action {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => Action::Resubscribe,
        Event::Incoming(Packet::Publish(publish)) if publish.topic == topic => {
            Action::Deliver(publish.payload.to_vec())
        }
        Event::Incoming(Packet::Publish(publish)) => {
            debug!("Ignoring message on unexpected topic {}", publish.topic);
            Action::Ignore
        }
        Event::Incoming(Packet::SubAck(ack))
            if ack
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure)) =>
        {
            Action::SubscribeRejected
        }
        _ => Action::Ignore,
    }
}

pub struct Listener {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
}

impl Listener {
    /// Connect, wait for CONNACK and subscribe
    pub async fn connect(config: &Config) -> Result<Self> {
        let id = client_id("rsm-in");
        let (client, mut eventloop) =
            AsyncClient::new(mqtt_options(config, &id), REQUEST_CAPACITY);

        info!(
            "Connecting to broker {}:{} as {}",
            config.broker.host, config.broker.port, id
        );
        wait_for_connack(&mut eventloop, config.broker.connect_timeout()).await?;

        let listener = Self {
            client,
            eventloop,
            topic: config.topic(),
        };
        listener.subscribe().await?;
        Ok(listener)
    }

    async fn subscribe(&self) -> Result<()> {
        self.client
            .subscribe(self.topic.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| Error::Transport(format!("subscribe request rejected: {}", e)))?;
        info!("Subscribed to {}", self.topic);
        Ok(())
    }

    /// Handle messages until `shutdown` fires, then disconnect
    pub async fn run(mut self, handler: &IngestHandler, shutdown: CancellationToken) {
        let mut backoff = Backoff::default();

        loop {
            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                polled = self.eventloop.poll() => polled,
            };

            match polled {
                Ok(event) => match action_for(event, &self.topic) {
                    Action::Resubscribe => {
                        info!("Reconnected to broker");
                        backoff.reset();
                        if let Err(e) = self.subscribe().await {
                            warn!("{}", e);
                        }
                    }
                    Action::Deliver(body) => {
                        handler.handle(&body).await;
                    }
                    Action::SubscribeRejected => {
                        error!("Broker refused subscription to {}", self.topic);
                    }
                    Action::Ignore => {}
                },
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("Broker connection error: {} (retrying in {:?})", e, delay);
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!("Listener stopping");
        match self.client.try_disconnect() {
            Ok(()) => flush_disconnect(&mut self.eventloop).await,
            Err(e) => warn!("Failed to request broker disconnect: {}", e),
        }
    }
}
