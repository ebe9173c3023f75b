//! MQTT broker connection helpers
//!
//! Both the publisher and the subscriber use `rumqttc`. The client only makes
//! progress while its event loop is polled, so each service owns the loop and
//! uses these helpers for the connection lifecycle.

use rumqttc::{ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::{Error, Result};

/// Capacity of the request channel between client handle and event loop
pub const REQUEST_CAPACITY: usize = 16;

/// Upper bound on the DISCONNECT flush at shutdown
pub const DISCONNECT_FLUSH: Duration = Duration::from_secs(5);

/// Unique client id for one process instance
pub fn client_id(service: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", service, &suffix[..8])
}

/// Connection options from configuration
pub fn mqtt_options(config: &Config, client_id: &str) -> MqttOptions {
    let broker = &config.broker;
    let mut options = MqttOptions::new(client_id, broker.host.clone(), broker.port);
    options.set_keep_alive(broker.keep_alive());
    options.set_max_packet_size(broker.max_packet_bytes, broker.max_packet_bytes);
    match &broker.password {
        Some(password) => {
            options.set_credentials(config.broker_username(), password.clone());
        }
        None => {
            debug!("No broker password configured; connecting without credentials");
        }
    }
    options
}

/// Poll until the broker accepts the connection
///
/// Used at startup: a broker that cannot be reached within `timeout` is an
/// unrecoverable configuration problem for the calling process.
pub async fn wait_for_connack(eventloop: &mut EventLoop, timeout: Duration) -> Result<()> {
    let outcome = tokio::time::timeout(timeout, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(Error::Transport(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )))
                    };
                }
                Ok(_) => continue,
                Err(e) => return Err(Error::Transport(format!("broker unreachable: {}", e))),
            }
        }
    })
    .await;

    match outcome {
        Ok(result) => result,
        Err(_) => Err(Error::Transport(format!(
            "no CONNACK within {:?}",
            timeout
        ))),
    }
}

/// Drive the event loop until the DISCONNECT packet has gone out
pub async fn flush_disconnect(eventloop: &mut EventLoop) {
    let flushed = tokio::time::timeout(DISCONNECT_FLUSH, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Event loop closed during disconnect: {}", e);
                    break;
                }
            }
        }
    })
    .await;

    match flushed {
        Ok(()) => info!("Disconnected from broker"),
        Err(_) => warn!("Broker disconnect not confirmed within {:?}", DISCONNECT_FLUSH),
    }
}

/// Capped exponential delay between reconnect attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Call after a successful (re)connection
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
