//! Publishing readings to the message bus
//!
//! One MQTT session is kept for the life of the daemon. `connect` drives the
//! client's event loop by hand until the broker acknowledges the session,
//! then hands the loop to a background task that keeps it flushed and
//! reconnects after network hiccups. Payload shaping lives here as well.

use crate::config::MqttConfig;
use crate::miner::FirmwareVersion;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Requests buffered between the publisher and its event loop
const REQUEST_CAPACITY: usize = 64;

/// Message bus seam
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Make sure the bus is reachable before polling starts
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Publish one message
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Release the bus at shutdown
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

enum Session {
    /// Not connected yet; the event loop has never been polled
    Idle(EventLoop),
    /// Event loop owned by the background task
    Running(JoinHandle<()>),
    Closed,
}

/// Publisher over a persistent `rumqttc` session (QoS 0, not retained)
pub struct MqttPublisher {
    client: AsyncClient,
    broker: String,
    timeout: Duration,
    session: Mutex<Session>,
}

impl MqttPublisher {
    /// Build from the `mqtt` config section. Nothing touches the network
    /// until [`Publisher::connect`].
    pub fn new(config: &MqttConfig) -> Self {
        let mut options = MqttOptions::new(
            config.client_id.trim(),
            config.broker_address.clone(),
            config.broker_port,
        );
        options.set_keep_alive(config.keep_alive);
        if let Some((user, pass)) = config.credentials() {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self {
            client,
            broker: config.broker(),
            timeout: config.connect_timeout,
            session: Mutex::new(Session::Idle(eventloop)),
        }
    }

    async fn is_running(&self) -> bool {
        matches!(&*self.session.lock().await, Session::Running(task) if !task.is_finished())
    }
}

/// Poll until the broker accepts the session
async fn await_connack(eventloop: &mut EventLoop, broker: &str) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(Error::network(format!(
                    "MQTT broker {} refused the connection: {:?}",
                    broker, code
                )))
            }
            Err(e) => {
                return Err(Error::network(format!("MQTT broker {} unreachable: {}", broker, e)))
            }
        }
    }
}

/// Keep the session alive until our own DISCONNECT has gone out
async fn drive(mut eventloop: EventLoop, broker: String) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(Event::Incoming(Packet::ConnAck(_))) => info!("Reconnected to MQTT broker {}", broker),
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection to {} lost: {}", broker, e);
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
    debug!("MQTT event loop for {} finished", broker);
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let mut eventloop = match std::mem::replace(&mut *session, Session::Closed) {
            Session::Idle(eventloop) => eventloop,
            other => {
                *session = other;
                return Err(Error::publish("MQTT session already started"));
            }
        };

        let outcome = timeout(self.timeout, await_connack(&mut eventloop, &self.broker))
            .await
            .unwrap_or_else(|_| Err(Error::timeout(format!("connecting to MQTT broker {}", self.broker))));

        match outcome {
            Ok(()) => {
                *session = Session::Running(tokio::spawn(drive(eventloop, self.broker.clone())));
                info!("Connected to MQTT broker {}", self.broker);
                Ok(())
            }
            Err(e) => {
                *session = Session::Idle(eventloop);
                Err(e)
            }
        }
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        if !self.is_running().await {
            return Err(Error::publish(format!(
                "not connected to MQTT broker {}",
                self.broker
            )));
        }

        timeout(
            self.timeout,
            self.client
                .publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec()),
        )
        .await
        .map_err(|_| Error::timeout(format!("publishing to {}", topic)))?
        .map_err(|e| Error::publish(format!("{}: {}", topic, e)))?;

        debug!("Published {} bytes to {}", payload.len(), topic);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let Session::Running(mut task) = std::mem::replace(&mut *session, Session::Closed) else {
            return Ok(());
        };

        if let Err(e) = self.client.disconnect().await {
            task.abort();
            return Err(Error::publish(format!("disconnecting from {}: {}", self.broker, e)));
        }

        if timeout(self.timeout, &mut task).await.is_err() {
            warn!("MQTT broker {} did not take the disconnect in time", self.broker);
            task.abort();
        }
        info!("Disconnected from MQTT broker {}", self.broker);
        Ok(())
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        if let Session::Running(task) = self.session.get_mut() {
            task.abort();
        }
    }
}

/// Telemetry worth publishing: not `null` and not an empty object or array
pub fn is_publishable(payload: &Value) -> bool {
    match payload {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

/// Body published to `<topic>/version`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionPayload {
    pub raw: String,
    pub version: String,
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub observed_at: DateTime<Utc>,
}

impl VersionPayload {
    pub fn new(firmware: &FirmwareVersion, observed_at: DateTime<Utc>) -> Self {
        Self {
            raw: firmware.raw.clone(),
            version: firmware.version.to_string(),
            major: firmware.version.major,
            minor: firmware.version.minor,
            patch: firmware.version.patch,
            observed_at,
        }
    }
}
