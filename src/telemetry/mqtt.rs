use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use tracing::{debug, error, info, warn};

use super::{CommandPublisher, OutboundMessage};
use crate::config::{ConfigError, MqttConfig};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publisher is not configured: {0}")]
    Config(#[from] ConfigError),

    #[error("not connected to the MQTT broker")]
    Disconnected,

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to enqueue message: {0}")]
    Send(#[from] rumqttc::ClientError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerScheme {
    Mqtt,
    Ws,
}

/// Parsed `scheme://[user[:password]@]host:port` broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub scheme: BrokerScheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    path: String,
}

impl BrokerAddress {
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;
        let scheme = match url.scheme() {
            "mqtt" => BrokerScheme::Mqtt,
            "ws" => BrokerScheme::Ws,
            other => {
                return Err(ConfigError::UnsupportedScheme {
                    scheme: other.to_string(),
                    expected: "mqtt, ws",
                })
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();
        let port = match url.port() {
            Some(port) => port,
            // Url hides a port equal to the scheme default, e.g. ws://host:80
            None if has_explicit_port(uri) => url
                .port_or_known_default()
                .ok_or_else(|| invalid("missing port"))?,
            None => return Err(invalid("missing port")),
        };
        let username = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let password = url.password().map(str::to_string);

        Ok(Self {
            scheme,
            host,
            port,
            username,
            password,
            path: url.path().to_string(),
        })
    }

    fn options(&self, client_id: &str) -> MqttOptions {
        let mut options = match self.scheme {
            BrokerScheme::Mqtt => MqttOptions::new(client_id, &self.host, self.port),
            BrokerScheme::Ws => {
                // The websocket transport takes the full URL as the broker address
                let url = format!("ws://{}:{}{}", self.host, self.port, self.path);
                let mut options = MqttOptions::new(client_id, url, self.port);
                options.set_transport(Transport::Ws);
                options
            }
        };
        options.set_keep_alive(KEEP_ALIVE);
        if let Some(user) = &self.username {
            options.set_credentials(user, self.password.as_deref().unwrap_or_default());
        }
        options
    }
}

/// True when the authority part of `uri` ends in `:<digits>`.
fn has_explicit_port(uri: &str) -> bool {
    let rest = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    host_port
        .rsplit_once(':')
        .is_some_and(|(_, port)| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
}

struct Connection {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

/// Publishes outbound messages to `<prefix>/commands` with QoS 0.
pub struct MqttPublisher {
    topic: String,
    connection: Result<Connection, ConfigError>,
}

impl MqttPublisher {
    /// Must be called from within a tokio runtime when the broker is valid,
    /// since the event loop is spawned here.
    pub fn new(config: &MqttConfig) -> Self {
        let topic = config.commands_topic();
        let connection = config
            .broker
            .as_deref()
            .ok_or(ConfigError::Missing("MQTT broker"))
            .and_then(BrokerAddress::parse)
            .map(|address| {
                let client_id = format!("{}-{}", config.topic_prefix, std::process::id());
                info!(
                    "MQTT publisher connecting to {}:{} as {}",
                    address.host, address.port, client_id
                );
                let (client, eventloop) =
                    AsyncClient::new(address.options(&client_id), CHANNEL_CAPACITY);
                let connected = Arc::new(AtomicBool::new(false));
                tokio::spawn(drive_event_loop(eventloop, connected.clone()));
                Connection { client, connected }
            });

        if let Err(e) = &connection {
            error!("MQTT publisher disabled: {}", e);
        }

        Self { topic, connection }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

async fn drive_event_loop(mut eventloop: EventLoop, connected: Arc<AtomicBool>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker");
                connected.store(true, Ordering::Relaxed);
            }
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(e) => {
                if connected.swap(false, Ordering::Relaxed) {
                    warn!("MQTT connection lost: {}", e);
                } else {
                    debug!("MQTT connection attempt failed: {}", e);
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl CommandPublisher for MqttPublisher {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), PublishError> {
        let connection = self.connection.as_ref().map_err(|e| e.clone())?;
        if !connection.connected.load(Ordering::Relaxed) {
            return Err(PublishError::Disconnected);
        }

        let payload = message.to_payload()?;
        let len = payload.len();
        connection
            .client
            .try_publish(self.topic.as_str(), QoS::AtMostOnce, false, payload)?;
        debug!("Published {} bytes to {}", len, self.topic);
        Ok(())
    }
}
