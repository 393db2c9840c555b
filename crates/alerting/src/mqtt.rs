//! MQTT Sink
//!
//! Publishes alert text to `<topic_prefix>/<channel>` on an MQTT broker at
//! QoS 0. The delivery credential is used as the broker password. A lost
//! connection is not re-established; later sends fail.

use crate::error::DeliveryError;
use crate::sink::{DeliverySink, Destination};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Packet, QoS,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// How long to wait for the broker's CONNACK
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// MQTT broker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttSettings {
    /// Broker host name
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Client identifier
    pub client_id: String,
    /// User name; the credential token is sent as password when set
    pub username: Option<String>,
    /// Topic prefix, the channel name is appended
    pub topic_prefix: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "threshold-alert".to_string(),
            username: None,
            topic_prefix: "alerts".to_string(),
        }
    }
}

impl MqttSettings {
    /// Topic for a destination
    pub fn topic_for(&self, destination: &Destination) -> String {
        format!("{}/{}", self.topic_prefix.trim_end_matches('/'), destination.name())
    }
}

/// Publishes alerts to an MQTT broker
pub struct MqttSink {
    settings: MqttSettings,
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

impl MqttSink {
    /// Connect and wait for the broker to accept the session
    pub async fn connect(settings: MqttSettings, token: &str) -> Result<Self, DeliveryError> {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(username) = &settings.username {
            if token.trim().is_empty() {
                return Err(DeliveryError::MissingCredential);
            }
            options.set_credentials(username.clone(), token.trim());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 10);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return if ack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(DeliveryError::Unauthorized(format!("{:?}", ack.code)))
                        };
                    }
                    Ok(_) => {}
                    Err(ConnectionError::ConnectionRefused(code)) => {
                        return Err(DeliveryError::Unauthorized(format!("{:?}", code)));
                    }
                    Err(e) => return Err(DeliveryError::Transport(e.to_string())),
                }
            }
        };
        tokio::time::timeout(CONNECT_TIMEOUT, handshake)
            .await
            .map_err(|_| DeliveryError::Transport("timed out waiting for CONNACK".to_string()))??;

        // Service the connection until the first error
        let event_loop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(incoming)) => {
                        debug!("MQTT incoming: {:?}", incoming);
                    }
                    Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        error!("MQTT connection lost, alerts can no longer be published: {}", e);
                        break;
                    }
                }
            }
        });

        info!("Connected to MQTT broker: {}:{}", settings.host, settings.port);
        Ok(Self {
            settings,
            client,
            event_loop,
        })
    }
}

#[async_trait]
impl DeliverySink for MqttSink {
    async fn send(&self, destination: &Destination, text: &str) -> Result<(), DeliveryError> {
        let topic = self.settings.topic_for(destination);
        // Fails fast when the request buffer is full or the event loop has stopped
        self.client
            .try_publish(&topic, QoS::AtMostOnce, false, text.as_bytes().to_vec())
            .map_err(|e| DeliveryError::Publish(e.to_string()))?;
        debug!(topic = %topic, "Alert published");
        Ok(())
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}
