use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, Transport};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use rumqttc::QoS;

use crate::error::StreamError;
use crate::identity_provider::BrokerKeys;
use crate::sigv4;

/// Reason code reported when the disconnect was requested locally
pub const REASON_REQUESTED: u8 = 0;
/// Reason code reported when the connection dropped on its own
pub const REASON_CONNECTION_LOST: u8 = 1;

const BROKER_PORT: u16 = 443;
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 64;
const POLLER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Publish/subscribe connection to the telemetry broker
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, keys: &BrokerKeys) -> Result<(), StreamError>;
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), StreamError>;
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), StreamError>;
    async fn disconnect(&self) -> Result<(), StreamError>;
}

/// Callbacks invoked from the broker's delivery context.
///
/// Both run synchronously on the delivery task and must not block.
pub trait BrokerEvents: Send + Sync {
    fn on_message(&self, topic: &str, payload: &[u8]);
    fn on_disconnect(&self, reason_code: u8);
}

/// MQTT over a SigV4-presigned websocket
pub struct MqttBroker {
    host: String,
    region: String,
    events: Arc<dyn BrokerEvents>,
    connection: Mutex<Option<Connection>>,
}

struct Connection {
    client: AsyncClient,
    poller: JoinHandle<()>,
    closing: Arc<AtomicBool>,
}

impl MqttBroker {
    pub fn new(host: impl Into<String>, region: impl Into<String>, events: Arc<dyn BrokerEvents>) -> Self {
        Self {
            host: host.into(),
            region: region.into(),
            events,
            connection: Mutex::new(None),
        }
    }

    fn client(&self) -> Result<AsyncClient, StreamError> {
        self.connection
            .lock()
            .as_ref()
            .map(|connection| connection.client.clone())
            .ok_or(StreamError::NotConnected)
    }

    /// Drives the event loop until the broker acknowledges the connection
    async fn await_connack(eventloop: &mut EventLoop) -> Result<(), StreamError> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return match ack.code {
                        ConnectReturnCode::Success => Ok(()),
                        code => Err(StreamError::Connect(format!("{code:?}"))),
                    };
                }
                Ok(_) => continue,
                Err(e) => return Err(StreamError::Connect(e.to_string())),
            }
        }
    }
}

/// Delivery loop: forwards publishes until the connection ends
async fn deliver(mut eventloop: EventLoop, events: Arc<dyn BrokerEvents>, closing: Arc<AtomicBool>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                events.on_message(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                events.on_disconnect(reason_code(&closing));
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let reason = reason_code(&closing);
                if reason != REASON_REQUESTED {
                    warn!(error = %e, "broker connection lost");
                }
                events.on_disconnect(reason);
                break;
            }
        }
    }
}

fn reason_code(closing: &AtomicBool) -> u8 {
    if closing.load(Ordering::SeqCst) {
        REASON_REQUESTED
    } else {
        REASON_CONNECTION_LOST
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn connect(&self, keys: &BrokerKeys) -> Result<(), StreamError> {
        let url = sigv4::presign_websocket_url(&self.host, &self.region, keys, chrono::Utc::now());
        let client_id = Uuid::new_v4().to_string();

        let mut options = MqttOptions::new(client_id.clone(), url, BROKER_PORT);
        options
            .set_transport(Transport::wss_with_default_config())
            .set_keep_alive(MQTT_KEEP_ALIVE)
            .set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self::await_connack(&mut eventloop).await?;
        info!(host = %self.host, client_id = %client_id, "connected to broker");

        let closing = Arc::new(AtomicBool::new(false));
        let poller = tokio::spawn(deliver(eventloop, self.events.clone(), closing.clone()));

        let previous = self.connection.lock().replace(Connection {
            client,
            poller,
            closing,
        });
        if let Some(stale) = previous {
            stale.closing.store(true, Ordering::SeqCst);
            stale.poller.abort();
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), StreamError> {
        self.client()?
            .subscribe(topic, qos)
            .await
            .map_err(|e| StreamError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), StreamError> {
        self.client()?
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| StreamError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<(), StreamError> {
        let Some(connection) = self.connection.lock().take() else {
            return Ok(());
        };
        connection.closing.store(true, Ordering::SeqCst);
        let result = connection
            .client
            .disconnect()
            .await
            .map_err(|e| StreamError::Disconnect(e.to_string()));

        let mut poller = connection.poller;
        if tokio::time::timeout(POLLER_DRAIN_TIMEOUT, &mut poller).await.is_err() {
            debug!("broker delivery task did not finish after disconnect, aborting");
            poller.abort();
        }
        result
    }
}
