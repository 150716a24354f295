use std::collections::BTreeSet;
use std::sync::Arc;

use serde_derive::Deserialize;
use serde_json::json;
use tokio::sync::mpsc::Sender;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerEvents, QoS, REASON_REQUESTED};
use crate::device_registry::Device;
use crate::error::StreamError;
use crate::identity_provider::BrokerKeys;
use crate::session_coordinator::WorkerCommand;
use crate::telemetry_aggregator::{StateVariables, TelemetryAggregator};

pub const REALTIME_TOPIC: &str = "fromDev/realtime";
pub const MODULE_CHANGED_TOPIC: &str = "fromDev/module/changed";
pub const REALTIME_REQUEST_TOPIC: &str = "toDev/realtime";

const SUBSCRIBED_TOPICS: [&str; 2] = [REALTIME_TOPIC, MODULE_CHANGED_TOPIC];
const SUBSCRIPTION_LEVELS: [QoS; 2] = [QoS::AtLeastOnce, QoS::AtMostOnce];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Recovering,
}

/// What one upkeep cycle ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpkeepOutcome {
    KeptAlive,
    Refreshed,
    Recovered,
}

/// Owns one broker connection and its liveness bookkeeping.
///
/// Mutated only by the session worker, so it carries no locks.
pub struct StreamingClient {
    broker: Arc<dyn Broker>,
    state: StreamState,
    keys: Option<BrokerKeys>,
    devices: Vec<Device>,
    subscriptions: BTreeSet<String>,
    refresh_counter: u32,
    refresh_period: u32,
    realtime_timeout_secs: u64,
    /// When the current connection attempt started
    opened_at: Option<Instant>,
}

impl StreamingClient {
    pub fn new(broker: Arc<dyn Broker>, refresh_period: u32, realtime_timeout_secs: u64) -> Self {
        Self {
            broker,
            state: StreamState::Disconnected,
            keys: None,
            devices: Vec::new(),
            subscriptions: BTreeSet::new(),
            refresh_counter: 0,
            refresh_period: refresh_period.max(1),
            realtime_timeout_secs,
            opened_at: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn refresh_counter(&self) -> u32 {
        self.refresh_counter
    }

    pub fn subscriptions(&self) -> &BTreeSet<String> {
        &self.subscriptions
    }

    /// Connects with `keys` and remembers them for later reconnects
    pub async fn connect(&mut self, keys: BrokerKeys) -> Result<(), StreamError> {
        self.keys = Some(keys);
        self.open().await
    }

    /// Replaces the keys used by the next reconnect; the live connection is kept
    pub fn update_credentials(&mut self, keys: BrokerKeys) {
        self.keys = Some(keys);
    }

    /// Subscribes every device's real-time and module-change topics at both
    /// quality levels
    pub async fn subscribe(&mut self, devices: &[Device]) -> Result<(), StreamError> {
        self.devices = devices.to_vec();
        self.subscribe_all().await
    }

    /// One upkeep cycle: periodic forced refresh, then a real-time request
    /// per device. Any failure triggers an immediate recovery.
    pub async fn upkeep(&mut self) -> Result<UpkeepOutcome, StreamError> {
        match self.run_upkeep_cycle().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(error = %e, "upkeep cycle failed, recovering broker session");
                self.recover().await?;
                Ok(UpkeepOutcome::Recovered)
            }
        }
    }

    /// Reacts to the broker's disconnect callback.
    ///
    /// Requested disconnects are ignored, as are losses reported before the
    /// live connection was opened. Anything else gets exactly one reconnect
    /// with the last-known keys before the error is surfaced.
    pub async fn handle_disconnect(
        &mut self,
        reason_code: u8,
        reported_at: Instant,
    ) -> Result<(), StreamError> {
        if reason_code == REASON_REQUESTED {
            return Ok(());
        }
        let superseded = self
            .opened_at
            .is_some_and(|opened_at| reported_at < opened_at);
        if self.state == StreamState::Subscribed && superseded {
            debug!(reason_code, "disconnect predates the current connection, ignoring");
            return Ok(());
        }
        warn!(reason_code, "unexpected broker disconnect, reconnecting");
        self.state = StreamState::Disconnected;
        self.subscriptions.clear();
        self.open().await?;
        self.subscribe_all().await
    }

    pub async fn shutdown(&mut self) -> Result<(), StreamError> {
        self.state = StreamState::Disconnected;
        self.subscriptions.clear();
        self.broker.disconnect().await
    }

    async fn run_upkeep_cycle(&mut self) -> Result<UpkeepOutcome, StreamError> {
        self.refresh_counter += 1;
        let mut outcome = UpkeepOutcome::KeptAlive;
        if self.refresh_counter >= self.refresh_period {
            info!(cycles = self.refresh_counter, "periodic broker session refresh");
            self.refresh_counter = 0;
            self.cycle_connection().await?;
            outcome = UpkeepOutcome::Refreshed;
        }
        self.request_realtime().await?;
        Ok(outcome)
    }

    /// disconnect -> reconnect -> re-subscribe -> re-publish
    async fn recover(&mut self) -> Result<(), StreamError> {
        let result = match self.cycle_connection().await {
            Ok(()) => self.request_realtime().await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!(error = %e, "broker recovery failed, retrying on next upkeep");
            self.state = StreamState::Disconnected;
        }
        result
    }

    async fn cycle_connection(&mut self) -> Result<(), StreamError> {
        self.state = StreamState::Recovering;
        if let Err(e) = self.broker.disconnect().await {
            debug!(error = %e, "ignoring disconnect failure during recovery");
        }
        self.subscriptions.clear();
        self.open().await?;
        self.subscribe_all().await
    }

    async fn open(&mut self) -> Result<(), StreamError> {
        let keys = self.keys.as_ref().ok_or(StreamError::NoCredential)?;
        self.state = StreamState::Connecting;
        // Taken before connecting so losses of this connection never look stale
        self.opened_at = Some(Instant::now());
        match self.broker.connect(keys).await {
            Ok(()) => {
                self.state = StreamState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = StreamState::Disconnected;
                Err(e)
            }
        }
    }

    async fn subscribe_all(&mut self) -> Result<(), StreamError> {
        if matches!(self.state, StreamState::Disconnected | StreamState::Connecting) {
            return Err(StreamError::NotConnected);
        }
        for device in &self.devices {
            for suffix in SUBSCRIBED_TOPICS {
                let topic = format!("{}/{suffix}", device.topic_prefix());
                for qos in SUBSCRIPTION_LEVELS {
                    self.broker.subscribe(&topic, qos).await?;
                }
                self.subscriptions.insert(topic);
            }
        }
        self.state = StreamState::Subscribed;
        debug!(topics = self.subscriptions.len(), "subscribed to device topics");
        Ok(())
    }

    /// Asks every device to keep streaming real-time data
    async fn request_realtime(&mut self) -> Result<(), StreamError> {
        for device in &self.devices {
            let topic = format!("{}/{REALTIME_REQUEST_TOPIC}", device.topic_prefix());
            let request = json!({
                "id": Uuid::new_v4().to_string(),
                "operationType": "realtime",
                "messageType": "request",
                "data": {"timeout": self.realtime_timeout_secs},
            });
            self.broker
                .publish(&topic, request.to_string().into_bytes(), QoS::AtLeastOnce)
                .await?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RealtimeNotification {
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RealtimeData {
    #[serde(rename = "stateVariables", default)]
    state_variables: StateVariables,
}

/// State variables of the first entry of a real-time notification.
///
/// Later entries are not inspected. Anything else, including malformed
/// payloads, yields `None`.
pub fn decode_realtime(topic: &str, payload: &[u8]) -> Option<StateVariables> {
    if !topic.ends_with(&format!("/{REALTIME_TOPIC}")) {
        return None;
    }
    let notification: RealtimeNotification = serde_json::from_slice(payload).ok()?;
    let first = notification.data.into_iter().next()?;
    serde_json::from_value::<RealtimeData>(first)
        .ok()
        .map(|data| data.state_variables)
}

fn arrival_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Broker callbacks: routes messages into the aggregator and turns
/// unexpected disconnects into worker commands
pub struct MessageRouter {
    aggregator: Arc<TelemetryAggregator>,
    commands: Sender<WorkerCommand>,
}

impl MessageRouter {
    pub fn new(aggregator: Arc<TelemetryAggregator>, commands: Sender<WorkerCommand>) -> Self {
        Self {
            aggregator,
            commands,
        }
    }
}

impl BrokerEvents for MessageRouter {
    fn on_message(&self, topic: &str, payload: &[u8]) {
        let Some(state_vars) = decode_realtime(topic, payload) else {
            return;
        };
        let Some(device) = self.aggregator.device_for_topic(topic) else {
            return;
        };
        self.aggregator
            .ingest(&device, &state_vars, arrival_timestamp());
    }

    fn on_disconnect(&self, reason_code: u8) {
        if reason_code == REASON_REQUESTED {
            return;
        }
        let command = WorkerCommand::Reconnect {
            reason_code,
            reported_at: Instant::now(),
        };
        if let Err(e) = self.commands.try_send(command) {
            warn!(error = %e, "could not hand reconnect to session worker");
        }
    }
}
