use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::device_registry::{Device, Role};
use crate::energy_integrator::EnergyIntegrator;

/// Meter field carrying power flowing out of the metered point
pub const POWER_MINUS_FIELD: &str = "emeter:power_aminus";
/// Meter field carrying power flowing into the metered point
pub const POWER_PLUS_FIELD: &str = "emeter:power_aplus";

const NOTIFY_CAPACITY: usize = 64;

/// State variables of one real-time notification, keyed by field name
pub type StateVariables = serde_json::Map<String, serde_json::Value>;

/// Tracked instantaneous power signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Produced,
    Consumed,
    Injected,
    FromGrid,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Produced,
        Channel::Consumed,
        Channel::Injected,
        Channel::FromGrid,
    ];

    fn index(self) -> usize {
        match self {
            Channel::Produced => 0,
            Channel::Consumed => 1,
            Channel::Injected => 2,
            Channel::FromGrid => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Channel::Produced => "produced",
            Channel::Consumed => "consumed",
            Channel::Injected => "injected",
            Channel::FromGrid => "from_grid",
        }
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    instant: Option<f64>,
    integrator: EnergyIntegrator,
}

#[derive(Debug, Default)]
struct AggregatorState {
    channels: [ChannelState; 4],
    devices: Arc<Vec<Device>>,
    house_id: Option<String>,
    user_id: Option<String>,
}

impl AggregatorState {
    fn instant(&self, channel: Channel) -> Option<f64> {
        self.channels[channel.index()].instant
    }

    fn record(&mut self, channel: Channel, watts: f64, timestamp: f64) {
        let slot = &mut self.channels[channel.index()];
        slot.instant = Some(watts);
        if let Err(e) = slot.integrator.add_point(timestamp, watts) {
            warn!(channel = channel.name(), error = %e, "dropping out-of-order sample from energy total");
        }
    }

    /// Applies one message; returns whether any channel changed
    fn apply(&mut self, device: &Device, state_vars: &StateVariables, timestamp: f64) -> bool {
        let mut changed = false;
        match device.role {
            Role::Grid => {
                if let Some(watts) = field(state_vars, POWER_MINUS_FIELD) {
                    self.record(Channel::Injected, watts, timestamp);
                    changed = true;
                }
                if let Some(watts) = field(state_vars, POWER_PLUS_FIELD) {
                    self.record(Channel::FromGrid, watts, timestamp);
                    changed = true;
                }
            }
            Role::Production => {
                if let Some(watts) = field(state_vars, POWER_MINUS_FIELD) {
                    self.record(Channel::Produced, watts, timestamp);
                    changed = true;
                }
            }
            Role::Unconfigured => {}
        }

        if changed {
            if let (Some(produced), Some(from_grid), Some(injected)) = (
                self.instant(Channel::Produced),
                self.instant(Channel::FromGrid),
                self.instant(Channel::Injected),
            ) {
                self.record(Channel::Consumed, produced + from_grid - injected, timestamp);
            }
        }
        changed
    }

    fn snapshot(&self) -> TelemetrySnapshot {
        let instant = |channel: Channel| self.instant(channel);
        let energy = |channel: Channel| {
            let integrator = &self.channels[channel.index()].integrator;
            integrator.is_seeded().then(|| integrator.get_sum())
        };
        TelemetrySnapshot {
            instant_power_produced: instant(Channel::Produced),
            instant_power_consumed: instant(Channel::Consumed),
            instant_power_from_grid: instant(Channel::FromGrid),
            instant_power_injected: instant(Channel::Injected),
            energy_produced: energy(Channel::Produced),
            energy_consumed: energy(Channel::Consumed),
            energy_from_grid: energy(Channel::FromGrid),
            energy_injected: energy(Channel::Injected),
            available_device_ids: self.devices.iter().map(|d| d.local_id.clone()).collect(),
            house_id: self.house_id.clone(),
            user_id: self.user_id.clone(),
        }
    }
}

fn field(state_vars: &StateVariables, name: &str) -> Option<f64> {
    let value = state_vars.get(name)?;
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Point-in-time view of every channel; energy totals are in watt-seconds
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub instant_power_produced: Option<f64>,
    pub instant_power_consumed: Option<f64>,
    pub instant_power_from_grid: Option<f64>,
    pub instant_power_injected: Option<f64>,
    pub energy_produced: Option<f64>,
    pub energy_consumed: Option<f64>,
    pub energy_from_grid: Option<f64>,
    pub energy_injected: Option<f64>,
    pub available_device_ids: Vec<String>,
    pub house_id: Option<String>,
    pub user_id: Option<String>,
}

impl TelemetrySnapshot {
    pub fn instant(&self, channel: Channel) -> Option<f64> {
        match channel {
            Channel::Produced => self.instant_power_produced,
            Channel::Consumed => self.instant_power_consumed,
            Channel::Injected => self.instant_power_injected,
            Channel::FromGrid => self.instant_power_from_grid,
        }
    }

    pub fn energy(&self, channel: Channel) -> Option<f64> {
        match channel {
            Channel::Produced => self.energy_produced,
            Channel::Consumed => self.energy_consumed,
            Channel::Injected => self.energy_injected,
            Channel::FromGrid => self.energy_from_grid,
        }
    }

    /// Energy total in watt-hours, as displayed downstream
    pub fn energy_wh(&self, channel: Channel) -> Option<f64> {
        self.energy(channel).map(|ws| ws / 3600.0)
    }
}

/// Thread-safe store of channel values, energy totals and session identity.
///
/// One lock guards all channel state; every `ingest` is a single critical
/// section, and observers are signalled only after it is released.
pub struct TelemetryAggregator {
    state: Mutex<AggregatorState>,
    notifier: broadcast::Sender<()>,
}

impl Default for TelemetryAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryAggregator {
    pub fn new() -> Self {
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            state: Mutex::new(AggregatorState::default()),
            notifier,
        }
    }

    /// Registers an observer; it receives one `()` per state-changing ingest
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notifier.subscribe()
    }

    /// Applies one decoded message from `device` and returns whether it
    /// changed any channel.
    pub fn ingest(&self, device: &Device, state_vars: &StateVariables, timestamp: f64) -> bool {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.apply(device, state_vars, timestamp);
            if changed {
                debug!(
                    produced = ?state.instant(Channel::Produced),
                    from_grid = ?state.instant(Channel::FromGrid),
                    consumed = ?state.instant(Channel::Consumed),
                    "channels updated"
                );
            }
            changed
        };

        if changed {
            // Only fails when nobody is listening
            let _ = self.notifier.send(());
        }
        changed
    }

    pub fn get_values(&self) -> TelemetrySnapshot {
        self.state.lock().snapshot()
    }

    /// Swaps in the device set of a completed discovery cycle
    pub fn replace_devices(&self, house_id: String, devices: Vec<Device>) {
        let mut state = self.state.lock();
        state.house_id = Some(house_id);
        state.devices = Arc::new(devices);
    }

    pub fn set_user_id(&self, user_id: String) {
        self.state.lock().user_id = Some(user_id);
    }

    pub fn devices(&self) -> Arc<Vec<Device>> {
        self.state.lock().devices.clone()
    }

    /// First known device whose local id appears in `topic`
    pub fn device_for_topic(&self, topic: &str) -> Option<Device> {
        self.devices()
            .iter()
            .find(|device| topic.contains(device.local_id.as_str()))
            .cloned()
    }

    /// Clears one channel's energy total back to its unseeded state
    pub fn reset_energy(&self, channel: Channel) {
        self.state.lock().channels[channel.index()].integrator.reset();
    }
}
