use std::collections::HashMap;

use crate::directory::{DeviceRecord, ModuleRecord};

const PRODUCTION_METER_GROUP: &str = "PRODUCTION_METER";
const CONSUMPTION_METER_GROUP: &str = "CONSUMPTION_METER";

/// Functional role of a metering device, fixed at classification time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Production,
    Grid,
    Unconfigured,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub local_id: String,
    pub remote_id: String,
    pub wire_type: String,
    pub role: Role,
    pub connectivity_status: Option<String>,
    pub serial_number: Option<String>,
}

impl Device {
    /// Topic prefix the broker uses for this device: `{wire_type}/{local_id}`
    pub fn topic_prefix(&self) -> String {
        format!("{}/{}", self.wire_type, self.local_id)
    }
}

/// Classifies directory devices by the groups of their matching module.
///
/// Output order follows `devices`. A device without a module record is kept
/// as [`Role::Unconfigured`] with no connectivity or serial information.
pub fn classify(devices: &[DeviceRecord], modules: &[ModuleRecord]) -> Vec<Device> {
    let module_map: HashMap<&str, &ModuleRecord> = modules
        .iter()
        .map(|module| (module.device_id.as_str(), module))
        .collect();

    devices
        .iter()
        .map(|record| {
            let module = module_map.get(record.device_id.as_str()).copied();
            Device {
                local_id: record.device_local_id.clone(),
                remote_id: record.device_id.clone(),
                wire_type: record.device_type.clone(),
                role: module.map_or(Role::Unconfigured, role_for_module),
                connectivity_status: module.and_then(|m| m.connectivity_state.clone()),
                serial_number: module.and_then(|m| m.serial_number.clone()),
            }
        })
        .collect()
}

fn role_for_module(module: &ModuleRecord) -> Role {
    let has_group = |tag: &str| module.groups.iter().any(|group| group == tag);
    if has_group(PRODUCTION_METER_GROUP) {
        Role::Production
    } else if has_group(CONSUMPTION_METER_GROUP) {
        Role::Grid
    } else {
        Role::Unconfigured
    }
}
