//! Snapshot output

use cw_core::Device;
use cw_sensor::SensorReading;
use serde_json::{json, Value};
use tracing::info;

/// One JSON object per device
pub fn device_json(device: &dyn Device) -> Value {
    let identity = device.identity();
    let capability = device.capability();
    json!({
        "name": identity.name,
        "family": identity.family,
        "location": identity.location,
        "firmware": identity.firmware,
        "capability": { "rank": capability.rank, "label": capability.label },
        "status": device.status(),
        "snapshot": device.snapshot(),
    })
}

fn format_reading(reading: &SensorReading) -> Option<String> {
    if !reading.is_supported() {
        return None;
    }
    let value = match reading.value {
        Some(v) => format!("{:.1} {}", v, reading.kind.unit()),
        None => "-".to_string(),
    };
    Some(format!("{} {}: {}", reading.name, reading.kind, value))
}

/// Human-readable summary line of a device
pub fn device_line(device: &dyn Device) -> String {
    let readings: Vec<String> = device
        .snapshot()
        .readings()
        .iter()
        .filter_map(format_reading)
        .collect();
    format!("[{}] {}", device.capability(), readings.join(", "))
}

pub fn emit(devices: &[Box<dyn Device>], as_json: bool) {
    for device in devices {
        if as_json {
            println!("{}", device_json(device.as_ref()));
        } else {
            info!(device = %device.name(), location = %device.identity().location, "{}", device_line(device.as_ref()));
        }
    }
}
