//! Sensor snapshot types
//!
//! A snapshot is declared once when a device is constructed and then refreshed
//! in place by every `update()`. Sensors the device cannot provide at its
//! capability level are declared [`Availability::Unsupported`]; writes to them
//! are refused so their absence is structural rather than a poll outcome.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Physical quantity a sensor reports
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Temperature,
    Voltage,
    Fan,
    Power,
    Load,
    Control,
    /// Frequency, stored in MHz. GPU backends convert from the SDK's kHz or
    /// 10 kHz units when decoding.
    Clock,
    Flow,
}

impl SensorKind {
    /// Display unit for values of this kind
    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "°C",
            SensorKind::Voltage => "V",
            SensorKind::Fan => "RPM",
            SensorKind::Power => "W",
            SensorKind::Load | SensorKind::Control => "%",
            SensorKind::Clock => "MHz",
            SensorKind::Flow => "L/h",
        }
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SensorKind::Temperature => "Temperature",
            SensorKind::Voltage => "Voltage",
            SensorKind::Fan => "Fan",
            SensorKind::Power => "Power",
            SensorKind::Load => "Load",
            SensorKind::Control => "Control",
            SensorKind::Clock => "Clock",
            SensorKind::Flow => "Flow",
        };
        write!(f, "{}", name)
    }
}

/// Whether a sensor can ever carry a value on this device
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Supported,
    /// Not provided at the negotiated capability level; always "no value"
    Unsupported,
}

/// Confidence in a sensor's scaling
///
/// Some decoders carry scalings that were never checked against real
/// hardware. They are still reported, but tagged so consumers can tell.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Accuracy {
    Verified,
    Unverified,
}

/// Handle to a declared sensor inside a [`SensorSnapshot`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SensorId(usize);

/// A single reading
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SensorReading {
    /// Display name (e.g., "Pump", "Liquid", "GPU Core")
    pub name: String,
    /// What the value measures
    pub kind: SensorKind,
    /// Channel index within its kind
    pub index: u32,
    /// Latest value, `None` when absent or not refreshed by the last cycle
    pub value: Option<f32>,
    pub availability: Availability,
    pub accuracy: Accuracy,
}

impl SensorReading {
    pub fn is_supported(&self) -> bool {
        self.availability == Availability::Supported
    }
}

/// All readings of one device
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct SensorSnapshot {
    readings: Vec<SensorReading>,
    /// Milliseconds since the Unix epoch of the last completed refresh
    pub updated_ms: Option<u64>,
    /// Number of completed update cycles
    pub cycles: u64,
}

impl SensorSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a supported sensor
    pub fn declare(&mut self, name: impl Into<String>, kind: SensorKind, index: u32) -> SensorId {
        self.push(name.into(), kind, index, Availability::Supported, Accuracy::Verified)
    }

    /// Declare a supported sensor whose scaling has not been confirmed
    pub fn declare_unverified(
        &mut self,
        name: impl Into<String>,
        kind: SensorKind,
        index: u32,
    ) -> SensorId {
        self.push(name.into(), kind, index, Availability::Supported, Accuracy::Unverified)
    }

    /// Declare a sensor that is permanently absent at this capability level
    pub fn declare_absent(&mut self, name: impl Into<String>, kind: SensorKind, index: u32) -> SensorId {
        self.push(name.into(), kind, index, Availability::Unsupported, Accuracy::Verified)
    }

    /// Declare a sensor supported or absent depending on `supported`
    pub fn declare_if(
        &mut self,
        supported: bool,
        name: impl Into<String>,
        kind: SensorKind,
        index: u32,
    ) -> SensorId {
        if supported {
            self.declare(name, kind, index)
        } else {
            self.declare_absent(name, kind, index)
        }
    }

    fn push(
        &mut self,
        name: String,
        kind: SensorKind,
        index: u32,
        availability: Availability,
        accuracy: Accuracy,
    ) -> SensorId {
        self.readings.push(SensorReading {
            name,
            kind,
            index,
            value: None,
            availability,
            accuracy,
        });
        SensorId(self.readings.len() - 1)
    }

    /// Store a value. Writes to unsupported sensors are dropped.
    pub fn set(&mut self, id: SensorId, value: Option<f32>) {
        let Some(reading) = self.readings.get_mut(id.0) else {
            return;
        };
        if reading.availability == Availability::Unsupported {
            if value.is_some() {
                trace!(sensor = %reading.name, "Ignoring value for unsupported sensor");
            }
            return;
        }
        reading.value = value.filter(|v| v.is_finite());
    }

    /// Blank every reading (failed cycle)
    pub fn clear_values(&mut self) {
        for reading in &mut self.readings {
            reading.value = None;
        }
    }

    /// Mark a refresh cycle as complete
    pub fn mark_updated(&mut self) {
        self.cycles += 1;
        self.updated_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_millis() as u64);
    }

    pub fn value(&self, id: SensorId) -> Option<f32> {
        self.readings.get(id.0).and_then(|r| r.value)
    }

    pub fn reading(&self, id: SensorId) -> Option<&SensorReading> {
        self.readings.get(id.0)
    }

    /// Find a reading by kind and channel index
    pub fn get(&self, kind: SensorKind, index: u32) -> Option<&SensorReading> {
        self.readings
            .iter()
            .find(|r| r.kind == kind && r.index == index)
    }

    /// Find a reading by display name
    pub fn find(&self, name: &str) -> Option<&SensorReading> {
        self.readings.iter().find(|r| r.name == name)
    }

    pub fn readings(&self) -> &[SensorReading] {
        &self.readings
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units() {
        assert_eq!(SensorKind::Clock.unit(), "MHz");
        assert_eq!(SensorKind::Fan.unit(), "RPM");
        assert_eq!(SensorKind::Temperature.unit(), "°C");
    }

    #[test]
    fn test_absent_sensor_rejects_values() {
        let mut snapshot = SensorSnapshot::new();
        let core = snapshot.declare("GPU Core", SensorKind::Clock, 0);
        let boost = snapshot.declare_absent("GPU Core Boost", SensorKind::Clock, 2);

        for cycle in 0..5 {
            snapshot.set(core, Some(1500.0 + cycle as f32));
            snapshot.set(boost, Some(1900.0));
            snapshot.mark_updated();
            assert_eq!(snapshot.value(boost), None);
        }

        assert_eq!(snapshot.value(core), Some(1504.0));
        assert_eq!(snapshot.cycles, 5);
        assert!(!snapshot.reading(boost).map(|r| r.is_supported()).unwrap_or(true));
    }

    #[test]
    fn test_non_finite_values_become_none() {
        let mut snapshot = SensorSnapshot::new();
        let temp = snapshot.declare("Liquid", SensorKind::Temperature, 0);
        snapshot.set(temp, Some(f32::NAN));
        assert_eq!(snapshot.value(temp), None);
    }

    #[test]
    fn test_clear_values_keeps_declarations() {
        let mut snapshot = SensorSnapshot::new();
        let pump = snapshot.declare("Pump", SensorKind::Fan, 0);
        let flow = snapshot.declare_unverified("Flow 1", SensorKind::Flow, 0);
        snapshot.set(pump, Some(2100.0));
        snapshot.set(flow, Some(90.0));
        snapshot.clear_values();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.value(pump), None);
        assert_eq!(snapshot.find("Flow 1").map(|r| r.accuracy), Some(Accuracy::Unverified));
        assert_eq!(snapshot.get(SensorKind::Fan, 0).map(|r| r.name.as_str()), Some("Pump"));
    }

    #[test]
    fn test_snapshot_serializes_null_for_missing_values() {
        let mut snapshot = SensorSnapshot::new();
        snapshot.declare("Liquid", SensorKind::Temperature, 0);
        let json = serde_json::to_string(&snapshot).expect("snapshot should serialize");
        assert!(json.contains("\"value\":null"));
        assert!(json.contains("\"kind\":\"temperature\""));
    }
}
