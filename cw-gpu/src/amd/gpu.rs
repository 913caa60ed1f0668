//! Negotiated AMD GPU device

use std::sync::Arc;

use cw_error::CoolwatchError;
use cw_sensor::{
    negotiate, CapabilityLevel, Device, DeviceFamily, DeviceIdentity, DeviceStatus, Negotiated,
    SensorId, SensorKind, SensorSnapshot,
};
use tracing::{debug, trace, warn};

use super::{AdapterInfo, AdlApi, AdlResult, FanSpeedUnit, OdnTemperature};
use crate::constants::amd::{pmlog, OD6_POWER_SHIFT, OD_CLOCK_DIVISOR};
use crate::constants::MILLIDEGREE_DIVISOR;

/// Overdrive generation fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AmdCapability {
    /// Legacy; chosen when no newer generation answered
    Overdrive5,
    Overdrive6,
    OverdriveN,
    Overdrive8,
}

impl AmdCapability {
    const NEGOTIATION_ORDER: [AmdCapability; 3] = [
        AmdCapability::Overdrive8,
        AmdCapability::OverdriveN,
        AmdCapability::Overdrive6,
    ];

    pub fn level(&self) -> CapabilityLevel {
        match self {
            AmdCapability::Overdrive8 => CapabilityLevel::new(3, "Overdrive8"),
            AmdCapability::OverdriveN => CapabilityLevel::new(2, "OverdriveN"),
            AmdCapability::Overdrive6 => CapabilityLevel::new(1, "Overdrive6"),
            AmdCapability::Overdrive5 => CapabilityLevel::new(0, "Overdrive5"),
        }
    }

    fn has_hotspot_and_memory_temp(&self) -> bool {
        matches!(self, AmdCapability::Overdrive8 | AmdCapability::OverdriveN)
    }

    fn has_fan_percent(&self) -> bool {
        *self != AmdCapability::OverdriveN
    }

    fn has_power(&self) -> bool {
        matches!(self, AmdCapability::Overdrive8 | AmdCapability::Overdrive6)
    }

    fn has_voltage(&self) -> bool {
        *self != AmdCapability::Overdrive6
    }
}

struct Sensors {
    core_temp: SensorId,
    hotspot_temp: SensorId,
    memory_temp: SensorId,
    fan_rpm: SensorId,
    fan_percent: SensorId,
    core_clock: SensorId,
    memory_clock: SensorId,
    core_load: SensorId,
    power: SensorId,
    core_voltage: SensorId,
}

/// Values gathered in one update pass
#[derive(Debug, Default)]
struct Readout {
    core_temp: Option<f32>,
    hotspot_temp: Option<f32>,
    memory_temp: Option<f32>,
    fan_rpm: Option<f32>,
    fan_percent: Option<f32>,
    core_clock: Option<f32>,
    memory_clock: Option<f32>,
    core_load: Option<f32>,
    power: Option<f32>,
    core_voltage: Option<f32>,
}

fn millidegrees(v: i32) -> f32 {
    v as f32 / MILLIDEGREE_DIVISOR
}

/// Overdrive clocks come in 10 kHz units; snapshots hold MHz
fn od_clock(v: i32) -> Option<f32> {
    (v > 0).then(|| v as f32 / OD_CLOCK_DIVISOR)
}

fn millivolts(v: i32) -> Option<f32> {
    (v > 0).then(|| v as f32 / 1000.0)
}

/// One physical AMD GPU
pub struct AmdGpu {
    api: Option<Arc<dyn AdlApi>>,
    adapter: i32,
    pub(super) identity: DeviceIdentity,
    capability: AmdCapability,
    snapshot: SensorSnapshot,
    sensors: Sensors,
    status: DeviceStatus,
}

impl AmdGpu {
    pub fn new(api: Arc<dyn AdlApi>, info: AdapterInfo) -> Self {
        let name = if info.name.trim().is_empty() {
            "AMD GPU".to_string()
        } else {
            info.name.trim().to_string()
        };
        let adapter = info.index;

        let negotiated = negotiate(&name, &AmdCapability::NEGOTIATION_ORDER, |generation| {
            match generation {
                AmdCapability::Overdrive8 => api
                    .od8_pmlog(adapter)
                    .map(|log| log.supported_count())
                    .map_err(|s| CoolwatchError::sdk("ADL2_New_QueryPMLogData_Get", s.0)),
                AmdCapability::OverdriveN => api
                    .odn_performance_status(adapter)
                    .map(|status| status.nonzero_count())
                    .map_err(|s| CoolwatchError::sdk("ADL2_OverdriveN_PerformanceStatus_Get", s.0)),
                AmdCapability::Overdrive6 => api
                    .od6_capabilities(adapter)
                    .map(|caps| caps.count_ones() as usize)
                    .map_err(|s| CoolwatchError::sdk("ADL_Overdrive6_Capabilities_Get", s.0)),
                AmdCapability::Overdrive5 => Ok(0),
            }
        });
        let capability = match negotiated {
            Negotiated::Generation(generation) => generation,
            Negotiated::Legacy => AmdCapability::Overdrive5,
        };

        let mut snapshot = SensorSnapshot::new();
        let extended_temps = capability.has_hotspot_and_memory_temp();
        let sensors = Sensors {
            core_temp: snapshot.declare("GPU Core", SensorKind::Temperature, 0),
            hotspot_temp: snapshot.declare_if(extended_temps, "GPU Hot Spot", SensorKind::Temperature, 1),
            memory_temp: snapshot.declare_if(extended_temps, "GPU Memory", SensorKind::Temperature, 2),
            fan_rpm: snapshot.declare("GPU", SensorKind::Fan, 0),
            fan_percent: snapshot.declare_if(
                capability.has_fan_percent(),
                "GPU Fan",
                SensorKind::Control,
                0,
            ),
            core_clock: snapshot.declare("GPU Core", SensorKind::Clock, 0),
            memory_clock: snapshot.declare("GPU Memory", SensorKind::Clock, 1),
            core_load: snapshot.declare("GPU Core", SensorKind::Load, 0),
            power: snapshot.declare_if(capability.has_power(), "GPU Power", SensorKind::Power, 0),
            core_voltage: snapshot.declare_if(
                capability.has_voltage(),
                "GPU Core",
                SensorKind::Voltage,
                0,
            ),
        };

        Self {
            api: Some(api),
            adapter,
            identity: DeviceIdentity {
                name,
                family: DeviceFamily::AmdGpu,
                location: format!("adl:{}:{}:{}", info.bus, info.device, adapter),
                firmware: None,
            },
            capability,
            snapshot,
            sensors,
            status: DeviceStatus::Active,
        }
    }

    /// The negotiated Overdrive generation
    pub fn capability_kind(&self) -> AmdCapability {
        self.capability
    }

    fn take<T>(&mut self, call: &'static str, result: AdlResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(status) => {
                trace!(gpu = %self.identity.name, "{} failed: {}", call, status);
                if status.is_device_lost() && self.status == DeviceStatus::Active {
                    warn!(gpu = %self.identity.name, "Adapter no longer present ({})", status);
                    self.status = DeviceStatus::Disconnected;
                }
                None
            }
        }
    }

    fn read_overdrive8(&mut self, api: &dyn AdlApi) -> Readout {
        let result = api.od8_pmlog(self.adapter);
        let Some(log) = self.take("ADL2_New_QueryPMLogData_Get", result) else {
            return Readout::default();
        };
        let value = |slot: usize| log.get(slot).map(|v| v as f32);
        Readout {
            core_temp: value(pmlog::TEMPERATURE_EDGE),
            hotspot_temp: value(pmlog::TEMPERATURE_HOTSPOT),
            memory_temp: value(pmlog::TEMPERATURE_MEM),
            fan_rpm: value(pmlog::FAN_RPM),
            fan_percent: value(pmlog::FAN_PERCENTAGE),
            core_clock: value(pmlog::CLK_GFXCLK),
            memory_clock: value(pmlog::CLK_MEMCLK),
            core_load: value(pmlog::INFO_ACTIVITY_GFX),
            power: value(pmlog::ASIC_POWER),
            core_voltage: log
                .get(pmlog::GFX_VOLTAGE)
                .or_else(|| log.get(pmlog::SOC_VOLTAGE))
                .and_then(millivolts),
        }
    }

    fn read_overdrive_n(&mut self, api: &dyn AdlApi) -> Readout {
        let mut readout = Readout::default();
        let adapter = self.adapter;

        let result = api.odn_performance_status(adapter);
        if let Some(status) = self.take("ADL2_OverdriveN_PerformanceStatus_Get", result) {
            readout.core_clock = od_clock(status.core_clock);
            readout.memory_clock = od_clock(status.memory_clock);
            readout.core_load = Some(status.gpu_activity_percent as f32);
            readout.core_voltage = millivolts(status.vddc_mv);
        }

        for (sensor, slot) in [
            (OdnTemperature::Core, &mut readout.core_temp),
            (OdnTemperature::Junction, &mut readout.hotspot_temp),
            (OdnTemperature::Memory, &mut readout.memory_temp),
        ] {
            let result = api.odn_temperature(adapter, sensor);
            *slot = self
                .take("ADL2_OverdriveN_Temperature_Get", result)
                .map(millidegrees);
        }

        let result = api.odn_fan_rpm(adapter);
        readout.fan_rpm = self
            .take("ADL2_OverdriveN_FanControl_Get", result)
            .map(|rpm| rpm as f32);
        readout
    }

    /// Temperature and fan calls shared by Overdrive5 and Overdrive6
    fn read_od5_cooling(&mut self, api: &dyn AdlApi, readout: &mut Readout) {
        let adapter = self.adapter;
        let result = api.od5_temperature(adapter);
        readout.core_temp = self
            .take("ADL_Overdrive5_Temperature_Get", result)
            .map(millidegrees);

        let result = api.od5_fan_speed(adapter, FanSpeedUnit::Rpm);
        readout.fan_rpm = self
            .take("ADL_Overdrive5_FanSpeed_Get", result)
            .map(|rpm| rpm as f32);
        let result = api.od5_fan_speed(adapter, FanSpeedUnit::Percent);
        readout.fan_percent = self
            .take("ADL_Overdrive5_FanSpeed_Get", result)
            .map(|pct| pct.clamp(0, 100) as f32);
    }

    fn read_overdrive6(&mut self, api: &dyn AdlApi) -> Readout {
        let mut readout = Readout::default();
        self.read_od5_cooling(api, &mut readout);

        let result = api.od6_current_status(self.adapter);
        if let Some(status) = self.take("ADL_Overdrive6_CurrentStatus_Get", result) {
            readout.core_clock = od_clock(status.engine_clock);
            readout.memory_clock = od_clock(status.memory_clock);
            readout.core_load = Some(status.activity_percent as f32);
        }

        let result = api.od6_current_power(self.adapter);
        readout.power = self
            .take("ADL_Overdrive6_CurrentPower_Get", result)
            .map(|fixed| (fixed >> OD6_POWER_SHIFT) as f32);
        readout
    }

    fn read_overdrive5(&mut self, api: &dyn AdlApi) -> Readout {
        let mut readout = Readout::default();
        self.read_od5_cooling(api, &mut readout);

        let result = api.od5_activity(self.adapter);
        if let Some(activity) = self.take("ADL_Overdrive5_CurrentActivity_Get", result) {
            readout.core_clock = od_clock(activity.engine_clock);
            readout.memory_clock = od_clock(activity.memory_clock);
            readout.core_load = Some(activity.activity_percent as f32);
            readout.core_voltage = millivolts(activity.vddc_mv);
        }
        readout
    }

    fn apply(&mut self, readout: Readout) {
        let s = &self.sensors;
        let pairs = [
            (s.core_temp, readout.core_temp),
            (s.hotspot_temp, readout.hotspot_temp),
            (s.memory_temp, readout.memory_temp),
            (s.fan_rpm, readout.fan_rpm),
            (s.fan_percent, readout.fan_percent),
            (s.core_clock, readout.core_clock),
            (s.memory_clock, readout.memory_clock),
            (s.core_load, readout.core_load),
            (s.power, readout.power),
            (s.core_voltage, readout.core_voltage),
        ];
        for (id, value) in pairs {
            self.snapshot.set(id, value);
        }
    }
}

impl Device for AmdGpu {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn capability(&self) -> CapabilityLevel {
        self.capability.level()
    }

    fn snapshot(&self) -> &SensorSnapshot {
        &self.snapshot
    }

    fn update(&mut self) {
        if self.status != DeviceStatus::Active {
            return;
        }
        let Some(api) = self.api.clone() else {
            return;
        };

        let readout = match self.capability {
            AmdCapability::Overdrive8 => self.read_overdrive8(api.as_ref()),
            AmdCapability::OverdriveN => self.read_overdrive_n(api.as_ref()),
            AmdCapability::Overdrive6 => self.read_overdrive6(api.as_ref()),
            AmdCapability::Overdrive5 => self.read_overdrive5(api.as_ref()),
        };

        if self.status == DeviceStatus::Active {
            self.apply(readout);
            self.snapshot.mark_updated();
        } else {
            self.snapshot.clear_values();
        }
    }

    fn close(&mut self) {
        if self.api.take().is_some() {
            debug!(gpu = %self.identity.name, "Released ADL adapter");
        }
        self.status = DeviceStatus::Closed;
    }

    fn status(&self) -> DeviceStatus {
        self.status
    }
}
