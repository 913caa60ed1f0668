//! Negotiated NVIDIA GPU device

use std::sync::Arc;

use cw_error::CoolwatchError;
use cw_sensor::{
    negotiate, CapabilityLevel, Device, DeviceFamily, DeviceIdentity, DeviceStatus, Negotiated,
    SensorId, SensorKind, SensorSnapshot,
};
use tracing::{debug, trace, warn};

use super::{ClockGeneration, ClockType, NvApi, NvResult, PhysicalGpu, ThermalTarget};
use crate::constants::nvidia::{domain, legacy, LEGACY_CLOCK_COUNT};
use crate::constants::{KHZ_PER_MHZ, MILLIWATTS_PER_WATT};

/// Clock query path fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvidiaCapability {
    Clocks(ClockGeneration),
    /// No versioned structure was accepted; flat legacy array only
    LegacyAllClocks,
}

impl NvidiaCapability {
    pub fn level(&self) -> CapabilityLevel {
        match self {
            NvidiaCapability::Clocks(ClockGeneration::V3) => CapabilityLevel::new(3, "NVAPI clocks V3"),
            NvidiaCapability::Clocks(ClockGeneration::V2) => CapabilityLevel::new(2, "NVAPI clocks V2"),
            NvidiaCapability::Clocks(ClockGeneration::V1) => CapabilityLevel::new(1, "NVAPI clocks V1"),
            NvidiaCapability::LegacyAllClocks => CapabilityLevel::new(0, "NVAPI legacy clocks"),
        }
    }

    fn supports(&self, clock_type: ClockType) -> bool {
        match self {
            NvidiaCapability::Clocks(generation) => generation.supports(clock_type),
            NvidiaCapability::LegacyAllClocks => clock_type == ClockType::Current,
        }
    }
}

/// Clocks decoded from the legacy all-clocks array, in MHz
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LegacyClocks {
    pub core: Option<f32>,
    pub memory: Option<f32>,
    pub shader: Option<f32>,
}

/// Decode the legacy all-clocks array.
///
/// Older boards report a doubled shader clock at a separate slot; when it is
/// populated the core clock is derived from it instead of read directly.
pub fn decode_legacy_clocks(values: &[u32; LEGACY_CLOCK_COUNT]) -> LegacyClocks {
    let mhz = |khz: u32| (khz != 0).then(|| khz as f32 / KHZ_PER_MHZ);

    if values[legacy::SHADER_DOUBLED] != 0 {
        let shader = values[legacy::SHADER_DOUBLED];
        LegacyClocks {
            core: mhz(shader / 2),
            memory: mhz(values[legacy::MEMORY]),
            shader: mhz(shader),
        }
    } else {
        LegacyClocks {
            core: mhz(values[legacy::CORE]),
            memory: mhz(values[legacy::MEMORY]),
            shader: mhz(values[legacy::SHADER]),
        }
    }
}

struct Sensors {
    temperatures: Vec<(ThermalTarget, SensorId)>,
    core_clock: SensorId,
    memory_clock: SensorId,
    shader_clock: SensorId,
    video_clock: SensorId,
    core_base_clock: SensorId,
    core_boost_clock: SensorId,
    fan: SensorId,
    fan_control: SensorId,
    core_load: SensorId,
    memory_load: SensorId,
    video_load: SensorId,
    power: SensorId,
}

/// One physical NVIDIA GPU
pub struct NvidiaGpu {
    api: Option<Arc<dyn NvApi>>,
    handle: PhysicalGpu,
    pub(super) identity: DeviceIdentity,
    capability: NvidiaCapability,
    snapshot: SensorSnapshot,
    sensors: Sensors,
    status: DeviceStatus,
}

impl NvidiaGpu {
    /// Query identity, negotiate the clock structure version, declare sensors
    pub fn new(api: Arc<dyn NvApi>, handle: PhysicalGpu, index: u32) -> Self {
        let name = match api.full_name(handle) {
            Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
            Ok(_) | Err(_) => "NVIDIA GPU".to_string(),
        };
        let name = if name.starts_with("NVIDIA") {
            name
        } else {
            format!("NVIDIA {}", name)
        };

        let negotiated = negotiate(&name, &ClockGeneration::NEGOTIATION_ORDER, |generation| {
            api.clock_frequencies(handle, generation, ClockType::Current)
                .map(|clocks| clocks.present_count())
                .map_err(|s| CoolwatchError::sdk("NvAPI_GPU_GetAllClockFrequencies", s.0))
        });
        let capability = match negotiated {
            Negotiated::Generation(generation) => NvidiaCapability::Clocks(generation),
            Negotiated::Legacy => NvidiaCapability::LegacyAllClocks,
        };

        let thermal_targets: Vec<ThermalTarget> = match api.thermal_settings(handle) {
            Ok(settings) if !settings.sensors.is_empty() => {
                settings.sensors.iter().map(|s| s.target).collect()
            }
            Ok(_) | Err(_) => {
                debug!(gpu = %name, "No thermal sensor list, assuming GPU core only");
                vec![ThermalTarget::Gpu]
            }
        };

        let mut snapshot = SensorSnapshot::new();
        let temperatures = thermal_targets
            .iter()
            .enumerate()
            .map(|(i, target)| {
                (*target, snapshot.declare(target.label(), SensorKind::Temperature, i as u32))
            })
            .collect();

        let is_versioned = matches!(capability, NvidiaCapability::Clocks(_));
        let sensors = Sensors {
            temperatures,
            core_clock: snapshot.declare("GPU Core", SensorKind::Clock, 0),
            memory_clock: snapshot.declare("GPU Memory", SensorKind::Clock, 1),
            shader_clock: snapshot.declare("GPU Shader", SensorKind::Clock, 2),
            video_clock: snapshot.declare_if(is_versioned, "GPU Video", SensorKind::Clock, 3),
            core_base_clock: snapshot.declare_if(
                capability.supports(ClockType::Base),
                "GPU Core Base",
                SensorKind::Clock,
                4,
            ),
            core_boost_clock: snapshot.declare_if(
                capability.supports(ClockType::Boost),
                "GPU Core Boost",
                SensorKind::Clock,
                5,
            ),
            fan: snapshot.declare("GPU", SensorKind::Fan, 0),
            fan_control: snapshot.declare("GPU Fan", SensorKind::Control, 0),
            core_load: snapshot.declare("GPU Core", SensorKind::Load, 0),
            memory_load: snapshot.declare("GPU Memory Controller", SensorKind::Load, 1),
            video_load: snapshot.declare("GPU Video Engine", SensorKind::Load, 2),
            power: snapshot.declare("GPU Power", SensorKind::Power, 0),
        };

        Self {
            api: Some(api),
            handle,
            identity: DeviceIdentity {
                name,
                family: DeviceFamily::NvidiaGpu,
                location: format!("nvapi:{}", index),
                firmware: None,
            },
            capability,
            snapshot,
            sensors,
            status: DeviceStatus::Active,
        }
    }

    /// The negotiated clock path
    pub fn capability_kind(&self) -> NvidiaCapability {
        self.capability
    }

    /// Unwrap a call result, noting a lost device
    fn take<T>(&mut self, call: &'static str, result: NvResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(status) => {
                trace!(gpu = %self.identity.name, "{} failed: {}", call, status);
                if status.is_device_lost() && self.status == DeviceStatus::Active {
                    warn!(gpu = %self.identity.name, "GPU no longer present ({})", status);
                    self.status = DeviceStatus::Disconnected;
                }
                None
            }
        }
    }

    fn update_temperatures(&mut self, api: &dyn NvApi) {
        let result = api.thermal_settings(self.handle);
        let settings = self.take("NvAPI_GPU_GetThermalSettings", result);
        for i in 0..self.sensors.temperatures.len() {
            let (target, id) = self.sensors.temperatures[i];
            let value = settings.as_ref().and_then(|s| {
                s.sensors
                    .iter()
                    .find(|sensor| sensor.target == target)
                    .map(|sensor| sensor.current_temp as f32)
            });
            self.snapshot.set(id, value);
        }
    }

    fn update_clocks(&mut self, api: &dyn NvApi) {
        match self.capability {
            NvidiaCapability::Clocks(generation) => {
                let result = api.clock_frequencies(self.handle, generation, ClockType::Current);
                let current = self.take("NvAPI_GPU_GetAllClockFrequencies", result);
                let clock = |d: usize| current.as_ref().and_then(|c| c.mhz(d));
                let (core, memory, shader, video) = (
                    clock(domain::GRAPHICS),
                    clock(domain::MEMORY),
                    clock(domain::PROCESSOR),
                    clock(domain::VIDEO),
                );
                self.snapshot.set(self.sensors.core_clock, core);
                self.snapshot.set(self.sensors.memory_clock, memory);
                self.snapshot.set(self.sensors.shader_clock, shader);
                self.snapshot.set(self.sensors.video_clock, video);

                if generation.supports(ClockType::Base) {
                    let result = api.clock_frequencies(self.handle, generation, ClockType::Base);
                    let base = self
                        .take("NvAPI_GPU_GetAllClockFrequencies", result)
                        .and_then(|c| c.mhz(domain::GRAPHICS));
                    self.snapshot.set(self.sensors.core_base_clock, base);
                }
                if generation.supports(ClockType::Boost) {
                    let result = api.clock_frequencies(self.handle, generation, ClockType::Boost);
                    let boost = self
                        .take("NvAPI_GPU_GetAllClockFrequencies", result)
                        .and_then(|c| c.mhz(domain::GRAPHICS));
                    self.snapshot.set(self.sensors.core_boost_clock, boost);
                }
            }
            NvidiaCapability::LegacyAllClocks => {
                let result = api.all_clocks(self.handle);
                let clocks = self
                    .take("NvAPI_GPU_GetAllClocks", result)
                    .map(|values| decode_legacy_clocks(&values));
                self.snapshot.set(self.sensors.core_clock, clocks.and_then(|c| c.core));
                self.snapshot.set(self.sensors.memory_clock, clocks.and_then(|c| c.memory));
                self.snapshot.set(self.sensors.shader_clock, clocks.and_then(|c| c.shader));
            }
        }
    }

    fn update_cooling_and_load(&mut self, api: &dyn NvApi) {
        let result = api.tachometer(self.handle);
        let rpm = self.take("NvAPI_GPU_GetTachReading", result);
        self.snapshot.set(self.sensors.fan, rpm.map(|r| r as f32));

        let result = api.cooler_level(self.handle);
        let level = self.take("NvAPI_GPU_GetCoolerSettings", result);
        self.snapshot
            .set(self.sensors.fan_control, level.map(|l| l.min(100) as f32));

        let result = api.utilization(self.handle);
        let usage = self.take("NvAPI_GPU_GetDynamicPstatesInfoEx", result);
        let usage = usage.unwrap_or_default();
        self.snapshot.set(self.sensors.core_load, usage.gpu.map(|v| v as f32));
        self.snapshot
            .set(self.sensors.memory_load, usage.frame_buffer.map(|v| v as f32));
        self.snapshot
            .set(self.sensors.video_load, usage.video_engine.map(|v| v as f32));

        let result = api.power_draw_mw(self.handle);
        let power = self.take("NvAPI_GPU_ClientPowerTopologyGetStatus", result);
        self.snapshot
            .set(self.sensors.power, power.map(|mw| mw as f32 / MILLIWATTS_PER_WATT));
    }
}

impl Device for NvidiaGpu {
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

        self.update_temperatures(api.as_ref());
        self.update_clocks(api.as_ref());
        self.update_cooling_and_load(api.as_ref());

        if self.status == DeviceStatus::Active {
            self.snapshot.mark_updated();
        } else {
            self.snapshot.clear_values();
        }
    }

    fn close(&mut self) {
        if self.api.take().is_some() {
            debug!(gpu = %self.identity.name, "Released NVAPI handle");
        }
        self.status = DeviceStatus::Closed;
    }

    fn status(&self) -> DeviceStatus {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvidia::{
        ClockFrequencies, MockNvApi, NvStatus, ThermalSensor, ThermalSettings, Utilization,
    };
    use mockall::predicate::*;

    fn v1_clocks() -> ClockFrequencies {
        ClockFrequencies::default()
            .with_domain(domain::GRAPHICS, 1_200_000)
            .with_domain(domain::MEMORY, 3_500_000)
    }

    fn base_expectations(api: &mut MockNvApi) {
        api.expect_full_name()
            .returning(|_| Ok("GeForce GTX 980".to_string()));
        api.expect_thermal_settings().returning(|_| {
            Ok(ThermalSettings {
                sensors: vec![ThermalSensor {
                    target: ThermalTarget::Gpu,
                    current_temp: 54,
                }],
            })
        });
        api.expect_tachometer().returning(|_| Ok(1350));
        api.expect_cooler_level().returning(|_| Ok(38));
        api.expect_utilization().returning(|_| {
            Ok(Utilization {
                gpu: Some(12),
                frame_buffer: Some(4),
                video_engine: None,
            })
        });
        api.expect_power_draw_mw().returning(|_| Ok(95_500));
    }

    #[test]
    fn test_negotiation_settles_on_v1_and_never_renegotiates() {
        let mut api = MockNvApi::new();
        base_expectations(&mut api);
        api.expect_clock_frequencies()
            .with(always(), eq(ClockGeneration::V3), always())
            .times(1)
            .returning(|_, _, _| Err(NvStatus::NOT_SUPPORTED));
        api.expect_clock_frequencies()
            .with(always(), eq(ClockGeneration::V2), always())
            .times(1)
            .returning(|_, _, _| Err(NvStatus::INCOMPATIBLE_STRUCT_VERSION));
        let mut calls = 0;
        api.expect_clock_frequencies()
            .with(always(), eq(ClockGeneration::V1), eq(ClockType::Current))
            .returning(move |_, _, _| {
                calls += 1;
                // Probe and first poll see clocks; later polls report no domains
                if calls <= 2 {
                    Ok(v1_clocks())
                } else {
                    Ok(ClockFrequencies::default())
                }
            });

        let mut gpu = NvidiaGpu::new(Arc::new(api), PhysicalGpu(0), 0);
        assert_eq!(gpu.capability_kind(), NvidiaCapability::Clocks(ClockGeneration::V1));
        let level = gpu.capability();

        gpu.update();
        assert_eq!(gpu.snapshot().find("GPU Core").and_then(|r| r.value), Some(54.0));
        assert_eq!(gpu.snapshot().value(gpu.sensors.core_clock), Some(1200.0));

        for _ in 0..3 {
            gpu.update();
            assert_eq!(gpu.capability(), level);
        }
        assert_eq!(gpu.snapshot().value(gpu.sensors.core_clock), None);
        assert_eq!(gpu.snapshot().value(gpu.sensors.core_boost_clock), None);
        assert_eq!(gpu.status(), DeviceStatus::Active);
    }

    #[test]
    fn test_exhaustion_uses_legacy_clocks_and_marks_absent() {
        let mut api = MockNvApi::new();
        base_expectations(&mut api);
        api.expect_clock_frequencies()
            .returning(|_, _, _| Err(NvStatus::NOT_SUPPORTED));
        api.expect_all_clocks().returning(|_| {
            let mut values = [0u32; LEGACY_CLOCK_COUNT];
            values[legacy::CORE] = 1_100_000;
            values[legacy::MEMORY] = 3_000_000;
            values[legacy::SHADER] = 2_200_000;
            Ok(values)
        });

        let mut gpu = NvidiaGpu::new(Arc::new(api), PhysicalGpu(1), 1);
        assert_eq!(gpu.capability_kind(), NvidiaCapability::LegacyAllClocks);
        assert_eq!(gpu.capability().rank, 0);

        for _ in 0..3 {
            gpu.update();
            assert_eq!(gpu.snapshot().value(gpu.sensors.core_clock), Some(1100.0));
            assert_eq!(gpu.snapshot().value(gpu.sensors.core_base_clock), None);
            assert_eq!(gpu.snapshot().value(gpu.sensors.video_clock), None);
        }
        let boost = gpu.snapshot().find("GPU Core Boost").cloned();
        assert!(boost.map(|r| !r.is_supported()).unwrap_or(false));
    }

    #[test]
    fn test_device_lost_disconnects() {
        let mut api = MockNvApi::new();
        api.expect_full_name().returning(|_| Ok("NVIDIA RTX A2000".to_string()));
        api.expect_thermal_settings()
            .returning(|_| Err(NvStatus::NVIDIA_DEVICE_NOT_FOUND));
        api.expect_clock_frequencies()
            .returning(|_, _, _| Ok(ClockFrequencies::default().with_domain(domain::GRAPHICS, 900_000)));
        api.expect_tachometer().returning(|_| Err(NvStatus::NOT_SUPPORTED));
        api.expect_cooler_level().returning(|_| Err(NvStatus::NOT_SUPPORTED));
        api.expect_utilization().returning(|_| Err(NvStatus::NOT_SUPPORTED));
        api.expect_power_draw_mw().returning(|_| Err(NvStatus::NOT_SUPPORTED));

        let mut gpu = NvidiaGpu::new(Arc::new(api), PhysicalGpu(0), 0);
        assert_eq!(gpu.identity().name, "NVIDIA RTX A2000");
        gpu.update();
        assert_eq!(gpu.status(), DeviceStatus::Disconnected);
        assert!(gpu.snapshot().readings().iter().all(|r| r.value.is_none()));

        gpu.close();
        gpu.close();
        assert_eq!(gpu.status(), DeviceStatus::Closed);
    }

    #[test]
    fn test_legacy_decoder_is_deterministic() {
        let mut values = [0u32; LEGACY_CLOCK_COUNT];
        values[legacy::MEMORY] = 2_505_000;
        values[legacy::SHADER_DOUBLED] = 1_600_000;
        let first = decode_legacy_clocks(&values);
        assert_eq!(first, decode_legacy_clocks(&values));
        assert_eq!(first.core, Some(800.0));
        assert_eq!(first.shader, Some(1600.0));
        assert_eq!(first.memory, Some(2505.0));
    }
}
