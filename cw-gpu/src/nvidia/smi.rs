//! [`NvApi`] on top of `nvidia-smi`
//!
//! One CSV query answers every call for every GPU, so the parsed rows are
//! cached briefly and shared between the calls of a single update pass.

use std::process::Command;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{
    ClockFrequencies, ClockGeneration, ClockType, NvApi, NvResult, NvStatus, PhysicalGpu,
    ThermalSensor, ThermalSettings, ThermalTarget, Utilization,
};
use crate::constants::nvidia::{domain, LEGACY_CLOCK_COUNT, SMI_CACHE_MS};
use crate::constants::MILLIWATTS_PER_WATT;

const QUERY_FIELDS: &str = "index,name,temperature.gpu,temperature.memory,clocks.gr,clocks.mem,\
clocks.video,clocks.sm,clocks.applications.graphics,clocks.max.graphics,fan.speed,\
utilization.gpu,utilization.memory,power.draw";

const FIELD_COUNT: usize = 14;

/// One parsed `nvidia-smi` row
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SmiRow {
    pub index: u32,
    pub name: String,
    pub temp_gpu: Option<f32>,
    pub temp_memory: Option<f32>,
    pub clock_graphics: Option<u32>,
    pub clock_memory: Option<u32>,
    pub clock_video: Option<u32>,
    pub clock_sm: Option<u32>,
    pub clock_base: Option<u32>,
    pub clock_boost: Option<u32>,
    pub fan_percent: Option<u32>,
    pub util_gpu: Option<u32>,
    pub util_memory: Option<u32>,
    pub power_watts: Option<f32>,
}

fn parse_nvidia_value(s: &str) -> Option<u32> {
    if s.is_empty() || s == "N/A" || s == "[N/A]" || s == "[Not Supported]" {
        None
    } else {
        s.parse().ok()
    }
}

fn parse_nvidia_value_f32(s: &str) -> Option<f32> {
    if s.is_empty() || s == "N/A" || s == "[N/A]" || s == "[Not Supported]" {
        None
    } else {
        s.parse().ok()
    }
}

/// Parse `--format=csv,noheader,nounits` output
pub(crate) fn parse_rows(stdout: &str) -> Vec<SmiRow> {
    let mut rows = Vec::new();

    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if parts.len() < FIELD_COUNT {
            trace!("Skipping malformed nvidia-smi line: {}", line);
            continue;
        }

        let index = match parts[0].parse::<u32>() {
            Ok(idx) => idx,
            Err(e) => {
                warn!("Failed to parse GPU index '{}': {}", parts[0], e);
                continue;
            }
        };

        rows.push(SmiRow {
            index,
            name: parts[1].to_string(),
            temp_gpu: parse_nvidia_value_f32(parts[2]),
            temp_memory: parse_nvidia_value_f32(parts[3]),
            clock_graphics: parse_nvidia_value(parts[4]),
            clock_memory: parse_nvidia_value(parts[5]),
            clock_video: parse_nvidia_value(parts[6]),
            clock_sm: parse_nvidia_value(parts[7]),
            clock_base: parse_nvidia_value(parts[8]),
            clock_boost: parse_nvidia_value(parts[9]),
            fan_percent: parse_nvidia_value(parts[10]),
            util_gpu: parse_nvidia_value(parts[11]),
            util_memory: parse_nvidia_value(parts[12]),
            power_watts: parse_nvidia_value_f32(parts[13]),
        });
    }

    rows
}

/// Build the clock structure a given request would have filled
pub(crate) fn clocks_for(
    row: &SmiRow,
    generation: ClockGeneration,
    clock_type: ClockType,
) -> NvResult<ClockFrequencies> {
    if !generation.supports(clock_type) {
        return Err(NvStatus::INCOMPATIBLE_STRUCT_VERSION);
    }

    let slots: Vec<(usize, Option<u32>)> = match clock_type {
        ClockType::Current => vec![
            (domain::GRAPHICS, row.clock_graphics),
            (domain::MEMORY, row.clock_memory),
            (domain::VIDEO, row.clock_video),
            (domain::PROCESSOR, row.clock_sm),
        ],
        ClockType::Base => vec![(domain::GRAPHICS, row.clock_base)],
        ClockType::Boost => vec![(domain::GRAPHICS, row.clock_boost)],
    };

    let clocks = slots
        .into_iter()
        .filter_map(|(d, mhz)| mhz.map(|m| (d, m)))
        .fold(ClockFrequencies::default(), |clocks, (d, mhz)| {
            clocks.with_domain(d, mhz.saturating_mul(1000))
        });
    Ok(clocks)
}

struct Cached {
    taken: Instant,
    rows: Vec<SmiRow>,
}

/// `nvidia-smi` backed management API
pub struct SmiApi {
    binary: String,
    cache: Mutex<Option<Cached>>,
    max_age: Duration,
}

impl Default for SmiApi {
    fn default() -> Self {
        Self::new()
    }
}

impl SmiApi {
    pub fn new() -> Self {
        Self::with_binary("nvidia-smi")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            cache: Mutex::new(None),
            max_age: Duration::from_millis(SMI_CACHE_MS),
        }
    }

    fn query(&self) -> NvResult<Vec<SmiRow>> {
        let output = Command::new(&self.binary)
            .args([
                format!("--query-gpu={}", QUERY_FIELDS).as_str(),
                "--format=csv,noheader,nounits",
            ])
            .output()
            .map_err(|e| {
                debug!("{} not available: {}", self.binary, e);
                NvStatus::LIBRARY_NOT_FOUND
            })?;

        if !output.status.success() {
            debug!("{} exited with {}", self.binary, output.status);
            return Err(NvStatus::ERROR);
        }

        Ok(parse_rows(&String::from_utf8_lossy(&output.stdout)))
    }

    fn rows(&self) -> NvResult<Vec<SmiRow>> {
        let mut cache = self.cache.lock();
        if let Some(cached) = cache.as_ref() {
            if cached.taken.elapsed() < self.max_age {
                return Ok(cached.rows.clone());
            }
        }
        let rows = self.query()?;
        *cache = Some(Cached {
            taken: Instant::now(),
            rows: rows.clone(),
        });
        Ok(rows)
    }

    fn row(&self, gpu: PhysicalGpu) -> NvResult<SmiRow> {
        self.rows()?
            .into_iter()
            .find(|r| r.index == gpu.0)
            .ok_or(NvStatus::NVIDIA_DEVICE_NOT_FOUND)
    }
}

impl NvApi for SmiApi {
    fn physical_gpus(&self) -> NvResult<Vec<PhysicalGpu>> {
        Ok(self.rows()?.iter().map(|r| PhysicalGpu(r.index)).collect())
    }

    fn full_name(&self, gpu: PhysicalGpu) -> NvResult<String> {
        Ok(self.row(gpu)?.name)
    }

    fn thermal_settings(&self, gpu: PhysicalGpu) -> NvResult<ThermalSettings> {
        let row = self.row(gpu)?;
        let sensors = [
            (ThermalTarget::Gpu, row.temp_gpu),
            (ThermalTarget::Memory, row.temp_memory),
        ]
        .into_iter()
        .filter_map(|(target, temp)| {
            temp.map(|t| ThermalSensor {
                target,
                current_temp: t.round() as i32,
            })
        })
        .collect();
        Ok(ThermalSettings { sensors })
    }

    fn clock_frequencies(
        &self,
        gpu: PhysicalGpu,
        generation: ClockGeneration,
        clock_type: ClockType,
    ) -> NvResult<ClockFrequencies> {
        clocks_for(&self.row(gpu)?, generation, clock_type)
    }

    fn all_clocks(&self, _gpu: PhysicalGpu) -> NvResult<[u32; LEGACY_CLOCK_COUNT]> {
        Err(NvStatus::NOT_SUPPORTED)
    }

    fn tachometer(&self, _gpu: PhysicalGpu) -> NvResult<u32> {
        Err(NvStatus::NOT_SUPPORTED)
    }

    fn cooler_level(&self, gpu: PhysicalGpu) -> NvResult<u32> {
        self.row(gpu)?.fan_percent.ok_or(NvStatus::NOT_SUPPORTED)
    }

    fn utilization(&self, gpu: PhysicalGpu) -> NvResult<Utilization> {
        let row = self.row(gpu)?;
        Ok(Utilization {
            gpu: row.util_gpu,
            frame_buffer: row.util_memory,
            video_engine: None,
        })
    }

    fn power_draw_mw(&self, gpu: PhysicalGpu) -> NvResult<u32> {
        self.row(gpu)?
            .power_watts
            .map(|w| (w * MILLIWATTS_PER_WATT).round() as u32)
            .ok_or(NvStatus::NOT_SUPPORTED)
    }
}
