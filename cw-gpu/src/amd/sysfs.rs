//! [`AdlApi`] over the amdgpu sysfs interface
//!
//! The kernel driver publishes the same values the Overdrive8 PM log carries,
//! so only that generation is answered here; the older queries report
//! `NOT_SUPPORTED` and negotiation settles on Overdrive8 for any card with a
//! populated hwmon directory.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use super::{
    AdapterInfo, AdlApi, AdlResult, AdlStatus, FanSpeedUnit, Od5Activity, Od6Status,
    OdnPerformanceStatus, OdnTemperature, PmLogSensors,
};
use crate::constants::amd::pmlog;
use crate::constants::{pwm, DRM_PATH, HZ_PER_MHZ, MICROWATTS_PER_WATT, MILLIDEGREE_DIVISOR};

/// sysfs-backed adapter source rooted at the DRM class directory
#[derive(Debug, Clone)]
pub struct SysfsAdl {
    root: PathBuf,
}

impl Default for SysfsAdl {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsAdl {
    pub fn new() -> Self {
        Self::with_root(DRM_PATH)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn device_path(&self, adapter: i32) -> PathBuf {
        self.root.join(format!("card{}", adapter)).join("device")
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn read_number(path: &Path) -> Option<i64> {
    read_trimmed(path).and_then(|s| s.parse::<i64>().ok())
}

fn parse_vendor(raw: &str) -> Option<i32> {
    i32::from_str_radix(raw.trim_start_matches("0x"), 16).ok()
}

/// Bus and device numbers from a PCI slot name such as `0000:03:00.0`
fn parse_pci_slot(slot: &str) -> Option<(i32, i32)> {
    let mut parts = slot.rsplitn(3, ':');
    let dev_fn = parts.next()?;
    let bus = parts.next()?;
    let device = dev_fn.split('.').next()?;
    Some((
        i32::from_str_radix(bus, 16).ok()?,
        i32::from_str_radix(device, 16).ok()?,
    ))
}

fn pci_slot(device_path: &Path) -> Option<String> {
    let from_uevent = read_trimmed(&device_path.join("uevent")).and_then(|uevent| {
        uevent
            .lines()
            .find_map(|l| l.strip_prefix("PCI_SLOT_NAME=").map(str::to_string))
    });
    from_uevent.or_else(|| {
        fs::canonicalize(device_path)
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
    })
}

fn read_gpu_name(device_path: &Path) -> String {
    match read_trimmed(&device_path.join("product_name")) {
        Some(name) if !name.is_empty() => name,
        _ => "AMD GPU".to_string(),
    }
}

fn find_hwmon(device_path: &Path) -> Option<PathBuf> {
    let hwmon_dir = device_path.join("hwmon");
    fs::read_dir(&hwmon_dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .find(|p| p.is_dir())
}

impl AdlApi for SysfsAdl {
    fn adapters(&self) -> AdlResult<Vec<AdapterInfo>> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            debug!("DRM path {:?} not readable: {}", self.root, e);
            AdlStatus::NOT_INIT
        })?;

        let mut adapters = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();

            if !name_str.starts_with("card") || name_str.contains('-') {
                continue;
            }
            let Ok(index) = name_str.trim_start_matches("card").parse::<i32>() else {
                continue;
            };

            let device_path = entry.path().join("device");
            let Some(vendor_id) = read_trimmed(&device_path.join("vendor")).and_then(|v| parse_vendor(&v)) else {
                trace!("Skipping {} without vendor id", name_str);
                continue;
            };
            let (bus, device) = pci_slot(&device_path)
                .and_then(|slot| parse_pci_slot(&slot))
                .unwrap_or((-1, index));
            let active = read_number(&device_path.join("enable")).map_or(true, |v| v != 0);

            adapters.push(AdapterInfo {
                index,
                vendor_id,
                bus,
                device,
                name: read_gpu_name(&device_path),
                active,
            });
        }

        adapters.sort_by_key(|a| a.index);
        Ok(adapters)
    }

    fn od8_pmlog(&self, adapter: i32) -> AdlResult<PmLogSensors> {
        let device_path = self.device_path(adapter);
        if !device_path.exists() {
            return Err(AdlStatus::DISABLED_ADAPTER);
        }
        let hwmon = find_hwmon(&device_path).ok_or(AdlStatus::NOT_SUPPORTED)?;

        let millidegrees = |file: &str| {
            read_number(&hwmon.join(file)).map(|v| (v as f32 / MILLIDEGREE_DIVISOR).round() as i32)
        };
        let mhz = |file: &str| read_number(&hwmon.join(file)).map(|hz| (hz as f32 / HZ_PER_MHZ).round() as i32);

        let slots = [
            (pmlog::TEMPERATURE_EDGE, millidegrees("temp1_input")),
            (pmlog::TEMPERATURE_HOTSPOT, millidegrees("temp2_input")),
            (pmlog::TEMPERATURE_MEM, millidegrees("temp3_input")),
            (pmlog::FAN_RPM, read_number(&hwmon.join("fan1_input")).map(|v| v as i32)),
            (
                pmlog::FAN_PERCENTAGE,
                read_number(&hwmon.join("pwm1"))
                    .and_then(|v| u8::try_from(v).ok())
                    .map(|v| pwm::to_percent(v).round() as i32),
            ),
            (
                pmlog::ASIC_POWER,
                read_number(&hwmon.join("power1_average"))
                    .map(|uw| (uw as f32 / MICROWATTS_PER_WATT).round() as i32),
            ),
            (pmlog::GFX_VOLTAGE, read_number(&hwmon.join("in0_input")).map(|v| v as i32)),
            (
                pmlog::INFO_ACTIVITY_GFX,
                read_number(&device_path.join("gpu_busy_percent")).map(|v| v as i32),
            ),
            (pmlog::CLK_GFXCLK, mhz("freq1_input")),
            (pmlog::CLK_MEMCLK, mhz("freq2_input")),
        ];

        let log = slots
            .into_iter()
            .filter_map(|(slot, value)| value.map(|v| (slot, v)))
            .fold(PmLogSensors::default(), |log, (slot, v)| log.with(slot, v));
        Ok(log)
    }

    fn odn_performance_status(&self, _adapter: i32) -> AdlResult<OdnPerformanceStatus> {
        Err(AdlStatus::NOT_SUPPORTED)
    }

    fn odn_temperature(&self, _adapter: i32, _sensor: OdnTemperature) -> AdlResult<i32> {
        Err(AdlStatus::NOT_SUPPORTED)
    }

    fn odn_fan_rpm(&self, _adapter: i32) -> AdlResult<i32> {
        Err(AdlStatus::NOT_SUPPORTED)
    }

    fn od6_capabilities(&self, _adapter: i32) -> AdlResult<u32> {
        Err(AdlStatus::NOT_SUPPORTED)
    }

    fn od6_current_status(&self, _adapter: i32) -> AdlResult<Od6Status> {
        Err(AdlStatus::NOT_SUPPORTED)
    }

    fn od6_current_power(&self, _adapter: i32) -> AdlResult<i32> {
        Err(AdlStatus::NOT_SUPPORTED)
    }

    fn od5_temperature(&self, _adapter: i32) -> AdlResult<i32> {
        Err(AdlStatus::NOT_SUPPORTED)
    }

    fn od5_fan_speed(&self, _adapter: i32, _unit: FanSpeedUnit) -> AdlResult<i32> {
        Err(AdlStatus::NOT_SUPPORTED)
    }

    fn od5_activity(&self, _adapter: i32) -> AdlResult<Od5Activity> {
        Err(AdlStatus::NOT_SUPPORTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amd::{enumerate, AmdCapability};
    use cw_sensor::{Device, SensorKind};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    fn fake_card(root: &Path, card: u32, vendor: &str, slot: &str) -> PathBuf {
        let device = root.join(format!("card{}", card)).join("device");
        write(&device.join("vendor"), &format!("{}\n", vendor));
        write(&device.join("uevent"), &format!("DRIVER=amdgpu\nPCI_SLOT_NAME={}\n", slot));
        write(&device.join("product_name"), "Radeon RX 6800\n");
        device
    }

    #[test]
    fn test_pci_slot_parsing() {
        assert_eq!(parse_pci_slot("0000:03:00.0"), Some((3, 0)));
        assert_eq!(parse_pci_slot("0000:0a:1f.1"), Some((10, 31)));
        assert_eq!(parse_pci_slot("garbage"), None);
    }

    #[test]
    fn test_pmlog_from_hwmon_files() {
        let dir = TempDir::new().expect("tempdir");
        let device = fake_card(dir.path(), 0, "0x1002", "0000:03:00.0");
        let hwmon = device.join("hwmon").join("hwmon4");
        write(&hwmon.join("temp1_input"), "52000\n");
        write(&hwmon.join("temp2_input"), "64000\n");
        write(&hwmon.join("fan1_input"), "1100\n");
        write(&hwmon.join("pwm1"), "255\n");
        write(&hwmon.join("power1_average"), "187000000\n");
        write(&hwmon.join("freq1_input"), "2105000000\n");
        write(&device.join("gpu_busy_percent"), "37\n");

        let adl = SysfsAdl::with_root(dir.path());
        let log = adl.od8_pmlog(0).expect("pmlog");
        assert_eq!(log.get(pmlog::TEMPERATURE_EDGE), Some(52));
        assert_eq!(log.get(pmlog::TEMPERATURE_HOTSPOT), Some(64));
        assert_eq!(log.get(pmlog::TEMPERATURE_MEM), None);
        assert_eq!(log.get(pmlog::FAN_PERCENTAGE), Some(100));
        assert_eq!(log.get(pmlog::ASIC_POWER), Some(187));
        assert_eq!(log.get(pmlog::CLK_GFXCLK), Some(2105));
        assert_eq!(log.get(pmlog::INFO_ACTIVITY_GFX), Some(37));
        assert_eq!(adl.od8_pmlog(5), Err(AdlStatus::DISABLED_ADAPTER));
    }

    #[test]
    fn test_enumerate_skips_foreign_vendors_and_negotiates_od8() {
        let dir = TempDir::new().expect("tempdir");
        let amd = fake_card(dir.path(), 0, "0x1002", "0000:03:00.0");
        write(&amd.join("hwmon").join("hwmon2").join("temp1_input"), "48000\n");
        fake_card(dir.path(), 1, "0x10de", "0000:0b:00.0");
        fs::create_dir_all(dir.path().join("card0-DP-1")).expect("connector");

        let gpus = enumerate(Arc::new(SysfsAdl::with_root(dir.path()))).expect("enumerate");
        assert_eq!(gpus.len(), 1);
        let mut gpu = gpus.into_iter().next().expect("gpu");
        assert_eq!(gpu.capability_kind(), AmdCapability::Overdrive8);
        assert_eq!(gpu.identity().name, "Radeon RX 6800");

        gpu.update();
        let temp = gpu.snapshot().get(SensorKind::Temperature, 0).and_then(|r| r.value);
        assert_eq!(temp, Some(48.0));
    }

    #[test]
    fn test_missing_drm_root_is_not_init() {
        let adl = SysfsAdl::with_root("/nonexistent/coolwatch/drm");
        assert_eq!(adl.adapters(), Err(AdlStatus::NOT_INIT));
    }
}
