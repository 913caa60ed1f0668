//! Persistent daemon configuration
//!
//! Stored as JSON at `<config_dir>/coolwatch/config.json`. Every field has a
//! default so partial or older files still load.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{limits, logging, paths, timing};
use crate::validator::ProbePolicy;
use crate::{CoolwatchError, Result};

/// Probe bound of one device family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Wait per probe step
    pub step_ms: u64,
    /// Number of steps before the candidate is rejected
    pub retries: u32,
}

impl ProbeConfig {
    pub const fn new(step_ms: u64, retries: u32) -> Self {
        Self { step_ms, retries }
    }

    pub fn policy(&self) -> ProbePolicy {
        ProbePolicy::new(Duration::from_millis(self.step_ms), self.retries)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::new(100, 5)
    }
}

/// Which transport classes to scan and how long to probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub ftdi: bool,
    pub serial: bool,
    pub hid: bool,
    pub nvidia: bool,
    pub amd: bool,
    /// Serial ports never probed (e.g., a modem or console)
    pub ignore_ports: Vec<String>,
    pub tbalancer: ProbeConfig,
    pub heatmaster: ProbeConfig,
    pub kraken: ProbeConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ftdi: true,
            serial: true,
            hid: true,
            nvidia: true,
            amd: true,
            ignore_ports: Vec::new(),
            tbalancer: ProbeConfig::new(100, 5),
            heatmaster: ProbeConfig::new(20, 10),
            kraken: ProbeConfig::new(250, 8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub stream_read_timeout_ms: u64,
    pub poller_join_timeout_ms: u64,
    /// Passes without a new streamed report before its values become absent
    pub stream_stale_cycles: u32,
    /// 0 disables periodic re-discovery
    pub rediscovery_interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: timing::UPDATE_INTERVAL_MS,
            stream_read_timeout_ms: timing::STREAM_READ_TIMEOUT_MS,
            poller_join_timeout_ms: timing::POLLER_JOIN_TIMEOUT_MS,
            stream_stale_cycles: timing::STREAM_STALE_CYCLES,
            rediscovery_interval_ms: timing::REDISCOVERY_INTERVAL_MS,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stream_read_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_read_timeout_ms)
    }

    pub fn poller_join_timeout(&self) -> Duration {
        Duration::from_millis(self.poller_join_timeout_ms)
    }

    pub fn rediscovery_interval(&self) -> Option<Duration> {
        (self.rediscovery_interval_ms > 0).then(|| Duration::from_millis(self.rediscovery_interval_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `COOLWATCH_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: logging::DEFAULT_LEVEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoolwatchConfig {
    pub discovery: DiscoveryConfig,
    pub polling: PollingConfig,
    pub logging: LoggingConfig,
}

fn invalid(field: &str, reason: impl Into<String>) -> CoolwatchError {
    CoolwatchError::InvalidConfig {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn check_timeout(field: &str, value_ms: u64) -> Result<()> {
    if value_ms == 0 || value_ms > limits::MAX_TIMEOUT_MS {
        return Err(invalid(
            field,
            format!("must be between 1 and {} ms, got {}", limits::MAX_TIMEOUT_MS, value_ms),
        ));
    }
    Ok(())
}

fn check_probe(field: &str, probe: &ProbeConfig) -> Result<()> {
    check_timeout(&format!("{}.step_ms", field), probe.step_ms)?;
    if probe.retries == 0 || probe.retries > limits::MAX_PROBE_RETRIES {
        return Err(invalid(
            &format!("{}.retries", field),
            format!("must be between 1 and {}", limits::MAX_PROBE_RETRIES),
        ));
    }
    Ok(())
}

impl CoolwatchConfig {
    /// Reject values that would make polling spin or block indefinitely
    pub fn validate(&self) -> Result<()> {
        let polling = &self.polling;
        if polling.interval_ms < limits::MIN_UPDATE_INTERVAL_MS {
            return Err(invalid(
                "polling.interval_ms",
                format!("must be at least {} ms", limits::MIN_UPDATE_INTERVAL_MS),
            ));
        }
        check_timeout("polling.stream_read_timeout_ms", polling.stream_read_timeout_ms)?;
        check_timeout("polling.poller_join_timeout_ms", polling.poller_join_timeout_ms)?;
        if polling.stream_stale_cycles == 0 {
            return Err(invalid("polling.stream_stale_cycles", "must be at least 1"));
        }
        if polling.rediscovery_interval_ms != 0 && polling.rediscovery_interval_ms < polling.interval_ms {
            return Err(invalid(
                "polling.rediscovery_interval_ms",
                "must be 0 or not shorter than the update interval",
            ));
        }

        check_probe("discovery.tbalancer", &self.discovery.tbalancer)?;
        check_probe("discovery.heatmaster", &self.discovery.heatmaster)?;
        check_probe("discovery.kraken", &self.discovery.kraken)?;

        let level = self.logging.level.to_ascii_lowercase();
        if !logging::LEVELS.contains(&level.as_str()) {
            return Err(invalid(
                "logging.level",
                format!("unknown level '{}'", self.logging.level),
            ));
        }
        Ok(())
    }
}

/// Default config file location
pub fn get_config_path() -> Result<PathBuf> {
    paths::config_file().ok_or_else(|| CoolwatchError::config("Could not determine config directory"))
}

/// Load from the default location, defaults when no file exists
pub fn load_config() -> Result<CoolwatchConfig> {
    let path = get_config_path()?;
    if !path.exists() {
        debug!("No config at {:?}, using defaults", path);
        return Ok(CoolwatchConfig::default());
    }
    load_config_from(&path)
}

/// Load and validate a config file
pub fn load_config_from(path: &Path) -> Result<CoolwatchConfig> {
    let content = fs::read_to_string(path).map_err(|e| CoolwatchError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config: CoolwatchConfig = serde_json::from_str(&content)?;
    config.validate()?;
    debug!("Loaded config from {:?}", path);
    Ok(config)
}

/// Validate and write atomically (temp file, then rename)
pub fn save_config_to(config: &CoolwatchConfig, path: &Path) -> Result<()> {
    config.validate()?;

    let write_err = |e| CoolwatchError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
    }

    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("json.tmp");

    let mut file = fs::File::create(&temp_path).map_err(write_err)?;
    file.write_all(json.as_bytes()).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    fs::rename(&temp_path, path).map_err(write_err)?;
    debug!("Saved config to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_validate() {
        assert!(CoolwatchConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "polling": { "interval_ms": 2500 }, "discovery": { "hid": false } }"#)
            .unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.polling.interval_ms, 2500);
        assert_eq!(config.polling.stream_read_timeout_ms, timing::STREAM_READ_TIMEOUT_MS);
        assert!(!config.discovery.hid);
        assert!(config.discovery.ftdi);
        assert_eq!(config.discovery.heatmaster, ProbeConfig::new(20, 10));
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = CoolwatchConfig::default();
        config.discovery.ignore_ports.push("/dev/ttyS0".to_string());
        config.logging.level = "debug".to_string();

        save_config_to(&config, &path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_config_from(&path).unwrap(), config);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = CoolwatchConfig::default();
        config.polling.interval_ms = 0;
        match config.validate() {
            Err(CoolwatchError::InvalidConfig { field, .. }) => {
                assert_eq!(field, "polling.interval_ms")
            }
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_range_probe_rejected() {
        let mut config = CoolwatchConfig::default();
        config.discovery.kraken.step_ms = limits::MAX_TIMEOUT_MS + 1;
        assert!(matches!(config.validate(), Err(CoolwatchError::InvalidConfig { .. })));

        let mut config = CoolwatchConfig::default();
        config.discovery.tbalancer.retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_stale_cycles_rejected() {
        let mut config = CoolwatchConfig::default();
        config.polling.stream_stale_cycles = 0;
        match config.validate() {
            Err(CoolwatchError::InvalidConfig { field, .. }) => {
                assert_eq!(field, "polling.stream_stale_cycles")
            }
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config_from(&path), Err(CoolwatchError::JsonParse(_))));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.json");
        assert!(matches!(load_config_from(&missing), Err(CoolwatchError::FileRead { .. })));
    }
}
