//! Constants and configuration defaults for Coolwatch
//!
//! Timing defaults and limits live here; per-family wire constants (start
//! flags, offsets, USB IDs) live beside their decoders in `devices/`.

use std::time::Duration;

/// Filesystem locations
pub mod paths {
    use std::path::PathBuf;

    /// Directory name under the user config dir
    pub const CONFIG_DIR_NAME: &str = "coolwatch";

    /// Configuration file name
    pub const CONFIG_FILE: &str = "config.json";

    /// `<config_dir>/coolwatch`, `None` when the platform has no config dir
    pub fn user_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(CONFIG_DIR_NAME))
    }

    /// `<config_dir>/coolwatch/config.json`
    pub fn config_file() -> Option<PathBuf> {
        user_config_dir().map(|p| p.join(CONFIG_FILE))
    }
}

/// Timing defaults
pub mod timing {
    use super::Duration;

    /// Interval between `update_all` passes
    pub const UPDATE_INTERVAL_MS: u64 = 1000;

    /// Bounded wait of one background read
    pub const STREAM_READ_TIMEOUT_MS: u64 = 500;

    /// How long `close()` waits for a poller thread to exit
    pub const POLLER_JOIN_TIMEOUT_MS: u64 = 2000;

    /// Update passes without a new streamed report before its values are dropped
    pub const STREAM_STALE_CYCLES: u32 = 3;

    /// Interval between re-discovery passes (0 disables)
    pub const REDISCOVERY_INTERVAL_MS: u64 = 30_000;

    /// Queue-status polling step of the FTDI read loop
    pub const FTDI_QUEUE_POLL: Duration = Duration::from_millis(10);

    /// Timeout applied to a single request/response exchange on polled devices
    pub const EXCHANGE_TIMEOUT: Duration = Duration::from_millis(1000);
}

/// Validation limits for configuration values
pub mod limits {
    /// Shortest accepted update interval
    pub const MIN_UPDATE_INTERVAL_MS: u64 = 50;

    /// Longest accepted single read or probe step
    pub const MAX_TIMEOUT_MS: u64 = 10_000;

    /// Most probe retries a family may be configured with
    pub const MAX_PROBE_RETRIES: u32 = 50;
}

/// Logging defaults
pub mod logging {
    /// Env var overriding the configured filter
    pub const ENV_FILTER_VAR: &str = "COOLWATCH_LOG";

    /// Default level when neither env nor config set one
    pub const DEFAULT_LEVEL: &str = "info";

    pub const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
}
