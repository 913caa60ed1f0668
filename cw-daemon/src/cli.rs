//! Command Line Interface

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "coolwatchd")]
#[command(version)]
#[command(about = "Coolwatch - live telemetry from coolers, fan controllers and GPUs")]
#[command(long_about = "Coolwatch - live telemetry from coolers, fan controllers and GPUs

Discovers T-Balancer and Heatmaster fan controllers, Kraken liquid coolers
and NVIDIA/AMD GPUs, then polls them until interrupted.

EXAMPLES:
    coolwatchd                         Poll every second, log readings
    coolwatchd --once --json           Print one JSON line per device and exit
    coolwatchd --interval-ms 250       Poll four times per second

ENVIRONMENT VARIABLES:
    COOLWATCH_LOG=debug    Log filter (overrides logging.level)

FILES:
    ~/.config/coolwatch/config.json    Discovery and polling configuration")]
pub struct Cli {
    /// Configuration file (default: ~/.config/coolwatch/config.json)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the polling interval
    #[arg(short, long, value_name = "MS")]
    pub interval_ms: Option<u64>,

    /// Run a single update pass and exit
    #[arg(long)]
    pub once: bool,

    /// Print snapshots as JSON lines on stdout
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let cli = Cli::parse_from(["coolwatchd", "--once", "--json", "-i", "250"]);
        assert!(cli.once && cli.json);
        assert_eq!(cli.interval_ms, Some(250));
        assert!(cli.config.is_none());
    }
}
