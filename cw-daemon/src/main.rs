//! Coolwatch Daemon (coolwatchd)
//!
//! Discovers cooling hardware once at startup, then polls every device on a
//! fixed interval until interrupted. Disconnected devices are pruned and the
//! registry is rescanned on the configured rediscovery interval.
//!
//! # Lifecycle
//! - **Startup**: load configuration, initialise logging, install handlers
//! - **Discover**: FTDI, serial, HID, NVIDIA and AMD scans
//! - **Poll**: `update_all` then emit every snapshot
//! - **Shutdown**: every device is closed exactly once

mod cli;
mod report;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info, warn};

use cw_core::constants::logging::ENV_FILTER_VAR;
use cw_core::{load_config, load_config_from, Backends, CoolwatchConfig, Registry};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Global shutdown flag for clean termination
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Granularity of the interruptible sleep between passes
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

// ============================================================================
// Startup
// ============================================================================

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        // stderr is captured by the journal when running as a service
        eprintln!("PANIC at {}: {}", location, message);
    }));
}

/// Install the tracing subscriber; returns whether the journal is used
fn init_logging(filter: &str) -> bool {
    use tracing_subscriber::prelude::*;

    if std::path::Path::new("/run/systemd/journal/socket").exists() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(filter))
                    .init();
                return true;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();
    false
}

fn load(args: &cli::Cli) -> anyhow::Result<CoolwatchConfig> {
    let mut config = match &args.config {
        Some(path) => load_config_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => load_config().context("loading configuration")?,
    };
    if let Some(interval_ms) = args.interval_ms {
        config.polling.interval_ms = interval_ms;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

// ============================================================================
// Polling Loop
// ============================================================================

/// Sleep for `duration`, waking early on shutdown
fn sleep_interruptible(duration: Duration) {
    let deadline = Instant::now() + duration;
    while !SHUTDOWN.load(Ordering::SeqCst) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(remaining.min(SHUTDOWN_POLL));
    }
}

fn run(registry: &mut Registry, args: &cli::Cli) {
    let interval = registry.config().polling.interval();
    let rediscovery = registry.config().polling.rediscovery_interval();
    let mut last_discovery = Instant::now();
    let mut lost_devices = 0usize;

    loop {
        let started = Instant::now();
        registry.update_all();
        report::emit(registry.devices(), args.json);

        if args.once || SHUTDOWN.load(Ordering::SeqCst) {
            break;
        }

        lost_devices += registry.remove_disconnected();
        if let Some(every) = rediscovery {
            let due = last_discovery.elapsed() >= every;
            if due && (lost_devices > 0 || registry.is_empty()) {
                info!("Rescanning hardware ({} device(s) lost)", lost_devices);
                registry.discover();
                last_discovery = Instant::now();
                lost_devices = 0;
            }
        }

        let elapsed = started.elapsed();
        if elapsed > interval {
            debug!("Update pass took {:?} (interval {:?})", elapsed, interval);
        }
        sleep_interruptible(interval.saturating_sub(elapsed));
        if SHUTDOWN.load(Ordering::SeqCst) {
            break;
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> anyhow::Result<()> {
    install_panic_hook();
    let args = cli::Cli::parse();
    let config = load(&args)?;

    let filter = std::env::var(ENV_FILTER_VAR).unwrap_or_else(|_| config.logging.level.clone());
    let journald = init_logging(&filter);

    info!("STARTUP: coolwatchd {} starting", VERSION);
    info!("STARTUP: Logging to {}", if journald { "systemd journal" } else { "stdout" });
    debug!("STARTUP: Configuration {:?}", config);

    if let Err(e) = ctrlc::set_handler(|| {
        SHUTDOWN.store(true, Ordering::SeqCst);
    }) {
        warn!("Failed to set signal handler: {}. Shutdown via signals may not work cleanly.", e);
    }

    let backends = Backends::system();
    debug!("STARTUP: Backends {:?}", backends);
    let mut registry = Registry::new(config, backends);
    let found = registry.discover().len();
    if found == 0 {
        warn!("No supported devices found");
    }

    run(&mut registry, &args);

    info!("SHUTDOWN: Closing {} device(s)", registry.len());
    registry.dispose_all();
    info!("SHUTDOWN: coolwatchd terminated gracefully");
    Ok(())
}
