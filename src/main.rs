//! growctld — greenhouse control daemon.
//!
//! Hexagonal architecture on a single cooperative control thread.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  SysfsPins / SimulatedPins   ShellRunner    LogEventSink       │
//! │  (PinDriver)                 (Commands)     (EventSink)        │
//! │  LogNotifier / Smtp          JsonFileStore  MonotonicClock     │
//! │  (Notifier)                  (ConfigPort)   (Clock)            │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │              ControlCore (domain)                      │    │
//! │  │  Arbitrator · PID · Rules · Timers                     │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! │                                                                │
//! │  Runtime (edge-executor) ◀── ControlServer (Unix socket)       │
//! └────────────────────────────────────────────────────────────────┘
//! ```
#![deny(unused_must_use)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};

use growctl::adapters::config_file::JsonFileStore;
use growctl::adapters::control_socket::ControlServer;
use growctl::adapters::gpio::SysfsPins;
use growctl::adapters::log_sink::LogEventSink;
use growctl::adapters::notify::{LogNotifier, SmtpNotifier};
use growctl::adapters::shell::ShellRunner;
use growctl::adapters::sim::SimulatedPins;
use growctl::adapters::time::MonotonicClock;
use growctl::app::ports::{ConfigError, ConfigPort, Notifier, PinDriver};
use growctl::app::service::{ControlCore, CoreSettings};
use growctl::cache::ReadingCache;
use growctl::config::{DaemonConfig, PinBackend};
use growctl::runtime::Runtime;

const DEFAULT_CONFIG: &str = "/etc/growctl/growctld.json";

fn config_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    let mut path = PathBuf::from(DEFAULT_CONFIG);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                path = args
                    .next()
                    .map(PathBuf::from)
                    .ok_or_else(|| anyhow!("{} needs a path", arg))?;
            }
            "-h" | "--help" => {
                println!("usage: growctld [--config <path>]");
                std::process::exit(0);
            }
            other => bail!("unknown argument '{}'", other),
        }
    }
    Ok(path)
}

fn load_config(path: &Path) -> Result<DaemonConfig> {
    match DaemonConfig::from_file(path) {
        Ok(cfg) => {
            info!("Config loaded from {}", path.display());
            Ok(cfg)
        }
        Err(ConfigError::NotFound) => {
            warn!("{} not found, using defaults", path.display());
            Ok(DaemonConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

// ── Main ──────────────────────────────────────────────────────

fn main() -> Result<()> {
    // ── 1. Logging ────────────────────────────────────────────
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("╔══════════════════════════════════════╗");
    info!("║  growctld v{}                        ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    // ── 2. Daemon config + entity snapshot ────────────────────
    let config = load_config(&config_path()?)?;
    let store = JsonFileStore::new(&config.snapshot_path);
    let snapshot = store
        .load()
        .with_context(|| format!("loading snapshot {}", config.snapshot_path.display()))?;

    // ── 3. Adapters ───────────────────────────────────────────
    let pins: Box<dyn PinDriver> = match config.pin_backend {
        PinBackend::Sysfs => Box::new(SysfsPins::new(&config.gpio_root)),
        PinBackend::Simulated => {
            warn!("Simulated pins: no relay will physically switch");
            Box::new(SimulatedPins::new())
        }
    };
    let notifier: Box<dyn Notifier> = match &config.smtp {
        Some(smtp) => Box::new(
            SmtpNotifier::new(smtp)
                .map_err(|e| anyhow!("{}", e))
                .with_context(|| format!("SMTP relay {}:{}", smtp.host, smtp.port))?,
        ),
        None => Box::new(LogNotifier),
    };
    let cache = ReadingCache::new();
    let clock = MonotonicClock::new();

    // ── 4. Core + runtime ─────────────────────────────────────
    let core = ControlCore::new(
        pins,
        ShellRunner::default(),
        notifier,
        LogEventSink::new(),
        cache.clone(),
        CoreSettings::from(&config),
    );
    let runtime = Runtime::new(
        core,
        clock,
        store,
        Duration::from_millis(config.deadline_resolution_ms),
    );

    // ── 5. Control socket ─────────────────────────────────────
    ControlServer::bind(&config.socket_path, cache, runtime.handle(), clock)
        .with_context(|| format!("binding {}", config.socket_path.display()))?
        .spawn()
        .context("starting control server")?;

    // ── 6. Run until `shutdown` ───────────────────────────────
    runtime.run(snapshot);
    info!("growctld exiting");
    Ok(())
}
