// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tidelog Daemon (tld)
//!
//! Owns the log directories, recovers them, and serves the WAL to
//! replicas and consensus peers until signalled.

use std::path::PathBuf;
use std::time::Duration;

use tl_daemon::{lifecycle, Config, LifecycleError};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => std::env::current_dir()?.join("tld.toml"),
    };

    // Load configuration
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tld: {}", e);
            return Err(e.into());
        }
    };

    // Write startup marker to log (before tracing setup, so tooling can find it)
    write_startup_marker(&config)?;

    // Set up logging
    let log_guard = setup_logging(&config)?;

    info!("Starting tld with {}", config_path.display());

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    // Recover, then wait for the WAL lock if another process holds it
    let startup = async {
        let mut daemon = lifecycle::startup(&config).await?;
        daemon.serve().await?;
        Ok::<_, LifecycleError>(daemon)
    };
    let daemon = tokio::select! {
        result = startup => match result {
            Ok(d) => d,
            Err(e) => {
                // Write error synchronously (tracing is non-blocking and may not flush in time)
                write_startup_error(&config, &e);
                error!(class = e.class().as_str(), "Failed to start daemon: {}", e);
                drop(log_guard);
                return Err(e.into());
            }
        },
        _ = sigterm.recv() => {
            info!("Received SIGTERM before startup finished");
            return Ok(());
        }
        _ = sigint.recv() => {
            info!("Received SIGINT before startup finished");
            return Ok(());
        }
    };

    info!(state = %daemon.state(), "Daemon ready");

    // Signal ready for a parent process waiting on startup
    println!("READY");

    let mut run_crc = ticker(config.run_crc_delay);
    let mut nop = ticker(config.nop_hb_delay);
    let mut snapshot = ticker(config.snapshot_interval);
    let mut status = ticker(Duration::from_secs(10));

    // Main loop
    loop {
        tokio::select! {
            _ = tick(&mut run_crc) => daemon.write_run_crc().await,
            _ = tick(&mut nop) => daemon.write_nop().await,
            _ = tick(&mut snapshot) => {
                daemon.snapshot().await;
            }
            _ = tick(&mut status) => daemon.report_status(),

            // Graceful shutdown on SIGTERM
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }

            // Graceful shutdown on SIGINT
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
        }
    }

    daemon.shutdown().await;
    info!("Daemon stopped");
    Ok(())
}

/// Periodic timer; `None` when the delay is zero
fn ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Startup marker prefix written to log before anything else.
/// Full format: "--- tld: starting (pid: 12345) ---"
pub const STARTUP_MARKER_PREFIX: &str = "--- tld: starting (pid: ";

/// Write startup marker to log file (appends to existing log)
fn write_startup_marker(config: &Config) -> Result<(), LifecycleError> {
    use std::io::Write;

    // Create log directory if needed
    if let Some(parent) = config.log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_path)?;
    writeln!(file, "{}{}) ---", STARTUP_MARKER_PREFIX, std::process::id())?;

    Ok(())
}

/// Write startup error synchronously to log file.
fn write_startup_error(config: &Config, error: &LifecycleError) {
    use std::io::Write;

    let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_path)
    else {
        return;
    };
    let _ = writeln!(file, "ERROR Failed to start daemon: {}", error);
}

fn setup_logging(
    config: &Config,
) -> Result<tracing_appender::non_blocking::WorkerGuard, LifecycleError> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let no_dir = || {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("bad log_path {}", config.log_path.display()),
        )
    };
    let dir = config.log_path.parent().ok_or_else(no_dir)?;
    let name = config.log_path.file_name().ok_or_else(no_dir)?;

    let file_appender = tracing_appender::rolling::never(dir, name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Set up subscriber with env filter
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking))
        .init();

    Ok(guard)
}
