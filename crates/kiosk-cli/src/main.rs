//! `kiosk-cli` – Parcel Bridge Command Line Interface
//!
//! This binary wires the locker controller to the kiosk's MQTT broker.  It:
//!
//! 1. Resolves configuration (defaults → `~/.parcel-bridge/config.toml` →
//!    environment → flags).
//! 2. Opens the controller's serial port with a short read timeout.
//! 3. Starts the [`HandshakeBridge`] reader thread, then connects to the
//!    broker and dispatches ready events to the bridge.
//! 4. Intercepts **Ctrl-C** / SIGTERM to stop the reader, wind down the bus
//!    loop, and only then close the serial port.
//!
//! A fatal serial read error ends the process with a non-zero exit code so a
//! supervisor (systemd, Docker) can restart it.

mod cli;
mod config;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{error, info, warn};

use kiosk_hal::{NativeSerial, SerialChannel};
use kiosk_middleware::{HandshakeBridge, MqttBus};
use kiosk_types::KioskError;

use crate::cli::Cli;
use crate::config::Config;

/// How long the bus loop gets to wind down after the reader has exited.
const DRIVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = telemetry::init_tracing("parcel-bridge", cli.debug);

    print_banner();

    let (cfg, path) = match config::resolve(&cli) {
        Ok(resolved) => resolved,
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            return ExitCode::from(2);
        }
    };

    if cli.save_config {
        return match config::save_to(&cfg, &path) {
            Ok(()) => {
                println!(
                    "  {} Config saved to {}",
                    "✓".green().bold(),
                    path.display().to_string().bold()
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                println!("{}: {}", "Error saving config".red(), e);
                ExitCode::FAILURE
            }
        };
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("parcel-bridge")
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg)) {
        Ok(()) => {
            println!("{}", "  ✓ Exiting parcel-bridge.".green());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, fatal = e.is_fatal(), "bridge terminated");
            println!("{}: {}", "Bridge error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: Config) -> Result<(), KioskError> {
    let serial: Arc<dyn SerialChannel> = Arc::new(NativeSerial::open(&cfg.serial)?);
    let (bus, driver) = MqttBus::new(&cfg.mqtt)?;
    let bridge = HandshakeBridge::new(cfg.bridge.clone(), Arc::clone(&serial), Arc::new(bus.clone()))?;

    let reader = bridge.start(Handle::current())?;

    // ── Shutdown wiring ──────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    {
        let stopper = reader.stop_handle();
        let shutdown_tx = Arc::clone(&shutdown_tx);
        if let Err(e) = ctrlc::set_handler(move || {
            println!();
            println!("{}", "⚠  Shutdown requested – stopping serial reader …".yellow().bold());
            stopper.stop();
            let _ = shutdown_tx.send(true);
        }) {
            warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
        }
    }

    let mut driver_task = tokio::spawn(driver.run(Arc::new(bridge.clone()), shutdown_rx));

    info!(
        broker = %format!("{}:{}", cfg.mqtt.host, cfg.mqtt.port),
        serial = %format!("{}@{}", cfg.serial.port, cfg.serial.baud),
        ready_topic = %cfg.bridge.ready_topic,
        completion_topic = %cfg.bridge.completion_topic,
        "running; Ctrl-C to exit"
    );
    println!(
        "  Running. MQTT={}:{}, serial={}@{}. {}",
        cfg.mqtt.host,
        cfg.mqtt.port,
        cfg.serial.port,
        cfg.serial.baud,
        "Ctrl-C to exit.".dimmed()
    );

    // The reader only returns once stopped or after a fatal read error.
    let outcome = tokio::task::spawn_blocking(move || reader.join())
        .await
        .map_err(|e| KioskError::Channel(format!("reader join task failed: {e}")))?;

    if let Err(e) = bus.disconnect().await {
        warn!(error = %e, "mqtt disconnect request failed");
    }
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(DRIVER_SHUTDOWN_GRACE, &mut driver_task).await.is_err() {
        warn!("mqtt driver did not stop within the grace period; aborting it");
        driver_task.abort();
    }

    // Reader joined: the serial port can be closed safely.
    drop(bridge);
    drop(serial);
    info!("serial port released");

    outcome
}

fn print_banner() {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║        Parcel Kiosk Bridge           ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!(
        "  {} {}",
        "parcel-bridge".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  box_delivered → controller → all_done");
    println!();
}
