//! Operator tool for Bluetooth serial weighing scales.

use anyhow::Context;
use clap::{Parser, Subcommand};
use scale_link::domain::models::{ConnectionState, ScaleEvent};
use scale_link::domain::settings::SettingsService;
use scale_link::infrastructure::link::VIRTUAL_SCALE_ID;
use scale_link::infrastructure::logging::init_logger;
use scale_link::ScaleService;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "scale-link")]
#[command(about = "Connect to Bluetooth weighing scales and read weights")]
struct Cli {
    /// Use the virtual scale instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    /// Settings file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List devices that look like scales
    Scan {
        /// Also run live discovery, not just paired devices
        #[arg(short, long)]
        nearby: bool,
        /// Show every device, not only scale candidates
        #[arg(short, long)]
        all: bool,
    },
    /// Connect and print weights until Ctrl-C
    Watch {
        /// Device id (port or address); defaults to the last connected scale
        device: Option<String>,
        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// Connect, lock the current weight and run a mock transaction
    LockDemo {
        device: Option<String>,
        /// How long to wait for a lockable weight
        #[arg(short, long, default_value = "15")]
        timeout: u64,
    },
    /// Mark an address as a scale
    Approve { address: String },
    /// Remove an address from the approved scales
    Revoke { address: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => SettingsService::with_path(path.clone()),
        None => SettingsService::new()?,
    };
    let _log_guard = init_logger(&settings.get().log_settings)?;
    info!(path = %settings.path().display(), "Settings loaded");

    let settings = Arc::new(Mutex::new(settings));
    let service = ScaleService::from_settings(settings, cli.simulate);

    match cli.command {
        Commands::Scan { nearby, all } => scan(&service, nearby, all).await?,
        Commands::Watch { device, seconds } => {
            connect(&service, device).await?;
            watch(&service, seconds.map(Duration::from_secs)).await;
            service.disconnect(true).await;
        }
        Commands::LockDemo { device, timeout } => {
            connect(&service, device).await?;
            let outcome = lock_demo(&service, Duration::from_secs(timeout)).await;
            service.disconnect(true).await;
            outcome?;
        }
        Commands::Approve { address } => {
            service.approve(&address)?;
            println!("Approved {}", address.to_uppercase());
        }
        Commands::Revoke { address } => {
            service.revoke(&address)?;
            println!("Revoked {}", address.to_uppercase());
        }
    }

    Ok(())
}

async fn scan(service: &ScaleService, nearby: bool, all: bool) -> anyhow::Result<()> {
    if all {
        let devices = service.scan(nearby).await?;
        println!("Found {} devices:", devices.len());
        for d in devices {
            let rssi = d
                .signal_strength
                .map(|r| format!("{} dBm", r))
                .unwrap_or_else(|| "N/A".to_string());
            let marker = if d.approved_as_scale { " [APPROVED]" } else { "" };
            println!("  {} ({}) RSSI: {}{}", d.display_name(), d.id, rssi, marker);
        }
        return Ok(());
    }

    let candidates = service.scan_scales(nearby).await?;
    if candidates.is_empty() {
        println!("No scales found. Pair the scale first, or approve it with `scale-link approve`.");
        return Ok(());
    }
    println!("Found {} scale candidates:", candidates.len());
    for c in candidates {
        let paired = if c.device.is_paired { "paired" } else { "nearby" };
        println!(
            "  {} ({}) {} - {:?}",
            c.device.display_name(),
            c.device.id,
            paired,
            c.reason
        );
    }
    Ok(())
}

async fn connect(service: &ScaleService, device: Option<String>) -> anyhow::Result<()> {
    let device = match device {
        Some(id) => service.connect(&id).await,
        None if service.link_kind() == "simulated" => service.connect(VIRTUAL_SCALE_ID).await,
        None => service.connect_last().await,
    };

    match device {
        Ok(d) => {
            println!("Connected to {} ({})", d.display_name(), d.id);
            Ok(())
        }
        Err(e) => anyhow::bail!("could not connect ({}): {}. {}", e.code(), e, e.remediation()),
    }
}

async fn watch(service: &ScaleService, limit: Option<Duration>) {
    let mut events = service.subscribe();
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Some(ScaleEvent::Weight(r)) => {
                    let marker = if r.is_stable() { "" } else { " (unstable)" };
                    println!("{:>8.2} kg{}", r.value_kg(), marker);
                }
                Some(ScaleEvent::Status(s)) => {
                    println!("[{}] {}", s.state, s.message);
                    if s.state == ConnectionState::Failed {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

async fn lock_demo(service: &ScaleService, timeout: Duration) -> anyhow::Result<()> {
    let started = tokio::time::Instant::now();
    let locked = loop {
        match service.lock() {
            Ok(kg) => break kg,
            Err(e) if started.elapsed() >= timeout => {
                return Err(e).context("no lockable weight arrived");
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(250)).await,
        }
    };
    println!("Locked at {:.2} kg", locked);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let submitted = service.begin_submission()?;
    let recorded = service.submission_weight(Some(locked));
    if recorded != Some(submitted) {
        warn!(?recorded, submitted, "Submission weight drifted");
    }
    println!("Transaction recorded {:.2} kg", submitted);
    service.finish_submission();

    if let Some(latest) = service.latest_weight() {
        println!("Scale now reads {:.2} kg", latest.value_kg());
    }
    Ok(())
}
