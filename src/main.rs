//! NPC Capture - Entry Point
//!
//! Spawns vehicles and pedestrians into a running simulation, follows one of
//! them with a camera while recording frames to disk, and removes everything
//! again on exit (including Ctrl+C).

use clap::Parser;
use npc_capture::core::config::RunConfig;
use npc_capture::core::error::{CaptureError, Result};
use npc_capture::engine::{RemoteEngine, SandboxEngine, SandboxSettings};
use npc_capture::session::{RunSummary, Session};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Spawn NPCs into the simulation and record a camera stream
#[derive(Parser, Debug)]
#[command(name = "npc-capture")]
#[command(about = "Spawn NPCs into the simulation and record a camera stream")]
struct Args {
    /// TOML config file (flags below override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// IP of the host server
    #[arg(long)]
    host: Option<String>,

    /// TCP port to connect to
    #[arg(short, long)]
    port: Option<u16>,

    /// Number of vehicles
    #[arg(short = 'n', long)]
    number_of_vehicles: Option<usize>,

    /// Number of walkers
    #[arg(short = 'w', long)]
    number_of_walkers: Option<usize>,

    /// Avoid spawning vehicles prone to accidents
    #[arg(long)]
    safe: bool,

    /// Vehicles filter
    #[arg(long)]
    filterv: Option<String>,

    /// Pedestrians filter
    #[arg(long)]
    filterw: Option<String>,

    /// Map to load before spawning
    #[arg(long)]
    map: Option<String>,

    /// Steady-state ticks to record
    #[arg(long)]
    ticks: Option<u64>,

    /// Ticks to discard while the camera settles
    #[arg(long)]
    warmup: Option<u64>,

    /// Directory for captured frames
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Random seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Use the built-in sandbox engine instead of a simulator
    #[arg(long)]
    sandbox: bool,
}

impl Args {
    fn apply(&self, config: &mut RunConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(map) = &self.map {
            config.server.map = map.clone();
        }
        if let Some(n) = self.number_of_vehicles {
            config.vehicles.count = n;
        }
        if let Some(w) = self.number_of_walkers {
            config.walkers.count = w;
        }
        if self.safe {
            config.vehicles.safe = true;
        }
        if let Some(filter) = &self.filterv {
            config.vehicles.filter = filter.clone();
        }
        if let Some(filter) = &self.filterw {
            config.walkers.filter = filter.clone();
        }
        if let Some(ticks) = self.ticks {
            config.capture.ticks = ticks;
        }
        if let Some(warmup) = self.warmup {
            config.capture.warmup_ticks = warmup;
        }
        if let Some(dir) = &self.output_dir {
            config.capture.output_dir = dir.clone();
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
    }
}

fn main() {
    // Initialize tracing for logging
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "npc_capture=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    let args = Args::parse();
    let failed = match run(&args) {
        Ok(summary) => {
            tracing::info!(?summary, "run finished");
            false
        }
        Err(CaptureError::Interrupted) => {
            tracing::info!("interrupted, population released");
            false
        }
        Err(e) => {
            tracing::error!("{}", e);
            true
        }
    };

    println!("\ndone.");
    if failed {
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<RunSummary> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    // Runtime for the interrupt watcher and the remote engine's HTTP calls
    let rt = Runtime::new()?;
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    rt.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing current step");
            flag.store(true, Ordering::SeqCst);
        }
    });

    if args.sandbox {
        let engine = SandboxEngine::new(SandboxSettings {
            seed: config.seed.unwrap_or_default(),
            ..Default::default()
        });
        let session = Session::new(&engine, config, cancel);
        session.run()
    } else {
        let engine = RemoteEngine::from_config(&config.server, rt.handle().clone())?;
        let session = Session::new(&engine, config, cancel);
        session.run()
    }
}
