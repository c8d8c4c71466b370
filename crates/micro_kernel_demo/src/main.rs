//! Micro Kernel Demo
//!
//! Hosts one "basic" plugin and a row of "alarm" plugins. The basic plugin
//! greets the first alarm every cycle and streams chunks to it; every alarm
//! cycles on the shared worker pool.

mod alarm;
mod basic;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use micro_kernel::{MicroKernel, MicroKernelConfig, ThreadPool, WorkerPool};

use alarm::AlarmPlugin;
use basic::BasicPlugin;

/// Domain of the basic plugin
pub const BASIC_DOMAIN: u32 = 0;
/// Domain of the first alarm plugin; further alarms follow it
pub const ALARM_DOMAIN: u32 = 1;

/// Micro kernel demo host
#[derive(Parser, Debug)]
#[command(name = "micro_kernel_demo")]
#[command(about = "Runs basic and alarm plugins on the micro kernel", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of alarm plugins to register
    #[arg(long, default_value = "99")]
    alarms: u32,

    /// Seconds to run before shutting down
    #[arg(long, default_value = "3")]
    run_for: u64,

    /// Pause between scheduling scans in milliseconds
    #[arg(long)]
    cycle_interval_ms: Option<u64>,

    /// Number of worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let registry = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("micro_kernel=info,micro_kernel_demo=info")),
    );
    if args.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("Starting micro kernel demo v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => MicroKernelConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MicroKernelConfig::default(),
    };
    if let Some(ms) = args.cycle_interval_ms {
        config.kernel.cycle_interval_ms = ms;
    }
    if let Some(workers) = args.workers {
        config.pool = config.pool.with_worker_threads(workers);
    }
    config.validate()?;

    let pool = Arc::new(WorkerPool::with_config(&config.pool)?);
    let kernel: Arc<MicroKernel<u32>> = Arc::new(MicroKernel::with_config(
        &config.kernel,
        Arc::clone(&pool) as Arc<dyn ThreadPool>,
    )?);

    kernel.register(Arc::new(BasicPlugin::new()))?;
    for domain in ALARM_DOMAIN..ALARM_DOMAIN + args.alarms {
        if let Err(e) = kernel.register(Arc::new(AlarmPlugin::new(domain))) {
            warn!(domain, error = %e, "Skipping alarm plugin");
        }
    }

    let runner = {
        let kernel = Arc::clone(&kernel);
        thread::Builder::new()
            .name("micro-kernel-control".to_string())
            .spawn(move || kernel.run())
            .context("spawning control thread")?
    };

    thread::sleep(Duration::from_secs(args.run_for));

    info!("Shutting down...");
    kernel.shutdown();
    match runner.join() {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("control thread panicked"),
    }

    info!(plugins = kernel.plugin_count(), "Demo finished");
    drop(kernel);
    pool.stop();

    Ok(())
}
