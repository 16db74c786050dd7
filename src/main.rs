//! wakestate - persistent state machine runtime
//!
//! Hosts registered machines on a two-priority pump with coalesced timers
//! and a field-diffing context store.

mod config;
mod heartbeat;

use clap::Parser;
use config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use wakestate_core::{MachineRegistry, Runtime};
use wakestate_queue::{ForegroundTracker, PumpHost, WorkQueue};
use wakestate_store::ContextStore;
use wakestate_timer::{Clock, CoarseTimer, ShortTimer, SystemClock, TimerManager};

#[derive(Parser, Debug)]
#[command(name = "wakestate")]
#[command(version, about = "Persistent state machine runtime")]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "WAKESTATE_CONFIG")]
    config: Option<PathBuf>,
}

/// Runs pump cycles on tokio's blocking pool.
struct TokioHost {
    handle: Handle,
}

impl PumpHost for TokioHost {
    fn request_pump(&self, queue: Arc<WorkQueue>) {
        self.handle.spawn_blocking(move || {
            queue.pump_once();
        });
    }
}

/// Drains queued transitions, stops every worker and syncs the store.
///
/// Both waits block, so they run on the blocking pool.
async fn shutdown(
    queue: &WorkQueue,
    registry: Arc<MachineRegistry>,
    store: Option<Arc<ContextStore>>,
    timeout: Duration,
) -> Result<(), JoinError> {
    let stop = queue.request_stop();
    let drained = tokio::task::spawn_blocking(move || stop.wait_timeout(timeout)).await?;
    if !drained {
        tracing::warn!("Pump did not drain within {}ms", timeout.as_millis());
    }

    tokio::task::spawn_blocking(move || registry.suspend_workers()).await?;

    if let Some(store) = &store {
        if let Err(e) = store.sync() {
            tracing::error!("Failed to sync store on shutdown: {}", e);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match Config::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        return Err(e.into());
    }

    tracing::info!("Starting wakestate");
    if let Some(path) = &args.config {
        tracing::info!("  Config file: {}", path.display());
    }

    let handle = Handle::current();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let timer_config = config.timers.timer_config();
    let timers = TimerManager::new(
        timer_config,
        clock.clone(),
        Arc::new(ShortTimer::new(clock.clone())),
        Arc::new(CoarseTimer::new(handle.clone(), clock, &timer_config)),
    );
    tracing::info!(
        "  Timers: short horizon {}ms, coarse granularity {}ms",
        timer_config.short_horizon_ms,
        timer_config.coarse_granularity_ms
    );

    let foreground = Arc::new(ForegroundTracker::new());
    foreground.add_listener(Arc::new(|foreground| {
        tracing::info!("Runtime foreground: {}", foreground);
    }));
    let queue = WorkQueue::new(Arc::new(TokioHost { handle }), foreground);

    let store = if config.storage.enabled {
        let store = ContextStore::open(config.storage.store_config())?;
        tracing::info!("  Store directory: {}", config.storage.store_dir().display());
        Some(Arc::new(store))
    } else {
        tracing::info!("  Store: disabled");
        None
    };

    let registry = Arc::new(MachineRegistry::new(Runtime::new(
        queue.clone(),
        timers,
        store.clone(),
        config.scheduler.engine_config(),
    )));

    if config.heartbeat.enabled {
        registry.register(
            heartbeat::definition(config.heartbeat.interval()),
            heartbeat::Heartbeat::default(),
        )?;
        tracing::info!("  Heartbeat: every {}ms", config.heartbeat.interval_ms);
    }

    queue.start();
    tracing::info!("Runtime started with {} machine(s)", registry.names().len());

    let shutdown_token = CancellationToken::new();
    {
        let shutdown_token = shutdown_token.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Received shutdown signal, stopping runtime...");
            shutdown_token.cancel();
        });
    }
    shutdown_token.cancelled().await;

    shutdown(&queue, registry, store, config.scheduler.stop_timeout()).await?;

    tracing::info!("Runtime stopped");
    Ok(())
}
