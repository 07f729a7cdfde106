//! Daemon lifecycle management

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use mailwatch_core::Config;
use mailwatch_dispatch::{CommandRunner, DispatchStats, Dispatcher, Pipeline, ProcessRunner};
use mailwatch_watcher::{BackoffPolicy, RefreshScheduler, WatchSource};

/// A running watch pipeline
///
/// Every task it spawns (root watchers, the scheduler, the pipeline loop,
/// quiet timers and sync runs) is tracked, so `shutdown` can wait for all
/// of them.
pub struct Daemon {
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    grace: Duration,
}

impl Daemon {
    /// Start watching with the configured sync command
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &Config) -> Result<Self> {
        let runner = Arc::new(ProcessRunner::new(config.command.timeout()));
        Self::start_with_runner(config, runner)
    }

    pub fn start_with_runner(config: &Config, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let pipeline = Pipeline::from_config(config, runner, shutdown.clone(), tracker.clone())
            .context("Failed to set up the sync pipeline")?;
        let dispatcher = pipeline.dispatcher().clone();

        let capacity = config.daemon.channel_capacity;
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (request_tx, request_rx) = mpsc::channel(capacity);

        let roots = pipeline
            .resolver()
            .roots()
            .map(|(_, root)| root.to_path_buf())
            .collect();
        WatchSource::new(roots, BackoffPolicy::from(&config.watch), capacity).spawn(
            event_tx,
            shutdown.clone(),
            &tracker,
        );

        let scheduler = RefreshScheduler::from_config(config, request_tx);
        if scheduler.is_active() {
            tracker.spawn(scheduler.run(shutdown.clone()));
        }

        // A pipeline that ends before shutdown leaves nothing listening; stop the daemon
        let pipeline_task = tokio::spawn(pipeline.run(event_rx, request_rx));
        let stopped = shutdown.clone();
        tracker.spawn(async move {
            match pipeline_task.await {
                Err(err) => error!(error = %err, "Sync pipeline crashed"),
                Ok(()) if !stopped.is_cancelled() => error!("Sync pipeline stopped unexpectedly"),
                Ok(()) => return,
            }
            stopped.cancel();
        });

        info!(
            accounts = config.accounts.len(),
            max_concurrency = config.daemon.max_concurrency,
            quiet_period_ms = config.daemon.quiet_period_ms,
            "Daemon started"
        );

        Ok(Self {
            dispatcher,
            shutdown,
            tracker,
            grace: config.daemon.shutdown_grace(),
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Run until SIGINT or SIGTERM, then shut down
    ///
    /// Fails if the daemon stopped on its own because the pipeline died.
    pub async fn run_until_signal(self) -> Result<bool> {
        let died = tokio::select! {
            signalled = wait_for_signal() => {
                signalled?;
                false
            }
            _ = self.shutdown.cancelled() => true,
        };

        let clean = self.shutdown().await;
        if died {
            bail!("Sync pipeline stopped unexpectedly");
        }
        Ok(clean)
    }

    /// Stop accepting triggers and wait for in-flight syncs
    ///
    /// Running commands are sent SIGTERM. Returns false if tasks were still
    /// running when the grace period ran out; those children are killed
    /// when the runtime drops them.
    pub async fn shutdown(self) -> bool {
        info!(
            active = self.dispatcher.active_keys(),
            grace_secs = self.grace.as_secs(),
            "Shutting down"
        );
        self.shutdown.cancel();
        self.tracker.close();

        match tokio::time::timeout(self.grace, self.tracker.wait()).await {
            Ok(()) => {
                info!("Shutdown complete");
                true
            }
            Err(_) => {
                warn!(
                    remaining = self.tracker.len(),
                    "Grace period expired with tasks still running"
                );
                false
            }
        }
    }
}

async fn wait_for_signal() -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = interrupt.recv() => info!(signal = "SIGINT", "Received signal"),
        _ = terminate.recv() => info!(signal = "SIGTERM", "Received signal"),
    }
    Ok(())
}
