//! Pipeline: watch source -> identity resolver -> coalescer -> dispatcher
//!
//! Raw events and direct requests arrive on two channels and are handled
//! in arrival order by a single task, so events for one key are never
//! reordered.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use mailwatch_core::{Config, ConfigError, RawEvent, SyncKey};
use mailwatch_watcher::{IdentityResolver, Resolution, WatchError};

use crate::debounce::{Coalescer, QuietPeriods, Submission};
use crate::dispatcher::{Dispatcher, Request};
use crate::runner::CommandRunner;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Watch(#[from] WatchError),
}

pub struct Pipeline {
    resolver: IdentityResolver,
    coalescer: Coalescer,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

impl Pipeline {
    /// Build the resolver, coalescer and dispatcher for a configuration
    pub fn from_config(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) -> Result<Self, PipelineError> {
        let resolver = IdentityResolver::new(config)?;
        let dispatcher = Dispatcher::new(
            config.command.template()?,
            config.daemon.max_concurrency,
            runner,
            shutdown.clone(),
            tracker,
        );
        let coalescer = Coalescer::new(
            dispatcher.clone(),
            QuietPeriods::from_config(config),
            config.daemon.max_burst(),
        );

        Ok(Self {
            resolver,
            coalescer,
            dispatcher,
            shutdown,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Resolve one raw event and feed it to the coalescer
    ///
    /// Account-wide events (overflow) skip the quiet period. Returns `None`
    /// for ignored paths, which leave all key state untouched.
    pub fn handle_event(&self, event: &RawEvent) -> Option<Submission> {
        match self.resolver.resolve(event) {
            Resolution::Resolved(resolved) if resolved.key.is_account_wide() => {
                info!(account = %resolved.key.account, "Events were lost, syncing whole account");
                Some(match self.dispatcher.request(resolved.key) {
                    Request::Queued => Submission::Created,
                    Request::Absorbed => Submission::Absorbed,
                    Request::Retrigger => Submission::Retrigger,
                    Request::Rejected => Submission::Rejected,
                })
            }
            Resolution::Resolved(resolved) => Some(self.coalescer.submit(resolved)),
            Resolution::Ignored(reason) => {
                debug!(path = %event.path.display(), %reason, "Ignored event");
                None
            }
        }
    }

    pub fn request(&self, key: SyncKey) -> Request {
        self.dispatcher.request(key)
    }

    /// Consume both channels until shutdown or until both are closed
    pub async fn run(self, mut events: mpsc::Receiver<RawEvent>, mut requests: mpsc::Receiver<SyncKey>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(event) = events.recv() => {
                    self.handle_event(&event);
                }
                Some(key) = requests.recv() => {
                    self.request(key);
                }
                else => break,
            }
        }

        let stats = self.dispatcher.stats();
        info!(
            triggers = stats.triggers,
            requests = stats.requests,
            started = stats.started,
            succeeded = stats.succeeded,
            failed = stats.failed,
            retriggered = stats.retriggered,
            "Pipeline stopped"
        );
    }
}
