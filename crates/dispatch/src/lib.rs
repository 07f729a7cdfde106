//! Debouncing and dispatch of synchronization runs
//!
//! This crate provides:
//! - A per-key state table shared by the coalescer and the dispatcher
//! - Quiet-period debouncing of resolved events (one trigger per burst)
//! - Dispatch with at most one run in flight per key, a retrigger flag for
//!   changes arriving mid-run, and a fair global concurrency limit
//! - The process boundary (`CommandRunner`) and its `tokio::process` implementation
//! - A pipeline facade wiring resolver, coalescer and dispatcher together

pub mod debounce;
pub mod dispatcher;
pub mod pipeline;
pub mod runner;
pub mod state;

#[cfg(test)]
mod testing;

pub use debounce::{Coalescer, QuietPeriods, Submission};
pub use dispatcher::{DispatchStats, Dispatcher, Request};
pub use pipeline::{Pipeline, PipelineError};
pub use runner::{CommandRunner, Completion, Invocation, Outcome, ProcessRunner};
pub use state::{KeyPhase, KeySnapshot};
