//! Daemon plumbing for the `mailwatch` binary
//!
//! The binary's subcommands live in `main.rs`; the pieces other code (and
//! the integration tests) need are exposed here:
//! - `Daemon`: start the watch pipeline and shut it down gracefully
//! - `DaemonLock`: one daemon per user
//! - `logging`: tracing subscriber setup

pub mod daemon;
pub mod locks;
pub mod logging;

pub use daemon::Daemon;
pub use locks::DaemonLock;
