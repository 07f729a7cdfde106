//! Mail store watching for mailwatch
//!
//! This crate provides:
//! - Per-directory watches below every account root, kept in step with
//!   maildir folders appearing and disappearing
//! - Capped exponential backoff for directories that cannot be watched
//! - Identity resolution (raw path -> account and folder)
//! - Built-in maildir ignore rules plus configured folder excludes
//! - Startup and periodic refresh requests

pub mod backoff;
pub mod ignore;
pub mod reconcile;
pub mod resolve;
pub mod source;

pub use crate::backoff::{Backoff, BackoffPolicy};
pub use crate::ignore::IgnoreRules;
pub use crate::reconcile::RefreshScheduler;
pub use crate::resolve::{IdentityResolver, IgnoreReason, Resolution};
pub use crate::source::WatchSource;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("invalid exclude pattern '{pattern}' for account '{account}': {source}")]
    Pattern {
        account: String,
        pattern: String,
        #[source]
        source: ::ignore::Error,
    },
}
