//! Retry coordination
//!
//! - `policy`: strategies, profiles and the pure delay function
//! - `coordinator`: the retry loop, cancellation, metrics and history

mod coordinator;
mod policy;

pub use coordinator::{
    AttemptRecord, RetryCoordinator, RetryMetrics, RetryOutcome, RetryResult, RetrySession,
    SessionOutcome, HISTORY_CAPACITY,
};
pub use policy::{
    apply_jitter, compute_delay, next_delay, RetryConfig, RetryPredicate, RetryProfile,
    RetryStrategy,
};
