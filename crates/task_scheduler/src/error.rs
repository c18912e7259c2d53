//! Error types for the scheduler's few genuinely recoverable failure modes.
//!
//! Everything else the scheduler can encounter (double-submit, joining a
//! cycle, calling `wait_idle(Main)` off the main thread) is a programming
//! error and is handled by assertion, not by a `Result` — see the crate's
//! top-level docs for the reasoning.

/// Crate-local `Result` alias, matching the rest of this codebase's channel
/// and executor error modules.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors the scheduler surfaces through its public API.
#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    /// The sync-block pool has no free handles left. This is a fatal
    /// configuration error (the pool is sized once, statically, at
    /// construction) rather than a transient runtime condition.
    #[error("sync-block pool exhausted: all {capacity} handles are in use")]
    SyncBlockPoolExhausted {
        /// The pool's static capacity.
        capacity: usize,
    },

    /// The scheduler was asked to construct itself with an invalid
    /// configuration (e.g. a zero-sized sync-block pool, or a worker count
    /// of zero with no RHI/Render threads to pick up the slack).
    #[error("invalid scheduler configuration: {reason}")]
    InvalidConfiguration {
        /// Human-readable description of what was wrong.
        reason: String,
    },
}
