//! Error types for the task-discovery engine.
//!
//! Only configuration and resource errors are surfaced as [`EngineError`]
//! values. Violations of the engine's own bookkeeping invariants (a task body
//! returning an unexpected status, a tile reference-count underflow) indicate
//! corrupted state that cannot be safely continued and abort the run with a
//! panic instead.

use thiserror::Error;

/// Errors surfaced by task insertion and handle construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The fixed-size task-class table is full.
    #[error("task class table is full ({limit} classes)")]
    TooManyTaskClasses {
        /// Configured maximum number of distinct task classes.
        limit: usize,
    },

    /// A fixed-capacity object pool cannot satisfy another allocation.
    #[error("{pool} pool exhausted (capacity {capacity})")]
    PoolExhausted {
        /// Name of the exhausted pool.
        pool: &'static str,
        /// Configured pool capacity.
        capacity: usize,
    },

    /// A task declared more data flows than the engine supports.
    #[error("task declares {declared} data flows, at most {max} are supported")]
    TooManyFlows {
        /// Number of data flows the insertion supplied.
        declared: usize,
        /// Fixed upper bound on flows per task.
        max: usize,
    },
}
