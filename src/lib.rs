//! taskweave — a dynamic task-discovery runtime.
//!
//! A sequential program inserts tasks annotated with the data tiles they
//! read and write; the runtime infers dependencies from which tasks touch
//! the same tile, in which order, with which access mode, and executes the
//! discovered graph in parallel. Callers never declare an edge explicitly.
//!
//! Graph construction is throttled against execution: newly-ready tasks are
//! flushed to the scheduler in exponentially growing windows, and once too
//! many tasks are outstanding the inserting thread becomes an additional
//! worker until the backlog clears.
//!
//! # Example
//!
//! ```
//! use taskweave::{AccessMode, EngineConfig, TaskArgs, TaskStatus, Taskpool, TiledMatrix};
//!
//! fn touch(_args: &TaskArgs<'_>) -> TaskStatus {
//!     TaskStatus::Done
//! }
//!
//! let pool = Taskpool::new(EngineConfig::default());
//! let matrix = TiledMatrix::new(1, 2, 2, 16, 1);
//!
//! pool.task(touch, "producer")
//!     .tile(&matrix, (0, 0), AccessMode::Write)
//!     .insert()
//!     .unwrap();
//! pool.task(touch, "consumer")
//!     .tile(&matrix, (0, 0), AccessMode::Read)
//!     .insert()
//!     .unwrap();
//!
//! pool.wait();
//! ```

#![warn(rust_2018_idioms)]

pub mod class;
pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod registry;
pub mod sched;
pub mod task;
pub mod tile;

// Re-exports
pub use config::EngineConfig;
pub use engine::{TaskBuilder, Taskpool};
pub use error::EngineError;
pub use sched::{LaneScheduler, Scheduler, WorkerPool};
pub use task::{AccessMode, Task, TaskArgs, TaskBody, TaskId, TaskState, TaskStatus, MAX_FLOWS};
pub use tile::{DataDescriptor, DataHandle, Tile, TiledMatrix};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
