//! Engine configuration.
//!
//! All knobs are plain fields with defaults matching the reference behavior:
//! the window starts at 1 and doubles up to `window_max`, the throttle kicks
//! in above `threshold` outstanding tasks, and the registry tables are sized
//! with prime bucket counts. Every field can also be overridden from the
//! environment at process startup via `TASKWEAVE_*` variables.

use std::env;
use std::thread;

/// Configuration for one [`Taskpool`](crate::engine::Taskpool).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum task window size; the window starts at 1 and doubles after
    /// every flush until it reaches this cap.
    pub window_max: usize,
    /// Outstanding-task count above which the inserting thread starts
    /// executing ready tasks itself.
    pub threshold: usize,
    /// Number of execution lanes (worker slots). Tasks are assigned to lanes
    /// round-robin at insertion time.
    pub num_lanes: usize,
    /// Bucket count of the tile registry (prime recommended).
    pub tile_table_size: usize,
    /// Bucket count of the task-class registry.
    pub class_table_size: usize,
    /// Bucket count of the in-flight task registry (used when
    /// `track_tasks` is enabled).
    pub task_table_size: usize,
    /// Maximum number of distinct task classes per handle.
    pub max_task_classes: usize,
    /// Capacity of each task class's object pool.
    pub task_pool_capacity: usize,
    /// Capacity of the handle-wide tile pool.
    pub tile_pool_capacity: usize,
    /// Keep every in-flight task in the task registry, findable by id.
    pub track_tasks: bool,
    /// Log graph traversal events (task ready, task complete).
    pub log_traversal: bool,
    /// Log task-class construction.
    pub log_class_info: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let num_lanes = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            window_max: 2048,
            threshold: 2048,
            num_lanes,
            tile_table_size: 100_003,
            class_table_size: 97,
            task_table_size: 509,
            max_task_classes: 250,
            task_pool_capacity: 8192,
            tile_pool_capacity: 65536,
            track_tasks: false,
            log_traversal: false,
            log_class_info: false,
        }
    }
}

impl EngineConfig {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `TASKWEAVE_*` environment overrides to this configuration.
    pub fn apply_env(&mut self) {
        read_usize("TASKWEAVE_WINDOW_SIZE", &mut self.window_max);
        read_usize("TASKWEAVE_THRESHOLD_SIZE", &mut self.threshold);
        read_usize("TASKWEAVE_NUM_LANES", &mut self.num_lanes);
        read_usize("TASKWEAVE_TILE_TABLE_SIZE", &mut self.tile_table_size);
        read_usize("TASKWEAVE_TASK_TABLE_SIZE", &mut self.task_table_size);
        read_usize("TASKWEAVE_CLASS_TABLE_SIZE", &mut self.class_table_size);
        read_bool("TASKWEAVE_TRAVERSAL_INFO", &mut self.log_traversal);
        read_bool("TASKWEAVE_CLASS_INFO", &mut self.log_class_info);
    }
}

fn read_usize(name: &str, target: &mut usize) {
    if let Ok(value) = env::var(name) {
        if let Ok(parsed) = value.parse::<usize>() {
            *target = parsed;
        }
    }
}

fn read_bool(name: &str, target: &mut bool) {
    if let Ok(value) = env::var(name) {
        *target = matches!(value.as_str(), "1" | "true" | "yes");
    }
}
