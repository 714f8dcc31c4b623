//! Engine scenario and property tests.
//!
//! Covers the dependency resolver, the readiness state machine, the windowed
//! flush policy, and the throttle, driven deterministically through a
//! recording scheduler or end to end through `wait()`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::engine::Taskpool;
use crate::error::EngineError;
use crate::sched::{LaneScheduler, Scheduler};
use crate::task::{AccessMode, Task, TaskArgs, TaskId, TaskState, TaskStatus};
use crate::tile::TiledMatrix;

fn noop(_args: &TaskArgs<'_>) -> TaskStatus {
    TaskStatus::Done
}

fn single_lane_config() -> EngineConfig {
    EngineConfig {
        num_lanes: 1,
        track_tasks: true,
        ..EngineConfig::default()
    }
}

/// Wraps the default scheduler, recording every batch handed over.
#[derive(Debug)]
struct RecordingScheduler {
    inner: LaneScheduler,
    batches: Mutex<Vec<Vec<TaskId>>>,
}

impl RecordingScheduler {
    fn new(lanes: usize) -> Self {
        Self {
            inner: LaneScheduler::new(lanes),
            batches: Mutex::new(Vec::new()),
        }
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(|batch| batch.len()).collect()
    }

    fn times_scheduled(&self, id: TaskId) -> usize {
        self.batches
            .lock()
            .iter()
            .flatten()
            .filter(|scheduled| **scheduled == id)
            .count()
    }

    fn flat(&self) -> Vec<TaskId> {
        self.batches.lock().iter().flatten().copied().collect()
    }
}

impl Scheduler for RecordingScheduler {
    fn select(&self, lane: usize) -> Option<Arc<Task>> {
        self.inner.select(lane)
    }

    fn schedule(&self, lane: usize, batch: Vec<Arc<Task>>) {
        self.batches
            .lock()
            .push(batch.iter().map(|task| task.id()).collect());
        self.inner.schedule(lane, batch);
    }
}

mod scenarios {
    use super::*;

    #[test]
    fn test_write_then_two_reads_release_together() {
        let scheduler = Arc::new(RecordingScheduler::new(1));
        let pool = Taskpool::with_scheduler(single_lane_config(), scheduler.clone());
        let matrix = TiledMatrix::new(1, 1, 1, 4, 1);

        let t1 = pool.task(noop, "writer").output(&matrix, (0, 0)).insert().unwrap();
        let t2 = pool.task(noop, "reader").input(&matrix, (0, 0)).insert().unwrap();
        let t3 = pool.task(noop, "reader").input(&matrix, (0, 0)).insert().unwrap();

        let writer = pool.find_task(t1).unwrap();
        let first = pool.find_task(t2).unwrap();
        let second = pool.find_task(t3).unwrap();

        // The writer touched the tile first: no predecessor, ready at once.
        assert!(writer.flow(0).predecessor().is_none());
        assert!(writer.is_ready());
        // Both readers record the writer as predecessor and wait for it.
        assert_eq!(first.flow(0).predecessor().unwrap().task, writer.this_ref());
        assert_eq!(second.flow(0).predecessor().unwrap().task, writer.this_ref());
        assert!(!first.is_ready());
        assert!(!second.is_ready());

        pool.flush();
        let selected = pool.scheduler().select(0).unwrap();
        assert_eq!(selected.id(), t1);
        pool.execute(selected);

        // One completion releases every reader of the chain.
        assert!(first.is_ready());
        assert!(second.is_ready());
        assert_eq!(scheduler.times_scheduled(t2), 1);
        assert_eq!(scheduler.times_scheduled(t3), 1);
    }

    #[test]
    fn test_task_without_data_arguments_is_ready_at_insertion() {
        let pool = Taskpool::new(single_lane_config());
        let id = pool.task(noop, "solo").value(42u32).insert().unwrap();
        let task = pool.find_task(id).unwrap();

        assert_eq!(task.declared_flows(), 0);
        assert!(task.is_ready());
        assert_eq!(task.satisfied_count(), 1);
        pool.wait();
    }

    #[test]
    fn test_same_tile_twice_resolves_to_self() {
        let pool = Taskpool::new(single_lane_config());
        let matrix = TiledMatrix::new(1, 1, 1, 4, 1);

        let id = pool
            .task(noop, "reader-writer")
            .input(&matrix, (0, 0))
            .output(&matrix, (0, 0))
            .insert()
            .unwrap();
        let task = pool.find_task(id).unwrap();

        // The second flow depends on the task's own first touch and is
        // credited on the spot: no deadlock, ready as soon as built.
        assert_eq!(task.flow(1).predecessor().unwrap().task, task.this_ref());
        assert!(task.is_ready());
        assert_eq!(task.satisfied_count(), 3);
        pool.wait();
    }

    #[test]
    fn test_window_flush_batches() {
        let config = EngineConfig {
            window_max: 4,
            threshold: 2,
            ..single_lane_config()
        };
        let scheduler = Arc::new(RecordingScheduler::new(1));
        let pool = Taskpool::with_scheduler(config, scheduler.clone());
        let matrix = TiledMatrix::new(1, 1, 10, 4, 1);

        for j in 0..10 {
            pool.task(noop, "independent")
                .output(&matrix, (0, j))
                .insert()
                .unwrap();
        }

        // Window growth 1, 2, 4; at the cap the inserting thread drained
        // the backlog down to the threshold before the last three
        // insertions arrived.
        assert_eq!(scheduler.batch_sizes(), vec![1, 2, 4]);
        assert_eq!(pool.outstanding_tasks(), 5);

        pool.wait();
        assert_eq!(scheduler.batch_sizes(), vec![1, 2, 4, 3]);
        assert_eq!(pool.outstanding_tasks(), 1);
    }
}

mod dependencies {
    use super::*;

    #[test]
    fn test_writes_chain_in_insertion_order() {
        let pool = Taskpool::new(single_lane_config());
        let matrix = TiledMatrix::new(1, 1, 1, 4, 1);

        let ids: Vec<TaskId> = (0..3)
            .map(|_| {
                pool.task(noop, "writer")
                    .inout(&matrix, (0, 0))
                    .insert()
                    .unwrap()
            })
            .collect();
        let tasks: Vec<Arc<Task>> = ids.iter().map(|id| pool.find_task(*id).unwrap()).collect();

        // Edges always point from the earlier insertion to the later one.
        assert!(tasks[0].flow(0).predecessor().is_none());
        assert_eq!(
            tasks[1].flow(0).predecessor().unwrap().task,
            tasks[0].this_ref()
        );
        assert_eq!(
            tasks[2].flow(0).predecessor().unwrap().task,
            tasks[1].this_ref()
        );
        assert_eq!(
            tasks[0].flow(0).successor().unwrap().task,
            tasks[1].this_ref()
        );
        assert_eq!(
            tasks[1].flow(0).successor().unwrap().task,
            tasks[2].this_ref()
        );
        pool.wait();
    }

    #[test]
    fn test_no_lost_edges_on_one_tile() {
        let pool = Taskpool::new(single_lane_config());
        let matrix = TiledMatrix::new(1, 1, 1, 4, 1);

        let count = 8;
        let tasks: Vec<Arc<Task>> = (0..count)
            .map(|_| {
                let id = pool
                    .task(noop, "writer")
                    .inout(&matrix, (0, 0))
                    .insert()
                    .unwrap();
                pool.find_task(id).unwrap()
            })
            .collect();

        let edges = tasks
            .iter()
            .filter(|task| task.flow(0).predecessor().is_some())
            .count();
        assert_eq!(edges, count - 1);
        pool.wait();
    }

    #[test]
    fn test_satisfaction_counts_are_exact() {
        let pool = Taskpool::new(single_lane_config());
        let matrix = TiledMatrix::new(1, 2, 2, 4, 1);

        let mut tasks = Vec::new();
        for step in 0..4u32 {
            let id = pool
                .task(noop, "mixed")
                .inout(&matrix, (0, 0))
                .input(&matrix, (step % 2, 1))
                .insert()
                .unwrap();
            tasks.push(pool.find_task(id).unwrap());
        }
        pool.wait();

        for task in &tasks {
            assert_eq!(task.state(), TaskState::Released);
            // Declared flows plus the construction credit, never more.
            assert_eq!(task.satisfied_count(), task.declared_flows() as u32 + 1);
        }
    }

    #[test]
    fn test_reader_after_producer_completed_is_immediately_satisfied() {
        let pool = Taskpool::new(single_lane_config());
        let matrix = TiledMatrix::new(1, 1, 1, 4, 1);

        let w = pool.task(noop, "writer").output(&matrix, (0, 0)).insert().unwrap();
        let r1 = pool.task(noop, "reader").input(&matrix, (0, 0)).insert().unwrap();
        let first = pool.find_task(r1).unwrap();

        // The first insertion was already flushed; run the writer.
        let writer = pool.scheduler().select(0).unwrap();
        assert_eq!(writer.id(), w);
        pool.execute(writer);
        assert!(first.is_ready());

        // The producer's release walk has passed: later readers must not
        // wait for anything.
        let r2 = pool.task(noop, "reader").input(&matrix, (0, 0)).insert().unwrap();
        let r3 = pool.task(noop, "reader").input(&matrix, (0, 0)).insert().unwrap();
        assert!(pool.find_task(r2).unwrap().is_ready());
        assert!(pool.find_task(r3).unwrap().is_ready());
        pool.wait();
    }
}

mod readiness {
    use super::*;
    use std::thread;

    fn feed(_args: &TaskArgs<'_>) -> TaskStatus {
        TaskStatus::Done
    }

    #[test]
    fn test_concurrent_completions_claim_readiness_once() {
        let config = EngineConfig {
            // Flush every insertion and never throttle, so this test owns
            // execution order completely.
            window_max: 1,
            threshold: usize::MAX >> 1,
            ..EngineConfig::default()
        };
        let scheduler = Arc::new(RecordingScheduler::new(config.num_lanes.max(1)));
        let pool = Taskpool::with_scheduler(
            EngineConfig {
                track_tasks: true,
                ..config
            },
            scheduler.clone(),
        );
        let matrix = TiledMatrix::new(1, 1, 8, 4, 1);

        let writers: Vec<Arc<Task>> = (0..8)
            .map(|j| {
                let id = pool
                    .task(feed, "writer")
                    .output(&matrix, (0, j))
                    .insert()
                    .unwrap();
                pool.find_task(id).unwrap()
            })
            .collect();

        let mut sink_builder = pool.task(noop, "sink");
        for j in 0..8 {
            sink_builder = sink_builder.input(&matrix, (0, j));
        }
        let sink_id = sink_builder.insert().unwrap();
        let sink = pool.find_task(sink_id).unwrap();
        assert!(!sink.is_ready());

        // Eight completions race to satisfy the sink's final flows.
        thread::scope(|scope| {
            for writer in writers {
                let pool = pool.clone();
                scope.spawn(move || pool.execute(writer));
            }
        });

        assert!(sink.is_ready());
        assert_eq!(sink.satisfied_count(), sink.declared_flows() as u32 + 1);
        assert_eq!(scheduler.times_scheduled(sink_id), 1);
    }
}

mod ordering {
    use super::*;

    static ORDER: Mutex<Vec<u32>> = Mutex::new(Vec::new());

    fn record_first(_args: &TaskArgs<'_>) -> TaskStatus {
        ORDER.lock().push(0);
        TaskStatus::Done
    }

    fn record_read(_args: &TaskArgs<'_>) -> TaskStatus {
        ORDER.lock().push(1);
        TaskStatus::Done
    }

    fn record_last(_args: &TaskArgs<'_>) -> TaskStatus {
        ORDER.lock().push(2);
        TaskStatus::Done
    }

    #[test]
    fn test_per_tile_program_order_is_preserved() {
        let pool = Taskpool::new(single_lane_config());
        let matrix = TiledMatrix::new(1, 1, 1, 4, 1);

        pool.task(record_first, "produce")
            .output(&matrix, (0, 0))
            .insert()
            .unwrap();
        pool.task(record_read, "observe")
            .input(&matrix, (0, 0))
            .insert()
            .unwrap();
        pool.task(record_read, "observe")
            .input(&matrix, (0, 0))
            .insert()
            .unwrap();
        pool.task(record_last, "consume")
            .inout(&matrix, (0, 0))
            .insert()
            .unwrap();
        pool.wait();

        let order = ORDER.lock();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], 0);
        assert_eq!(&order[1..3], &[1, 1]);
        assert_eq!(order[3], 2);
    }

    #[test]
    fn test_priority_orders_flush_batches() {
        let scheduler = Arc::new(RecordingScheduler::new(1));
        let pool = Taskpool::with_scheduler(single_lane_config(), scheduler.clone());
        let matrix = TiledMatrix::new(1, 1, 4, 4, 1);

        // First insertion flushes alone and grows the window to 2.
        let warmup = pool
            .task(noop, "warmup")
            .output(&matrix, (0, 0))
            .insert()
            .unwrap();
        let low = pool
            .task(noop, "low")
            .output(&matrix, (0, 1))
            .priority(1)
            .insert()
            .unwrap();
        let high = pool
            .task(noop, "high")
            .output(&matrix, (0, 2))
            .priority(9)
            .insert()
            .unwrap();

        // The two-task batch surfaces the higher priority first.
        assert_eq!(scheduler.flat(), vec![warmup, high, low]);
        pool.wait();
    }
}

mod arguments {
    use super::*;
    use crate::DataDescriptor;

    fn scale_and_scratch(args: &TaskArgs<'_>) -> TaskStatus {
        assert_eq!(args.len(), 3);
        assert_eq!(args.mode(0), AccessMode::ReadWrite);
        assert_eq!(args.mode(1), AccessMode::Value);
        assert_eq!(args.mode(2), AccessMode::Scratch);

        let alpha: f64 = args.value(1);
        let handle = args.data(0);
        for element in TiledMatrix::block(&handle).lock().iter_mut() {
            *element += alpha;
        }
        // Safety: single borrow, and the body is the block's only accessor.
        let scratch = unsafe { args.scratch(2) };
        assert_eq!(scratch.len(), 16);
        assert!(scratch.iter().all(|byte| *byte == 0));
        scratch[0] = 7;
        TaskStatus::Done
    }

    #[test]
    fn test_value_and_scratch_arguments() {
        let pool = Taskpool::new(single_lane_config());
        let matrix = TiledMatrix::new(1, 1, 1, 8, 1);

        pool.task(scale_and_scratch, "scale")
            .inout(&matrix, (0, 0))
            .value(2.5f64)
            .scratch(16)
            .insert()
            .unwrap();
        pool.wait();

        let handle = matrix.data_of(0);
        assert!(TiledMatrix::block(&handle)
            .lock()
            .iter()
            .all(|element| *element == 2.5));
    }

    #[test]
    fn test_flow_shapes_recorded_once() {
        let pool = Taskpool::new(single_lane_config());
        let matrix = TiledMatrix::new(1, 1, 2, 4, 1);

        let id = pool
            .task(noop, "shaped")
            .output(&matrix, (0, 0))
            .input(&matrix, (0, 1))
            .insert()
            .unwrap();
        let class = pool.find_task(id).unwrap().class().clone();
        assert_eq!(
            class.flow_shapes(),
            Some(&[AccessMode::Write, AccessMode::Read][..])
        );
        pool.wait();
    }
}

mod limits {
    use super::*;

    #[test]
    fn test_task_pool_exhaustion_is_an_error() {
        let config = EngineConfig {
            task_pool_capacity: 2,
            ..single_lane_config()
        };
        let pool = Taskpool::new(config);
        let matrix = TiledMatrix::new(1, 1, 4, 4, 1);

        pool.task(noop, "a").output(&matrix, (0, 0)).insert().unwrap();
        pool.task(noop, "a").output(&matrix, (0, 1)).insert().unwrap();
        let err = pool
            .task(noop, "a")
            .output(&matrix, (0, 2))
            .insert()
            .unwrap_err();
        assert!(matches!(err, EngineError::PoolExhausted { pool: "task", .. }));
        pool.wait();
    }

    fn body_a(_args: &TaskArgs<'_>) -> TaskStatus {
        TaskStatus::Done
    }

    fn body_b(_args: &TaskArgs<'_>) -> TaskStatus {
        TaskStatus::Done
    }

    fn body_c(_args: &TaskArgs<'_>) -> TaskStatus {
        TaskStatus::Done
    }

    #[test]
    fn test_class_limit_is_an_error() {
        let config = EngineConfig {
            max_task_classes: 2,
            ..single_lane_config()
        };
        let pool = Taskpool::new(config);

        pool.task(body_a, "a").insert().unwrap();
        pool.task(body_b, "b").insert().unwrap();
        let err = pool.task(body_c, "c").insert().unwrap_err();
        assert_eq!(err, EngineError::TooManyTaskClasses { limit: 2 });
        pool.wait();
    }

    #[test]
    fn test_flow_limit_is_an_error() {
        let pool = Taskpool::new(single_lane_config());
        let matrix = TiledMatrix::new(1, 1, 20, 4, 1);

        let mut builder = pool.task(noop, "wide");
        for j in 0..17 {
            builder = builder.input(&matrix, (0, j));
        }
        let err = builder.insert().unwrap_err();
        assert!(matches!(err, EngineError::TooManyFlows { .. }));
        pool.wait();
    }

    #[test]
    #[should_panic(expected = "inconsistent flow count")]
    fn test_inconsistent_flow_shape_fails_loudly() {
        let pool = Taskpool::new(single_lane_config());
        let matrix = TiledMatrix::new(1, 1, 2, 4, 1);

        pool.task(noop, "narrow").output(&matrix, (0, 0)).insert().unwrap();
        let _ = pool
            .task(noop, "narrow")
            .output(&matrix, (0, 0))
            .input(&matrix, (0, 1))
            .insert();
    }
}

mod throttle {
    use super::*;

    #[test]
    fn test_inserting_thread_relieves_backlog() {
        let config = EngineConfig {
            window_max: 1,
            threshold: 3,
            ..single_lane_config()
        };
        let pool = Taskpool::new(config);
        let matrix = TiledMatrix::new(1, 1, 16, 4, 1);

        for j in 0..10 {
            pool.task(noop, "burst").output(&matrix, (0, j)).insert().unwrap();
        }
        // Every flush point drained the backlog down to the threshold.
        assert!(pool.outstanding_tasks() <= 4);
        pool.wait();
        assert_eq!(pool.outstanding_tasks(), 1);
    }

    #[test]
    fn test_traversal_logging_smoke() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let config = EngineConfig {
            log_traversal: true,
            log_class_info: true,
            ..single_lane_config()
        };
        let pool = Taskpool::new(config);
        let matrix = TiledMatrix::new(1, 1, 2, 4, 1);

        pool.task(noop, "logged").output(&matrix, (0, 0)).insert().unwrap();
        pool.task(noop, "logged").input(&matrix, (0, 0)).insert().unwrap();
        pool.wait();
        assert_eq!(pool.tasks_created(), 2);
    }

    #[test]
    fn test_tiles_are_shared_within_a_handle() {
        let pool = Taskpool::new(single_lane_config());
        let matrix = TiledMatrix::new(1, 2, 2, 4, 1);

        pool.task(noop, "a").output(&matrix, (0, 0)).insert().unwrap();
        pool.task(noop, "b").input(&matrix, (0, 0)).insert().unwrap();
        assert_eq!(pool.tile_count(), 1);

        pool.task(noop, "c").output(&matrix, (1, 1)).insert().unwrap();
        assert_eq!(pool.tile_count(), 2);
        pool.wait();
    }
}
