//! External-scheduler collaborator contract and a default implementation.
//!
//! The engine never inspects how a scheduler chooses among ready tasks
//! beyond the priority order it establishes when handing batches over. The
//! [`LaneScheduler`] provided here keeps one queue per execution lane and
//! lets an idle lane steal from the back of busier lanes; the [`WorkerPool`]
//! runs one select/execute worker thread per lane on top of it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use tracing::debug;

use crate::engine::Taskpool;
use crate::task::Task;

/// Contract the engine consumes: pull one ready task for a lane, or push a
/// priority-ordered batch of ready tasks onto a lane.
pub trait Scheduler: Send + Sync {
    /// Pull one ready task for `lane`.
    fn select(&self, lane: usize) -> Option<Arc<Task>>;

    /// Push a batch of ready tasks, already in priority order, onto `lane`.
    fn schedule(&self, lane: usize, batch: Vec<Arc<Task>>);
}

/// Per-lane FIFO queues with back-stealing between lanes.
#[derive(Debug)]
pub struct LaneScheduler {
    lanes: Box<[CachePadded<Mutex<VecDeque<Arc<Task>>>>]>,
}

impl LaneScheduler {
    /// Create a scheduler with `lanes` queues.
    pub fn new(lanes: usize) -> Self {
        let lanes = (0..lanes.max(1))
            .map(|_| CachePadded::new(Mutex::new(VecDeque::new())))
            .collect();
        Self { lanes }
    }

    /// Number of lanes.
    #[inline]
    pub fn num_lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Total queued tasks across all lanes.
    pub fn len(&self) -> usize {
        self.lanes.iter().map(|lane| lane.lock().len()).sum()
    }

    /// Whether every lane is empty.
    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(|lane| lane.lock().is_empty())
    }
}

impl Scheduler for LaneScheduler {
    fn select(&self, lane: usize) -> Option<Arc<Task>> {
        let lanes = self.lanes.len();
        let own = lane % lanes;
        if let Some(task) = self.lanes[own].lock().pop_front() {
            return Some(task);
        }
        // Steal from the back of other lanes.
        for offset in 1..lanes {
            let victim = (own + offset) % lanes;
            if let Some(task) = self.lanes[victim].lock().pop_back() {
                return Some(task);
            }
        }
        None
    }

    fn schedule(&self, lane: usize, batch: Vec<Arc<Task>>) {
        let own = lane % self.lanes.len();
        self.lanes[own].lock().extend(batch);
    }
}

const IDLE_TIMEOUT: Duration = Duration::from_millis(1);

/// One select/execute worker thread per lane of a [`Taskpool`].
#[derive(Debug)]
pub struct WorkerPool {
    running: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn one worker per lane of `pool`.
    pub fn start(pool: Arc<Taskpool>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let workers = (0..pool.num_lanes())
            .map(|lane| {
                let pool = pool.clone();
                let running = running.clone();
                thread::Builder::new()
                    .name(format!("weave-worker-{lane}"))
                    .spawn(move || {
                        while running.load(Ordering::SeqCst) {
                            match pool.scheduler().select(lane) {
                                Some(task) => pool.execute(task),
                                None => thread::sleep(IDLE_TIMEOUT),
                            }
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self { running, workers }
    }

    /// Number of worker threads.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop the workers and wait for them to exit.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        debug!(workers = self.workers.len(), "shutting down worker pool");
        for worker in self.workers.drain(..) {
            worker.join().expect("worker thread panicked");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}
