//! The task-discovery engine: handle, insertion, and the windowed throttle.
//!
//! A [`Taskpool`] is one graph-construction-and-execution session. Tasks are
//! inserted through the [`TaskBuilder`] returned by [`Taskpool::task`]; the
//! engine resolves each data argument against the tile registry, wires
//! dependency edges, and buffers insertion-ready tasks per lane. Batches are
//! flushed to the external scheduler in exponentially growing windows, and
//! once the window is at its cap the inserting thread throttles itself by
//! executing ready tasks until the backlog drops below the configured
//! threshold.

mod release;
mod resolver;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rand::Rng;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::class::{ClassId, TaskClass};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pool::Pool;
use crate::registry::Registry;
use crate::sched::{LaneScheduler, Scheduler};
use crate::task::flow::MAX_FLOWS;
use crate::task::{
    self, AccessMode, FlowSlot, ParamSlot, Task, TaskBody, TaskId, TaskRef, TaskState, TaskStatus,
};
use crate::tile::{DataDescriptor, Tile};

/// One graph-construction-and-execution session.
///
/// Owns the registries, counters, window state, and allocation pools for a
/// sequence of insertions from one logical algorithm instance.
pub struct Taskpool {
    pub(crate) config: EngineConfig,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    classes: Registry<Arc<TaskClass>>,
    class_slots: Box<[OnceCell<Arc<TaskClass>>]>,
    class_count: AtomicUsize,
    flow_recorded: Box<[AtomicBool]>,
    tiles: Registry<Arc<Tile>>,
    tile_pool: Pool<Tile>,
    pub(crate) tasks: Registry<Arc<Task>>,
    ready_lists: Box<[CachePadded<Mutex<Vec<Arc<Task>>>>]>,
    task_id: AtomicU64,
    tasks_created: AtomicU64,
    tasks_since_flush: AtomicU64,
    pub(crate) nb_local_tasks: AtomicI64,
    window: AtomicUsize,
    threshold: AtomicUsize,
    next_lane: AtomicUsize,
}

impl std::fmt::Debug for Taskpool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Taskpool")
            .field("tasks_created", &self.tasks_created.load(Ordering::Relaxed))
            .field("outstanding", &self.nb_local_tasks.load(Ordering::Relaxed))
            .field("window", &self.window.load(Ordering::Relaxed))
            .finish()
    }
}

impl Taskpool {
    /// Create a handle with the default per-lane scheduler.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let lanes = config.num_lanes.max(1);
        Self::with_scheduler(config, Arc::new(LaneScheduler::new(lanes)))
    }

    /// Create a handle driving a caller-supplied scheduler.
    pub fn with_scheduler(mut config: EngineConfig, scheduler: Arc<dyn Scheduler>) -> Arc<Self> {
        config.num_lanes = config.num_lanes.max(1);
        let class_slots = (0..config.max_task_classes).map(|_| OnceCell::new()).collect();
        let flow_recorded = (0..config.max_task_classes)
            .map(|_| AtomicBool::new(false))
            .collect();
        let ready_lists = (0..config.num_lanes)
            .map(|_| CachePadded::new(Mutex::new(Vec::new())))
            .collect();
        Arc::new(Self {
            classes: Registry::new(config.class_table_size),
            class_slots,
            class_count: AtomicUsize::new(0),
            flow_recorded,
            tiles: Registry::new(config.tile_table_size),
            tile_pool: Pool::new("tile", config.tile_pool_capacity),
            tasks: Registry::new(config.task_table_size),
            ready_lists,
            task_id: AtomicU64::new(0),
            tasks_created: AtomicU64::new(0),
            tasks_since_flush: AtomicU64::new(0),
            // Starts at one: the bookkeeping task that represents waiting
            // for this graph.
            nb_local_tasks: AtomicI64::new(1),
            window: AtomicUsize::new(1),
            threshold: AtomicUsize::new(config.threshold),
            next_lane: AtomicUsize::new(0),
            scheduler,
            config,
        })
    }

    /// Begin inserting a task running `body`.
    pub fn task(&self, body: TaskBody, name: &'static str) -> TaskBuilder<'_> {
        TaskBuilder {
            pool: self,
            body,
            name,
            priority: 0,
            flows: SmallVec::new(),
            params: SmallVec::new(),
            value_bytes: SmallVec::new(),
            scratch_bytes: 0,
            error: None,
        }
    }

    /// The scheduler this handle feeds.
    #[inline]
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Number of execution lanes.
    #[inline]
    pub fn num_lanes(&self) -> usize {
        self.ready_lists.len()
    }

    /// Total tasks inserted into this handle.
    #[inline]
    pub fn tasks_created(&self) -> u64 {
        self.tasks_created.load(Ordering::Relaxed)
    }

    /// Outstanding local tasks, including the bookkeeping task.
    #[inline]
    pub fn outstanding_tasks(&self) -> i64 {
        self.nb_local_tasks.load(Ordering::Acquire)
    }

    /// Current window size.
    #[inline]
    pub fn current_window(&self) -> usize {
        self.window.load(Ordering::Relaxed)
    }

    /// Look up an in-flight task by id. Populated only when
    /// [`EngineConfig::track_tasks`] is enabled.
    pub fn find_task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.find(id.inner())
    }

    /// Number of tiles currently registered.
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Resolve the tile for `(i, j)` of `descriptor`, creating it on first
    /// reference.
    pub fn tile_for(
        &self,
        descriptor: &dyn DataDescriptor,
        i: u32,
        j: u32,
    ) -> Result<Arc<Tile>, EngineError> {
        let local = descriptor.data_key(i, j);
        let key = Tile::compose_key(descriptor.descriptor_id(), local);
        if let Some(tile) = self.tiles.find(key) {
            return Ok(tile);
        }
        // The descriptor accessors run at most once per tile, under the
        // bucket lock of the tile's key.
        self.tiles.get_or_try_insert_with(key, || {
            self.tile_pool.insert_with(|slot, gen| {
                Tile::new(
                    key,
                    descriptor.rank_of(local),
                    descriptor.lane_of(local),
                    descriptor.data_of(local),
                    slot,
                    gen,
                )
            })
        })
    }

    /// Look up the class for `body`, creating it on first use.
    fn class_for(
        &self,
        body: TaskBody,
        name: &'static str,
        param_count: usize,
        param_bytes: usize,
        flow_count: usize,
    ) -> Result<Arc<TaskClass>, EngineError> {
        let key = body as usize as u64;
        if let Some(class) = self.classes.find(key) {
            return Ok(class);
        }
        self.classes.get_or_try_insert_with(key, || {
            let id = self.class_count.fetch_add(1, Ordering::AcqRel);
            if id >= self.config.max_task_classes {
                return Err(EngineError::TooManyTaskClasses {
                    limit: self.config.max_task_classes,
                });
            }
            let class = Arc::new(TaskClass::new(
                ClassId(id as u8),
                name,
                body,
                param_count,
                param_bytes,
                flow_count,
                self.config.task_pool_capacity,
            ));
            self.class_slots[id]
                .set(class.clone())
                .expect("class slot assigned twice");
            if self.config.log_class_info {
                debug!(
                    class = %class.id(),
                    name,
                    param_count,
                    param_bytes,
                    flow_count,
                    "task class created"
                );
            }
            Ok(class)
        })
    }

    /// Resolve a packed task reference against the class pools.
    pub(crate) fn resolve_ref(&self, reference: TaskRef) -> Option<Arc<Task>> {
        let class = self.class_slots.get(reference.class as usize)?.get()?;
        class.pool.get(reference.slot, reference.gen)
    }

    /// Drop one flow-held tile reference; returns the slot to the tile pool
    /// when the registry no longer holds the tile either.
    pub(crate) fn release_tile(&self, tile: &Arc<Tile>) {
        if tile.release() {
            let (slot, gen) = tile.pool_slot();
            self.tile_pool.release(slot, gen);
        }
    }

    fn insert_task(&self, builder: TaskBuilder<'_>) -> Result<TaskId, EngineError> {
        if let Some(error) = builder.error {
            return Err(error);
        }
        let value_len = builder.value_bytes.len();
        let param_bytes = value_len + builder.scratch_bytes;
        let class = self.class_for(
            builder.body,
            builder.name,
            builder.params.len(),
            param_bytes,
            builder.flows.len(),
        )?;

        // Every task of a class must present the same shape; a mismatch is
        // caller misuse and fails loudly rather than corrupting edges.
        assert_eq!(
            class.flow_count(),
            builder.flows.len(),
            "task class `{}` inserted with an inconsistent flow count",
            builder.name
        );
        assert_eq!(
            class.param_count(),
            builder.params.len(),
            "task class `{}` inserted with an inconsistent parameter count",
            builder.name
        );
        self.record_flow_shapes(&class, &builder.flows);

        // Value block: copied values first, zeroed scratch after.
        let mut block = vec![0u8; param_bytes];
        block[..value_len].copy_from_slice(&builder.value_bytes);
        let mut scratch_offset = value_len;
        let params: Box<[ParamSlot]> = builder
            .params
            .iter()
            .map(|param| match *param {
                ParamSpec::Flow(index) => ParamSlot::Flow(index),
                ParamSpec::Value { offset, len } => ParamSlot::Value { offset, len },
                ParamSpec::Scratch { len } => {
                    let offset = scratch_offset;
                    scratch_offset += len;
                    ParamSlot::Scratch { offset, len }
                }
            })
            .collect();

        let id = TaskId(self.task_id.fetch_add(1, Ordering::Relaxed));
        let lane = self.next_lane.fetch_add(1, Ordering::Relaxed) % self.num_lanes();
        let priority = builder.priority;
        let flows = builder.flows;

        let class_for_task = class.clone();
        let task = class.pool.insert_with(move |slot, gen| {
            let this_ref = TaskRef {
                class: class_for_task.id().0,
                slot,
                gen,
            };
            let flow_slots: Box<[FlowSlot]> = flows
                .iter()
                .map(|(tile, mode)| FlowSlot::new(tile.clone(), *mode))
                .collect();
            Task::new(
                id,
                class_for_task,
                this_ref,
                lane,
                priority,
                flow_slots,
                params,
                block.into_boxed_slice(),
            )
        })?;

        // Each flow holds one tile reference for the task's lifetime.
        for f in 0..task.declared_flows() {
            task.flow(f).tile().retain();
        }

        if self.config.track_tasks {
            self.tasks.insert(id.inner(), task.clone());
        }
        self.nb_local_tasks.fetch_add(1, Ordering::AcqRel);

        for f in 0..task.declared_flows() {
            resolver::resolve_flow(self, &task, f);
        }

        // Construction finished: apply the guard credit. This is the final
        // satisfaction a fully-independent task is waiting for.
        self.credit_construction(&task);

        self.tasks_created.fetch_add(1, Ordering::Relaxed);
        let since = self.tasks_since_flush.fetch_add(1, Ordering::AcqRel) + 1;
        let window = self.window.load(Ordering::Relaxed);
        if since >= window as u64 {
            self.tasks_since_flush.store(0, Ordering::Release);
            self.flush();
            if window < self.config.window_max {
                self.window
                    .store((window * 2).min(self.config.window_max), Ordering::Relaxed);
            } else {
                let threshold = self.threshold.load(Ordering::Relaxed) as i64;
                if self.outstanding_tasks() > threshold {
                    self.execute_and_come_back(threshold);
                }
            }
        }

        Ok(id)
    }

    fn record_flow_shapes(&self, class: &TaskClass, flows: &[(Arc<Tile>, AccessMode)]) {
        let index = class.id().0 as usize;
        if !self.flow_recorded[index].swap(true, Ordering::AcqRel) {
            let modes: SmallVec<[AccessMode; 8]> = flows.iter().map(|(_, mode)| *mode).collect();
            class.set_flow_shapes(&modes);
        }
    }

    fn credit_construction(&self, task: &Arc<Task>) {
        let count = task.satisfy_one();
        if count == task.flow_total() && task.try_claim_ready() {
            task.set_state(TaskState::Ready);
            if self.config.log_traversal {
                debug!(task = %task.id(), lane = task.lane(), "task ready at insertion");
            }
            self.ready_lists[task.lane()].lock().push(task.clone());
        }
    }

    /// Flush every per-lane ready list to the scheduler, in priority order.
    pub fn flush(&self) {
        for (lane, list) in self.ready_lists.iter().enumerate() {
            let mut batch = std::mem::take(&mut *list.lock());
            if batch.is_empty() {
                continue;
            }
            batch.sort_by(task::priority_order);
            for task in &batch {
                task.set_state(TaskState::Scheduled);
            }
            trace!(lane, count = batch.len(), "flushing ready batch");
            self.scheduler.schedule(lane, batch);
        }
    }

    /// Run a task body and discharge its bookkeeping.
    ///
    /// Panics if the body returns anything but [`TaskStatus::Done`]: an
    /// unexpected status means the engine's own bookkeeping is inconsistent.
    pub fn execute(&self, task: Arc<Task>) {
        task.set_state(TaskState::Executing);
        let status = (task.class().body())(&task.args());
        if status != TaskStatus::Done {
            panic!(
                "{} ({}) returned {:?}: engine bookkeeping is inconsistent",
                task.id(),
                task.class().name(),
                status
            );
        }
        release::complete_task(self, &task);
    }

    /// Execute ready tasks on the calling thread until the outstanding count
    /// drops to `threshold`, backing off exponentially while no task is
    /// available. This is how the inserting thread makes execution progress
    /// when graph construction runs too far ahead.
    fn execute_and_come_back(&self, threshold: i64) {
        let lanes = self.num_lanes();
        let mut misses: u64 = 1;
        while self.outstanding_tasks() > threshold {
            if misses > 1 {
                thread::sleep(Duration::from_nanos(backoff_ns(misses)));
            }
            let mut executed = false;
            for lane in 0..lanes {
                if let Some(task) = self.scheduler.select(lane) {
                    self.execute(task);
                    executed = true;
                    break;
                }
            }
            if executed {
                misses = 0;
            } else {
                misses += 1;
            }
        }
    }

    /// Flush and drain every outstanding task.
    ///
    /// The threshold is forced to its minimum so the calling thread executes
    /// everything that remains, including work released by completions along
    /// the way; the handle stays usable for further insertions afterwards.
    pub fn wait(&self) {
        self.flush();
        let saved = self.threshold.swap(1, Ordering::AcqRel);
        self.execute_and_come_back(1);
        self.threshold.store(saved, Ordering::Release);
        debug!(created = self.tasks_created(), "graph drained");
    }
}

impl Drop for Taskpool {
    fn drop(&mut self) {
        for tile in self.tiles.drain() {
            self.release_tile(&tile);
        }
        // Task pools hold Arcs into their own class; clear them so the
        // cycle cannot leak.
        let classes = self.class_count.load(Ordering::Relaxed);
        for slot in self.class_slots.iter().take(classes) {
            if let Some(class) = slot.get() {
                class.pool.clear();
            }
        }
    }
}

/// Exponentially scaled random backoff, in nanoseconds.
fn backoff_ns(misses: u64) -> u64 {
    const TIME_STEP: u64 = 5410;
    let ceiling = misses.min(64);
    rand::rng().random_range(0..=ceiling) * TIME_STEP
}

#[derive(Debug, Clone, Copy)]
enum ParamSpec {
    Flow(u8),
    Value { offset: usize, len: usize },
    Scratch { len: usize },
}

/// Builder for one task insertion.
///
/// Arguments are declared in order; data flows resolve their tiles eagerly,
/// values are copied into the task's argument block, and scratch space is
/// reserved per task. Finish with [`TaskBuilder::insert`].
#[must_use = "a task builder does nothing until insert() is called"]
pub struct TaskBuilder<'a> {
    pool: &'a Taskpool,
    body: TaskBody,
    name: &'static str,
    priority: i32,
    flows: SmallVec<[(Arc<Tile>, AccessMode); 4]>,
    params: SmallVec<[ParamSpec; 8]>,
    value_bytes: SmallVec<[u8; 64]>,
    scratch_bytes: usize,
    error: Option<EngineError>,
}

impl<'a> TaskBuilder<'a> {
    /// Bind a tile argument with an explicit access mode.
    pub fn tile(
        mut self,
        descriptor: &dyn DataDescriptor,
        (i, j): (u32, u32),
        mode: AccessMode,
    ) -> Self {
        debug_assert!(mode.is_data(), "tile arguments need a data access mode");
        if self.error.is_some() {
            return self;
        }
        if self.flows.len() >= MAX_FLOWS {
            self.error = Some(EngineError::TooManyFlows {
                declared: self.flows.len() + 1,
                max: MAX_FLOWS,
            });
            return self;
        }
        match self.pool.tile_for(descriptor, i, j) {
            Ok(tile) => {
                self.params.push(ParamSpec::Flow(self.flows.len() as u8));
                self.flows.push((tile, mode));
            }
            Err(error) => self.error = Some(error),
        }
        self
    }

    /// Bind a tile the task reads.
    pub fn input(self, descriptor: &dyn DataDescriptor, at: (u32, u32)) -> Self {
        self.tile(descriptor, at, AccessMode::Read)
    }

    /// Bind a tile the task overwrites.
    pub fn output(self, descriptor: &dyn DataDescriptor, at: (u32, u32)) -> Self {
        self.tile(descriptor, at, AccessMode::Write)
    }

    /// Bind a tile the task reads and writes.
    pub fn inout(self, descriptor: &dyn DataDescriptor, at: (u32, u32)) -> Self {
        self.tile(descriptor, at, AccessMode::ReadWrite)
    }

    /// Bind a tile the task updates commutatively.
    pub fn atomic(self, descriptor: &dyn DataDescriptor, at: (u32, u32)) -> Self {
        self.tile(descriptor, at, AccessMode::AtomicWrite)
    }

    /// Copy a plain value into the task's argument block.
    pub fn value<T: Copy>(mut self, value: T) -> Self {
        let offset = self.value_bytes.len();
        let len = std::mem::size_of::<T>();
        self.value_bytes.resize(offset + len, 0);
        // Safety: T is Copy and the destination range was just reserved.
        unsafe {
            std::ptr::copy_nonoverlapping(
                &value as *const T as *const u8,
                self.value_bytes.as_mut_ptr().add(offset),
                len,
            );
        }
        self.params.push(ParamSpec::Value { offset, len });
        self
    }

    /// Reserve `len` bytes of zeroed per-task scratch space.
    pub fn scratch(mut self, len: usize) -> Self {
        self.params.push(ParamSpec::Scratch { len });
        self.scratch_bytes += len;
        self
    }

    /// Set the scheduling priority (default 0; higher runs first).
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Insert the task, resolving its dependencies.
    pub fn insert(self) -> Result<TaskId, EngineError> {
        self.pool.insert_task(self)
    }
}

#[cfg(test)]
mod tests;
