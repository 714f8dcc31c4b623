//! Tasks: discovered units of work.
//!
//! A task is allocated from its class's pool at insertion time, carries one
//! [`FlowSlot`] per data argument plus an opaque value block for by-value and
//! scratch parameters, and advances through a small state machine: Pending →
//! Ready → Scheduled → Executing → Completed → Released. The Pending→Ready
//! transition is claimed exactly once via compare-and-swap, no matter how
//! many completions race to satisfy the final flow.

pub mod flow;

pub use flow::{AccessMode, FlowSlot, TaskRef, UserWord, MAX_FLOWS};

use std::cell::UnsafeCell;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::class::TaskClass;
use crate::tile::{DataHandle, Tile};

/// Monotonically assigned, process-local task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Completion status returned by a task body. Anything but [`Done`] is a
/// fatal invariant violation.
///
/// [`Done`]: TaskStatus::Done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The body completed its work.
    Done,
    /// The body failed; the engine aborts the run.
    Failed,
}

/// The body function bound to a task class. Function-pointer identity keys
/// the class registry, so every insertion with the same function shares one
/// class.
pub type TaskBody = fn(&TaskArgs<'_>) -> TaskStatus;

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for flows to be satisfied.
    Pending,
    /// All flows satisfied; eligible for scheduling.
    Ready,
    /// Handed to the external scheduler.
    Scheduled,
    /// Body running on a worker.
    Executing,
    /// Body finished; successors being released.
    Completed,
    /// Bookkeeping discharged; object returned to its pool.
    Released,
}

impl TaskState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Pending,
            1 => TaskState::Ready,
            2 => TaskState::Scheduled,
            3 => TaskState::Executing,
            4 => TaskState::Completed,
            _ => TaskState::Released,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Ready => 1,
            TaskState::Scheduled => 2,
            TaskState::Executing => 3,
            TaskState::Completed => 4,
            TaskState::Released => 5,
        }
    }
}

/// Where each declared parameter lives on the task.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ParamSlot {
    /// Index into the flow-slot array.
    Flow(u8),
    /// A by-value argument copied into the value block.
    Value { offset: usize, len: usize },
    /// Scratch space reserved in the value block.
    Scratch { offset: usize, len: usize },
}

/// Byte block for value and scratch parameters.
///
/// Written while the task is under exclusive construction and by the body
/// through [`TaskArgs::scratch`] while the task executes; both phases have a
/// single accessor by construction, so the unsynchronized cell is sound.
struct ValueBlock(UnsafeCell<Box<[u8]>>);

// The execution discipline above is the synchronization.
unsafe impl Sync for ValueBlock {}
unsafe impl Send for ValueBlock {}

impl fmt::Debug for ValueBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueBlock({} bytes)", unsafe { (&*self.0.get()).len() })
    }
}

/// One discovered unit of work.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    class: Arc<TaskClass>,
    this_ref: TaskRef,
    lane: usize,
    priority: i32,
    flow_total: u32,
    satisfied: AtomicU32,
    ready: AtomicBool,
    state: AtomicU8,
    flows: Box<[FlowSlot]>,
    params: Box<[ParamSlot]>,
    values: ValueBlock,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: TaskId,
        class: Arc<TaskClass>,
        this_ref: TaskRef,
        lane: usize,
        priority: i32,
        flows: Box<[FlowSlot]>,
        params: Box<[ParamSlot]>,
        values: Box<[u8]>,
    ) -> Self {
        // One extra credit is applied when construction finishes, so a task
        // can never fire before all of its flows are wired.
        let flow_total = flows.len() as u32 + 1;
        Self {
            id,
            class,
            this_ref,
            lane,
            priority,
            flow_total,
            satisfied: AtomicU32::new(0),
            ready: AtomicBool::new(false),
            state: AtomicU8::new(TaskState::Pending.as_u8()),
            flows,
            params,
            values: ValueBlock(UnsafeCell::new(values)),
        }
    }

    /// The task's identifier.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The class this task was created from.
    #[inline]
    pub fn class(&self) -> &Arc<TaskClass> {
        &self.class
    }

    /// This task's pool identity, as referenced by dependency words.
    #[inline]
    pub fn this_ref(&self) -> TaskRef {
        self.this_ref
    }

    /// Execution lane assigned round-robin at insertion.
    #[inline]
    pub fn lane(&self) -> usize {
        self.lane
    }

    /// Scheduling priority; higher surfaces first within a lane.
    #[inline]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Whether the readiness transition has been claimed.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Number of declared data flows.
    #[inline]
    pub fn declared_flows(&self) -> usize {
        self.flows.len()
    }

    /// Satisfaction target: declared flows plus the construction credit.
    #[inline]
    pub(crate) fn flow_total(&self) -> u32 {
        self.flow_total
    }

    /// Current satisfaction count.
    #[inline]
    pub fn satisfied_count(&self) -> u32 {
        self.satisfied.load(Ordering::Acquire)
    }

    /// Credit one satisfied flow; returns the new count.
    #[inline]
    pub(crate) fn satisfy_one(&self) -> u32 {
        let count = self.satisfied.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(count <= self.flow_total);
        count
    }

    /// Claim the Pending→Ready transition. Exactly one caller wins.
    #[inline]
    pub(crate) fn try_claim_ready(&self) -> bool {
        self.ready
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The flow slot at `index`.
    #[inline]
    pub fn flow(&self, index: usize) -> &FlowSlot {
        &self.flows[index]
    }

    /// View of the task's bound arguments, as passed to the body.
    #[inline]
    pub fn args(&self) -> TaskArgs<'_> {
        TaskArgs { task: self }
    }

    #[inline]
    fn value_block(&self) -> *mut Box<[u8]> {
        self.values.0.get()
    }
}

/// Order tasks by priority, higher first, ties broken by insertion id.
pub(crate) fn priority_order(a: &Arc<Task>, b: &Arc<Task>) -> CmpOrdering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.id.cmp(&b.id))
}

/// The bound arguments of a task, indexed in declaration order.
pub struct TaskArgs<'a> {
    task: &'a Task,
}

impl<'a> TaskArgs<'a> {
    /// Number of declared parameters.
    #[inline]
    pub fn len(&self) -> usize {
        self.task.params.len()
    }

    /// Whether the task was inserted without parameters.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.task.params.is_empty()
    }

    /// The task owning these arguments.
    #[inline]
    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    /// The tile bound to parameter `index`.
    ///
    /// Panics if the parameter is not a data flow.
    pub fn tile(&self, index: usize) -> &Arc<Tile> {
        match self.task.params[index] {
            ParamSlot::Flow(flow) => self.task.flows[flow as usize].tile(),
            _ => panic!("parameter {index} is not a data flow"),
        }
    }

    /// The data handle bound to parameter `index`.
    pub fn data(&self, index: usize) -> DataHandle {
        self.tile(index).data().clone()
    }

    /// Access mode of parameter `index`.
    pub fn mode(&self, index: usize) -> AccessMode {
        match self.task.params[index] {
            ParamSlot::Flow(flow) => self.task.flows[flow as usize].mode(),
            ParamSlot::Value { .. } => AccessMode::Value,
            ParamSlot::Scratch { .. } => AccessMode::Scratch,
        }
    }

    /// Copy out the by-value argument at `index`.
    ///
    /// Panics if the parameter is not a value or `T` has a different size
    /// than the bytes bound at insertion.
    pub fn value<T: Copy>(&self, index: usize) -> T {
        match self.task.params[index] {
            ParamSlot::Value { offset, len } => {
                assert_eq!(len, std::mem::size_of::<T>(), "value size mismatch");
                // Safety: the value block is immutable once the task is
                // published, and `offset..offset + len` was bounds-checked
                // at insertion. The read is unaligned-safe.
                unsafe {
                    let block = &*self.task.value_block();
                    std::ptr::read_unaligned(block.as_ptr().add(offset) as *const T)
                }
            }
            _ => panic!("parameter {index} is not a value"),
        }
    }

    /// Scratch space reserved at `index`.
    ///
    /// # Safety
    ///
    /// The caller must not hold two scratch borrows of the same parameter at
    /// once. The engine guarantees the body is the block's only accessor
    /// while the task executes.
    pub unsafe fn scratch(&self, index: usize) -> &mut [u8] {
        match self.task.params[index] {
            ParamSlot::Scratch { offset, len } => {
                let block = &mut *self.task.value_block();
                &mut block[offset..offset + len]
            }
            _ => panic!("parameter {index} is not scratch space"),
        }
    }
}
