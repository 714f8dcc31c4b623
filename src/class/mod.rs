//! Task-class metadata.
//!
//! Every distinct body function inserted into a handle gets one class:
//! immutable descriptor data (name, parameter footprint, flow count), the
//! per-flow access-mode table recorded the first time the class is used, and
//! a dedicated object pool sized for tasks of this class.

use std::fmt;

use once_cell::sync::OnceCell;

use crate::pool::Pool;
use crate::task::{AccessMode, Task, TaskBody};

/// Sequence-local identifier of a task class within one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u8);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Class({})", self.0)
    }
}

/// Immutable-after-creation descriptor shared by every task created from the
/// same body function.
pub struct TaskClass {
    id: ClassId,
    name: &'static str,
    body: TaskBody,
    param_count: usize,
    param_bytes: usize,
    flow_count: usize,
    flows: OnceCell<Box<[AccessMode]>>,
    pub(crate) pool: Pool<Task>,
}

impl fmt::Debug for TaskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskClass")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("param_count", &self.param_count)
            .field("param_bytes", &self.param_bytes)
            .field("flow_count", &self.flow_count)
            .finish()
    }
}

impl TaskClass {
    pub(crate) fn new(
        id: ClassId,
        name: &'static str,
        body: TaskBody,
        param_count: usize,
        param_bytes: usize,
        flow_count: usize,
        pool_capacity: usize,
    ) -> Self {
        Self {
            id,
            name,
            body,
            param_count,
            param_bytes,
            flow_count,
            flows: OnceCell::new(),
            pool: Pool::new("task", pool_capacity),
        }
    }

    /// Class identifier within the owning handle.
    #[inline]
    pub fn id(&self) -> ClassId {
        self.id
    }

    /// Class name, for diagnostics.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The body function every task of this class runs.
    #[inline]
    pub fn body(&self) -> TaskBody {
        self.body
    }

    /// Declared number of parameters per task.
    #[inline]
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// Bytes of value and scratch storage per task.
    #[inline]
    pub fn param_bytes(&self) -> usize {
        self.param_bytes
    }

    /// Declared number of data flows per task.
    #[inline]
    pub fn flow_count(&self) -> usize {
        self.flow_count
    }

    /// Size in bytes of one task object's argument footprint.
    #[inline]
    pub fn footprint(&self) -> usize {
        self.flow_count * std::mem::size_of::<u64>() * 2 + self.param_bytes
    }

    /// Record the per-flow access modes observed on first use. Later calls
    /// are ignored; every task of a class presents the same flow shape.
    pub(crate) fn set_flow_shapes(&self, modes: &[AccessMode]) {
        let _ = self.flows.set(modes.into());
    }

    /// The per-flow access-mode table, once recorded.
    #[inline]
    pub fn flow_shapes(&self) -> Option<&[AccessMode]> {
        self.flows.get().map(|shapes| shapes.as_ref())
    }
}
