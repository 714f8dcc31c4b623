//! Completion handling: successor release and task retirement.
//!
//! When a task completes, the engine walks the successor chain of every flow
//! it declared. The direct successor is satisfied when its recorded
//! predecessor is the completing task; read-sibling chains are walked
//! transitively so every reader of one producer is released together. Tasks
//! whose satisfaction counter reaches its target claim readiness exactly
//! once and are handed to the external scheduler in priority order, grouped
//! by the lane they were assigned at insertion.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};

use super::Taskpool;
use crate::task::flow::word;
use crate::task::{self, AccessMode, Task, TaskState, UserWord};

/// Discharge the dependency bookkeeping of a completed task: release its
/// successors, drop its tile references, and return it to its pool.
pub(crate) fn complete_task(pool: &Taskpool, task: &Arc<Task>) {
    task.set_state(TaskState::Completed);
    if pool.config.log_traversal {
        debug!(task = %task.id(), class = task.class().name(), "task complete");
    }

    let mut ready: SmallVec<[Arc<Task>; 8]> = SmallVec::new();
    for f in 0..task.declared_flows() {
        walk_flow(pool, task, f, &mut ready);
    }
    schedule_ready(pool, ready);

    for f in 0..task.declared_flows() {
        let slot = task.flow(f);
        if slot.eager_release() {
            trace!(task = %task.id(), flow = f, "releasing unconsumed data with the task");
        }
        pool.release_tile(slot.tile());
    }

    pool.nb_local_tasks.fetch_sub(1, Ordering::AcqRel);
    if pool.config.track_tasks {
        pool.tasks.remove(task.id().inner());
    }
    task.set_state(TaskState::Released);
    let this = task.this_ref();
    task.class().pool.release(this.slot, this.gen);
}

/// Walk the successor chain hanging off `origin`'s flow `f`, satisfying
/// every successor that recorded `origin` as its predecessor.
fn walk_flow(pool: &Taskpool, origin: &Arc<Task>, f: usize, ready: &mut SmallVec<[Arc<Task>; 8]>) {
    let mut current = origin.clone();
    let mut current_flow = f;
    loop {
        let Some(successor) = next_successor(origin, &current, current_flow) else {
            break;
        };

        // A link back into the completing task: the tile was reused across
        // two of its own flows, already credited at insertion. The later
        // flow's own walk covers everything behind this link.
        if successor.task == origin.this_ref() {
            break;
        }

        let Some(next) = pool.resolve_ref(successor.task) else {
            break;
        };
        let Some(predecessor) = next.flow(successor.flow as usize).pred_wait() else {
            break;
        };
        if predecessor.task != origin.this_ref() {
            // The chain continues under a different producer.
            break;
        }

        satisfy(pool, &next, ready);

        if successor.mode == AccessMode::Read {
            // More read siblings may hang off this reader.
            current = next;
            current_flow = successor.flow as usize;
        } else {
            break;
        }
    }
}

/// The successor wired to `(current, current_flow)`, or `None` when the
/// chain ends there.
///
/// When no successor is visible, the tile's last-user word decides: if it
/// still names `current`, the record is retired (origin's own entry) or
/// marked producer-done (the end of a read chain) so later insertions do not
/// wait for a producer that has already finished. If the word names someone
/// else, `current` was displaced and the wire is a few instructions behind
/// the swap, so the walk spins briefly until it appears.
fn next_successor(origin: &Task, current: &Task, current_flow: usize) -> Option<UserWord> {
    loop {
        if let Some(successor) = current.flow(current_flow).successor() {
            return Some(successor);
        }
        let tile = current.flow(current_flow).tile();
        let raw = tile.last_user().load(Ordering::Acquire);
        match word::unpack(raw) {
            Some(user)
                if user.task == current.this_ref() && user.flow as usize == current_flow =>
            {
                if !user.alive {
                    return None;
                }
                let updated = if current.this_ref() == origin.this_ref() {
                    word::retired(raw)
                } else {
                    word::producer_done(raw)
                };
                if tile
                    .last_user()
                    .compare_exchange(raw, updated, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return None;
                }
            }
            _ => std::hint::spin_loop(),
        }
    }
}

/// Credit one flow of `task`; claim readiness when the counter reaches its
/// target. The claim is a compare-and-swap, so racing completions yield
/// exactly one winner.
fn satisfy(pool: &Taskpool, task: &Arc<Task>, ready: &mut SmallVec<[Arc<Task>; 8]>) {
    let count = task.satisfy_one();
    if count == task.flow_total() && task.try_claim_ready() {
        task.set_state(TaskState::Ready);
        if pool.config.log_traversal {
            debug!(task = %task.id(), lane = task.lane(), "task ready");
        }
        ready.push(task.clone());
    }
}

/// Hand newly-ready tasks to the external scheduler, per lane, in priority
/// order.
fn schedule_ready(pool: &Taskpool, ready: SmallVec<[Arc<Task>; 8]>) {
    if ready.is_empty() {
        return;
    }
    let mut per_lane: Vec<Vec<Arc<Task>>> = vec![Vec::new(); pool.num_lanes()];
    for task in ready {
        per_lane[task.lane()].push(task);
    }
    for (lane, mut batch) in per_lane.into_iter().enumerate() {
        if batch.is_empty() {
            continue;
        }
        batch.sort_by(task::priority_order);
        for task in &batch {
            task.set_state(TaskState::Scheduled);
        }
        pool.scheduler.schedule(lane, batch);
    }
}
