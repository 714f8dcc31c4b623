//! Dependency resolution: the last-user chaining algorithm.
//!
//! For every data argument of a newly inserted task, the resolver swaps the
//! tile's last-user word to name the new task and wires a dependency edge to
//! whatever record the swap displaced. The swap is a compare-and-swap retry
//! loop, so concurrent insertions on one tile never block each other beyond
//! a bounded retry, and the captured word is read in the same atomic
//! exchange that publishes the new one, so no edge is ever lost or
//! duplicated.
//!
//! A flow is credited as satisfied on the spot under one unified rule: its
//! predecessor is absent (first touch, or the previous user already retired
//! its record), its predecessor is the inserting task itself (a task cannot
//! depend on itself), or the displaced record is a read whose producer has
//! already completed.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use super::Taskpool;
use crate::task::flow::{word, UserWord};
use crate::task::{AccessMode, Task};

/// Resolve the dependency of `task`'s flow `f`, wiring edges through the
/// tile's last-user word.
pub(crate) fn resolve_flow(pool: &Taskpool, task: &Arc<Task>, f: usize) {
    let slot = task.flow(f);
    let tile = slot.tile();
    let mode = slot.mode();

    let mine = word::pack(&UserWord {
        task: task.this_ref(),
        flow: f as u8,
        mode,
        alive: true,
        producer_done: false,
    });

    // Fetch-and-set: install this task as the last user, capturing the
    // displaced record in the same atomic exchange.
    let mut previous = tile.last_user().load(Ordering::Relaxed);
    loop {
        match tile.last_user().compare_exchange_weak(
            previous,
            mine,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            Err(current) => previous = current,
        }
    }

    match word::unpack(previous) {
        // First-ever touch of this tile.
        None => {
            slot.set_pred_none();
            if matches!(mode, AccessMode::Read | AccessMode::AtomicWrite) {
                slot.mark_eager_release();
            }
            credit(task);
            if pool.config.log_traversal {
                debug!(task = %task.id(), flow = f, tile = tile.key(), "first touch");
            }
        }

        // The previous user already retired its record; nothing to wait for.
        Some(prev) if !prev.alive => {
            slot.set_pred_none();
            credit(task);
        }

        // The task reuses a tile across two of its own flows: the second
        // touch depends on the first, which is satisfied by definition.
        Some(prev) if prev.task == task.this_ref() => {
            slot.set_pred(&UserWord {
                alive: true,
                producer_done: false,
                ..prev
            });
            task.flow(prev.flow as usize).publish_successor(&UserWord {
                task: task.this_ref(),
                flow: f as u8,
                mode,
                alive: true,
                producer_done: false,
            });
            credit(task);
        }

        // Read after read: the displaced reader is a sibling, not a
        // producer. The true predecessor is the chain's writer, recorded on
        // the sibling's flow; the sibling's successor slot still gets wired
        // so the writer's release walk can traverse the whole chain.
        Some(prev) if prev.mode == AccessMode::Read && mode == AccessMode::Read => {
            match pool.resolve_ref(prev.task) {
                None => {
                    slot.set_pred_none();
                    credit(task);
                }
                Some(sibling) => {
                    match sibling.flow(prev.flow as usize).pred_wait() {
                        // The chain never had a producer.
                        None => {
                            slot.set_pred_none();
                            credit(task);
                        }
                        // The producer's release walk already passed the
                        // chain end: nothing is pending. Recording no
                        // predecessor keeps later siblings from waiting for
                        // a walk that will never come.
                        Some(_) if prev.producer_done => {
                            slot.set_pred_none();
                            credit(task);
                        }
                        Some(producer) => {
                            slot.set_pred(&producer);
                        }
                    }
                    sibling.flow(prev.flow as usize).publish_successor(&UserWord {
                        task: task.this_ref(),
                        flow: f as u8,
                        mode,
                        alive: true,
                        producer_done: false,
                    });
                }
            }
        }

        // The displaced task is the predecessor: record it on this flow and
        // wire this task as its successor.
        Some(prev) => match pool.resolve_ref(prev.task) {
            None => {
                slot.set_pred_none();
                credit(task);
            }
            Some(predecessor) => {
                slot.set_pred(&UserWord {
                    alive: true,
                    producer_done: false,
                    ..prev
                });
                predecessor
                    .flow(prev.flow as usize)
                    .publish_successor(&UserWord {
                        task: task.this_ref(),
                        flow: f as u8,
                        mode,
                        alive: true,
                        producer_done: false,
                    });
            }
        },
    }
}

/// Credit one immediately satisfied flow. The construction guard keeps the
/// count strictly below the readiness target until insertion finishes.
fn credit(task: &Arc<Task>) {
    let count = task.satisfy_one();
    debug_assert!(count < task.flow_total());
}
