//! Ordered, deduplicated queue of dirty files plus the liveness bits.
//!
//! `queued` and queue membership are only ever changed together under the
//! single mutex, so a file is queued exactly when it sits in the deque.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::model::FileId;
use crate::storage::IdBitSet;

#[derive(Debug, Default)]
struct QueueState {
    queued: IdBitSet,
    resolved: IdBitSet,
    /// Deleted files; cleared when the host marks them dirty again.
    forgotten: IdBitSet,
    order: VecDeque<FileId>,
    in_flight: usize,
    closed: bool,
}

impl QueueState {
    fn enqueue(&mut self, id: FileId) -> bool {
        self.resolved.clear(id);
        if self.queued.set(id) {
            return false;
        }
        self.order.push_back(id);
        true
    }
}

/// Point-in-time counters of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub in_flight: usize,
    pub resolved: usize,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks a file as needing recomputation. Returns true if it was newly queued.
    pub fn mark_dirty(&self, id: FileId) -> bool {
        let added = {
            let mut state = self.lock();
            state.forgotten.clear(id);
            state.enqueue(id)
        };
        if added {
            self.ready.notify_one();
        }
        added
    }

    pub fn mark_dirty_all(&self, ids: impl IntoIterator<Item = FileId>) -> usize {
        let added = {
            let mut state = self.lock();
            ids.into_iter()
                .filter(|id| {
                    state.forgotten.clear(*id);
                    state.enqueue(*id)
                })
                .count()
        };
        if added > 0 {
            self.ready.notify_all();
        }
        added
    }

    /// Queues claimed files again after a retry or a failed commit. Files
    /// forgotten while their batch ran stay resolved.
    pub fn requeue_retries(&self, ids: &[FileId]) -> usize {
        let added = {
            let mut state = self.lock();
            ids.iter()
                .filter(|id| !state.forgotten.get(**id) && state.enqueue(**id))
                .count()
        };
        if added > 0 {
            self.ready.notify_all();
        }
        added
    }

    /// Drains up to `max` files in FIFO order and records them as in flight.
    pub fn claim_batch(&self, max: usize) -> Vec<FileId> {
        let mut state = self.lock();
        let mut batch = Vec::with_capacity(max.min(state.order.len()));
        while batch.len() < max {
            let Some(id) = state.order.pop_front() else {
                break;
            };
            if state.queued.clear(id) {
                batch.push(id);
            }
        }
        state.in_flight += batch.len();
        batch
    }

    /// Releases a claimed batch. Committed files become resolved unless they
    /// were marked dirty again while the batch ran.
    pub fn finish_batch(&self, claimed: usize, committed: &[FileId]) {
        let mut state = self.lock();
        for id in committed {
            if !state.queued.get(*id) && !state.forgotten.get(*id) {
                state.resolved.set(*id);
            }
        }
        state.in_flight = state.in_flight.saturating_sub(claimed);
        drop(state);
        self.ready.notify_all();
    }

    /// Takes files out of the queue and treats them as resolved.
    pub fn force_resolved(&self, ids: &[FileId]) {
        let mut state = self.lock();
        let mut removed = false;
        for id in ids {
            removed |= state.queued.clear(*id);
            state.resolved.set(*id);
            state.forgotten.set(*id);
        }
        if removed {
            let QueueState { order, queued, .. } = &mut *state;
            order.retain(|id| queued.get(*id));
        }
    }

    pub fn is_up_to_date(&self) -> bool {
        let state = self.lock();
        state.order.is_empty() && state.in_flight == 0
    }

    pub fn is_queued(&self, id: FileId) -> bool {
        self.lock().queued.get(id)
    }

    pub fn is_forgotten(&self, id: FileId) -> bool {
        self.lock().forgotten.get(id)
    }

    pub fn is_resolved(&self, id: FileId) -> bool {
        self.lock().resolved.get(id)
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().order.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            queued: state.order.len(),
            in_flight: state.in_flight,
            resolved: state.resolved.count_ones(),
        }
    }

    /// Blocks until work is queued, the queue is closed or `timeout` elapses.
    /// Returns true if work is available.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |s| s.order.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        !state.order.is_empty()
    }

    /// Blocks until the next wake-up or `timeout`, whether or not work exists.
    pub fn park(&self, timeout: Duration) {
        let state = self.lock();
        if state.closed {
            return;
        }
        let _ = self.ready.wait_timeout(state, timeout);
    }

    /// Wakes every waiter without changing the queue.
    pub fn wake(&self) {
        self.ready.notify_all();
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn load_resolved(&self, resolved: IdBitSet) {
        let mut state = self.lock();
        state.resolved = resolved;
        let QueueState {
            order,
            queued,
            resolved,
            ..
        } = &mut *state;
        for id in order.iter() {
            if queued.get(*id) {
                resolved.clear(*id);
            }
        }
    }

    pub fn snapshot_resolved(&self) -> IdBitSet {
        self.lock().resolved.clone()
    }

    /// Checks that queued bits and queue membership agree and that no file is
    /// both queued and resolved.
    pub fn is_consistent(&self) -> bool {
        let state = self.lock();
        let mut seen = IdBitSet::new();
        for id in &state.order {
            if seen.set(*id) || !state.queued.get(*id) || state.resolved.get(*id) {
                return false;
            }
        }
        seen == trimmed(&state.queued)
    }
}

fn trimmed(bits: &IdBitSet) -> IdBitSet {
    let mut copy = IdBitSet::new();
    for id in bits.iter_ones() {
        copy.set(id);
    }
    copy
}
