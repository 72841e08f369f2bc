//! Randomized concurrent use of the work queue.

use proptest::prelude::*;
use refscope_core::{FileId, WorkQueue};
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone)]
enum Op {
    Dirty(u32),
    DirtyMany(Vec<u32>),
    Claim(usize),
    Forget(u32),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u32..64).prop_map(Op::Dirty),
        1 => prop::collection::vec(0u32..64, 0..8).prop_map(Op::DirtyMany),
        3 => (1usize..6).prop_map(Op::Claim),
        1 => (0u32..64).prop_map(Op::Forget),
    ]
}

fn run(queue: &WorkQueue, ops: &[Op]) {
    for op in ops {
        match op {
            Op::Dirty(raw) => {
                queue.mark_dirty(FileId::new(*raw));
            }
            Op::DirtyMany(raw) => {
                queue.mark_dirty_all(raw.iter().copied().map(FileId::new));
            }
            Op::Claim(max) => {
                let batch = queue.claim_batch(*max);
                assert!(batch.len() <= *max);
                queue.finish_batch(batch.len(), &batch);
            }
            Op::Forget(raw) => queue.force_resolved(&[FileId::new(*raw)]),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn queued_bits_track_membership(ops in prop::collection::vec(op(), 0..200)) {
        let queue = WorkQueue::new();
        for chunk in ops.chunks(10) {
            run(&queue, chunk);
            prop_assert!(queue.is_consistent());
        }
    }

    #[test]
    fn concurrent_ops_keep_queue_consistent(
        workers in prop::collection::vec(prop::collection::vec(op(), 0..120), 2..5)
    ) {
        let queue = Arc::new(WorkQueue::new());
        let handles: Vec<_> = workers
            .into_iter()
            .map(|ops| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || run(&queue, &ops))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        prop_assert!(queue.is_consistent());

        // Draining what is left always reaches an up-to-date queue.
        loop {
            let batch = queue.claim_batch(16);
            if batch.is_empty() {
                break;
            }
            queue.finish_batch(batch.len(), &batch);
        }
        prop_assert!(queue.is_up_to_date());
        prop_assert!(queue.is_consistent());
    }
}
