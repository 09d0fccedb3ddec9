use std::sync::Arc;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use shardgraph::ingest::{BatchMergeQueue, WriteBatch};
use shardgraph::types::{QueueId, SnapshotId};
use shardgraph::ShardError;

const FENCE: SnapshotId = SnapshotId::MAX;

/// Non-decreasing snapshot sequences, one per queue.
fn arb_queues() -> impl Strategy<Value = Vec<Vec<SnapshotId>>> {
    prop::collection::vec(
        prop::collection::vec(0u64..4, 0..20).prop_map(|steps| {
            let mut snapshot = 1;
            steps
                .into_iter()
                .map(|step| {
                    snapshot += step;
                    snapshot
                })
                .collect::<Vec<_>>()
        }),
        1..5,
    )
}

/// Offers every queue (plus a closing fence) and returns the merged output
/// up to the first fence.
fn merge(queues: &[Vec<SnapshotId>], capacity: usize) -> Vec<WriteBatch> {
    let merge = Arc::new(BatchMergeQueue::new(queues.len(), capacity).unwrap());
    let producers: Vec<_> = queues
        .iter()
        .enumerate()
        .map(|(index, snapshots)| {
            let merge = Arc::clone(&merge);
            let snapshots = snapshots.clone();
            thread::spawn(move || {
                let queue = QueueId(index as u32);
                for (offset, snapshot) in snapshots.iter().enumerate() {
                    merge
                        .offer(queue, WriteBatch::marker(queue, *snapshot, offset as u64))
                        .unwrap();
                }
                let fence = WriteBatch::marker(queue, FENCE, snapshots.len() as u64);
                match merge.offer(queue, fence) {
                    Ok(()) | Err(ShardError::Shutdown) => {}
                    Err(err) => panic!("offer failed: {err}"),
                }
            })
        })
        .collect();

    let mut out = Vec::new();
    loop {
        match merge.poll(Duration::from_millis(50)).unwrap() {
            Some(batch) if batch.snapshot_id == FENCE => break,
            Some(batch) => out.push(batch),
            None => {}
        }
    }
    merge.close();
    for producer in producers {
        producer.join().unwrap();
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn merged_output_is_snapshot_ordered(queues in arb_queues(), capacity in 1usize..4) {
        let out = merge(&queues, capacity);

        let total: usize = queues.iter().map(Vec::len).sum();
        prop_assert_eq!(out.len(), total);
        for pair in out.windows(2) {
            prop_assert!(pair[0].snapshot_id <= pair[1].snapshot_id);
        }
        for (index, snapshots) in queues.iter().enumerate() {
            let offsets: Vec<u64> = out
                .iter()
                .filter(|batch| batch.queue_id == QueueId(index as u32))
                .map(|batch| batch.offset)
                .collect();
            prop_assert_eq!(offsets, (0..snapshots.len() as u64).collect::<Vec<_>>());
        }
    }
}

#[test]
fn idle_queue_holds_back_output_until_marker() {
    let merge = BatchMergeQueue::new(2, 8).unwrap();
    merge
        .offer(QueueId(0), WriteBatch::marker(QueueId(0), 5, 0))
        .unwrap();
    assert!(merge.poll(Duration::from_millis(20)).unwrap().is_none());

    merge
        .offer(QueueId(1), WriteBatch::marker(QueueId(1), 6, 0))
        .unwrap();
    let first = merge.poll(Duration::from_millis(20)).unwrap().unwrap();
    assert_eq!((first.queue_id, first.snapshot_id), (QueueId(0), 5));
    // Queue 0 is empty again, so queue 1's head stays buffered.
    assert!(merge.poll(Duration::from_millis(20)).unwrap().is_none());
    assert_eq!(merge.len(), 1);
}

#[test]
fn equal_snapshots_leave_in_arrival_order() {
    let merge = BatchMergeQueue::new(2, 8).unwrap();
    merge
        .offer(QueueId(1), WriteBatch::marker(QueueId(1), 3, 0))
        .unwrap();
    merge
        .offer(QueueId(0), WriteBatch::marker(QueueId(0), 3, 0))
        .unwrap();
    merge
        .offer(QueueId(0), WriteBatch::marker(QueueId(0), 4, 1))
        .unwrap();
    merge
        .offer(QueueId(1), WriteBatch::marker(QueueId(1), 4, 1))
        .unwrap();
    let order: Vec<(u32, SnapshotId)> = (0..2)
        .map(|_| {
            let batch = merge.poll(Duration::from_millis(20)).unwrap().unwrap();
            (batch.queue_id.0, batch.snapshot_id)
        })
        .collect();
    assert_eq!(order, vec![(1, 3), (0, 3)]);
}

#[test]
fn seeded_interleavings_merge_identically() {
    let queues: Vec<Vec<SnapshotId>> = vec![
        vec![1, 1, 2, 5, 5, 9],
        vec![2, 3, 3, 4],
        vec![1, 6, 7, 7, 8],
    ];
    let reference: Vec<SnapshotId> = {
        let mut all: Vec<SnapshotId> = queues.iter().flatten().copied().collect();
        all.sort_unstable();
        all
    };

    for seed in 0..16u64 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut arrivals: Vec<usize> = queues
            .iter()
            .enumerate()
            .flat_map(|(index, snapshots)| std::iter::repeat(index).take(snapshots.len()))
            .collect();
        arrivals.shuffle(&mut rng);

        let merge = BatchMergeQueue::new(queues.len(), 16).unwrap();
        let mut next = vec![0usize; queues.len()];
        for index in arrivals {
            let queue = QueueId(index as u32);
            let offset = next[index];
            next[index] += 1;
            merge
                .offer(
                    queue,
                    WriteBatch::marker(queue, queues[index][offset], offset as u64),
                )
                .unwrap();
        }
        for (index, offset) in next.iter().enumerate() {
            let queue = QueueId(index as u32);
            merge
                .offer(queue, WriteBatch::marker(queue, FENCE, *offset as u64))
                .unwrap();
        }

        let mut out = Vec::new();
        while let Some(batch) = merge.poll(Duration::from_millis(10)).unwrap() {
            if batch.snapshot_id == FENCE {
                break;
            }
            out.push(batch.snapshot_id);
        }
        assert_eq!(out, reference, "seed {seed}");
    }
}
