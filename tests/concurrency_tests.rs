//! Many threads racing dequeue, accept, deletion and re-scheduling against shared queues.

mod test_harness;

use std::collections::BTreeSet;
use std::sync::{Barrier, Mutex};

use fleet_queue::models::{BucketId, JobId};
use fleet_queue::scheduler::{BalancingBucketQueue, DequeueResult, NothingToDequeueBehavior};
use test_harness::{bucket, failed, job, mixed, passed, worker, Fixture};

const WORKERS: usize = 8;

#[test]
fn test_every_bucket_is_handed_out_exactly_once() {
    let fx = Fixture::new(0);
    let names: Vec<String> = (0..WORKERS).map(|i| format!("w{}", i)).collect();
    for name in &names {
        fx.register(&[name.as_str()]);
    }
    let queue = fx.balancing_queue(NothingToDequeueBehavior::default());
    for j in 0..4 {
        let buckets = (0..50)
            .map(|b| bucket(&format!("j{}-b{}", j, b), &["t1", "t2"]))
            .collect();
        queue.enqueue(buckets, &job(&format!("j{}", j), j)).unwrap();
    }

    let seen = Mutex::new(Vec::new());
    std::thread::scope(|scope| {
        for name in &names {
            let queue = &queue;
            let seen = &seen;
            scope.spawn(move || {
                let w = worker(name);
                while let DequeueResult::Dequeued(dequeued) = queue.dequeue_bucket(&[], &w) {
                    queue
                        .accept(passed(&dequeued.bucket), dequeued.bucket.bucket_id(), &w)
                        .unwrap();
                    seen.lock().unwrap().push(dequeued.bucket.bucket_id().clone());
                }
            });
        }
    });

    let seen = seen.into_inner().unwrap();
    let unique: BTreeSet<BucketId> = seen.iter().cloned().collect();
    assert_eq!(seen.len(), 200);
    assert_eq!(unique.len(), 200);
    assert!(queue.ongoing_job_ids().is_empty());
}

#[test]
fn test_concurrent_retries_never_exceed_attempt_limit() {
    let retries = 2;
    let fx = Fixture::new(retries);
    let names: Vec<String> = (0..WORKERS).map(|i| format!("w{}", i)).collect();
    for name in &names {
        fx.register(&[name.as_str()]);
    }
    let queue = fx.bucket_queue("job");
    let buckets: Vec<_> = (0..40)
        .map(|b| bucket(&format!("b{}", b), &["flaky", "stable"]))
        .collect();
    queue.enqueue(buckets.clone()).unwrap();

    let attempts = Mutex::new(0usize);
    std::thread::scope(|scope| {
        for name in &names {
            let queue = &queue;
            let attempts = &attempts;
            scope.spawn(move || {
                let w = worker(name);
                // Workers may be vetoed from the retries they failed; keep polling until
                // the queue is empty.
                while !queue.is_depleted() {
                    if let Some(dequeued) = queue.dequeue_bucket(&[], &w) {
                        *attempts.lock().unwrap() += 1;
                        queue
                            .accept(
                                mixed(&dequeued.bucket, &["flaky"]),
                                dequeued.bucket.bucket_id(),
                                &w,
                            )
                            .unwrap();
                    } else {
                        std::thread::yield_now();
                    }
                }
            });
        }
    });

    // Each original bucket runs once, and its flaky test gets `retries` more runs.
    let expected = buckets.len() * (1 + retries as usize);
    assert_eq!(attempts.into_inner().unwrap(), expected);
    assert!(queue.pending_buckets().is_empty());
    assert!(queue.dequeued_buckets().is_empty());
}

const RACE_ROUNDS: usize = 200;

/// A deleted job with b1 in flight on w1, over a queue that retries failures once.
fn deleted_job_with_bucket_in_flight() -> (Fixture, BalancingBucketQueue) {
    let fx = Fixture::new(1);
    fx.register(&["w1"]);
    let queue = fx.balancing_queue(NothingToDequeueBehavior::default());
    queue.enqueue(vec![bucket("b1", &["t1"])], &job("j1", 1)).unwrap();
    assert!(matches!(
        queue.dequeue_bucket(&[], &worker("w1")),
        DequeueResult::Dequeued(_)
    ));
    queue.delete(&JobId::new("j1")).unwrap();
    (fx, queue)
}

fn pending_ids(queue: &BalancingBucketQueue) -> BTreeSet<BucketId> {
    queue
        .job_queue(&JobId::new("j1"))
        .unwrap()
        .bucket_queue
        .pending_buckets()
        .into_iter()
        .map(|e| e.bucket.bucket_id().clone())
        .collect()
}

#[test]
fn test_rescheduling_deleted_job_while_its_result_arrives_keeps_new_buckets() {
    for _ in 0..RACE_ROUNDS {
        let (_fx, queue) = deleted_job_with_bucket_in_flight();
        let b1 = bucket("b1", &["t1"]);
        let barrier = Barrier::new(2);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                barrier.wait();
                queue
                    .accept(failed(&b1), b1.bucket_id(), &worker("w1"))
                    .unwrap();
            });
            scope.spawn(|| {
                barrier.wait();
                assert_eq!(queue.enqueue(vec![bucket("x", &["t2"])], &job("j1", 1)).unwrap(), 1);
            });
        });

        assert!(pending_ids(&queue).contains(&BucketId::new("x")));
        assert!(queue.ongoing_job_ids().contains(&JobId::new("j1")));
    }
}

#[test]
fn test_rescheduling_deleted_job_during_stuck_sweep_keeps_new_buckets() {
    for _ in 0..RACE_ROUNDS {
        let (fx, queue) = deleted_job_with_bucket_in_flight();
        fx.aliveness.disable_worker(&worker("w1")).unwrap();
        let barrier = Barrier::new(2);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                barrier.wait();
                queue.reenqueue_stuck_buckets();
            });
            scope.spawn(|| {
                barrier.wait();
                assert_eq!(queue.enqueue(vec![bucket("x", &["t2"])], &job("j1", 1)).unwrap(), 1);
            });
        });

        assert!(pending_ids(&queue).contains(&BucketId::new("x")));
        assert!(queue.ongoing_job_ids().contains(&JobId::new("j1")));
    }
}

#[test]
fn test_deleting_job_while_its_result_arrives_leaves_nothing_to_run() {
    for _ in 0..RACE_ROUNDS {
        let fx = Fixture::new(1);
        fx.register(&["w1"]);
        let queue = fx.balancing_queue(NothingToDequeueBehavior::default());
        let b1 = bucket("b1", &["t1"]);
        queue.enqueue(vec![b1.clone()], &job("j1", 1)).unwrap();
        assert!(matches!(
            queue.dequeue_bucket(&[], &worker("w1")),
            DequeueResult::Dequeued(_)
        ));
        let barrier = Barrier::new(2);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                barrier.wait();
                queue
                    .accept(failed(&b1), b1.bucket_id(), &worker("w1"))
                    .unwrap();
            });
            scope.spawn(|| {
                barrier.wait();
                queue.delete(&JobId::new("j1")).unwrap();
            });
        });

        let job_queue = queue.job_queue(&JobId::new("j1")).unwrap();
        assert!(job_queue.bucket_queue.is_deleted());
        assert!(job_queue.bucket_queue.is_depleted());
        assert_eq!(queue.results(&JobId::new("j1")).unwrap().testing_results.len(), 1);
    }
}
