use std::sync::Arc;

use crate::error::{QueueError, Result};
use crate::history::storage::{TestEntryHistoryId, TestHistoryStorage};
use crate::identifier::UniqueIdentifierGenerator;
use crate::models::{Bucket, BucketId, EnqueuedBucket, TestEntry, TestingResult, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestHistoryTrackerAcceptResult {
    /// One fresh bucket per test entry that earned another attempt.
    pub buckets_to_reenqueue: Vec<Bucket>,
    /// Successes and final failures; entries going for a retry are left out.
    pub testing_result: TestingResult,
}

pub trait TestHistoryTracker: Send + Sync {
    /// Records the attempt and decides which failed entries are retried. Fails with
    /// `DuplicateBucketId`, recording nothing, if a minted retry id is already taken
    /// according to `is_bucket_id_taken`.
    fn accept(
        &self,
        testing_result: TestingResult,
        bucket: &Bucket,
        worker_id: &WorkerId,
        is_bucket_id_taken: &dyn Fn(&BucketId) -> bool,
    ) -> Result<TestHistoryTrackerAcceptResult>;

    /// Picks the bucket `worker_id` should get from `queue` (pending buckets, FIFO order,
    /// already filtered by capabilities), or `None` to veto all of them.
    /// `working_condition_worker_ids` is only called when the choice depends on it.
    fn bucket_to_dequeue(
        &self,
        worker_id: &WorkerId,
        queue: &[&EnqueuedBucket],
        working_condition_worker_ids: &dyn Fn() -> Vec<WorkerId>,
    ) -> Option<BucketId>;
}

pub struct TestHistoryTrackerImpl {
    number_of_retries: u32,
    storage: Arc<dyn TestHistoryStorage>,
    id_generator: Arc<dyn UniqueIdentifierGenerator>,
}

impl TestHistoryTrackerImpl {
    pub fn new(
        number_of_retries: u32,
        storage: Arc<dyn TestHistoryStorage>,
        id_generator: Arc<dyn UniqueIdentifierGenerator>,
    ) -> Self {
        Self {
            number_of_retries,
            storage,
            id_generator,
        }
    }

    pub fn number_of_retries(&self) -> u32 {
        self.number_of_retries
    }

    fn number_of_attempts_to_run_tests(&self) -> usize {
        self.number_of_retries as usize + 1
    }

    fn bucket_was_failing(
        &self,
        bucket: &Bucket,
        failing: impl Fn(&crate::history::TestEntryHistory) -> bool,
    ) -> bool {
        bucket.test_entries().iter().any(|entry| {
            let id = TestEntryHistoryId::new(bucket.bucket_id().clone(), entry.clone());
            failing(&self.storage.history(&id))
        })
    }
}

impl TestHistoryTracker for TestHistoryTrackerImpl {
    fn accept(
        &self,
        testing_result: TestingResult,
        bucket: &Bucket,
        worker_id: &WorkerId,
        is_bucket_id_taken: &dyn Fn(&BucketId) -> bool,
    ) -> Result<TestHistoryTrackerAcceptResult> {
        let attempts_allowed = self.number_of_attempts_to_run_tests();

        // Decide and mint retry buckets before recording anything, so a failure here
        // leaves the history untouched.
        let mut retried: Vec<TestEntry> = Vec::new();
        let mut buckets_to_reenqueue: Vec<Bucket> = Vec::new();
        for result in testing_result.failed_results() {
            let id = TestEntryHistoryId::new(bucket.bucket_id().clone(), result.test_entry.clone());
            let attempts_after_this_one = self.storage.history(&id).number_of_attempts() + 1;
            if attempts_after_this_one < attempts_allowed {
                let new_bucket_id = BucketId::new(self.id_generator.generate());
                let minted_twice = buckets_to_reenqueue
                    .iter()
                    .any(|b| b.bucket_id() == &new_bucket_id);
                if minted_twice || is_bucket_id_taken(&new_bucket_id) {
                    return Err(QueueError::DuplicateBucketId(new_bucket_id));
                }
                let new_bucket =
                    bucket.with_new_id(new_bucket_id, vec![result.test_entry.clone()])?;
                retried.push(result.test_entry.clone());
                buckets_to_reenqueue.push(new_bucket);
            } else {
                tracing::debug!(
                    bucket_id = %bucket.bucket_id(),
                    test_entry = %result.test_entry,
                    attempts = attempts_after_this_one,
                    "Test failure is final"
                );
            }
        }

        for result in &testing_result.results {
            let id = TestEntryHistoryId::new(bucket.bucket_id().clone(), result.test_entry.clone());
            self.storage.register_attempt(&id, result.clone(), worker_id);
        }

        for new_bucket in &buckets_to_reenqueue {
            for entry in new_bucket.test_entries() {
                let id = TestEntryHistoryId::new(bucket.bucket_id().clone(), entry.clone());
                self.storage
                    .register_reenqueued_bucket_id(&id, new_bucket.bucket_id());
                tracing::debug!(
                    bucket_id = %bucket.bucket_id(),
                    retry_bucket_id = %new_bucket.bucket_id(),
                    test_entry = %entry,
                    "Test will be retried"
                );
            }
        }

        let TestingResult {
            bucket_id,
            test_destination,
            results,
        } = testing_result;
        let results = results
            .into_iter()
            .filter(|r| !retried.contains(&r.test_entry))
            .collect();

        Ok(TestHistoryTrackerAcceptResult {
            buckets_to_reenqueue,
            testing_result: TestingResult::new(bucket_id, test_destination, results),
        })
    }

    fn bucket_to_dequeue(
        &self,
        worker_id: &WorkerId,
        queue: &[&EnqueuedBucket],
        working_condition_worker_ids: &dyn Fn() -> Vec<WorkerId>,
    ) -> Option<BucketId> {
        let not_failing_on_worker = queue.iter().find(|enqueued| {
            !self.bucket_was_failing(&enqueued.bucket, |history| {
                history.is_failing_on_worker(worker_id)
            })
        });
        if let Some(enqueued) = not_failing_on_worker {
            return Some(enqueued.bucket.bucket_id().clone());
        }
        if queue.is_empty() {
            return None;
        }

        // Every candidate failed on this worker before. Hand one out only once it has
        // failed on every worker that could take it, otherwise leave it for the others.
        let worker_ids = working_condition_worker_ids();
        queue
            .iter()
            .find(|enqueued| {
                self.bucket_was_failing(&enqueued.bucket, |history| {
                    worker_ids.iter().all(|id| history.is_failing_on_worker(id))
                })
            })
            .map(|enqueued| enqueued.bucket.bucket_id().clone())
    }
}
