use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::capabilities::{requirements_satisfied, WorkerCapability};
use crate::clock::DateProvider;
use crate::error::{QueueError, Result};
use crate::history::TestHistoryTracker;
use crate::models::{
    Bucket, BucketId, DequeuedBucket, EnqueuedBucket, JobId, TestEntry, TestingResult, WorkerId,
};
use crate::worker::{WorkerAliveness, WorkerAlivenessProvider};

/// Retry buckets go right after the head of the pending pool so they interleave with fresh
/// work instead of piling up at the tail.
const RETRY_INSERTION_POSITION: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueState {
    pub pending_bucket_count: usize,
    pub dequeued_bucket_count: usize,
}

impl QueueState {
    pub fn is_depleted(&self) -> bool {
        self.pending_bucket_count == 0 && self.dequeued_bucket_count == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckReason {
    WorkerIsNotRegistered,
    WorkerIsDisabled,
    WorkerIsSilent,
    WorkerIsNotAllowedToUtilize,
}

impl StuckReason {
    /// `None` while the worker is in working condition.
    fn from_aliveness(aliveness: &WorkerAliveness) -> Option<Self> {
        if aliveness.is_in_working_condition() {
            None
        } else if !aliveness.registered {
            Some(StuckReason::WorkerIsNotRegistered)
        } else if aliveness.disabled {
            Some(StuckReason::WorkerIsDisabled)
        } else if aliveness.silent {
            Some(StuckReason::WorkerIsSilent)
        } else {
            Some(StuckReason::WorkerIsNotAllowedToUtilize)
        }
    }
}

impl std::fmt::Display for StuckReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StuckReason::WorkerIsNotRegistered => write!(f, "worker is not registered"),
            StuckReason::WorkerIsDisabled => write!(f, "worker is disabled"),
            StuckReason::WorkerIsSilent => write!(f, "worker is silent"),
            StuckReason::WorkerIsNotAllowedToUtilize => write!(f, "worker is not allowed to utilize"),
        }
    }
}

/// A dequeued bucket that was moved back to pending because its worker stopped being
/// in working condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StuckBucket {
    pub job_id: JobId,
    pub bucket_id: BucketId,
    pub worker_id: WorkerId,
    pub reason: StuckReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketQueueAcceptResult {
    pub dequeued_bucket: DequeuedBucket,
    pub testing_result_to_collect: TestingResult,
    pub reenqueued_bucket_ids: Vec<BucketId>,
}

/// Pools of one job. Every bucket id in `known` is in exactly one of `pending`,
/// `dequeued` or `completed`.
#[derive(Debug, Default)]
struct Pools {
    pending: Vec<EnqueuedBucket>,
    dequeued: Vec<DequeuedBucket>,
    completed: HashSet<BucketId>,
    known: HashSet<BucketId>,
    /// Set while the job is deleted: nothing goes back to `pending`.
    deleted: bool,
}

impl Pools {
    fn state(&self) -> QueueState {
        QueueState {
            pending_bucket_count: self.pending.len(),
            dequeued_bucket_count: self.dequeued.len(),
        }
    }

    fn drop_pending(&mut self) -> usize {
        let removed = std::mem::take(&mut self.pending);
        for enqueued in &removed {
            self.known.remove(enqueued.bucket.bucket_id());
        }
        removed.len()
    }

    fn dequeued_position(&self, bucket_id: &BucketId) -> Option<usize> {
        self.dequeued
            .iter()
            .position(|d| d.bucket.bucket_id() == bucket_id)
    }

    /// Rejects ids already known to the job and ids repeated within the batch.
    fn validate_new(&self, buckets: &[Bucket]) -> Result<()> {
        let mut batch = HashSet::new();
        for bucket in buckets {
            let id = bucket.bucket_id();
            if self.known.contains(id) || !batch.insert(id) {
                return Err(QueueError::DuplicateBucketId(id.clone()));
            }
        }
        Ok(())
    }
}

/// Transactional queue of a single job.
///
/// Enqueue, dequeue, result acceptance and re-enqueueing are the only mutations of the
/// pools, and each one runs entirely inside the pools' mutex: other callers never observe
/// a bucket half-way between two pools. A failed call leaves the pools untouched.
pub struct BucketQueue {
    job_id: JobId,
    pools: Mutex<Pools>,
    date_provider: Arc<dyn DateProvider>,
    test_history_tracker: Arc<dyn TestHistoryTracker>,
    worker_aliveness_provider: Arc<dyn WorkerAlivenessProvider>,
}

impl BucketQueue {
    pub fn new(
        job_id: JobId,
        date_provider: Arc<dyn DateProvider>,
        test_history_tracker: Arc<dyn TestHistoryTracker>,
        worker_aliveness_provider: Arc<dyn WorkerAlivenessProvider>,
    ) -> Self {
        Self {
            job_id,
            pools: Mutex::new(Pools::default()),
            date_provider,
            test_history_tracker,
            worker_aliveness_provider,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Appends buckets to the pending pool. Fails without enqueueing anything if any id
    /// is already known to this queue or repeats within `buckets`.
    pub fn enqueue(&self, buckets: Vec<Bucket>) -> Result<()> {
        let mut pools = self.pools.lock();
        pools.validate_new(&buckets)?;
        let position = pools.pending.len();
        self.insert_locked(&mut pools, buckets, position);
        Ok(())
    }

    /// Like [`enqueue`](Self::enqueue) but silently skips ids this queue has already seen,
    /// which makes repeated scheduling of the same buckets idempotent. Returns how many
    /// buckets were actually added. Revives a deleted queue once the buckets are accepted.
    pub fn enqueue_unseen(&self, buckets: Vec<Bucket>) -> Result<usize> {
        let mut pools = self.pools.lock();
        let fresh: Vec<Bucket> = buckets
            .into_iter()
            .filter(|b| !pools.known.contains(b.bucket_id()))
            .collect();
        pools.validate_new(&fresh)?;
        if pools.deleted {
            pools.deleted = false;
            tracing::debug!(job_id = %self.job_id, "Revived deleted queue");
        }
        let count = fresh.len();
        let position = pools.pending.len();
        self.insert_locked(&mut pools, fresh, position);
        Ok(count)
    }

    /// Drops every pending bucket and stops anything from returning to pending: retries
    /// of results accepted later and buckets taken from dead workers are discarded.
    /// Dequeued buckets may still report results. Their ids are forgotten, so scheduling
    /// them again enqueues them anew. Returns how many pending buckets were removed.
    pub fn delete(&self) -> usize {
        let mut pools = self.pools.lock();
        pools.deleted = true;
        let removed = pools.drop_pending();
        tracing::debug!(job_id = %self.job_id, removed, "Deleted queue");
        removed
    }

    pub fn is_deleted(&self) -> bool {
        self.pools.lock().deleted
    }

    /// Hands the earliest capability-matching bucket the history tracker accepts to
    /// `worker_id`. Returns `None` when the worker is not in working condition or nothing
    /// suitable is pending.
    pub fn dequeue_bucket(
        &self,
        worker_capabilities: &[WorkerCapability],
        worker_id: &WorkerId,
    ) -> Option<DequeuedBucket> {
        let aliveness = self.worker_aliveness_provider.aliveness_for_worker(worker_id);
        if !aliveness.is_in_working_condition() {
            tracing::debug!(job_id = %self.job_id, worker_id = %worker_id, status = %aliveness.status(), "Worker is not in working condition");
            return None;
        }

        let mut pools = self.pools.lock();
        let candidates: Vec<&EnqueuedBucket> = pools
            .pending
            .iter()
            .filter(|e| {
                requirements_satisfied(e.bucket.worker_capability_requirements(), worker_capabilities)
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let provider = &self.worker_aliveness_provider;
        let bucket_id = self.test_history_tracker.bucket_to_dequeue(
            worker_id,
            &candidates,
            &|| provider.worker_ids_in_working_condition(),
        )?;

        let position = pools
            .pending
            .iter()
            .position(|e| e.bucket.bucket_id() == &bucket_id)?;
        let enqueued = pools.pending.remove(position);
        let dequeued = DequeuedBucket {
            bucket: enqueued.bucket,
            worker_id: worker_id.clone(),
            dequeue_timestamp: self.date_provider.current_date(),
        };
        pools.dequeued.push(dequeued.clone());

        self.worker_aliveness_provider
            .did_dequeue_bucket(&bucket_id, worker_id);
        tracing::debug!(
            job_id = %self.job_id,
            bucket_id = %bucket_id,
            worker_id = %worker_id,
            dequeued = pools.dequeued.len(),
            "Dequeued bucket"
        );

        Some(dequeued)
    }

    pub fn has_dequeued_bucket(&self, bucket_id: &BucketId, worker_id: &WorkerId) -> bool {
        let pools = self.pools.lock();
        pools
            .dequeued
            .iter()
            .any(|d| d.bucket.bucket_id() == bucket_id && &d.worker_id == worker_id)
    }

    /// Accepts `testing_result` for a bucket previously dequeued by `worker_id`.
    ///
    /// The result must cover exactly the bucket's test entries. On success the bucket is
    /// completed and any retry buckets decided by the history tracker are enqueued.
    pub fn accept(
        &self,
        testing_result: TestingResult,
        bucket_id: &BucketId,
        worker_id: &WorkerId,
    ) -> Result<BucketQueueAcceptResult> {
        let mut pools = self.pools.lock();

        let position = pools
            .dequeued_position(bucket_id)
            .filter(|&p| &pools.dequeued[p].worker_id == worker_id)
            .ok_or_else(|| {
                tracing::warn!(job_id = %self.job_id, bucket_id = %bucket_id, worker_id = %worker_id, "No dequeued bucket for result");
                QueueError::NoDequeuedBucket {
                    bucket_id: bucket_id.clone(),
                    worker_id: worker_id.clone(),
                }
            })?;

        let bucket = pools.dequeued[position].bucket.clone();
        validate_coverage(&bucket, &testing_result)?;

        let accepted = self.test_history_tracker.accept(
            testing_result,
            &bucket,
            worker_id,
            &|id| pools.known.contains(id),
        )?;

        let dequeued_bucket = pools.dequeued.remove(position);
        pools.completed.insert(bucket_id.clone());
        self.worker_aliveness_provider
            .did_obtain_result(bucket_id, worker_id);

        let buckets_to_reenqueue = if pools.deleted {
            if !accepted.buckets_to_reenqueue.is_empty() {
                tracing::debug!(job_id = %self.job_id, bucket_id = %bucket_id, "Retries of deleted job discarded");
            }
            Vec::new()
        } else {
            accepted.buckets_to_reenqueue
        };
        let reenqueued_bucket_ids: Vec<BucketId> = buckets_to_reenqueue
            .iter()
            .map(|b| b.bucket_id().clone())
            .collect();
        let position = RETRY_INSERTION_POSITION.min(pools.pending.len());
        self.insert_locked(&mut pools, buckets_to_reenqueue, position);

        tracing::debug!(
            job_id = %self.job_id,
            bucket_id = %bucket_id,
            worker_id = %worker_id,
            retries = reenqueued_bucket_ids.len(),
            dequeued = pools.dequeued.len(),
            "Accepted bucket result"
        );

        Ok(BucketQueueAcceptResult {
            dequeued_bucket,
            testing_result_to_collect: accepted.testing_result,
            reenqueued_bucket_ids,
        })
    }

    /// Moves every bucket dequeued by `worker_id` back to pending if that worker is no
    /// longer in working condition. Does nothing for a healthy worker.
    pub fn reenqueue_buckets_of_dead_worker(&self, worker_id: &WorkerId) -> Vec<StuckBucket> {
        let aliveness = self.worker_aliveness_provider.aliveness_for_worker(worker_id);
        let Some(reason) = StuckReason::from_aliveness(&aliveness) else {
            return Vec::new();
        };
        self.reenqueue_where(|dequeued| (&dequeued.worker_id == worker_id).then_some(reason))
    }

    /// Moves back to pending every dequeued bucket whose worker is not in working condition.
    pub fn reenqueue_stuck_buckets(&self) -> Vec<StuckBucket> {
        let provider = &self.worker_aliveness_provider;
        self.reenqueue_where(|dequeued| {
            StuckReason::from_aliveness(&provider.aliveness_for_worker(&dequeued.worker_id))
        })
    }

    fn reenqueue_where(
        &self,
        mut stuck_reason: impl FnMut(&DequeuedBucket) -> Option<StuckReason>,
    ) -> Vec<StuckBucket> {
        let mut pools = self.pools.lock();
        let now = self.date_provider.current_date();

        let mut stuck = Vec::new();
        let mut returned = Vec::new();
        let mut index = 0;
        while index < pools.dequeued.len() {
            match stuck_reason(&pools.dequeued[index]) {
                Some(reason) => {
                    let dequeued = pools.dequeued.remove(index);
                    stuck.push(StuckBucket {
                        job_id: self.job_id.clone(),
                        bucket_id: dequeued.bucket.bucket_id().clone(),
                        worker_id: dequeued.worker_id.clone(),
                        reason,
                    });
                    returned.push(dequeued);
                }
                None => index += 1,
            }
        }

        for dequeued in &returned {
            self.worker_aliveness_provider
                .did_reenqueue_bucket(dequeued.bucket.bucket_id(), &dequeued.worker_id);
        }

        if pools.deleted {
            for dequeued in &returned {
                pools.known.remove(dequeued.bucket.bucket_id());
            }
        } else {
            // Returned buckets are older than anything pending, so they go first.
            let pending_tail = std::mem::take(&mut pools.pending);
            pools.pending = returned
                .into_iter()
                .map(|dequeued| EnqueuedBucket {
                    bucket: dequeued.bucket,
                    enqueue_timestamp: now,
                })
                .chain(pending_tail)
                .collect();
        }

        for s in &stuck {
            tracing::warn!(job_id = %self.job_id, bucket_id = %s.bucket_id, worker_id = %s.worker_id, reason = %s.reason, "Re-enqueued bucket of worker out of working condition");
        }
        stuck
    }

    pub fn state(&self) -> QueueState {
        self.pools.lock().state()
    }

    pub fn is_depleted(&self) -> bool {
        self.state().is_depleted()
    }

    pub fn pending_buckets(&self) -> Vec<EnqueuedBucket> {
        self.pools.lock().pending.clone()
    }

    pub fn dequeued_buckets(&self) -> Vec<DequeuedBucket> {
        self.pools.lock().dequeued.clone()
    }

    pub fn completed_bucket_ids(&self) -> BTreeSet<BucketId> {
        self.pools.lock().completed.iter().cloned().collect()
    }

    fn insert_locked(&self, pools: &mut Pools, buckets: Vec<Bucket>, position: usize) {
        if buckets.is_empty() {
            return;
        }
        let now = self.date_provider.current_date();
        for bucket in &buckets {
            pools.known.insert(bucket.bucket_id().clone());
        }
        let enqueued: Vec<EnqueuedBucket> = buckets
            .into_iter()
            .map(|bucket| EnqueuedBucket {
                bucket,
                enqueue_timestamp: now,
            })
            .collect();
        tracing::debug!(job_id = %self.job_id, count = enqueued.len(), position, "Enqueued buckets");
        pools.pending.splice(position..position, enqueued);
    }
}

/// The result must belong to the bucket and its destination, and name every test entry
/// of the bucket exactly once and nothing else.
fn validate_coverage(bucket: &Bucket, testing_result: &TestingResult) -> Result<()> {
    if &testing_result.bucket_id != bucket.bucket_id()
        || &testing_result.test_destination != bucket.test_destination()
    {
        return Err(QueueError::NotAllResultsAvailable {
            bucket_id: bucket.bucket_id().clone(),
            missing: bucket.test_entries().to_vec(),
            unexpected: testing_result
                .results
                .iter()
                .map(|r| r.test_entry.clone())
                .collect(),
        });
    }

    let expected: BTreeSet<&TestEntry> = bucket.test_entries().iter().collect();
    let actual = testing_result.test_entries();

    let missing: Vec<TestEntry> = expected
        .difference(&actual)
        .map(|e| (*e).clone())
        .collect();
    let mut unexpected: Vec<TestEntry> = actual
        .difference(&expected)
        .map(|e| (*e).clone())
        .collect();

    let mut seen = HashSet::new();
    for result in &testing_result.results {
        if !seen.insert(&result.test_entry) && !unexpected.contains(&result.test_entry) {
            unexpected.push(result.test_entry.clone());
        }
    }

    if missing.is_empty() && unexpected.is_empty() {
        Ok(())
    } else {
        Err(QueueError::NotAllResultsAvailable {
            bucket_id: bucket.bucket_id().clone(),
            missing,
            unexpected,
        })
    }
}
