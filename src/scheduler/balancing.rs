use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::capabilities::{WorkerCapabilitiesStorage, WorkerCapability};
use crate::clock::DateProvider;
use crate::error::{QueueError, Result};
use crate::history::TestHistoryTracker;
use crate::models::{
    Bucket, BucketId, DequeuedBucket, JobGroupId, JobId, PrioritizedJob, Priority, TestingResult,
    WorkerId,
};
use crate::scheduler::job::{DefinesExecutionOrder, Job, JobGroup, JobQueue};
use crate::scheduler::queue::{BucketQueue, BucketQueueAcceptResult, QueueState, StuckBucket};
use crate::scheduler::state::JobResults;
use crate::worker::WorkerAlivenessProvider;

const DEFAULT_CHECK_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DequeueResult {
    Dequeued(DequeuedBucket),
    /// Nothing suitable right now; the worker should ask again after the delay.
    CheckAgainLater { check_after: Duration },
    /// Terminal: the worker should stop polling.
    WorkerHasNoMoreBucketsToDequeue,
}

/// What a worker is told when no job has a bucket for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NothingToDequeueBehavior {
    /// Always keep the worker parked.
    CheckLater {
        #[serde(with = "crate::config::duration_secs")]
        check_after: Duration,
    },
    /// Keep the worker parked while some job is still ongoing, release it once every
    /// queue is depleted.
    WaitForAllQueuesToDeplete {
        #[serde(with = "crate::config::duration_secs")]
        check_after: Duration,
    },
}

impl Default for NothingToDequeueBehavior {
    fn default() -> Self {
        NothingToDequeueBehavior::CheckLater {
            check_after: DEFAULT_CHECK_AFTER,
        }
    }
}

impl NothingToDequeueBehavior {
    pub fn dequeue_result(&self, all_queues_depleted: bool) -> DequeueResult {
        match *self {
            NothingToDequeueBehavior::CheckLater { check_after } => {
                DequeueResult::CheckAgainLater { check_after }
            }
            NothingToDequeueBehavior::WaitForAllQueuesToDeplete { check_after } => {
                if all_queues_depleted {
                    DequeueResult::WorkerHasNoMoreBucketsToDequeue
                } else {
                    DequeueResult::CheckAgainLater { check_after }
                }
            }
        }
    }
}

#[derive(Default)]
struct JobQueues {
    /// Kept sorted by execution order.
    running: Vec<Arc<JobQueue>>,
    deleted: Vec<Arc<JobQueue>>,
    /// Groups with at least one running job, with the number of such jobs.
    job_groups: HashMap<(JobGroupId, Priority), (JobGroup, usize)>,
}

impl JobQueues {
    fn running(&self, job_id: &JobId) -> Option<&Arc<JobQueue>> {
        self.running.iter().find(|q| &q.job.job_id == job_id)
    }

    fn deleted_position(&self, job_id: &JobId) -> Option<usize> {
        self.deleted.iter().position(|q| &q.job.job_id == job_id)
    }

    fn add_running(&mut self, job_queue: Arc<JobQueue>) {
        self.running.push(job_queue);
        self.running.sort_by(|l, r| l.execution_order(r).into());
    }

    fn track(&mut self, job_group: &JobGroup) {
        let key = (job_group.job_group_id.clone(), job_group.priority);
        self.job_groups
            .entry(key)
            .or_insert_with(|| (job_group.clone(), 0))
            .1 += 1;
    }

    fn untrack(&mut self, job_group: &JobGroup) {
        let key = (job_group.job_group_id.clone(), job_group.priority);
        if let Some((_, count)) = self.job_groups.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.job_groups.remove(&key);
            }
        }
    }
}

/// Composes one [`BucketQueue`] per job behind a single enqueue/dequeue/accept surface.
///
/// The job list sits behind a read-write lock that is only held to look up or reorder
/// queues; dequeue and accept take a snapshot of the ordered list and then rely on each
/// job queue's own mutex, so different jobs are served in parallel.
pub struct BalancingBucketQueue {
    queues: RwLock<JobQueues>,
    sequence: AtomicU64,
    date_provider: Arc<dyn DateProvider>,
    test_history_tracker: Arc<dyn TestHistoryTracker>,
    worker_aliveness_provider: Arc<dyn WorkerAlivenessProvider>,
    worker_capabilities_storage: Arc<WorkerCapabilitiesStorage>,
    nothing_to_dequeue_behavior: NothingToDequeueBehavior,
}

impl BalancingBucketQueue {
    pub fn new(
        date_provider: Arc<dyn DateProvider>,
        test_history_tracker: Arc<dyn TestHistoryTracker>,
        worker_aliveness_provider: Arc<dyn WorkerAlivenessProvider>,
        worker_capabilities_storage: Arc<WorkerCapabilitiesStorage>,
        nothing_to_dequeue_behavior: NothingToDequeueBehavior,
    ) -> Self {
        Self {
            queues: RwLock::new(JobQueues::default()),
            sequence: AtomicU64::new(0),
            date_provider,
            test_history_tracker,
            worker_aliveness_provider,
            worker_capabilities_storage,
            nothing_to_dequeue_behavior,
        }
    }

    /// Routes `buckets` to the job's queue, creating the queue for a new job and reviving
    /// it for a previously deleted one. Bucket ids the job has already seen are skipped.
    /// Returns how many buckets were enqueued.
    pub fn enqueue(&self, buckets: Vec<Bucket>, prioritized_job: &PrioritizedJob) -> Result<usize> {
        let mut queues = self.queues.write();

        if let Some(job_queue) = queues.running(&prioritized_job.job_id) {
            return job_queue.bucket_queue.enqueue_unseen(buckets);
        }

        if let Some(position) = queues.deleted_position(&prioritized_job.job_id) {
            let job_queue = queues.deleted[position].clone();
            let count = job_queue.bucket_queue.enqueue_unseen(buckets)?;
            queues.deleted.remove(position);
            queues.track(&job_queue.job_group);
            queues.add_running(job_queue);
            tracing::info!(job_id = %prioritized_job.job_id, buckets = count, "Revived deleted job");
            return Ok(count);
        }

        let job_queue = Arc::new(self.create_job_queue(&queues, prioritized_job));
        let count = job_queue.bucket_queue.enqueue_unseen(buckets)?;
        queues.track(&job_queue.job_group);
        queues.add_running(job_queue);
        tracing::info!(
            job_id = %prioritized_job.job_id,
            job_group_id = %prioritized_job.job_group_id,
            priority = %prioritized_job.job_priority,
            buckets = count,
            "Created job queue"
        );
        Ok(count)
    }

    fn create_job_queue(&self, queues: &JobQueues, prioritized_job: &PrioritizedJob) -> JobQueue {
        let now = self.date_provider.current_date();
        let group_key = (
            prioritized_job.job_group_id.clone(),
            prioritized_job.job_group_priority,
        );
        let job_group = match queues.job_groups.get(&group_key) {
            Some((job_group, _)) => job_group.clone(),
            None => JobGroup {
                job_group_id: prioritized_job.job_group_id.clone(),
                priority: prioritized_job.job_group_priority,
                creation_time: now,
                sequence: self.next_sequence(),
            },
        };
        let job = Job {
            job_id: prioritized_job.job_id.clone(),
            priority: prioritized_job.job_priority,
            creation_time: now,
            sequence: self.next_sequence(),
        };
        let bucket_queue = BucketQueue::new(
            job.job_id.clone(),
            self.date_provider.clone(),
            self.test_history_tracker.clone(),
            self.worker_aliveness_provider.clone(),
        );
        JobQueue::new(job, job_group, bucket_queue)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Asks each running job, in execution order, for a bucket suitable for the worker.
    /// Falls back to the configured [`NothingToDequeueBehavior`] when none has one.
    pub fn dequeue_bucket(
        &self,
        worker_capabilities: &[WorkerCapability],
        worker_id: &WorkerId,
    ) -> DequeueResult {
        self.worker_capabilities_storage
            .set(worker_id, worker_capabilities);

        let running = self.running_job_queues();
        let aliveness = self.worker_aliveness_provider.aliveness_for_worker(worker_id);
        if aliveness.is_in_working_condition() {
            for job_queue in &running {
                if let Some(dequeued) = job_queue
                    .bucket_queue
                    .dequeue_bucket(worker_capabilities, worker_id)
                {
                    return DequeueResult::Dequeued(dequeued);
                }
            }
        } else {
            tracing::debug!(worker_id = %worker_id, status = %aliveness.status(), "Worker may not dequeue buckets");
        }

        let all_depleted = running.iter().all(|q| q.bucket_queue.is_depleted());
        self.nothing_to_dequeue_behavior.dequeue_result(all_depleted)
    }

    /// Accepts a result for a bucket dequeued by `worker_id` from any running or deleted
    /// job, and collects it into that job's results.
    pub fn accept(
        &self,
        testing_result: TestingResult,
        bucket_id: &BucketId,
        worker_id: &WorkerId,
    ) -> Result<BucketQueueAcceptResult> {
        let (running, deleted) = {
            let queues = self.queues.read();
            (queues.running.clone(), queues.deleted.clone())
        };

        let owner = running
            .iter()
            .chain(deleted.iter())
            .find(|q| q.bucket_queue.has_dequeued_bucket(bucket_id, worker_id));

        let Some(job_queue) = owner else {
            tracing::warn!(bucket_id = %bucket_id, worker_id = %worker_id, "Result for bucket that is not dequeued by worker");
            return Err(QueueError::NoDequeuedBucket {
                bucket_id: bucket_id.clone(),
                worker_id: worker_id.clone(),
            });
        };

        // A deleted queue discards the retries itself, under the same lock that revives it.
        let result = job_queue
            .bucket_queue
            .accept(testing_result, bucket_id, worker_id)?;
        job_queue.collect(result.testing_result_to_collect.clone());
        Ok(result)
    }

    /// Moves the buckets of `worker_id` back to pending in every running job, provided the
    /// worker is no longer in working condition.
    pub fn reenqueue_buckets_of_dead_worker(&self, worker_id: &WorkerId) -> Vec<StuckBucket> {
        self.running_job_queues()
            .iter()
            .flat_map(|q| q.bucket_queue.reenqueue_buckets_of_dead_worker(worker_id))
            .collect()
    }

    /// Sweeps every job for buckets held by workers out of working condition. Such buckets
    /// of deleted jobs are reported but dropped instead of being re-enqueued.
    pub fn reenqueue_stuck_buckets(&self) -> Vec<StuckBucket> {
        let (running, deleted) = {
            let queues = self.queues.read();
            (queues.running.clone(), queues.deleted.clone())
        };

        running
            .iter()
            .chain(deleted.iter())
            .flat_map(|q| q.bucket_queue.reenqueue_stuck_buckets())
            .collect()
    }

    /// Drops the job's pending buckets and moves it to the deleted list. Buckets already
    /// dequeued may still report results.
    pub fn delete(&self, job_id: &JobId) -> Result<()> {
        let mut queues = self.queues.write();
        let position = queues
            .running
            .iter()
            .position(|q| &q.job.job_id == job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))?;

        let job_queue = queues.running.remove(position);
        let removed = job_queue.bucket_queue.delete();
        queues.untrack(&job_queue.job_group);
        queues.deleted.push(job_queue);
        tracing::info!(job_id = %job_id, removed_buckets = removed, "Deleted job");
        Ok(())
    }

    pub fn results(&self, job_id: &JobId) -> Result<JobResults> {
        let job_queue = self
            .job_queue(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))?;
        Ok(JobResults {
            job_id: job_id.clone(),
            testing_results: job_queue.collected_results(),
        })
    }

    /// Jobs with pending or dequeued buckets.
    pub fn ongoing_job_ids(&self) -> BTreeSet<JobId> {
        self.running_job_queues()
            .iter()
            .filter(|q| !q.bucket_queue.is_depleted())
            .map(|q| q.job.job_id.clone())
            .collect()
    }

    pub fn ongoing_job_group_ids(&self) -> BTreeSet<JobGroupId> {
        self.running_job_queues()
            .iter()
            .filter(|q| !q.bucket_queue.is_depleted())
            .map(|q| q.job_group.job_group_id.clone())
            .collect()
    }

    /// Totals over all running jobs.
    pub fn running_queue_state(&self) -> QueueState {
        self.running_job_queues()
            .iter()
            .map(|q| q.bucket_queue.state())
            .fold(QueueState::default(), |total, state| QueueState {
                pending_bucket_count: total.pending_bucket_count + state.pending_bucket_count,
                dequeued_bucket_count: total.dequeued_bucket_count + state.dequeued_bucket_count,
            })
    }

    /// Running job queues in execution order.
    pub fn running_job_queues(&self) -> Vec<Arc<JobQueue>> {
        self.queues.read().running.clone()
    }

    pub(crate) fn deleted_job_queues(&self) -> Vec<Arc<JobQueue>> {
        self.queues.read().deleted.clone()
    }

    /// Running queue of the job, or its deleted one.
    pub fn job_queue(&self, job_id: &JobId) -> Option<Arc<JobQueue>> {
        let queues = self.queues.read();
        queues
            .running(job_id)
            .or_else(|| queues.deleted.iter().find(|q| &q.job.job_id == job_id))
            .cloned()
    }
}
