use std::collections::BTreeSet;

use serde::Serialize;

use crate::models::{JobId, TestingResult};
use crate::scheduler::balancing::BalancingBucketQueue;
use crate::scheduler::queue::QueueState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobQueueState {
    Queued(QueueState),
    Depleted,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobState {
    pub job_id: JobId,
    pub queue_state: JobQueueState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobResults {
    pub job_id: JobId,
    pub testing_results: Vec<TestingResult>,
}

/// Read-only view of the jobs known to the server.
pub trait JobStateProvider: Send + Sync {
    /// Jobs that still have pending or dequeued buckets.
    fn ongoing_job_ids(&self) -> BTreeSet<JobId>;

    /// `None` for a job that was never scheduled.
    fn state(&self, job_id: &JobId) -> Option<JobState>;

    /// Running jobs in execution order, then deleted ones.
    fn all_job_states(&self) -> Vec<JobState>;
}

impl JobStateProvider for BalancingBucketQueue {
    fn ongoing_job_ids(&self) -> BTreeSet<JobId> {
        BalancingBucketQueue::ongoing_job_ids(self)
    }

    fn state(&self, job_id: &JobId) -> Option<JobState> {
        self.all_job_states()
            .into_iter()
            .find(|state| &state.job_id == job_id)
    }

    fn all_job_states(&self) -> Vec<JobState> {
        let running = self.running_job_queues().into_iter().map(|q| {
            let state = q.bucket_queue.state();
            JobState {
                job_id: q.job.job_id.clone(),
                queue_state: if state.is_depleted() {
                    JobQueueState::Depleted
                } else {
                    JobQueueState::Queued(state)
                },
            }
        });
        let deleted = self.deleted_job_queues().into_iter().map(|q| JobState {
            job_id: q.job.job_id.clone(),
            queue_state: JobQueueState::Deleted,
        });
        running.chain(deleted).collect()
    }
}
