use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::capabilities::{WorkerCapabilitiesStorage, WorkerCapability};
use crate::clock::{DateProvider, SystemDateProvider};
use crate::config::QueueServerConfig;
use crate::dashboard;
use crate::error::{QueueError, Result};
use crate::history::{InMemoryTestHistoryStorage, TestHistoryTrackerImpl};
use crate::identifier::{UniqueIdentifierGenerator, UuidGenerator};
use crate::models::{Bucket, BucketId, JobId, PrioritizedJob, TestingResult, WorkerId};
use crate::scheduler::{
    BalancingBucketQueue, BucketQueueAcceptResult, DequeueResult, JobResults, JobState,
    JobStateProvider, StuckBucket,
};
use crate::worker::{UtilizationPermission, WorkerAliveness, WorkerAlivenessTracker};

/// The operations remote workers and job owners call, wired over one shared set of
/// queues and trackers.
pub struct QueueServer {
    config: QueueServerConfig,
    worker_aliveness_tracker: Arc<WorkerAlivenessTracker>,
    worker_capabilities_storage: Arc<WorkerCapabilitiesStorage>,
    balancing_queue: Arc<BalancingBucketQueue>,
}

impl QueueServer {
    pub fn new(config: QueueServerConfig) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(SystemDateProvider),
            Arc::new(UuidGenerator),
        )
    }

    /// Builds a server over the given clock and id generator.
    pub fn with_collaborators(
        config: QueueServerConfig,
        date_provider: Arc<dyn DateProvider>,
        id_generator: Arc<dyn UniqueIdentifierGenerator>,
    ) -> Self {
        let worker_aliveness_tracker = Arc::new(WorkerAlivenessTracker::new(
            date_provider.clone(),
            config.maximum_silence_duration(),
            config.known_worker_ids.iter().cloned(),
        ));
        let test_history_tracker = Arc::new(TestHistoryTrackerImpl::new(
            config.number_of_retries,
            Arc::new(InMemoryTestHistoryStorage::new()),
            id_generator,
        ));
        let worker_capabilities_storage = Arc::new(WorkerCapabilitiesStorage::new());
        let balancing_queue = Arc::new(BalancingBucketQueue::new(
            date_provider,
            test_history_tracker,
            worker_aliveness_tracker.clone(),
            worker_capabilities_storage.clone(),
            config.nothing_to_dequeue_behavior,
        ));

        Self {
            config,
            worker_aliveness_tracker,
            worker_capabilities_storage,
            balancing_queue,
        }
    }

    pub fn config(&self) -> &QueueServerConfig {
        &self.config
    }

    pub fn balancing_queue(&self) -> &BalancingBucketQueue {
        &self.balancing_queue
    }

    pub fn register_worker(&self, worker_id: &WorkerId) {
        self.worker_aliveness_tracker.did_register_worker(worker_id);
    }

    /// Enqueues the job's buckets. Scheduling the same bucket ids again has no effect.
    pub fn schedule_tests(
        &self,
        prioritized_job: &PrioritizedJob,
        buckets: Vec<Bucket>,
    ) -> Result<usize> {
        self.balancing_queue.enqueue(buckets, prioritized_job)
    }

    pub fn dequeue_bucket(
        &self,
        worker_id: &WorkerId,
        worker_capabilities: &[WorkerCapability],
    ) -> Result<DequeueResult> {
        if !self.worker_aliveness_tracker.is_registered(worker_id) {
            return Err(QueueError::WorkerNotRegistered(worker_id.clone()));
        }
        Ok(self
            .balancing_queue
            .dequeue_bucket(worker_capabilities, worker_id))
    }

    pub fn accept_bucket_result(
        &self,
        bucket_id: &BucketId,
        worker_id: &WorkerId,
        testing_result: TestingResult,
    ) -> Result<BucketQueueAcceptResult> {
        self.balancing_queue
            .accept(testing_result, bucket_id, worker_id)
    }

    /// Heartbeat. The reported ids replace the worker's in-flight set.
    pub fn report_alive(
        &self,
        worker_id: &WorkerId,
        bucket_ids_being_processed: &BTreeSet<BucketId>,
    ) -> Result<()> {
        self.worker_aliveness_tracker
            .set_bucket_ids_being_processed(bucket_ids_being_processed, worker_id)
    }

    /// Aliveness of every registered or known worker. Buckets held by workers out of
    /// working condition are moved back to pending before the snapshot is taken.
    pub fn worker_status(&self) -> BTreeMap<WorkerId, WorkerAliveness> {
        for (worker_id, aliveness) in self.worker_aliveness_tracker.worker_aliveness() {
            if aliveness.registered && !aliveness.is_in_working_condition() {
                self.balancing_queue
                    .reenqueue_buckets_of_dead_worker(&worker_id);
            }
        }
        self.worker_aliveness_tracker.worker_aliveness()
    }

    pub fn worker_capabilities(&self, worker_id: &WorkerId) -> Vec<WorkerCapability> {
        self.worker_capabilities_storage.capabilities(worker_id)
    }

    pub fn enable_worker(&self, worker_id: &WorkerId) -> Result<()> {
        self.worker_aliveness_tracker.enable_worker(worker_id)
    }

    /// Disables the worker and takes its buckets away.
    pub fn disable_worker(&self, worker_id: &WorkerId) -> Result<()> {
        self.worker_aliveness_tracker.disable_worker(worker_id)?;
        self.balancing_queue
            .reenqueue_buckets_of_dead_worker(worker_id);
        Ok(())
    }

    /// Like [`disable_worker`](Self::disable_worker), and also discards whatever the
    /// worker reported as in flight.
    pub fn block_worker(&self, worker_id: &WorkerId) -> Result<()> {
        self.worker_aliveness_tracker.block_worker(worker_id)?;
        self.balancing_queue
            .reenqueue_buckets_of_dead_worker(worker_id);
        Ok(())
    }

    pub fn set_utilization_permission(
        &self,
        worker_id: &WorkerId,
        permission: UtilizationPermission,
    ) -> Result<()> {
        self.worker_aliveness_tracker
            .set_utilization_permission(worker_id, permission)?;
        if permission == UtilizationPermission::Disallowed {
            self.balancing_queue
                .reenqueue_buckets_of_dead_worker(worker_id);
        }
        Ok(())
    }

    pub fn job_state(&self, job_id: &JobId) -> Result<JobState> {
        JobStateProvider::state(self.balancing_queue.as_ref(), job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))
    }

    pub fn all_job_states(&self) -> Vec<JobState> {
        self.balancing_queue.all_job_states()
    }

    pub fn ongoing_job_ids(&self) -> BTreeSet<JobId> {
        JobStateProvider::ongoing_job_ids(self.balancing_queue.as_ref())
    }

    pub fn job_results(&self, job_id: &JobId) -> Result<JobResults> {
        self.balancing_queue.results(job_id)
    }

    pub fn delete_job(&self, job_id: &JobId) -> Result<()> {
        self.balancing_queue.delete(job_id)
    }

    pub fn reenqueue_stuck_buckets(&self) -> Vec<StuckBucket> {
        self.balancing_queue.reenqueue_stuck_buckets()
    }

    /// Runs the background tasks until `shutdown` is cancelled:
    /// 1. Binds and serves the dashboard, if configured
    /// 2. Periodically re-enqueues buckets stuck on workers out of working condition
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the dashboard address cannot
    /// be bound.
    pub async fn run(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> std::result::Result<(), Box<dyn std::error::Error>> {
        self.config.validate()?;

        let dashboard_handle = match self.config.dashboard_addr {
            Some(addr) => {
                let listener = tokio::net::TcpListener::bind(addr).await?;
                tracing::info!(addr = %addr, "Dashboard listening");
                let server = self.clone();
                let token = shutdown.clone();
                Some(tokio::spawn(async move {
                    dashboard::serve(listener, server, token).await;
                }))
            }
            None => None,
        };

        let mut poll_interval = tokio::time::interval(self.config.stuck_bucket_poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            number_of_retries = self.config.number_of_retries,
            poll_interval_ms = self.config.stuck_bucket_poll_interval.as_millis() as u64,
            "Queue server started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, stopping queue server");
                    break;
                }
                _ = poll_interval.tick() => {
                    let stuck = self.reenqueue_stuck_buckets();
                    if !stuck.is_empty() {
                        tracing::info!(count = stuck.len(), "Re-enqueued stuck buckets");
                    }
                }
            }
        }

        if let Some(handle) = dashboard_handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Dashboard task failed");
            }
        }
        Ok(())
    }
}
