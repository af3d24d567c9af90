use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::DateProvider;
use crate::error::{QueueError, Result};
use crate::models::{BucketId, WorkerId};
use crate::worker::processing::CurrentlyBeingProcessedBucketsTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UtilizationPermission {
    #[default]
    Allowed,
    Disallowed,
}

/// Coarse status derived from [`WorkerAliveness`], mostly for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    NotRegistered,
    Disabled,
    Silent,
    Alive,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::NotRegistered => write!(f, "not_registered"),
            WorkerStatus::Disabled => write!(f, "disabled"),
            WorkerStatus::Silent => write!(f, "silent"),
            WorkerStatus::Alive => write!(f, "alive"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerAliveness {
    pub registered: bool,
    pub disabled: bool,
    pub silent: bool,
    pub utilization_permission: UtilizationPermission,
    pub bucket_ids_being_processed: BTreeSet<BucketId>,
}

impl WorkerAliveness {
    pub fn not_registered() -> Self {
        Self {
            registered: false,
            disabled: false,
            silent: false,
            utilization_permission: UtilizationPermission::Allowed,
            bucket_ids_being_processed: BTreeSet::new(),
        }
    }

    pub fn is_in_working_condition(&self) -> bool {
        self.registered
            && !self.disabled
            && !self.silent
            && self.utilization_permission == UtilizationPermission::Allowed
    }

    pub fn status(&self) -> WorkerStatus {
        if !self.registered {
            WorkerStatus::NotRegistered
        } else if self.disabled {
            WorkerStatus::Disabled
        } else if self.silent {
            WorkerStatus::Silent
        } else {
            WorkerStatus::Alive
        }
    }
}

/// What the queues need to know about workers.
pub trait WorkerAlivenessProvider: Send + Sync {
    fn aliveness_for_worker(&self, worker_id: &WorkerId) -> WorkerAliveness;

    fn worker_ids_in_working_condition(&self) -> Vec<WorkerId>;

    fn did_dequeue_bucket(&self, bucket_id: &BucketId, worker_id: &WorkerId);

    fn did_obtain_result(&self, bucket_id: &BucketId, worker_id: &WorkerId);

    /// The bucket was taken away from the worker and put back into a pending pool.
    fn did_reenqueue_bucket(&self, bucket_id: &BucketId, worker_id: &WorkerId);
}

#[derive(Debug)]
struct WorkerRecord {
    last_alive_at: DateTime<Utc>,
    disabled: bool,
    utilization_permission: UtilizationPermission,
    processing: CurrentlyBeingProcessedBucketsTracker,
}

impl WorkerRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_alive_at: now,
            disabled: false,
            utilization_permission: UtilizationPermission::Allowed,
            processing: CurrentlyBeingProcessedBucketsTracker::new(),
        }
    }
}

/// Heartbeat state machine per worker.
///
/// Staleness is never pushed by a timer: every read compares the last heartbeat against
/// the maximum silence duration using the date provider, so a read can never observe a
/// half-applied transition.
pub struct WorkerAlivenessTracker {
    date_provider: Arc<dyn DateProvider>,
    known_worker_ids: HashSet<WorkerId>,
    /// `None` means workers never become silent.
    maximum_silence: Option<chrono::Duration>,
    workers: Mutex<HashMap<WorkerId, WorkerRecord>>,
}

impl WorkerAlivenessTracker {
    /// `maximum_silence` is how long a worker may go without a heartbeat before it is
    /// silent; `None` means never.
    pub fn new(
        date_provider: Arc<dyn DateProvider>,
        maximum_silence: Option<Duration>,
        known_worker_ids: impl IntoIterator<Item = WorkerId>,
    ) -> Self {
        let maximum_silence =
            maximum_silence.and_then(|total| chrono::Duration::from_std(total).ok());

        Self {
            date_provider,
            known_worker_ids: known_worker_ids.into_iter().collect(),
            maximum_silence,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// `notRegistered -> alive`. Registering again refreshes the heartbeat; a disabled
    /// worker stays disabled.
    pub fn did_register_worker(&self, worker_id: &WorkerId) {
        let now = self.date_provider.current_date();
        let mut workers = self.workers.lock();
        match workers.get_mut(worker_id) {
            Some(record) => {
                record.last_alive_at = now;
                tracing::info!(worker_id = %worker_id, disabled = record.disabled, "Worker re-registered");
            }
            None => {
                workers.insert(worker_id.clone(), WorkerRecord::new(now));
                tracing::info!(worker_id = %worker_id, "Worker registered");
            }
        }
    }

    /// Heartbeat without a payload.
    pub fn worker_is_alive(&self, worker_id: &WorkerId) -> Result<()> {
        self.with_record(worker_id, |record, now| {
            record.last_alive_at = now;
        })
    }

    /// Heartbeat carrying the ids the worker reports as being processed; the report
    /// replaces the worker's set. Reports from a disabled worker refresh its timestamp
    /// but do not touch its bucket set.
    pub fn set_bucket_ids_being_processed(
        &self,
        bucket_ids: &BTreeSet<BucketId>,
        worker_id: &WorkerId,
    ) -> Result<()> {
        self.with_record(worker_id, |record, now| {
            record.last_alive_at = now;
            if !record.disabled {
                record.processing.set_processing(bucket_ids);
            }
        })
    }

    pub fn disable_worker(&self, worker_id: &WorkerId) -> Result<()> {
        self.with_record(worker_id, |record, _| {
            record.disabled = true;
        })?;
        tracing::info!(worker_id = %worker_id, "Worker disabled");
        Ok(())
    }

    /// Disables the worker and forgets what it was processing.
    pub fn block_worker(&self, worker_id: &WorkerId) -> Result<()> {
        self.with_record(worker_id, |record, _| {
            record.disabled = true;
            record.processing.reset();
        })?;
        tracing::warn!(worker_id = %worker_id, "Worker blocked");
        Ok(())
    }

    /// `disabled -> alive`: clears the flag and counts as a fresh heartbeat.
    pub fn enable_worker(&self, worker_id: &WorkerId) -> Result<()> {
        self.with_record(worker_id, |record, now| {
            record.disabled = false;
            record.last_alive_at = now;
        })?;
        tracing::info!(worker_id = %worker_id, "Worker enabled");
        Ok(())
    }

    pub fn set_utilization_permission(
        &self,
        worker_id: &WorkerId,
        permission: UtilizationPermission,
    ) -> Result<()> {
        self.with_record(worker_id, |record, _| {
            record.utilization_permission = permission;
        })
    }

    pub fn is_registered(&self, worker_id: &WorkerId) -> bool {
        self.workers.lock().contains_key(worker_id)
    }

    /// Aliveness of every registered or known worker, evaluated at a single instant.
    pub fn worker_aliveness(&self) -> BTreeMap<WorkerId, WorkerAliveness> {
        let now = self.date_provider.current_date();
        let workers = self.workers.lock();

        let mut aliveness: BTreeMap<WorkerId, WorkerAliveness> = workers
            .iter()
            .map(|(id, record)| (id.clone(), self.aliveness_of(record, now)))
            .collect();
        for id in &self.known_worker_ids {
            aliveness
                .entry(id.clone())
                .or_insert_with(WorkerAliveness::not_registered);
        }
        aliveness
    }

    fn aliveness_of(&self, record: &WorkerRecord, now: DateTime<Utc>) -> WorkerAliveness {
        let silent = match self.maximum_silence {
            Some(maximum) => now.signed_duration_since(record.last_alive_at) > maximum,
            None => false,
        };
        WorkerAliveness {
            registered: true,
            disabled: record.disabled,
            silent,
            utilization_permission: record.utilization_permission,
            bucket_ids_being_processed: record.processing.bucket_ids(),
        }
    }

    fn with_record(
        &self,
        worker_id: &WorkerId,
        update: impl FnOnce(&mut WorkerRecord, DateTime<Utc>),
    ) -> Result<()> {
        let now = self.date_provider.current_date();
        let mut workers = self.workers.lock();
        let record = workers
            .get_mut(worker_id)
            .ok_or_else(|| QueueError::WorkerNotRegistered(worker_id.clone()))?;
        update(record, now);
        Ok(())
    }
}

impl WorkerAlivenessProvider for WorkerAlivenessTracker {
    fn aliveness_for_worker(&self, worker_id: &WorkerId) -> WorkerAliveness {
        let now = self.date_provider.current_date();
        self.workers
            .lock()
            .get(worker_id)
            .map(|record| self.aliveness_of(record, now))
            .unwrap_or_else(WorkerAliveness::not_registered)
    }

    fn worker_ids_in_working_condition(&self) -> Vec<WorkerId> {
        let now = self.date_provider.current_date();
        let mut ids: Vec<WorkerId> = self
            .workers
            .lock()
            .iter()
            .filter(|(_, record)| self.aliveness_of(record, now).is_in_working_condition())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn did_dequeue_bucket(&self, bucket_id: &BucketId, worker_id: &WorkerId) {
        let result = self.with_record(worker_id, |record, now| {
            record.last_alive_at = now;
            record.processing.did_fetch(bucket_id);
        });
        if result.is_err() {
            tracing::warn!(worker_id = %worker_id, bucket_id = %bucket_id, "Bucket dequeued by unregistered worker");
        }
    }

    fn did_obtain_result(&self, bucket_id: &BucketId, worker_id: &WorkerId) {
        let result = self.with_record(worker_id, |record, _| {
            record.processing.did_obtain_result(bucket_id);
        });
        if result.is_err() {
            tracing::warn!(worker_id = %worker_id, bucket_id = %bucket_id, "Result obtained from unregistered worker");
        }
    }

    fn did_reenqueue_bucket(&self, bucket_id: &BucketId, worker_id: &WorkerId) {
        let result = self.with_record(worker_id, |record, _| {
            record.processing.forget(bucket_id);
        });
        if result.is_err() {
            tracing::warn!(worker_id = %worker_id, bucket_id = %bucket_id, "Bucket re-enqueued from unregistered worker");
        }
    }
}
