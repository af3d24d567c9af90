//! Shared helpers for the queue integration tests.
//!
//! Provides a settable clock, a deterministic id generator and builders for buckets,
//! results and fully wired queues.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use fleet_queue::capabilities::WorkerCapabilitiesStorage;
use fleet_queue::clock::DateProvider;
use fleet_queue::config::QueueServerConfig;
use fleet_queue::history::{InMemoryTestHistoryStorage, TestHistoryStorage, TestHistoryTrackerImpl};
use fleet_queue::identifier::UniqueIdentifierGenerator;
use fleet_queue::models::{
    Bucket, BucketId, JobId, PrioritizedJob, Priority, TestDestination, TestEntry,
    TestEntryResult, TestingResult, WorkerId,
};
use fleet_queue::scheduler::{BalancingBucketQueue, BucketQueue, NothingToDequeueBehavior};
use fleet_queue::server::QueueServer;
use fleet_queue::worker::WorkerAlivenessTracker;

/// Clock that only moves when told to.
pub struct ManualDateProvider {
    now: Mutex<DateTime<Utc>>,
}

impl ManualDateProvider {
    pub fn new() -> Arc<Self> {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
            .single()
            .unwrap();
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(duration).unwrap();
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }

    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }
}

impl DateProvider for ManualDateProvider {
    fn current_date(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Produces `retry-1`, `retry-2`, ...
#[derive(Default)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl UniqueIdentifierGenerator for SequentialIdGenerator {
    fn generate(&self) -> String {
        format!("retry-{}", self.next.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

pub fn destination() -> TestDestination {
    TestDestination::new("iPhone X", "17.0")
}

pub fn entry(name: &str) -> TestEntry {
    TestEntry::new("Class", name)
}

pub fn bucket(id: &str, tests: &[&str]) -> Bucket {
    Bucket::new(
        BucketId::new(id),
        tests.iter().map(|t| entry(t)).collect(),
        destination(),
    )
}

pub fn worker(id: &str) -> WorkerId {
    WorkerId::new(id)
}

pub fn job(id: &str, priority: u32) -> PrioritizedJob {
    PrioritizedJob::standalone(JobId::new(id), Priority::new(priority))
}

pub fn passed(bucket: &Bucket) -> TestingResult {
    TestingResult::new(
        bucket.bucket_id().clone(),
        bucket.test_destination().clone(),
        bucket
            .test_entries()
            .iter()
            .cloned()
            .map(TestEntryResult::passed)
            .collect(),
    )
}

pub fn failed(bucket: &Bucket) -> TestingResult {
    TestingResult::new(
        bucket.bucket_id().clone(),
        bucket.test_destination().clone(),
        bucket
            .test_entries()
            .iter()
            .cloned()
            .map(|e| TestEntryResult::failed(e, "assertion failed"))
            .collect(),
    )
}

/// Entries named in `failing` fail, the rest pass.
pub fn mixed(bucket: &Bucket, failing: &[&str]) -> TestingResult {
    TestingResult::new(
        bucket.bucket_id().clone(),
        bucket.test_destination().clone(),
        bucket
            .test_entries()
            .iter()
            .cloned()
            .map(|e| {
                if failing.contains(&e.method_name.as_str()) {
                    TestEntryResult::failed(e, "assertion failed")
                } else {
                    TestEntryResult::passed(e)
                }
            })
            .collect(),
    )
}

pub fn ids(values: &[&str]) -> BTreeSet<BucketId> {
    values.iter().map(|v| BucketId::new(*v)).collect()
}

/// Silence limit the server would derive from these report settings.
pub fn maximum_silence(report_alive_interval: Duration, grace: Duration) -> Option<Duration> {
    QueueServerConfig::default()
        .with_report_alive_interval(report_alive_interval)
        .with_additional_time_to_perform_worker_is_alive_report(grace)
        .maximum_silence_duration()
}

/// Everything a single [`BucketQueue`] or a [`BalancingBucketQueue`] needs, wired over
/// a manual clock.
pub struct Fixture {
    pub clock: Arc<ManualDateProvider>,
    pub ids: Arc<SequentialIdGenerator>,
    pub storage: Arc<InMemoryTestHistoryStorage>,
    pub tracker: Arc<TestHistoryTrackerImpl>,
    pub aliveness: Arc<WorkerAlivenessTracker>,
    pub capabilities: Arc<WorkerCapabilitiesStorage>,
}

impl Fixture {
    pub fn new(number_of_retries: u32) -> Self {
        Self::with_aliveness(number_of_retries, Duration::from_secs(10), Duration::from_secs(5))
    }

    pub fn with_aliveness(
        number_of_retries: u32,
        report_alive_interval: Duration,
        grace: Duration,
    ) -> Self {
        let clock = ManualDateProvider::new();
        let ids = SequentialIdGenerator::new();
        let storage = Arc::new(InMemoryTestHistoryStorage::new());
        let tracker = Arc::new(TestHistoryTrackerImpl::new(
            number_of_retries,
            storage.clone() as Arc<dyn TestHistoryStorage>,
            ids.clone(),
        ));
        let aliveness = Arc::new(WorkerAlivenessTracker::new(
            clock.clone(),
            maximum_silence(report_alive_interval, grace),
            Vec::new(),
        ));
        Self {
            clock,
            ids,
            storage,
            tracker,
            aliveness,
            capabilities: Arc::new(WorkerCapabilitiesStorage::new()),
        }
    }

    pub fn register(&self, names: &[&str]) {
        for name in names {
            self.aliveness.did_register_worker(&worker(name));
        }
    }

    pub fn bucket_queue(&self, job_id: &str) -> BucketQueue {
        BucketQueue::new(
            JobId::new(job_id),
            self.clock.clone(),
            self.tracker.clone(),
            self.aliveness.clone(),
        )
    }

    pub fn balancing_queue(&self, behavior: NothingToDequeueBehavior) -> BalancingBucketQueue {
        BalancingBucketQueue::new(
            self.clock.clone(),
            self.tracker.clone(),
            self.aliveness.clone(),
            self.capabilities.clone(),
            behavior,
        )
    }
}

/// A queue server over a manual clock and sequential retry ids.
pub fn test_server(config: QueueServerConfig) -> (Arc<QueueServer>, Arc<ManualDateProvider>) {
    let clock = ManualDateProvider::new();
    let server = QueueServer::with_collaborators(config, clock.clone(), SequentialIdGenerator::new());
    (Arc::new(server), clock)
}
