use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capabilities::WorkerCapabilityRequirement;
use crate::error::{QueueError, Result};
use crate::models::{BucketId, WorkerId};

/// One runnable test, identified by its qualified name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestEntry {
    pub class_name: String,
    pub method_name: String,
}

impl TestEntry {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
        }
    }
}

impl std::fmt::Display for TestEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.class_name, self.method_name)
    }
}

/// The environment a bucket's tests must run in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestDestination {
    pub device_type: String,
    pub runtime: String,
}

impl TestDestination {
    pub fn new(device_type: impl Into<String>, runtime: impl Into<String>) -> Self {
        Self {
            device_type: device_type.into(),
            runtime: runtime.into(),
        }
    }
}

/// Atomic unit of dequeue. Immutable once created: changing the contents means minting a
/// new bucket with a new id through [`Bucket::with_new_id`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    bucket_id: BucketId,
    test_entries: Vec<TestEntry>,
    test_destination: TestDestination,
    #[serde(default)]
    worker_capability_requirements: Vec<WorkerCapabilityRequirement>,
}

impl Bucket {
    pub fn new(
        bucket_id: BucketId,
        test_entries: Vec<TestEntry>,
        test_destination: TestDestination,
    ) -> Self {
        Self {
            bucket_id,
            test_entries,
            test_destination,
            worker_capability_requirements: Vec::new(),
        }
    }

    pub fn with_requirements(mut self, requirements: Vec<WorkerCapabilityRequirement>) -> Self {
        self.worker_capability_requirements = requirements;
        self
    }

    /// Copy of this bucket under a fresh id holding `test_entries`.
    pub fn with_new_id(&self, bucket_id: BucketId, test_entries: Vec<TestEntry>) -> Result<Self> {
        if bucket_id == self.bucket_id {
            return Err(QueueError::DuplicateBucketId(bucket_id));
        }
        Ok(Self {
            bucket_id,
            test_entries,
            test_destination: self.test_destination.clone(),
            worker_capability_requirements: self.worker_capability_requirements.clone(),
        })
    }

    pub fn bucket_id(&self) -> &BucketId {
        &self.bucket_id
    }

    pub fn test_entries(&self) -> &[TestEntry] {
        &self.test_entries
    }

    pub fn test_destination(&self) -> &TestDestination {
        &self.test_destination
    }

    pub fn worker_capability_requirements(&self) -> &[WorkerCapabilityRequirement] {
        &self.worker_capability_requirements
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<Bucket {} with {} tests>",
            self.bucket_id,
            self.test_entries.len()
        )
    }
}

/// A bucket waiting in a job's pending pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueuedBucket {
    pub bucket: Bucket,
    pub enqueue_timestamp: DateTime<Utc>,
}

/// A bucket handed out to a worker, kept until that worker's result is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DequeuedBucket {
    pub bucket: Bucket,
    pub worker_id: WorkerId,
    pub dequeue_timestamp: DateTime<Utc>,
}
