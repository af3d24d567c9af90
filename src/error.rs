use thiserror::Error;

use crate::models::{BucketId, JobId, TestEntry, WorkerId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("No bucket {bucket_id} is dequeued by worker {worker_id}")]
    NoDequeuedBucket {
        bucket_id: BucketId,
        worker_id: WorkerId,
    },

    #[error(
        "Result for bucket {bucket_id} does not match its test entries \
         (missing: {missing:?}, unexpected: {unexpected:?})"
    )]
    NotAllResultsAvailable {
        bucket_id: BucketId,
        missing: Vec<TestEntry>,
        unexpected: Vec<TestEntry>,
    },

    #[error("Bucket {0} is already known to the queue")]
    DuplicateBucketId(BucketId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Worker is not registered: {0}")]
    WorkerNotRegistered(WorkerId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
