//! Value types exchanged between the queues, the history tracker and the aliveness tracker.

mod bucket;
mod ids;
mod job;
mod result;

pub use bucket::{Bucket, DequeuedBucket, EnqueuedBucket, TestDestination, TestEntry};
pub use ids::{BucketId, JobGroupId, JobId, WorkerId};
pub use job::{PrioritizedJob, Priority};
pub use result::{TestEntryResult, TestOutcome, TestingResult};
