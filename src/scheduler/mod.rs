//! Job scheduling: one transactional [`BucketQueue`] per job, composed and ordered by the
//! [`BalancingBucketQueue`].

pub mod balancing;
pub mod job;
pub mod queue;
pub mod state;

pub use balancing::{BalancingBucketQueue, DequeueResult, NothingToDequeueBehavior};
pub use job::{DefinesExecutionOrder, ExecutionOrder, Job, JobGroup, JobQueue};
pub use queue::{BucketQueue, BucketQueueAcceptResult, QueueState, StuckBucket, StuckReason};
pub use state::{JobQueueState, JobResults, JobState, JobStateProvider};
