use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::models::{JobGroupId, JobId, Priority, TestingResult};
use crate::scheduler::queue::BucketQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOrder {
    Before,
    Equal,
    After,
}

impl From<Ordering> for ExecutionOrder {
    fn from(ordering: Ordering) -> Self {
        match ordering {
            Ordering::Less => ExecutionOrder::Before,
            Ordering::Equal => ExecutionOrder::Equal,
            Ordering::Greater => ExecutionOrder::After,
        }
    }
}

impl From<ExecutionOrder> for Ordering {
    fn from(order: ExecutionOrder) -> Self {
        match order {
            ExecutionOrder::Before => Ordering::Less,
            ExecutionOrder::Equal => Ordering::Equal,
            ExecutionOrder::After => Ordering::Greater,
        }
    }
}

/// Total order used to decide which job is served first. `Before` sorts first.
pub trait DefinesExecutionOrder {
    fn execution_order(&self, other: &Self) -> ExecutionOrder;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub job_id: JobId,
    pub priority: Priority,
    pub creation_time: DateTime<Utc>,
    /// Arrival order among all jobs; breaks ties between equal priorities.
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobGroup {
    pub job_group_id: JobGroupId,
    pub priority: Priority,
    pub creation_time: DateTime<Utc>,
    pub sequence: u64,
}

/// Higher priority first, then earlier arrival.
fn compare(
    left_priority: Priority,
    left_sequence: u64,
    right_priority: Priority,
    right_sequence: u64,
) -> Ordering {
    right_priority
        .cmp(&left_priority)
        .then(left_sequence.cmp(&right_sequence))
}

impl DefinesExecutionOrder for Job {
    fn execution_order(&self, other: &Self) -> ExecutionOrder {
        compare(self.priority, self.sequence, other.priority, other.sequence).into()
    }
}

impl DefinesExecutionOrder for JobGroup {
    fn execution_order(&self, other: &Self) -> ExecutionOrder {
        compare(self.priority, self.sequence, other.priority, other.sequence).into()
    }
}

/// One job's bucket queue together with its ordering data and collected results.
pub struct JobQueue {
    pub job: Job,
    pub job_group: JobGroup,
    pub bucket_queue: BucketQueue,
    results: Mutex<Vec<TestingResult>>,
}

impl JobQueue {
    pub fn new(job: Job, job_group: JobGroup, bucket_queue: BucketQueue) -> Self {
        Self {
            job,
            job_group,
            bucket_queue,
            results: Mutex::new(Vec::new()),
        }
    }

    pub fn collect(&self, testing_result: TestingResult) {
        self.results.lock().push(testing_result);
    }

    pub fn collected_results(&self) -> Vec<TestingResult> {
        self.results.lock().clone()
    }
}

impl DefinesExecutionOrder for JobQueue {
    /// Groups are ordered first, then jobs within them.
    fn execution_order(&self, other: &Self) -> ExecutionOrder {
        match self.job_group.execution_order(&other.job_group) {
            ExecutionOrder::Equal => self.job.execution_order(&other.job),
            order => order,
        }
    }
}
