use serde::{Deserialize, Serialize};

use crate::models::{JobGroupId, JobId};

/// Execution priority. Higher values are served first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Priority(u32);

impl Priority {
    pub const LOWEST: Priority = Priority(0);
    pub const MEDIUM: Priority = Priority(500);
    pub const HIGHEST: Priority = Priority(999);

    pub fn new(value: u32) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job id together with everything needed to order it against other jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrioritizedJob {
    pub job_id: JobId,
    pub job_priority: Priority,
    pub job_group_id: JobGroupId,
    pub job_group_priority: Priority,
}

impl PrioritizedJob {
    pub fn new(
        job_id: JobId,
        job_priority: Priority,
        job_group_id: JobGroupId,
        job_group_priority: Priority,
    ) -> Self {
        Self {
            job_id,
            job_priority,
            job_group_id,
            job_group_priority,
        }
    }

    /// A job that forms a group of its own, with the group sharing the job's priority.
    pub fn standalone(job_id: JobId, job_priority: Priority) -> Self {
        let job_group_id = JobGroupId::new(job_id.as_str());
        Self {
            job_id,
            job_priority,
            job_group_id,
            job_group_priority: job_priority,
        }
    }
}
