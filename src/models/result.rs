use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::models::{BucketId, TestDestination, TestEntry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed { reason: Option<String> },
    /// The worker could not produce a result for the entry (crashed runner, timeout).
    Lost,
}

impl std::fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestOutcome::Passed => write!(f, "passed"),
            TestOutcome::Failed { .. } => write!(f, "failed"),
            TestOutcome::Lost => write!(f, "lost"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEntryResult {
    pub test_entry: TestEntry,
    pub outcome: TestOutcome,
}

impl TestEntryResult {
    pub fn passed(test_entry: TestEntry) -> Self {
        Self {
            test_entry,
            outcome: TestOutcome::Passed,
        }
    }

    pub fn failed(test_entry: TestEntry, reason: impl Into<String>) -> Self {
        Self {
            test_entry,
            outcome: TestOutcome::Failed {
                reason: Some(reason.into()),
            },
        }
    }

    pub fn lost(test_entry: TestEntry) -> Self {
        Self {
            test_entry,
            outcome: TestOutcome::Lost,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == TestOutcome::Passed
    }
}

/// Results a worker reports for one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestingResult {
    pub bucket_id: BucketId,
    pub test_destination: TestDestination,
    pub results: Vec<TestEntryResult>,
}

impl TestingResult {
    pub fn new(
        bucket_id: BucketId,
        test_destination: TestDestination,
        results: Vec<TestEntryResult>,
    ) -> Self {
        Self {
            bucket_id,
            test_destination,
            results,
        }
    }

    pub fn test_entries(&self) -> BTreeSet<&TestEntry> {
        self.results.iter().map(|r| &r.test_entry).collect()
    }

    pub fn failed_results(&self) -> impl Iterator<Item = &TestEntryResult> {
        self.results.iter().filter(|r| !r.succeeded())
    }
}
