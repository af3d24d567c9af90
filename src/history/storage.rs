use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::models::{BucketId, TestEntry, TestEntryResult, WorkerId};

/// Key of a retry history: the test entry within the bucket where it first appeared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TestEntryHistoryId {
    pub bucket_id: BucketId,
    pub test_entry: TestEntry,
}

impl TestEntryHistoryId {
    pub fn new(bucket_id: BucketId, test_entry: TestEntry) -> Self {
        Self {
            bucket_id,
            test_entry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestRunHistoryItem {
    pub result: TestEntryResult,
    pub worker_id: WorkerId,
}

/// Every attempt of one test entry, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestEntryHistory {
    pub id: TestEntryHistoryId,
    pub items: Vec<TestRunHistoryItem>,
}

impl TestEntryHistory {
    pub fn number_of_attempts(&self) -> usize {
        self.items.len()
    }

    pub fn number_of_failures(&self) -> usize {
        self.items.iter().filter(|i| !i.result.succeeded()).count()
    }

    pub fn is_failing_on_worker(&self, worker_id: &WorkerId) -> bool {
        self.items
            .iter()
            .any(|i| &i.worker_id == worker_id && !i.result.succeeded())
    }
}

pub trait TestHistoryStorage: Send + Sync {
    fn history(&self, id: &TestEntryHistoryId) -> TestEntryHistory;

    fn register_attempt(
        &self,
        id: &TestEntryHistoryId,
        result: TestEntryResult,
        worker_id: &WorkerId,
    ) -> TestEntryHistory;

    /// Makes `reenqueued_bucket_id` share the history of `id`, so that attempts made
    /// under the retry bucket accumulate where the entry first appeared.
    fn register_reenqueued_bucket_id(
        &self,
        id: &TestEntryHistoryId,
        reenqueued_bucket_id: &BucketId,
    );
}

#[derive(Debug, Default)]
struct StorageState {
    histories: HashMap<TestEntryHistoryId, Vec<TestRunHistoryItem>>,
    aliases: HashMap<TestEntryHistoryId, TestEntryHistoryId>,
}

impl StorageState {
    fn resolve(&self, id: &TestEntryHistoryId) -> TestEntryHistoryId {
        self.aliases.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    fn history(&self, id: &TestEntryHistoryId) -> TestEntryHistory {
        let id = self.resolve(id);
        let items = self.histories.get(&id).cloned().unwrap_or_default();
        TestEntryHistory { id, items }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTestHistoryStorage {
    state: Mutex<StorageState>,
}

impl InMemoryTestHistoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TestHistoryStorage for InMemoryTestHistoryStorage {
    fn history(&self, id: &TestEntryHistoryId) -> TestEntryHistory {
        self.state.lock().history(id)
    }

    fn register_attempt(
        &self,
        id: &TestEntryHistoryId,
        result: TestEntryResult,
        worker_id: &WorkerId,
    ) -> TestEntryHistory {
        let mut state = self.state.lock();
        let resolved = state.resolve(id);
        state
            .histories
            .entry(resolved)
            .or_default()
            .push(TestRunHistoryItem {
                result,
                worker_id: worker_id.clone(),
            });
        state.history(id)
    }

    fn register_reenqueued_bucket_id(
        &self,
        id: &TestEntryHistoryId,
        reenqueued_bucket_id: &BucketId,
    ) {
        let mut state = self.state.lock();
        let original = state.resolve(id);
        let alias = TestEntryHistoryId::new(reenqueued_bucket_id.clone(), id.test_entry.clone());
        state.aliases.insert(alias, original);
    }
}
