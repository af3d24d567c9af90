use std::collections::{BTreeSet, HashMap};

use crate::models::BucketId;

/// Counted set of bucket ids a worker has fetched but not yet reported results for.
///
/// A bucket may be fetched more than once before any completion is observed (a retried
/// request racing the original one). The id stays "in flight" until every fetch has been
/// matched by a completion; counts never go below zero.
#[derive(Debug, Clone, Default)]
pub struct CurrentlyBeingProcessedBucketsTracker {
    counts: HashMap<BucketId, usize>,
}

impl CurrentlyBeingProcessedBucketsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn did_fetch(&mut self, bucket_id: &BucketId) {
        *self.counts.entry(bucket_id.clone()).or_insert(0) += 1;
    }

    /// Returns false if the bucket was not being tracked.
    pub fn did_obtain_result(&mut self, bucket_id: &BucketId) -> bool {
        match self.counts.get_mut(bucket_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.counts.remove(bucket_id);
                true
            }
            None => false,
        }
    }

    /// Replaces the tracked set with what the worker reports. Ids it still reports keep
    /// their counts, new ones start at one, and ids it no longer reports are dropped.
    pub fn set_processing(&mut self, bucket_ids: &BTreeSet<BucketId>) {
        self.counts.retain(|bucket_id, _| bucket_ids.contains(bucket_id));
        for bucket_id in bucket_ids {
            self.counts.entry(bucket_id.clone()).or_insert(1);
        }
    }

    /// Drops the id regardless of its count, e.g. once the bucket was taken away from the worker.
    pub fn forget(&mut self, bucket_id: &BucketId) {
        self.counts.remove(bucket_id);
    }

    pub fn reset(&mut self) {
        self.counts.clear();
    }

    pub fn count(&self, bucket_id: &BucketId) -> usize {
        self.counts.get(bucket_id).copied().unwrap_or(0)
    }

    pub fn contains(&self, bucket_id: &BucketId) -> bool {
        self.count(bucket_id) > 0
    }

    pub fn bucket_ids(&self) -> BTreeSet<BucketId> {
        self.counts.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
