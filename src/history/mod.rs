//! Per-test retry bookkeeping.
//!
//! Each attempt of a test entry is recorded under the id of the bucket where the entry
//! first appeared. The tracker uses that history to decide whether a failed entry gets
//! another attempt and to steer buckets away from workers they already failed on.

mod storage;
mod tracker;

pub use storage::{
    InMemoryTestHistoryStorage, TestEntryHistory, TestEntryHistoryId, TestHistoryStorage,
    TestRunHistoryItem,
};
pub use tracker::{TestHistoryTracker, TestHistoryTrackerAcceptResult, TestHistoryTrackerImpl};
