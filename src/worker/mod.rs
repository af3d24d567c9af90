//! Worker liveness bookkeeping on the queue side.
//!
//! Workers are remote processes; the queue only sees their registrations, heartbeats,
//! dequeues and results. From those events it derives whether a worker is in working
//! condition:
//!
//! - **Aliveness**: [`WorkerAlivenessTracker`] keeps one record per worker id and evaluates
//!   heartbeat staleness lazily on every read.
//! - **In-flight buckets**: [`CurrentlyBeingProcessedBucketsTracker`] counts fetches and
//!   completions per bucket id so duplicate fetches never make a bucket look finished early.
//!
//! # State machine
//!
//! ```text
//! notRegistered --register--> alive <--heartbeat/timeout--> silent
//! alive | silent --disable--> disabled --enable--> alive
//! ```

pub mod aliveness;
pub mod processing;

pub use aliveness::{
    UtilizationPermission, WorkerAliveness, WorkerAlivenessProvider, WorkerAlivenessTracker,
    WorkerStatus,
};
pub use processing::CurrentlyBeingProcessedBucketsTracker;
