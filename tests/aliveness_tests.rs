//! Worker aliveness state machine: registration, heartbeat staleness, disable/enable and
//! in-flight bucket bookkeeping.

mod test_harness;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use fleet_queue::error::QueueError;
use fleet_queue::models::BucketId;
use fleet_queue::worker::{
    UtilizationPermission, WorkerAlivenessProvider, WorkerAlivenessTracker, WorkerStatus,
};
use test_harness::{ids, maximum_silence, worker, ManualDateProvider};

fn tracker(
    clock: &Arc<ManualDateProvider>,
    interval: Duration,
    grace: Duration,
) -> WorkerAlivenessTracker {
    WorkerAlivenessTracker::new(clock.clone(), maximum_silence(interval, grace), Vec::new())
}

#[test]
fn test_unknown_worker_is_not_registered() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::from_secs(10), Duration::from_secs(5));

    let aliveness = tracker.aliveness_for_worker(&worker("w1"));
    assert!(!aliveness.registered);
    assert_eq!(aliveness.status(), WorkerStatus::NotRegistered);
    assert!(!aliveness.is_in_working_condition());
}

#[test]
fn test_registered_worker_is_alive() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::from_secs(10), Duration::from_secs(5));

    tracker.did_register_worker(&worker("w1"));

    let aliveness = tracker.aliveness_for_worker(&worker("w1"));
    assert_eq!(aliveness.status(), WorkerStatus::Alive);
    assert!(aliveness.is_in_working_condition());
    assert!(aliveness.bucket_ids_being_processed.is_empty());
}

#[test]
fn test_worker_becomes_silent_only_after_interval_plus_grace() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::from_secs(10), Duration::from_secs(5));
    tracker.did_register_worker(&worker("w1"));

    clock.advance_secs(15);
    assert_eq!(
        tracker.aliveness_for_worker(&worker("w1")).status(),
        WorkerStatus::Alive,
        "exactly interval + grace is still alive"
    );

    clock.advance_millis(1);
    assert_eq!(
        tracker.aliveness_for_worker(&worker("w1")).status(),
        WorkerStatus::Silent
    );
}

#[test]
fn test_heartbeat_brings_silent_worker_back() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::from_secs(10), Duration::from_secs(5));
    tracker.did_register_worker(&worker("w1"));

    clock.advance_secs(60);
    assert!(tracker.aliveness_for_worker(&worker("w1")).silent);

    tracker.worker_is_alive(&worker("w1")).unwrap();
    assert_eq!(
        tracker.aliveness_for_worker(&worker("w1")).status(),
        WorkerStatus::Alive
    );
}

#[test]
fn test_zero_interval_is_silent_after_any_elapsed_time() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::ZERO, Duration::ZERO);
    tracker.did_register_worker(&worker("w1"));
    tracker.worker_is_alive(&worker("w1")).unwrap();

    assert!(!tracker.aliveness_for_worker(&worker("w1")).silent);

    clock.advance_millis(1);
    assert!(tracker.aliveness_for_worker(&worker("w1")).silent);
}

#[test]
fn test_infinite_interval_is_never_silent() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::MAX, Duration::from_secs(5));
    tracker.did_register_worker(&worker("w1"));

    clock.advance_secs(10 * 365 * 24 * 60 * 60);
    assert!(!tracker.aliveness_for_worker(&worker("w1")).silent);
}

#[test]
fn test_disabled_worker_stays_disabled_despite_heartbeats() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::from_secs(10), Duration::from_secs(5));
    tracker.did_register_worker(&worker("w1"));

    tracker.disable_worker(&worker("w1")).unwrap();
    tracker.worker_is_alive(&worker("w1")).unwrap();
    tracker.did_register_worker(&worker("w1"));

    let aliveness = tracker.aliveness_for_worker(&worker("w1"));
    assert_eq!(aliveness.status(), WorkerStatus::Disabled);
    assert!(!aliveness.is_in_working_condition());

    tracker.enable_worker(&worker("w1")).unwrap();
    assert_eq!(
        tracker.aliveness_for_worker(&worker("w1")).status(),
        WorkerStatus::Alive
    );
}

#[test]
fn test_enable_counts_as_heartbeat() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::from_secs(10), Duration::from_secs(5));
    tracker.did_register_worker(&worker("w1"));
    tracker.disable_worker(&worker("w1")).unwrap();

    clock.advance_secs(120);
    tracker.enable_worker(&worker("w1")).unwrap();

    assert!(tracker
        .aliveness_for_worker(&worker("w1"))
        .is_in_working_condition());
}

#[test]
fn test_operations_on_unregistered_worker_fail() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::from_secs(10), Duration::from_secs(5));
    let w = worker("ghost");

    assert_eq!(
        tracker.worker_is_alive(&w),
        Err(QueueError::WorkerNotRegistered(w.clone()))
    );
    assert!(tracker.disable_worker(&w).is_err());
    assert!(tracker.enable_worker(&w).is_err());
    assert!(tracker
        .set_bucket_ids_being_processed(&ids(&["b1"]), &w)
        .is_err());
    assert!(!tracker.is_registered(&w));
}

#[test]
fn test_bucket_callbacks_for_unregistered_worker_do_not_register_it() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::from_secs(10), Duration::from_secs(5));
    let w = worker("ghost");
    let b = BucketId::new("b1");

    tracker.did_dequeue_bucket(&b, &w);
    tracker.did_obtain_result(&b, &w);
    tracker.did_reenqueue_bucket(&b, &w);

    assert!(!tracker.is_registered(&w));
    assert!(tracker.worker_aliveness().is_empty());
}

#[test]
fn test_double_fetch_keeps_bucket_in_flight_until_both_results() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::from_secs(10), Duration::from_secs(5));
    let w = worker("w1");
    let b = BucketId::new("b1");
    tracker.did_register_worker(&w);

    tracker.did_dequeue_bucket(&b, &w);
    tracker.did_dequeue_bucket(&b, &w);
    tracker.did_obtain_result(&b, &w);
    assert!(tracker
        .aliveness_for_worker(&w)
        .bucket_ids_being_processed
        .contains(&b));

    tracker.did_obtain_result(&b, &w);
    assert!(tracker
        .aliveness_for_worker(&w)
        .bucket_ids_being_processed
        .is_empty());
}

#[test]
fn test_reported_bucket_ids_replace_the_set_and_refresh_heartbeat() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::from_secs(10), Duration::from_secs(5));
    let w = worker("w1");
    tracker.did_register_worker(&w);
    tracker.did_dequeue_bucket(&BucketId::new("b1"), &w);

    clock.advance_secs(14);
    tracker
        .set_bucket_ids_being_processed(&ids(&["b1", "b2"]), &w)
        .unwrap();
    clock.advance_secs(14);

    let aliveness = tracker.aliveness_for_worker(&w);
    assert!(!aliveness.silent);
    assert_eq!(aliveness.bucket_ids_being_processed, ids(&["b1", "b2"]));

    tracker
        .set_bucket_ids_being_processed(&ids(&["b2"]), &w)
        .unwrap();
    assert_eq!(
        tracker.aliveness_for_worker(&w).bucket_ids_being_processed,
        ids(&["b2"])
    );
}

#[test]
fn test_empty_report_clears_buckets_taken_from_silent_worker() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::from_secs(10), Duration::from_secs(5));
    let w = worker("w1");
    tracker.did_register_worker(&w);

    tracker
        .set_bucket_ids_being_processed(&ids(&["x"]), &w)
        .unwrap();
    tracker
        .set_bucket_ids_being_processed(&BTreeSet::new(), &w)
        .unwrap();

    assert!(tracker
        .aliveness_for_worker(&w)
        .bucket_ids_being_processed
        .is_empty());
}

#[test]
fn test_disabled_worker_reports_do_not_change_buckets() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::from_secs(10), Duration::from_secs(5));
    let w = worker("w1");
    tracker.did_register_worker(&w);
    tracker.disable_worker(&w).unwrap();

    tracker
        .set_bucket_ids_being_processed(&ids(&["b1"]), &w)
        .unwrap();

    assert!(tracker
        .aliveness_for_worker(&w)
        .bucket_ids_being_processed
        .is_empty());
}

#[test]
fn test_block_worker_disables_and_forgets_buckets() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::from_secs(10), Duration::from_secs(5));
    let w = worker("w1");
    tracker.did_register_worker(&w);
    tracker.did_dequeue_bucket(&BucketId::new("b1"), &w);

    tracker.block_worker(&w).unwrap();

    let aliveness = tracker.aliveness_for_worker(&w);
    assert!(aliveness.disabled);
    assert!(aliveness.bucket_ids_being_processed.is_empty());
}

#[test]
fn test_disallowed_worker_is_not_in_working_condition() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::from_secs(10), Duration::from_secs(5));
    let w = worker("w1");
    tracker.did_register_worker(&w);

    tracker
        .set_utilization_permission(&w, UtilizationPermission::Disallowed)
        .unwrap();
    let aliveness = tracker.aliveness_for_worker(&w);
    assert_eq!(aliveness.status(), WorkerStatus::Alive);
    assert!(!aliveness.is_in_working_condition());
    assert!(tracker.worker_ids_in_working_condition().is_empty());
}

#[test]
fn test_worker_ids_in_working_condition_are_sorted() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::from_secs(10), Duration::from_secs(5));
    for name in ["w3", "w1", "w2"] {
        tracker.did_register_worker(&worker(name));
    }
    tracker.disable_worker(&worker("w2")).unwrap();

    assert_eq!(
        tracker.worker_ids_in_working_condition(),
        vec![worker("w1"), worker("w3")]
    );
}

#[test]
fn test_known_workers_are_reported_until_they_register() {
    let clock = ManualDateProvider::new();
    let tracker = WorkerAlivenessTracker::new(
        clock.clone(),
        maximum_silence(Duration::from_secs(10), Duration::from_secs(5)),
        vec![worker("a"), worker("b")],
    );
    tracker.did_register_worker(&worker("b"));

    let all = tracker.worker_aliveness();
    assert_eq!(all.len(), 2);
    assert_eq!(all[&worker("a")].status(), WorkerStatus::NotRegistered);
    assert_eq!(all[&worker("b")].status(), WorkerStatus::Alive);
}

#[test]
fn test_reenqueued_bucket_is_forgotten() {
    let clock = ManualDateProvider::new();
    let tracker = tracker(&clock, Duration::from_secs(10), Duration::from_secs(5));
    let w = worker("w1");
    let b = BucketId::new("b1");
    tracker.did_register_worker(&w);
    tracker.did_dequeue_bucket(&b, &w);
    tracker.did_dequeue_bucket(&b, &w);

    tracker.did_reenqueue_bucket(&b, &w);

    assert_eq!(
        tracker.aliveness_for_worker(&w).bucket_ids_being_processed,
        BTreeSet::new()
    );
}
