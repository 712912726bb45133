//! Pool shrinker behavior: the idle filter, the billing floor, and the
//! terminate handler.


use std::time::Duration as StdDuration;

use chrono::Duration;

use dreampics::job::{self, shrink_pool, terminate_instance};
use dreampics::queue::{TaskCall, TaskSink};

use test_harness::{wait_until, DispatcherHarness, TestApp};

// ============================================================================
// Billing floor
// ============================================================================

#[tokio::test]
async fn test_shrinker_keeps_idle_instance_inside_paid_hour() {
    let harness = TestApp::new();
    // Idle past the 15-minute floor, but launched only 40 minutes ago:
    // the rest of its first hour is already paid for.
    harness.seed_pool_instance(
        "i5",
        "198.51.100.5",
        Duration::minutes(20),
        Duration::minutes(40),
    );

    shrink_pool(harness.store()).expect("sweep should succeed");

    assert!(harness.get_pool_instance("i5").is_some());
    assert!(harness.sink.terminate_calls().is_empty());
}

#[tokio::test]
async fn test_shrinker_terminates_idle_instance_past_paid_hour() {
    let harness = TestApp::new();
    harness.seed_pool_instance(
        "i5",
        "198.51.100.5",
        Duration::minutes(20),
        Duration::minutes(55),
    );

    shrink_pool(harness.store()).expect("sweep should succeed");

    assert!(harness.get_pool_instance("i5").is_none());
    assert_eq!(harness.sink.terminate_calls(), ["i5"]);
}

// ============================================================================
// Idle filter
// ============================================================================

#[tokio::test]
async fn test_shrinker_keeps_recently_used_instance() {
    let harness = TestApp::new();
    // Old enough to bill-expire, but it served a job a minute ago.
    harness.seed_pool_instance(
        "i-busy",
        "198.51.100.6",
        Duration::minutes(1),
        Duration::hours(2),
    );

    shrink_pool(harness.store()).expect("sweep should succeed");

    assert!(harness.get_pool_instance("i-busy").is_some());
    assert!(harness.sink.terminate_calls().is_empty());
}

#[tokio::test]
async fn test_shrinker_sweeps_many_instances() {
    let harness = TestApp::new();
    for i in 0..25 {
        harness.seed_pool_instance(
            &format!("i-{i:02}"),
            &format!("198.51.100.{i}"),
            Duration::minutes(30),
            Duration::hours(2),
        );
    }

    shrink_pool(harness.store()).expect("sweep should succeed");

    let mut terminated = harness.sink.terminate_calls();
    terminated.sort();
    assert_eq!(terminated.len(), 25);
    for i in 0..25 {
        assert!(harness.get_pool_instance(&format!("i-{i:02}")).is_none());
    }
}

#[tokio::test]
async fn test_shrinker_on_empty_pool_is_noop() {
    let harness = TestApp::new();

    shrink_pool(harness.store()).expect("sweep should succeed");

    assert!(harness.sink.calls().is_empty());
}

// ============================================================================
// Terminate handler
// ============================================================================

#[tokio::test]
async fn test_terminate_instance_calls_provider() {
    let harness = TestApp::new();

    terminate_instance(&harness.app, "i-gone")
        .await
        .expect("terminate should succeed");
    // Redelivery of the same task is harmless.
    terminate_instance(&harness.app, "i-gone")
        .await
        .expect("terminate should stay idempotent");

    assert_eq!(harness.cloud.terminated(), ["i-gone", "i-gone"]);
}

#[tokio::test(start_paused = true)]
async fn test_terminate_redelivers_past_transient_provider_failures() {
    let (harness, shutdown) = DispatcherHarness::spawn();
    harness.cloud.fail_next_terminations(9);

    harness.queue.submit(TaskCall::TerminateInstance {
        instance_id: "i-flaky".into(),
    });

    // Nine throttled calls, then one success: a fixed delivery cap would
    // have abandoned the instance while it kept billing.
    wait_until(StdDuration::from_secs(3600), || {
        harness.cloud.terminated().len() >= 10
    })
    .await;
    assert_eq!(harness.cloud.terminated().len(), 10);

    shutdown.cancel();
}

// ============================================================================
// Interaction with the driver
// ============================================================================

#[tokio::test]
async fn test_finished_job_feeds_the_pool_then_shrinks_after_idle() {
    let harness = TestApp::new();
    harness.seed_pool_instance(
        "i1",
        "198.51.100.7",
        Duration::seconds(1),
        Duration::hours(2),
    );

    let input_ref = harness.storage.seed("job/upload/cycle", b"input image");
    let job_id = job::create(harness.store(), &input_ref).expect("create should succeed");
    job::process_job(&harness.app, &job_id)
        .await
        .expect("driver should complete");

    // Just repooled: the sweep leaves it alone despite its age.
    shrink_pool(harness.store()).expect("sweep should succeed");
    assert!(harness.get_pool_instance("i1").is_some());
    assert!(!harness
        .sink
        .calls()
        .contains(&TaskCall::TerminateInstance {
            instance_id: "i1".into()
        }));
}
