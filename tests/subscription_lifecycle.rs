//! Subscription lifecycle through the public manager API
//!
//! Run with: cargo test --test subscription_lifecycle

mod common;

use std::time::Duration;

use common::{high, medium, settle, Harness};
use realtime_sync::{ChangeKind, Release, SubscriptionKey, SubscriptionSpec};

#[tokio::test]
async fn test_idempotent_subscribe_opens_one_channel() {
    let h = Harness::new();

    let first = h.manager.subscribe(medium("jobs", "jobs-list")).await.unwrap();
    let second = h.manager.subscribe(medium("jobs", "jobs-list")).await.unwrap();

    assert!(first.same_subscription(&second));
    assert_eq!(h.feed.open_count(), 1);
    assert_eq!(h.feed.opened_total(), 1);
    assert_eq!(h.manager.subscriptions_by_table()["jobs"].len(), 1);
}

#[tokio::test]
async fn test_double_subscribe_single_unsubscribe_keeps_channel() {
    let h = Harness::new();
    let first = h.manager.subscribe(medium("jobs", "jobs-list")).await.unwrap();
    let second = h.manager.subscribe(medium("jobs", "jobs-list")).await.unwrap();
    let channel = h.feed.open_channels_for("jobs")[0].id;

    assert_eq!(
        h.manager.unsubscribe(&first).await,
        Release::Released { remaining: 1 }
    );
    assert!(h.feed.is_open(channel));
    assert!(h.manager.status("jobs", "jobs-list").unwrap().connected);

    // Still delivering to the remaining holder
    h.feed
        .emit_change("jobs", ChangeKind::Insert, serde_json::json!({ "id": 1 }));
    settle().await;
    assert_eq!(h.cache.count_for("jobs-list"), 2);

    assert_eq!(h.manager.unsubscribe(&second).await, Release::TornDown);
    assert!(!h.feed.is_open(channel));
    assert!(h.manager.status("jobs", "jobs-list").is_none());
}

#[tokio::test]
async fn test_unsubscribe_twice_is_noop() {
    let h = Harness::new();
    let handle = h.manager.subscribe(medium("jobs", "jobs-list")).await.unwrap();

    assert_eq!(handle.unsubscribe().await, Release::TornDown);
    assert_eq!(handle.unsubscribe().await, Release::NotHeld);
    assert_eq!(h.feed.closed().len(), 1);
}

#[tokio::test]
async fn test_subscribe_invalidates_immediately() {
    let h = Harness::new();
    h.manager
        .subscribe(SubscriptionSpec::new("timesheets", ["timesheets", "crew-hours"]))
        .await
        .unwrap();

    assert_eq!(h.cache.count_for("timesheets"), 1);
    assert_eq!(h.cache.count_for("crew-hours"), 1);
}

#[tokio::test]
async fn test_filter_reaches_transport() {
    let h = Harness::new();
    h.manager
        .subscribe(
            SubscriptionSpec::new("job_assignments", ["assignments", "job-42"])
                .with_filter("job_id=eq.42"),
        )
        .await
        .unwrap();

    let open = h.feed.open_channels_for("job_assignments");
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].topic(), "realtime:job_assignments:job_id=eq.42");
}

#[tokio::test]
async fn test_route_teardown_is_total() {
    let h = Harness::new();
    let jobs = h.manager.subscribe(high("jobs", "jobs-list")).await.unwrap();
    let crew = h.manager.subscribe(medium("crew", "crew-list")).await.unwrap();
    // Referenced elsewhere too
    let _other_holder = h.manager.subscribe(high("jobs", "jobs-list")).await.unwrap();

    assert!(h.manager.register_for_route("/jobs", &jobs));
    assert!(h.manager.register_for_route("/dashboard", &jobs));
    assert!(h.manager.register_for_route("/dashboard", &crew));

    assert_eq!(h.manager.teardown_route("/jobs").await, 1);

    let jobs_key = SubscriptionKey::new("jobs", "jobs-list");
    assert!(!h.manager.subscriptions_by_table().contains_key("jobs"));
    assert!(!h
        .manager
        .registry()
        .route_members("/dashboard")
        .contains(&jobs_key));
    assert!(h.feed.open_channels_for("jobs").is_empty());
    assert_eq!(h.feed.open_channels_for("crew").len(), 1);

    assert_eq!(h.manager.teardown_route("/jobs").await, 0);
}

#[tokio::test]
async fn test_composite_handle_tears_down_members() {
    let h = Harness::new();
    let composite = h
        .manager
        .subscribe_many(vec![
            high("jobs", "jobs-list"),
            medium("timesheets", "timesheets"),
            medium("crew", "crew-list"),
        ])
        .await
        .unwrap();
    assert_eq!(composite.len(), 3);
    assert_eq!(h.feed.open_count(), 3);

    assert_eq!(composite.unsubscribe().await, 3);
    assert_eq!(h.feed.open_count(), 0);
    assert!(h.manager.subscriptions_by_table().is_empty());
}

#[tokio::test]
async fn test_status_reports_priority_and_activity() {
    let h = Harness::new();
    h.manager.subscribe(high("jobs", "jobs-list")).await.unwrap();

    let status = h.manager.status("jobs", ["jobs-list"]).unwrap();
    assert!(status.connected);
    assert!(status.last_activity.is_some());
    assert_eq!(status.priority, realtime_sync::Priority::High);
    assert!(h.manager.status("jobs", "other").is_none());
}

#[tokio::test]
async fn test_invalid_requests_are_errors() {
    let h = Harness::new();
    assert!(h.manager.subscribe(medium("", "jobs-list")).await.is_err());
    assert!(h.manager.subscribe(medium("jobs", "  ")).await.is_err());
    assert_eq!(h.feed.opened_total(), 0);
}

#[tokio::test]
async fn test_events_for_other_tables_do_not_invalidate() {
    let h = Harness::new();
    h.manager.subscribe(medium("jobs", "jobs-list")).await.unwrap();
    h.manager.subscribe(medium("crew", "crew-list")).await.unwrap();
    h.cache.clear();

    h.feed
        .emit_change("crew", ChangeKind::Delete, serde_json::json!({ "id": 3 }));
    settle().await;

    assert_eq!(h.cache.count_for("crew-list"), 1);
    assert_eq!(h.cache.count_for("jobs-list"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_subscribe_is_rolled_back() {
    let h = Harness::new();
    h.feed.set_open_delay(Some(Duration::from_secs(10)));

    let timed_out = tokio::time::timeout(
        Duration::from_secs(1),
        h.manager.subscribe(medium("jobs", "jobs-list")),
    )
    .await;
    assert!(timed_out.is_err());

    let stats = h.manager.stats().registry;
    assert_eq!(stats.subscriptions, 0);
    assert_eq!(stats.holders, 0);
    assert_eq!(stats.binds_in_flight, 0);
    assert!(h.manager.status("jobs", "jobs-list").is_none());

    h.feed.set_open_delay(None);
    let handle = h.manager.subscribe(medium("jobs", "jobs-list")).await.unwrap();
    assert_eq!(h.manager.status("jobs", "jobs-list").unwrap().holders, 1);
    assert_eq!(handle.unsubscribe().await, Release::TornDown);
    assert_eq!(h.feed.open_count(), 0);
}
