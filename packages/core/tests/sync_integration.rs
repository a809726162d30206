//! End-to-end sync scenarios against the in-memory remote.
//!
//! Every test wires the public types the same way `main.rs` does, but with
//! an in-memory SQLite store and a [`MockRemote`] instead of the HTTP client.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, DurationRound, Utc};
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use anomaly_sync::aggregation::{AggregationConfig, AggregationEngine, BucketSize, EntityRef};
use anomaly_sync::cache::HotCache;
use anomaly_sync::db;
use anomaly_sync::models::{DataPoint, Metric, Notification};
use anomaly_sync::remote::mock::RemoteOp;
use anomaly_sync::remote::{MockRemote, RemoteError};
use anomaly_sync::repository::Repository;
use anomaly_sync::sync::{
    ChangeEvent, ErrorKind, EventBus, SyncOrchestrator, SyncSettings, Trigger,
};

// ---- Helpers ----------------------------------------------------------------

struct TestSystem {
    repo: Repository,
    engine: Arc<AggregationEngine>,
    remote: Arc<MockRemote>,
    orchestrator: Arc<SyncOrchestrator>,
}

async fn build_system(remote: MockRemote, learning_threshold: i64) -> TestSystem {
    let pool = db::create_pool("sqlite::memory:").await.unwrap();
    let repo = Repository::new(pool);
    let cache = Arc::new(HotCache::default());
    let engine = Arc::new(AggregationEngine::new(
        repo.clone(),
        cache.clone(),
        AggregationConfig {
            learning_threshold,
            ..AggregationConfig::default()
        },
    ));
    let remote = Arc::new(remote);
    let orchestrator = Arc::new(SyncOrchestrator::new(
        repo.clone(),
        cache,
        engine.clone(),
        remote.clone(),
        EventBus::default(),
        SyncSettings::default(),
    ));
    TestSystem {
        repo,
        engine,
        remote,
        orchestrator,
    }
}

fn metric(id: &str, instance_id: &str, last_row_sequence: i64) -> Metric {
    Metric {
        id: id.to_string(),
        name: format!("{}.name", id),
        instance_id: instance_id.to_string(),
        display_name: format!("Metric {}", id),
        last_row_sequence,
        last_timestamp: None,
        parameters: BTreeMap::from([("signal".to_string(), "price".to_string())]),
        ingested_sequence: 0,
    }
}

/// Start of the hour `hours_back` hours before the current one.
fn hour_start(hours_back: i64) -> DateTime<Utc> {
    Utc::now().duration_trunc(Duration::hours(1)).unwrap() - Duration::hours(hours_back)
}

/// One point per hour, oldest first, the newest at `newest`.
fn hourly_points_until(
    newest: DateTime<Utc>,
    metric_id: &str,
    count: i64,
    score: f64,
) -> Vec<DataPoint> {
    (0..count)
        .map(|i| DataPoint {
            metric_id: metric_id.to_string(),
            timestamp: newest - Duration::hours(count - 1 - i),
            value: i as f64,
            anomaly_score: score,
            sequence: i + 1,
        })
        .collect()
}

fn hourly_points(metric_id: &str, count: i64, score: f64) -> Vec<DataPoint> {
    hourly_points_until(hour_start(0), metric_id, count, score)
}

fn notification(id: &str, metric_id: &str) -> Notification {
    Notification {
        notification_id: id.to_string(),
        metric_id: metric_id.to_string(),
        timestamp: Utc::now() - Duration::hours(1),
        message: format!("{} is anomalous", metric_id),
        read: false,
    }
}

async fn manual_pass(system: &TestSystem) -> anomaly_sync::sync::PassReport {
    system
        .orchestrator
        .sync_once(Trigger::Manual, &CancellationToken::new())
        .await
        .expect("no other pass should be running")
}

// ---- Scenarios --------------------------------------------------------------

#[tokio::test]
async fn synced_day_of_points_splits_into_probation_and_live_buckets() {
    let newest = hour_start(0);
    let system = build_system(
        MockRemote::new()
            .with_metrics(vec![metric("m1", "i1", 25)])
            .with_points(hourly_points_until(newest, "m1", 24, 0.5))
            .with_page_size(5),
        12,
    )
    .await;

    let report = manual_pass(&system).await;
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.raw_data.as_ref().unwrap().points, 24);

    let buckets = assert_ok!(
        system
            .engine
            .aggregate(
                &EntityRef::Metric("m1".into()),
                BucketSize::Hour,
                newest,
                24
            )
            .await
    );

    let scores: Vec<Option<f64>> = buckets.iter().map(|b| b.value.map(|v| v.score)).collect();
    assert_eq!(scores.len(), 24);
    assert!(scores[..12].iter().all(|s| *s == Some(-0.5)), "{:?}", scores);
    assert!(scores[12..].iter().all(|s| *s == Some(0.5)), "{:?}", scores);
}

#[tokio::test]
async fn concurrent_passes_run_at_most_once() {
    let system = build_system(
        MockRemote::new()
            .with_metrics(vec![metric("m1", "i1", 1)])
            .with_delay(StdDuration::from_millis(200)),
        0,
    )
    .await;
    let cancel = CancellationToken::new();

    let (first, second) = tokio::join!(
        system.orchestrator.sync_once(Trigger::Manual, &cancel),
        system.orchestrator.sync_once(Trigger::Scheduled, &cancel),
    );

    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(system.remote.calls(RemoteOp::Metrics), 1);
    assert!(!system.orchestrator.is_syncing());
}

#[tokio::test]
async fn second_pass_over_unchanged_remote_changes_nothing() {
    let system = build_system(
        MockRemote::new()
            .with_metrics(vec![metric("m1", "i1", 6), metric("m2", "i1", 3)])
            .with_points(hourly_points("m1", 6, 0.2))
            .with_points(hourly_points("m2", 3, 0.3))
            .with_notifications(vec![notification("n1", "m1")]),
        0,
    )
    .await;

    let first = manual_pass(&system).await;
    assert_eq!(first.metrics.unwrap().added, 2);
    assert_eq!(first.notifications.unwrap().added, 1);

    let mut events = system.orchestrator.events().subscribe();
    let second = manual_pass(&system).await;

    assert!(!second.metrics.unwrap().changed());
    assert!(!second.notifications.unwrap().changed());
    assert_eq!(second.raw_data.unwrap().points, 0);
    assert_eq!(system.repo.count_points("m1").await.unwrap(), 6);
    assert_eq!(system.repo.count_points("m2").await.unwrap(), 3);

    // Only the two state transitions; no data-change events.
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen.len(), 2, "{:?}", seen);
    assert!(seen
        .iter()
        .all(|e| matches!(e, ChangeEvent::SyncStateChanged { .. })));
}

#[tokio::test]
async fn new_remote_rows_are_ingested_incrementally() {
    let system = build_system(
        MockRemote::new()
            .with_metrics(vec![metric("m1", "i1", 4)])
            .with_points(hourly_points("m1", 4, 0.1)),
        0,
    )
    .await;
    manual_pass(&system).await;
    assert_eq!(system.repo.count_points("m1").await.unwrap(), 4);

    system.remote.add_points(vec![DataPoint {
        metric_id: "m1".into(),
        timestamp: Utc::now(),
        value: 5.0,
        anomaly_score: 0.9,
        sequence: 5,
    }]);
    system.remote.set_metrics(vec![metric("m1", "i1", 5)]);

    let report = manual_pass(&system).await;
    assert_eq!(report.metrics.unwrap().updated, 1);
    assert_eq!(system.repo.count_points("m1").await.unwrap(), 5);
    let stored = system.repo.get_metric("m1").await.unwrap().unwrap();
    assert_eq!(stored.ingested_sequence, 5);
}

#[tokio::test]
async fn rejected_credentials_pause_scheduled_syncs_until_manual_refresh() {
    let system = build_system(MockRemote::new(), 0).await;
    system
        .remote
        .fail(RemoteOp::Metrics, RemoteError::authentication("token expired"));
    let cancel = CancellationToken::new();

    let report = system
        .orchestrator
        .run_on_pool(Trigger::Scheduled, cancel.clone())
        .await
        .unwrap();
    assert_eq!(report.last_error(), Some(ErrorKind::Authentication));

    let status = system.orchestrator.status();
    assert!(status.auth_required);
    assert_eq!(
        status.user_message(Utc::now()).as_deref(),
        Some("Please sign in again to resume syncing.")
    );

    assert!(system
        .orchestrator
        .run_on_pool(Trigger::Scheduled, cancel.clone())
        .await
        .is_none());
    assert_eq!(system.remote.calls(RemoteOp::Metrics), 1);

    system.remote.recover(RemoteOp::Metrics);
    let report = system.orchestrator.force_refresh(cancel).await.unwrap();
    assert_eq!(report.last_error(), None);
    assert!(!system.orchestrator.status().auth_required);
}

#[tokio::test]
async fn metric_missing_upstream_is_removed_locally() {
    let system = build_system(
        MockRemote::new()
            .with_metrics(vec![metric("m1", "i1", 3), metric("gone", "i2", 3)])
            .with_points(hourly_points("m1", 3, 0.4)),
        0,
    )
    .await;
    system.remote.mark_missing("gone");

    let report = manual_pass(&system).await;

    assert_eq!(report.removed_metrics, vec!["gone".to_string()]);
    assert!(!report.aborted);
    assert!(system.repo.get_metric("gone").await.unwrap().is_none());
    assert_eq!(system.repo.count_points("m1").await.unwrap(), 3);
    assert_err!(
        system
            .engine
            .aggregate(
                &EntityRef::Metric("gone".into()),
                BucketSize::Hour,
                Utc::now(),
                1
            )
            .await
    );
}

#[tokio::test]
async fn offline_pass_keeps_local_data_and_reports_staleness() {
    let system = build_system(
        MockRemote::new()
            .with_metrics(vec![metric("m1", "i1", 2)])
            .with_points(hourly_points("m1", 2, 0.3)),
        0,
    )
    .await;
    manual_pass(&system).await;
    let connected_at = system.orchestrator.status().last_connected_at;
    assert!(connected_at.is_some());

    system
        .remote
        .fail(RemoteOp::Metrics, RemoteError::connectivity("airplane mode"));
    let report = manual_pass(&system).await;

    assert!(report.aborted);
    assert_eq!(system.repo.count_points("m1").await.unwrap(), 2);
    let status = system.orchestrator.status();
    assert_eq!(status.last_error, Some(ErrorKind::Connectivity));
    assert_eq!(status.last_connected_at, connected_at);
    assert_eq!(
        status.user_message(Utc::now()).as_deref(),
        Some("Unable to reach the server. Data was updated less than an hour ago.")
    );
}
