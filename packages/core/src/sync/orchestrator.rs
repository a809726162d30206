//! Synchronization pass driver.
//!
//! One pass runs the sub-syncs in a fixed order (metrics, annotations, raw
//! data, notifications, throttled maintenance). A pass is single-flight: a
//! trigger that arrives while another pass holds the lock is a no-op. The
//! pass never fails as a whole; the outcome lands on [`SyncState`] and the
//! returned [`PassReport`].

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{ErrorKind, SyncError};
use super::events::{ChangeEvent, EventBus};
use super::ingest::{IngestPipeline, IngestReport, DEFAULT_QUEUE_CAPACITY};
use super::reconcile::{
    AnnotationCollection, MetricCollection, NotificationCollection, ReconcileReport, Reconciler,
};
use super::state::{SyncState, SyncStatus};
use super::throttle::Throttle;
use crate::aggregation::AggregationEngine;
use crate::cache::HotCache;
use crate::metrics::AppMetrics;
use crate::models::Metric;
use crate::remote::{RemoteDataSource, RemoteError};
use crate::repository::{Repository, StoreResult};
use crate::runtime::{assert_background, PoolKind, WorkerPools};

const META_SERVER_VERSION: &str = "server_version";
const META_LEARNING_THRESHOLD: &str = "learning_threshold";
const META_MAINTENANCE_RAN: &str = "maintenance_last_ran";

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Raw rows and annotations older than `now - retention` are not kept.
    pub retention: Duration,
    pub queue_capacity: usize,
    pub maintenance_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            retention: Duration::days(14),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            maintenance_interval: Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Metrics,
    Annotations,
    RawData,
    Notifications,
    Maintenance,
}

impl Step {
    pub const ORDER: [Step; 5] = [
        Step::Metrics,
        Step::Annotations,
        Step::RawData,
        Step::Notifications,
        Step::Maintenance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Metrics => "metrics",
            Step::Annotations => "annotations",
            Step::RawData => "raw_data",
            Step::Notifications => "notifications",
            Step::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub step: Step,
    pub kind: ErrorKind,
}

/// Everything one pass did.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub metrics: Option<ReconcileReport>,
    pub annotations: Option<ReconcileReport>,
    pub raw_data: Option<IngestReport>,
    pub notifications: Option<ReconcileReport>,
    pub maintenance_ran: bool,
    /// Metrics the remote reported as gone while fetching raw data.
    pub removed_metrics: Vec<String>,
    pub failures: Vec<StepFailure>,
    pub aborted: bool,
    #[serde(skip)]
    reached_remote: bool,
}

impl PassReport {
    fn new(trigger: Trigger, started_at: DateTime<Utc>) -> Self {
        Self {
            trigger,
            started_at,
            finished_at: None,
            metrics: None,
            annotations: None,
            raw_data: None,
            notifications: None,
            maintenance_ran: false,
            removed_metrics: Vec::new(),
            failures: Vec::new(),
            aborted: false,
            reached_remote: false,
        }
    }

    /// Kind of the last failure, if any.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.failures.last().map(|f| f.kind)
    }

    /// `true` when the remote answered and no call failed to reach it.
    pub fn connected(&self) -> bool {
        self.reached_remote
            && !self.failures.iter().any(|f| {
                matches!(f.kind, ErrorKind::Connectivity | ErrorKind::Authentication)
            })
    }
}

pub struct SyncOrchestrator {
    repo: Repository,
    cache: Arc<HotCache>,
    engine: Arc<AggregationEngine>,
    remote: Arc<dyn RemoteDataSource>,
    events: EventBus,
    reconciler: Reconciler,
    state: SyncState,
    lock: Mutex<()>,
    settings: SyncSettings,
    maintenance: Throttle,
    pools: WorkerPools,
    metrics: Option<Arc<AppMetrics>>,
}

impl SyncOrchestrator {
    pub fn new(
        repo: Repository,
        cache: Arc<HotCache>,
        engine: Arc<AggregationEngine>,
        remote: Arc<dyn RemoteDataSource>,
        events: EventBus,
        settings: SyncSettings,
    ) -> Self {
        let maintenance = Throttle::new(META_MAINTENANCE_RAN, settings.maintenance_interval);
        Self {
            repo,
            cache,
            engine,
            remote,
            reconciler: Reconciler::new(events.clone()),
            events,
            state: SyncState::default(),
            lock: Mutex::new(()),
            settings,
            maintenance,
            pools: WorkerPools::default(),
            metrics: None,
        }
    }

    pub fn with_pools(mut self, pools: WorkerPools) -> Self {
        self.pools = pools;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn status(&self) -> Arc<SyncStatus> {
        self.state.snapshot()
    }

    pub fn is_syncing(&self) -> bool {
        self.state.snapshot().in_progress
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn pools(&self) -> &WorkerPools {
        &self.pools
    }

    pub fn source_name(&self) -> &str {
        self.remote.source_name()
    }

    /// Re-apply settings persisted by earlier maintenance runs.
    pub async fn restore(&self) -> StoreResult<()> {
        if let Some(raw) = self.repo.get_meta(META_LEARNING_THRESHOLD).await? {
            match raw.parse::<i64>() {
                Ok(rows) => self.engine.set_learning_threshold(rows),
                Err(_) => warn!("Ignoring stored learning threshold {:?}", raw),
            }
        }
        Ok(())
    }

    /// User-requested refresh: clears a pending re-authentication and runs a
    /// pass on the sync pool. Returns `None` if a pass was already running.
    pub async fn force_refresh(self: &Arc<Self>, cancel: CancellationToken) -> Option<PassReport> {
        self.run_on_pool(Trigger::Manual, cancel).await
    }

    /// Run a pass on the sync worker pool.
    pub async fn run_on_pool(
        self: &Arc<Self>,
        trigger: Trigger,
        cancel: CancellationToken,
    ) -> Option<PassReport> {
        let this = Arc::clone(self);
        let job = async move { this.sync_once(trigger, &cancel).await };
        match self.pools.run(PoolKind::Sync, job).await {
            Ok(report) => report,
            Err(err) => {
                error!("Sync pass could not run: {}", err);
                None
            }
        }
    }

    /// Run one pass on the current task.
    ///
    /// Returns `None` without doing anything when another pass is running,
    /// or when a scheduled pass finds the credentials need renewing.
    pub async fn sync_once(
        &self,
        trigger: Trigger,
        cancel: &CancellationToken,
    ) -> Option<PassReport> {
        let Ok(_guard) = self.lock.try_lock() else {
            debug!("Sync already in progress, {:?} trigger ignored", trigger);
            return None;
        };

        if trigger == Trigger::Scheduled && self.state.snapshot().auth_required {
            info!("Skipping scheduled sync until credentials are renewed");
            return None;
        }
        assert_background("sync pass");

        let started_at = Utc::now();
        let timer = Instant::now();
        self.state.update(|s| {
            s.in_progress = true;
            s.last_started_at = Some(started_at);
            if trigger == Trigger::Manual {
                s.auth_required = false;
            }
        });
        self.events.publish(ChangeEvent::SyncStateChanged {
            in_progress: true,
            error: None,
        });
        info!("Sync started ({:?}, source: {})", trigger, self.remote.source_name());

        let mut report = PassReport::new(trigger, started_at);
        self.run_steps(&mut report, cancel).await;

        let finished_at = Utc::now();
        report.finished_at = Some(finished_at);
        let last_error = report.last_error();
        let connected = report.connected();
        let status = self.state.update(|s| {
            s.in_progress = false;
            s.last_finished_at = Some(finished_at);
            s.last_error = last_error;
            if connected {
                s.last_connected_at = Some(finished_at);
            }
            if last_error == Some(ErrorKind::Authentication) {
                s.auth_required = true;
            }
        });
        self.events.publish(ChangeEvent::SyncStateChanged {
            in_progress: false,
            error: status.user_message(finished_at),
        });

        if let Some(metrics) = &self.metrics {
            metrics.sync_passes_total.inc();
            metrics.sync_duration.observe(timer.elapsed().as_secs_f64());
            metrics.cache_entities.set(self.cache.entity_count() as f64);
        }
        match last_error {
            None => info!("Sync finished in {:?}", timer.elapsed()),
            Some(kind) => warn!(
                "Sync finished in {:?} with {} failure(s), last: {}",
                timer.elapsed(),
                report.failures.len(),
                kind.as_str()
            ),
        }
        Some(report)
    }

    async fn run_steps(&self, report: &mut PassReport, cancel: &CancellationToken) {
        for step in Step::ORDER {
            if cancel.is_cancelled() {
                self.record(report, step, &SyncError::Cancelled);
                report.aborted = true;
                break;
            }

            let result = match step {
                Step::Metrics => self.sync_metrics(report).await,
                Step::Annotations => self.sync_annotations(report).await,
                Step::RawData => self.sync_raw_data(report, cancel).await,
                Step::Notifications => self.sync_notifications(report).await,
                Step::Maintenance => self.run_maintenance(report).await,
            };

            if let Err(err) = result {
                error!("{} sync failed: {}", step, err);
                self.record(report, step, &err);
                if err.aborts_pass() {
                    report.aborted = true;
                    break;
                }
            }
        }
    }

    fn record(&self, report: &mut PassReport, step: Step, err: &SyncError) {
        let kind = err.kind();
        report.failures.push(StepFailure { step, kind });
        if let Some(metrics) = &self.metrics {
            metrics.sync_errors_total.with_label_values(&[kind.as_str()]).inc();
        }
    }

    async fn sync_metrics(&self, report: &mut PassReport) -> Result<(), SyncError> {
        let remote = self.remote.fetch_metrics().await?;
        report.reached_remote = true;

        let collection = MetricCollection::new(self.repo.clone(), self.cache.clone());
        let outcome = self.reconciler.reconcile(&collection, remote).await?;
        if outcome.changed() {
            self.engine.invalidate();
        }
        report.metrics = Some(outcome);
        Ok(())
    }

    async fn sync_annotations(&self, report: &mut PassReport) -> Result<(), SyncError> {
        let to = Utc::now();
        let from = to - self.settings.retention;
        let remote = self.remote.fetch_annotations(from, to).await?;

        let collection = AnnotationCollection::new(self.repo.clone(), from, to);
        report.annotations = Some(self.reconciler.reconcile(&collection, remote).await?);
        Ok(())
    }

    /// Stream new rows of every metric that is behind its remote watermark.
    ///
    /// A metric the remote no longer knows is deleted locally and the pass
    /// continues. The queue is drained before returning, whatever happened.
    async fn sync_raw_data(
        &self,
        report: &mut PassReport,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let metrics = self.repo.list_metrics().await?;
        let to = Utc::now();
        let horizon = to - self.settings.retention;

        let pipeline = IngestPipeline::spawn(
            self.repo.clone(),
            self.cache.clone(),
            self.settings.retention,
            self.settings.queue_capacity,
            cancel.clone(),
            self.metrics.clone(),
        );

        let mut outcome: Result<(), SyncError> = Ok(());
        for metric in metrics.iter().filter(|m| m.ingested_sequence < m.last_row_sequence) {
            if cancel.is_cancelled() {
                outcome = Err(SyncError::Cancelled);
                break;
            }
            if pipeline.halted() {
                break;
            }

            let from = match self.resume_point(metric, horizon).await {
                Ok(from) => from,
                Err(err) => {
                    outcome = Err(err.into());
                    break;
                }
            };

            match self
                .remote
                .fetch_raw_data(&metric.id, from, to, pipeline.sink())
                .await
            {
                Ok(rows) => debug!("Streamed {} rows of {}", rows, metric.id),
                Err(RemoteError::NotFound { .. }) => {
                    self.drop_metric(&metric.id).await;
                    report.removed_metrics.push(metric.id.clone());
                }
                Err(err) => {
                    let err = SyncError::from(err);
                    let fatal = err.aborts_pass();
                    warn!("Raw data of {} not fetched: {}", metric.id, err);
                    outcome = Err(err);
                    if fatal {
                        break;
                    }
                }
            }
        }

        let ingest = pipeline.finish().await;
        if ingest.changed() {
            self.events.publish(ChangeEvent::RawDataChanged);
        }
        let storage_full = ingest.storage_full;
        if storage_full {
            self.engine.invalidate();
        }
        report.raw_data = Some(ingest);

        match outcome {
            Ok(()) if storage_full => Err(SyncError::StorageFull),
            other => other,
        }
    }

    /// Start of the next raw-data fetch: the newest stored row, bounded by
    /// the retention horizon. Re-reading that row is harmless; inserts skip
    /// duplicate sequences.
    async fn resume_point(
        &self,
        metric: &Metric,
        horizon: DateTime<Utc>,
    ) -> StoreResult<DateTime<Utc>> {
        let latest = self.repo.latest_point_timestamp(&metric.id).await?;
        Ok(latest.map_or(horizon, |ts| ts.max(horizon)))
    }

    async fn drop_metric(&self, metric_id: &str) {
        warn!("Remote no longer has metric {}, removing it", metric_id);
        if let Some(metrics) = &self.metrics {
            metrics
                .sync_errors_total
                .with_label_values(&[ErrorKind::ObjectNotFound.as_str()])
                .inc();
        }
        match self.repo.delete_metric(metric_id).await {
            Ok(_) => {
                self.cache.evict(metric_id);
                self.engine.invalidate();
                self.events.publish(ChangeEvent::MetricsChanged);
            }
            Err(err) => warn!("Could not delete metric {}: {}", metric_id, err),
        }
    }

    /// Acknowledge locally read notifications, then reconcile the snapshot.
    async fn sync_notifications(&self, report: &mut PassReport) -> Result<(), SyncError> {
        let read: Vec<String> = self
            .repo
            .list_notifications()
            .await?
            .into_iter()
            .filter(|n| n.read)
            .map(|n| n.notification_id)
            .collect();

        if !read.is_empty() {
            if let Err(err) = self.remote.acknowledge_notifications(&read).await {
                let err = SyncError::from(err);
                if err.aborts_pass() {
                    return Err(err);
                }
                warn!("Acknowledging {} notifications failed: {}", read.len(), err);
            }
        }

        let remote = self.remote.fetch_notifications().await?;
        let collection = NotificationCollection::new(self.repo.clone());
        report.notifications = Some(self.reconciler.reconcile(&collection, remote).await?);
        Ok(())
    }

    /// Once per maintenance interval: refresh app metadata and prune rows
    /// behind the retention horizon.
    async fn run_maintenance(&self, report: &mut PassReport) -> Result<(), SyncError> {
        let now = Utc::now();
        if !self.maintenance.is_due(&self.repo, now).await? {
            debug!("Maintenance not due yet");
            return Ok(());
        }

        let metadata = self.remote.fetch_app_metadata().await?;
        self.repo
            .set_meta(META_SERVER_VERSION, &metadata.server_version)
            .await?;
        if let Some(rows) = metadata.learning_threshold {
            self.repo
                .set_meta(META_LEARNING_THRESHOLD, &rows.to_string())
                .await?;
            self.engine.set_learning_threshold(rows);
        }

        let cutoff = now - self.settings.retention;
        let pruned = self.repo.prune_older_than(cutoff).await?;
        let evicted = self.cache.evict_older_than(cutoff);
        if pruned > 0 {
            // A cold cache has nothing to evict, so its version may not move.
            self.engine.invalidate();
            self.events.publish(ChangeEvent::RawDataChanged);
        }
        info!(
            "Maintenance done (server {}, pruned {} rows, evicted {})",
            metadata.server_version, pruned, evicted
        );

        self.maintenance.mark_ran(&self.repo, now).await?;
        report.maintenance_ran = true;
        Ok(())
    }
}
