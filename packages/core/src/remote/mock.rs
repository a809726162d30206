//! In-memory remote source.
//!
//! Holds a mutable server-side snapshot that tests (or an offline run) can
//! change between sync passes, plus per-operation error injection.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{RawDataSink, RemoteDataSource, RemoteError, RemoteResult};
use crate::models::{Annotation, AppMetadata, DataPoint, Metric, Notification};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Metrics,
    Annotations,
    RawData,
    Notifications,
    Acknowledge,
    Metadata,
}

#[derive(Default)]
struct MockState {
    metrics: Vec<Metric>,
    annotations: Vec<Annotation>,
    points: BTreeMap<String, Vec<DataPoint>>,
    notifications: Vec<Notification>,
    metadata: Option<AppMetadata>,
    failures: HashMap<RemoteOp, RemoteError>,
    missing_metrics: Vec<String>,
    acknowledged: Vec<String>,
    calls: HashMap<RemoteOp, usize>,
}

pub struct MockRemote {
    state: Mutex<MockState>,
    page_size: usize,
    delay: Duration,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            page_size: 100,
            delay: Duration::ZERO,
        }
    }

    pub fn with_metrics(self, metrics: Vec<Metric>) -> Self {
        self.set_metrics(metrics);
        self
    }

    pub fn with_points(self, points: Vec<DataPoint>) -> Self {
        self.add_points(points);
        self
    }

    pub fn with_annotations(self, annotations: Vec<Annotation>) -> Self {
        self.state.lock().annotations = annotations;
        self
    }

    pub fn with_notifications(self, notifications: Vec<Notification>) -> Self {
        self.set_notifications(notifications);
        self
    }

    pub fn with_metadata(self, metadata: AppMetadata) -> Self {
        self.state.lock().metadata = Some(metadata);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Every metrics fetch sleeps this long first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_metrics(&self, metrics: Vec<Metric>) {
        self.state.lock().metrics = metrics;
    }

    pub fn set_notifications(&self, notifications: Vec<Notification>) {
        self.state.lock().notifications = notifications;
    }

    pub fn add_points(&self, points: Vec<DataPoint>) {
        let mut state = self.state.lock();
        for point in points {
            state.points.entry(point.metric_id.clone()).or_default().push(point);
        }
    }

    /// Make `op` fail with `err` until [`MockRemote::recover`] is called.
    pub fn fail(&self, op: RemoteOp, err: RemoteError) {
        self.state.lock().failures.insert(op, err);
    }

    pub fn recover(&self, op: RemoteOp) {
        self.state.lock().failures.remove(&op);
    }

    /// Raw-data fetches for `metric_id` report the metric as gone.
    pub fn mark_missing(&self, metric_id: &str) {
        self.state.lock().missing_metrics.push(metric_id.to_string());
    }

    pub fn acknowledged(&self) -> Vec<String> {
        self.state.lock().acknowledged.clone()
    }

    pub fn calls(&self, op: RemoteOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    fn enter(&self, op: RemoteOp) -> RemoteResult<()> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_default() += 1;
        match state.failures.get(&op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteDataSource for MockRemote {
    async fn fetch_metrics(&self) -> RemoteResult<Vec<Metric>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.enter(RemoteOp::Metrics)?;
        Ok(self.state.lock().metrics.clone())
    }

    async fn fetch_annotations(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RemoteResult<Vec<Annotation>> {
        self.enter(RemoteOp::Annotations)?;
        Ok(self
            .state
            .lock()
            .annotations
            .iter()
            .filter(|a| a.timestamp >= from && a.timestamp <= to)
            .cloned()
            .collect())
    }

    async fn fetch_raw_data(
        &self,
        metric_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        sink: &dyn RawDataSink,
    ) -> RemoteResult<usize> {
        self.enter(RemoteOp::RawData)?;

        let rows: Vec<DataPoint> = {
            let state = self.state.lock();
            if state.missing_metrics.iter().any(|m| m == metric_id) {
                return Err(RemoteError::not_found(metric_id));
            }
            let mut rows: Vec<DataPoint> = state
                .points
                .get(metric_id)
                .map(|points| {
                    points
                        .iter()
                        .filter(|p| p.timestamp >= from && p.timestamp <= to)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            rows.sort_by_key(|p| p.sequence);
            rows
        };

        let mut delivered = 0;
        for page in rows.chunks(self.page_size) {
            delivered += page.len();
            if !sink.accept(page.to_vec()).await {
                break;
            }
        }
        Ok(delivered)
    }

    async fn fetch_notifications(&self) -> RemoteResult<Vec<Notification>> {
        self.enter(RemoteOp::Notifications)?;
        Ok(self.state.lock().notifications.clone())
    }

    async fn acknowledge_notifications(&self, ids: &[String]) -> RemoteResult<()> {
        self.enter(RemoteOp::Acknowledge)?;
        let mut state = self.state.lock();
        state
            .notifications
            .retain(|n| !ids.contains(&n.notification_id));
        state.acknowledged.extend(ids.iter().cloned());
        Ok(())
    }

    async fn fetch_app_metadata(&self) -> RemoteResult<AppMetadata> {
        self.enter(RemoteOp::Metadata)?;
        Ok(self.state.lock().metadata.clone().unwrap_or(AppMetadata {
            server_version: "mock".to_string(),
            learning_threshold: None,
        }))
    }

    fn source_name(&self) -> &str {
        "mock"
    }
}
