//! Raw-data ingestion: remote stream -> bounded queue -> single writer.
//!
//! The remote source pushes pages into a [`BatchSender`]; one writer task
//! drains the queue, bulk-inserts each batch, upserts the hot cache and
//! advances the metric's ingestion watermark. The queue is always drained,
//! even after cancellation, so nothing accepted is left unflushed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::cache::HotCache;
use crate::metrics::AppMetrics;
use crate::models::DataPoint;
use crate::remote::RawDataSink;
use crate::repository::{Repository, StoreError};
use crate::runtime::assert_background;

pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Producer half handed to [`crate::remote::RemoteDataSource::fetch_raw_data`].
pub struct BatchSender {
    tx: mpsc::Sender<Vec<DataPoint>>,
    cancel: CancellationToken,
    halted: Arc<AtomicBool>,
}

#[async_trait]
impl RawDataSink for BatchSender {
    /// Returns `false` once the pass is cancelled or the writer stopped
    /// accepting work; the producer should stop paging.
    async fn accept(&self, batch: Vec<DataPoint>) -> bool {
        if self.cancel.is_cancelled() || self.halted.load(Ordering::Acquire) {
            return false;
        }
        if batch.is_empty() {
            return true;
        }
        self.tx.send(batch).await.is_ok()
    }
}

/// What one pipeline run wrote.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub batches: usize,
    pub points: u64,
    pub failed_batches: usize,
    pub dropped_batches: usize,
    pub storage_full: bool,
    pub metrics: BTreeSet<String>,
}

impl IngestReport {
    pub fn changed(&self) -> bool {
        self.points > 0 || self.storage_full
    }
}

struct Writer {
    repo: Repository,
    cache: Arc<HotCache>,
    retention: Duration,
    metrics: Option<Arc<AppMetrics>>,
    halted: Arc<AtomicBool>,
}

/// A running ingestion pipeline.
pub struct IngestPipeline {
    sender: BatchSender,
    writer: JoinHandle<IngestReport>,
}

impl IngestPipeline {
    pub fn spawn(
        repo: Repository,
        cache: Arc<HotCache>,
        retention: Duration,
        capacity: usize,
        cancel: CancellationToken,
        metrics: Option<Arc<AppMetrics>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let halted = Arc::new(AtomicBool::new(false));

        let writer = Writer {
            repo,
            cache,
            retention,
            metrics,
            halted: halted.clone(),
        };

        Self {
            sender: BatchSender { tx, cancel, halted },
            writer: tokio::spawn(writer.run(rx)),
        }
    }

    pub fn sink(&self) -> &BatchSender {
        &self.sender
    }

    /// `true` once the writer hit a full disk; later batches are dropped.
    pub fn halted(&self) -> bool {
        self.sender.halted.load(Ordering::Acquire)
    }

    /// Close the queue and wait for the writer to flush it.
    pub async fn finish(self) -> IngestReport {
        drop(self.sender);
        match self.writer.await {
            Ok(report) => report,
            Err(err) => {
                error!("Ingestion writer task failed: {}", err);
                IngestReport::default()
            }
        }
    }
}

impl Writer {
    async fn run(self, mut rx: mpsc::Receiver<Vec<DataPoint>>) -> IngestReport {
        let mut report = IngestReport::default();
        while let Some(batch) = rx.recv().await {
            self.write(batch, &mut report).await;
        }
        if let Some(metrics) = &self.metrics {
            metrics.ingested_points_total.inc_by(report.points);
            metrics.cache_entities.set(self.cache.entity_count() as f64);
        }
        debug!(
            "Ingestion flushed {} batches ({} new rows)",
            report.batches, report.points
        );
        report
    }

    async fn write(&self, batch: Vec<DataPoint>, report: &mut IngestReport) {
        assert_background("raw data ingestion");

        if report.storage_full {
            report.dropped_batches += 1;
            return;
        }

        match self.repo.insert_data_points(&batch).await {
            Ok(inserted) => {
                report.batches += 1;
                report.points += inserted;
                self.cache.upsert_batch(&batch);
                self.advance(&batch, report).await;
            }
            Err(StoreError::StorageFull) => {
                warn!("Local storage full, pruning to retention horizon");
                report.storage_full = true;
                report.dropped_batches += 1;
                self.halted.store(true, Ordering::Release);
                self.prune().await;
            }
            Err(err) => {
                warn!("Dropping raw batch of {} rows: {}", batch.len(), err);
                report.failed_batches += 1;
            }
        }
    }

    async fn advance(&self, batch: &[DataPoint], report: &mut IngestReport) {
        let mut newest: BTreeMap<&str, i64> = BTreeMap::new();
        for point in batch {
            let entry = newest.entry(point.metric_id.as_str()).or_insert(point.sequence);
            *entry = (*entry).max(point.sequence);
        }

        for (metric_id, sequence) in newest {
            if let Err(err) = self.repo.advance_ingestion(metric_id, sequence).await {
                warn!("Could not advance ingestion of {}: {}", metric_id, err);
            }
            report.metrics.insert(metric_id.to_string());
        }
    }

    async fn prune(&self) {
        let cutoff = Utc::now() - self.retention;
        match self.repo.prune_older_than(cutoff).await {
            Ok(rows) => {
                let evicted = self.cache.evict_older_than(cutoff);
                debug!("Pruned {} stored and {} cached rows", rows, evicted);
            }
            Err(err) => error!("Retention prune failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::{
        base_time, fill_storage, make_metric, make_point, make_repo, make_repo_with_pool,
    };

    fn spawn(repo: &Repository, cache: &Arc<HotCache>, cancel: CancellationToken) -> IngestPipeline {
        IngestPipeline::spawn(
            repo.clone(),
            cache.clone(),
            Duration::days(14),
            2,
            cancel,
            None,
        )
    }

    #[tokio::test]
    async fn batches_reach_store_cache_and_watermark() {
        let repo = make_repo().await;
        repo.insert_metric(&make_metric("m1", "i1")).await.unwrap();
        let cache = Arc::new(HotCache::default());
        let pipeline = spawn(&repo, &cache, CancellationToken::new());

        assert!(pipeline.sink().accept(vec![make_point("m1", 0, 0.1, 1), make_point("m1", 1, 0.2, 2)]).await);
        assert!(pipeline.sink().accept(vec![make_point("m1", 2, 0.3, 3)]).await);
        let report = pipeline.finish().await;

        assert_eq!(report.batches, 2);
        assert_eq!(report.points, 3);
        assert!(report.metrics.contains("m1"));
        assert_eq!(repo.count_points("m1").await.unwrap(), 3);
        assert_eq!(cache.get("m1", base_time(), base_time() + Duration::hours(2)).len(), 3);
        assert_eq!(repo.get_metric("m1").await.unwrap().unwrap().ingested_sequence, 3);
    }

    #[tokio::test]
    async fn duplicate_rows_are_not_counted_twice() {
        let repo = make_repo().await;
        repo.insert_metric(&make_metric("m1", "i1")).await.unwrap();
        let cache = Arc::new(HotCache::default());
        let pipeline = spawn(&repo, &cache, CancellationToken::new());

        let batch = vec![make_point("m1", 0, 0.1, 1)];
        pipeline.sink().accept(batch.clone()).await;
        pipeline.sink().accept(batch).await;
        let report = pipeline.finish().await;

        assert_eq!(report.batches, 2);
        assert_eq!(report.points, 1);
    }

    #[tokio::test]
    async fn cancelled_sink_refuses_but_queue_is_flushed() {
        let repo = make_repo().await;
        repo.insert_metric(&make_metric("m1", "i1")).await.unwrap();
        let cache = Arc::new(HotCache::default());
        let cancel = CancellationToken::new();
        let pipeline = spawn(&repo, &cache, cancel.clone());

        assert!(pipeline.sink().accept(vec![make_point("m1", 0, 0.1, 1)]).await);
        cancel.cancel();
        assert!(!pipeline.sink().accept(vec![make_point("m1", 1, 0.1, 2)]).await);
        let report = pipeline.finish().await;

        assert_eq!(report.points, 1);
        assert_eq!(repo.count_points("m1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn batch_for_unknown_metric_is_counted_as_failed() {
        let repo = make_repo().await;
        let cache = Arc::new(HotCache::default());
        let pipeline = spawn(&repo, &cache, CancellationToken::new());

        pipeline.sink().accept(vec![make_point("ghost", 0, 0.1, 1)]).await;
        let report = pipeline.finish().await;

        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.points, 0);
        assert_eq!(cache.entity_count(), 0);
    }

    #[tokio::test]
    async fn full_storage_prunes_and_halts_the_pipeline() {
        let (repo, pool) = make_repo_with_pool().await;
        repo.insert_metric(&make_metric("m1", "i1")).await.unwrap();
        repo.insert_data_points(&[make_point("m1", 0, 0.1, 1)]).await.unwrap();
        let cache = Arc::new(HotCache::default());
        fill_storage(&pool).await;

        let pipeline = spawn(&repo, &cache, CancellationToken::new());
        let big: Vec<DataPoint> = (2..5_000).map(|seq| make_point("m1", seq, 0.1, seq)).collect();
        pipeline.sink().accept(big).await;
        let report = pipeline.finish().await;

        assert!(report.storage_full);
        assert_eq!(report.dropped_batches, 1);
        // Rows from 2024 are far behind a 14 day retention horizon.
        assert_eq!(repo.count_points("m1").await.unwrap(), 0);
    }
}
