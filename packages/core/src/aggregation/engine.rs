//! Anomaly aggregation engine - buckets, probation and ranking

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::aggregation::{
    bucket::{windows_ending_at, BucketSize, BucketWindow},
    config::AggregationConfig,
    error::AggregationError,
    rank::{rank, EntityRank, Severity},
};
use crate::cache::{AggregateMemo, HotCache};
use crate::calendar::{ClosedInterval, MarketCalendar};
use crate::metrics::AppMetrics;
use crate::models::{AnomalyValue, DataPoint, Instance, Metric};
use crate::repository::{Repository, StoreError};

/// What to aggregate: one metric or every metric of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum EntityRef {
    Metric(String),
    Instance(String),
}

impl EntityRef {
    pub fn id(&self) -> &str {
        match self {
            EntityRef::Metric(id) | EntityRef::Instance(id) => id,
        }
    }
}

/// One output bucket. `value` is `None` when no points fell inside it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub value: Option<AnomalyValue>,
}

/// An instance with its aggregated buckets and sort key.
#[derive(Debug, Clone, Serialize)]
pub struct RankedInstance {
    pub instance: Instance,
    pub rank: EntityRank,
    pub buckets: Arc<Vec<Bucket>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AggregateKey {
    entity: EntityRef,
    size: BucketSize,
    end: DateTime<Utc>,
    count: usize,
}

/// Score and sequence of one raw row, from either the cache or the store.
#[derive(Debug, Clone, Copy)]
struct ScoredPoint {
    score: f64,
    sequence: i64,
}

pub struct AggregationEngine {
    repo: Repository,
    cache: Arc<HotCache>,
    calendar: Option<Arc<MarketCalendar>>,
    config: AggregationConfig,
    learning_threshold: AtomicI64,
    memo: AggregateMemo<AggregateKey, Vec<Bucket>>,
    metrics: Option<Arc<AppMetrics>>,
}

impl AggregationEngine {
    pub fn new(repo: Repository, cache: Arc<HotCache>, config: AggregationConfig) -> Self {
        Self {
            repo,
            cache,
            calendar: None,
            learning_threshold: AtomicI64::new(config.learning_threshold),
            memo: AggregateMemo::new(config.memo_ttl),
            config,
            metrics: None,
        }
    }

    pub fn with_calendar(mut self, calendar: Arc<MarketCalendar>) -> Self {
        self.calendar = Some(calendar);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn learning_threshold(&self) -> i64 {
        self.learning_threshold.load(Ordering::Acquire)
    }

    /// Change the probation threshold. Drops every memoized result.
    pub fn set_learning_threshold(&self, rows: i64) {
        let previous = self.learning_threshold.swap(rows, Ordering::AcqRel);
        if previous != rows {
            self.memo.clear();
        }
    }

    /// Drop memoized results after metric metadata changed.
    pub fn invalidate(&self) {
        self.memo.clear();
    }

    /// Aggregate `entity` into `count` buckets of `size`, oldest first, the
    /// last bucket containing `end`.
    ///
    /// Repeated calls with the same arguments and no intervening write return
    /// the same `Arc`. A bucket whose points cannot be read is emitted as
    /// `None`; failing to resolve the entity itself is an error.
    pub async fn aggregate(
        &self,
        entity: &EntityRef,
        size: BucketSize,
        end: DateTime<Utc>,
        count: usize,
    ) -> Result<Arc<Vec<Bucket>>, AggregationError> {
        if count == 0 || count > self.config.max_bucket_count {
            return Err(AggregationError::InvalidRequest(format!(
                "bucket_count must be between 1 and {}",
                self.config.max_bucket_count
            )));
        }

        let key = AggregateKey {
            entity: entity.clone(),
            size,
            end: size.floor(end),
            count,
        };
        let version = self.cache.version();
        if let Some(hit) = self.memo.get(&key, version) {
            if let Some(metrics) = &self.metrics {
                metrics.memo_hits_total.inc();
            }
            return Ok(hit);
        }

        let metrics = self.resolve(entity).await?;
        let windows = self.bucket_windows(size, end, count);
        let threshold = self.learning_threshold();

        let mut buckets = Vec::with_capacity(windows.len());
        for window in &windows {
            let value = match self.reduce_bucket(&metrics, window, threshold).await {
                Ok(value) => value,
                Err(err) => {
                    warn!(
                        "Bucket {} of {} unavailable: {}",
                        window.start,
                        entity.id(),
                        err
                    );
                    None
                }
            };
            buckets.push(Bucket {
                start: window.start,
                value,
            });
        }

        debug!(
            "Aggregated {} into {} {} buckets",
            entity.id(),
            buckets.len(),
            size
        );
        Ok(self.memo.store(key, version, buckets))
    }

    /// Aggregate every instance and order them by bucket severity counts,
    /// then summed bucket rank.
    pub async fn ranked_instances(
        &self,
        size: BucketSize,
        end: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<RankedInstance>, AggregationError> {
        let metrics = self.repo.list_metrics().await?;
        let mut ranked = Vec::new();

        for instance in Instance::group(&metrics) {
            let entity = EntityRef::Instance(instance.instance_id.clone());
            let buckets = self.aggregate(&entity, size, end, count).await?;
            let rank = EntityRank::from_scores(
                buckets.iter().map(|b| b.value.map(|v| v.score)),
                &self.config.thresholds,
                instance.display_name.clone(),
            );
            ranked.push(RankedInstance {
                instance,
                rank,
                buckets,
            });
        }

        ranked.sort_by(|a, b| a.rank.cmp(&b.rank));
        Ok(ranked)
    }

    /// Raw points of one metric with `from <= t <= to`, from the hot cache
    /// when it covers the range, otherwise from the store.
    pub async fn range_query(
        &self,
        metric_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DataPoint>, AggregationError> {
        if self.cache.covers(from) {
            return Ok(self
                .cache
                .get(metric_id, from, to)
                .into_iter()
                .map(|(timestamp, v)| DataPoint {
                    metric_id: metric_id.to_string(),
                    timestamp,
                    value: v.value,
                    anomaly_score: v.anomaly_score,
                    sequence: v.sequence,
                })
                .collect());
        }
        Ok(self.repo.fetch_points(metric_id, from, to).await?)
    }

    pub fn severity(&self, value: Option<AnomalyValue>) -> Severity {
        Severity::of(value.map(|v| v.score), &self.config.thresholds)
    }

    async fn resolve(&self, entity: &EntityRef) -> Result<Vec<Metric>, AggregationError> {
        let metrics = match entity {
            EntityRef::Metric(id) => self.repo.get_metric(id).await?.into_iter().collect(),
            EntityRef::Instance(id) => self.repo.list_metrics_for_instance(id).await?,
        };
        if metrics.is_empty() {
            return Err(AggregationError::UnknownEntity(entity.id().to_string()));
        }
        Ok(metrics)
    }

    /// Bucket windows ending at `end`, skipping fully closed ones when a
    /// calendar is configured. The backward search is bounded, so fewer than
    /// `count` windows may come back across very long closures.
    fn bucket_windows(&self, size: BucketSize, end: DateTime<Utc>, count: usize) -> Vec<BucketWindow> {
        let calendar = match &self.calendar {
            Some(calendar) if self.config.skip_closed_buckets => calendar,
            _ => return windows_ending_at(size, end, count),
        };

        let max_candidates = count.saturating_mul(self.config.gap_search_factor.max(1));
        let newest = BucketWindow::containing(size, end);
        let oldest_start = newest.start - size.width() * (max_candidates as i32);
        let closed = calendar.closed_intervals(oldest_start, newest.end);

        let mut windows = Vec::with_capacity(count);
        let mut current = newest;
        for _ in 0..max_candidates {
            if windows.len() == count {
                break;
            }
            if !fully_closed(&closed, &current) {
                windows.push(current);
            }
            current = current.previous(size);
        }
        windows.reverse();
        windows
    }

    async fn reduce_bucket(
        &self,
        metrics: &[Metric],
        window: &BucketWindow,
        learning_threshold: i64,
    ) -> Result<Option<AnomalyValue>, StoreError> {
        let thresholds = &self.config.thresholds;
        let mut best: Option<f64> = None;
        let mut mask = 0u32;

        for metric in metrics {
            let points = self.load_points(&metric.id, window).await?;
            let probation_below = metric.last_row_sequence - learning_threshold;

            let metric_best = points
                .iter()
                .filter(|p| p.score.is_finite())
                .map(|p| apply_probation(p.score, p.sequence, probation_below))
                .max_by(|a, b| rank(Some(*a), thresholds).total_cmp(&rank(Some(*b), thresholds)));

            let Some(score) = metric_best else {
                continue;
            };
            if !score.is_sign_negative() && score >= thresholds.yellow {
                mask |= metric.signal_kind().bit();
            }
            best = match best {
                Some(current) if rank(Some(current), thresholds) >= rank(Some(score), thresholds) => {
                    Some(current)
                }
                _ => Some(score),
            };
        }

        Ok(best.map(|score| AnomalyValue::new(score, mask)))
    }

    async fn load_points(
        &self,
        metric_id: &str,
        window: &BucketWindow,
    ) -> Result<Vec<ScoredPoint>, StoreError> {
        let last = window.last_instant();
        if self.cache.covers(window.start) {
            return Ok(self
                .cache
                .get(metric_id, window.start, last)
                .into_iter()
                .map(|(_, v)| ScoredPoint {
                    score: v.anomaly_score,
                    sequence: v.sequence,
                })
                .collect());
        }

        let rows = self.repo.fetch_points(metric_id, window.start, last).await?;
        Ok(rows
            .into_iter()
            .map(|p| ScoredPoint {
                score: p.anomaly_score,
                sequence: p.sequence,
            })
            .collect())
    }
}

/// Probationary points carry their score negated.
///
/// A point is probationary when `sequence < last_row_sequence - learning_threshold`.
pub fn apply_probation(score: f64, sequence: i64, probation_below: i64) -> f64 {
    if sequence < probation_below {
        -score.abs()
    } else {
        score.abs()
    }
}

fn fully_closed(closed: &[ClosedInterval], window: &BucketWindow) -> bool {
    // Intervals are sorted and disjoint: only the last one starting at or
    // before the window can cover it.
    let idx = closed.partition_point(|i| i.start <= window.start);
    idx > 0 && closed[idx - 1].covers(window.start, window.end)
}
