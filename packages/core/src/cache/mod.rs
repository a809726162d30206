//! In-memory hot cache of recent time-series data.
//!
//! [`TimeSeriesCache`] keeps one ordered series per entity key. Readers take a
//! shared lock on a single series; writers take the exclusive lock only for the
//! series they touch. Global watermarks (first/last timestamp, last update and
//! a version counter) are plain atomics so they can be read without locking.
//!
//! Rows are identified the same way the store identifies them: one row per
//! entity and sequence, the first write winning. Several rows may share a
//! timestamp; they are kept in `(timestamp, sequence)` order.
//!
//! The cache is generic over a [`SeriesDecoder`], which turns a raw
//! [`DataPoint`] into the stored value. [`HotCache`] is the raw-point
//! instantiation used by the app.

pub mod memo;
pub mod warmup;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::models::DataPoint;
use crate::repository::{from_millis, to_millis};

pub use memo::AggregateMemo;
pub use warmup::{spawn_warm_up, warm_up};

/// Converts raw rows into cached values.
pub trait SeriesDecoder: Send + Sync + 'static {
    type Value: Clone + PartialEq + Send + Sync + 'static;

    /// Entity the point belongs to.
    fn key(&self, point: &DataPoint) -> String;

    /// `None` drops the point.
    fn decode(&self, point: &DataPoint) -> Option<Self::Value>;
}

/// Cached form of one raw row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PointValue {
    pub value: f64,
    pub anomaly_score: f64,
    pub sequence: i64,
}

/// Keys points by metric id.
#[derive(Debug, Clone, Copy, Default)]
pub struct PointDecoder;

impl SeriesDecoder for PointDecoder {
    type Value = PointValue;

    fn key(&self, point: &DataPoint) -> String {
        point.metric_id.clone()
    }

    fn decode(&self, point: &DataPoint) -> Option<PointValue> {
        if !point.anomaly_score.is_finite() {
            return None;
        }
        Some(PointValue {
            value: point.value,
            anomaly_score: point.anomaly_score,
            sequence: point.sequence,
        })
    }
}

/// The raw-point cache used by ingestion and aggregation.
pub type HotCache = TimeSeriesCache<PointDecoder>;

/// One entity's rows, keyed by `(epoch millis, sequence)`.
#[derive(Debug)]
struct SeriesRows<V> {
    rows: BTreeMap<(i64, i64), V>,
    sequences: HashSet<i64>,
}

impl<V> Default for SeriesRows<V> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            sequences: HashSet::new(),
        }
    }
}

impl<V> SeriesRows<V> {
    /// Insert unless the sequence is already stored.
    fn insert(&mut self, ms: i64, sequence: i64, value: V) -> bool {
        if !self.sequences.insert(sequence) {
            return false;
        }
        self.rows.insert((ms, sequence), value);
        true
    }

    /// Drop rows before `cutoff_ms`, returning how many went.
    fn split_before(&mut self, cutoff_ms: i64) -> usize {
        let kept = self.rows.split_off(&(cutoff_ms, i64::MIN));
        let dropped = std::mem::replace(&mut self.rows, kept);
        for (_, sequence) in dropped.keys() {
            self.sequences.remove(sequence);
        }
        dropped.len()
    }
}

#[derive(Debug)]
struct EntitySeries<V> {
    points: RwLock<SeriesRows<V>>,
}

impl<V> Default for EntitySeries<V> {
    fn default() -> Self {
        Self {
            points: RwLock::new(SeriesRows::default()),
        }
    }
}

pub struct TimeSeriesCache<D: SeriesDecoder> {
    decoder: D,
    entities: DashMap<String, Arc<EntitySeries<D::Value>>>,
    first_ms: AtomicI64,
    last_ms: AtomicI64,
    last_updated_ms: AtomicI64,
    /// Oldest instant the cache is complete from; `i64::MAX` until warm.
    coverage_ms: AtomicI64,
    version: AtomicU64,
    /// Bumped by every eviction. Held exclusively while evicting so that
    /// [`TimeSeriesCache::upsert_batch_since`] can check it atomically.
    evictions: RwLock<u64>,
    warm: AtomicBool,
}

impl<D: SeriesDecoder + Default> Default for TimeSeriesCache<D> {
    fn default() -> Self {
        Self::new(D::default())
    }
}

impl<D: SeriesDecoder> TimeSeriesCache<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            entities: DashMap::new(),
            first_ms: AtomicI64::new(i64::MAX),
            last_ms: AtomicI64::new(i64::MIN),
            last_updated_ms: AtomicI64::new(i64::MIN),
            coverage_ms: AtomicI64::new(i64::MAX),
            version: AtomicU64::new(0),
            evictions: RwLock::new(0),
            warm: AtomicBool::new(false),
        }
    }

    /// Values of `key` with `from <= t <= to`, ordered by timestamp then
    /// sequence.
    pub fn get(
        &self,
        key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<(DateTime<Utc>, D::Value)> {
        if from > to {
            return Vec::new();
        }
        let Some(series) = self.entities.get(key).map(|entry| Arc::clone(entry.value())) else {
            return Vec::new();
        };

        let points = series.points.read();
        points
            .rows
            .range((to_millis(from), i64::MIN)..=(to_millis(to), i64::MAX))
            .map(|((ms, _), value)| (from_millis(*ms), value.clone()))
            .collect()
    }

    /// Insert a batch of raw points. A sequence already stored for the same
    /// entity is left untouched.
    ///
    /// Returns `true` if any row was added. The version counter moves once
    /// per changing batch.
    pub fn upsert_batch(&self, points: &[DataPoint]) -> bool {
        let _gate = self.evictions.read();
        self.insert_rows(points)
    }

    /// Like [`upsert_batch`](Self::upsert_batch), but only if nothing was
    /// evicted since `generation` was read from
    /// [`eviction_generation`](Self::eviction_generation).
    ///
    /// Returns `None` without touching the cache when an eviction happened
    /// in between; the caller should re-read its source.
    pub fn upsert_batch_since(&self, points: &[DataPoint], generation: u64) -> Option<bool> {
        let gate = self.evictions.read();
        if *gate != generation {
            return None;
        }
        Some(self.insert_rows(points))
    }

    pub fn eviction_generation(&self) -> u64 {
        *self.evictions.read()
    }

    fn insert_rows(&self, points: &[DataPoint]) -> bool {
        let mut grouped: BTreeMap<String, Vec<(i64, i64, D::Value)>> = BTreeMap::new();
        for point in points {
            if let Some(value) = self.decoder.decode(point) {
                grouped.entry(self.decoder.key(point)).or_default().push((
                    to_millis(point.timestamp),
                    point.sequence,
                    value,
                ));
            }
        }

        let mut changed = false;
        for (key, values) in grouped {
            let series = Arc::clone(self.entities.entry(key).or_default().value());
            let mut stored = series.points.write();

            for (ms, sequence, value) in values {
                if stored.insert(ms, sequence, value) {
                    changed = true;
                    self.first_ms.fetch_min(ms, Ordering::AcqRel);
                    self.last_ms.fetch_max(ms, Ordering::AcqRel);
                }
            }
        }

        if changed {
            self.touch();
        }
        changed
    }

    /// Drop every value older than `cutoff`. Returns the number removed.
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut generation = self.evictions.write();
        *generation += 1;

        let cutoff_ms = to_millis(cutoff);
        let mut removed = 0;
        let mut new_first = i64::MAX;

        for entry in self.entities.iter() {
            let mut points = entry.value().points.write();
            removed += points.split_before(cutoff_ms);
            if let Some(((ms, _), _)) = points.rows.iter().next() {
                new_first = new_first.min(*ms);
            }
        }
        self.entities.retain(|_, series| !series.points.read().rows.is_empty());

        self.first_ms.store(new_first, Ordering::Release);
        self.coverage_ms.fetch_max(cutoff_ms, Ordering::AcqRel);
        if removed > 0 {
            self.touch();
        }
        removed
    }

    /// Drop one entity entirely.
    pub fn evict(&self, key: &str) -> bool {
        let mut generation = self.evictions.write();
        *generation += 1;
        let removed = self.entities.remove(key).is_some();
        if removed {
            self.touch();
        }
        removed
    }

    pub fn clear(&self) {
        let mut generation = self.evictions.write();
        *generation += 1;
        self.entities.clear();
        self.first_ms.store(i64::MAX, Ordering::Release);
        self.last_ms.store(i64::MIN, Ordering::Release);
        self.touch();
    }

    /// Mark warm-up complete from `horizon` onward.
    pub fn mark_warm(&self, horizon: DateTime<Utc>) {
        self.coverage_ms.store(to_millis(horizon), Ordering::Release);
        self.warm.store(true, Ordering::Release);
    }

    pub fn is_warm(&self) -> bool {
        self.warm.load(Ordering::Acquire)
    }

    /// `true` if every stored row at or after `from` is present in memory.
    pub fn covers(&self, from: DateTime<Utc>) -> bool {
        self.is_warm() && to_millis(from) >= self.coverage_ms.load(Ordering::Acquire)
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        match self.first_ms.load(Ordering::Acquire) {
            i64::MAX => None,
            ms => Some(from_millis(ms)),
        }
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        match self.last_ms.load(Ordering::Acquire) {
            i64::MIN => None,
            ms => Some(from_millis(ms)),
        }
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        match self.last_updated_ms.load(Ordering::Acquire) {
            i64::MIN => None,
            ms => Some(from_millis(ms)),
        }
    }

    /// Bumped on every visible change; aggregation memos key on it.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    fn touch(&self) {
        self.last_updated_ms
            .store(to_millis(Utc::now()), Ordering::Release);
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}
