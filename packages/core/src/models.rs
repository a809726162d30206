//! Core data types shared by the store, the caches and the sync pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A monitored metric as reported by the remote source.
///
/// `last_row_sequence` and `last_timestamp` are source-assigned and act as the
/// change marker during reconciliation. `ingested_sequence` is local-only: it
/// records how far raw-data ingestion has progressed and survives updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    pub name: String,
    pub instance_id: String,
    pub display_name: String,
    pub last_row_sequence: i64,
    pub last_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub ingested_sequence: i64,
}

impl Metric {
    /// Sub-signal this metric feeds into the instance-level mask.
    pub fn signal_kind(&self) -> SignalKind {
        self.parameters
            .get("signal")
            .map(|raw| SignalKind::parse(raw))
            .unwrap_or(SignalKind::Other)
    }

    /// Human name of the owning instance, if the source supplied one.
    pub fn instance_name(&self) -> Option<&str> {
        self.parameters.get("instance_name").map(String::as_str)
    }
}

/// One raw row of a metric's time series.
///
/// `(metric_id, sequence)` is unique; rows are immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub metric_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub anomaly_score: f64,
    pub sequence: i64,
}

/// Derived grouping of every metric sharing an `instance_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub display_name: Option<String>,
    pub metric_ids: Vec<String>,
}

impl Instance {
    /// Group metrics into instances, ordered by instance id.
    pub fn group(metrics: &[Metric]) -> Vec<Instance> {
        let mut grouped: BTreeMap<&str, Instance> = BTreeMap::new();
        for metric in metrics {
            let entry = grouped
                .entry(metric.instance_id.as_str())
                .or_insert_with(|| Instance {
                    instance_id: metric.instance_id.clone(),
                    display_name: None,
                    metric_ids: Vec::new(),
                });
            if entry.display_name.is_none() {
                entry.display_name = metric.instance_name().map(str::to_string);
            }
            entry.metric_ids.push(metric.id.clone());
        }
        grouped.into_values().collect()
    }
}

/// Aggregated value of one time bucket.
///
/// `mask` has bit [`SignalKind::bit`] set for every sub-signal that produced
/// an anomalous reading inside the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyValue {
    pub score: f64,
    pub mask: u32,
}

impl AnomalyValue {
    pub fn new(score: f64, mask: u32) -> Self {
        Self { score, mask }
    }

    /// Probationary values are stored with their sign inverted.
    pub fn is_probation(&self) -> bool {
        self.score.is_sign_negative()
    }
}

/// Kind of signal a metric represents. Used only to build contribution masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    Price,
    Volume,
    Social,
    Other,
}

impl SignalKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "price" | "stock_price" => SignalKind::Price,
            "volume" | "stock_volume" => SignalKind::Volume,
            "social" | "twitter" | "news" => SignalKind::Social,
            _ => SignalKind::Other,
        }
    }

    pub fn bit(self) -> u32 {
        match self {
            SignalKind::Price => 1 << 0,
            SignalKind::Volume => 1 << 1,
            SignalKind::Social => 1 << 2,
            SignalKind::Other => 1 << 3,
        }
    }
}

/// A user-facing notification attached to a metric.
///
/// `read` is local-only state; it is never taken from the remote snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: String,
    pub metric_id: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub read: bool,
}

/// A free-form note left on an instance by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub device: String,
    pub user: String,
    pub message: String,
    pub data: Option<String>,
}

/// Application-level metadata published by the remote source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub server_version: String,
    pub learning_threshold: Option<i64>,
}
