//! Database repository for the local store.
//!
//! All SQLite read/write logic lives here. The reconciler writes metrics,
//! annotations and notifications through it; the ingestion writer bulk-inserts
//! raw rows with [`Repository::insert_data_points`]; the hot cache warms up
//! from [`Repository::fetch_points_between`].
//!
//! Timestamps are stored as INTEGER epoch milliseconds so range queries can use
//! the `(metric_id, timestamp)` index directly.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{Annotation, DataPoint, Metric, Notification};

/// SQLite result code for "database or disk is full".
const SQLITE_FULL: &str = "13";

/// Errors raised by the local store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage is full")]
    StorageFull,

    #[error("unknown metric referenced by write: {0}")]
    UnknownMetric(String),

    #[error("corrupt row in {table}: {message}")]
    Decode { table: &'static str, message: String },

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            let is_full = db
                .code()
                .as_deref()
                .map(|code| code == SQLITE_FULL)
                .unwrap_or(false);
            if is_full {
                return StoreError::StorageFull;
            }
        }
        StoreError::Database(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Repository for reading and writing the local store.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ---- Metrics ----

    pub async fn insert_metric(&self, metric: &Metric) -> StoreResult<()> {
        let parameters = encode_parameters(&metric.parameters)?;

        sqlx::query(
            "INSERT INTO metrics
             (id, name, instance_id, display_name, last_row_sequence, last_timestamp, ingested_sequence, parameters)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&metric.id)
        .bind(&metric.name)
        .bind(&metric.instance_id)
        .bind(&metric.display_name)
        .bind(metric.last_row_sequence)
        .bind(metric.last_timestamp.map(to_millis))
        .bind(metric.ingested_sequence)
        .bind(parameters)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Overwrite every column of an existing metric.
    /// Returns `true` if the metric existed.
    pub async fn update_metric(&self, metric: &Metric) -> StoreResult<bool> {
        let parameters = encode_parameters(&metric.parameters)?;

        let result = sqlx::query(
            "UPDATE metrics
             SET name = ?, instance_id = ?, display_name = ?, last_row_sequence = ?,
                 last_timestamp = ?, ingested_sequence = ?, parameters = ?
             WHERE id = ?",
        )
        .bind(&metric.name)
        .bind(&metric.instance_id)
        .bind(&metric.display_name)
        .bind(metric.last_row_sequence)
        .bind(metric.last_timestamp.map(to_millis))
        .bind(metric.ingested_sequence)
        .bind(parameters)
        .bind(&metric.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a metric. Its data points and notifications go with it.
    pub async fn delete_metric(&self, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM metrics WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_metric(&self, id: &str) -> StoreResult<Option<Metric>> {
        let row = sqlx::query(
            "SELECT id, name, instance_id, display_name, last_row_sequence, last_timestamp, ingested_sequence, parameters
             FROM metrics WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| decode_metric(&row)).transpose()
    }

    pub async fn list_metrics(&self) -> StoreResult<Vec<Metric>> {
        let rows = sqlx::query(
            "SELECT id, name, instance_id, display_name, last_row_sequence, last_timestamp, ingested_sequence, parameters
             FROM metrics ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_metric).collect()
    }

    pub async fn list_metrics_for_instance(&self, instance_id: &str) -> StoreResult<Vec<Metric>> {
        let rows = sqlx::query(
            "SELECT id, name, instance_id, display_name, last_row_sequence, last_timestamp, ingested_sequence, parameters
             FROM metrics WHERE instance_id = ? ORDER BY id ASC",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_metric).collect()
    }

    /// Advance the local ingestion watermark of a metric. Never moves it back.
    pub async fn advance_ingestion(&self, metric_id: &str, sequence: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE metrics SET ingested_sequence = MAX(ingested_sequence, ?) WHERE id = ?",
        )
        .bind(sequence)
        .bind(metric_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Timestamp of the newest stored row of a metric.
    pub async fn latest_point_timestamp(&self, metric_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MAX(timestamp) AS latest FROM data_points WHERE metric_id = ?")
            .bind(metric_id)
            .fetch_one(&self.pool)
            .await?;

        let latest: Option<i64> = row.try_get("latest")?;
        Ok(latest.map(from_millis))
    }

    // ---- Data points ----

    /// Bulk-insert data points in a single transaction.
    ///
    /// Rows whose `(metric_id, sequence)` already exists are skipped. Every
    /// referenced metric must exist; otherwise nothing is written and
    /// [`StoreError::UnknownMetric`] is returned. Returns the number of rows
    /// actually inserted.
    pub async fn insert_data_points(&self, points: &[DataPoint]) -> StoreResult<u64> {
        if points.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        let metric_ids: BTreeSet<&str> = points.iter().map(|p| p.metric_id.as_str()).collect();
        for metric_id in metric_ids {
            let exists = sqlx::query("SELECT 1 FROM metrics WHERE id = ?")
                .bind(metric_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                return Err(StoreError::UnknownMetric(metric_id.to_string()));
            }
        }

        let mut inserted = 0;
        for point in points {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO data_points
                 (metric_id, timestamp, value, anomaly_score, sequence)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&point.metric_id)
            .bind(to_millis(point.timestamp))
            .bind(point.value)
            .bind(point.anomaly_score)
            .bind(point.sequence)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Points of one metric with `from <= timestamp <= to`, ordered ascending.
    pub async fn fetch_points(
        &self,
        metric_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<DataPoint>> {
        let rows = sqlx::query(
            "SELECT metric_id, timestamp, value, anomaly_score, sequence
             FROM data_points
             WHERE metric_id = ? AND timestamp >= ? AND timestamp <= ?
             ORDER BY timestamp ASC, sequence ASC",
        )
        .bind(metric_id)
        .bind(to_millis(from))
        .bind(to_millis(to))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_point).collect()
    }

    /// Points of every metric with `from <= timestamp < to`, ordered ascending.
    ///
    /// Half-open so consecutive warm-up windows never read a row twice.
    pub async fn fetch_points_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<DataPoint>> {
        let rows = sqlx::query(
            "SELECT metric_id, timestamp, value, anomaly_score, sequence
             FROM data_points
             WHERE timestamp >= ? AND timestamp < ?
             ORDER BY timestamp ASC, sequence ASC",
        )
        .bind(to_millis(from))
        .bind(to_millis(to))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_point).collect()
    }

    pub async fn count_points(&self, metric_id: &str) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM data_points WHERE metric_id = ?")
            .bind(metric_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("cnt")?)
    }

    /// Delete all data points with timestamp older than `cutoff`.
    /// Returns the number of rows deleted.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM data_points WHERE timestamp < ?")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // ---- Annotations ----

    pub async fn insert_annotation(&self, annotation: &Annotation) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO annotations
             (id, instance_id, timestamp, created_at, device, user, message, data)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&annotation.id)
        .bind(&annotation.instance_id)
        .bind(to_millis(annotation.timestamp))
        .bind(to_millis(annotation.created_at))
        .bind(&annotation.device)
        .bind(&annotation.user)
        .bind(&annotation.message)
        .bind(&annotation.data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_annotation(&self, annotation: &Annotation) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE annotations
             SET instance_id = ?, timestamp = ?, created_at = ?, device = ?, user = ?, message = ?, data = ?
             WHERE id = ?",
        )
        .bind(&annotation.instance_id)
        .bind(to_millis(annotation.timestamp))
        .bind(to_millis(annotation.created_at))
        .bind(&annotation.device)
        .bind(&annotation.user)
        .bind(&annotation.message)
        .bind(&annotation.data)
        .bind(&annotation.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_annotation(&self, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM annotations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Annotations with `from <= timestamp <= to`, ordered ascending.
    pub async fn list_annotations(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Annotation>> {
        let rows = sqlx::query(
            "SELECT id, instance_id, timestamp, created_at, device, user, message, data
             FROM annotations
             WHERE timestamp >= ? AND timestamp <= ?
             ORDER BY timestamp ASC, id ASC",
        )
        .bind(to_millis(from))
        .bind(to_millis(to))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_annotation).collect()
    }

    // ---- Notifications ----

    pub async fn insert_notification(&self, notification: &Notification) -> StoreResult<()> {
        let read: i64 = if notification.read { 1 } else { 0 };

        sqlx::query(
            "INSERT INTO notifications (notification_id, metric_id, timestamp, message, read)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&notification.notification_id)
        .bind(&notification.metric_id)
        .bind(to_millis(notification.timestamp))
        .bind(&notification.message)
        .bind(read)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_notification(&self, notification: &Notification) -> StoreResult<bool> {
        let read: i64 = if notification.read { 1 } else { 0 };

        let result = sqlx::query(
            "UPDATE notifications SET metric_id = ?, timestamp = ?, message = ?, read = ?
             WHERE notification_id = ?",
        )
        .bind(&notification.metric_id)
        .bind(to_millis(notification.timestamp))
        .bind(&notification.message)
        .bind(read)
        .bind(&notification.notification_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_notification(&self, notification_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM notifications WHERE notification_id = ?")
            .bind(notification_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark a notification as read locally. Returns `true` if it exists.
    pub async fn mark_notification_read(&self, notification_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE notifications SET read = 1 WHERE notification_id = ?")
            .bind(notification_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_notifications(&self) -> StoreResult<Vec<Notification>> {
        let rows = sqlx::query(
            "SELECT notification_id, metric_id, timestamp, message, read
             FROM notifications ORDER BY timestamp DESC, notification_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_notification).collect()
    }

    // ---- Sync metadata ----

    pub async fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM sync_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO sync_meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ---- Row decoding ----

fn encode_parameters(parameters: &BTreeMap<String, String>) -> StoreResult<String> {
    serde_json::to_string(parameters).map_err(|err| StoreError::Decode {
        table: "metrics",
        message: err.to_string(),
    })
}

fn decode_metric(row: &SqliteRow) -> StoreResult<Metric> {
    let raw_parameters: String = row.try_get("parameters")?;
    let parameters = serde_json::from_str(&raw_parameters).map_err(|err| StoreError::Decode {
        table: "metrics",
        message: err.to_string(),
    })?;
    let last_timestamp: Option<i64> = row.try_get("last_timestamp")?;

    Ok(Metric {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        instance_id: row.try_get("instance_id")?,
        display_name: row.try_get("display_name")?,
        last_row_sequence: row.try_get("last_row_sequence")?,
        last_timestamp: last_timestamp.map(from_millis),
        parameters,
        ingested_sequence: row.try_get("ingested_sequence")?,
    })
}

fn decode_point(row: &SqliteRow) -> StoreResult<DataPoint> {
    let timestamp: i64 = row.try_get("timestamp")?;

    Ok(DataPoint {
        metric_id: row.try_get("metric_id")?,
        timestamp: from_millis(timestamp),
        value: row.try_get("value")?,
        anomaly_score: row.try_get("anomaly_score")?,
        sequence: row.try_get("sequence")?,
    })
}

fn decode_annotation(row: &SqliteRow) -> StoreResult<Annotation> {
    let timestamp: i64 = row.try_get("timestamp")?;
    let created_at: i64 = row.try_get("created_at")?;

    Ok(Annotation {
        id: row.try_get("id")?,
        instance_id: row.try_get("instance_id")?,
        timestamp: from_millis(timestamp),
        created_at: from_millis(created_at),
        device: row.try_get("device")?,
        user: row.try_get("user")?,
        message: row.try_get("message")?,
        data: row.try_get("data")?,
    })
}

fn decode_notification(row: &SqliteRow) -> StoreResult<Notification> {
    let timestamp: i64 = row.try_get("timestamp")?;
    let read: i64 = row.try_get("read")?;

    Ok(Notification {
        notification_id: row.try_get("notification_id")?,
        metric_id: row.try_get("metric_id")?,
        timestamp: from_millis(timestamp),
        message: row.try_get("message")?,
        read: read != 0,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::TimeZone;

    use crate::db::create_pool;

    pub async fn make_repo() -> Repository {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        Repository::new(pool)
    }

    /// Repository plus its pool, for tests that need raw PRAGMA access.
    pub async fn make_repo_with_pool() -> (Repository, SqlitePool) {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        (Repository::new(pool.clone()), pool)
    }

    /// Cap the database at its current size so the next growing write
    /// fails with SQLITE_FULL.
    pub async fn fill_storage(pool: &SqlitePool) {
        let row = sqlx::query("PRAGMA page_count").fetch_one(pool).await.unwrap();
        let pages: i64 = row.try_get(0).unwrap();
        sqlx::query(&format!("PRAGMA max_page_count = {}", pages))
            .execute(pool)
            .await
            .unwrap();
    }

    pub fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
    }

    pub fn make_metric(id: &str, instance_id: &str) -> Metric {
        Metric {
            id: id.to_string(),
            name: format!("{}.name", id),
            instance_id: instance_id.to_string(),
            display_name: format!("Metric {}", id),
            last_row_sequence: 0,
            last_timestamp: None,
            parameters: BTreeMap::new(),
            ingested_sequence: 0,
        }
    }

    pub fn make_point(metric_id: &str, hours: i64, score: f64, sequence: i64) -> DataPoint {
        DataPoint {
            metric_id: metric_id.to_string(),
            timestamp: base_time() + chrono::Duration::hours(hours),
            value: sequence as f64,
            anomaly_score: score,
            sequence,
        }
    }

    pub fn make_notification(id: &str, metric_id: &str) -> Notification {
        Notification {
            notification_id: id.to_string(),
            metric_id: metric_id.to_string(),
            timestamp: base_time(),
            message: format!("{} is anomalous", metric_id),
            read: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn insert_and_get_metric_roundtrip() {
        let repo = make_repo().await;
        let mut metric = make_metric("m1", "i1");
        metric.parameters.insert("signal".into(), "price".into());
        metric.last_timestamp = Some(base_time());

        repo.insert_metric(&metric).await.unwrap();

        let fetched = repo.get_metric("m1").await.unwrap().unwrap();
        assert_eq!(fetched, metric);
    }

    #[tokio::test]
    async fn get_metric_returns_none_when_missing() {
        let repo = make_repo().await;
        assert!(repo.get_metric("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_metric_returns_false_for_missing_id() {
        let repo = make_repo().await;
        let updated = repo.update_metric(&make_metric("ghost", "i1")).await.unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn insert_and_fetch_points_roundtrip() {
        let repo = make_repo().await;
        repo.insert_metric(&make_metric("m1", "i1")).await.unwrap();
        let points = vec![
            make_point("m1", 0, 0.1, 1),
            make_point("m1", 1, 0.2, 2),
            make_point("m1", 2, 0.3, 3),
        ];

        let inserted = repo.insert_data_points(&points).await.unwrap();
        assert_eq!(inserted, 3);

        let fetched = repo
            .fetch_points("m1", base_time(), base_time() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(fetched, points[..2].to_vec());
    }

    #[tokio::test]
    async fn duplicate_sequences_are_ignored() {
        let repo = make_repo().await;
        repo.insert_metric(&make_metric("m1", "i1")).await.unwrap();
        let points = vec![make_point("m1", 0, 0.1, 1), make_point("m1", 1, 0.2, 2)];

        repo.insert_data_points(&points).await.unwrap();
        let second = repo.insert_data_points(&points).await.unwrap();

        assert_eq!(second, 0);
        assert_eq!(repo.count_points("m1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn insert_points_for_unknown_metric_writes_nothing() {
        let repo = make_repo().await;
        repo.insert_metric(&make_metric("m1", "i1")).await.unwrap();
        let points = vec![make_point("m1", 0, 0.1, 1), make_point("ghost", 0, 0.1, 1)];

        let err = repo.insert_data_points(&points).await.unwrap_err();

        assert!(matches!(err, StoreError::UnknownMetric(ref id) if id == "ghost"));
        assert_eq!(repo.count_points("m1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn insert_empty_slice_is_ok() {
        let repo = make_repo().await;
        assert_eq!(repo.insert_data_points(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deleting_metric_cascades_to_points_and_notifications_only() {
        let repo = make_repo().await;
        repo.insert_metric(&make_metric("m1", "i1")).await.unwrap();
        repo.insert_metric(&make_metric("m2", "i1")).await.unwrap();
        repo.insert_data_points(&[make_point("m1", 0, 0.5, 1), make_point("m2", 0, 0.5, 1)])
            .await
            .unwrap();
        repo.insert_notification(&make_notification("n1", "m1")).await.unwrap();
        repo.insert_notification(&make_notification("n2", "m2")).await.unwrap();

        assert!(repo.delete_metric("m1").await.unwrap());

        assert_eq!(repo.count_points("m1").await.unwrap(), 0);
        assert_eq!(repo.count_points("m2").await.unwrap(), 1);
        let remaining = repo.list_notifications().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].notification_id, "n2");
    }

    #[tokio::test]
    async fn prune_older_than_removes_old_rows() {
        let repo = make_repo().await;
        repo.insert_metric(&make_metric("m1", "i1")).await.unwrap();
        repo.insert_data_points(&[
            make_point("m1", 0, 0.1, 1),
            make_point("m1", 5, 0.1, 2),
            make_point("m1", 10, 0.1, 3),
        ])
        .await
        .unwrap();

        let deleted = repo
            .prune_older_than(base_time() + Duration::hours(5))
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(repo.count_points("m1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn advance_ingestion_never_moves_backwards() {
        let repo = make_repo().await;
        repo.insert_metric(&make_metric("m1", "i1")).await.unwrap();

        repo.advance_ingestion("m1", 10).await.unwrap();
        repo.advance_ingestion("m1", 4).await.unwrap();

        let metric = repo.get_metric("m1").await.unwrap().unwrap();
        assert_eq!(metric.ingested_sequence, 10);
    }

    #[tokio::test]
    async fn latest_point_timestamp_tracks_newest_row() {
        let repo = make_repo().await;
        repo.insert_metric(&make_metric("m1", "i1")).await.unwrap();
        assert_eq!(repo.latest_point_timestamp("m1").await.unwrap(), None);

        repo.insert_data_points(&[make_point("m1", 3, 0.1, 2), make_point("m1", 1, 0.1, 1)])
            .await
            .unwrap();

        assert_eq!(
            repo.latest_point_timestamp("m1").await.unwrap(),
            Some(base_time() + Duration::hours(3))
        );
    }

    #[tokio::test]
    async fn fetch_points_between_is_half_open() {
        let repo = make_repo().await;
        repo.insert_metric(&make_metric("m1", "i1")).await.unwrap();
        repo.insert_data_points(&[make_point("m1", 0, 0.1, 1), make_point("m1", 1, 0.1, 2)])
            .await
            .unwrap();

        let rows = repo
            .fetch_points_between(base_time(), base_time() + Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sequence, 1);
    }

    #[tokio::test]
    async fn annotations_crud_cycle() {
        let repo = make_repo().await;
        let mut annotation = Annotation {
            id: "a1".into(),
            instance_id: "i1".into(),
            timestamp: base_time(),
            created_at: base_time(),
            device: "phone".into(),
            user: "ops".into(),
            message: "deploy".into(),
            data: None,
        };

        repo.insert_annotation(&annotation).await.unwrap();
        annotation.message = "rollback".into();
        assert!(repo.update_annotation(&annotation).await.unwrap());

        let listed = repo
            .list_annotations(base_time(), base_time() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(listed, vec![annotation]);

        assert!(repo.delete_annotation("a1").await.unwrap());
        assert!(!repo.delete_annotation("a1").await.unwrap());
    }

    #[tokio::test]
    async fn notification_read_flag_roundtrip() {
        let repo = make_repo().await;
        repo.insert_metric(&make_metric("m1", "i1")).await.unwrap();
        repo.insert_notification(&make_notification("n1", "m1")).await.unwrap();

        assert!(repo.mark_notification_read("n1").await.unwrap());

        let listed = repo.list_notifications().await.unwrap();
        assert!(listed[0].read);
    }

    #[tokio::test]
    async fn meta_upsert_overwrites() {
        let repo = make_repo().await;
        assert!(repo.get_meta("k").await.unwrap().is_none());

        repo.set_meta("k", "1").await.unwrap();
        repo.set_meta("k", "2").await.unwrap();

        assert_eq!(repo.get_meta("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn exhausted_database_reports_storage_full() {
        let (repo, pool) = make_repo_with_pool().await;
        repo.insert_metric(&make_metric("m1", "i1")).await.unwrap();
        fill_storage(&pool).await;

        let points: Vec<DataPoint> = (0..5_000)
            .map(|seq| make_point("m1", seq, 0.5, seq))
            .collect();
        let err = repo.insert_data_points(&points).await.unwrap_err();

        assert!(matches!(err, StoreError::StorageFull), "got {err:?}");
        assert_eq!(repo.count_points("m1").await.unwrap(), 0);
    }

    #[test]
    fn millis_roundtrip() {
        let ts = base_time() + Duration::milliseconds(1234);
        assert_eq!(from_millis(to_millis(ts)), ts);
    }
}
