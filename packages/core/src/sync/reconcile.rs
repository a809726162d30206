//! Snapshot reconciliation of one local collection against the remote.
//!
//! [`make_diff`] computes what has to change to make the local collection
//! match a remote snapshot; [`Reconciler::reconcile`] applies that diff
//! entity by entity. A failed write is logged and skipped, never fatal.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::events::{ChangeEvent, EventBus};
use crate::cache::HotCache;
use crate::models::{Annotation, Metric, Notification};
use crate::repository::{Repository, StoreResult};

/// An entity that can be reconciled by identity.
pub trait SyncEntity: Clone + Send + Sync + 'static {
    fn key(&self) -> &str;

    /// `true` if the remote copy (`self`) differs from `local` in any field
    /// the source owns.
    fn is_modified(&self, local: &Self) -> bool;

    /// Copy local-only state from `local` onto the remote copy.
    fn carry_forward(self, _local: &Self) -> Self {
        self
    }
}

impl SyncEntity for Metric {
    fn key(&self) -> &str {
        &self.id
    }

    fn is_modified(&self, local: &Self) -> bool {
        self.last_row_sequence != local.last_row_sequence
            || self.name != local.name
            || self.instance_id != local.instance_id
            || self.display_name != local.display_name
            || self.parameters != local.parameters
    }

    fn carry_forward(mut self, local: &Self) -> Self {
        self.ingested_sequence = local.ingested_sequence;
        self
    }
}

impl SyncEntity for Annotation {
    fn key(&self) -> &str {
        &self.id
    }

    fn is_modified(&self, local: &Self) -> bool {
        self != local
    }
}

impl SyncEntity for Notification {
    fn key(&self) -> &str {
        &self.notification_id
    }

    fn is_modified(&self, local: &Self) -> bool {
        self.metric_id != local.metric_id
            || self.timestamp != local.timestamp
            || self.message != local.message
    }

    fn carry_forward(mut self, local: &Self) -> Self {
        self.read = local.read;
        self
    }
}

/// Local side of a reconciliation: the full collection plus point writes.
#[async_trait]
pub trait LocalCollection: Send + Sync {
    type Entity: SyncEntity;

    fn name(&self) -> &'static str;

    /// Event published when a reconcile changed anything.
    fn changed_event(&self) -> ChangeEvent;

    async fn load(&self) -> StoreResult<Vec<Self::Entity>>;
    async fn insert(&self, entity: &Self::Entity) -> StoreResult<()>;
    async fn update(&self, entity: &Self::Entity) -> StoreResult<()>;
    async fn remove(&self, key: &str) -> StoreResult<()>;
}

/// What has to change to make local == remote.
#[derive(Debug, Clone)]
pub struct Diff<E> {
    pub insert: Vec<E>,
    pub update: Vec<E>,
    pub remove: Vec<String>,
}

impl<E> Diff<E> {
    pub fn is_noop(&self) -> bool {
        self.insert.is_empty() && self.update.is_empty() && self.remove.is_empty()
    }
}

/// Compute the diff between a remote snapshot and the local collection.
///
/// Remote duplicates collapse to the last occurrence. Updates already carry
/// local-only fields forward.
pub fn make_diff<E: SyncEntity>(remote: Vec<E>, local: Vec<E>) -> Diff<E> {
    let local: BTreeMap<String, E> = local
        .into_iter()
        .map(|e| (e.key().to_string(), e))
        .collect();
    let remote: BTreeMap<String, E> = remote
        .into_iter()
        .map(|e| (e.key().to_string(), e))
        .collect();
    let remote_keys: BTreeSet<&str> = remote.keys().map(String::as_str).collect();

    let mut insert = Vec::new();
    let mut update = Vec::new();
    for (key, entity) in &remote {
        match local.get(key) {
            None => insert.push(entity.clone()),
            Some(existing) if entity.is_modified(existing) => {
                update.push(entity.clone().carry_forward(existing));
            }
            Some(_) => {}
        }
    }

    let remove = local
        .keys()
        .filter(|key| !remote_keys.contains(key.as_str()))
        .cloned()
        .collect();

    Diff {
        insert,
        update,
        remove,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub failed: usize,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        self.added + self.updated + self.removed > 0
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "+{} ~{} -{} (failed {})",
            self.added, self.updated, self.removed, self.failed
        )
    }
}

#[derive(Clone)]
pub struct Reconciler {
    events: EventBus,
}

impl Reconciler {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }

    /// Make `collection` match `remote`.
    ///
    /// Only loading the local collection can fail the call; individual
    /// writes that fail are logged and counted in `failed`. Publishes the
    /// collection's change event once if anything changed.
    pub async fn reconcile<C: LocalCollection>(
        &self,
        collection: &C,
        remote: Vec<C::Entity>,
    ) -> StoreResult<ReconcileReport> {
        let local = collection.load().await?;
        let diff = make_diff(remote, local);
        let mut report = ReconcileReport::default();

        if diff.is_noop() {
            debug!("{}: already in sync", collection.name());
            return Ok(report);
        }

        for entity in &diff.insert {
            match collection.insert(entity).await {
                Ok(()) => report.added += 1,
                Err(err) => {
                    warn!("{}: insert of {} failed: {}", collection.name(), entity.key(), err);
                    report.failed += 1;
                }
            }
        }

        for entity in &diff.update {
            match collection.update(entity).await {
                Ok(()) => report.updated += 1,
                Err(err) => {
                    warn!("{}: update of {} failed: {}", collection.name(), entity.key(), err);
                    report.failed += 1;
                }
            }
        }

        for key in &diff.remove {
            match collection.remove(key).await {
                Ok(()) => report.removed += 1,
                Err(err) => {
                    warn!("{}: delete of {} failed: {}", collection.name(), key, err);
                    report.failed += 1;
                }
            }
        }

        debug!("{}: reconciled {}", collection.name(), report);
        if report.changed() {
            self.events.publish(collection.changed_event());
        }
        Ok(report)
    }
}

/// Metrics table. Removing a metric cascades to its points and
/// notifications and evicts its cached series.
pub struct MetricCollection {
    repo: Repository,
    cache: Arc<HotCache>,
}

impl MetricCollection {
    pub fn new(repo: Repository, cache: Arc<HotCache>) -> Self {
        Self { repo, cache }
    }
}

#[async_trait]
impl LocalCollection for MetricCollection {
    type Entity = Metric;

    fn name(&self) -> &'static str {
        "metrics"
    }

    fn changed_event(&self) -> ChangeEvent {
        ChangeEvent::MetricsChanged
    }

    async fn load(&self) -> StoreResult<Vec<Metric>> {
        self.repo.list_metrics().await
    }

    async fn insert(&self, metric: &Metric) -> StoreResult<()> {
        self.repo.insert_metric(metric).await
    }

    async fn update(&self, metric: &Metric) -> StoreResult<()> {
        self.repo.update_metric(metric).await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        self.repo.delete_metric(id).await?;
        self.cache.evict(id);
        Ok(())
    }
}

/// Annotations inside one time window; rows outside it are left alone.
pub struct AnnotationCollection {
    repo: Repository,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

impl AnnotationCollection {
    pub fn new(repo: Repository, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { repo, from, to }
    }
}

#[async_trait]
impl LocalCollection for AnnotationCollection {
    type Entity = Annotation;

    fn name(&self) -> &'static str {
        "annotations"
    }

    fn changed_event(&self) -> ChangeEvent {
        ChangeEvent::AnnotationsChanged
    }

    async fn load(&self) -> StoreResult<Vec<Annotation>> {
        self.repo.list_annotations(self.from, self.to).await
    }

    async fn insert(&self, annotation: &Annotation) -> StoreResult<()> {
        self.repo.insert_annotation(annotation).await
    }

    async fn update(&self, annotation: &Annotation) -> StoreResult<()> {
        self.repo.update_annotation(annotation).await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        self.repo.delete_annotation(id).await.map(|_| ())
    }
}

pub struct NotificationCollection {
    repo: Repository,
}

impl NotificationCollection {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl LocalCollection for NotificationCollection {
    type Entity = Notification;

    fn name(&self) -> &'static str {
        "notifications"
    }

    fn changed_event(&self) -> ChangeEvent {
        ChangeEvent::NotificationsChanged
    }

    async fn load(&self) -> StoreResult<Vec<Notification>> {
        self.repo.list_notifications().await
    }

    async fn insert(&self, notification: &Notification) -> StoreResult<()> {
        self.repo.insert_notification(notification).await
    }

    async fn update(&self, notification: &Notification) -> StoreResult<()> {
        self.repo.update_notification(notification).await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        self.repo.delete_notification(id).await.map(|_| ())
    }
}
