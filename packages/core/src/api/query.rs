//! Read handlers: metrics, raw ranges, aggregates, rankings, calendar.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Response,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::headers::{cached_json, CachePolicy};
use super::SharedState;
use crate::aggregation::{Bucket, BucketSize, EntityRef, RankedInstance, Severity};
use crate::calendar::ClosedInterval;
use crate::error::AppError;
use crate::models::{DataPoint, Metric};

const DEFAULT_BUCKET_COUNT: usize = 24;
const MAX_CALENDAR_SPAN_DAYS: i64 = 366;

#[derive(Debug, Default, Deserialize)]
pub struct AggregateQuery {
    pub bucket: Option<BucketSize>,
    pub count: Option<usize>,
    pub end: Option<DateTime<Utc>>,
}

impl AggregateQuery {
    fn resolve(&self) -> (BucketSize, DateTime<Utc>, usize) {
        (
            self.bucket.unwrap_or(BucketSize::Hour),
            self.end.unwrap_or_else(Utc::now),
            self.count.unwrap_or(DEFAULT_BUCKET_COUNT),
        )
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl RangeQuery {
    fn resolve(&self, default_span: Duration) -> Result<(DateTime<Utc>, DateTime<Utc>), AppError> {
        let to = self.to.unwrap_or_else(Utc::now);
        let from = self.from.unwrap_or(to - default_span);
        if from > to {
            return Err(AppError::BadRequest("`from` must not be after `to`".to_string()));
        }
        Ok((from, to))
    }
}

#[derive(Debug, Serialize)]
pub struct BucketView {
    pub start: DateTime<Utc>,
    pub score: Option<f64>,
    pub mask: u32,
    pub probation: bool,
    pub severity: Severity,
}

#[derive(Debug, Serialize)]
pub struct AggregateResponse {
    pub entity: EntityRef,
    pub bucket: BucketSize,
    pub buckets: Vec<BucketView>,
}

#[derive(Debug, Serialize)]
pub struct InstanceView {
    pub instance_id: String,
    pub display_name: Option<String>,
    pub metric_ids: Vec<String>,
    pub rank: f64,
    pub buckets: Vec<BucketView>,
}

#[derive(Debug, Serialize)]
pub struct RangeResponse {
    pub metric_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub points: Vec<DataPoint>,
}

#[derive(Debug, Serialize)]
pub struct ClosedIntervalsResponse {
    pub timezone: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub intervals: Vec<ClosedInterval>,
}

fn bucket_views(state: &SharedState, buckets: &[Bucket]) -> Vec<BucketView> {
    buckets
        .iter()
        .map(|bucket| BucketView {
            start: bucket.start,
            score: bucket.value.map(|v| v.score),
            mask: bucket.value.map_or(0, |v| v.mask),
            probation: bucket.value.is_some_and(|v| v.is_probation()),
            severity: state.engine.severity(bucket.value),
        })
        .collect()
}

pub async fn list_metrics(
    State(state): State<SharedState>,
    request_headers: HeaderMap,
) -> Result<Response, AppError> {
    let metrics: Vec<Metric> = state.repo.list_metrics().await?;
    cached_json(&request_headers, &metrics, CachePolicy::LISTING, state.data_modified())
}

pub async fn metric_data(
    State(state): State<SharedState>,
    Path(metric_id): Path<String>,
    Query(params): Query<RangeQuery>,
    request_headers: HeaderMap,
) -> Result<Response, AppError> {
    let (from, to) = params.resolve(Duration::hours(24))?;
    if state.repo.get_metric(&metric_id).await?.is_none() {
        return Err(AppError::NotFound(metric_id));
    }

    let engine = state.engine.clone();
    let id = metric_id.clone();
    let points = state
        .on_background(async move {
            engine
                .range_query(&id, from, to)
                .await
                .map_err(AppError::from)
        })
        .await?;

    let payload = RangeResponse {
        metric_id,
        from,
        to,
        points,
    };
    cached_json(&request_headers, &payload, CachePolicy::SERIES, state.data_modified())
}

pub async fn metric_aggregate(
    State(state): State<SharedState>,
    Path(metric_id): Path<String>,
    Query(params): Query<AggregateQuery>,
    request_headers: HeaderMap,
) -> Result<Response, AppError> {
    aggregate(state, EntityRef::Metric(metric_id), params, request_headers).await
}

pub async fn instance_aggregate(
    State(state): State<SharedState>,
    Path(instance_id): Path<String>,
    Query(params): Query<AggregateQuery>,
    request_headers: HeaderMap,
) -> Result<Response, AppError> {
    aggregate(state, EntityRef::Instance(instance_id), params, request_headers).await
}

async fn aggregate(
    state: SharedState,
    entity: EntityRef,
    params: AggregateQuery,
    request_headers: HeaderMap,
) -> Result<Response, AppError> {
    let (size, end, count) = params.resolve();

    let engine = state.engine.clone();
    let target = entity.clone();
    let buckets = state
        .on_background(async move {
            engine
                .aggregate(&target, size, end, count)
                .await
                .map_err(AppError::from)
        })
        .await?;

    let payload = AggregateResponse {
        entity,
        bucket: size,
        buckets: bucket_views(&state, &buckets),
    };
    cached_json(&request_headers, &payload, CachePolicy::SERIES, state.data_modified())
}

pub async fn ranked_instances(
    State(state): State<SharedState>,
    Query(params): Query<AggregateQuery>,
    request_headers: HeaderMap,
) -> Result<Response, AppError> {
    let (size, end, count) = params.resolve();

    let engine = state.engine.clone();
    let ranked: Vec<RankedInstance> = state
        .on_background(async move {
            engine
                .ranked_instances(size, end, count)
                .await
                .map_err(AppError::from)
        })
        .await?;

    let payload: Vec<InstanceView> = ranked
        .into_iter()
        .map(|r| InstanceView {
            buckets: bucket_views(&state, &r.buckets),
            rank: r.rank.value,
            instance_id: r.instance.instance_id,
            display_name: r.instance.display_name,
            metric_ids: r.instance.metric_ids,
        })
        .collect();
    cached_json(&request_headers, &payload, CachePolicy::LISTING, state.data_modified())
}

pub async fn closed_intervals(
    State(state): State<SharedState>,
    Query(params): Query<RangeQuery>,
    request_headers: HeaderMap,
) -> Result<Response, AppError> {
    let (from, to) = params.resolve(Duration::days(7))?;
    if to - from > Duration::days(MAX_CALENDAR_SPAN_DAYS) {
        return Err(AppError::BadRequest(format!(
            "calendar range is limited to {} days",
            MAX_CALENDAR_SPAN_DAYS
        )));
    }

    let payload = ClosedIntervalsResponse {
        timezone: state.calendar.timezone().name().to_string(),
        from,
        to,
        intervals: state.calendar.closed_intervals(from, to),
    };
    cached_json(&request_headers, &payload, CachePolicy::STATIC, Utc::now())
}
