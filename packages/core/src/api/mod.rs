//! HTTP query surface over the local store.
//!
//! Read endpoints answer from the aggregation engine and the hot cache with
//! ETag/Cache-Control validators; heavy reads run on the background worker
//! pool. `POST /api/sync/refresh` starts a pass without waiting for it.

pub mod headers;
pub mod health;
pub mod query;
pub mod status;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::aggregation::AggregationEngine;
use crate::cache::HotCache;
use crate::calendar::MarketCalendar;
use crate::error::AppError;
use crate::metrics::AppMetrics;
use crate::repository::Repository;
use crate::runtime::{PoolKind, WorkerPools};
use crate::sync::SyncOrchestrator;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub repo: Repository,
    pub cache: Arc<HotCache>,
    pub engine: Arc<AggregationEngine>,
    pub calendar: Arc<MarketCalendar>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub pools: WorkerPools,
    pub metrics: Arc<AppMetrics>,
    /// Cancelled on shutdown; refreshes started over HTTP use a child token.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Best guess at when the served data last changed.
    pub fn data_modified(&self) -> DateTime<Utc> {
        self.cache
            .last_updated()
            .or(self.orchestrator.status().last_finished_at)
            .unwrap_or_else(Utc::now)
    }

    /// Run a read on the background pool so it cannot starve sync work.
    pub async fn on_background<F, T>(&self, job: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>> + Send + 'static,
        T: Send + 'static,
    {
        self.pools
            .run(PoolKind::Background, job)
            .await
            .map_err(|err| AppError::Unavailable(err.to_string()))?
    }
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(health::prometheus))
        .route("/api/metrics", get(query::list_metrics))
        .route("/api/metrics/:id/data", get(query::metric_data))
        .route("/api/metrics/:id/aggregate", get(query::metric_aggregate))
        .route("/api/instances", get(query::ranked_instances))
        .route("/api/instances/:id/aggregate", get(query::instance_aggregate))
        .route("/api/calendar/closed", get(query::closed_intervals))
        .route("/api/sync/status", get(status::sync_status))
        .route("/api/sync/refresh", post(status::refresh))
        .route_layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn track_requests(State(state): State<SharedState>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());
    let started = Instant::now();

    let response = next.run(request).await;

    state
        .metrics
        .http_requests_total
        .with_label_values(&[method.as_str(), path.as_str(), response.status().as_str()])
        .inc();
    state
        .metrics
        .http_request_duration
        .observe(started.elapsed().as_secs_f64());
    response
}
