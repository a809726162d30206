//! Sync status and manual refresh.

use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Serialize;

use super::SharedState;
use crate::sync::SyncStatus;

#[derive(Debug, Serialize)]
pub struct SyncStatusResponse {
    #[serde(flatten)]
    pub status: SyncStatus,
    pub message: Option<String>,
    pub source: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    /// `false` when a pass was already running; the request is then a no-op.
    pub started: bool,
}

pub async fn sync_status(State(state): State<SharedState>) -> impl IntoResponse {
    let status = state.orchestrator.status();
    let payload = SyncStatusResponse {
        message: status.user_message(Utc::now()),
        status: status.as_ref().clone(),
        source: state.orchestrator.source_name().to_string(),
    };
    (
        [(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))],
        Json(payload),
    )
}

/// Start a user-requested pass in the background and return immediately.
pub async fn refresh(State(state): State<SharedState>) -> impl IntoResponse {
    let started = !state.orchestrator.is_syncing();
    if started {
        let orchestrator = state.orchestrator.clone();
        let cancel = state.shutdown.child_token();
        tokio::spawn(async move {
            orchestrator.force_refresh(cancel).await;
        });
    }
    (StatusCode::ACCEPTED, Json(RefreshResponse { started }))
}
