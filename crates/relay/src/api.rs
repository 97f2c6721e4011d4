// Read-only introspection endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Query, State},
    http::{header::CONTENT_TYPE, HeaderValue},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use canvasync_common::types::{CanvasSnapshot, DEFAULT_CANVAS_ID};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{ErrorCode, RelayError};
use crate::hub::{HubHandle, HubInfo};
use crate::memory::{GovernorHandle, MemorySample};
use crate::metrics::RelayMetrics;
use crate::persistence::{CanvasStore, StoreStats};
use crate::validation::validate_canvas_id;

#[derive(Clone)]
pub struct ApiState {
    pub hub: HubHandle,
    pub store: CanvasStore,
    pub governor: GovernorHandle,
    pub metrics: Arc<RelayMetrics>,
    pub started_at: Instant,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/v1/session", get(session_info))
        .route("/v1/canvas", get(canvas))
        .route("/v1/status", get(status))
        .with_state(state)
}

async fn render_metrics(State(state): State<ApiState>) -> Response {
    let mut response = state.metrics.render_prometheus().into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
    response
}

async fn hub_info(hub: &HubHandle) -> Result<HubInfo, RelayError> {
    hub.info()
        .await
        .ok_or_else(|| RelayError::new(ErrorCode::InternalError, "session hub is not running"))
}

async fn session_info(State(state): State<ApiState>) -> Result<Json<HubInfo>, RelayError> {
    hub_info(&state.hub).await.map(Json)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CanvasQuery {
    canvas_id: Option<String>,
}

async fn canvas(
    State(state): State<ApiState>,
    Query(query): Query<CanvasQuery>,
) -> Result<Json<CanvasSnapshot>, RelayError> {
    let canvas_id = match query.canvas_id.as_deref() {
        None => DEFAULT_CANVAS_ID.to_string(),
        Some(raw) => validate_canvas_id(raw)?,
    };

    // Unknown ids are not synthesized on read.
    let known = canvas_id == DEFAULT_CANVAS_ID
        || state.store.snapshot(&canvas_id).is_some()
        || state.store.files().canvas_path(&canvas_id).exists();
    if !known {
        return Err(RelayError::new(ErrorCode::NotFound, format!("canvas `{canvas_id}` not found")));
    }

    state.store.load(&canvas_id).await.map(Json).map_err(|load_error| {
        error!(canvas_id = %canvas_id, error = %load_error, "failed to load canvas");
        RelayError::from_code(ErrorCode::PersistenceFailed)
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    uptime_secs: u64,
    memory: Option<MemorySample>,
    governed_resources: usize,
    store: StoreStats,
    hub: HubInfo,
}

async fn status(State(state): State<ApiState>) -> Result<Json<StatusResponse>, RelayError> {
    let hub = hub_info(&state.hub).await?;
    Ok(Json(StatusResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
        memory: state.governor.last_sample(),
        governed_resources: state.governor.registered(),
        store: state.store.stats(),
        hub,
    }))
}
