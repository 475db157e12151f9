// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! HTTP API — runs alongside the analytics manager, exposing the §6
//! external interfaces. Thin by design: every handler validates the
//! request shape and delegates straight to [`PipelineManager`].
//!
//! Endpoints:
//!   GET    /api/status                          → telemetry snapshot (JSON)
//!   GET    /api/cameras                          → list active camera ids
//!   POST   /api/cameras                          → add source (hot)
//!   DELETE /api/cameras/{id}                     → remove source (hot)
//!   GET    /api/cameras/{id}/health               → per-camera PipelineHealth
//!   PUT    /api/cameras/{id}/stream               → update stream config
//!   GET    /api/cameras/{id}/rois                 → list ROIs
//!   PUT    /api/cameras/{id}/rois                 → upsert ROI
//!   DELETE /api/cameras/{id}/rois/{roi_id}        → remove ROI
//!   GET    /api/cameras/{id}/rules                → list behavior rules
//!   PUT    /api/cameras/{id}/rules                → upsert behavior rule
//!   DELETE /api/cameras/{id}/rules/{rule_id}      → remove behavior rule
//!   GET    /api/cameras/{id}/snapshot.jpg          → last rendered frame
//!   GET    /api/cameras/{id}/stream.mjpeg          → live MJPEG stream

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config::{SourceConfig, StreamConfig};
use crate::error::AnalyticsError;
use crate::manager::PipelineManager;
use crate::rules::{BehaviorRule, Roi};

/// Shared state passed to all handlers.
pub struct AppState {
    pub manager: Arc<PipelineManager>,
}

// ──────────────── response types ───────────────────────────────────────────

#[derive(Serialize)]
struct StatusResponse {
    monitoring_healthy: bool,
    pipelines: Vec<crate::health::PipelineHealth>,
    system: SystemStats,
}

#[derive(Serialize)]
struct SystemStats {
    camera_count: usize,
    max_pipelines: usize,
    indexed_clips: usize,
}

#[derive(Serialize)]
struct CameraListResponse {
    cameras: Vec<String>,
}

// ──────────────── router ───────────────────────────────────────────────────

/// Build the axum router. `manager` is shared with the background monitor
/// task started in [`PipelineManager::new`].
pub fn build_router(manager: Arc<PipelineManager>) -> Router {
    let state = Arc::new(AppState { manager });
    Router::new()
        .route("/api/status", get(handle_status))
        .route("/api/cameras", get(handle_list_cameras).post(handle_add_camera))
        .route("/api/cameras/{id}", delete(handle_remove_camera))
        .route("/api/cameras/{id}/health", get(handle_camera_health))
        .route("/api/cameras/{id}/stream", put(handle_update_stream))
        .route("/api/cameras/{id}/rois", get(handle_list_rois).put(handle_upsert_roi))
        .route("/api/cameras/{id}/rois/{roi_id}", delete(handle_remove_roi))
        .route("/api/cameras/{id}/rules", get(handle_list_rules).put(handle_upsert_rule))
        .route("/api/cameras/{id}/rules/{rule_id}", delete(handle_remove_rule))
        .route("/api/cameras/{id}/snapshot.jpg", get(handle_snapshot))
        .route("/api/cameras/{id}/stream.mjpeg", get(handle_mjpeg))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Starts the HTTP surface on `cfg.api.port` and runs until the process
/// exits. The caller spawns this as a background task.
pub async fn start_server(manager: Arc<PipelineManager>) -> std::io::Result<()> {
    let port = manager.config().api.port;
    let router = build_router(manager);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "API server listening");
    axum::serve(listener, router).await
}

fn map_err(e: AnalyticsError) -> (StatusCode, String) {
    let status = match &e {
        AnalyticsError::PipelineNotFound { .. } => StatusCode::NOT_FOUND,
        AnalyticsError::ConfigInvalid(_) | AnalyticsError::PolygonInvalid { .. } => StatusCode::BAD_REQUEST,
        AnalyticsError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ids = state.manager.list_pipelines();
    let mut pipelines = Vec::with_capacity(ids.len());
    for id in &ids {
        if let Ok(h) = state.manager.health(id).await {
            pipelines.push(h);
        }
    }
    let monitoring_healthy = pipelines.iter().all(|p| !matches!(p.state, crate::health::PipelineState::Failed));
    let resp = StatusResponse {
        monitoring_healthy,
        system: SystemStats {
            camera_count: ids.len(),
            max_pipelines: state.manager.config().max_pipelines,
            indexed_clips: state.manager.index.read().len(),
        },
        pipelines,
    };
    Json(resp)
}

async fn handle_list_cameras(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(CameraListResponse { cameras: state.manager.list_pipelines() })
}

async fn handle_add_camera(State(state): State<Arc<AppState>>, Json(source): Json<SourceConfig>) -> impl IntoResponse {
    match state.manager.add_pipeline(source).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

async fn handle_remove_camera(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.manager.remove_pipeline(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

async fn handle_camera_health(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.manager.health(&id).await {
        Ok(h) => Json(h).into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

async fn handle_update_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(cfg): Json<StreamConfig>,
) -> impl IntoResponse {
    match state.manager.update_stream_config(&id, cfg).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

async fn handle_list_rois(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.manager.list_rois(&id).await {
        Ok(rois) => Json(rois).into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

async fn handle_upsert_roi(State(state): State<Arc<AppState>>, Path(id): Path<String>, Json(roi): Json<Roi>) -> impl IntoResponse {
    match state.manager.add_roi(&id, roi).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

async fn handle_remove_roi(State(state): State<Arc<AppState>>, Path((id, roi_id)): Path<(String, String)>) -> impl IntoResponse {
    match state.manager.remove_roi(&id, &roi_id).await {
        Ok(found) if found => StatusCode::NO_CONTENT.into_response(),
        Ok(_) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

async fn handle_list_rules(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.manager.list_rules(&id).await {
        Ok(rules) => Json(rules).into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

async fn handle_upsert_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(rule): Json<BehaviorRule>,
) -> impl IntoResponse {
    match state.manager.set_rule(&id, rule).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

async fn handle_remove_rule(State(state): State<Arc<AppState>>, Path((id, rule_id)): Path<(String, String)>) -> impl IntoResponse {
    match state.manager.remove_rule(&id, &rule_id).await {
        Ok(found) if found => StatusCode::NO_CONTENT.into_response(),
        Ok(_) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

async fn handle_snapshot(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.manager.last_frame(&id).await {
        Ok(Some(bytes)) => ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

/// Streams multipart MJPEG. A disconnected or slow client is dropped from
/// the broadcast channel by [`crate::output::streamer::MjpegPublisher`]
/// rather than stalling the pipeline that feeds it.
async fn handle_mjpeg(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    let mut rx = match state.manager.mjpeg_subscribe(&id).await {
        Ok(rx) => rx,
        Err(e) => return map_err(e).into_response(),
    };
    let camera_id = id.clone();
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    let mut chunk = Vec::with_capacity(frame.len() + 64);
                    chunk.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ");
                    chunk.extend_from_slice(frame.len().to_string().as_bytes());
                    chunk.extend_from_slice(b"\r\n\r\n");
                    chunk.extend_from_slice(&frame);
                    chunk.extend_from_slice(b"\r\n");
                    yield Ok::<_, std::io::Error>(chunk);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    error!(camera = %camera_id, skipped, "mjpeg subscriber lagged, dropping frames");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    let body = axum::body::Body::from_stream(stream);
    (
        [(header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame")],
        body,
    )
        .into_response()
}
