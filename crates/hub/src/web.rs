use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::controller::Controller;
use crate::dispatch::DispatchReceipt;
use crate::error::ControlError;
use crate::model::{Action, ThresholdUpdate, ZoneMode};
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub controller: Controller,
    pub shared: SharedState,
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ModeRequest {
    mode: ZoneMode,
    #[serde(default)]
    confirmed: bool,
}

#[derive(Deserialize)]
struct ActionRequest {
    action: Action,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub struct ApiError(pub ControlError);

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            ControlError::ModeConflict { .. } | ControlError::NoDevice(_) => StatusCode::CONFLICT,
            ControlError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ControlError::DeviceOffline { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ControlError::Transport { .. } => StatusCode::BAD_GATEWAY,
            ControlError::UnknownZone(_) | ControlError::UnknownDevice(_) => StatusCode::NOT_FOUND,
            ControlError::InvalidSetting(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ControlError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = json!({
            "error": err.code(),
            "message": err.to_string(),
        });
        let mut retry_after = None;
        match &err {
            ControlError::ModeConflict { required, .. } => {
                body["required"] = json!(required);
            }
            ControlError::RateLimited { retry_after: wait, .. } => {
                body["retry_after_ms"] = json!(wait.as_millis() as u64);
                // Retry-After is whole seconds; round up.
                retry_after = Some(wait.as_millis().div_ceil(1000).max(1));
            }
            ControlError::InvalidSetting(violations) => {
                body["violations"] = json!(violations);
            }
            _ => {}
        }

        let mut resp = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        resp
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/zones/{zone_id}/status", get(zone_status))
        .route("/api/zones/{zone_id}/mode", post(change_mode))
        .route("/api/zones/{zone_id}/actions", post(manual_action))
        .route("/api/zones/{zone_id}/ai-actions", post(ai_action))
        .route("/api/zones/{zone_id}/settings", put(update_settings))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let zones = state.controller.all_zone_status().await?;
    let st = state.shared.read().await;
    Ok(Json(st.to_status(zones)))
}

async fn zone_status(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.zone_status(&zone_id).await?))
}

async fn change_mode(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
    Json(req): Json<ModeRequest>,
) -> ApiResult<impl IntoResponse> {
    let mode = state
        .controller
        .request_mode_change(&zone_id, req.mode, req.confirmed)
        .await?;
    Ok(Json(json!({ "zone_id": zone_id, "mode": mode })))
}

async fn manual_action(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
    Json(req): Json<ActionRequest>,
) -> ApiResult<impl IntoResponse> {
    let receipt = state
        .controller
        .request_manual_action(&zone_id, req.action)
        .await?;
    Ok(accepted(&zone_id, receipt))
}

async fn ai_action(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
    Json(req): Json<ActionRequest>,
) -> ApiResult<impl IntoResponse> {
    let receipt = state.controller.request_ai_action(&zone_id, req.action).await?;
    Ok(accepted(&zone_id, receipt))
}

async fn update_settings(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
    Json(update): Json<ThresholdUpdate>,
) -> ApiResult<impl IntoResponse> {
    let setting = state.controller.update_thresholds(&zone_id, &update).await?;
    Ok(Json(setting))
}

fn accepted(zone_id: &str, r: DispatchReceipt) -> impl IntoResponse {
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "zone_id": zone_id,
            "device_id": r.device_id,
            "action": r.action,
            "accepted": true,
            "shutoff_in_sec": r.shutoff_in.map(|d| d.as_secs()),
        })),
    )
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "operator api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
