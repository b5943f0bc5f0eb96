//! HTTP control surface
//!
//! Thin JSON handlers over [`Controller`] and the session client. Nothing here
//! touches the dispatch path directly.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::error::Error;
use crate::models::{Feed, RuleSpec};
use crate::scraper::qbittorrent::SessionClient;
use crate::scraper::tracker::{ControlError, Controller};
use crate::status::StatusSnapshot;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
    pub client: Arc<SessionClient>,
}

#[derive(Deserialize)]
pub struct EnabledForm {
    enabled: bool,
}

#[derive(Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    delete_files: bool,
}

#[derive(Serialize)]
struct StatusView {
    feeds: Vec<Feed>,
    state: StatusSnapshot,
}

/// Errors a handler can return
pub enum ApiError {
    Control(ControlError),
    Remote(Error),
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        ApiError::Control(err)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Remote(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Control(ControlError::NotFound(what)) => {
                (StatusCode::NOT_FOUND, format!("{} not found", what))
            }
            ApiError::Control(ControlError::Invalid(msg)) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Control(err @ ControlError::Storage(_)) => {
                tracing::error!("Control call failed: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ApiError::Remote(Error::Cancelled) => {
                (StatusCode::SERVICE_UNAVAILABLE, Error::Cancelled.to_string())
            }
            ApiError::Remote(err) => {
                tracing::warn!("Remote call failed: {}", err);
                (StatusCode::BAD_GATEWAY, err.to_string())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/feeds/:id/trigger", post(trigger_feed))
        .route("/feeds/:id/enabled", post(set_feed_enabled))
        .route("/rules", get(list_rules).post(add_rule))
        .route("/rules/:id", axum::routing::put(update_rule).delete(remove_rule))
        .route("/rules/:id/enabled", post(set_rule_enabled))
        .route("/rules/:id/history", get(rule_history))
        .route("/client/version", get(client_version))
        .route("/client/pause", post(pause_client))
        .route("/client/resume", post(resume_client))
        .route("/client/torrents", axum::routing::delete(delete_torrents))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusView {
        feeds: state.controller.feeds(),
        state: state.controller.status(),
    })
}

async fn trigger_feed(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let started = state.controller.trigger_feed(&id)?;
    let code = if started {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    };
    Ok((code, Json(json!({ "feed": id, "started": started }))).into_response())
}

async fn set_feed_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(form): Json<EnabledForm>,
) -> ApiResult<StatusCode> {
    state.controller.set_feed_enabled(&id, form.enabled)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_rules(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.list_rules().await)
}

#[axum::debug_handler]
async fn add_rule(
    State(state): State<AppState>,
    Json(spec): Json<RuleSpec>,
) -> ApiResult<(StatusCode, Json<RuleSpec>)> {
    let stored = state.controller.add_rule(spec).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(spec): Json<RuleSpec>,
) -> ApiResult<Json<RuleSpec>> {
    Ok(Json(state.controller.update_rule(&id, spec).await?))
}

async fn remove_rule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.controller.remove_rule(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_rule_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(form): Json<EnabledForm>,
) -> ApiResult<StatusCode> {
    state.controller.set_rule_enabled(&id, form.enabled).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn rule_history(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.rule_history(&id).await?))
}

async fn client_version(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let version = state.client.app_version().await?;
    Ok(Json(json!({
        "version": version,
        "url": state.client.base_url(),
        "logins": state.client.login_count(),
    })))
}

async fn pause_client(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let paused = state.client.pause_downloading().await?;
    Ok(Json(json!({ "paused": paused })))
}

async fn resume_client(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let resumed = state.client.resume_paused().await?;
    Ok(Json(json!({ "resumed": resumed })))
}

/// Removes every torrent from the client; `?delete_files=true` also drops data
async fn delete_torrents(
    State(state): State<AppState>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<StatusCode> {
    state.client.delete_all(query.delete_files).await?;
    Ok(StatusCode::NO_CONTENT)
}
