use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult, ok_json};
use crate::app::AppState;
use crate::store::models::{Monitor, MonitorType};
use crate::util::error::CoreError;

#[derive(Debug, Deserialize)]
pub(crate) struct MonitorRequest {
    pub(crate) platform: String,
    pub(crate) monitor_type: String,
    pub(crate) target_identifier: String,
    #[serde(default = "default_interval")]
    pub(crate) check_interval_secs: i64,
    #[serde(default)]
    pub(crate) config: Option<Value>,
}

fn default_interval() -> i64 {
    300
}

fn parse_type(raw: &str) -> Result<MonitorType, ApiError> {
    MonitorType::from_str(raw).ok_or_else(|| {
        ApiError(CoreError::bad_request(format!(
            "unknown monitor_type: {raw:?}"
        )))
    })
}

pub(crate) async fn create(
    State(state): State<AppState>,
    Json(request): Json<MonitorRequest>,
) -> ApiResult {
    if request.check_interval_secs < 1 {
        return Err(ApiError(CoreError::bad_request(
            "check_interval_secs must be positive",
        )));
    }
    let monitor = Monitor {
        monitor_id: Uuid::new_v4(),
        platform: request.platform,
        monitor_type: parse_type(&request.monitor_type)?,
        target_identifier: request.target_identifier,
        check_interval_secs: request.check_interval_secs,
        last_check: None,
        active: false,
        config: request.config.unwrap_or_else(|| json!({})),
    };
    let monitor_id = monitor.monitor_id;
    state.store().create_monitor(monitor).await?;
    Ok(ok_json(json!({"monitor_id": monitor_id})))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    #[serde(default)]
    active: bool,
}

pub(crate) async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let monitors = state.store().list_monitors(query.active).await?;
    Ok(ok_json(monitors))
}

pub(crate) async fn fetch(
    State(state): State<AppState>,
    Path(monitor_id): Path<Uuid>,
) -> ApiResult {
    let monitor = state.store().get_monitor(monitor_id).await?;
    Ok(ok_json(monitor))
}

pub(crate) async fn update(
    State(state): State<AppState>,
    Path(monitor_id): Path<Uuid>,
    Json(request): Json<MonitorRequest>,
) -> ApiResult {
    let existing = state.store().get_monitor(monitor_id).await?;
    let monitor = Monitor {
        monitor_id,
        platform: request.platform,
        monitor_type: parse_type(&request.monitor_type)?,
        target_identifier: request.target_identifier,
        check_interval_secs: request.check_interval_secs,
        last_check: existing.last_check,
        active: existing.active,
        config: request.config.unwrap_or(existing.config),
    };
    state.store().update_monitor(monitor).await?;
    Ok(ok_json(json!({"monitor_id": monitor_id})))
}

pub(crate) async fn remove(
    State(state): State<AppState>,
    Path(monitor_id): Path<Uuid>,
) -> ApiResult {
    state.monitors().stop(monitor_id).await.ok();
    state.store().delete_monitor(monitor_id).await?;
    Ok(ok_json(json!({"monitor_id": monitor_id})))
}

pub(crate) async fn start(
    State(state): State<AppState>,
    Path(monitor_id): Path<Uuid>,
) -> ApiResult {
    state.monitors().start(monitor_id).await?;
    Ok(ok_json(json!({"monitor_id": monitor_id, "active": true})))
}

pub(crate) async fn stop(
    State(state): State<AppState>,
    Path(monitor_id): Path<Uuid>,
) -> ApiResult {
    state.monitors().stop(monitor_id).await?;
    Ok(ok_json(json!({"monitor_id": monitor_id, "active": false})))
}
