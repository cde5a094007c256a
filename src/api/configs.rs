use axum::{
    Json,
    extract::{Path, Query, State},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult, ok_json};
use crate::app::AppState;
use crate::store::models::PublishConfig;
use crate::trigger::schedule::TriggerSpec;
use crate::util::error::CoreError;

#[derive(Debug, Deserialize)]
pub(crate) struct ConfigRequest {
    pub(crate) name: String,
    pub(crate) group_id: Uuid,
    pub(crate) pipeline_id: String,
    pub(crate) trigger_kind: String,
    pub(crate) trigger_config: Value,
    #[serde(default)]
    pub(crate) strategy_id: Option<Uuid>,
    #[serde(default = "default_priority")]
    pub(crate) priority: i32,
    #[serde(default)]
    pub(crate) pipeline_params: Option<Value>,
    #[serde(default)]
    pub(crate) publish_delay_secs: Option<i64>,
}

fn default_priority() -> i32 {
    50
}

async fn validate_references(state: &AppState, request: &ConfigRequest) -> Result<(), ApiError> {
    let group = state.store().get_group(request.group_id).await?;
    if !group.active {
        return Err(ApiError(CoreError::bad_request(format!(
            "group {} is inactive",
            request.group_id
        ))));
    }
    state.pipelines().get(&request.pipeline_id).await?;
    if let Some(strategy_id) = request.strategy_id {
        state.store().get_strategy(strategy_id).await?;
    }
    Ok(())
}

pub(crate) async fn create(
    State(state): State<AppState>,
    Json(request): Json<ConfigRequest>,
) -> ApiResult {
    validate_references(&state, &request).await?;
    let trigger = TriggerSpec::from_parts(&request.trigger_kind, &request.trigger_config)?;

    let config = PublishConfig {
        config_id: Uuid::new_v4(),
        name: request.name,
        group_id: request.group_id,
        pipeline_id: request.pipeline_id,
        trigger,
        strategy_id: request.strategy_id,
        priority: request.priority,
        active: true,
        pipeline_params: request.pipeline_params.unwrap_or_else(|| json!({})),
        publish_delay_secs: request.publish_delay_secs,
        last_fire: None,
        created_at: Utc::now(),
    };
    let config_id = config.config_id;
    state.store().create_config(config).await?;
    Ok(ok_json(json!({"config_id": config_id})))
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
    let configs = state.store().list_configs(query.active).await?;
    Ok(ok_json(configs))
}

pub(crate) async fn fetch(
    State(state): State<AppState>,
    Path(config_id): Path<Uuid>,
) -> ApiResult {
    let config = state.store().get_config(config_id).await?;
    Ok(ok_json(config))
}

pub(crate) async fn update(
    State(state): State<AppState>,
    Path(config_id): Path<Uuid>,
    Json(request): Json<ConfigRequest>,
) -> ApiResult {
    validate_references(&state, &request).await?;
    let existing = state.store().get_config(config_id).await?;
    let trigger = TriggerSpec::from_parts(&request.trigger_kind, &request.trigger_config)?;

    let config = PublishConfig {
        config_id,
        name: request.name,
        group_id: request.group_id,
        pipeline_id: request.pipeline_id,
        trigger,
        strategy_id: request.strategy_id,
        priority: request.priority,
        active: existing.active,
        pipeline_params: request.pipeline_params.unwrap_or(existing.pipeline_params),
        publish_delay_secs: request.publish_delay_secs,
        last_fire: existing.last_fire,
        created_at: existing.created_at,
    };
    state.store().update_config(config).await?;
    Ok(ok_json(json!({"config_id": config_id})))
}

pub(crate) async fn toggle(
    State(state): State<AppState>,
    Path(config_id): Path<Uuid>,
) -> ApiResult {
    let config = state.store().get_config(config_id).await?;
    state
        .store()
        .set_config_active(config_id, !config.active)
        .await?;
    Ok(ok_json(json!({"config_id": config_id, "active": !config.active})))
}

pub(crate) async fn remove(
    State(state): State<AppState>,
    Path(config_id): Path<Uuid>,
) -> ApiResult {
    state.store().delete_config(config_id).await?;
    Ok(ok_json(json!({"config_id": config_id})))
}

/// Dry-run of the trigger evaluation: what would fire next, and when.
pub(crate) async fn next_fire(
    State(state): State<AppState>,
    Path(config_id): Path<Uuid>,
) -> ApiResult {
    let config = state.store().get_config(config_id).await?;
    let TriggerSpec::Scheduled(spec) = &config.trigger else {
        return Err(ApiError(CoreError::bad_request(
            "monitor-triggered configs have no fire schedule",
        )));
    };
    let anchor = config.last_fire.unwrap_or(config.created_at);
    let next = spec.next_after(anchor)?;
    Ok(ok_json(json!({
        "config_id": config_id,
        "last_fire": config.last_fire,
        "next_fire": next,
        "overdue": next.is_some_and(|t| t <= Utc::now()),
    })))
}
