use axum::{
    Json,
    extract::{Path, Query, State},
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult, ok_json};
use crate::app::AppState;
use crate::store::models::{Strategy, StrategyAssignment, StrategyKind};
use crate::util::error::CoreError;

#[derive(Debug, Deserialize)]
pub(crate) struct StrategyRequest {
    pub(crate) name: String,
    #[serde(rename = "type")]
    pub(crate) kind: String,
    #[serde(default)]
    pub(crate) parameters: Option<Value>,
    #[serde(default)]
    pub(crate) start_date: Option<NaiveDate>,
    #[serde(default)]
    pub(crate) end_date: Option<NaiveDate>,
}

fn parse_kind(raw: &str) -> Result<StrategyKind, ApiError> {
    StrategyKind::from_str(raw).ok_or_else(|| {
        ApiError(CoreError::bad_request(format!(
            "unknown strategy type: {raw:?}"
        )))
    })
}

pub(crate) async fn create(
    State(state): State<AppState>,
    Json(request): Json<StrategyRequest>,
) -> ApiResult {
    let strategy = Strategy {
        strategy_id: Uuid::new_v4(),
        name: request.name,
        kind: parse_kind(&request.kind)?,
        parameters: request.parameters.unwrap_or_else(|| json!({})),
        active: true,
        start_date: request.start_date,
        end_date: request.end_date,
    };
    let strategy_id = strategy.strategy_id;
    state.store().create_strategy(strategy).await?;
    Ok(ok_json(json!({"strategy_id": strategy_id})))
}

pub(crate) async fn list(State(state): State<AppState>) -> ApiResult {
    let strategies = state.store().list_strategies().await?;
    Ok(ok_json(strategies))
}

pub(crate) async fn fetch(
    State(state): State<AppState>,
    Path(strategy_id): Path<Uuid>,
) -> ApiResult {
    let strategy = state.store().get_strategy(strategy_id).await?;
    Ok(ok_json(strategy))
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpdateStrategyRequest {
    pub(crate) name: Option<String>,
    #[serde(rename = "type")]
    pub(crate) kind: Option<String>,
    pub(crate) parameters: Option<Value>,
    pub(crate) active: Option<bool>,
    pub(crate) start_date: Option<NaiveDate>,
    pub(crate) end_date: Option<NaiveDate>,
}

pub(crate) async fn update(
    State(state): State<AppState>,
    Path(strategy_id): Path<Uuid>,
    Json(request): Json<UpdateStrategyRequest>,
) -> ApiResult {
    let mut strategy = state.store().get_strategy(strategy_id).await?;
    if let Some(name) = request.name {
        strategy.name = name;
    }
    if let Some(raw) = request.kind {
        strategy.kind = parse_kind(&raw)?;
    }
    if let Some(parameters) = request.parameters {
        strategy.parameters = parameters;
    }
    if let Some(active) = request.active {
        strategy.active = active;
    }
    if request.start_date.is_some() {
        strategy.start_date = request.start_date;
    }
    if request.end_date.is_some() {
        strategy.end_date = request.end_date;
    }
    state.store().update_strategy(strategy).await?;
    Ok(ok_json(json!({"strategy_id": strategy_id})))
}

pub(crate) async fn remove(
    State(state): State<AppState>,
    Path(strategy_id): Path<Uuid>,
) -> ApiResult {
    state.store().delete_strategy(strategy_id).await?;
    Ok(ok_json(json!({"strategy_id": strategy_id})))
}

#[derive(Debug, Deserialize)]
pub(crate) struct VariantRequest {
    pub(crate) variant_name: String,
    #[serde(default)]
    pub(crate) payload: Option<Value>,
    #[serde(default = "default_weight")]
    pub(crate) weight: f64,
    #[serde(default)]
    pub(crate) is_control: bool,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
pub(crate) struct AssignRequest {
    pub(crate) group_id: Uuid,
    pub(crate) variants: Vec<VariantRequest>,
}

pub(crate) async fn assign(
    State(state): State<AppState>,
    Path(strategy_id): Path<Uuid>,
    Json(request): Json<AssignRequest>,
) -> ApiResult {
    state.store().get_strategy(strategy_id).await?;
    state.store().get_group(request.group_id).await?;
    if request.variants.is_empty() {
        return Err(ApiError(CoreError::bad_request(
            "variants must not be empty",
        )));
    }

    for variant in &request.variants {
        state
            .store()
            .upsert_assignment(StrategyAssignment {
                assignment_id: Uuid::new_v4(),
                strategy_id,
                group_id: request.group_id,
                variant_name: variant.variant_name.clone(),
                payload: variant.payload.clone().unwrap_or_else(|| json!({})),
                weight: variant.weight,
                is_control: variant.is_control,
            })
            .await?;
    }
    Ok(ok_json(json!({
        "strategy_id": strategy_id,
        "group_id": request.group_id,
        "variants": request.variants.len(),
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct AssignmentsQuery {
    group_id: Uuid,
}

pub(crate) async fn assignments(
    State(state): State<AppState>,
    Path(strategy_id): Path<Uuid>,
    Query(query): Query<AssignmentsQuery>,
) -> ApiResult {
    let assignments = state
        .store()
        .list_assignments(strategy_id, query.group_id)
        .await?;
    Ok(ok_json(assignments))
}
