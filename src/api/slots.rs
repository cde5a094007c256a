use axum::{
    Json,
    extract::{Query, State},
};
use chrono::NaiveDate;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::error::{ApiResult, ok_json};
use crate::app::AppState;
use crate::ring::SlotStrategy;

#[derive(Debug, Deserialize)]
pub(crate) struct GenerateSlotsRequest {
    pub(crate) config_id: Uuid,
    pub(crate) target_date: NaiveDate,
    pub(crate) start_hour: u32,
    pub(crate) end_hour: u32,
    #[serde(default = "default_strategy")]
    pub(crate) strategy: SlotStrategy,
}

fn default_strategy() -> SlotStrategy {
    SlotStrategy::Uniform
}

pub(crate) async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateSlotsRequest>,
) -> ApiResult {
    let slots = state
        .ring()
        .generate_slots(
            request.config_id,
            request.target_date,
            request.start_hour,
            request.end_hour,
            request.strategy,
        )
        .await?;
    Ok(ok_json(slots))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    config_id: Uuid,
    date: NaiveDate,
}

pub(crate) async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let slots = state.store().list_slots(query.config_id, query.date).await?;
    Ok(ok_json(slots))
}
