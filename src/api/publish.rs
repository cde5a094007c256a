use axum::{
    Json,
    extract::{Path, Query, State},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult, ok_json};
use crate::app::AppState;
use crate::registry::PipelineOutcome;
use crate::store::models::{PublishFilter, PublishStatus, PublishTask, TaskPipelineStatus};
use crate::strategy::BaseMetadata;
use crate::util::error::CoreError;

#[derive(Debug, Deserialize)]
pub(crate) struct ScheduleRequest {
    pub(crate) task_id: Uuid,
    pub(crate) account_ids: Vec<Uuid>,
    #[serde(default)]
    pub(crate) title: Option<String>,
    #[serde(default)]
    pub(crate) description: Option<String>,
    #[serde(default)]
    pub(crate) tags: Option<Vec<String>>,
    #[serde(default)]
    pub(crate) thumbnail_ref: Option<String>,
    #[serde(default)]
    pub(crate) scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub(crate) privacy: Option<String>,
}

/// Manual publish scheduling for a completed task, immediate or deferred.
pub(crate) async fn schedule(
    State(state): State<AppState>,
    Json(request): Json<ScheduleRequest>,
) -> ApiResult {
    if request.account_ids.is_empty() {
        return Err(ApiError(CoreError::bad_request(
            "account_ids must not be empty",
        )));
    }

    let task = state.store().get_task(request.task_id).await?;
    // A publish task may only hang off a completed pipeline run.
    if task.pipeline_status != TaskPipelineStatus::Completed {
        return Err(ApiError(CoreError::conflict(format!(
            "task {} has no completed pipeline result",
            task.task_id
        ))));
    }
    let outcome: PipelineOutcome = task
        .pipeline_result
        .clone()
        .ok_or_else(|| CoreError::conflict("task has no pipeline result recorded"))
        .and_then(|value| {
            serde_json::from_value(value)
                .map_err(|e| CoreError::permanent(format!("stored pipeline result: {e}")))
        })?;
    let base = BaseMetadata::from_outcome(&outcome)?;

    let now = Utc::now();
    let scheduled_time = request.scheduled_time.unwrap_or(now);
    if scheduled_time < now - chrono::Duration::seconds(1) {
        return Err(ApiError(CoreError::bad_request(
            "scheduled_time must not be in the past",
        )));
    }

    let mut publish_ids = Vec::with_capacity(request.account_ids.len());
    for account_id in &request.account_ids {
        // Reject unknown accounts before anything is enqueued.
        state.store().get_account(*account_id).await?;
        let row = PublishTask {
            publish_id: Uuid::new_v4(),
            task_id: task.task_id,
            account_id: *account_id,
            title: request.title.clone().unwrap_or_else(|| base.title.clone()),
            description: request
                .description
                .clone()
                .unwrap_or_else(|| base.description.clone()),
            tags: request.tags.clone().unwrap_or_else(|| base.tags.clone()),
            thumbnail_ref: request
                .thumbnail_ref
                .clone()
                .or_else(|| base.thumbnail_ref.clone()),
            privacy: request
                .privacy
                .clone()
                .unwrap_or_else(|| base.privacy.clone()),
            video_ref: base.video_ref.clone(),
            status: PublishStatus::Scheduled,
            scheduled_time,
            is_scheduled: request.scheduled_time.is_some(),
            retry_count: 0,
            error: None,
            platform_video_id: None,
            platform_url: None,
            variant_name: task.variant_name.clone(),
            origin_publish_id: None,
            created_at: now,
            completed_at: None,
        };
        publish_ids.push(row.publish_id);
        state.publisher().schedule(row).await?;
    }

    Ok(ok_json(json!({
        "task_id": task.task_id,
        "publish_ids": publish_ids,
        "scheduled_time": scheduled_time,
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    task_id: Option<Uuid>,
    account_id: Option<Uuid>,
    status: Option<String>,
    limit: Option<usize>,
}

pub(crate) async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(PublishStatus::from_str(raw).ok_or_else(|| {
            ApiError(CoreError::bad_request(format!(
                "unknown publish status: {raw:?}"
            )))
        })?),
    };
    let publishes = state
        .store()
        .list_publishes(PublishFilter {
            task_id: query.task_id,
            account_id: query.account_id,
            status,
            limit: query.limit,
        })
        .await?;
    Ok(ok_json(publishes))
}

/// The deferred queue as the store sees it, earliest first.
pub(crate) async fn queue(State(state): State<AppState>) -> ApiResult {
    let queued = state.store().load_scheduled_publishes().await?;
    Ok(ok_json(queued))
}

pub(crate) async fn cancel(
    State(state): State<AppState>,
    Path(publish_id): Path<Uuid>,
) -> ApiResult {
    state.store().cancel_publish(publish_id).await?;
    // Heap hygiene; the store CAS already guarantees the entry cannot fire.
    let _ = state.publisher().cancel(publish_id).await;
    Ok(ok_json(json!({"publish_id": publish_id})))
}

#[derive(Debug, Deserialize)]
pub(crate) struct RescheduleRequest {
    pub(crate) new_time: DateTime<Utc>,
}

pub(crate) async fn reschedule(
    State(state): State<AppState>,
    Path(publish_id): Path<Uuid>,
    Json(request): Json<RescheduleRequest>,
) -> ApiResult {
    state
        .store()
        .reschedule_publish(publish_id, request.new_time)
        .await?;
    let _ = state
        .publisher()
        .reschedule(publish_id, request.new_time)
        .await;
    Ok(ok_json(json!({
        "publish_id": publish_id,
        "scheduled_time": request.new_time,
    })))
}

/// Explicit retry of a failed publish: a new row linked to the original.
pub(crate) async fn retry(
    State(state): State<AppState>,
    Path(publish_id): Path<Uuid>,
) -> ApiResult {
    let original = state.store().get_publish(publish_id).await?;
    if original.status != PublishStatus::Failed {
        return Err(ApiError(CoreError::conflict(format!(
            "publish task {publish_id} is not in a failed state"
        ))));
    }

    let now = Utc::now();
    let retry = PublishTask {
        publish_id: Uuid::new_v4(),
        status: PublishStatus::Scheduled,
        scheduled_time: now,
        is_scheduled: false,
        retry_count: original.retry_count.saturating_add(1),
        error: None,
        platform_video_id: None,
        platform_url: None,
        origin_publish_id: Some(original.publish_id),
        created_at: now,
        completed_at: None,
        ..original
    };
    let retry_id = retry.publish_id;
    state.publisher().schedule(retry).await?;
    Ok(ok_json(json!({
        "publish_id": retry_id,
        "origin_publish_id": publish_id,
    })))
}
