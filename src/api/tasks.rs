use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult, ok_json};
use crate::app::AppState;
use crate::store::models::{TaskFilter, TaskPipelineStatus, TaskPublishStatus};
use crate::util::error::CoreError;

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    config_id: Option<Uuid>,
    pipeline_status: Option<String>,
    publish_status: Option<String>,
    limit: Option<usize>,
}

pub(crate) async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let pipeline_status = match query.pipeline_status.as_deref() {
        None => None,
        Some(raw) => Some(TaskPipelineStatus::from_str(raw).ok_or_else(|| {
            ApiError(CoreError::bad_request(format!(
                "unknown pipeline_status: {raw:?}"
            )))
        })?),
    };
    let publish_status = match query.publish_status.as_deref() {
        None => None,
        Some(raw) => Some(TaskPublishStatus::from_str(raw).ok_or_else(|| {
            ApiError(CoreError::bad_request(format!(
                "unknown publish_status: {raw:?}"
            )))
        })?),
    };

    let tasks = state
        .store()
        .list_tasks(TaskFilter {
            config_id: query.config_id,
            pipeline_status,
            publish_status,
            limit: query.limit,
        })
        .await?;
    Ok(ok_json(tasks))
}

pub(crate) async fn fetch(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult {
    let task = state.store().get_task(task_id).await?;
    Ok(ok_json(task))
}

pub(crate) async fn retry(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult {
    let retry = state.engine().retry_task(task_id).await?;
    Ok(ok_json(json!({
        "task_id": retry.task_id,
        "origin_task_id": retry.origin_task_id,
    })))
}

pub(crate) async fn cancel(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult {
    let task = state.engine().cancel_task(task_id).await?;
    Ok(ok_json(json!({
        "task_id": task.task_id,
        "pipeline_status": task.pipeline_status,
        "publish_status": task.publish_status,
    })))
}
