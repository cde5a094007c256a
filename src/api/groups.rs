use axum::{
    Json,
    extract::{Path, State},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult, ok_json};
use crate::app::AppState;
use crate::store::models::{AccountGroup, GroupMember, GroupType};
use crate::util::error::CoreError;

#[derive(Debug, Deserialize)]
pub(crate) struct CreateGroupRequest {
    pub(crate) name: String,
    pub(crate) group_type: String,
    #[serde(default)]
    pub(crate) description: Option<String>,
}

fn parse_group_type(raw: &str) -> Result<GroupType, ApiError> {
    GroupType::from_str(raw).ok_or_else(|| {
        ApiError(CoreError::bad_request(format!(
            "unknown group_type: {raw:?}"
        )))
    })
}

pub(crate) async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateGroupRequest>,
) -> ApiResult {
    let group = AccountGroup {
        group_id: Uuid::new_v4(),
        name: request.name,
        group_type: parse_group_type(&request.group_type)?,
        description: request.description,
        active: true,
        created_at: Utc::now(),
    };
    let group_id = group.group_id;
    state.store().create_group(group).await?;
    Ok(ok_json(json!({"group_id": group_id})))
}

pub(crate) async fn list(State(state): State<AppState>) -> ApiResult {
    let groups = state.store().list_groups().await?;
    Ok(ok_json(groups))
}

pub(crate) async fn fetch(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> ApiResult {
    let group = state.store().get_group(group_id).await?;
    let members = state.store().list_group_members(group_id).await?;
    Ok(ok_json(json!({"group": group, "members": members})))
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpdateGroupRequest {
    pub(crate) name: Option<String>,
    pub(crate) group_type: Option<String>,
    pub(crate) description: Option<String>,
    pub(crate) active: Option<bool>,
}

pub(crate) async fn update(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Json(request): Json<UpdateGroupRequest>,
) -> ApiResult {
    let mut group = state.store().get_group(group_id).await?;
    if let Some(name) = request.name {
        group.name = name;
    }
    if let Some(raw) = request.group_type {
        group.group_type = parse_group_type(&raw)?;
    }
    if let Some(description) = request.description {
        group.description = Some(description);
    }
    if let Some(active) = request.active {
        group.active = active;
    }
    state.store().update_group(group).await?;
    Ok(ok_json(json!({"group_id": group_id})))
}

pub(crate) async fn remove(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> ApiResult {
    state.store().delete_group(group_id).await?;
    Ok(ok_json(json!({"group_id": group_id})))
}

#[derive(Debug, Deserialize)]
pub(crate) struct AddMembersRequest {
    pub(crate) account_ids: Vec<Uuid>,
    #[serde(default)]
    pub(crate) role: Option<String>,
}

pub(crate) async fn add_members(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Json(request): Json<AddMembersRequest>,
) -> ApiResult {
    if request.account_ids.is_empty() {
        return Err(ApiError(CoreError::bad_request(
            "account_ids must not be empty",
        )));
    }
    // Ranks continue after the existing members, in request order.
    let existing = state.store().list_group_members(group_id).await?;
    let base_rank = existing.iter().map(|m| m.member_rank + 1).max().unwrap_or(0);
    let members = request
        .account_ids
        .iter()
        .enumerate()
        .map(|(offset, account_id)| GroupMember {
            group_id,
            account_id: *account_id,
            member_rank: base_rank + offset as i32,
            role: request.role.clone(),
        })
        .collect();
    state.store().add_group_members(group_id, members).await?;
    Ok(ok_json(json!({
        "group_id": group_id,
        "added": request.account_ids.len(),
    })))
}

pub(crate) async fn remove_member(
    State(state): State<AppState>,
    Path((group_id, account_id)): Path<(Uuid, Uuid)>,
) -> ApiResult {
    state.store().remove_group_member(group_id, account_id).await?;
    Ok(ok_json(json!({"group_id": group_id, "account_id": account_id})))
}
