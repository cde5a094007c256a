use axum::{Json, extract::State};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::api::error::{ApiResult, ok_json};
use crate::app::AppState;
use crate::store::models::Account;

#[derive(Debug, Deserialize)]
pub(crate) struct AccountRequest {
    /// Client-supplied id makes the upsert idempotent.
    pub(crate) account_id: Option<Uuid>,
    pub(crate) display_name: String,
    pub(crate) profile_ref: String,
    #[serde(default = "default_active")]
    pub(crate) active: bool,
}

fn default_active() -> bool {
    true
}

pub(crate) async fn upsert(
    State(state): State<AppState>,
    Json(request): Json<AccountRequest>,
) -> ApiResult {
    let account_id = request.account_id.unwrap_or_else(Uuid::new_v4);
    state
        .store()
        .upsert_account(Account {
            account_id,
            display_name: request.display_name,
            profile_ref: request.profile_ref,
            active: request.active,
            created_at: Utc::now(),
        })
        .await?;
    Ok(ok_json(json!({"account_id": account_id})))
}

pub(crate) async fn list(State(state): State<AppState>) -> ApiResult {
    let accounts = state.store().list_accounts().await?;
    Ok(ok_json(accounts))
}
