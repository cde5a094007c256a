use axum::extract::State;
use serde_json::json;

use crate::api::error::{ApiResult, ok_json};
use crate::app::AppState;

pub(crate) async fn fetch(State(state): State<AppState>) -> ApiResult {
    let store = state.store();
    let counts = store.overview_counts().await?;
    let recent = store.recent_tasks(10).await?;
    let top_accounts = store.top_accounts(5).await?;
    Ok(ok_json(json!({
        "counts": counts,
        "recent_tasks": recent,
        "top_accounts": top_accounts,
        "executor": state.engine().status(),
    })))
}
