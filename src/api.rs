pub(crate) mod accounts;
pub(crate) mod configs;
pub(crate) mod error;
pub(crate) mod executor;
pub(crate) mod groups;
pub(crate) mod health;
pub(crate) mod metrics;
pub(crate) mod monitors;
pub(crate) mod overview;
pub(crate) mod pipelines;
pub(crate) mod publish;
pub(crate) mod slots;
pub(crate) mod strategies;
pub(crate) mod tasks;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::trace::TraceLayer;

use crate::app::AppState;

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/ready", get(health::ready))
        .route("/health/live", get(health::live))
        .route("/metrics", get(metrics::exporter))
        .route("/pipelines", post(pipelines::create).get(pipelines::list))
        .route(
            "/pipelines/{pipeline_id}",
            get(pipelines::fetch)
                .put(pipelines::update)
                .delete(pipelines::remove),
        )
        .route("/accounts", post(accounts::upsert).get(accounts::list))
        .route("/account-groups", post(groups::create).get(groups::list))
        .route(
            "/account-groups/{group_id}",
            get(groups::fetch).put(groups::update).delete(groups::remove),
        )
        .route("/account-groups/{group_id}/members", post(groups::add_members))
        .route(
            "/account-groups/{group_id}/members/{account_id}",
            delete(groups::remove_member),
        )
        .route("/publish-configs", post(configs::create).get(configs::list))
        .route(
            "/publish-configs/{config_id}",
            get(configs::fetch)
                .put(configs::update)
                .delete(configs::remove),
        )
        .route("/publish-configs/{config_id}/toggle", post(configs::toggle))
        .route(
            "/publish-configs/{config_id}/next-fire",
            get(configs::next_fire),
        )
        .route("/schedule/generate-slots", post(slots::generate))
        .route("/schedule/slots", get(slots::list))
        .route("/strategies", post(strategies::create).get(strategies::list))
        .route(
            "/strategies/{strategy_id}",
            get(strategies::fetch)
                .put(strategies::update)
                .delete(strategies::remove),
        )
        .route(
            "/strategies/{strategy_id}/assignments",
            post(strategies::assign).get(strategies::assignments),
        )
        .route("/monitors", post(monitors::create).get(monitors::list))
        .route(
            "/monitors/{monitor_id}",
            get(monitors::fetch)
                .put(monitors::update)
                .delete(monitors::remove),
        )
        .route("/monitors/{monitor_id}/start", post(monitors::start))
        .route("/monitors/{monitor_id}/stop", post(monitors::stop))
        .route("/auto-publish/tasks", get(tasks::list))
        .route("/auto-publish/tasks/{task_id}", get(tasks::fetch))
        .route("/auto-publish/tasks/{task_id}/retry", post(tasks::retry))
        .route("/auto-publish/tasks/{task_id}/cancel", post(tasks::cancel))
        .route("/publish/schedule", post(publish::schedule))
        .route("/publish/tasks", get(publish::list))
        .route("/publish/scheduler/queue", get(publish::queue))
        .route(
            "/publish/scheduler/{publish_id}",
            delete(publish::cancel),
        )
        .route(
            "/publish/scheduler/reschedule/{publish_id}",
            post(publish::reschedule),
        )
        .route("/publish/{publish_id}/retry", post(publish::retry))
        .route("/executor/start", post(executor::start))
        .route("/executor/stop", post(executor::stop))
        .route("/executor/status", get(executor::status))
        .route("/overview", get(overview::fetch))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
