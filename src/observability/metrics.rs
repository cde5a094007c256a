/// Prometheusメトリクス定義。
use prometheus::{
    Counter, Gauge, Histogram, Registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_with_registry,
};
use std::sync::Arc;

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    // カウンター
    pub trigger_fires: Counter,
    pub monitor_results_new: Counter,
    pub tasks_claimed: Counter,
    pub pipelines_succeeded: Counter,
    pub pipelines_failed: Counter,
    pub publishes_dispatched: Counter,
    pub publishes_succeeded: Counter,
    pub publishes_failed: Counter,
    pub retries_total: Counter,

    // ヒストグラム
    pub pipeline_duration: Histogram,
    pub upload_duration: Histogram,

    // ゲージ
    pub publish_heap_depth: Gauge,
    pub running_pipelines: Gauge,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成する。
    pub fn new(registry: &Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            trigger_fires: register_counter_with_registry!(
                "autopub_trigger_fires_total",
                "Scheduled trigger fires",
                registry
            )?,
            monitor_results_new: register_counter_with_registry!(
                "autopub_monitor_results_new_total",
                "New monitor results captured",
                registry
            )?,
            tasks_claimed: register_counter_with_registry!(
                "autopub_tasks_claimed_total",
                "Auto-publish tasks claimed by the execution engine",
                registry
            )?,
            pipelines_succeeded: register_counter_with_registry!(
                "autopub_pipelines_succeeded_total",
                "Pipeline invocations that completed successfully",
                registry
            )?,
            pipelines_failed: register_counter_with_registry!(
                "autopub_pipelines_failed_total",
                "Pipeline invocations that failed",
                registry
            )?,
            publishes_dispatched: register_counter_with_registry!(
                "autopub_publishes_dispatched_total",
                "Publish tasks handed to the upload transport",
                registry
            )?,
            publishes_succeeded: register_counter_with_registry!(
                "autopub_publishes_succeeded_total",
                "Uploads confirmed by the transport",
                registry
            )?,
            publishes_failed: register_counter_with_registry!(
                "autopub_publishes_failed_total",
                "Uploads rejected or failed",
                registry
            )?,
            retries_total: register_counter_with_registry!(
                "autopub_retries_total",
                "Task and publish retries scheduled",
                registry
            )?,
            pipeline_duration: register_histogram_with_registry!(
                "autopub_pipeline_duration_seconds",
                "Duration of pipeline invocations",
                registry
            )?,
            upload_duration: register_histogram_with_registry!(
                "autopub_upload_duration_seconds",
                "Duration of upload dispatches",
                registry
            )?,
            publish_heap_depth: register_gauge_with_registry!(
                "autopub_publish_heap_depth",
                "Entries currently in the publish scheduler heap",
                registry
            )?,
            running_pipelines: register_gauge_with_registry!(
                "autopub_running_pipelines",
                "Pipeline invocations currently in flight",
                registry
            )?,
        })
    }
}

/// テスト用の独立したレジストリに紐づくメトリクス。
#[cfg(test)]
pub fn test_metrics() -> Arc<Metrics> {
    let registry = Arc::new(Registry::new());
    Arc::new(Metrics::new(&registry).expect("metrics register on a fresh registry"))
}
