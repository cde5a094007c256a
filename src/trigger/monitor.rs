//! Monitor pollers.
//!
//! One cooperative task per active monitor. Each poll fetches the external
//! source, upserts results keyed by `(monitor_id, content_id)`, and fans out
//! one auto-publish task per matching monitor-triggered config for every
//! result not yet processed. The unique key makes re-polls no-ops.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::observability::metrics::Metrics;
use crate::store::AutoPublishStore;
use crate::store::models::{AutoPublishTask, Monitor, MonitorResult};
use crate::trigger::schedule::TriggerSpec;
use crate::util::error::{CoreError, CoreResult};

/// One piece of content captured from an external source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceItem {
    pub content_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub payload: Value,
}

/// Seam to whatever watches the outside world (competitor channels,
/// trending feeds, keyword searches).
#[async_trait]
pub trait MonitorSource: Send + Sync {
    async fn fetch(&self, monitor: &Monitor) -> CoreResult<Vec<SourceItem>>;
}

pub struct MonitorRunner {
    store: Arc<dyn AutoPublishStore>,
    source: Arc<dyn MonitorSource>,
    metrics: Arc<Metrics>,
    pollers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl MonitorRunner {
    pub fn new(
        store: Arc<dyn AutoPublishStore>,
        source: Arc<dyn MonitorSource>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            source,
            metrics,
            pollers: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn pollers for every active monitor. Called once at startup.
    pub async fn start_all(self: &Arc<Self>) -> CoreResult<usize> {
        let monitors = self.store.list_monitors(true).await?;
        let count = monitors.len();
        for monitor in monitors {
            self.spawn_poller(monitor.monitor_id);
        }
        Ok(count)
    }

    /// Activate a monitor and start its poller.
    pub async fn start(self: &Arc<Self>, monitor_id: Uuid) -> CoreResult<()> {
        self.store.set_monitor_active(monitor_id, true).await?;
        self.spawn_poller(monitor_id);
        Ok(())
    }

    /// Deactivate a monitor and stop its poller. Already-enqueued tasks are
    /// untouched.
    pub async fn stop(&self, monitor_id: Uuid) -> CoreResult<()> {
        self.store.set_monitor_active(monitor_id, false).await?;
        if let Some(handle) = self
            .pollers
            .lock()
            .expect("poller mutex poisoned")
            .remove(&monitor_id)
        {
            handle.abort();
        }
        Ok(())
    }

    #[must_use]
    pub fn running(&self) -> Vec<Uuid> {
        self.pollers
            .lock()
            .expect("poller mutex poisoned")
            .keys()
            .copied()
            .collect()
    }

    fn spawn_poller(self: &Arc<Self>, monitor_id: Uuid) {
        let mut pollers = self.pollers.lock().expect("poller mutex poisoned");
        if let Some(existing) = pollers.get(&monitor_id) {
            if !existing.is_finished() {
                return;
            }
        }

        let runner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!(monitor_id = %monitor_id, "monitor poller started");
            loop {
                let interval = match runner.store.get_monitor(monitor_id).await {
                    Ok(monitor) if monitor.active => {
                        if let Err(err) = runner.poll_once(monitor_id).await {
                            error!(monitor_id = %monitor_id, error = %err, "monitor poll failed");
                        }
                        Duration::from_secs(monitor.check_interval_secs.max(1) as u64)
                    }
                    Ok(_) => {
                        info!(monitor_id = %monitor_id, "monitor deactivated, poller exiting");
                        break;
                    }
                    Err(CoreError::NotFound(_)) => {
                        info!(monitor_id = %monitor_id, "monitor deleted, poller exiting");
                        break;
                    }
                    Err(err) => {
                        warn!(monitor_id = %monitor_id, error = %err, "monitor lookup failed");
                        Duration::from_secs(30)
                    }
                };
                sleep(interval).await;
            }
        });
        pollers.insert(monitor_id, handle);
    }

    /// One poll of one monitor. Public so tests can drive it without the
    /// timing loop.
    pub async fn poll_once(&self, monitor_id: Uuid) -> CoreResult<usize> {
        let monitor = self.store.get_monitor(monitor_id).await?;
        let now = Utc::now();
        let items = self.source.fetch(&monitor).await?;
        for item in &items {
            let inserted = self
                .store
                .insert_monitor_result(MonitorResult {
                    monitor_id,
                    content_id: item.content_id.clone(),
                    title: item.title.clone(),
                    payload: item.payload.clone(),
                    processed: false,
                    captured_at: now,
                })
                .await?;
            if inserted {
                self.metrics.monitor_results_new.inc();
            }
        }
        self.store.record_monitor_check(monitor_id, now).await?;

        // Fan out every not-yet-processed result, including leftovers from a
        // previous crash. The store commits each result's task inserts and
        // its processed flag atomically, so a replay inserts nothing.
        let targets = self.monitor_configs(monitor_id).await?;
        let unprocessed = self.store.list_unprocessed_results(monitor_id).await?;
        let mut created = 0;
        for result in unprocessed {
            let tasks: Vec<AutoPublishTask> = targets
                .iter()
                .map(|config| {
                    let params = json!({
                        "source": {
                            "monitor_id": monitor_id,
                            "platform": monitor.platform,
                            "content_id": result.content_id,
                            "title": result.title,
                            "payload": result.payload,
                        }
                    });
                    AutoPublishTask::from_trigger(config, now, now, params)
                })
                .collect();
            created += self
                .store
                .fan_out_monitor_result(monitor_id, &result.content_id, tasks)
                .await?;
        }

        if created > 0 {
            debug!(monitor_id = %monitor_id, created, "monitor fan-out created tasks");
        }
        Ok(created)
    }

    async fn monitor_configs(
        &self,
        monitor_id: Uuid,
    ) -> CoreResult<Vec<crate::store::models::PublishConfig>> {
        let configs = self.store.list_configs(true).await?;
        Ok(configs
            .into_iter()
            .filter(|config| {
                matches!(
                    &config.trigger,
                    TriggerSpec::Monitor(trigger) if trigger.monitor_id == monitor_id
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::test_metrics;
    use crate::store::MemoryStore;
    use crate::store::models::{
        AccountGroup, GroupType, MonitorType, PublishConfig, TaskFilter,
    };
    use crate::trigger::schedule::MonitorTrigger;

    struct ScriptedSource {
        items: Mutex<Vec<Vec<SourceItem>>>,
    }

    impl ScriptedSource {
        fn new(batches: Vec<Vec<SourceItem>>) -> Arc<Self> {
            Arc::new(Self {
                items: Mutex::new(batches),
            })
        }
    }

    #[async_trait]
    impl MonitorSource for ScriptedSource {
        async fn fetch(&self, _monitor: &Monitor) -> CoreResult<Vec<SourceItem>> {
            let mut items = self.items.lock().expect("items mutex");
            if items.is_empty() {
                Ok(vec![])
            } else {
                Ok(items.remove(0))
            }
        }
    }

    fn item(content_id: &str) -> SourceItem {
        SourceItem {
            content_id: content_id.to_string(),
            title: format!("video {content_id}"),
            payload: json!({"views": 12345}),
        }
    }

    async fn seed(store: &Arc<MemoryStore>, monitor_id: Uuid, configs: usize) -> Vec<Uuid> {
        store
            .create_monitor(Monitor {
                monitor_id,
                platform: "youtube".to_string(),
                monitor_type: MonitorType::Competitor,
                target_identifier: "UC123".to_string(),
                check_interval_secs: 300,
                last_check: None,
                active: true,
                config: json!({}),
            })
            .await
            .expect("monitor");

        let mut config_ids = Vec::new();
        for i in 0..configs {
            let group_id = Uuid::new_v4();
            store
                .create_group(AccountGroup {
                    group_id,
                    name: format!("group-{i}-{group_id}"),
                    group_type: GroupType::Production,
                    description: None,
                    active: true,
                    created_at: Utc::now(),
                })
                .await
                .expect("group");
            let config_id = Uuid::new_v4();
            store
                .create_config(PublishConfig {
                    config_id,
                    name: format!("config-{i}-{config_id}"),
                    group_id,
                    pipeline_id: "reaction".to_string(),
                    trigger: TriggerSpec::Monitor(MonitorTrigger { monitor_id }),
                    strategy_id: None,
                    priority: 50,
                    active: true,
                    pipeline_params: json!({}),
                    publish_delay_secs: None,
                    last_fire: None,
                    created_at: Utc::now(),
                })
                .await
                .expect("config");
            config_ids.push(config_id);
        }
        config_ids
    }

    #[tokio::test]
    async fn new_content_fans_out_once_per_config() {
        let store = Arc::new(MemoryStore::new());
        let monitor_id = Uuid::new_v4();
        let config_ids = seed(&store, monitor_id, 2).await;

        let source = ScriptedSource::new(vec![
            vec![item("vid-1")],
            vec![item("vid-1")], // same content re-observed
        ]);
        let runner = MonitorRunner::new(
            Arc::clone(&store) as Arc<dyn AutoPublishStore>,
            source,
            test_metrics(),
        );

        let created = runner.poll_once(monitor_id).await.expect("polls");
        assert_eq!(created, 2, "one task per targeting config");

        let created = runner.poll_once(monitor_id).await.expect("polls again");
        assert_eq!(created, 0, "re-observed content does not fan out again");

        for config_id in config_ids {
            let tasks = store
                .list_tasks(TaskFilter {
                    config_id: Some(config_id),
                    ..TaskFilter::default()
                })
                .await
                .expect("lists");
            assert_eq!(tasks.len(), 1);
            assert_eq!(
                tasks[0].pipeline_params["source"]["content_id"],
                json!("vid-1")
            );
        }
    }

    #[tokio::test]
    async fn poll_records_last_check_and_processed_flags() {
        let store = Arc::new(MemoryStore::new());
        let monitor_id = Uuid::new_v4();
        seed(&store, monitor_id, 1).await;

        let source = ScriptedSource::new(vec![vec![item("vid-1"), item("vid-2")]]);
        let runner = MonitorRunner::new(
            Arc::clone(&store) as Arc<dyn AutoPublishStore>,
            source,
            test_metrics(),
        );

        runner.poll_once(monitor_id).await.expect("polls");

        let monitor = store.get_monitor(monitor_id).await.expect("monitor");
        assert!(monitor.last_check.is_some());
        let unprocessed = store
            .list_unprocessed_results(monitor_id)
            .await
            .expect("lists");
        assert!(unprocessed.is_empty(), "all results marked processed");
    }

    #[tokio::test]
    async fn inactive_configs_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let monitor_id = Uuid::new_v4();
        let config_ids = seed(&store, monitor_id, 1).await;
        store
            .set_config_active(config_ids[0], false)
            .await
            .expect("deactivates");

        let source = ScriptedSource::new(vec![vec![item("vid-1")]]);
        let runner = MonitorRunner::new(
            Arc::clone(&store) as Arc<dyn AutoPublishStore>,
            source,
            test_metrics(),
        );

        let created = runner.poll_once(monitor_id).await.expect("polls");
        assert_eq!(created, 0);
    }

    #[tokio::test]
    async fn stop_marks_monitor_inactive() {
        let store = Arc::new(MemoryStore::new());
        let monitor_id = Uuid::new_v4();
        seed(&store, monitor_id, 0).await;

        let source = ScriptedSource::new(vec![]);
        let runner = MonitorRunner::new(
            Arc::clone(&store) as Arc<dyn AutoPublishStore>,
            source,
            test_metrics(),
        );
        runner.stop(monitor_id).await.expect("stops");
        let monitor = store.get_monitor(monitor_id).await.expect("monitor");
        assert!(!monitor.active);
    }
}
