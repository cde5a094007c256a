//! Scheduled-trigger evaluation loop.
//!
//! Runs on a fixed cadence, computes each active config's next fire instant
//! from its persisted `last_fire`, and inserts auto-publish tasks for due
//! configs. Missed windows are never batch-replayed: after a fire,
//! `last_fire` fast-forwards to the latest occurrence at or before `now`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::observability::metrics::Metrics;
use crate::store::AutoPublishStore;
use crate::store::models::{AutoPublishTask, PublishConfig};
use crate::trigger::schedule::{ScheduleSpec, TriggerSpec};
use crate::util::error::CoreResult;

pub struct TriggerEvaluator {
    store: Arc<dyn AutoPublishStore>,
    metrics: Arc<Metrics>,
    cadence: Duration,
}

impl TriggerEvaluator {
    pub fn new(store: Arc<dyn AutoPublishStore>, metrics: Arc<Metrics>, cadence: Duration) -> Self {
        Self {
            store,
            metrics,
            cadence,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(cadence_secs = self.cadence.as_secs(), "trigger evaluator started");
            loop {
                match self.evaluate_once(Utc::now()).await {
                    Ok(fired) if fired > 0 => debug!(fired, "trigger evaluation fired tasks"),
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "trigger evaluation pass failed"),
                }
                sleep(self.cadence).await;
            }
        })
    }

    /// One evaluation pass over all active scheduled configs. Separated from
    /// the loop so tests can drive time explicitly.
    pub async fn evaluate_once(&self, now: DateTime<Utc>) -> CoreResult<usize> {
        let configs = self.store.list_configs(true).await?;
        let mut fired = 0;
        for config in configs {
            let TriggerSpec::Scheduled(spec) = config.trigger.clone() else {
                continue;
            };
            match self.evaluate_config(&config, &spec, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(
                        config_id = %config.config_id,
                        error = %err,
                        "scheduled trigger evaluation failed"
                    );
                }
            }
        }
        Ok(fired)
    }

    async fn evaluate_config(
        &self,
        config: &PublishConfig,
        spec: &ScheduleSpec,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let anchor = config.last_fire.unwrap_or(config.created_at);
        let Some(mut next) = spec.next_after(anchor)? else {
            // A spent `once` schedule deactivates its config.
            if spec.is_once() && config.last_fire.is_some() {
                self.store.set_config_active(config.config_id, false).await?;
            }
            return Ok(false);
        };
        if next > now {
            return Ok(false);
        }

        // Fast-forward over missed occurrences; only the latest one fires.
        while let Some(candidate) = spec.next_after(next)? {
            if candidate > now {
                break;
            }
            next = candidate;
        }

        let mut task = AutoPublishTask::from_trigger(config, next, now, config.pipeline_params.clone());

        // Bind the next eligible ring slot, when the config has a plan.
        if let Some(slot) = self.store.next_pending_slot(config.config_id, now).await? {
            self.store.bind_slot_to_task(slot.slot_id, task.task_id).await?;
            task.slot_id = Some(slot.slot_id);
            task.account_id = Some(slot.account_id);
        }

        self.store.insert_task(task.clone()).await?;
        self.store.record_config_fire(config.config_id, next).await?;
        if spec.is_once() {
            self.store.set_config_active(config.config_id, false).await?;
        }

        self.metrics.trigger_fires.inc();
        info!(
            config_id = %config.config_id,
            task_id = %task.task_id,
            scheduled_time = %next.to_rfc3339(),
            "scheduled trigger fired"
        );
        Ok(true)
    }
}
