//! Execution engine.
//!
//! Claims due auto-publish tasks under a bounded worker pool, invokes the
//! pipeline registry, fans successful results out into publish tasks and
//! drives the retry policy. Back-pressure is the store: while the pool is
//! full, due tasks simply stay `pending`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::observability::metrics::Metrics;
use crate::publisher::PublisherHandle;
use crate::registry::PipelineRegistry;
use crate::store::AutoPublishStore;
use crate::store::models::{
    AutoPublishTask, PublishConfig, PublishStatus, PublishTask, SlotStatus, TaskPipelineStatus,
    TaskPublishStatus,
};
use crate::strategy::VariantResolver;
use crate::util::error::{CoreError, CoreResult};
use crate::util::retry::task_backoff;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub pipeline_concurrency: usize,
    pub pipeline_deadline: Duration,
    pub retry_unit: Duration,
    pub max_retries: i32,
    pub stale_threshold: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            pipeline_concurrency: 3,
            pipeline_deadline: Duration::from_secs(30 * 60),
            retry_unit: Duration::from_secs(60),
            max_retries: 3,
            stale_threshold: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub in_flight: usize,
    pub pipeline_concurrency: usize,
}

pub struct ExecutionEngine {
    store: Arc<dyn AutoPublishStore>,
    registry: Arc<PipelineRegistry>,
    resolver: Arc<VariantResolver>,
    publisher: PublisherHandle,
    metrics: Arc<Metrics>,
    settings: EngineSettings,
    pool: Arc<Semaphore>,
    running: AtomicBool,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn AutoPublishStore>,
        registry: Arc<PipelineRegistry>,
        resolver: Arc<VariantResolver>,
        publisher: PublisherHandle,
        metrics: Arc<Metrics>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        let pool = Arc::new(Semaphore::new(settings.pipeline_concurrency));
        Arc::new(Self {
            store,
            registry,
            resolver,
            publisher,
            metrics,
            settings,
            pool,
            running: AtomicBool::new(false),
            worker: std::sync::Mutex::new(None),
        })
    }

    /// Start the claim loop. Returns `false` when already running. Stale
    /// `running` rows from a previous process are recovered first.
    pub async fn start(self: &Arc<Self>) -> CoreResult<bool> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let recovered = match self.recover_stale(Utc::now()).await {
            Ok(recovered) => recovered,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        if recovered > 0 {
            warn!(recovered, "recovered stale running tasks at startup");
        }

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!(
                poll_secs = engine.settings.poll_interval.as_secs(),
                concurrency = engine.settings.pipeline_concurrency,
                "execution engine started"
            );
            while engine.running.load(Ordering::SeqCst) {
                match engine.run_claim_cycle(Utc::now()).await {
                    Ok(claimed) if claimed > 0 => debug!(claimed, "claimed due tasks"),
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "claim cycle failed"),
                }
                sleep(engine.settings.poll_interval).await;
            }
            info!("execution engine stopped");
        });
        *self.worker.lock().expect("worker mutex poisoned") = Some(handle);
        Ok(true)
    }

    /// Stop claiming new work. In-flight pipeline invocations finish on
    /// their own. Returns `false` when the engine was not running.
    pub fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(handle) = self.worker.lock().expect("worker mutex poisoned").take() {
            handle.abort();
        }
        true
    }

    #[must_use]
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.running.load(Ordering::SeqCst),
            in_flight: self
                .settings
                .pipeline_concurrency
                .saturating_sub(self.pool.available_permits()),
            pipeline_concurrency: self.settings.pipeline_concurrency,
        }
    }

    /// Mark over-stale `running` rows failed and feed them back through the
    /// retry policy.
    pub async fn recover_stale(&self, now: DateTime<Utc>) -> CoreResult<usize> {
        let cutoff = now
            - chrono::Duration::from_std(self.settings.stale_threshold)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let recovered = self.store.recover_stale_running(cutoff).await?;
        let count = recovered.len();
        for task in recovered {
            // Stale recovery counts as a retryable failure.
            if task.retry_count < self.settings.max_retries {
                let delay = task_backoff(task.retry_count, self.settings.retry_unit);
                self.store
                    .reschedule_task_retry(
                        task.task_id,
                        now + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                        "transient: stale running task recovered after restart".to_string(),
                    )
                    .await?;
                self.metrics.retries_total.inc();
            } else if let Some(slot_id) = task.slot_id {
                self.store.resolve_slot(slot_id, SlotStatus::Failed).await?;
            }
        }
        Ok(count)
    }

    /// Claim as many due tasks as the pool has free permits and process them
    /// concurrently. Public so tests can drive time explicitly.
    pub async fn run_claim_cycle(self: &Arc<Self>, now: DateTime<Utc>) -> CoreResult<usize> {
        let free = self.pool.available_permits();
        if free == 0 {
            return Ok(0);
        }

        let tasks = self.store.claim_due_tasks(now, free).await?;
        let claimed = tasks.len();
        for task in tasks {
            let permit = Arc::clone(&self.pool)
                .acquire_owned()
                .await
                .map_err(|_| CoreError::transient("pipeline pool closed"))?;
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.metrics.running_pipelines.inc();
                engine.process_task(task).await;
                engine.metrics.running_pipelines.dec();
                drop(permit);
            });
        }
        Ok(claimed)
    }

    async fn process_task(&self, task: AutoPublishTask) {
        self.metrics.tasks_claimed.inc();
        let task_id = task.task_id;

        let config = match self.store.get_config(task.config_id).await {
            Ok(config) if config.active => config,
            Ok(_) => {
                self.finish_failed(&task, "permanent: config is inactive").await;
                return;
            }
            Err(CoreError::NotFound(_)) => {
                self.finish_failed(&task, "permanent: config no longer exists").await;
                return;
            }
            Err(err) => {
                self.apply_retry_policy(&task, &err).await;
                return;
            }
        };

        let params = merge_params(&config.pipeline_params, &task.pipeline_params);
        let timer = self.metrics.pipeline_duration.start_timer();
        let invoked = tokio::time::timeout(
            self.settings.pipeline_deadline,
            self.registry.invoke(&task.pipeline_id, &params),
        )
        .await;
        timer.observe_duration();

        match invoked {
            Ok(Ok(outcome)) => {
                // Best-effort cancellation: an invocation that raced a cancel
                // keeps the cancelled state and fans nothing out.
                if let Ok(current) = self.store.get_task(task_id).await {
                    if current.pipeline_status == TaskPipelineStatus::Cancelled {
                        info!(task_id = %task_id, "task was cancelled mid-run, dropping result");
                        return;
                    }
                }
                if let Err(err) = self.fan_out(&config, &task, &outcome).await {
                    error!(task_id = %task_id, error = %err, "publish fan-out failed");
                    self.apply_retry_policy(&task, &err).await;
                    return;
                }
                self.metrics.pipelines_succeeded.inc();
            }
            Ok(Err(err)) => {
                self.apply_retry_policy(&task, &err).await;
            }
            Err(_) => {
                // Deadline expiry is terminal by contract.
                self.finish_failed(&task, "permanent: pipeline deadline exceeded")
                    .await;
            }
        }
    }

    async fn fan_out(
        &self,
        config: &PublishConfig,
        task: &AutoPublishTask,
        outcome: &crate::registry::PipelineOutcome,
    ) -> CoreResult<()> {
        let outcome_value = serde_json::to_value(outcome)
            .map_err(|e| CoreError::permanent(format!("outcome serialization: {e}")))?;
        self.store
            .record_pipeline_result(
                task.task_id,
                TaskPipelineStatus::Completed,
                Some(outcome_value),
                None,
            )
            .await?;

        let resolved = self.resolver.resolve(config, task.task_id, outcome).await?;
        let now = Utc::now();
        let delay = config.publish_delay_secs.unwrap_or(0).max(0);
        let scheduled_time = now + chrono::Duration::seconds(delay);

        for publish in resolved {
            let row = PublishTask {
                publish_id: Uuid::new_v4(),
                task_id: task.task_id,
                account_id: publish.account_id,
                title: publish.metadata.title,
                description: publish.metadata.description,
                tags: publish.metadata.tags,
                thumbnail_ref: publish.metadata.thumbnail_ref,
                privacy: publish.metadata.privacy,
                video_ref: publish.metadata.video_ref,
                status: PublishStatus::Scheduled,
                scheduled_time,
                is_scheduled: delay > 0,
                retry_count: 0,
                error: None,
                platform_video_id: None,
                platform_url: None,
                variant_name: publish.variant_name,
                origin_publish_id: None,
                created_at: now,
                completed_at: None,
            };
            self.publisher.schedule(row).await?;
        }

        self.store
            .set_task_publish_status(task.task_id, TaskPublishStatus::Scheduled, None)
            .await?;
        if let Some(slot_id) = task.slot_id {
            self.store.resolve_slot(slot_id, SlotStatus::Completed).await?;
        }
        Ok(())
    }

    async fn apply_retry_policy(&self, task: &AutoPublishTask, err: &CoreError) {
        if err.retry_able() && task.retry_count < self.settings.max_retries {
            let delay = task_backoff(task.retry_count, self.settings.retry_unit);
            let at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
            warn!(
                task_id = %task.task_id,
                retry_count = task.retry_count + 1,
                next_attempt = %at.to_rfc3339(),
                error = %err,
                "pipeline failed, rescheduling"
            );
            if let Err(store_err) = self
                .store
                .reschedule_task_retry(task.task_id, at, err.to_string())
                .await
            {
                error!(task_id = %task.task_id, error = %store_err, "failed to reschedule task");
            }
            self.metrics.retries_total.inc();
        } else {
            self.finish_failed(task, &err.to_string()).await;
        }
    }

    async fn finish_failed(&self, task: &AutoPublishTask, message: &str) {
        error!(task_id = %task.task_id, error = message, "task failed terminally");
        self.metrics.pipelines_failed.inc();
        if let Err(err) = self
            .store
            .record_pipeline_result(
                task.task_id,
                TaskPipelineStatus::Failed,
                None,
                Some(message.to_string()),
            )
            .await
        {
            error!(task_id = %task.task_id, error = %err, "failed to record task failure");
        }
        if let Some(slot_id) = task.slot_id {
            let _ = self.store.resolve_slot(slot_id, SlotStatus::Failed).await;
        }
    }

    /// Cancel a task. Deferred publish tasks still `scheduled` are cancelled
    /// with it; a `running` pipeline invocation is not aborted, its result is
    /// dropped when it returns.
    pub async fn cancel_task(&self, task_id: Uuid) -> CoreResult<AutoPublishTask> {
        let task = self.store.cancel_task(task_id).await?;
        let cancelled = self
            .store
            .cancel_scheduled_publishes_for_task(task_id)
            .await?;
        if !cancelled.is_empty() {
            info!(task_id = %task_id, publishes = cancelled.len(), "cancelled deferred publishes");
        }
        Ok(task)
    }

    /// Explicit retry: a *new* task row linked to the failed original. The
    /// original stays terminal for audit.
    pub async fn retry_task(&self, task_id: Uuid) -> CoreResult<AutoPublishTask> {
        let original = self.store.get_task(task_id).await?;
        let failed = original.pipeline_status == TaskPipelineStatus::Failed
            || original.publish_status == TaskPublishStatus::Failed;
        if !failed {
            return Err(CoreError::conflict(format!(
                "task {task_id} is not in a failed state"
            )));
        }

        let now = Utc::now();
        let retry = AutoPublishTask {
            task_id: Uuid::new_v4(),
            pipeline_status: TaskPipelineStatus::Pending,
            publish_status: TaskPublishStatus::Pending,
            pipeline_result: None,
            publish_result: None,
            retry_count: original.retry_count,
            error: None,
            origin_task_id: Some(original.task_id),
            created_at: now,
            scheduled_time: now,
            started_at: None,
            completed_at: None,
            slot_id: None,
            ..original
        };
        self.store.insert_task(retry.clone()).await?;
        Ok(retry)
    }
}

/// Shallow object merge; task-level params win over config defaults.
fn merge_params(config_params: &Value, task_params: &Value) -> Value {
    match (config_params, task_params) {
        (Value::Object(base), Value::Object(overrides)) => {
            let mut merged = base.clone();
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, Value::Object(_) | Value::Null) if config_params.is_object() => config_params.clone(),
        (_, Value::Null) => config_params.clone(),
        _ => task_params.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::{Map, json};

    use crate::clients::transport::MockUploadTransport;
    use crate::observability::metrics::test_metrics;
    use crate::publisher::{PublishScheduler, PublisherSettings};
    use crate::registry::{PipelineOutcome, PipelineRunner};
    use crate::store::MemoryStore;
    use crate::store::models::{
        Account, AccountGroup, GroupMember, GroupType, PipelineDescriptor, PipelineStatus,
        PublishFilter, RingSlot,
    };
    use crate::trigger::schedule::{ScheduleSpec, TriggerSpec};

    struct ScriptedRunner {
        outcomes: std::sync::Mutex<Vec<CoreResult<PipelineOutcome>>>,
        delay: Duration,
    }

    impl ScriptedRunner {
        fn ok() -> Arc<Self> {
            Self::with(vec![Ok(success_outcome())])
        }

        fn with(outcomes: Vec<CoreResult<PipelineOutcome>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: std::sync::Mutex::new(outcomes),
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                outcomes: std::sync::Mutex::new(vec![]),
                delay,
            })
        }
    }

    #[async_trait]
    impl PipelineRunner for ScriptedRunner {
        async fn run(
            &self,
            _descriptor: &PipelineDescriptor,
            _params: &Value,
        ) -> CoreResult<PipelineOutcome> {
            if self.delay > Duration::ZERO {
                sleep(self.delay).await;
            }
            let mut outcomes = self.outcomes.lock().expect("outcomes mutex");
            if outcomes.is_empty() {
                Ok(success_outcome())
            } else {
                outcomes.remove(0)
            }
        }
    }

    fn success_outcome() -> PipelineOutcome {
        let mut metadata = Map::new();
        metadata.insert("title".to_string(), json!("A story"));
        PipelineOutcome {
            success: true,
            artifacts: json!({"video": "/data/v.mp4"}),
            metadata,
            error: None,
            retry_able: None,
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        engine: Arc<ExecutionEngine>,
        transport: Arc<MockUploadTransport>,
        config_id: Uuid,
    }

    async fn harness(runner: Arc<ScriptedRunner>, settings: EngineSettings) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let metrics = test_metrics();

        let group_id = Uuid::new_v4();
        store
            .create_group(AccountGroup {
                group_id,
                name: "prod".to_string(),
                group_type: GroupType::Production,
                description: None,
                active: true,
                created_at: Utc::now(),
            })
            .await
            .expect("group");
        let account_id = Uuid::new_v4();
        store
            .upsert_account(Account {
                account_id,
                display_name: "channel".to_string(),
                profile_ref: "profile-1".to_string(),
                active: true,
                created_at: Utc::now(),
            })
            .await
            .expect("account");
        store
            .add_group_members(
                group_id,
                vec![GroupMember {
                    group_id,
                    account_id,
                    member_rank: 0,
                    role: None,
                }],
            )
            .await
            .expect("member");

        let registry = Arc::new(PipelineRegistry::new(
            Arc::clone(&store) as Arc<dyn AutoPublishStore>,
            runner,
        ));
        registry
            .register(PipelineDescriptor {
                pipeline_id: "story".to_string(),
                display_name: "Story".to_string(),
                type_tag: "story".to_string(),
                implementation_ref: "http://pipelines.local/story".to_string(),
                parameter_schema: json!({"type": "object"}),
                supported_platforms: vec!["youtube".to_string()],
                version: "1".to_string(),
                status: PipelineStatus::Active,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .expect("pipeline");

        let config_id = Uuid::new_v4();
        store
            .create_config(crate::store::models::PublishConfig {
                config_id,
                name: "prod".to_string(),
                group_id,
                pipeline_id: "story".to_string(),
                trigger: TriggerSpec::Scheduled(ScheduleSpec::Daily {
                    schedule_time: "10:00".to_string(),
                }),
                strategy_id: None,
                priority: 50,
                active: true,
                pipeline_params: json!({"style": "calm"}),
                publish_delay_secs: None,
                last_fire: None,
                created_at: Utc::now(),
            })
            .await
            .expect("config");

        let transport = Arc::new(MockUploadTransport::new());
        let (scheduler, publisher) = PublishScheduler::new(
            Arc::clone(&store) as Arc<dyn AutoPublishStore>,
            Arc::clone(&transport) as Arc<dyn crate::clients::transport::UploadTransport>,
            Arc::clone(&metrics),
            PublisherSettings {
                poll_granularity: Duration::from_millis(20),
                ..PublisherSettings::default()
            },
        );
        let _publisher_daemon = scheduler.spawn();

        let resolver = Arc::new(VariantResolver::new(
            Arc::clone(&store) as Arc<dyn AutoPublishStore>
        ));
        let engine = ExecutionEngine::new(
            Arc::clone(&store) as Arc<dyn AutoPublishStore>,
            registry,
            resolver,
            publisher,
            metrics,
            settings,
        );

        Harness {
            store,
            engine,
            transport,
            config_id,
        }
    }

    fn fast_settings() -> EngineSettings {
        EngineSettings {
            poll_interval: Duration::from_millis(20),
            pipeline_concurrency: 3,
            pipeline_deadline: Duration::from_secs(5),
            retry_unit: Duration::from_millis(50),
            max_retries: 3,
            stale_threshold: Duration::from_secs(3600),
        }
    }

    async fn pending_task(harness: &Harness) -> Uuid {
        let config = harness
            .store
            .get_config(harness.config_id)
            .await
            .expect("config");
        let task = AutoPublishTask::from_trigger(&config, Utc::now(), Utc::now(), json!({}));
        let task_id = task.task_id;
        harness.store.insert_task(task).await.expect("task");
        task_id
    }

    async fn wait_pipeline_status(
        store: &MemoryStore,
        task_id: Uuid,
        status: TaskPipelineStatus,
    ) {
        for _ in 0..300 {
            if let Ok(task) = store.get_task(task_id).await {
                if task.pipeline_status == status {
                    return;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached {status:?}");
    }

    #[tokio::test]
    async fn successful_pipeline_fans_out_and_completes_the_slot() {
        let harness = harness(ScriptedRunner::ok(), fast_settings()).await;
        let config = harness
            .store
            .get_config(harness.config_id)
            .await
            .expect("config");
        let account_id = harness
            .store
            .list_active_group_accounts(config.group_id)
            .await
            .expect("accounts")[0]
            .account_id;

        let slot_id = Uuid::new_v4();
        harness
            .store
            .upsert_slot(RingSlot {
                slot_id,
                config_id: harness.config_id,
                account_id,
                slot_date: NaiveDate::from_ymd_opt(2026, 3, 1).expect("valid"),
                slot_hour: 10,
                slot_minute: 0,
                slot_index: 0,
                status: crate::store::models::SlotStatus::Pending,
                task_id: None,
            })
            .await
            .expect("slot");

        let config = harness.store.get_config(harness.config_id).await.expect("config");
        let mut task = AutoPublishTask::from_trigger(&config, Utc::now(), Utc::now(), json!({}));
        task.slot_id = Some(slot_id);
        task.account_id = Some(account_id);
        let task_id = task.task_id;
        harness
            .store
            .bind_slot_to_task(slot_id, task_id)
            .await
            .expect("binds");
        harness.store.insert_task(task).await.expect("task");

        harness
            .engine
            .run_claim_cycle(Utc::now())
            .await
            .expect("claims");
        wait_pipeline_status(&harness.store, task_id, TaskPipelineStatus::Completed).await;

        // The publish row lands via the scheduler's command channel.
        let mut publishes = Vec::new();
        for _ in 0..300 {
            publishes = harness
                .store
                .list_publishes(PublishFilter {
                    task_id: Some(task_id),
                    ..PublishFilter::default()
                })
                .await
                .expect("lists");
            if !publishes.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(publishes.len(), 1);
        assert_eq!(publishes[0].video_ref, "/data/v.mp4");

        let slots = harness
            .store
            .list_slots(
                harness.config_id,
                NaiveDate::from_ymd_opt(2026, 3, 1).expect("valid"),
            )
            .await
            .expect("slots");
        assert_eq!(slots[0].status, crate::store::models::SlotStatus::Completed);

        // The downstream publisher delivers it through the mock transport.
        for _ in 0..300 {
            if !harness.transport.calls().is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(harness.transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn transient_pipeline_failure_is_rescheduled_with_backoff() {
        let runner = ScriptedRunner::with(vec![Err(CoreError::transient("renderer busy"))]);
        let harness = harness(runner, fast_settings()).await;
        let task_id = pending_task(&harness).await;
        let before = Utc::now();

        harness
            .engine
            .run_claim_cycle(Utc::now())
            .await
            .expect("claims");
        for _ in 0..300 {
            if let Ok(task) = harness.store.get_task(task_id).await {
                if task.retry_count > 0 {
                    break;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }

        let task = harness.store.get_task(task_id).await.expect("task");
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.pipeline_status, TaskPipelineStatus::Pending);
        assert!(task.scheduled_time >= before, "backoff pushes the task out");
        assert!(task.error.as_deref().is_some_and(|e| e.contains("renderer busy")));
    }

    #[tokio::test]
    async fn permanent_pipeline_failure_is_terminal() {
        let runner = ScriptedRunner::with(vec![Err(CoreError::permanent("content rejected"))]);
        let harness = harness(runner, fast_settings()).await;
        let task_id = pending_task(&harness).await;

        harness
            .engine
            .run_claim_cycle(Utc::now())
            .await
            .expect("claims");
        wait_pipeline_status(&harness.store, task_id, TaskPipelineStatus::Failed).await;

        let task = harness.store.get_task(task_id).await.expect("task");
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn retries_exhaust_into_terminal_failure() {
        let runner = ScriptedRunner::with(vec![
            Err(CoreError::transient("busy")),
            Err(CoreError::transient("busy")),
            Err(CoreError::transient("busy")),
            Err(CoreError::transient("busy")),
        ]);
        let mut settings = fast_settings();
        settings.max_retries = 2;
        let harness = harness(runner, settings).await;
        let task_id = pending_task(&harness).await;

        // Drive claim cycles until the retry budget is exhausted.
        for _ in 0..60 {
            let far_future = Utc::now() + chrono::Duration::hours(1);
            harness
                .engine
                .run_claim_cycle(far_future)
                .await
                .expect("claims");
            sleep(Duration::from_millis(20)).await;
            if let Ok(task) = harness.store.get_task(task_id).await {
                if task.pipeline_status == TaskPipelineStatus::Failed {
                    break;
                }
            }
        }

        let task = harness.store.get_task(task_id).await.expect("task");
        assert_eq!(task.pipeline_status, TaskPipelineStatus::Failed);
        assert_eq!(task.retry_count, 2, "retry_count stops at max_retries");
    }

    #[tokio::test]
    async fn pipeline_deadline_is_permanent() {
        let runner = ScriptedRunner::slow(Duration::from_millis(300));
        let mut settings = fast_settings();
        settings.pipeline_deadline = Duration::from_millis(50);
        let harness = harness(runner, settings).await;
        let task_id = pending_task(&harness).await;

        harness
            .engine
            .run_claim_cycle(Utc::now())
            .await
            .expect("claims");
        wait_pipeline_status(&harness.store, task_id, TaskPipelineStatus::Failed).await;

        let task = harness.store.get_task(task_id).await.expect("task");
        assert!(
            task.error.as_deref().is_some_and(|e| e.contains("deadline")),
            "deadline expiry is recorded"
        );
        assert_eq!(task.retry_count, 0, "deadline expiry is not retried");
    }

    #[tokio::test]
    async fn inactive_config_fails_the_task() {
        let harness = harness(ScriptedRunner::ok(), fast_settings()).await;
        let task_id = pending_task(&harness).await;
        harness
            .store
            .set_config_active(harness.config_id, false)
            .await
            .expect("deactivates");

        harness
            .engine
            .run_claim_cycle(Utc::now())
            .await
            .expect("claims");
        wait_pipeline_status(&harness.store, task_id, TaskPipelineStatus::Failed).await;
    }

    #[tokio::test]
    async fn stale_running_tasks_are_recovered_into_retry() {
        let harness = harness(ScriptedRunner::ok(), fast_settings()).await;
        let task_id = pending_task(&harness).await;

        // Simulate a claim from a previous process, two hours ago.
        let old = Utc::now() - chrono::Duration::hours(2);
        harness
            .store
            .claim_due_tasks(old, 1)
            .await
            .expect("claims stale");

        let recovered = harness
            .engine
            .recover_stale(Utc::now())
            .await
            .expect("recovers");
        assert_eq!(recovered, 1);

        let task = harness.store.get_task(task_id).await.expect("task");
        assert_eq!(task.pipeline_status, TaskPipelineStatus::Pending);
        assert_eq!(task.retry_count, 1);
    }

    #[tokio::test]
    async fn cancel_task_cancels_deferred_publishes() {
        let harness = harness(ScriptedRunner::ok(), fast_settings()).await;
        let task_id = pending_task(&harness).await;

        // A deferred publish hanging off the task.
        let account_id = Uuid::new_v4();
        harness
            .store
            .enqueue_publish(PublishTask {
                publish_id: Uuid::new_v4(),
                task_id,
                account_id,
                title: "t".to_string(),
                description: String::new(),
                tags: vec![],
                thumbnail_ref: None,
                privacy: "public".to_string(),
                video_ref: "/v.mp4".to_string(),
                status: PublishStatus::Scheduled,
                scheduled_time: Utc::now() + chrono::Duration::hours(2),
                is_scheduled: true,
                retry_count: 0,
                error: None,
                platform_video_id: None,
                platform_url: None,
                variant_name: None,
                origin_publish_id: None,
                created_at: Utc::now(),
                completed_at: None,
            })
            .await
            .expect("publish");

        let cancelled = harness.engine.cancel_task(task_id).await.expect("cancels");
        assert_eq!(cancelled.pipeline_status, TaskPipelineStatus::Cancelled);

        let publishes = harness
            .store
            .list_publishes(PublishFilter {
                task_id: Some(task_id),
                ..PublishFilter::default()
            })
            .await
            .expect("lists");
        assert_eq!(publishes[0].status, PublishStatus::Cancelled);

        // A second cancel is a conflict.
        let error = harness
            .engine
            .cancel_task(task_id)
            .await
            .expect_err("terminal tasks cannot be cancelled");
        assert_eq!(error.code(), "conflict");
    }

    #[tokio::test]
    async fn explicit_retry_mints_a_new_linked_task() {
        let runner = ScriptedRunner::with(vec![Err(CoreError::permanent("content rejected"))]);
        let harness = harness(runner, fast_settings()).await;
        let task_id = pending_task(&harness).await;

        harness
            .engine
            .run_claim_cycle(Utc::now())
            .await
            .expect("claims");
        wait_pipeline_status(&harness.store, task_id, TaskPipelineStatus::Failed).await;

        let retry = harness.engine.retry_task(task_id).await.expect("retries");
        assert_ne!(retry.task_id, task_id);
        assert_eq!(retry.origin_task_id, Some(task_id));
        assert_eq!(retry.pipeline_status, TaskPipelineStatus::Pending);

        // Retrying a non-failed task is a conflict.
        let error = harness
            .engine
            .retry_task(retry.task_id)
            .await
            .expect_err("pending tasks cannot be retried");
        assert_eq!(error.code(), "conflict");
    }

    #[test]
    fn merge_prefers_task_params() {
        let merged = merge_params(
            &json!({"style": "calm", "length": 30}),
            &json!({"style": "loud"}),
        );
        assert_eq!(merged, json!({"style": "loud", "length": 30}));
        assert_eq!(
            merge_params(&json!({"style": "calm"}), &Value::Null),
            json!({"style": "calm"})
        );
    }
}
