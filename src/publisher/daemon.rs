//! Publish scheduler daemon.
//!
//! Owns the in-process heap; every other component requests scheduling over
//! a bounded command channel. The store is the single source of truth: pops
//! go through the `scheduled -> uploading` CAS, and on startup the heap is
//! rebuilt from all still-scheduled rows. No publish task is dispatched
//! before its `scheduled_time`; dispatch may lag by the poll granularity.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clients::transport::{UploadOutcome, UploadRequest, UploadStatus, UploadTransport, UploadVideo};
use crate::observability::metrics::Metrics;
use crate::publisher::heap::PublishHeap;
use crate::store::AutoPublishStore;
use crate::store::models::{PublishStatus, PublishTask, TaskPublishStatus};
use crate::util::error::{CoreError, CoreResult};

#[derive(Debug)]
pub enum PublishCommand {
    /// Persist (if new) and index a publish task.
    Schedule(Box<PublishTask>),
    Cancel(Uuid),
    Reschedule(Uuid, chrono::DateTime<Utc>),
}

/// Cheap cloneable handle other components use to talk to the scheduler.
#[derive(Debug, Clone)]
pub struct PublisherHandle {
    tx: mpsc::Sender<PublishCommand>,
}

impl PublisherHandle {
    pub async fn schedule(&self, task: PublishTask) -> CoreResult<()> {
        self.send(PublishCommand::Schedule(Box::new(task))).await
    }

    pub async fn cancel(&self, publish_id: Uuid) -> CoreResult<()> {
        self.send(PublishCommand::Cancel(publish_id)).await
    }

    pub async fn reschedule(
        &self,
        publish_id: Uuid,
        new_time: chrono::DateTime<Utc>,
    ) -> CoreResult<()> {
        self.send(PublishCommand::Reschedule(publish_id, new_time))
            .await
    }

    async fn send(&self, command: PublishCommand) -> CoreResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| CoreError::transient("publish scheduler is not running"))
    }
}

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub poll_granularity: Duration,
    pub upload_concurrency: usize,
    pub upload_deadline: Duration,
    pub retry_unit: Duration,
    pub max_retries: i32,
    pub batch_size: usize,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            poll_granularity: Duration::from_secs(5),
            upload_concurrency: 5,
            upload_deadline: Duration::from_secs(600),
            retry_unit: Duration::from_secs(60),
            max_retries: 3,
            batch_size: 32,
        }
    }
}

pub struct PublishScheduler {
    store: Arc<dyn AutoPublishStore>,
    transport: Arc<dyn UploadTransport>,
    metrics: Arc<Metrics>,
    settings: PublisherSettings,
    tx: mpsc::Sender<PublishCommand>,
    rx: mpsc::Receiver<PublishCommand>,
    upload_pool: Arc<Semaphore>,
}

impl PublishScheduler {
    pub fn new(
        store: Arc<dyn AutoPublishStore>,
        transport: Arc<dyn UploadTransport>,
        metrics: Arc<Metrics>,
        settings: PublisherSettings,
    ) -> (Self, PublisherHandle) {
        let (tx, rx) = mpsc::channel(256);
        let handle = PublisherHandle { tx: tx.clone() };
        let upload_pool = Arc::new(Semaphore::new(settings.upload_concurrency));
        (
            Self {
                store,
                transport,
                metrics,
                settings,
                tx,
                rx,
                upload_pool,
            },
            handle,
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(mut self) {
        let mut heap = PublishHeap::new();

        // Crash recovery: the heap is an index, the store is the truth.
        match self.store.load_scheduled_publishes().await {
            Ok(rows) => {
                let count = rows.len();
                for row in rows {
                    heap.push(row.publish_id, row.scheduled_time);
                }
                info!(rebuilt = count, "publish heap rebuilt from store");
            }
            Err(err) => error!(error = %err, "failed to rebuild publish heap"),
        }

        loop {
            let wait = self.wait_duration(&mut heap);
            let received = tokio::select! {
                command = self.rx.recv() => Some(command),
                () = sleep(wait) => None,
            };
            match received {
                Some(Some(command)) => self.apply(&mut heap, command).await,
                // All handles dropped; nothing can schedule anymore.
                Some(None) => break,
                None => self.dispatch_due(&mut heap).await,
            }
            self.metrics.publish_heap_depth.set(heap.len() as f64);
        }
    }

    fn wait_duration(&self, heap: &mut PublishHeap) -> Duration {
        match heap.next_due() {
            Some(next) => {
                let until = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                until.min(self.settings.poll_granularity)
            }
            None => self.settings.poll_granularity,
        }
    }

    async fn apply(&self, heap: &mut PublishHeap, command: PublishCommand) {
        match command {
            PublishCommand::Schedule(task) => {
                match self.store.enqueue_publish((*task).clone()).await {
                    Ok(()) => {}
                    // Already persisted by a retry re-send; only re-index.
                    Err(CoreError::Conflict(_)) => {}
                    Err(err) => {
                        error!(
                            publish_id = %task.publish_id,
                            error = %err,
                            "failed to persist publish task"
                        );
                        return;
                    }
                }
                heap.push(task.publish_id, task.scheduled_time);
                debug!(
                    publish_id = %task.publish_id,
                    scheduled_time = %task.scheduled_time.to_rfc3339(),
                    "publish task scheduled"
                );
            }
            PublishCommand::Cancel(publish_id) => {
                match self.store.cancel_publish(publish_id).await {
                    Ok(()) => heap.cancel(publish_id),
                    // Already terminal (e.g. cancelled through the API);
                    // still drop the index entry.
                    Err(CoreError::Conflict(_)) => heap.cancel(publish_id),
                    Err(err) => {
                        warn!(publish_id = %publish_id, error = %err, "publish cancel rejected");
                    }
                }
            }
            PublishCommand::Reschedule(publish_id, new_time) => {
                match self.store.reschedule_publish(publish_id, new_time).await {
                    Ok(()) => heap.push(publish_id, new_time),
                    Err(err) => {
                        warn!(publish_id = %publish_id, error = %err, "publish reschedule rejected");
                    }
                }
            }
        }
    }

    async fn dispatch_due(&self, heap: &mut PublishHeap) {
        let now = Utc::now();
        // Drop fired entries from the index; the CAS below is authoritative.
        let _ = heap.pop_due(now);
        let due = match self.store.pop_due_publish(now, self.settings.batch_size).await {
            Ok(due) => due,
            Err(err) => {
                error!(error = %err, "failed to pop due publish tasks");
                return;
            }
        };

        for publish in due {
            let store = Arc::clone(&self.store);
            let transport = Arc::clone(&self.transport);
            let metrics = Arc::clone(&self.metrics);
            let pool = Arc::clone(&self.upload_pool);
            let tx = self.tx.clone();
            let settings = self.settings.clone();
            tokio::spawn(async move {
                let Ok(_permit) = pool.acquire().await else {
                    return;
                };
                dispatch_one(store, transport, metrics, tx, settings, publish).await;
            });
        }
    }
}

async fn dispatch_one(
    store: Arc<dyn AutoPublishStore>,
    transport: Arc<dyn UploadTransport>,
    metrics: Arc<Metrics>,
    tx: mpsc::Sender<PublishCommand>,
    settings: PublisherSettings,
    publish: PublishTask,
) {
    metrics.publishes_dispatched.inc();
    let timer = metrics.upload_duration.start_timer();

    let profile_ref = match store.get_account(publish.account_id).await {
        Ok(account) => account.profile_ref,
        Err(err) => {
            timer.observe_duration();
            finish_failed(&store, &metrics, &publish, &format!("account lookup: {err}")).await;
            return;
        }
    };

    let request = UploadRequest {
        uid: publish.publish_id,
        profile_ref,
        video: UploadVideo {
            path: publish.video_ref.clone(),
            title: publish.title.clone(),
            description: publish.description.clone(),
            tags: publish.tags.clone(),
            thumbnail: publish.thumbnail_ref.clone(),
            visibility: publish.privacy.clone(),
        },
    };

    let uploaded =
        tokio::time::timeout(settings.upload_deadline, transport.upload(vec![request])).await;
    timer.observe_duration();

    match uploaded {
        Ok(Ok(outcomes)) => {
            let outcome = outcomes.into_iter().find(|o| o.uid == publish.publish_id);
            match outcome {
                Some(UploadOutcome {
                    status: UploadStatus::Success,
                    video_id,
                    url,
                    ..
                }) => {
                    let result = json!({"video_id": video_id, "url": url});
                    if let Err(err) = store
                        .mark_publish(
                            publish.publish_id,
                            PublishStatus::Success,
                            Some(result.clone()),
                            None,
                        )
                        .await
                    {
                        error!(publish_id = %publish.publish_id, error = %err, "failed to mark publish success");
                        return;
                    }
                    let _ = store
                        .set_task_publish_status(
                            publish.task_id,
                            TaskPublishStatus::Published,
                            Some(result),
                        )
                        .await;
                    metrics.publishes_succeeded.inc();
                    info!(publish_id = %publish.publish_id, "publish succeeded");
                }
                Some(outcome) => {
                    let message = outcome
                        .error
                        .unwrap_or_else(|| "upload transport reported failure".to_string());
                    let retry_able = outcome.retry_able.unwrap_or(false);
                    handle_failure(&store, &metrics, &tx, &settings, &publish, &message, retry_able)
                        .await;
                }
                None => {
                    handle_failure(
                        &store,
                        &metrics,
                        &tx,
                        &settings,
                        &publish,
                        "upload transport returned no outcome for this uid",
                        true,
                    )
                    .await;
                }
            }
        }
        Ok(Err(err)) => {
            handle_failure(
                &store,
                &metrics,
                &tx,
                &settings,
                &publish,
                &err.to_string(),
                err.retry_able(),
            )
            .await;
        }
        Err(_) => {
            handle_failure(
                &store,
                &metrics,
                &tx,
                &settings,
                &publish,
                "upload deadline exceeded",
                true,
            )
            .await;
        }
    }
}

async fn finish_failed(
    store: &Arc<dyn AutoPublishStore>,
    metrics: &Arc<Metrics>,
    publish: &PublishTask,
    message: &str,
) {
    metrics.publishes_failed.inc();
    if let Err(err) = store
        .mark_publish(
            publish.publish_id,
            PublishStatus::Failed,
            None,
            Some(message.to_string()),
        )
        .await
    {
        error!(publish_id = %publish.publish_id, error = %err, "failed to mark publish failed");
    }
    let _ = store
        .set_task_publish_status(publish.task_id, TaskPublishStatus::Failed, None)
        .await;
}

/// Terminal-fail the original row; a retryable failure mints a new publish
/// task so the original stays for audit.
async fn handle_failure(
    store: &Arc<dyn AutoPublishStore>,
    metrics: &Arc<Metrics>,
    tx: &mpsc::Sender<PublishCommand>,
    settings: &PublisherSettings,
    publish: &PublishTask,
    message: &str,
    retry_able: bool,
) {
    warn!(
        publish_id = %publish.publish_id,
        retry_count = publish.retry_count,
        retry_able,
        error = message,
        "publish failed"
    );

    if let Err(err) = store
        .mark_publish(
            publish.publish_id,
            PublishStatus::Failed,
            None,
            Some(message.to_string()),
        )
        .await
    {
        error!(publish_id = %publish.publish_id, error = %err, "failed to mark publish failed");
        return;
    }

    if retry_able && publish.retry_count < settings.max_retries {
        let now = Utc::now();
        let retry = PublishTask {
            publish_id: Uuid::new_v4(),
            status: PublishStatus::Scheduled,
            scheduled_time: now
                + chrono::Duration::from_std(settings.retry_unit)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            is_scheduled: true,
            retry_count: publish.retry_count.saturating_add(1),
            error: None,
            platform_video_id: None,
            platform_url: None,
            origin_publish_id: Some(publish.publish_id),
            created_at: now,
            completed_at: None,
            ..publish.clone()
        };
        metrics.retries_total.inc();
        if tx
            .send(PublishCommand::Schedule(Box::new(retry)))
            .await
            .is_err()
        {
            error!(publish_id = %publish.publish_id, "scheduler gone, retry dropped");
        }
    } else {
        metrics.publishes_failed.inc();
        let _ = store
            .set_task_publish_status(publish.task_id, TaskPublishStatus::Failed, None)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration};
    use serde_json::json;

    use crate::clients::transport::MockUploadTransport;
    use crate::observability::metrics::test_metrics;
    use crate::store::MemoryStore;
    use crate::store::models::{
        Account, AutoPublishTask, PublishFilter, TaskPipelineStatus, TaskPublishStatus,
    };

    async fn seed_task(store: &Arc<MemoryStore>) -> (Uuid, Uuid) {
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

        let task_id = Uuid::new_v4();
        store
            .insert_task(AutoPublishTask {
                task_id,
                config_id: Uuid::new_v4(),
                group_id: Uuid::new_v4(),
                account_id: Some(account_id),
                pipeline_id: "story".to_string(),
                slot_id: None,
                strategy_id: None,
                variant_name: None,
                pipeline_status: TaskPipelineStatus::Completed,
                publish_status: TaskPublishStatus::Scheduled,
                pipeline_result: None,
                publish_result: None,
                pipeline_params: json!({}),
                priority: 50,
                retry_count: 0,
                error: None,
                origin_task_id: None,
                created_at: Utc::now(),
                scheduled_time: Utc::now(),
                started_at: None,
                completed_at: None,
            })
            .await
            .expect("task");
        (task_id, account_id)
    }

    fn publish(task_id: Uuid, account_id: Uuid, at: DateTime<Utc>) -> PublishTask {
        PublishTask {
            publish_id: Uuid::new_v4(),
            task_id,
            account_id,
            title: "A story".to_string(),
            description: "desc".to_string(),
            tags: vec!["story".to_string()],
            thumbnail_ref: None,
            privacy: "public".to_string(),
            video_ref: "/data/v.mp4".to_string(),
            status: PublishStatus::Scheduled,
            scheduled_time: at,
            is_scheduled: true,
            retry_count: 0,
            error: None,
            platform_video_id: None,
            platform_url: None,
            variant_name: None,
            origin_publish_id: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    fn fast_settings() -> PublisherSettings {
        PublisherSettings {
            poll_granularity: Duration::from_millis(20),
            upload_concurrency: 5,
            upload_deadline: Duration::from_secs(5),
            retry_unit: Duration::from_millis(80),
            max_retries: 3,
            batch_size: 32,
        }
    }

    async fn wait_calls(transport: &MockUploadTransport, n: usize) {
        for _ in 0..300 {
            if transport.calls().len() >= n {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("transport was not called {n} times in time");
    }

    async fn wait_publish_status(store: &MemoryStore, publish_id: Uuid, status: PublishStatus) {
        for _ in 0..300 {
            if let Ok(row) = store.get_publish(publish_id).await {
                if row.status == status {
                    return;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("publish {publish_id} never reached {status:?}");
    }

    async fn wait_success_count(store: &MemoryStore, n: usize) {
        for _ in 0..300 {
            let successes = store
                .list_publishes(PublishFilter {
                    status: Some(PublishStatus::Success),
                    ..PublishFilter::default()
                })
                .await
                .expect("lists");
            if successes.len() >= n {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("never reached {n} successful publishes");
    }

    #[tokio::test]
    async fn deferred_publishes_fire_in_order_and_never_early() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MockUploadTransport::new());
        let (task_id, account_id) = seed_task(&store).await;

        let now = Utc::now();
        let mid = publish(task_id, account_id, now + ChronoDuration::milliseconds(200));
        let first = publish(task_id, account_id, now + ChronoDuration::milliseconds(100));
        let last = publish(task_id, account_id, now + ChronoDuration::milliseconds(300));

        let (scheduler, handle) = PublishScheduler::new(
            Arc::clone(&store) as Arc<dyn AutoPublishStore>,
            Arc::clone(&transport) as Arc<dyn UploadTransport>,
            test_metrics(),
            fast_settings(),
        );
        let _daemon = scheduler.spawn();

        // Scheduled out of order on purpose.
        handle.schedule(mid.clone()).await.expect("schedules");
        handle.schedule(first.clone()).await.expect("schedules");
        handle.schedule(last.clone()).await.expect("schedules");

        wait_calls(&transport, 3).await;

        let calls = transport.calls();
        assert_eq!(
            calls.iter().map(|c| c.uids[0]).collect::<Vec<_>>(),
            vec![first.publish_id, mid.publish_id, last.publish_id],
            "dispatch follows scheduled_time order"
        );
        for (call, expected) in calls.iter().zip([&first, &mid, &last]) {
            assert!(
                call.at >= expected.scheduled_time,
                "no publish fires before its scheduled_time"
            );
        }

        let stored = store.get_publish(first.publish_id).await.expect("row");
        assert_eq!(stored.status, PublishStatus::Success);
        assert!(stored.platform_video_id.is_some());
    }

    #[tokio::test]
    async fn transient_upload_failure_mints_a_new_publish_task() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MockUploadTransport::new());
        let (task_id, account_id) = seed_task(&store).await;

        let original = publish(task_id, account_id, Utc::now());
        transport.push_script(vec![UploadOutcome {
            uid: original.publish_id,
            status: UploadStatus::Fail,
            video_id: None,
            url: None,
            error: Some("uploader 503".to_string()),
            retry_able: Some(true),
        }]);

        let (scheduler, handle) = PublishScheduler::new(
            Arc::clone(&store) as Arc<dyn AutoPublishStore>,
            Arc::clone(&transport) as Arc<dyn UploadTransport>,
            test_metrics(),
            fast_settings(),
        );
        let _daemon = scheduler.spawn();
        handle.schedule(original.clone()).await.expect("schedules");

        wait_calls(&transport, 2).await;

        let original_row = store.get_publish(original.publish_id).await.expect("row");
        assert_eq!(original_row.status, PublishStatus::Failed);
        assert!(original_row.error.as_deref().is_some_and(|e| e.contains("503")));

        wait_success_count(&store, 1).await;

        let retries = store
            .list_publishes(PublishFilter {
                status: Some(PublishStatus::Success),
                ..PublishFilter::default()
            })
            .await
            .expect("lists");
        assert_eq!(retries[0].retry_count, 1);
        assert_eq!(retries[0].origin_publish_id, Some(original.publish_id));
        assert!(retries[0].scheduled_time > original.scheduled_time);
    }

    #[tokio::test]
    async fn permanent_upload_failure_is_terminal() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MockUploadTransport::new());
        let (task_id, account_id) = seed_task(&store).await;

        let original = publish(task_id, account_id, Utc::now());
        transport.push_script(vec![UploadOutcome {
            uid: original.publish_id,
            status: UploadStatus::Fail,
            video_id: None,
            url: None,
            error: Some("content policy violation".to_string()),
            retry_able: Some(false),
        }]);

        let (scheduler, handle) = PublishScheduler::new(
            Arc::clone(&store) as Arc<dyn AutoPublishStore>,
            Arc::clone(&transport) as Arc<dyn UploadTransport>,
            test_metrics(),
            fast_settings(),
        );
        let _daemon = scheduler.spawn();
        handle.schedule(original.clone()).await.expect("schedules");

        wait_publish_status(&store, original.publish_id, PublishStatus::Failed).await;

        // Give any (incorrect) retry a chance to show up, then assert none.
        sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.calls().len(), 1);
        let task = store.get_task(task_id).await.expect("task");
        assert_eq!(task.publish_status, TaskPublishStatus::Failed);
    }

    #[tokio::test]
    async fn heap_is_rebuilt_from_the_store_on_startup() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MockUploadTransport::new());
        let (task_id, account_id) = seed_task(&store).await;

        // Rows persisted by a previous process: already `scheduled`.
        let mut expected = Vec::new();
        for offset in [100_i64, 150, 200, 250, 300] {
            let row = publish(
                task_id,
                account_id,
                Utc::now() + ChronoDuration::milliseconds(offset),
            );
            store.enqueue_publish(row.clone()).await.expect("persists");
            expected.push(row.publish_id);
        }

        let (scheduler, _handle) = PublishScheduler::new(
            Arc::clone(&store) as Arc<dyn AutoPublishStore>,
            Arc::clone(&transport) as Arc<dyn UploadTransport>,
            test_metrics(),
            fast_settings(),
        );
        let _daemon = scheduler.spawn();

        wait_calls(&transport, 5).await;
        for publish_id in expected {
            let row = store.get_publish(publish_id).await.expect("row");
            assert_eq!(row.status, PublishStatus::Success, "no publish task lost");
        }
    }

    #[tokio::test]
    async fn cancel_and_reschedule_via_handle() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MockUploadTransport::new());
        let (task_id, account_id) = seed_task(&store).await;

        let cancelled = publish(task_id, account_id, Utc::now() + ChronoDuration::seconds(30));
        let moved = publish(task_id, account_id, Utc::now() + ChronoDuration::seconds(30));

        let (scheduler, handle) = PublishScheduler::new(
            Arc::clone(&store) as Arc<dyn AutoPublishStore>,
            Arc::clone(&transport) as Arc<dyn UploadTransport>,
            test_metrics(),
            fast_settings(),
        );
        let _daemon = scheduler.spawn();

        handle.schedule(cancelled.clone()).await.expect("schedules");
        handle.schedule(moved.clone()).await.expect("schedules");
        handle.cancel(cancelled.publish_id).await.expect("cancels");
        handle
            .reschedule(moved.publish_id, Utc::now() + ChronoDuration::milliseconds(50))
            .await
            .expect("reschedules");

        wait_calls(&transport, 1).await;
        let calls = transport.calls();
        assert_eq!(calls[0].uids, vec![moved.publish_id]);

        wait_publish_status(&store, cancelled.publish_id, PublishStatus::Cancelled).await;
    }
}
