//! In-memory store implementation.
//!
//! Mirrors the Postgres semantics (CAS transitions, upsert keys, cascade on
//! config delete) behind a single async mutex. Used as the test fake and by
//! deployments that run the core without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::dao::AutoPublishStore;
use super::models::{
    Account, AccountGroup, AccountPublishCount, AutoPublishTask, GroupMember, Monitor,
    MonitorResult, OverviewCounts, PipelineDescriptor, PipelineFilter, PublishConfig,
    PublishFilter, PublishStatus, PublishTask, RingSlot, SlotStatus, Strategy,
    StrategyAssignment, TaskFilter, TaskPipelineStatus, TaskPublishStatus,
};
use crate::util::error::{CoreError, CoreResult};

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<Uuid, Account>,
    groups: HashMap<Uuid, AccountGroup>,
    members: Vec<GroupMember>,
    pipelines: HashMap<String, PipelineDescriptor>,
    configs: HashMap<Uuid, PublishConfig>,
    slots: HashMap<Uuid, RingSlot>,
    strategies: HashMap<Uuid, Strategy>,
    assignments: Vec<StrategyAssignment>,
    tasks: HashMap<Uuid, AutoPublishTask>,
    publishes: HashMap<Uuid, PublishTask>,
    monitors: HashMap<Uuid, Monitor>,
    monitor_results: HashMap<(Uuid, String), MonitorResult>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_publish_result(publish: &mut PublishTask, result: Option<&Value>) {
    if let Some(result) = result {
        if let Some(video_id) = result.get("video_id").and_then(Value::as_str) {
            publish.platform_video_id = Some(video_id.to_string());
        }
        if let Some(url) = result.get("url").and_then(Value::as_str) {
            publish.platform_url = Some(url.to_string());
        }
    }
}

#[async_trait]
impl AutoPublishStore for MemoryStore {
    async fn upsert_account(&self, account: Account) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        state.accounts.insert(account.account_id, account);
        Ok(())
    }

    async fn get_account(&self, account_id: Uuid) -> CoreResult<Account> {
        let state = self.state.lock().await;
        state
            .accounts
            .get(&account_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("account {account_id}")))
    }

    async fn list_accounts(&self) -> CoreResult<Vec<Account>> {
        let state = self.state.lock().await;
        let mut accounts: Vec<Account> = state.accounts.values().cloned().collect();
        accounts.sort_by_key(|a| a.created_at);
        Ok(accounts)
    }

    async fn create_group(&self, group: AccountGroup) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if state.groups.values().any(|g| g.name == group.name) {
            return Err(CoreError::conflict(format!(
                "group name {:?} already exists",
                group.name
            )));
        }
        state.groups.insert(group.group_id, group);
        Ok(())
    }

    async fn get_group(&self, group_id: Uuid) -> CoreResult<AccountGroup> {
        let state = self.state.lock().await;
        state
            .groups
            .get(&group_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("group {group_id}")))
    }

    async fn list_groups(&self) -> CoreResult<Vec<AccountGroup>> {
        let state = self.state.lock().await;
        let mut groups: Vec<AccountGroup> = state.groups.values().cloned().collect();
        groups.sort_by_key(|g| g.created_at);
        Ok(groups)
    }

    async fn update_group(&self, group: AccountGroup) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.groups.contains_key(&group.group_id) {
            return Err(CoreError::not_found(format!("group {}", group.group_id)));
        }
        state.groups.insert(group.group_id, group);
        Ok(())
    }

    async fn delete_group(&self, group_id: Uuid) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if state.groups.remove(&group_id).is_none() {
            return Err(CoreError::not_found(format!("group {group_id}")));
        }
        state.members.retain(|m| m.group_id != group_id);
        Ok(())
    }

    async fn add_group_members(
        &self,
        group_id: Uuid,
        members: Vec<GroupMember>,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.groups.contains_key(&group_id) {
            return Err(CoreError::not_found(format!("group {group_id}")));
        }
        for member in members {
            state
                .members
                .retain(|m| !(m.group_id == group_id && m.account_id == member.account_id));
            state.members.push(GroupMember { group_id, ..member });
        }
        Ok(())
    }

    async fn remove_group_member(&self, group_id: Uuid, account_id: Uuid) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        let before = state.members.len();
        state
            .members
            .retain(|m| !(m.group_id == group_id && m.account_id == account_id));
        if state.members.len() == before {
            return Err(CoreError::not_found(format!(
                "member {account_id} of group {group_id}"
            )));
        }
        Ok(())
    }

    async fn list_group_members(&self, group_id: Uuid) -> CoreResult<Vec<GroupMember>> {
        let state = self.state.lock().await;
        let mut members: Vec<GroupMember> = state
            .members
            .iter()
            .filter(|m| m.group_id == group_id)
            .cloned()
            .collect();
        members.sort_by_key(|m| m.member_rank);
        Ok(members)
    }

    async fn list_active_group_accounts(&self, group_id: Uuid) -> CoreResult<Vec<Account>> {
        let state = self.state.lock().await;
        let mut members: Vec<&GroupMember> = state
            .members
            .iter()
            .filter(|m| m.group_id == group_id)
            .collect();
        members.sort_by_key(|m| m.member_rank);
        Ok(members
            .into_iter()
            .filter_map(|m| state.accounts.get(&m.account_id))
            .filter(|a| a.active)
            .cloned()
            .collect())
    }

    async fn upsert_pipeline(&self, descriptor: PipelineDescriptor) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        state
            .pipelines
            .insert(descriptor.pipeline_id.clone(), descriptor);
        Ok(())
    }

    async fn get_pipeline(&self, pipeline_id: &str) -> CoreResult<PipelineDescriptor> {
        let state = self.state.lock().await;
        state
            .pipelines
            .get(pipeline_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("pipeline {pipeline_id}")))
    }

    async fn list_pipelines(&self, filter: PipelineFilter) -> CoreResult<Vec<PipelineDescriptor>> {
        let state = self.state.lock().await;
        let mut pipelines: Vec<PipelineDescriptor> = state
            .pipelines
            .values()
            .filter(|d| {
                filter
                    .type_tag
                    .as_ref()
                    .is_none_or(|tag| d.type_tag == *tag)
                    && filter
                        .platform
                        .as_ref()
                        .is_none_or(|p| d.supported_platforms.contains(p))
                    && filter.status.is_none_or(|s| d.status == s)
            })
            .cloned()
            .collect();
        pipelines.sort_by(|a, b| a.pipeline_id.cmp(&b.pipeline_id));
        Ok(pipelines)
    }

    async fn delete_pipeline(&self, pipeline_id: &str) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if state.pipelines.remove(pipeline_id).is_none() {
            return Err(CoreError::not_found(format!("pipeline {pipeline_id}")));
        }
        Ok(())
    }

    async fn create_config(&self, config: PublishConfig) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if state.configs.values().any(|c| c.name == config.name) {
            return Err(CoreError::conflict(format!(
                "config name {:?} already exists",
                config.name
            )));
        }
        state.configs.insert(config.config_id, config);
        Ok(())
    }

    async fn get_config(&self, config_id: Uuid) -> CoreResult<PublishConfig> {
        let state = self.state.lock().await;
        state
            .configs
            .get(&config_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("config {config_id}")))
    }

    async fn list_configs(&self, active_only: bool) -> CoreResult<Vec<PublishConfig>> {
        let state = self.state.lock().await;
        let mut configs: Vec<PublishConfig> = state
            .configs
            .values()
            .filter(|c| !active_only || c.active)
            .cloned()
            .collect();
        configs.sort_by_key(|c| c.created_at);
        Ok(configs)
    }

    async fn update_config(&self, config: PublishConfig) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        match state.configs.get(&config.config_id) {
            Some(existing) => {
                // last_fire is owned by the trigger loop; keep it.
                let last_fire = existing.last_fire;
                let mut config = config;
                config.last_fire = last_fire;
                state.configs.insert(config.config_id, config);
                Ok(())
            }
            None => Err(CoreError::not_found(format!("config {}", config.config_id))),
        }
    }

    async fn set_config_active(&self, config_id: Uuid, active: bool) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        match state.configs.get_mut(&config_id) {
            Some(config) => {
                config.active = active;
                Ok(())
            }
            None => Err(CoreError::not_found(format!("config {config_id}"))),
        }
    }

    async fn delete_config(&self, config_id: Uuid) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if state.configs.remove(&config_id).is_none() {
            return Err(CoreError::not_found(format!("config {config_id}")));
        }
        state.slots.retain(|_, slot| slot.config_id != config_id);
        let now = Utc::now();
        for task in state.tasks.values_mut() {
            if task.config_id == config_id
                && task.pipeline_status == TaskPipelineStatus::Pending
            {
                task.pipeline_status = TaskPipelineStatus::Cancelled;
                task.completed_at = Some(now);
            }
        }
        Ok(())
    }

    async fn record_config_fire(
        &self,
        config_id: Uuid,
        last_fire: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(config) = state.configs.get_mut(&config_id) {
            config.last_fire = Some(last_fire);
        }
        Ok(())
    }

    async fn upsert_slot(&self, slot: RingSlot) -> CoreResult<RingSlot> {
        let mut state = self.state.lock().await;
        let existing_id = state
            .slots
            .values()
            .find(|s| {
                s.config_id == slot.config_id
                    && s.slot_date == slot.slot_date
                    && s.slot_hour == slot.slot_hour
                    && s.slot_minute == slot.slot_minute
                    && s.account_id == slot.account_id
            })
            .map(|s| s.slot_id);
        match existing_id {
            Some(slot_id) => {
                let existing = state.slots.get_mut(&slot_id).expect("slot id just seen");
                if existing.status == SlotStatus::Pending {
                    existing.slot_index = slot.slot_index;
                }
                Ok(existing.clone())
            }
            None => {
                state.slots.insert(slot.slot_id, slot.clone());
                Ok(slot)
            }
        }
    }

    async fn list_slots(&self, config_id: Uuid, date: NaiveDate) -> CoreResult<Vec<RingSlot>> {
        let state = self.state.lock().await;
        let mut slots: Vec<RingSlot> = state
            .slots
            .values()
            .filter(|s| s.config_id == config_id && s.slot_date == date)
            .cloned()
            .collect();
        slots.sort_by_key(|s| (s.slot_hour, s.slot_minute, s.slot_index));
        Ok(slots)
    }

    async fn next_pending_slot(
        &self,
        config_id: Uuid,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<RingSlot>> {
        let state = self.state.lock().await;
        let mut candidates: Vec<&RingSlot> = state
            .slots
            .values()
            .filter(|s| {
                s.config_id == config_id
                    && s.status == SlotStatus::Pending
                    && s.fire_time().is_some_and(|t| t >= now)
            })
            .collect();
        candidates.sort_by_key(|s| (s.fire_time(), s.slot_index));
        Ok(candidates.first().map(|s| (*s).clone()))
    }

    async fn bind_slot_to_task(&self, slot_id: Uuid, task_id: Uuid) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        match state.slots.get_mut(&slot_id) {
            Some(slot) if slot.status == SlotStatus::Pending => {
                slot.status = SlotStatus::Scheduled;
                slot.task_id = Some(task_id);
                Ok(())
            }
            Some(_) => Err(CoreError::conflict(format!("slot {slot_id} is not pending"))),
            None => Err(CoreError::not_found(format!("slot {slot_id}"))),
        }
    }

    async fn resolve_slot(&self, slot_id: Uuid, status: SlotStatus) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.slots.get_mut(&slot_id) {
            slot.status = status;
        }
        Ok(())
    }

    async fn create_strategy(&self, strategy: Strategy) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if state.strategies.values().any(|s| s.name == strategy.name) {
            return Err(CoreError::conflict(format!(
                "strategy name {:?} already exists",
                strategy.name
            )));
        }
        state.strategies.insert(strategy.strategy_id, strategy);
        Ok(())
    }

    async fn get_strategy(&self, strategy_id: Uuid) -> CoreResult<Strategy> {
        let state = self.state.lock().await;
        state
            .strategies
            .get(&strategy_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("strategy {strategy_id}")))
    }

    async fn list_strategies(&self) -> CoreResult<Vec<Strategy>> {
        let state = self.state.lock().await;
        let mut strategies: Vec<Strategy> = state.strategies.values().cloned().collect();
        strategies.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(strategies)
    }

    async fn update_strategy(&self, strategy: Strategy) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.strategies.contains_key(&strategy.strategy_id) {
            return Err(CoreError::not_found(format!(
                "strategy {}",
                strategy.strategy_id
            )));
        }
        state.strategies.insert(strategy.strategy_id, strategy);
        Ok(())
    }

    async fn delete_strategy(&self, strategy_id: Uuid) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if state.strategies.remove(&strategy_id).is_none() {
            return Err(CoreError::not_found(format!("strategy {strategy_id}")));
        }
        state.assignments.retain(|a| a.strategy_id != strategy_id);
        Ok(())
    }

    async fn upsert_assignment(&self, assignment: StrategyAssignment) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        state.assignments.retain(|a| {
            !(a.strategy_id == assignment.strategy_id
                && a.group_id == assignment.group_id
                && a.variant_name == assignment.variant_name)
        });
        state.assignments.push(assignment);
        Ok(())
    }

    async fn list_assignments(
        &self,
        strategy_id: Uuid,
        group_id: Uuid,
    ) -> CoreResult<Vec<StrategyAssignment>> {
        let state = self.state.lock().await;
        let mut assignments: Vec<StrategyAssignment> = state
            .assignments
            .iter()
            .filter(|a| a.strategy_id == strategy_id && a.group_id == group_id)
            .cloned()
            .collect();
        assignments.sort_by(|a, b| a.variant_name.cmp(&b.variant_name));
        Ok(assignments)
    }

    async fn insert_task(&self, task: AutoPublishTask) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.task_id) {
            return Err(CoreError::conflict(format!(
                "task {} already exists",
                task.task_id
            )));
        }
        state.tasks.insert(task.task_id, task);
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> CoreResult<AutoPublishTask> {
        let state = self.state.lock().await;
        state
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("task {task_id}")))
    }

    async fn list_tasks(&self, filter: TaskFilter) -> CoreResult<Vec<AutoPublishTask>> {
        let state = self.state.lock().await;
        let mut tasks: Vec<AutoPublishTask> = state
            .tasks
            .values()
            .filter(|t| {
                filter.config_id.is_none_or(|c| t.config_id == c)
                    && filter
                        .pipeline_status
                        .is_none_or(|s| t.pipeline_status == s)
                    && filter.publish_status.is_none_or(|s| t.publish_status == s)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(filter.limit.unwrap_or(100));
        Ok(tasks)
    }

    async fn claim_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<AutoPublishTask>> {
        let mut state = self.state.lock().await;
        let mut due: Vec<Uuid> = state
            .tasks
            .values()
            .filter(|t| {
                t.pipeline_status == TaskPipelineStatus::Pending && t.scheduled_time <= now
            })
            .map(|t| t.task_id)
            .collect();
        due.sort_by(|a, b| {
            let ta = &state.tasks[a];
            let tb = &state.tasks[b];
            tb.priority
                .cmp(&ta.priority)
                .then(ta.scheduled_time.cmp(&tb.scheduled_time))
                .then(ta.created_at.cmp(&tb.created_at))
        });
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for task_id in due {
            let task = state.tasks.get_mut(&task_id).expect("task id just seen");
            task.pipeline_status = TaskPipelineStatus::Running;
            task.started_at = Some(now);
            claimed.push(task.clone());
        }
        Ok(claimed)
    }

    async fn record_pipeline_result(
        &self,
        task_id: Uuid,
        status: TaskPipelineStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| CoreError::not_found(format!("task {task_id}")))?;
        task.pipeline_status = status;
        if result.is_some() {
            task.pipeline_result = result;
        }
        task.error = error;
        if matches!(
            status,
            TaskPipelineStatus::Completed
                | TaskPipelineStatus::Failed
                | TaskPipelineStatus::Cancelled
        ) {
            task.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_task_publish_status(
        &self,
        task_id: Uuid,
        status: TaskPublishStatus,
        result: Option<Value>,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| CoreError::not_found(format!("task {task_id}")))?;
        task.publish_status = status;
        if result.is_some() {
            task.publish_result = result;
        }
        Ok(())
    }

    async fn reschedule_task_retry(
        &self,
        task_id: Uuid,
        scheduled_time: DateTime<Utc>,
        error: String,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| CoreError::not_found(format!("task {task_id}")))?;
        task.pipeline_status = TaskPipelineStatus::Pending;
        task.scheduled_time = scheduled_time;
        task.retry_count = task.retry_count.saturating_add(1);
        task.error = Some(error);
        task.started_at = None;
        Ok(())
    }

    async fn cancel_task(&self, task_id: Uuid) -> CoreResult<AutoPublishTask> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| CoreError::not_found(format!("task {task_id}")))?;
        if !matches!(
            task.pipeline_status,
            TaskPipelineStatus::Pending | TaskPipelineStatus::Running
        ) {
            return Err(CoreError::conflict(format!(
                "task {task_id} is not cancellable"
            )));
        }
        task.pipeline_status = TaskPipelineStatus::Cancelled;
        if matches!(
            task.publish_status,
            TaskPublishStatus::Pending | TaskPublishStatus::Scheduled
        ) {
            task.publish_status = TaskPublishStatus::Cancelled;
        }
        task.completed_at = Some(Utc::now());
        Ok(task.clone())
    }

    async fn recover_stale_running(
        &self,
        cutoff: DateTime<Utc>,
    ) -> CoreResult<Vec<AutoPublishTask>> {
        let mut state = self.state.lock().await;
        let mut recovered = Vec::new();
        for task in state.tasks.values_mut() {
            if task.pipeline_status == TaskPipelineStatus::Running
                && task.started_at.is_some_and(|t| t < cutoff)
            {
                task.pipeline_status = TaskPipelineStatus::Failed;
                task.error = Some("stale running task recovered after restart".to_string());
                recovered.push(task.clone());
            }
        }
        Ok(recovered)
    }

    async fn enqueue_publish(&self, publish: PublishTask) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if state.publishes.contains_key(&publish.publish_id) {
            return Err(CoreError::conflict(format!(
                "publish task {} already exists",
                publish.publish_id
            )));
        }
        state.publishes.insert(publish.publish_id, publish);
        Ok(())
    }

    async fn get_publish(&self, publish_id: Uuid) -> CoreResult<PublishTask> {
        let state = self.state.lock().await;
        state
            .publishes
            .get(&publish_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("publish task {publish_id}")))
    }

    async fn list_publishes(&self, filter: PublishFilter) -> CoreResult<Vec<PublishTask>> {
        let state = self.state.lock().await;
        let mut publishes: Vec<PublishTask> = state
            .publishes
            .values()
            .filter(|p| {
                filter.task_id.is_none_or(|t| p.task_id == t)
                    && filter.account_id.is_none_or(|a| p.account_id == a)
                    && filter.status.is_none_or(|s| p.status == s)
            })
            .cloned()
            .collect();
        publishes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        publishes.truncate(filter.limit.unwrap_or(100));
        Ok(publishes)
    }

    async fn load_scheduled_publishes(&self) -> CoreResult<Vec<PublishTask>> {
        let state = self.state.lock().await;
        let mut publishes: Vec<PublishTask> = state
            .publishes
            .values()
            .filter(|p| p.status == PublishStatus::Scheduled)
            .cloned()
            .collect();
        publishes.sort_by_key(|p| p.scheduled_time);
        Ok(publishes)
    }

    async fn pop_due_publish(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<PublishTask>> {
        let mut state = self.state.lock().await;
        let mut due: Vec<Uuid> = state
            .publishes
            .values()
            .filter(|p| p.status == PublishStatus::Scheduled && p.scheduled_time <= now)
            .map(|p| p.publish_id)
            .collect();
        due.sort_by(|a, b| {
            let pa = &state.publishes[a];
            let pb = &state.publishes[b];
            pa.scheduled_time
                .cmp(&pb.scheduled_time)
                .then(pa.publish_id.cmp(&pb.publish_id))
        });
        due.truncate(limit);

        let mut popped = Vec::with_capacity(due.len());
        for publish_id in due {
            let publish = state
                .publishes
                .get_mut(&publish_id)
                .expect("publish id just seen");
            publish.status = PublishStatus::Uploading;
            popped.push(publish.clone());
        }
        Ok(popped)
    }

    async fn mark_publish(
        &self,
        publish_id: Uuid,
        status: PublishStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        let publish = state
            .publishes
            .get_mut(&publish_id)
            .ok_or_else(|| CoreError::not_found(format!("publish task {publish_id}")))?;
        publish.status = status;
        apply_publish_result(publish, result.as_ref());
        publish.error = error;
        if matches!(
            status,
            PublishStatus::Success | PublishStatus::Failed | PublishStatus::Cancelled
        ) {
            publish.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn reschedule_publish(
        &self,
        publish_id: Uuid,
        new_time: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        let publish = state
            .publishes
            .get_mut(&publish_id)
            .ok_or_else(|| CoreError::not_found(format!("publish task {publish_id}")))?;
        if publish.status != PublishStatus::Scheduled {
            return Err(CoreError::conflict(format!(
                "publish task {publish_id} is not reschedulable"
            )));
        }
        publish.scheduled_time = new_time;
        Ok(())
    }

    async fn cancel_publish(&self, publish_id: Uuid) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        let publish = state
            .publishes
            .get_mut(&publish_id)
            .ok_or_else(|| CoreError::not_found(format!("publish task {publish_id}")))?;
        if !matches!(
            publish.status,
            PublishStatus::Pending | PublishStatus::Scheduled
        ) {
            return Err(CoreError::conflict(format!(
                "publish task {publish_id} is not cancellable"
            )));
        }
        publish.status = PublishStatus::Cancelled;
        publish.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn cancel_scheduled_publishes_for_task(&self, task_id: Uuid) -> CoreResult<Vec<Uuid>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut cancelled = Vec::new();
        for publish in state.publishes.values_mut() {
            if publish.task_id == task_id && publish.status == PublishStatus::Scheduled {
                publish.status = PublishStatus::Cancelled;
                publish.completed_at = Some(now);
                cancelled.push(publish.publish_id);
            }
        }
        Ok(cancelled)
    }

    async fn count_publishes_for_account(
        &self,
        config_id: Uuid,
        account_id: Uuid,
    ) -> CoreResult<i64> {
        let state = self.state.lock().await;
        let count = state
            .publishes
            .values()
            .filter(|p| {
                p.account_id == account_id
                    && state
                        .tasks
                        .get(&p.task_id)
                        .is_some_and(|t| t.config_id == config_id)
            })
            .count();
        Ok(count as i64)
    }

    async fn create_monitor(&self, monitor: Monitor) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        state.monitors.insert(monitor.monitor_id, monitor);
        Ok(())
    }

    async fn get_monitor(&self, monitor_id: Uuid) -> CoreResult<Monitor> {
        let state = self.state.lock().await;
        state
            .monitors
            .get(&monitor_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("monitor {monitor_id}")))
    }

    async fn list_monitors(&self, active_only: bool) -> CoreResult<Vec<Monitor>> {
        let state = self.state.lock().await;
        let mut monitors: Vec<Monitor> = state
            .monitors
            .values()
            .filter(|m| !active_only || m.active)
            .cloned()
            .collect();
        monitors.sort_by_key(|m| m.monitor_id);
        Ok(monitors)
    }

    async fn update_monitor(&self, monitor: Monitor) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.monitors.contains_key(&monitor.monitor_id) {
            return Err(CoreError::not_found(format!(
                "monitor {}",
                monitor.monitor_id
            )));
        }
        state.monitors.insert(monitor.monitor_id, monitor);
        Ok(())
    }

    async fn set_monitor_active(&self, monitor_id: Uuid, active: bool) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        match state.monitors.get_mut(&monitor_id) {
            Some(monitor) => {
                monitor.active = active;
                Ok(())
            }
            None => Err(CoreError::not_found(format!("monitor {monitor_id}"))),
        }
    }

    async fn delete_monitor(&self, monitor_id: Uuid) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if state.monitors.remove(&monitor_id).is_none() {
            return Err(CoreError::not_found(format!("monitor {monitor_id}")));
        }
        state.monitor_results.retain(|(id, _), _| *id != monitor_id);
        Ok(())
    }

    async fn record_monitor_check(&self, monitor_id: Uuid, at: DateTime<Utc>) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(monitor) = state.monitors.get_mut(&monitor_id) {
            monitor.last_check = Some(at);
        }
        Ok(())
    }

    async fn insert_monitor_result(&self, result: MonitorResult) -> CoreResult<bool> {
        let mut state = self.state.lock().await;
        let key = (result.monitor_id, result.content_id.clone());
        if state.monitor_results.contains_key(&key) {
            return Ok(false);
        }
        state.monitor_results.insert(key, result);
        Ok(true)
    }

    async fn list_unprocessed_results(&self, monitor_id: Uuid) -> CoreResult<Vec<MonitorResult>> {
        let state = self.state.lock().await;
        let mut results: Vec<MonitorResult> = state
            .monitor_results
            .values()
            .filter(|r| r.monitor_id == monitor_id && !r.processed)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.captured_at);
        Ok(results)
    }

    async fn fan_out_monitor_result(
        &self,
        monitor_id: Uuid,
        content_id: &str,
        tasks: Vec<AutoPublishTask>,
    ) -> CoreResult<usize> {
        // One lock scope is one transaction here: the flag CAS and every
        // task insert land together or not at all.
        let mut state = self.state.lock().await;
        if tasks.iter().any(|t| state.tasks.contains_key(&t.task_id)) {
            return Err(CoreError::conflict("fan-out task id already exists"));
        }
        match state
            .monitor_results
            .get_mut(&(monitor_id, content_id.to_string()))
        {
            Some(result) if !result.processed => result.processed = true,
            _ => return Ok(0),
        }
        let count = tasks.len();
        for task in tasks {
            state.tasks.insert(task.task_id, task);
        }
        Ok(count)
    }

    async fn overview_counts(&self) -> CoreResult<OverviewCounts> {
        let state = self.state.lock().await;
        let mut counts = OverviewCounts::default();

        let mut by_pipeline: HashMap<&'static str, i64> = HashMap::new();
        let mut by_code: HashMap<String, i64> = HashMap::new();
        for task in state.tasks.values() {
            *by_pipeline.entry(task.pipeline_status.as_str()).or_default() += 1;
            if task.pipeline_status == TaskPipelineStatus::Failed {
                if let Some(error) = &task.error {
                    let code = error.split(':').next().unwrap_or("unknown").to_string();
                    *by_code.entry(code).or_default() += 1;
                }
            }
        }
        let mut by_publish: HashMap<&'static str, i64> = HashMap::new();
        for publish in state.publishes.values() {
            *by_publish.entry(publish.status.as_str()).or_default() += 1;
        }

        counts.tasks_by_pipeline_status = by_pipeline
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        counts.tasks_by_pipeline_status.sort();
        counts.publishes_by_status = by_publish
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        counts.publishes_by_status.sort();
        counts.failures_by_code = by_code.into_iter().collect();
        counts.failures_by_code.sort();
        Ok(counts)
    }

    async fn recent_tasks(&self, limit: usize) -> CoreResult<Vec<AutoPublishTask>> {
        let state = self.state.lock().await;
        let mut tasks: Vec<AutoPublishTask> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn top_accounts(&self, limit: usize) -> CoreResult<Vec<AccountPublishCount>> {
        let state = self.state.lock().await;
        let mut by_account: HashMap<Uuid, i64> = HashMap::new();
        for publish in state.publishes.values() {
            if publish.status == PublishStatus::Success {
                *by_account.entry(publish.account_id).or_default() += 1;
            }
        }
        let mut ranked: Vec<AccountPublishCount> = by_account
            .into_iter()
            .map(|(account_id, success_count)| AccountPublishCount {
                account_id,
                display_name: state
                    .accounts
                    .get(&account_id)
                    .map(|a| a.display_name.clone())
                    .unwrap_or_default(),
                success_count,
            })
            .collect();
        ranked.sort_by(|a, b| b.success_count.cmp(&a.success_count));
        ranked.truncate(limit);
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(scheduled_time: DateTime<Utc>) -> AutoPublishTask {
        AutoPublishTask {
            task_id: Uuid::new_v4(),
            config_id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            account_id: None,
            pipeline_id: "story".to_string(),
            slot_id: None,
            strategy_id: None,
            variant_name: None,
            pipeline_status: TaskPipelineStatus::Pending,
            publish_status: TaskPublishStatus::Pending,
            pipeline_result: None,
            publish_result: None,
            pipeline_params: json!({}),
            priority: 50,
            retry_count: 0,
            error: None,
            origin_task_id: None,
            created_at: Utc::now(),
            scheduled_time,
            started_at: None,
            completed_at: None,
        }
    }

    fn publish(scheduled_time: DateTime<Utc>, status: PublishStatus) -> PublishTask {
        PublishTask {
            publish_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            title: "t".to_string(),
            description: String::new(),
            tags: vec![],
            thumbnail_ref: None,
            privacy: "public".to_string(),
            video_ref: "/v.mp4".to_string(),
            status,
            scheduled_time,
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

    #[tokio::test]
    async fn claimed_tasks_cannot_be_claimed_twice() {
        let store = MemoryStore::new();
        let row = task(Utc::now());
        store.insert_task(row.clone()).await.expect("inserts");

        let first = store.claim_due_tasks(Utc::now(), 10).await.expect("claims");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].pipeline_status, TaskPipelineStatus::Running);
        assert!(first[0].started_at.is_some());

        let second = store.claim_due_tasks(Utc::now(), 10).await.expect("claims");
        assert!(second.is_empty(), "CAS prevents a double claim");
    }

    #[tokio::test]
    async fn claim_order_is_priority_then_time() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut low = task(now - chrono::Duration::minutes(5));
        low.priority = 10;
        let mut high = task(now - chrono::Duration::minutes(1));
        high.priority = 90;
        store.insert_task(low.clone()).await.expect("inserts");
        store.insert_task(high.clone()).await.expect("inserts");

        let claimed = store.claim_due_tasks(now, 10).await.expect("claims");
        assert_eq!(claimed[0].task_id, high.task_id);
        assert_eq!(claimed[1].task_id, low.task_id);
    }

    #[tokio::test]
    async fn pop_due_publish_only_takes_due_scheduled_rows() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let due = publish(now - chrono::Duration::seconds(1), PublishStatus::Scheduled);
        let future = publish(now + chrono::Duration::hours(1), PublishStatus::Scheduled);
        let pending = publish(now - chrono::Duration::seconds(1), PublishStatus::Pending);
        for row in [&due, &future, &pending] {
            // publish() fabricates task ids; the memory store does not
            // enforce the foreign key, matching enqueue semantics.
            store.enqueue_publish((*row).clone()).await.expect("enqueues");
        }

        let popped = store.pop_due_publish(now, 10).await.expect("pops");
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].publish_id, due.publish_id);
        assert_eq!(popped[0].status, PublishStatus::Uploading);

        let again = store.pop_due_publish(now, 10).await.expect("pops");
        assert!(again.is_empty(), "uploading rows are not popped again");
    }

    #[tokio::test]
    async fn binding_a_slot_twice_is_a_conflict() {
        let store = MemoryStore::new();
        let slot = RingSlot {
            slot_id: Uuid::new_v4(),
            config_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            slot_date: chrono::NaiveDate::from_ymd_opt(2026, 3, 1).expect("valid"),
            slot_hour: 10,
            slot_minute: 0,
            slot_index: 0,
            status: SlotStatus::Pending,
            task_id: None,
        };
        store.upsert_slot(slot.clone()).await.expect("upserts");

        store
            .bind_slot_to_task(slot.slot_id, Uuid::new_v4())
            .await
            .expect("first bind");
        let error = store
            .bind_slot_to_task(slot.slot_id, Uuid::new_v4())
            .await
            .expect_err("second bind must fail");
        assert_eq!(error.code(), "conflict");
    }

    #[tokio::test]
    async fn monitor_results_deduplicate_on_their_key() {
        let store = MemoryStore::new();
        let monitor_id = Uuid::new_v4();
        let result = MonitorResult {
            monitor_id,
            content_id: "vid-1".to_string(),
            title: "a video".to_string(),
            payload: json!({}),
            processed: false,
            captured_at: Utc::now(),
        };
        assert!(store.insert_monitor_result(result.clone()).await.expect("inserts"));
        assert!(!store.insert_monitor_result(result).await.expect("dedups"));
    }

    #[tokio::test]
    async fn monitor_fan_out_is_atomic_and_replay_safe() {
        let store = MemoryStore::new();
        let monitor_id = Uuid::new_v4();
        store
            .insert_monitor_result(MonitorResult {
                monitor_id,
                content_id: "vid-1".to_string(),
                title: "a video".to_string(),
                payload: json!({}),
                processed: false,
                captured_at: Utc::now(),
            })
            .await
            .expect("inserts");

        let first = store
            .fan_out_monitor_result(monitor_id, "vid-1", vec![task(Utc::now()), task(Utc::now())])
            .await
            .expect("fans out");
        assert_eq!(first, 2);

        // A replay (crash between poll and processing, or a racing poller)
        // claims nothing and inserts nothing.
        let replay = store
            .fan_out_monitor_result(monitor_id, "vid-1", vec![task(Utc::now())])
            .await
            .expect("replays");
        assert_eq!(replay, 0);

        let unprocessed = store
            .list_unprocessed_results(monitor_id)
            .await
            .expect("lists");
        assert!(unprocessed.is_empty());
        let tasks = store
            .list_tasks(TaskFilter::default())
            .await
            .expect("lists");
        assert_eq!(tasks.len(), 2, "replay added no tasks");
    }

    #[tokio::test]
    async fn terminal_tasks_cannot_be_cancelled() {
        let store = MemoryStore::new();
        let row = task(Utc::now());
        store.insert_task(row.clone()).await.expect("inserts");
        store
            .record_pipeline_result(row.task_id, TaskPipelineStatus::Completed, None, None)
            .await
            .expect("completes");

        let error = store
            .cancel_task(row.task_id)
            .await
            .expect_err("completed tasks are immutable");
        assert_eq!(error.code(), "conflict");
    }

    #[tokio::test]
    async fn config_delete_cascades_to_slots_and_pending_tasks() {
        let store = MemoryStore::new();
        let config = PublishConfig {
            config_id: Uuid::new_v4(),
            name: "doomed".to_string(),
            group_id: Uuid::new_v4(),
            pipeline_id: "story".to_string(),
            trigger: crate::trigger::schedule::TriggerSpec::Scheduled(
                crate::trigger::schedule::ScheduleSpec::Daily {
                    schedule_time: "10:00".to_string(),
                },
            ),
            strategy_id: None,
            priority: 50,
            active: true,
            pipeline_params: json!({}),
            publish_delay_secs: None,
            last_fire: None,
            created_at: Utc::now(),
        };
        store.create_config(config.clone()).await.expect("config");

        let mut owned = task(Utc::now());
        owned.config_id = config.config_id;
        store.insert_task(owned.clone()).await.expect("task");
        store
            .upsert_slot(RingSlot {
                slot_id: Uuid::new_v4(),
                config_id: config.config_id,
                account_id: Uuid::new_v4(),
                slot_date: chrono::NaiveDate::from_ymd_opt(2026, 3, 1).expect("valid"),
                slot_hour: 10,
                slot_minute: 0,
                slot_index: 0,
                status: SlotStatus::Pending,
                task_id: None,
            })
            .await
            .expect("slot");

        store.delete_config(config.config_id).await.expect("deletes");

        let slots = store
            .list_slots(
                config.config_id,
                chrono::NaiveDate::from_ymd_opt(2026, 3, 1).expect("valid"),
            )
            .await
            .expect("lists");
        assert!(slots.is_empty());
        let cancelled = store.get_task(owned.task_id).await.expect("task");
        assert_eq!(cancelled.pipeline_status, TaskPipelineStatus::Cancelled);
    }
}
