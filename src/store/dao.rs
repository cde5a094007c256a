use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::models::{
    Account, AccountGroup, AccountPublishCount, AutoPublishTask, GroupMember, GroupType, Monitor,
    MonitorResult, MonitorType, OverviewCounts, PipelineDescriptor, PipelineFilter,
    PipelineStatus, PublishConfig, PublishFilter, PublishStatus, PublishTask, RingSlot,
    SlotStatus, Strategy, StrategyAssignment, StrategyKind, TaskFilter, TaskPipelineStatus,
    TaskPublishStatus,
};
use crate::trigger::schedule::TriggerSpec;
use crate::util::error::{CoreError, CoreResult};

const SCHEMA: &str = include_str!("schema.sql");

/// Durable store of all core entities plus the atomic transitions the
/// execution engine and publish scheduler rely on. Tests inject the
/// in-memory implementation.
#[async_trait]
pub trait AutoPublishStore: Send + Sync {
    // Accounts
    async fn upsert_account(&self, account: Account) -> CoreResult<()>;
    async fn get_account(&self, account_id: Uuid) -> CoreResult<Account>;
    async fn list_accounts(&self) -> CoreResult<Vec<Account>>;

    // Account groups and members
    async fn create_group(&self, group: AccountGroup) -> CoreResult<()>;
    async fn get_group(&self, group_id: Uuid) -> CoreResult<AccountGroup>;
    async fn list_groups(&self) -> CoreResult<Vec<AccountGroup>>;
    async fn update_group(&self, group: AccountGroup) -> CoreResult<()>;
    async fn delete_group(&self, group_id: Uuid) -> CoreResult<()>;
    async fn add_group_members(&self, group_id: Uuid, members: Vec<GroupMember>)
        -> CoreResult<()>;
    async fn remove_group_member(&self, group_id: Uuid, account_id: Uuid) -> CoreResult<()>;
    async fn list_group_members(&self, group_id: Uuid) -> CoreResult<Vec<GroupMember>>;
    /// Active accounts of a group, in member-rank order.
    async fn list_active_group_accounts(&self, group_id: Uuid) -> CoreResult<Vec<Account>>;

    // Pipelines
    async fn upsert_pipeline(&self, descriptor: PipelineDescriptor) -> CoreResult<()>;
    async fn get_pipeline(&self, pipeline_id: &str) -> CoreResult<PipelineDescriptor>;
    async fn list_pipelines(&self, filter: PipelineFilter) -> CoreResult<Vec<PipelineDescriptor>>;
    async fn delete_pipeline(&self, pipeline_id: &str) -> CoreResult<()>;

    // Publish configs
    async fn create_config(&self, config: PublishConfig) -> CoreResult<()>;
    async fn get_config(&self, config_id: Uuid) -> CoreResult<PublishConfig>;
    async fn list_configs(&self, active_only: bool) -> CoreResult<Vec<PublishConfig>>;
    async fn update_config(&self, config: PublishConfig) -> CoreResult<()>;
    async fn set_config_active(&self, config_id: Uuid, active: bool) -> CoreResult<()>;
    /// Cascades to owned slots; still-pending tasks are cancelled.
    async fn delete_config(&self, config_id: Uuid) -> CoreResult<()>;
    async fn record_config_fire(
        &self,
        config_id: Uuid,
        last_fire: DateTime<Utc>,
    ) -> CoreResult<()>;

    // Ring slots
    /// Upsert by `(config_id, slot_date, slot_hour, slot_minute, account_id)`;
    /// refreshes `slot_index` only while the slot is still pending.
    async fn upsert_slot(&self, slot: RingSlot) -> CoreResult<RingSlot>;
    async fn list_slots(&self, config_id: Uuid, date: NaiveDate) -> CoreResult<Vec<RingSlot>>;
    async fn next_pending_slot(
        &self,
        config_id: Uuid,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<RingSlot>>;
    /// CAS on `status = pending`; anything else is a conflict.
    async fn bind_slot_to_task(&self, slot_id: Uuid, task_id: Uuid) -> CoreResult<()>;
    async fn resolve_slot(&self, slot_id: Uuid, status: SlotStatus) -> CoreResult<()>;

    // Strategies
    async fn create_strategy(&self, strategy: Strategy) -> CoreResult<()>;
    async fn get_strategy(&self, strategy_id: Uuid) -> CoreResult<Strategy>;
    async fn list_strategies(&self) -> CoreResult<Vec<Strategy>>;
    async fn update_strategy(&self, strategy: Strategy) -> CoreResult<()>;
    async fn delete_strategy(&self, strategy_id: Uuid) -> CoreResult<()>;
    async fn upsert_assignment(&self, assignment: StrategyAssignment) -> CoreResult<()>;
    async fn list_assignments(
        &self,
        strategy_id: Uuid,
        group_id: Uuid,
    ) -> CoreResult<Vec<StrategyAssignment>>;

    // Auto-publish tasks
    async fn insert_task(&self, task: AutoPublishTask) -> CoreResult<()>;
    async fn get_task(&self, task_id: Uuid) -> CoreResult<AutoPublishTask>;
    async fn list_tasks(&self, filter: TaskFilter) -> CoreResult<Vec<AutoPublishTask>>;
    /// CAS `pending -> running` with `started_at = now`, ordered
    /// `(priority DESC, scheduled_time ASC, created_at ASC)`.
    async fn claim_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<AutoPublishTask>>;
    async fn record_pipeline_result(
        &self,
        task_id: Uuid,
        status: TaskPipelineStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> CoreResult<()>;
    async fn set_task_publish_status(
        &self,
        task_id: Uuid,
        status: TaskPublishStatus,
        result: Option<Value>,
    ) -> CoreResult<()>;
    /// Puts a failed-but-retryable task back to `pending` at a later time.
    async fn reschedule_task_retry(
        &self,
        task_id: Uuid,
        scheduled_time: DateTime<Utc>,
        error: String,
    ) -> CoreResult<()>;
    /// CAS: only `pending` or `running` tasks can be cancelled.
    async fn cancel_task(&self, task_id: Uuid) -> CoreResult<AutoPublishTask>;
    /// `running` rows started before the cutoff become `failed` with a
    /// retryable error recorded; returns the affected rows.
    async fn recover_stale_running(
        &self,
        cutoff: DateTime<Utc>,
    ) -> CoreResult<Vec<AutoPublishTask>>;

    // Publish tasks
    async fn enqueue_publish(&self, publish: PublishTask) -> CoreResult<()>;
    async fn get_publish(&self, publish_id: Uuid) -> CoreResult<PublishTask>;
    async fn list_publishes(&self, filter: PublishFilter) -> CoreResult<Vec<PublishTask>>;
    /// All rows with `status = scheduled`, for heap rebuild at startup.
    async fn load_scheduled_publishes(&self) -> CoreResult<Vec<PublishTask>>;
    /// CAS `scheduled -> uploading` for rows due at or before `now`.
    async fn pop_due_publish(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<PublishTask>>;
    async fn mark_publish(
        &self,
        publish_id: Uuid,
        status: PublishStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> CoreResult<()>;
    /// Atomic; rejected once the row left `scheduled`.
    async fn reschedule_publish(
        &self,
        publish_id: Uuid,
        new_time: DateTime<Utc>,
    ) -> CoreResult<()>;
    async fn cancel_publish(&self, publish_id: Uuid) -> CoreResult<()>;
    /// Cancels the task's still-deferred publishes; returns their ids.
    async fn cancel_scheduled_publishes_for_task(&self, task_id: Uuid) -> CoreResult<Vec<Uuid>>;
    /// Publish rows ever created for `(config, account)`; drives the
    /// round-robin cycle index.
    async fn count_publishes_for_account(
        &self,
        config_id: Uuid,
        account_id: Uuid,
    ) -> CoreResult<i64>;

    // Monitors
    async fn create_monitor(&self, monitor: Monitor) -> CoreResult<()>;
    async fn get_monitor(&self, monitor_id: Uuid) -> CoreResult<Monitor>;
    async fn list_monitors(&self, active_only: bool) -> CoreResult<Vec<Monitor>>;
    async fn update_monitor(&self, monitor: Monitor) -> CoreResult<()>;
    async fn set_monitor_active(&self, monitor_id: Uuid, active: bool) -> CoreResult<()>;
    async fn delete_monitor(&self, monitor_id: Uuid) -> CoreResult<()>;
    async fn record_monitor_check(&self, monitor_id: Uuid, at: DateTime<Utc>) -> CoreResult<()>;
    /// Returns `true` when the `(monitor_id, content_id)` pair was new.
    async fn insert_monitor_result(&self, result: MonitorResult) -> CoreResult<bool>;
    async fn list_unprocessed_results(&self, monitor_id: Uuid) -> CoreResult<Vec<MonitorResult>>;
    /// Atomic fan-out for one monitor result: a CAS on the `processed` flag
    /// and every task insert share one transaction, so a crash or a replay
    /// can never duplicate a config's task. Returns the number of tasks
    /// inserted; zero when the result was already processed (or unknown).
    async fn fan_out_monitor_result(
        &self,
        monitor_id: Uuid,
        content_id: &str,
        tasks: Vec<AutoPublishTask>,
    ) -> CoreResult<usize>;

    // Overview
    async fn overview_counts(&self) -> CoreResult<OverviewCounts>;
    async fn recent_tasks(&self, limit: usize) -> CoreResult<Vec<AutoPublishTask>>;
    async fn top_accounts(&self, limit: usize) -> CoreResult<Vec<AccountPublishCount>>;
}

/// Postgres 実装。スキーマは起動時に `migrate` で冪等に適用する。
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// `CREATE TABLE IF NOT EXISTS` のみで構成された冪等なブートストラップ。
    pub async fn migrate(&self) -> CoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

fn map_account(row: &PgRow) -> CoreResult<Account> {
    Ok(Account {
        account_id: row.try_get("account_id")?,
        display_name: row.try_get("display_name")?,
        profile_ref: row.try_get("profile_ref")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_group(row: &PgRow) -> CoreResult<AccountGroup> {
    let group_type_raw: String = row.try_get("group_type")?;
    Ok(AccountGroup {
        group_id: row.try_get("group_id")?,
        name: row.try_get("name")?,
        group_type: GroupType::from_str(&group_type_raw)
            .ok_or_else(|| CoreError::permanent(format!("bad group_type: {group_type_raw}")))?,
        description: row.try_get("description")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_member(row: &PgRow) -> CoreResult<GroupMember> {
    Ok(GroupMember {
        group_id: row.try_get("group_id")?,
        account_id: row.try_get("account_id")?,
        member_rank: row.try_get("member_rank")?,
        role: row.try_get("role")?,
    })
}

fn map_pipeline(row: &PgRow) -> CoreResult<PipelineDescriptor> {
    let status_raw: String = row.try_get("status")?;
    let platforms_json: Value = row.try_get("supported_platforms")?;
    Ok(PipelineDescriptor {
        pipeline_id: row.try_get("pipeline_id")?,
        display_name: row.try_get("display_name")?,
        type_tag: row.try_get("type_tag")?,
        implementation_ref: row.try_get("implementation_ref")?,
        parameter_schema: row.try_get("parameter_schema")?,
        supported_platforms: serde_json::from_value(platforms_json)
            .map_err(|e| CoreError::permanent(format!("bad supported_platforms: {e}")))?,
        version: row.try_get("version")?,
        status: PipelineStatus::from_str(&status_raw)
            .ok_or_else(|| CoreError::permanent(format!("bad pipeline status: {status_raw}")))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_config(row: &PgRow) -> CoreResult<PublishConfig> {
    let kind: String = row.try_get("trigger_kind")?;
    let trigger_config: Value = row.try_get("trigger_config")?;
    Ok(PublishConfig {
        config_id: row.try_get("config_id")?,
        name: row.try_get("name")?,
        group_id: row.try_get("group_id")?,
        pipeline_id: row.try_get("pipeline_id")?,
        trigger: TriggerSpec::from_parts(&kind, &trigger_config)?,
        strategy_id: row.try_get("strategy_id")?,
        priority: row.try_get("priority")?,
        active: row.try_get("active")?,
        pipeline_params: row.try_get("pipeline_params")?,
        publish_delay_secs: row.try_get("publish_delay_secs")?,
        last_fire: row.try_get("last_fire")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_slot(row: &PgRow) -> CoreResult<RingSlot> {
    let status_raw: String = row.try_get("status")?;
    let hour: i32 = row.try_get("slot_hour")?;
    let minute: i32 = row.try_get("slot_minute")?;
    Ok(RingSlot {
        slot_id: row.try_get("slot_id")?,
        config_id: row.try_get("config_id")?,
        account_id: row.try_get("account_id")?,
        slot_date: row.try_get("slot_date")?,
        slot_hour: hour.max(0) as u32,
        slot_minute: minute.max(0) as u32,
        slot_index: row.try_get("slot_index")?,
        status: SlotStatus::from_str(&status_raw)
            .ok_or_else(|| CoreError::permanent(format!("bad slot status: {status_raw}")))?,
        task_id: row.try_get("task_id")?,
    })
}

fn map_strategy(row: &PgRow) -> CoreResult<Strategy> {
    let kind_raw: String = row.try_get("kind")?;
    Ok(Strategy {
        strategy_id: row.try_get("strategy_id")?,
        name: row.try_get("name")?,
        kind: StrategyKind::from_str(&kind_raw)
            .ok_or_else(|| CoreError::permanent(format!("bad strategy kind: {kind_raw}")))?,
        parameters: row.try_get("parameters")?,
        active: row.try_get("active")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
    })
}

fn map_assignment(row: &PgRow) -> CoreResult<StrategyAssignment> {
    Ok(StrategyAssignment {
        assignment_id: row.try_get("assignment_id")?,
        strategy_id: row.try_get("strategy_id")?,
        group_id: row.try_get("group_id")?,
        variant_name: row.try_get("variant_name")?,
        payload: row.try_get("payload")?,
        weight: row.try_get("weight")?,
        is_control: row.try_get("is_control")?,
    })
}

fn map_task(row: &PgRow) -> CoreResult<AutoPublishTask> {
    let pipeline_status_raw: String = row.try_get("pipeline_status")?;
    let publish_status_raw: String = row.try_get("publish_status")?;
    Ok(AutoPublishTask {
        task_id: row.try_get("task_id")?,
        config_id: row.try_get("config_id")?,
        group_id: row.try_get("group_id")?,
        account_id: row.try_get("account_id")?,
        pipeline_id: row.try_get("pipeline_id")?,
        slot_id: row.try_get("slot_id")?,
        strategy_id: row.try_get("strategy_id")?,
        variant_name: row.try_get("variant_name")?,
        pipeline_status: TaskPipelineStatus::from_str(&pipeline_status_raw).ok_or_else(|| {
            CoreError::permanent(format!("bad pipeline_status: {pipeline_status_raw}"))
        })?,
        publish_status: TaskPublishStatus::from_str(&publish_status_raw).ok_or_else(|| {
            CoreError::permanent(format!("bad publish_status: {publish_status_raw}"))
        })?,
        pipeline_result: row.try_get("pipeline_result")?,
        publish_result: row.try_get("publish_result")?,
        pipeline_params: row.try_get("pipeline_params")?,
        priority: row.try_get("priority")?,
        retry_count: row.try_get("retry_count")?,
        error: row.try_get("error")?,
        origin_task_id: row.try_get("origin_task_id")?,
        created_at: row.try_get("created_at")?,
        scheduled_time: row.try_get("scheduled_time")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn map_publish(row: &PgRow) -> CoreResult<PublishTask> {
    let status_raw: String = row.try_get("status")?;
    let tags_json: Value = row.try_get("tags")?;
    Ok(PublishTask {
        publish_id: row.try_get("publish_id")?,
        task_id: row.try_get("task_id")?,
        account_id: row.try_get("account_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        tags: serde_json::from_value(tags_json)
            .map_err(|e| CoreError::permanent(format!("bad tags: {e}")))?,
        thumbnail_ref: row.try_get("thumbnail_ref")?,
        privacy: row.try_get("privacy")?,
        video_ref: row.try_get("video_ref")?,
        status: PublishStatus::from_str(&status_raw)
            .ok_or_else(|| CoreError::permanent(format!("bad publish status: {status_raw}")))?,
        scheduled_time: row.try_get("scheduled_time")?,
        is_scheduled: row.try_get("is_scheduled")?,
        retry_count: row.try_get("retry_count")?,
        error: row.try_get("error")?,
        platform_video_id: row.try_get("platform_video_id")?,
        platform_url: row.try_get("platform_url")?,
        variant_name: row.try_get("variant_name")?,
        origin_publish_id: row.try_get("origin_publish_id")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn map_monitor(row: &PgRow) -> CoreResult<Monitor> {
    let type_raw: String = row.try_get("monitor_type")?;
    Ok(Monitor {
        monitor_id: row.try_get("monitor_id")?,
        platform: row.try_get("platform")?,
        monitor_type: MonitorType::from_str(&type_raw)
            .ok_or_else(|| CoreError::permanent(format!("bad monitor_type: {type_raw}")))?,
        target_identifier: row.try_get("target_identifier")?,
        check_interval_secs: row.try_get("check_interval_secs")?,
        last_check: row.try_get("last_check")?,
        active: row.try_get("active")?,
        config: row.try_get("config")?,
    })
}

/// Task insert against an explicit connection, shared by the plain insert
/// and the transactional monitor fan-out.
async fn insert_task_on(
    conn: &mut sqlx::PgConnection,
    task: &AutoPublishTask,
) -> CoreResult<()> {
    sqlx::query(
        r"
        INSERT INTO auto_publish_tasks
            (task_id, config_id, group_id, account_id, pipeline_id, slot_id,
             strategy_id, variant_name, pipeline_status, publish_status,
             pipeline_result, publish_result, pipeline_params, priority,
             retry_count, error, origin_task_id, created_at, scheduled_time,
             started_at, completed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
        ",
    )
    .bind(task.task_id)
    .bind(task.config_id)
    .bind(task.group_id)
    .bind(task.account_id)
    .bind(&task.pipeline_id)
    .bind(task.slot_id)
    .bind(task.strategy_id)
    .bind(&task.variant_name)
    .bind(task.pipeline_status.as_str())
    .bind(task.publish_status.as_str())
    .bind(&task.pipeline_result)
    .bind(&task.publish_result)
    .bind(&task.pipeline_params)
    .bind(task.priority)
    .bind(task.retry_count)
    .bind(&task.error)
    .bind(task.origin_task_id)
    .bind(task.created_at)
    .bind(task.scheduled_time)
    .bind(task.started_at)
    .bind(task.completed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn map_monitor_result(row: &PgRow) -> CoreResult<MonitorResult> {
    Ok(MonitorResult {
        monitor_id: row.try_get("monitor_id")?,
        content_id: row.try_get("content_id")?,
        title: row.try_get("title")?,
        payload: row.try_get("payload")?,
        processed: row.try_get("processed")?,
        captured_at: row.try_get("captured_at")?,
    })
}

#[async_trait]
impl AutoPublishStore for PgStore {
    async fn upsert_account(&self, account: Account) -> CoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO accounts (account_id, display_name, profile_ref, active, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (account_id) DO UPDATE
            SET display_name = EXCLUDED.display_name,
                profile_ref = EXCLUDED.profile_ref,
                active = EXCLUDED.active
            ",
        )
        .bind(account.account_id)
        .bind(&account.display_name)
        .bind(&account.profile_ref)
        .bind(account.active)
        .bind(account.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_account(&self, account_id: Uuid) -> CoreResult<Account> {
        let row = sqlx::query("SELECT * FROM accounts WHERE account_id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("account {account_id}")))?;
        map_account(&row)
    }

    async fn list_accounts(&self) -> CoreResult<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_account).collect()
    }

    async fn create_group(&self, group: AccountGroup) -> CoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO account_groups (group_id, name, group_type, description, active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(group.group_id)
        .bind(&group.name)
        .bind(group.group_type.as_str())
        .bind(&group.description)
        .bind(group.active)
        .bind(group.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_group(&self, group_id: Uuid) -> CoreResult<AccountGroup> {
        let row = sqlx::query("SELECT * FROM account_groups WHERE group_id = $1")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("group {group_id}")))?;
        map_group(&row)
    }

    async fn list_groups(&self) -> CoreResult<Vec<AccountGroup>> {
        let rows = sqlx::query("SELECT * FROM account_groups ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_group).collect()
    }

    async fn update_group(&self, group: AccountGroup) -> CoreResult<()> {
        let result = sqlx::query(
            r"
            UPDATE account_groups
            SET name = $2, group_type = $3, description = $4, active = $5
            WHERE group_id = $1
            ",
        )
        .bind(group.group_id)
        .bind(&group.name)
        .bind(group.group_type.as_str())
        .bind(&group.description)
        .bind(group.active)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("group {}", group.group_id)));
        }
        Ok(())
    }

    async fn delete_group(&self, group_id: Uuid) -> CoreResult<()> {
        let result = sqlx::query("DELETE FROM account_groups WHERE group_id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("group {group_id}")));
        }
        Ok(())
    }

    async fn add_group_members(
        &self,
        group_id: Uuid,
        members: Vec<GroupMember>,
    ) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for member in members {
            sqlx::query(
                r"
                INSERT INTO group_members (group_id, account_id, member_rank, role)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (group_id, account_id) DO UPDATE
                SET member_rank = EXCLUDED.member_rank, role = EXCLUDED.role
                ",
            )
            .bind(group_id)
            .bind(member.account_id)
            .bind(member.member_rank)
            .bind(&member.role)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove_group_member(&self, group_id: Uuid, account_id: Uuid) -> CoreResult<()> {
        let result =
            sqlx::query("DELETE FROM group_members WHERE group_id = $1 AND account_id = $2")
                .bind(group_id)
                .bind(account_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!(
                "member {account_id} of group {group_id}"
            )));
        }
        Ok(())
    }

    async fn list_group_members(&self, group_id: Uuid) -> CoreResult<Vec<GroupMember>> {
        let rows = sqlx::query(
            "SELECT * FROM group_members WHERE group_id = $1 ORDER BY member_rank ASC",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_member).collect()
    }

    async fn list_active_group_accounts(&self, group_id: Uuid) -> CoreResult<Vec<Account>> {
        let rows = sqlx::query(
            r"
            SELECT a.*
            FROM group_members m
            JOIN accounts a ON a.account_id = m.account_id
            WHERE m.group_id = $1 AND a.active
            ORDER BY m.member_rank ASC
            ",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_account).collect()
    }

    async fn upsert_pipeline(&self, descriptor: PipelineDescriptor) -> CoreResult<()> {
        let platforms = serde_json::to_value(&descriptor.supported_platforms)
            .map_err(|e| CoreError::permanent(format!("platforms serialization: {e}")))?;
        sqlx::query(
            r"
            INSERT INTO pipelines
                (pipeline_id, display_name, type_tag, implementation_ref, parameter_schema,
                 supported_platforms, version, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (pipeline_id) DO UPDATE
            SET display_name = EXCLUDED.display_name,
                type_tag = EXCLUDED.type_tag,
                implementation_ref = EXCLUDED.implementation_ref,
                parameter_schema = EXCLUDED.parameter_schema,
                supported_platforms = EXCLUDED.supported_platforms,
                version = EXCLUDED.version,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(&descriptor.pipeline_id)
        .bind(&descriptor.display_name)
        .bind(&descriptor.type_tag)
        .bind(&descriptor.implementation_ref)
        .bind(&descriptor.parameter_schema)
        .bind(platforms)
        .bind(&descriptor.version)
        .bind(descriptor.status.as_str())
        .bind(descriptor.created_at)
        .bind(descriptor.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_pipeline(&self, pipeline_id: &str) -> CoreResult<PipelineDescriptor> {
        let row = sqlx::query("SELECT * FROM pipelines WHERE pipeline_id = $1")
            .bind(pipeline_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("pipeline {pipeline_id}")))?;
        map_pipeline(&row)
    }

    async fn list_pipelines(&self, filter: PipelineFilter) -> CoreResult<Vec<PipelineDescriptor>> {
        let rows = sqlx::query("SELECT * FROM pipelines ORDER BY pipeline_id ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut pipelines = Vec::new();
        for row in &rows {
            let descriptor = map_pipeline(row)?;
            if let Some(type_tag) = &filter.type_tag {
                if descriptor.type_tag != *type_tag {
                    continue;
                }
            }
            if let Some(platform) = &filter.platform {
                if !descriptor.supported_platforms.contains(platform) {
                    continue;
                }
            }
            if let Some(status) = filter.status {
                if descriptor.status != status {
                    continue;
                }
            }
            pipelines.push(descriptor);
        }
        Ok(pipelines)
    }

    async fn delete_pipeline(&self, pipeline_id: &str) -> CoreResult<()> {
        let result = sqlx::query("DELETE FROM pipelines WHERE pipeline_id = $1")
            .bind(pipeline_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("pipeline {pipeline_id}")));
        }
        Ok(())
    }

    async fn create_config(&self, config: PublishConfig) -> CoreResult<()> {
        let trigger_config = config.trigger.config_value()?;
        sqlx::query(
            r"
            INSERT INTO publish_configs
                (config_id, name, group_id, pipeline_id, trigger_kind, trigger_config,
                 strategy_id, priority, active, pipeline_params, publish_delay_secs,
                 last_fire, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ",
        )
        .bind(config.config_id)
        .bind(&config.name)
        .bind(config.group_id)
        .bind(&config.pipeline_id)
        .bind(config.trigger.kind_str())
        .bind(trigger_config)
        .bind(config.strategy_id)
        .bind(config.priority)
        .bind(config.active)
        .bind(&config.pipeline_params)
        .bind(config.publish_delay_secs)
        .bind(config.last_fire)
        .bind(config.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_config(&self, config_id: Uuid) -> CoreResult<PublishConfig> {
        let row = sqlx::query("SELECT * FROM publish_configs WHERE config_id = $1")
            .bind(config_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("config {config_id}")))?;
        map_config(&row)
    }

    async fn list_configs(&self, active_only: bool) -> CoreResult<Vec<PublishConfig>> {
        let rows = if active_only {
            sqlx::query("SELECT * FROM publish_configs WHERE active ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT * FROM publish_configs ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?
        };
        rows.iter().map(map_config).collect()
    }

    async fn update_config(&self, config: PublishConfig) -> CoreResult<()> {
        let trigger_config = config.trigger.config_value()?;
        let result = sqlx::query(
            r"
            UPDATE publish_configs
            SET name = $2, group_id = $3, pipeline_id = $4, trigger_kind = $5,
                trigger_config = $6, strategy_id = $7, priority = $8, active = $9,
                pipeline_params = $10, publish_delay_secs = $11
            WHERE config_id = $1
            ",
        )
        .bind(config.config_id)
        .bind(&config.name)
        .bind(config.group_id)
        .bind(&config.pipeline_id)
        .bind(config.trigger.kind_str())
        .bind(trigger_config)
        .bind(config.strategy_id)
        .bind(config.priority)
        .bind(config.active)
        .bind(&config.pipeline_params)
        .bind(config.publish_delay_secs)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("config {}", config.config_id)));
        }
        Ok(())
    }

    async fn set_config_active(&self, config_id: Uuid, active: bool) -> CoreResult<()> {
        let result = sqlx::query("UPDATE publish_configs SET active = $2 WHERE config_id = $1")
            .bind(config_id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("config {config_id}")));
        }
        Ok(())
    }

    async fn delete_config(&self, config_id: Uuid) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r"
            UPDATE auto_publish_tasks
            SET pipeline_status = 'cancelled', completed_at = NOW()
            WHERE config_id = $1 AND pipeline_status = 'pending'
            ",
        )
        .bind(config_id)
        .execute(&mut *tx)
        .await?;
        // ring_slots cascade via the foreign key.
        let result = sqlx::query("DELETE FROM publish_configs WHERE config_id = $1")
            .bind(config_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(CoreError::not_found(format!("config {config_id}")));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_config_fire(
        &self,
        config_id: Uuid,
        last_fire: DateTime<Utc>,
    ) -> CoreResult<()> {
        sqlx::query("UPDATE publish_configs SET last_fire = $2 WHERE config_id = $1")
            .bind(config_id)
            .bind(last_fire)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_slot(&self, slot: RingSlot) -> CoreResult<RingSlot> {
        let row = sqlx::query(
            r"
            INSERT INTO ring_slots
                (slot_id, config_id, account_id, slot_date, slot_hour, slot_minute,
                 slot_index, status, task_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', NULL)
            ON CONFLICT (config_id, slot_date, slot_hour, slot_minute, account_id) DO UPDATE
            SET slot_index = CASE
                    WHEN ring_slots.status = 'pending' THEN EXCLUDED.slot_index
                    ELSE ring_slots.slot_index
                END
            RETURNING *
            ",
        )
        .bind(slot.slot_id)
        .bind(slot.config_id)
        .bind(slot.account_id)
        .bind(slot.slot_date)
        .bind(slot.slot_hour as i32)
        .bind(slot.slot_minute as i32)
        .bind(slot.slot_index)
        .fetch_one(&self.pool)
        .await?;
        map_slot(&row)
    }

    async fn list_slots(&self, config_id: Uuid, date: NaiveDate) -> CoreResult<Vec<RingSlot>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM ring_slots
            WHERE config_id = $1 AND slot_date = $2
            ORDER BY slot_hour ASC, slot_minute ASC, slot_index ASC
            ",
        )
        .bind(config_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_slot).collect()
    }

    async fn next_pending_slot(
        &self,
        config_id: Uuid,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<RingSlot>> {
        let row = sqlx::query(
            r"
            SELECT * FROM ring_slots
            WHERE config_id = $1
              AND status = 'pending'
              AND (slot_date + make_interval(hours => slot_hour, mins => slot_minute)) >= $2
            ORDER BY slot_date ASC, slot_hour ASC, slot_minute ASC, slot_index ASC
            LIMIT 1
            ",
        )
        .bind(config_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_slot).transpose()
    }

    async fn bind_slot_to_task(&self, slot_id: Uuid, task_id: Uuid) -> CoreResult<()> {
        let result = sqlx::query(
            r"
            UPDATE ring_slots
            SET status = 'scheduled', task_id = $2
            WHERE slot_id = $1 AND status = 'pending'
            ",
        )
        .bind(slot_id)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::conflict(format!(
                "slot {slot_id} is not pending"
            )));
        }
        Ok(())
    }

    async fn resolve_slot(&self, slot_id: Uuid, status: SlotStatus) -> CoreResult<()> {
        sqlx::query("UPDATE ring_slots SET status = $2 WHERE slot_id = $1")
            .bind(slot_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_strategy(&self, strategy: Strategy) -> CoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO strategies
                (strategy_id, name, kind, parameters, active, start_date, end_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(strategy.strategy_id)
        .bind(&strategy.name)
        .bind(strategy.kind.as_str())
        .bind(&strategy.parameters)
        .bind(strategy.active)
        .bind(strategy.start_date)
        .bind(strategy.end_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_strategy(&self, strategy_id: Uuid) -> CoreResult<Strategy> {
        let row = sqlx::query("SELECT * FROM strategies WHERE strategy_id = $1")
            .bind(strategy_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("strategy {strategy_id}")))?;
        map_strategy(&row)
    }

    async fn list_strategies(&self) -> CoreResult<Vec<Strategy>> {
        let rows = sqlx::query("SELECT * FROM strategies ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_strategy).collect()
    }

    async fn update_strategy(&self, strategy: Strategy) -> CoreResult<()> {
        let result = sqlx::query(
            r"
            UPDATE strategies
            SET name = $2, kind = $3, parameters = $4, active = $5,
                start_date = $6, end_date = $7
            WHERE strategy_id = $1
            ",
        )
        .bind(strategy.strategy_id)
        .bind(&strategy.name)
        .bind(strategy.kind.as_str())
        .bind(&strategy.parameters)
        .bind(strategy.active)
        .bind(strategy.start_date)
        .bind(strategy.end_date)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!(
                "strategy {}",
                strategy.strategy_id
            )));
        }
        Ok(())
    }

    async fn delete_strategy(&self, strategy_id: Uuid) -> CoreResult<()> {
        let result = sqlx::query("DELETE FROM strategies WHERE strategy_id = $1")
            .bind(strategy_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("strategy {strategy_id}")));
        }
        Ok(())
    }

    async fn upsert_assignment(&self, assignment: StrategyAssignment) -> CoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO strategy_assignments
                (assignment_id, strategy_id, group_id, variant_name, payload, weight, is_control)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (strategy_id, group_id, variant_name) DO UPDATE
            SET payload = EXCLUDED.payload,
                weight = EXCLUDED.weight,
                is_control = EXCLUDED.is_control
            ",
        )
        .bind(assignment.assignment_id)
        .bind(assignment.strategy_id)
        .bind(assignment.group_id)
        .bind(&assignment.variant_name)
        .bind(&assignment.payload)
        .bind(assignment.weight)
        .bind(assignment.is_control)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_assignments(
        &self,
        strategy_id: Uuid,
        group_id: Uuid,
    ) -> CoreResult<Vec<StrategyAssignment>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM strategy_assignments
            WHERE strategy_id = $1 AND group_id = $2
            ORDER BY variant_name ASC
            ",
        )
        .bind(strategy_id)
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_assignment).collect()
    }

    async fn insert_task(&self, task: AutoPublishTask) -> CoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_task_on(&mut conn, &task).await
    }

    async fn get_task(&self, task_id: Uuid) -> CoreResult<AutoPublishTask> {
        let row = sqlx::query("SELECT * FROM auto_publish_tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("task {task_id}")))?;
        map_task(&row)
    }

    async fn list_tasks(&self, filter: TaskFilter) -> CoreResult<Vec<AutoPublishTask>> {
        let limit = filter.limit.unwrap_or(100) as i64;
        let rows = sqlx::query(
            r"
            SELECT * FROM auto_publish_tasks
            WHERE ($1::uuid IS NULL OR config_id = $1)
              AND ($2::text IS NULL OR pipeline_status = $2)
              AND ($3::text IS NULL OR publish_status = $3)
            ORDER BY created_at DESC
            LIMIT $4
            ",
        )
        .bind(filter.config_id)
        .bind(filter.pipeline_status.map(TaskPipelineStatus::as_str))
        .bind(filter.publish_status.map(TaskPublishStatus::as_str))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_task).collect()
    }

    async fn claim_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<AutoPublishTask>> {
        // CAS on status; SKIP LOCKED keeps concurrent workers from
        // double-claiming the same rows.
        let rows = sqlx::query(
            r"
            WITH due AS (
                SELECT task_id FROM auto_publish_tasks
                WHERE pipeline_status = 'pending' AND scheduled_time <= $1
                ORDER BY priority DESC, scheduled_time ASC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE auto_publish_tasks t
            SET pipeline_status = 'running', started_at = $1
            FROM due
            WHERE t.task_id = due.task_id
            RETURNING t.*
            ",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut tasks: Vec<AutoPublishTask> =
            rows.iter().map(map_task).collect::<CoreResult<_>>()?;
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_time.cmp(&b.scheduled_time))
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    async fn record_pipeline_result(
        &self,
        task_id: Uuid,
        status: TaskPipelineStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> CoreResult<()> {
        let affected = sqlx::query(
            r"
            UPDATE auto_publish_tasks
            SET pipeline_status = $2,
                pipeline_result = COALESCE($3, pipeline_result),
                error = $4,
                completed_at = CASE WHEN $2 IN ('completed', 'failed', 'cancelled')
                                    THEN NOW() ELSE completed_at END
            WHERE task_id = $1
            ",
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(&result)
        .bind(&error)
        .execute(&self.pool)
        .await?;
        if affected.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("task {task_id}")));
        }
        Ok(())
    }

    async fn set_task_publish_status(
        &self,
        task_id: Uuid,
        status: TaskPublishStatus,
        result: Option<Value>,
    ) -> CoreResult<()> {
        let affected = sqlx::query(
            r"
            UPDATE auto_publish_tasks
            SET publish_status = $2, publish_result = COALESCE($3, publish_result)
            WHERE task_id = $1
            ",
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(&result)
        .execute(&self.pool)
        .await?;
        if affected.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("task {task_id}")));
        }
        Ok(())
    }

    async fn reschedule_task_retry(
        &self,
        task_id: Uuid,
        scheduled_time: DateTime<Utc>,
        error: String,
    ) -> CoreResult<()> {
        let affected = sqlx::query(
            r"
            UPDATE auto_publish_tasks
            SET pipeline_status = 'pending',
                scheduled_time = $2,
                retry_count = retry_count + 1,
                error = $3,
                started_at = NULL
            WHERE task_id = $1
            ",
        )
        .bind(task_id)
        .bind(scheduled_time)
        .bind(&error)
        .execute(&self.pool)
        .await?;
        if affected.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("task {task_id}")));
        }
        Ok(())
    }

    async fn cancel_task(&self, task_id: Uuid) -> CoreResult<AutoPublishTask> {
        let row = sqlx::query(
            r"
            UPDATE auto_publish_tasks
            SET pipeline_status = 'cancelled',
                publish_status = CASE WHEN publish_status IN ('pending', 'scheduled')
                                      THEN 'cancelled' ELSE publish_status END,
                completed_at = NOW()
            WHERE task_id = $1 AND pipeline_status IN ('pending', 'running')
            RETURNING *
            ",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => map_task(&row),
            None => {
                // Distinguish a missing row from a disallowed transition.
                let exists =
                    sqlx::query("SELECT 1 FROM auto_publish_tasks WHERE task_id = $1")
                        .bind(task_id)
                        .fetch_optional(&self.pool)
                        .await?
                        .is_some();
                if exists {
                    Err(CoreError::conflict(format!(
                        "task {task_id} is not cancellable"
                    )))
                } else {
                    Err(CoreError::not_found(format!("task {task_id}")))
                }
            }
        }
    }

    async fn recover_stale_running(
        &self,
        cutoff: DateTime<Utc>,
    ) -> CoreResult<Vec<AutoPublishTask>> {
        let rows = sqlx::query(
            r"
            UPDATE auto_publish_tasks
            SET pipeline_status = 'failed',
                error = 'stale running task recovered after restart'
            WHERE pipeline_status = 'running' AND started_at < $1
            RETURNING *
            ",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_task).collect()
    }

    async fn enqueue_publish(&self, publish: PublishTask) -> CoreResult<()> {
        let tags = serde_json::to_value(&publish.tags)
            .map_err(|e| CoreError::permanent(format!("tags serialization: {e}")))?;
        sqlx::query(
            r"
            INSERT INTO publish_tasks
                (publish_id, task_id, account_id, title, description, tags,
                 thumbnail_ref, privacy, video_ref, status, scheduled_time,
                 is_scheduled, retry_count, error, platform_video_id, platform_url,
                 variant_name, origin_publish_id, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ",
        )
        .bind(publish.publish_id)
        .bind(publish.task_id)
        .bind(publish.account_id)
        .bind(&publish.title)
        .bind(&publish.description)
        .bind(tags)
        .bind(&publish.thumbnail_ref)
        .bind(&publish.privacy)
        .bind(&publish.video_ref)
        .bind(publish.status.as_str())
        .bind(publish.scheduled_time)
        .bind(publish.is_scheduled)
        .bind(publish.retry_count)
        .bind(&publish.error)
        .bind(&publish.platform_video_id)
        .bind(&publish.platform_url)
        .bind(&publish.variant_name)
        .bind(publish.origin_publish_id)
        .bind(publish.created_at)
        .bind(publish.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_publish(&self, publish_id: Uuid) -> CoreResult<PublishTask> {
        let row = sqlx::query("SELECT * FROM publish_tasks WHERE publish_id = $1")
            .bind(publish_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("publish task {publish_id}")))?;
        map_publish(&row)
    }

    async fn list_publishes(&self, filter: PublishFilter) -> CoreResult<Vec<PublishTask>> {
        let limit = filter.limit.unwrap_or(100) as i64;
        let rows = sqlx::query(
            r"
            SELECT * FROM publish_tasks
            WHERE ($1::uuid IS NULL OR task_id = $1)
              AND ($2::uuid IS NULL OR account_id = $2)
              AND ($3::text IS NULL OR status = $3)
            ORDER BY created_at DESC
            LIMIT $4
            ",
        )
        .bind(filter.task_id)
        .bind(filter.account_id)
        .bind(filter.status.map(PublishStatus::as_str))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_publish).collect()
    }

    async fn load_scheduled_publishes(&self) -> CoreResult<Vec<PublishTask>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM publish_tasks
            WHERE status = 'scheduled'
            ORDER BY scheduled_time ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_publish).collect()
    }

    async fn pop_due_publish(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<PublishTask>> {
        let rows = sqlx::query(
            r"
            WITH due AS (
                SELECT publish_id FROM publish_tasks
                WHERE status = 'scheduled' AND scheduled_time <= $1
                ORDER BY scheduled_time ASC, publish_id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE publish_tasks p
            SET status = 'uploading'
            FROM due
            WHERE p.publish_id = due.publish_id
            RETURNING p.*
            ",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut publishes: Vec<PublishTask> =
            rows.iter().map(map_publish).collect::<CoreResult<_>>()?;
        publishes.sort_by(|a, b| {
            a.scheduled_time
                .cmp(&b.scheduled_time)
                .then(a.publish_id.cmp(&b.publish_id))
        });
        Ok(publishes)
    }

    async fn mark_publish(
        &self,
        publish_id: Uuid,
        status: PublishStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> CoreResult<()> {
        let video_id = result
            .as_ref()
            .and_then(|v| v.get("video_id"))
            .and_then(Value::as_str)
            .map(String::from);
        let url = result
            .as_ref()
            .and_then(|v| v.get("url"))
            .and_then(Value::as_str)
            .map(String::from);
        let affected = sqlx::query(
            r"
            UPDATE publish_tasks
            SET status = $2,
                platform_video_id = COALESCE($3, platform_video_id),
                platform_url = COALESCE($4, platform_url),
                error = $5,
                completed_at = CASE WHEN $2 IN ('success', 'failed', 'cancelled')
                                    THEN NOW() ELSE completed_at END
            WHERE publish_id = $1
            ",
        )
        .bind(publish_id)
        .bind(status.as_str())
        .bind(video_id)
        .bind(url)
        .bind(&error)
        .execute(&self.pool)
        .await?;
        if affected.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("publish task {publish_id}")));
        }
        Ok(())
    }

    async fn reschedule_publish(
        &self,
        publish_id: Uuid,
        new_time: DateTime<Utc>,
    ) -> CoreResult<()> {
        let affected = sqlx::query(
            r"
            UPDATE publish_tasks
            SET scheduled_time = $2
            WHERE publish_id = $1 AND status = 'scheduled'
            ",
        )
        .bind(publish_id)
        .bind(new_time)
        .execute(&self.pool)
        .await?;
        if affected.rows_affected() == 0 {
            return Err(CoreError::conflict(format!(
                "publish task {publish_id} is not reschedulable"
            )));
        }
        Ok(())
    }

    async fn cancel_publish(&self, publish_id: Uuid) -> CoreResult<()> {
        let affected = sqlx::query(
            r"
            UPDATE publish_tasks
            SET status = 'cancelled', completed_at = NOW()
            WHERE publish_id = $1 AND status IN ('pending', 'scheduled')
            ",
        )
        .bind(publish_id)
        .execute(&self.pool)
        .await?;
        if affected.rows_affected() == 0 {
            return Err(CoreError::conflict(format!(
                "publish task {publish_id} is not cancellable"
            )));
        }
        Ok(())
    }

    async fn cancel_scheduled_publishes_for_task(&self, task_id: Uuid) -> CoreResult<Vec<Uuid>> {
        let rows = sqlx::query(
            r"
            UPDATE publish_tasks
            SET status = 'cancelled', completed_at = NOW()
            WHERE task_id = $1 AND status = 'scheduled'
            RETURNING publish_id
            ",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("publish_id").map_err(CoreError::from))
            .collect()
    }

    async fn count_publishes_for_account(
        &self,
        config_id: Uuid,
        account_id: Uuid,
    ) -> CoreResult<i64> {
        let row = sqlx::query(
            r"
            SELECT COUNT(*) AS n
            FROM publish_tasks p
            JOIN auto_publish_tasks t ON t.task_id = p.task_id
            WHERE t.config_id = $1 AND p.account_id = $2
            ",
        )
        .bind(config_id)
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    async fn create_monitor(&self, monitor: Monitor) -> CoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO monitors
                (monitor_id, platform, monitor_type, target_identifier,
                 check_interval_secs, last_check, active, config)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(monitor.monitor_id)
        .bind(&monitor.platform)
        .bind(monitor.monitor_type.as_str())
        .bind(&monitor.target_identifier)
        .bind(monitor.check_interval_secs)
        .bind(monitor.last_check)
        .bind(monitor.active)
        .bind(&monitor.config)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_monitor(&self, monitor_id: Uuid) -> CoreResult<Monitor> {
        let row = sqlx::query("SELECT * FROM monitors WHERE monitor_id = $1")
            .bind(monitor_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("monitor {monitor_id}")))?;
        map_monitor(&row)
    }

    async fn list_monitors(&self, active_only: bool) -> CoreResult<Vec<Monitor>> {
        let rows = if active_only {
            sqlx::query("SELECT * FROM monitors WHERE active ORDER BY monitor_id ASC")
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT * FROM monitors ORDER BY monitor_id ASC")
                .fetch_all(&self.pool)
                .await?
        };
        rows.iter().map(map_monitor).collect()
    }

    async fn update_monitor(&self, monitor: Monitor) -> CoreResult<()> {
        let result = sqlx::query(
            r"
            UPDATE monitors
            SET platform = $2, monitor_type = $3, target_identifier = $4,
                check_interval_secs = $5, active = $6, config = $7
            WHERE monitor_id = $1
            ",
        )
        .bind(monitor.monitor_id)
        .bind(&monitor.platform)
        .bind(monitor.monitor_type.as_str())
        .bind(&monitor.target_identifier)
        .bind(monitor.check_interval_secs)
        .bind(monitor.active)
        .bind(&monitor.config)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!(
                "monitor {}",
                monitor.monitor_id
            )));
        }
        Ok(())
    }

    async fn set_monitor_active(&self, monitor_id: Uuid, active: bool) -> CoreResult<()> {
        let result = sqlx::query("UPDATE monitors SET active = $2 WHERE monitor_id = $1")
            .bind(monitor_id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("monitor {monitor_id}")));
        }
        Ok(())
    }

    async fn delete_monitor(&self, monitor_id: Uuid) -> CoreResult<()> {
        let result = sqlx::query("DELETE FROM monitors WHERE monitor_id = $1")
            .bind(monitor_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("monitor {monitor_id}")));
        }
        Ok(())
    }

    async fn record_monitor_check(&self, monitor_id: Uuid, at: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query("UPDATE monitors SET last_check = $2 WHERE monitor_id = $1")
            .bind(monitor_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_monitor_result(&self, result: MonitorResult) -> CoreResult<bool> {
        let inserted = sqlx::query(
            r"
            INSERT INTO monitor_results
                (monitor_id, content_id, title, payload, processed, captured_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (monitor_id, content_id) DO NOTHING
            ",
        )
        .bind(result.monitor_id)
        .bind(&result.content_id)
        .bind(&result.title)
        .bind(&result.payload)
        .bind(result.processed)
        .bind(result.captured_at)
        .execute(&self.pool)
        .await?;
        Ok(inserted.rows_affected() > 0)
    }

    async fn list_unprocessed_results(&self, monitor_id: Uuid) -> CoreResult<Vec<MonitorResult>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM monitor_results
            WHERE monitor_id = $1 AND NOT processed
            ORDER BY captured_at ASC
            ",
        )
        .bind(monitor_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_monitor_result).collect()
    }

    async fn fan_out_monitor_result(
        &self,
        monitor_id: Uuid,
        content_id: &str,
        tasks: Vec<AutoPublishTask>,
    ) -> CoreResult<usize> {
        let mut tx = self.pool.begin().await?;

        // Claim the result first; a concurrent poller (or a replay after a
        // crash) loses the CAS and inserts nothing.
        let claimed = sqlx::query(
            r"
            UPDATE monitor_results
            SET processed = TRUE
            WHERE monitor_id = $1 AND content_id = $2 AND NOT processed
            ",
        )
        .bind(monitor_id)
        .bind(content_id)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(0);
        }

        let count = tasks.len();
        for task in &tasks {
            insert_task_on(&mut tx, task).await?;
        }
        tx.commit().await?;
        Ok(count)
    }

    async fn overview_counts(&self) -> CoreResult<OverviewCounts> {
        let mut counts = OverviewCounts::default();

        let rows = sqlx::query(
            "SELECT pipeline_status, COUNT(*) AS n FROM auto_publish_tasks GROUP BY pipeline_status",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            counts
                .tasks_by_pipeline_status
                .push((row.try_get("pipeline_status")?, row.try_get("n")?));
        }

        let rows =
            sqlx::query("SELECT status, COUNT(*) AS n FROM publish_tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        for row in &rows {
            counts
                .publishes_by_status
                .push((row.try_get("status")?, row.try_get("n")?));
        }

        let rows = sqlx::query(
            r"
            SELECT split_part(error, ':', 1) AS code, COUNT(*) AS n
            FROM auto_publish_tasks
            WHERE pipeline_status = 'failed' AND error IS NOT NULL
            GROUP BY 1
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            counts
                .failures_by_code
                .push((row.try_get("code")?, row.try_get("n")?));
        }

        Ok(counts)
    }

    async fn recent_tasks(&self, limit: usize) -> CoreResult<Vec<AutoPublishTask>> {
        let rows = sqlx::query(
            "SELECT * FROM auto_publish_tasks ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_task).collect()
    }

    async fn top_accounts(&self, limit: usize) -> CoreResult<Vec<AccountPublishCount>> {
        let rows = sqlx::query(
            r"
            SELECT p.account_id, COALESCE(a.display_name, '') AS display_name, COUNT(*) AS n
            FROM publish_tasks p
            LEFT JOIN accounts a ON a.account_id = p.account_id
            WHERE p.status = 'success'
            GROUP BY p.account_id, a.display_name
            ORDER BY n DESC
            LIMIT $1
            ",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(AccountPublishCount {
                    account_id: row.try_get("account_id")?,
                    display_name: row.try_get("display_name")?,
                    success_count: row.try_get("n")?,
                })
            })
            .collect()
    }
}
