use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::trigger::schedule::TriggerSpec;

/// External account identity. The core only stores the handle the upload
/// transport understands plus an activation flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: Uuid,
    pub display_name: String,
    pub profile_ref: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    Production,
    Experiment,
    Test,
}

impl GroupType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            GroupType::Production => "production",
            GroupType::Experiment => "experiment",
            GroupType::Test => "test",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "production" => Some(GroupType::Production),
            "experiment" => Some(GroupType::Experiment),
            "test" => Some(GroupType::Test),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountGroup {
    pub group_id: Uuid,
    pub name: String,
    pub group_type: GroupType,
    pub description: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Membership link between a group and an account. `member_rank` fixes the
/// iteration order used by the ring scheduler and the variant resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: Uuid,
    pub account_id: Uuid,
    pub member_rank: i32,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Active,
    Deprecated,
    Testing,
}

impl PipelineStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStatus::Active => "active",
            PipelineStatus::Deprecated => "deprecated",
            PipelineStatus::Testing => "testing",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(PipelineStatus::Active),
            "deprecated" => Some(PipelineStatus::Deprecated),
            "testing" => Some(PipelineStatus::Testing),
            _ => None,
        }
    }
}

/// Registered content-producing pipeline. `implementation_ref` is opaque to
/// the core; the bundled runner treats it as an HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDescriptor {
    pub pipeline_id: String,
    pub display_name: String,
    pub type_tag: String,
    pub implementation_ref: String,
    pub parameter_schema: Value,
    pub supported_platforms: Vec<String>,
    pub version: String,
    pub status: PipelineStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineFilter {
    pub type_tag: Option<String>,
    pub platform: Option<String>,
    pub status: Option<PipelineStatus>,
}

/// Recipe for how, when and with which group a pipeline's output is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    pub config_id: Uuid,
    pub name: String,
    pub group_id: Uuid,
    pub pipeline_id: String,
    pub trigger: TriggerSpec,
    pub strategy_id: Option<Uuid>,
    pub priority: i32,
    pub active: bool,
    pub pipeline_params: Value,
    /// Delay between pipeline completion and the publish `scheduled_time`.
    /// `None` publishes immediately.
    pub publish_delay_secs: Option<i64>,
    pub last_fire: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Pending,
    Scheduled,
    Completed,
    Failed,
    Cancelled,
}

impl SlotStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SlotStatus::Pending => "pending",
            SlotStatus::Scheduled => "scheduled",
            SlotStatus::Completed => "completed",
            SlotStatus::Failed => "failed",
            SlotStatus::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SlotStatus::Pending),
            "scheduled" => Some(SlotStatus::Scheduled),
            "completed" => Some(SlotStatus::Completed),
            "failed" => Some(SlotStatus::Failed),
            "cancelled" => Some(SlotStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal slots are never reset by regeneration.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SlotStatus::Completed | SlotStatus::Failed | SlotStatus::Cancelled
        )
    }
}

/// One `(config, date, time, account)` tuple in the daily ring.
/// Unique on `(config_id, slot_date, slot_hour, slot_minute, account_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingSlot {
    pub slot_id: Uuid,
    pub config_id: Uuid,
    pub account_id: Uuid,
    pub slot_date: NaiveDate,
    pub slot_hour: u32,
    pub slot_minute: u32,
    pub slot_index: i32,
    pub status: SlotStatus,
    pub task_id: Option<Uuid>,
}

impl RingSlot {
    /// Absolute UTC instant of the slot.
    #[must_use]
    pub fn fire_time(&self) -> Option<DateTime<Utc>> {
        self.slot_date
            .and_hms_opt(self.slot_hour, self.slot_minute, 0)
            .map(|naive| naive.and_utc())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    AbTest,
    RoundRobin,
    Weighted,
}

impl StrategyKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::AbTest => "ab_test",
            StrategyKind::RoundRobin => "round_robin",
            StrategyKind::Weighted => "weighted",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ab_test" => Some(StrategyKind::AbTest),
            "round_robin" => Some(StrategyKind::RoundRobin),
            "weighted" => Some(StrategyKind::Weighted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub strategy_id: Uuid,
    pub name: String,
    pub kind: StrategyKind,
    pub parameters: Value,
    pub active: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// Per-variant payload attached to a `(strategy, group)` pair. The payload is
/// a metadata overlay (title/description templates, tags, thumbnail).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyAssignment {
    pub assignment_id: Uuid,
    pub strategy_id: Uuid,
    pub group_id: Uuid,
    pub variant_name: String,
    pub payload: Value,
    pub weight: f64,
    pub is_control: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPipelineStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskPipelineStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TaskPipelineStatus::Pending => "pending",
            TaskPipelineStatus::Running => "running",
            TaskPipelineStatus::Completed => "completed",
            TaskPipelineStatus::Failed => "failed",
            TaskPipelineStatus::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskPipelineStatus::Pending),
            "running" => Some(TaskPipelineStatus::Running),
            "completed" => Some(TaskPipelineStatus::Completed),
            "failed" => Some(TaskPipelineStatus::Failed),
            "cancelled" => Some(TaskPipelineStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPublishStatus {
    Pending,
    Scheduled,
    Published,
    Failed,
    Cancelled,
}

impl TaskPublishStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TaskPublishStatus::Pending => "pending",
            TaskPublishStatus::Scheduled => "scheduled",
            TaskPublishStatus::Published => "published",
            TaskPublishStatus::Failed => "failed",
            TaskPublishStatus::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskPublishStatus::Pending),
            "scheduled" => Some(TaskPublishStatus::Scheduled),
            "published" => Some(TaskPublishStatus::Published),
            "failed" => Some(TaskPublishStatus::Failed),
            "cancelled" => Some(TaskPublishStatus::Cancelled),
            _ => None,
        }
    }
}

/// A scheduled unit of work tying one pipeline invocation to one account and
/// one future time. `pipeline_status` and `publish_status` are independent
/// state machines run in sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoPublishTask {
    pub task_id: Uuid,
    pub config_id: Uuid,
    pub group_id: Uuid,
    pub account_id: Option<Uuid>,
    pub pipeline_id: String,
    pub slot_id: Option<Uuid>,
    pub strategy_id: Option<Uuid>,
    pub variant_name: Option<String>,
    pub pipeline_status: TaskPipelineStatus,
    pub publish_status: TaskPublishStatus,
    pub pipeline_result: Option<Value>,
    pub publish_result: Option<Value>,
    pub pipeline_params: Value,
    pub priority: i32,
    pub retry_count: i32,
    pub error: Option<String>,
    /// Set on rows minted by the explicit retry endpoint.
    pub origin_task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub scheduled_time: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AutoPublishTask {
    /// Fresh task row as the trigger layer creates it.
    #[must_use]
    pub fn from_trigger(
        config: &PublishConfig,
        scheduled_time: DateTime<Utc>,
        created_at: DateTime<Utc>,
        pipeline_params: Value,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            config_id: config.config_id,
            group_id: config.group_id,
            account_id: None,
            pipeline_id: config.pipeline_id.clone(),
            slot_id: None,
            strategy_id: config.strategy_id,
            variant_name: None,
            pipeline_status: TaskPipelineStatus::Pending,
            publish_status: TaskPublishStatus::Pending,
            pipeline_result: None,
            publish_result: None,
            pipeline_params,
            priority: config.priority,
            retry_count: 0,
            error: None,
            origin_task_id: None,
            created_at,
            scheduled_time,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub config_id: Option<Uuid>,
    pub pipeline_status: Option<TaskPipelineStatus>,
    pub publish_status: Option<TaskPublishStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishStatus {
    Pending,
    Scheduled,
    Uploading,
    Success,
    Failed,
    Cancelled,
}

impl PublishStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PublishStatus::Pending => "pending",
            PublishStatus::Scheduled => "scheduled",
            PublishStatus::Uploading => "uploading",
            PublishStatus::Success => "success",
            PublishStatus::Failed => "failed",
            PublishStatus::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PublishStatus::Pending),
            "scheduled" => Some(PublishStatus::Scheduled),
            "uploading" => Some(PublishStatus::Uploading),
            "success" => Some(PublishStatus::Success),
            "failed" => Some(PublishStatus::Failed),
            "cancelled" => Some(PublishStatus::Cancelled),
            _ => None,
        }
    }
}

/// One dispatchable upload with fully resolved metadata. Retries create new
/// rows linked through `origin_publish_id`; the original stays for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishTask {
    pub publish_id: Uuid,
    pub task_id: Uuid,
    pub account_id: Uuid,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub thumbnail_ref: Option<String>,
    pub privacy: String,
    pub video_ref: String,
    pub status: PublishStatus,
    pub scheduled_time: DateTime<Utc>,
    pub is_scheduled: bool,
    pub retry_count: i32,
    pub error: Option<String>,
    pub platform_video_id: Option<String>,
    pub platform_url: Option<String>,
    pub variant_name: Option<String>,
    pub origin_publish_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct PublishFilter {
    pub task_id: Option<Uuid>,
    pub account_id: Option<Uuid>,
    pub status: Option<PublishStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorType {
    Competitor,
    Trending,
    Keyword,
}

impl MonitorType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MonitorType::Competitor => "competitor",
            MonitorType::Trending => "trending",
            MonitorType::Keyword => "keyword",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "competitor" => Some(MonitorType::Competitor),
            "trending" => Some(MonitorType::Trending),
            "keyword" => Some(MonitorType::Keyword),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub monitor_id: Uuid,
    pub platform: String,
    pub monitor_type: MonitorType,
    pub target_identifier: String,
    pub check_interval_secs: i64,
    pub last_check: Option<DateTime<Utc>>,
    pub active: bool,
    pub config: Value,
}

/// Captured content from an external source. Unique on
/// `(monitor_id, content_id)`; the flag guards at-most-once fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorResult {
    pub monitor_id: Uuid,
    pub content_id: String,
    pub title: String,
    pub payload: Value,
    pub processed: bool,
    pub captured_at: DateTime<Utc>,
}

/// Aggregates for the overview endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OverviewCounts {
    pub tasks_by_pipeline_status: Vec<(String, i64)>,
    pub publishes_by_status: Vec<(String, i64)>,
    pub failures_by_code: Vec<(String, i64)>,
}

/// `(account_id, successful publish count)` ranking for the overview.
#[derive(Debug, Clone, Serialize)]
pub struct AccountPublishCount {
    pub account_id: Uuid,
    pub display_name: String,
    pub success_count: i64,
}
