//! Variant resolution for A/B and rotation experiments.
//!
//! Maps `(task, group member)` to a concrete publish metadata bundle. The
//! weighted and ab_test kinds sample from an rng seeded by
//! `(task_id, member_id)`, so resolution is reproducible; assignments are
//! pinned per publish task at fan-out time.

use std::sync::Arc;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

use crate::registry::PipelineOutcome;
use crate::store::AutoPublishStore;
use crate::store::models::{
    PublishConfig, Strategy, StrategyAssignment, StrategyKind,
};
use crate::util::error::{CoreError, CoreResult};

/// Metadata extracted from a pipeline outcome before any variant overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub thumbnail_ref: Option<String>,
    pub privacy: String,
    pub video_ref: String,
}

impl BaseMetadata {
    /// Pull the publishable fields out of a pipeline outcome. A missing video
    /// reference is a permanent failure: there is nothing to upload.
    pub fn from_outcome(outcome: &PipelineOutcome) -> CoreResult<Self> {
        let video_ref = outcome
            .artifacts
            .get("video")
            .or_else(|| outcome.artifacts.get("video_path"))
            .and_then(Value::as_str)
            .or_else(|| outcome.metadata.get("video_ref").and_then(Value::as_str))
            .ok_or_else(|| {
                CoreError::permanent("pipeline outcome carries no video reference")
            })?
            .to_string();

        let meta_str = |key: &str| {
            outcome
                .metadata
                .get(key)
                .and_then(Value::as_str)
                .map(String::from)
        };
        let tags = outcome
            .metadata
            .get("tags")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            title: meta_str("title").unwrap_or_else(|| "untitled".to_string()),
            description: meta_str("description").unwrap_or_default(),
            tags,
            thumbnail_ref: meta_str("thumbnail_ref"),
            privacy: meta_str("privacy").unwrap_or_else(|| "public".to_string()),
            video_ref,
        })
    }
}

/// A variant's metadata overlay, deserialized from the assignment payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariantOverlay {
    #[serde(default)]
    pub title_template: Option<String>,
    #[serde(default)]
    pub description_template: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub thumbnail_ref: Option<String>,
    #[serde(default)]
    pub privacy: Option<String>,
}

/// One resolved `(member, variant)` publish bundle.
#[derive(Debug, Clone)]
pub struct ResolvedPublish {
    pub account_id: Uuid,
    pub variant_name: Option<String>,
    pub metadata: BaseMetadata,
}

pub struct VariantResolver {
    store: Arc<dyn AutoPublishStore>,
}

impl VariantResolver {
    pub fn new(store: Arc<dyn AutoPublishStore>) -> Self {
        Self { store }
    }

    /// Resolve one publish bundle per active group member.
    pub async fn resolve(
        &self,
        config: &PublishConfig,
        task_id: Uuid,
        outcome: &PipelineOutcome,
    ) -> CoreResult<Vec<ResolvedPublish>> {
        let base = BaseMetadata::from_outcome(outcome)?;
        let members = self
            .store
            .list_active_group_accounts(config.group_id)
            .await?;
        if members.is_empty() {
            return Err(CoreError::conflict(format!(
                "group {} has no active accounts to publish to",
                config.group_id
            )));
        }

        let strategy = match config.strategy_id {
            Some(strategy_id) => {
                let strategy = self.store.get_strategy(strategy_id).await?;
                if strategy_applies(&strategy) {
                    let assignments = self
                        .store
                        .list_assignments(strategy_id, config.group_id)
                        .await?;
                    if assignments.is_empty() { None } else { Some((strategy, assignments)) }
                } else {
                    None
                }
            }
            None => None,
        };

        let Some((strategy, assignments)) = strategy else {
            return Ok(members
                .iter()
                .map(|member| ResolvedPublish {
                    account_id: member.account_id,
                    variant_name: None,
                    metadata: base.clone(),
                })
                .collect());
        };

        let mut picks: Vec<usize> = Vec::with_capacity(members.len());
        match strategy.kind {
            StrategyKind::RoundRobin => {
                let cycles = futures::future::try_join_all(members.iter().map(|member| {
                    self.store
                        .count_publishes_for_account(config.config_id, member.account_id)
                }))
                .await?;
                for (rank, cycle) in cycles.into_iter().enumerate() {
                    picks.push((rank + cycle.max(0) as usize) % assignments.len());
                }
            }
            StrategyKind::Weighted | StrategyKind::AbTest => {
                for member in &members {
                    picks.push(weighted_pick(
                        &assignments,
                        variant_seed(task_id, member.account_id),
                    ));
                }
                if strategy.kind == StrategyKind::AbTest && members.len() > 1 {
                    // Each cohort keeps at least one control assignment.
                    let control_idx = assignments.iter().position(|a| a.is_control);
                    if let Some(control_idx) = control_idx {
                        if !picks.iter().any(|idx| assignments[*idx].is_control) {
                            picks[0] = control_idx;
                        }
                    }
                }
            }
        }

        let context = render_context(outcome, &base);
        let mut resolved = Vec::with_capacity(members.len());
        for (member, pick) in members.iter().zip(picks) {
            let assignment = &assignments[pick];
            let overlay: VariantOverlay = serde_json::from_value(assignment.payload.clone())
                .map_err(|e| {
                    CoreError::bad_request(format!(
                        "variant {:?} payload is not a valid overlay: {e}",
                        assignment.variant_name
                    ))
                })?;
            resolved.push(ResolvedPublish {
                account_id: member.account_id,
                variant_name: Some(assignment.variant_name.clone()),
                metadata: apply_overlay(&base, &overlay, &context),
            });
        }
        Ok(resolved)
    }
}

fn strategy_applies(strategy: &Strategy) -> bool {
    if !strategy.active {
        return false;
    }
    let today = Utc::now().date_naive();
    if strategy.start_date.is_some_and(|d| today < d) {
        return false;
    }
    if strategy.end_date.is_some_and(|d| today > d) {
        return false;
    }
    true
}

fn variant_seed(task_id: Uuid, account_id: Uuid) -> u64 {
    let mut material = task_id.as_bytes().to_vec();
    material.extend_from_slice(account_id.as_bytes());
    xxh3_64(&material)
}

fn weighted_pick(assignments: &[StrategyAssignment], seed: u64) -> usize {
    let total: f64 = assignments.iter().map(|a| a.weight.max(0.0)).sum();
    if total <= 0.0 {
        return 0;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut x: f64 = rng.random_range(0.0..total);
    for (idx, assignment) in assignments.iter().enumerate() {
        let weight = assignment.weight.max(0.0);
        if x < weight {
            return idx;
        }
        x -= weight;
    }
    assignments.len() - 1
}

fn render_context(outcome: &PipelineOutcome, base: &BaseMetadata) -> Map<String, Value> {
    let mut context = outcome.metadata.clone();
    context.insert("title".to_string(), Value::String(base.title.clone()));
    context.insert(
        "description".to_string(),
        Value::String(base.description.clone()),
    );
    context
}

fn apply_overlay(
    base: &BaseMetadata,
    overlay: &VariantOverlay,
    context: &Map<String, Value>,
) -> BaseMetadata {
    let mut metadata = base.clone();
    if let Some(template) = &overlay.title_template {
        metadata.title = render_template(template, context);
    }
    if let Some(template) = &overlay.description_template {
        metadata.description = render_template(template, context);
    }
    for tag in &overlay.tags {
        if !metadata.tags.contains(tag) {
            metadata.tags.push(tag.clone());
        }
    }
    if overlay.thumbnail_ref.is_some() {
        metadata.thumbnail_ref = overlay.thumbnail_ref.clone();
    }
    if let Some(privacy) = &overlay.privacy {
        metadata.privacy = privacy.clone();
    }
    metadata
}

/// Replace `{field}` placeholders with context values. Unknown fields are
/// left in place so broken templates stay visible in the output.
fn render_template(template: &str, context: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match context.get(key) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
