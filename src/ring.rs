//! Ring scheduler.
//!
//! Spreads one publication per active group account across a daily window.
//! Regeneration is idempotent: the random strategy draws its minutes from a
//! seed derived from `(config_id, date)`, and the store upsert refreshes
//! pending slots only.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

use crate::store::AutoPublishStore;
use crate::store::models::{RingSlot, SlotStatus};
use crate::util::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStrategy {
    Uniform,
    Random,
}

pub struct RingScheduler {
    store: Arc<dyn AutoPublishStore>,
}

impl RingScheduler {
    pub fn new(store: Arc<dyn AutoPublishStore>) -> Self {
        Self { store }
    }

    /// Generate (or refresh) the slot plan for one config and date.
    ///
    /// Window is `[start_hour, end_hour)`. With more accounts than minutes
    /// the plan truncates to one slot per minute.
    pub async fn generate_slots(
        &self,
        config_id: Uuid,
        date: NaiveDate,
        start_hour: u32,
        end_hour: u32,
        strategy: SlotStrategy,
    ) -> CoreResult<Vec<RingSlot>> {
        if start_hour >= end_hour || end_hour > 24 {
            return Err(CoreError::bad_request(format!(
                "invalid slot window {start_hour}..{end_hour}"
            )));
        }

        let config = self.store.get_config(config_id).await?;
        let accounts = self.store.list_active_group_accounts(config.group_id).await?;
        if accounts.is_empty() {
            return Err(CoreError::bad_request(format!(
                "group {} has no active accounts",
                config.group_id
            )));
        }

        let total_minutes = ((end_hour - start_hour) * 60) as usize;
        let count = accounts.len().min(total_minutes);
        let minutes = match strategy {
            SlotStrategy::Uniform => {
                let step = total_minutes / count;
                (0..count).map(|i| i * step).collect::<Vec<_>>()
            }
            SlotStrategy::Random => {
                let mut rng = StdRng::seed_from_u64(slot_seed(config_id, date));
                let mut drawn = rand::seq::index::sample(&mut rng, total_minutes, count)
                    .into_vec();
                drawn.sort_unstable();
                drawn
            }
        };

        let mut slots = Vec::with_capacity(count);
        for (index, (account, minute)) in accounts.iter().zip(minutes).enumerate() {
            let slot = RingSlot {
                slot_id: Uuid::new_v4(),
                config_id,
                account_id: account.account_id,
                slot_date: date,
                slot_hour: start_hour + (minute as u32) / 60,
                slot_minute: (minute as u32) % 60,
                slot_index: index as i32,
                status: SlotStatus::Pending,
                task_id: None,
            };
            slots.push(self.store.upsert_slot(slot).await?);
        }
        Ok(slots)
    }

    /// Earliest pending slot at or after `now`, ties broken by slot index.
    pub async fn next_pending_slot(
        &self,
        config_id: Uuid,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<RingSlot>> {
        self.store.next_pending_slot(config_id, now).await
    }
}

fn slot_seed(config_id: Uuid, date: NaiveDate) -> u64 {
    let mut material = config_id.as_bytes().to_vec();
    material.extend_from_slice(date.to_string().as_bytes());
    xxh3_64(&material)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    use crate::store::MemoryStore;
    use crate::store::models::{
        Account, AccountGroup, GroupMember, GroupType, PublishConfig,
    };
    use crate::trigger::schedule::{ScheduleSpec, TriggerSpec};

    async fn seed_store(accounts: usize) -> (Arc<MemoryStore>, Uuid, Vec<Uuid>) {
        let store = Arc::new(MemoryStore::new());
        let group_id = Uuid::new_v4();
        store
            .create_group(AccountGroup {
                group_id,
                name: "daily-shorts".to_string(),
                group_type: GroupType::Production,
                description: None,
                active: true,
                created_at: Utc::now(),
            })
            .await
            .expect("group");

        let mut account_ids = Vec::new();
        for rank in 0..accounts {
            let account_id = Uuid::new_v4();
            store
                .upsert_account(Account {
                    account_id,
                    display_name: format!("channel-{rank}"),
                    profile_ref: format!("profile-{rank}"),
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
                        member_rank: rank as i32,
                        role: None,
                    }],
                )
                .await
                .expect("member");
            account_ids.push(account_id);
        }

        let config_id = Uuid::new_v4();
        store
            .create_config(PublishConfig {
                config_id,
                name: "daily-shorts".to_string(),
                group_id,
                pipeline_id: "story".to_string(),
                trigger: TriggerSpec::Scheduled(ScheduleSpec::Daily {
                    schedule_time: "10:00".to_string(),
                }),
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

        (store, config_id, account_ids)
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).expect("valid date")
    }

    #[tokio::test]
    async fn uniform_spreads_accounts_evenly() {
        let (store, config_id, account_ids) = seed_store(4).await;
        let ring = RingScheduler::new(store);
        let slots = ring
            .generate_slots(config_id, date(), 8, 20, SlotStrategy::Uniform)
            .await
            .expect("generates");

        let times: Vec<(u32, u32)> = slots.iter().map(|s| (s.slot_hour, s.slot_minute)).collect();
        assert_eq!(times, vec![(8, 0), (11, 0), (14, 0), (17, 0)]);
        let assigned: Vec<Uuid> = slots.iter().map(|s| s.account_id).collect();
        assert_eq!(assigned, account_ids);
    }

    #[tokio::test]
    async fn regeneration_is_idempotent_for_pending_slots() {
        let (store, config_id, _) = seed_store(4).await;
        let ring = RingScheduler::new(Arc::clone(&store) as Arc<dyn AutoPublishStore>);
        let first = ring
            .generate_slots(config_id, date(), 8, 20, SlotStrategy::Uniform)
            .await
            .expect("generates");
        let second = ring
            .generate_slots(config_id, date(), 8, 20, SlotStrategy::Uniform)
            .await
            .expect("regenerates");

        let first_ids: Vec<Uuid> = first.iter().map(|s| s.slot_id).collect();
        let second_ids: Vec<Uuid> = second.iter().map(|s| s.slot_id).collect();
        assert_eq!(first_ids, second_ids, "pending slots keep their identity");

        let stored = store.list_slots(config_id, date()).await.expect("lists");
        assert_eq!(stored.len(), 4, "no duplicate slots per ring key");
    }

    #[tokio::test]
    async fn regeneration_leaves_terminal_slots_alone() {
        let (store, config_id, _) = seed_store(2).await;
        let ring = RingScheduler::new(Arc::clone(&store) as Arc<dyn AutoPublishStore>);
        let slots = ring
            .generate_slots(config_id, date(), 8, 20, SlotStrategy::Uniform)
            .await
            .expect("generates");
        store
            .resolve_slot(slots[0].slot_id, SlotStatus::Completed)
            .await
            .expect("resolves");

        let regenerated = ring
            .generate_slots(config_id, date(), 8, 20, SlotStrategy::Uniform)
            .await
            .expect("regenerates");
        assert_eq!(regenerated[0].status, SlotStatus::Completed);
        assert_eq!(regenerated[1].status, SlotStatus::Pending);
    }

    #[tokio::test]
    async fn random_strategy_is_deterministic_per_config_and_date() {
        let (store, config_id, _) = seed_store(5).await;
        let ring = RingScheduler::new(Arc::clone(&store) as Arc<dyn AutoPublishStore>);
        let first = ring
            .generate_slots(config_id, date(), 8, 20, SlotStrategy::Random)
            .await
            .expect("generates");
        let second = ring
            .generate_slots(config_id, date(), 8, 20, SlotStrategy::Random)
            .await
            .expect("regenerates");

        let a: Vec<(u32, u32, Uuid)> = first
            .iter()
            .map(|s| (s.slot_hour, s.slot_minute, s.slot_id))
            .collect();
        let b: Vec<(u32, u32, Uuid)> = second
            .iter()
            .map(|s| (s.slot_hour, s.slot_minute, s.slot_id))
            .collect();
        assert_eq!(a, b);

        // All distinct minutes, all inside the window.
        let mut minutes: Vec<u32> = first
            .iter()
            .map(|s| (s.slot_hour - 8) * 60 + s.slot_minute)
            .collect();
        minutes.dedup();
        assert_eq!(minutes.len(), 5);
        assert!(first.iter().all(|s| s.slot_hour >= 8 && s.slot_hour < 20));
    }

    #[tokio::test]
    async fn more_accounts_than_minutes_truncates() {
        let (store, config_id, _) = seed_store(90).await;
        let ring = RingScheduler::new(store);
        // One-hour window has 60 minutes for 90 accounts.
        let slots = ring
            .generate_slots(config_id, date(), 8, 9, SlotStrategy::Uniform)
            .await
            .expect("generates");
        assert_eq!(slots.len(), 60);
    }

    #[tokio::test]
    async fn rejects_empty_window() {
        let (store, config_id, _) = seed_store(2).await;
        let ring = RingScheduler::new(store);
        let error = ring
            .generate_slots(config_id, date(), 20, 8, SlotStrategy::Uniform)
            .await
            .expect_err("inverted window");
        assert_eq!(error.code(), "bad_request");
    }

    #[tokio::test]
    async fn next_pending_slot_skips_past_and_bound_slots() {
        let (store, config_id, _) = seed_store(4).await;
        let ring = RingScheduler::new(Arc::clone(&store) as Arc<dyn AutoPublishStore>);
        let slots = ring
            .generate_slots(config_id, date(), 8, 20, SlotStrategy::Uniform)
            .await
            .expect("generates");

        // 10:30 is past the 08:00 slot; 11:00 is the next one.
        let now = date().and_hms_opt(10, 30, 0).expect("valid").and_utc();
        let next = ring
            .next_pending_slot(config_id, now)
            .await
            .expect("queries")
            .expect("a slot is pending");
        assert_eq!((next.slot_hour, next.slot_minute), (11, 0));

        store
            .bind_slot_to_task(next.slot_id, Uuid::new_v4())
            .await
            .expect("binds");
        let after = ring
            .next_pending_slot(config_id, now)
            .await
            .expect("queries")
            .expect("a later slot is pending");
        assert_eq!((after.slot_hour, after.slot_minute), (14, 0));
        let _ = slots;
    }
}
