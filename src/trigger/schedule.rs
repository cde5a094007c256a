//! Tagged trigger and schedule variants.
//!
//! All schedule evaluation is in UTC; `schedule_time` values are UTC wall
//! times and `next_after` returns the smallest fire instant strictly after
//! its argument.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trigger::cron::CronExpr;
use crate::util::error::{CoreError, CoreResult};
use crate::util::time::parse_hhmm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

impl IntervalUnit {
    #[must_use]
    pub fn to_duration(self, value: u64) -> Duration {
        let value = i64::try_from(value).unwrap_or(i64::MAX);
        match self {
            IntervalUnit::Minutes => Duration::minutes(value),
            IntervalUnit::Hours => Duration::hours(value),
            IntervalUnit::Days => Duration::days(value),
        }
    }
}

/// Scheduled-trigger kinds, stored as tagged JSON in `trigger_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schedule_type", rename_all = "lowercase")]
pub enum ScheduleSpec {
    Interval {
        schedule_interval: u64,
        schedule_interval_unit: IntervalUnit,
    },
    Cron {
        schedule_cron: String,
    },
    Daily {
        schedule_time: String,
    },
    Weekly {
        /// 0 = Sunday .. 6 = Saturday.
        schedule_days: Vec<u8>,
        schedule_time: String,
    },
    Monthly {
        /// 1..=31; a month without the day is skipped.
        schedule_dates: Vec<u8>,
        schedule_time: String,
    },
    Once {
        scheduled_time: DateTime<Utc>,
    },
}

impl ScheduleSpec {
    /// Validate eagerly so config creation rejects bad input.
    pub fn validate(&self) -> CoreResult<()> {
        match self {
            ScheduleSpec::Interval {
                schedule_interval, ..
            } => {
                if *schedule_interval == 0 {
                    return Err(CoreError::bad_request("interval must be positive"));
                }
            }
            ScheduleSpec::Cron { schedule_cron } => {
                CronExpr::parse(schedule_cron)?;
            }
            ScheduleSpec::Daily { schedule_time } => {
                parse_hhmm(schedule_time)?;
            }
            ScheduleSpec::Weekly {
                schedule_days,
                schedule_time,
            } => {
                parse_hhmm(schedule_time)?;
                if schedule_days.is_empty() {
                    return Err(CoreError::bad_request("schedule_days must not be empty"));
                }
                if schedule_days.iter().any(|d| *d > 6) {
                    return Err(CoreError::bad_request("schedule_days entries must be 0..=6"));
                }
            }
            ScheduleSpec::Monthly {
                schedule_dates,
                schedule_time,
            } => {
                parse_hhmm(schedule_time)?;
                if schedule_dates.is_empty() {
                    return Err(CoreError::bad_request("schedule_dates must not be empty"));
                }
                if schedule_dates.iter().any(|d| *d < 1 || *d > 31) {
                    return Err(CoreError::bad_request(
                        "schedule_dates entries must be 1..=31",
                    ));
                }
            }
            ScheduleSpec::Once { .. } => {}
        }
        Ok(())
    }

    /// Smallest fire instant strictly after `t`, or `None` when the schedule
    /// is exhausted (`once` already past, impossible cron date).
    pub fn next_after(&self, t: DateTime<Utc>) -> CoreResult<Option<DateTime<Utc>>> {
        match self {
            ScheduleSpec::Interval {
                schedule_interval,
                schedule_interval_unit,
            } => Ok(Some(t + schedule_interval_unit.to_duration(*schedule_interval))),
            ScheduleSpec::Cron { schedule_cron } => {
                Ok(CronExpr::parse(schedule_cron)?.next_after(t))
            }
            ScheduleSpec::Daily { schedule_time } => {
                let target = parse_hhmm(schedule_time)?;
                let today = t.date_naive().and_time(target).and_utc();
                if today > t {
                    Ok(Some(today))
                } else {
                    Ok(next_day(t.date_naive()).map(|d| d.and_time(target).and_utc()))
                }
            }
            ScheduleSpec::Weekly {
                schedule_days,
                schedule_time,
            } => {
                let target = parse_hhmm(schedule_time)?;
                let mut date = t.date_naive();
                for _ in 0..=7 {
                    let dow = date.weekday().num_days_from_sunday() as u8;
                    if schedule_days.contains(&dow) {
                        let candidate = date.and_time(target).and_utc();
                        if candidate > t {
                            return Ok(Some(candidate));
                        }
                    }
                    date = match next_day(date) {
                        Some(d) => d,
                        None => return Ok(None),
                    };
                }
                Ok(None)
            }
            ScheduleSpec::Monthly {
                schedule_dates,
                schedule_time,
            } => {
                let target = parse_hhmm(schedule_time)?;
                let mut year = t.year();
                let mut month = t.month();
                for _ in 0..=12 {
                    let mut best: Option<DateTime<Utc>> = None;
                    for day in schedule_dates {
                        // Nonexistent days (e.g. Feb 31) skip the month.
                        if let Some(date) = NaiveDate::from_ymd_opt(year, month, u32::from(*day)) {
                            let candidate = date.and_time(target).and_utc();
                            if candidate > t && best.is_none_or(|b| candidate < b) {
                                best = Some(candidate);
                            }
                        }
                    }
                    if best.is_some() {
                        return Ok(best);
                    }
                    month += 1;
                    if month > 12 {
                        month = 1;
                        year += 1;
                    }
                }
                Ok(None)
            }
            ScheduleSpec::Once { scheduled_time } => {
                if *scheduled_time > t {
                    Ok(Some(*scheduled_time))
                } else {
                    Ok(None)
                }
            }
        }
    }

    #[must_use]
    pub fn is_once(&self) -> bool {
        matches!(self, ScheduleSpec::Once { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorTrigger {
    pub monitor_id: Uuid,
}

/// The two trigger kinds a publish config can carry. Serialized adjacently
/// so the wire form matches the stored `trigger_kind` / `trigger_config`
/// column pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger_kind", content = "trigger_config", rename_all = "lowercase")]
pub enum TriggerSpec {
    Scheduled(ScheduleSpec),
    Monitor(MonitorTrigger),
}

impl TriggerSpec {
    #[must_use]
    pub fn kind_str(&self) -> &'static str {
        match self {
            TriggerSpec::Scheduled(_) => "scheduled",
            TriggerSpec::Monitor(_) => "monitor",
        }
    }

    /// Total parse from the stored column pair. Unknown kinds and malformed
    /// configs are `BadRequest`, never panics.
    pub fn from_parts(kind: &str, config: &serde_json::Value) -> CoreResult<Self> {
        match kind {
            "scheduled" => {
                let spec: ScheduleSpec = serde_json::from_value(config.clone()).map_err(|e| {
                    CoreError::bad_request(format!("invalid scheduled trigger config: {e}"))
                })?;
                spec.validate()?;
                Ok(TriggerSpec::Scheduled(spec))
            }
            "monitor" => {
                let spec: MonitorTrigger = serde_json::from_value(config.clone()).map_err(|e| {
                    CoreError::bad_request(format!("invalid monitor trigger config: {e}"))
                })?;
                Ok(TriggerSpec::Monitor(spec))
            }
            other => Err(CoreError::bad_request(format!(
                "unknown trigger_kind: {other:?}"
            ))),
        }
    }

    /// The kind-specific config JSON, as persisted in `trigger_config`.
    pub fn config_value(&self) -> CoreResult<serde_json::Value> {
        let value = match self {
            TriggerSpec::Scheduled(spec) => serde_json::to_value(spec),
            TriggerSpec::Monitor(spec) => serde_json::to_value(spec),
        };
        value.map_err(|e| CoreError::permanent(format!("trigger config serialization: {e}")))
    }
}

fn next_day(date: NaiveDate) -> Option<NaiveDate> {
    date.succ_opt()
}
