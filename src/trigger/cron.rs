//! Five-field cron expressions (minute hour dom month dow).
//!
//! Supports `*`, lists, ranges, steps and `?` as an alias for `*` in the
//! day fields. Day-of-week 0 and 7 both mean Sunday. When both day fields
//! are restricted, a day matches if either field matches (classic cron).

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

use crate::util::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u32,
    dom: u32,
    months: u16,
    dow: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> CoreResult<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CoreError::bad_request(format!(
                "cron expression must have 5 fields, got {}: {expr:?}",
                fields.len()
            )));
        }

        let (minutes, _) = parse_field(fields[0], 0, 59)?;
        let (hours, _) = parse_field(fields[1], 0, 23)?;
        let (dom, dom_restricted) = parse_field(fields[2], 1, 31)?;
        let (months, _) = parse_field(fields[3], 1, 12)?;
        let (dow_raw, dow_restricted) = parse_field(fields[4], 0, 7)?;
        // Fold 7 (Sunday) onto 0.
        let dow = (dow_raw | u64::from(dow_raw >> 7 & 1)) & 0x7f;

        Ok(Self {
            minutes,
            hours: hours as u32,
            dom: dom as u32,
            months: months as u16,
            dow: dow as u8,
            dom_restricted,
            dow_restricted,
        })
    }

    /// Smallest instant strictly after `t` matching the expression, or `None`
    /// if no match exists within a four-year horizon (e.g. `0 0 30 2 *`).
    #[must_use]
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = t
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(t)
            + Duration::minutes(1);

        let mut date = start.date_naive();
        let mut from_hour = start.hour();
        let mut from_minute = start.minute();

        for _ in 0..(366 * 4) {
            if !self.month_matches(date) || !self.day_matches(date) {
                date = date.succ_opt()?;
                from_hour = 0;
                from_minute = 0;
                continue;
            }

            for hour in from_hour..24 {
                if self.hours & (1 << hour) == 0 {
                    from_minute = 0;
                    continue;
                }
                let first_minute = if hour == from_hour { from_minute } else { 0 };
                for minute in first_minute..60 {
                    if self.minutes & (1 << minute) != 0 {
                        let naive = date.and_hms_opt(hour, minute, 0)?;
                        return Utc.from_utc_datetime(&naive).into();
                    }
                }
                from_minute = 0;
            }

            date = date.succ_opt()?;
            from_hour = 0;
            from_minute = 0;
        }

        None
    }

    fn month_matches(&self, date: NaiveDate) -> bool {
        self.months & (1 << date.month()) != 0
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom_match = self.dom & (1 << date.day()) != 0;
        let dow_match = self.dow & (1 << date.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_match || dow_match,
            (true, false) => dom_match,
            (false, true) => dow_match,
            (false, false) => true,
        }
    }
}

/// Parse one field into a bitmask over `[min, max]`. Returns the mask and
/// whether the field restricts values (`*`/`?` do not).
fn parse_field(field: &str, min: u32, max: u32) -> CoreResult<(u64, bool)> {
    if field == "*" || field == "?" {
        return Ok((range_mask(min, max), false));
    }

    let mut mask = 0_u64;
    for item in field.split(',') {
        let (body, step) = match item.split_once('/') {
            Some((body, step_raw)) => {
                let step: u32 = step_raw.parse().map_err(|_| {
                    CoreError::bad_request(format!("invalid cron step: {item:?}"))
                })?;
                if step == 0 {
                    return Err(CoreError::bad_request(format!(
                        "cron step must be positive: {item:?}"
                    )));
                }
                (body, step)
            }
            None => (item, 1),
        };

        let (lo, hi) = if body == "*" || body == "?" {
            (min, max)
        } else if let Some((lo_raw, hi_raw)) = body.split_once('-') {
            (
                parse_bound(lo_raw, min, max)?,
                parse_bound(hi_raw, min, max)?,
            )
        } else {
            let value = parse_bound(body, min, max)?;
            // A bare value with a step means "value to max" in classic cron.
            if step > 1 { (value, max) } else { (value, value) }
        };

        if lo > hi {
            return Err(CoreError::bad_request(format!(
                "cron range is inverted: {item:?}"
            )));
        }

        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            v += step;
        }
    }

    Ok((mask, true))
}

fn parse_bound(raw: &str, min: u32, max: u32) -> CoreResult<u32> {
    let value: u32 = raw
        .parse()
        .map_err(|_| CoreError::bad_request(format!("invalid cron value: {raw:?}")))?;
    if value < min || value > max {
        return Err(CoreError::bad_request(format!(
            "cron value {value} out of range {min}..={max}"
        )));
    }
    Ok(value)
}

fn range_mask(min: u32, max: u32) -> u64 {
    let mut mask = 0_u64;
    for v in min..=max {
        mask |= 1 << v;
    }
    mask
}
