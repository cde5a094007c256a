use chrono::{DateTime, NaiveTime, Timelike, Utc};

use crate::util::error::{CoreError, CoreResult};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// スケジュール時刻を秒精度に切り詰める。ストアの `scheduled_time` 列と揃える。
#[must_use]
pub fn truncate_to_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// `HH:MM` 形式の時刻をパースする。トリガー設定の `schedule_time` 用。
pub fn parse_hhmm(raw: &str) -> CoreResult<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|_| CoreError::bad_request(format!("invalid HH:MM time: {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_hhmm() {
        let t = parse_hhmm("10:00").expect("valid time");
        assert_eq!((t.hour(), t.minute()), (10, 0));
        let t = parse_hhmm("23:59").expect("valid time");
        assert_eq!((t.hour(), t.minute()), (23, 59));
    }

    #[test]
    fn rejects_garbage_times() {
        assert!(parse_hhmm("24:00").is_err());
        assert!(parse_hhmm("10").is_err());
        assert!(parse_hhmm("ten o'clock").is_err());
    }

    #[test]
    fn truncates_subsecond_precision() {
        let ts = DateTime::parse_from_rfc3339("2026-03-01T10:00:00.789Z")
            .expect("valid ts")
            .with_timezone(&Utc);
        let truncated = truncate_to_second(ts);
        assert_eq!(truncated.to_rfc3339(), "2026-03-01T10:00:00+00:00");
    }
}
