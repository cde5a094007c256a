/// 指数バックオフ+ジッター付き再試行ロジック。
///
/// HTTP クライアント向けには Full Jitter 戦略、タスク再スケジュール向けには
/// 決定的な `2^retry_count * unit` を提供する。
use std::time::Duration;

use rand::Rng;

/// 再試行戦略の設定。
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// 最大試行回数（初回を含む）
    pub max_attempts: usize,
    /// ベースとなる遅延時間（ミリ秒）
    pub base_delay_ms: u64,
    /// 最大遅延時間（ミリ秒）
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 10000,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub const fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// 指定された試行回数に対する遅延時間を計算する（Full Jitter 戦略）。
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let exponential_delay = self
            .base_delay_ms
            .saturating_mul(1_u64.checked_shl((attempt - 1) as u32).unwrap_or(u64::MAX));
        let capped_delay = exponential_delay.min(self.max_delay_ms);

        let jittered_delay = if capped_delay > 0 {
            let mut rng = rand::rng();
            rng.random_range(0..=capped_delay)
        } else {
            0
        };

        Duration::from_millis(jittered_delay)
    }

    /// この試行回数が再試行可能かどうかを判定する。
    #[must_use]
    pub const fn can_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

/// タスク再スケジュール用の決定的バックオフ。
///
/// `unit * 2^retry_count`。シフトは飽和させ、再試行回数の黙った
/// オーバーフローを許さない。
#[must_use]
pub fn task_backoff(retry_count: i32, unit: Duration) -> Duration {
    let exponent = u32::try_from(retry_count.max(0)).unwrap_or(0).min(16);
    let factor = 1_u64 << exponent;
    Duration::from_secs(unit.as_secs().saturating_mul(factor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_for_attempt_zero_is_zero() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(0));
    }

    #[test]
    fn delay_for_attempt_respects_max_delay() {
        let config = RetryConfig::new(10, 100, 500);
        let delay = config.delay_for_attempt(10);
        assert!(delay <= Duration::from_millis(500));
    }

    #[test]
    fn can_retry_respects_max_attempts() {
        let config = RetryConfig::new(3, 100, 1000);
        assert!(config.can_retry(0));
        assert!(config.can_retry(2));
        assert!(!config.can_retry(3));
    }

    #[test]
    fn task_backoff_doubles_per_retry() {
        let unit = Duration::from_secs(60);
        assert_eq!(task_backoff(0, unit), Duration::from_secs(60));
        assert_eq!(task_backoff(1, unit), Duration::from_secs(120));
        assert_eq!(task_backoff(2, unit), Duration::from_secs(240));
        assert_eq!(task_backoff(3, unit), Duration::from_secs(480));
    }

    #[test]
    fn task_backoff_saturates_instead_of_overflowing() {
        let unit = Duration::from_secs(60);
        let large = task_backoff(i32::MAX, unit);
        assert!(large >= task_backoff(16, unit));
    }
}
