use chrono::{DateTime, Duration, Utc};

/// Fixed backoff table for failed installments.
///
/// Entry `n - 1` is the delay in days applied after the `n`th failed attempt.
/// Once `attempts` runs past the table the payment is abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff_days: Vec<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_days: vec![3, 7, 14],
        }
    }
}

impl RetryPolicy {
    pub fn new(backoff_days: Vec<u32>) -> Self {
        Self { backoff_days }
    }

    /// Retry date after `attempts` attempts, or `None` once retries are exhausted.
    pub fn next_retry_date(&self, attempts: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let index = usize::try_from(attempts.checked_sub(1)?).ok()?;
        self.backoff_days
            .get(index)
            .map(|days| now + Duration::days(i64::from(*days)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_backoff_table() {
        let policy = RetryPolicy::default();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 8, 30, 0).unwrap();

        assert_eq!(policy.next_retry_date(1, now), Some(now + Duration::days(3)));
        assert_eq!(policy.next_retry_date(2, now), Some(now + Duration::days(7)));
        assert_eq!(policy.next_retry_date(3, now), Some(now + Duration::days(14)));
        assert_eq!(policy.next_retry_date(4, now), None);
        assert_eq!(policy.next_retry_date(40, now), None);
    }

    #[test]
    fn test_zero_attempts_has_no_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_retry_date(0, Utc::now()), None);
    }

    #[test]
    fn test_is_deterministic() {
        let policy = RetryPolicy::default();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(policy.next_retry_date(2, now), policy.next_retry_date(2, now));
    }

    #[test]
    fn test_exhaustion_matches_table_length() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let policy = RetryPolicy::new(vec![1]);
        assert_eq!(policy.next_retry_date(1, now), Some(now + Duration::days(1)));
        assert_eq!(policy.next_retry_date(2, now), None);

        let none = RetryPolicy::new(Vec::new());
        assert_eq!(none.next_retry_date(1, now), None);
    }
}
