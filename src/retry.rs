//! Retry scheduling.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::Error;

/// Ascending table of delays between retries.
///
/// The n-th retry (1-based) waits `delays[n - 1]`; retries beyond the end of
/// the table reuse the last entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    delays: Vec<Duration>,
}

impl Backoff {
    pub fn new(delays: Vec<Duration>) -> Result<Self, Error> {
        if delays.is_empty() {
            return Err(Error::invalid_config("retry delay table must not be empty"));
        }

        if delays.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::invalid_config("retry delay table must be ascending"));
        }

        Ok(Self { delays })
    }

    pub fn delay(&self, retry_count: u32) -> Duration {
        let idx = (retry_count.saturating_sub(1) as usize).min(self.delays.len() - 1);
        self.delays[idx]
    }

    pub fn next_retry_at(&self, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = TimeDelta::from_std(self.delay(retry_count)).unwrap_or(TimeDelta::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Backoff {
        Backoff::new(vec![
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(30),
        ])
        .unwrap()
    }

    #[test]
    fn picks_delay_by_retry_count() {
        let backoff = table();
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(5));
        assert_eq!(backoff.delay(3), Duration::from_secs(30));
    }

    #[test]
    fn clamps_to_table_bounds() {
        let backoff = table();
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(4), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn next_retry_is_monotonic() {
        let backoff = table();
        let now = Utc::now();

        let times: Vec<_> = (1..=10).map(|n| backoff.next_retry_at(n, now)).collect();

        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(times[0], now + TimeDelta::seconds(1));
    }

    #[test]
    fn rejects_bad_tables() {
        assert!(Backoff::new(vec![]).is_err());
        assert!(Backoff::new(vec![Duration::from_secs(5), Duration::from_secs(1)]).is_err());
    }
}
