//! Fixed backoff schedule for in-process delivery retries.

use std::time::Duration;

/// Delays drawn by attempt number from a fixed table.
///
/// With the standard table {60s, 300s, 900s} and 3 attempts:
/// - attempt 1 fails: wait 60s
/// - attempt 2 fails: wait 300s
/// - attempt 3 fails: give up, no wait
///
/// Attempts beyond the table reuse its last entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
    max_attempts: u32,
}

impl BackoffSchedule {
    pub fn new(delays: Vec<Duration>, max_attempts: u32) -> Self {
        let delays = if delays.is_empty() {
            vec![Duration::ZERO]
        } else {
            delays
        };
        Self {
            delays,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn standard() -> Self {
        Self::new(
            vec![
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(900),
            ],
            3,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait before the next attempt after `attempt` (1-indexed) failed, or
    /// `None` when that was the last attempt.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let index = (attempt.saturating_sub(1) as usize).min(self.delays.len() - 1);
        Some(self.delays[index])
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_schedule() {
        let schedule = BackoffSchedule::standard();
        assert_eq!(schedule.delay_after(1), Some(Duration::from_secs(60)));
        assert_eq!(schedule.delay_after(2), Some(Duration::from_secs(300)));
        assert_eq!(schedule.delay_after(3), None);
    }

    #[test]
    fn test_longer_runs_reuse_last_delay() {
        let schedule = BackoffSchedule::new(vec![Duration::from_secs(1), Duration::from_secs(5)], 5);
        assert_eq!(schedule.delay_after(1), Some(Duration::from_secs(1)));
        assert_eq!(schedule.delay_after(3), Some(Duration::from_secs(5)));
        assert_eq!(schedule.delay_after(4), Some(Duration::from_secs(5)));
        assert_eq!(schedule.delay_after(5), None);
    }

    #[test]
    fn test_degenerate_inputs() {
        let schedule = BackoffSchedule::new(Vec::new(), 0);
        assert_eq!(schedule.max_attempts(), 1);
        assert_eq!(schedule.delay_after(1), None);
    }
}
