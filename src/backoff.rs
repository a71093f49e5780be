use std::time::Duration;

use crate::error::{DeliveryOutcome, FailureReason};

/// Delays before attempts 2..=5 (the fifth entry only applies if
/// `max_attempts` is raised).
pub const DEFAULT_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(30),
    Duration::from_secs(5 * 60),
    Duration::from_secs(30 * 60),
];

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Fixed retry schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    schedule: Vec<Duration>,
    max_attempts: u32,
    jitter: Duration,
}

/// What the scheduler should do after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Delivered,
    RetryAfter(Duration),
    /// Retryable failures used up every attempt.
    Exhausted(FailureReason),
    /// A fatal failure; no further attempts regardless of count.
    Rejected(FailureReason),
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            schedule: DEFAULT_SCHEDULE.to_vec(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter: Duration::ZERO,
        }
    }
}

impl BackoffPolicy {
    /// Build a policy from an explicit schedule.
    ///
    /// An empty schedule allows a single attempt.
    pub fn new(schedule: Vec<Duration>, max_attempts: u32) -> Self {
        Self {
            schedule,
            max_attempts: max_attempts.max(1),
            jitter: Duration::ZERO,
        }
    }

    /// Add up to `jitter` of random delay to each retry.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the next attempt, given how many attempts already ran.
    ///
    /// `None` means the schedule is exhausted.
    pub fn next_delay(&self, attempt_count: u32) -> Option<Duration> {
        if attempt_count == 0 {
            return Some(Duration::ZERO);
        }
        if attempt_count >= self.max_attempts {
            return None;
        }
        let index = (attempt_count - 1) as usize;
        let base = self
            .schedule
            .get(index)
            .or_else(|| self.schedule.last())
            .copied()?;
        Some(base + jitter_delay(self.jitter))
    }

    pub fn decide(&self, outcome: &DeliveryOutcome, attempt_count: u32) -> Verdict {
        match outcome {
            DeliveryOutcome::Success { .. } => Verdict::Delivered,
            DeliveryOutcome::FatalFailure(reason) => Verdict::Rejected(reason.clone()),
            DeliveryOutcome::RetryableFailure(reason) => match self.next_delay(attempt_count) {
                Some(delay) => Verdict::RetryAfter(delay),
                None => Verdict::Exhausted(reason.clone()),
            },
        }
    }
}

fn jitter_delay(jitter: Duration) -> Duration {
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}
