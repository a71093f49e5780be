use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker tasks, and therefore the global bound on in-flight attempts.
    pub worker_count: usize,
    /// Capacity of the job queue shared by the workers.
    pub queue_size: usize,
    /// In-flight attempts allowed per subscription across different jobs.
    pub per_subscription_concurrency: usize,
    /// Upper bound for a single HTTP attempt.
    pub attempt_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Consecutive terminal failures before a subscription is set to `error`.
    pub failure_threshold: u32,
    /// How long a job waits before re-queueing when its subscription is saturated.
    pub saturation_delay: Duration,
    /// Delivery states remembered for `delivery_status`.
    pub status_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_count,
            queue_size: 1_000,
            per_subscription_concurrency: 3,
            attempt_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            failure_threshold: 10,
            saturation_delay: Duration::from_millis(50),
            status_capacity: 10_000,
        }
    }
}

impl DispatcherConfig {
    /// Defaults overridden by `WEBHOOK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let read = |var: &'static str| -> Result<Option<u64>, ConfigError> {
            match lookup(var) {
                None => Ok(None),
                Some(value) => {
                    let parsed = value.trim().parse::<u64>();
                    match parsed {
                        Ok(n) => Ok(Some(n)),
                        Err(_) => Err(ConfigError::InvalidNumber { var, value }),
                    }
                }
            }
        };

        if let Some(n) = read("WEBHOOK_WORKER_COUNT")? {
            config.worker_count = n as usize;
        }
        if let Some(n) = read("WEBHOOK_QUEUE_SIZE")? {
            config.queue_size = n as usize;
        }
        if let Some(n) = read("WEBHOOK_PER_SUBSCRIPTION_CONCURRENCY")? {
            config.per_subscription_concurrency = n as usize;
        }
        if let Some(ms) = read("WEBHOOK_ATTEMPT_TIMEOUT_MS")? {
            config.attempt_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = read("WEBHOOK_FAILURE_THRESHOLD")? {
            config.failure_threshold = n.min(u32::MAX as u64) as u32;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Zero("worker_count"));
        }
        if self.queue_size == 0 {
            return Err(ConfigError::Zero("queue_size"));
        }
        if self.per_subscription_concurrency == 0 {
            return Err(ConfigError::Zero("per_subscription_concurrency"));
        }
        if self.attempt_timeout.is_zero() {
            return Err(ConfigError::Zero("attempt_timeout"));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Zero("failure_threshold"));
        }
        Ok(())
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_per_subscription_concurrency(mut self, limit: usize) -> Self {
        self.per_subscription_concurrency = limit;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_delivery_contract() {
        let config = DispatcherConfig::default();
        assert_eq!(config.per_subscription_concurrency, 3);
        assert_eq!(config.attempt_timeout, Duration::from_secs(10));
        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.backoff.max_attempts(), 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = DispatcherConfig::from_lookup(lookup(&[
            ("WEBHOOK_WORKER_COUNT", "7"),
            ("WEBHOOK_ATTEMPT_TIMEOUT_MS", "2500"),
            ("WEBHOOK_FAILURE_THRESHOLD", " 3 "),
        ]))
        .unwrap();
        assert_eq!(config.worker_count, 7);
        assert_eq!(config.attempt_timeout, Duration::from_millis(2500));
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.queue_size, 1_000);
    }

    #[test]
    fn rejects_garbage_and_zero() {
        let err = DispatcherConfig::from_lookup(lookup(&[("WEBHOOK_QUEUE_SIZE", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber { var: "WEBHOOK_QUEUE_SIZE", value: "lots".to_string() }
        );

        let err = DispatcherConfig::from_lookup(lookup(&[("WEBHOOK_WORKER_COUNT", "0")])).unwrap_err();
        assert_eq!(err, ConfigError::Zero("worker_count"));
    }
}
