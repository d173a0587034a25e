//! Configuration for the sync engine.
//!
//! Every struct deserializes with `#[serde(default)]`, so a partial JSON
//! file overrides only the keys it names. Durations are written in
//! milliseconds (`*_ms` keys).

use crate::error::{SyncError, SyncResult};
use catsync_core::{ConflictRules, Severity};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serde adapter for durations stored as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Batch formation and aging.
    pub scheduler: SchedulerConfig,
    /// Worker pool sizing.
    pub pool: PoolConfig,
    /// Remote rate budget.
    pub rate_limit: RateLimitConfig,
    /// Per-item retry behavior.
    pub retry: RetryConfig,
    /// Auto-approval policy.
    pub approval: ApprovalPolicy,
    /// Field weight and severity table.
    pub rules: ConflictRules,
    /// Bound on every remote call.
    #[serde(rename = "remote_timeout_ms", with = "duration_ms")]
    pub remote_timeout: Duration,
}

impl EngineConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            pool: PoolConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            approval: ApprovalPolicy::default(),
            rules: ConflictRules::default(),
            remote_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the scheduler configuration.
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Sets the pool configuration.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the rate limit configuration.
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the approval policy.
    pub fn with_approval(mut self, approval: ApprovalPolicy) -> Self {
        self.approval = approval;
        self
    }

    /// Sets the conflict rule table.
    pub fn with_rules(mut self, rules: ConflictRules) -> Self {
        self.rules = rules;
        self
    }

    /// Sets the remote call timeout.
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Rejects inconsistent settings.
    pub fn validate(&self) -> SyncResult<()> {
        let fail = |msg: &str| Err(SyncError::Config(msg.to_string()));
        if self.scheduler.max_batch_size == 0 {
            return fail("scheduler.max_batch_size must be at least 1");
        }
        if self.pool.min_workers == 0 {
            return fail("pool.min_workers must be at least 1");
        }
        if self.pool.min_workers > self.pool.max_workers {
            return fail("pool.min_workers must not exceed pool.max_workers");
        }
        if self.pool.max_batch_attempts == 0 {
            return fail("pool.max_batch_attempts must be at least 1");
        }
        if self.pool.sample_interval.is_zero() {
            return fail("pool.sample_interval_ms must be positive");
        }
        if !(0.0..=1.0).contains(&self.pool.load_threshold) {
            return fail("pool.load_threshold must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.pool.memory_ceiling) {
            return fail("pool.memory_ceiling must be in [0, 1]");
        }
        self.rate_limit.validate()?;
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1");
        }
        let multiplier = self.retry.backoff_multiplier;
        if !(multiplier.is_finite() && multiplier >= 1.0) {
            return fail("retry.backoff_multiplier must be a finite number of at least 1");
        }
        if self.remote_timeout.is_zero() {
            return fail("remote_timeout_ms must be positive");
        }
        self.rules.validate()?;
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Batch formation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum items per batch.
    pub max_batch_size: usize,
    /// Wait after which a queued item moves up one priority level.
    #[serde(rename = "aging_threshold_ms", with = "duration_ms")]
    pub aging_threshold: Duration,
}

impl SchedulerConfig {
    /// Sets the maximum batch size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Sets the aging threshold.
    pub fn with_aging_threshold(mut self, threshold: Duration) -> Self {
        self.aging_threshold = threshold;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            aging_threshold: Duration::from_secs(30),
        }
    }
}

/// Worker pool sizing and supervision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Lower bound on running workers.
    pub min_workers: usize,
    /// Upper bound on running workers.
    pub max_workers: usize,
    /// Ready batches per worker above which the pool grows.
    pub scale_up_queue_per_worker: usize,
    /// CPU load (0..1) at or above which the pool will not grow.
    pub load_threshold: f64,
    /// Memory pressure (0..1) above which the pool shrinks.
    pub memory_ceiling: f64,
    /// Sampler tick.
    #[serde(rename = "sample_interval_ms", with = "duration_ms")]
    pub sample_interval: Duration,
    /// Pickups allowed before a crashing batch is failed.
    pub max_batch_attempts: u32,
    /// Bound on one batch attempt.
    #[serde(rename = "batch_timeout_ms", with = "duration_ms")]
    pub batch_timeout: Duration,
}

impl PoolConfig {
    /// Sets the worker bounds.
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    /// Sets the batch timeout.
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    /// Sets the maximum batch attempts.
    pub fn with_max_batch_attempts(mut self, attempts: u32) -> Self {
        self.max_batch_attempts = attempts;
        self
    }

    /// Sets the sampler interval.
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 8,
            scale_up_queue_per_worker: 2,
            load_threshold: 0.8,
            memory_ceiling: 0.85,
            sample_interval: Duration::from_secs(1),
            max_batch_attempts: 3,
            batch_timeout: Duration::from_secs(300),
        }
    }
}

/// Token bucket sized to the remote's published budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket capacity.
    pub burst_size: u32,
    /// Tokens added per second at nominal rate.
    pub refill_per_sec: f64,
    /// Backoff window used when a throttle carries no hint.
    #[serde(rename = "default_backoff_ms", with = "duration_ms")]
    pub default_backoff: Duration,
    /// Fraction of the nominal rate right after a throttle.
    pub throttled_rate_factor: f64,
    /// Consecutive successes per ramp-up step.
    pub recovery_successes: u32,
}

impl RateLimitConfig {
    /// Creates a bucket configuration.
    pub fn new(burst_size: u32, refill_per_sec: f64) -> Self {
        Self {
            burst_size,
            refill_per_sec,
            ..Self::default()
        }
    }

    /// Sets the default backoff window.
    pub fn with_default_backoff(mut self, backoff: Duration) -> Self {
        self.default_backoff = backoff;
        self
    }

    /// Sets the number of successes per ramp-up step.
    pub fn with_recovery_successes(mut self, successes: u32) -> Self {
        self.recovery_successes = successes;
        self
    }

    /// Rejects an empty bucket or a non-positive refill rate.
    pub fn validate(&self) -> SyncResult<()> {
        let fail = |msg: &str| Err(SyncError::Config(msg.to_string()));
        if self.burst_size == 0 {
            return fail("rate_limit.burst_size must be at least 1");
        }
        if !(self.refill_per_sec.is_finite() && self.refill_per_sec > 0.0) {
            return fail("rate_limit.refill_per_sec must be positive");
        }
        let factor = self.throttled_rate_factor;
        if !(factor > 0.0 && factor <= 1.0) {
            return fail("rate_limit.throttled_rate_factor must be in (0, 1]");
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_size: 40,
            refill_per_sec: 2.0,
            default_backoff: Duration::from_secs(2),
            throttled_rate_factor: 0.25,
            recovery_successes: 10,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts for transient failures.
    pub max_attempts: u32,
    /// Initial delay between retries.
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
    /// Throttle signals tolerated for one call before giving up.
    pub max_throttle_retries: u32,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
            max_throttle_retries: 20,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
            max_throttle_retries: 0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Sets the throttle retry budget.
    pub fn with_max_throttle_retries(mut self, retries: u32) -> Self {
        self.max_throttle_retries = retries;
        self
    }

    /// Calculates the delay before retry number `attempt` (0 means none).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64()).max(0.0);

        if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% on top.
            let jitter = delay_secs * rand::thread_rng().gen_range(0.0..0.25);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// When a change may skip manual review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalPolicy {
    /// Confidence a change must exceed. `None` disables auto-approval.
    pub auto_approve_threshold: Option<u8>,
    /// Conflict severity a change must stay below.
    pub severity_ceiling: Severity,
}

impl ApprovalPolicy {
    /// Enables auto-approval above `threshold` and below `ceiling`.
    pub fn auto(threshold: u8, ceiling: Severity) -> Self {
        Self {
            auto_approve_threshold: Some(threshold),
            severity_ceiling: ceiling,
        }
    }

    /// Returns true if a change with this score and severity is auto-approved.
    pub fn allows(&self, confidence: u8, severity: Option<Severity>) -> bool {
        match self.auto_approve_threshold {
            Some(threshold) => {
                confidence > threshold && severity.map_or(true, |s| s < self.severity_ceiling)
            }
            None => false,
        }
    }
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            auto_approve_threshold: None,
            severity_ceiling: Severity::Medium,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_worker_bounds() {
        let config = EngineConfig::default().with_pool(PoolConfig::default().with_workers(4, 2));
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_batch_and_burst() {
        let config = EngineConfig::default()
            .with_scheduler(SchedulerConfig::default().with_max_batch_size(0));
        assert!(config.validate().is_err());

        let config = EngineConfig::default().with_rate_limit(RateLimitConfig::new(0, 2.0));
        assert!(config.validate().is_err());

        let config = EngineConfig::default().with_rate_limit(RateLimitConfig::new(5, 0.0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_delays_grow_and_cap() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350))
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(350));
    }

    #[test]
    fn validate_rejects_shrinking_backoff() {
        for multiplier in [-2.0, 0.5, f64::NAN, f64::INFINITY] {
            let config = EngineConfig::default()
                .with_retry(RetryConfig::new(3).with_backoff_multiplier(multiplier));
            assert!(
                matches!(config.validate(), Err(SyncError::Config(_))),
                "multiplier {multiplier} accepted"
            );
        }
        let config =
            EngineConfig::default().with_retry(RetryConfig::new(3).with_backoff_multiplier(1.0));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_load_thresholds_outside_unit_range() {
        let mut config = EngineConfig::default();
        config.pool.load_threshold = 1.5;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let mut config = EngineConfig::default();
        config.pool.memory_ceiling = -0.1;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let mut config = EngineConfig::default();
        config.pool.memory_ceiling = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn negative_multiplier_never_yields_a_negative_delay() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(-3.0)
            .with_jitter(false);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::ZERO);
        assert!(config.delay_for_attempt(3) > Duration::from_millis(850));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let config = RetryConfig::new(3).with_initial_delay(Duration::from_millis(400));
        for _ in 0..50 {
            let delay = config.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(500));
        }
    }

    #[test]
    fn approval_policy_thresholds() {
        assert!(!ApprovalPolicy::default().allows(100, None));

        let policy = ApprovalPolicy::auto(80, Severity::High);
        assert!(policy.allows(81, None));
        assert!(policy.allows(95, Some(Severity::Medium)));
        assert!(!policy.allows(80, None));
        assert!(!policy.allows(95, Some(Severity::High)));
    }

    #[test]
    fn partial_json_overrides_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"scheduler": {"max_batch_size": 25},
                "pool": {"max_workers": 3, "batch_timeout_ms": 1500},
                "remote_timeout_ms": 250}"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.max_batch_size, 25);
        assert_eq!(config.scheduler.aging_threshold, Duration::from_secs(30));
        assert_eq!(config.pool.max_workers, 3);
        assert_eq!(config.pool.min_workers, 1);
        assert_eq!(config.pool.batch_timeout, Duration::from_millis(1500));
        assert_eq!(config.remote_timeout, Duration::from_millis(250));
        assert_eq!(config.rules, ConflictRules::default());
    }
}
