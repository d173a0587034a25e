//! Token-bucket gate in front of the remote API.
//!
//! Callers suspend in FIFO order until a token is available; nothing is
//! ever dropped. A throttle signal from the remote empties the bucket,
//! opens a backoff window and drops the refill rate to a fraction of
//! nominal. The rate doubles back towards nominal after every run of
//! `recovery_successes` consecutive successes.

use crate::config::RateLimitConfig;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Point-in-time view of the limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterState {
    /// Whole tokens currently available.
    pub tokens_remaining: u32,
    /// Effective refill rate in tokens per second.
    pub refill_rate: f64,
    /// End of the current backoff window.
    pub backoff_until: Option<Instant>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    backoff_until: Option<Instant>,
    rate_factor: f64,
    successes: u32,
}

impl Bucket {
    fn refill(&mut self, now: Instant, config: &RateLimitConfig) {
        if let Some(until) = self.backoff_until {
            if now < until {
                self.last_refill = now;
                return;
            }
            self.backoff_until = None;
            self.last_refill = until.max(self.last_refill);
        }
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let rate = config.refill_per_sec * self.rate_factor;
        self.tokens = (self.tokens + elapsed * rate).min(f64::from(config.burst_size));
        self.last_refill = now;
    }

    /// Takes a token or returns how long to wait for one.
    fn try_take(&mut self, now: Instant, config: &RateLimitConfig) -> Result<(), Duration> {
        self.refill(now, config);
        if let Some(until) = self.backoff_until {
            return Err(until.saturating_duration_since(now));
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let rate = config.refill_per_sec * self.rate_factor;
        Err(Duration::from_secs_f64((1.0 - self.tokens) / rate))
    }
}

/// Adaptive token bucket.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
    turnstile: tokio::sync::Mutex<()>,
}

impl RateLimiter {
    /// Creates a full bucket.
    pub fn new(config: RateLimitConfig) -> Self {
        let bucket = Bucket {
            tokens: f64::from(config.burst_size),
            last_refill: Instant::now(),
            backoff_until: None,
            rate_factor: 1.0,
            successes: 0,
        };
        Self {
            config,
            bucket: Mutex::new(bucket),
            turnstile: tokio::sync::Mutex::new(()),
        }
    }

    /// The configuration this limiter runs with.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Suspends until a token is available, then takes it.
    pub async fn acquire(&self) {
        // tokio's mutex is fair, so waiters are served in arrival order.
        let _turn = self.turnstile.lock().await;
        loop {
            let wait = match self.bucket.lock().try_take(Instant::now(), &self.config) {
                Ok(()) => return,
                Err(wait) => wait,
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Takes a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        match self.turnstile.try_lock() {
            Ok(_turn) => self
                .bucket
                .lock()
                .try_take(Instant::now(), &self.config)
                .is_ok(),
            Err(_) => false,
        }
    }

    /// Records a successful call.
    pub fn on_success(&self) {
        let mut bucket = self.bucket.lock();
        if bucket.rate_factor >= 1.0 {
            return;
        }
        bucket.successes += 1;
        if bucket.successes >= self.config.recovery_successes.max(1) {
            let now = Instant::now();
            bucket.refill(now, &self.config);
            bucket.rate_factor = (bucket.rate_factor * 2.0).min(1.0);
            bucket.successes = 0;
            debug!(rate_factor = bucket.rate_factor, "rate limiter ramping up");
        }
    }

    /// Records a throttle signal from the remote.
    pub fn on_throttled(&self, retry_after: Option<Duration>) {
        let backoff = retry_after.unwrap_or(self.config.default_backoff);
        let now = Instant::now();
        let until = now + backoff;

        let mut bucket = self.bucket.lock();
        bucket.tokens = 0.0;
        bucket.successes = 0;
        bucket.rate_factor = self.config.throttled_rate_factor;
        bucket.backoff_until = Some(bucket.backoff_until.map_or(until, |u| u.max(until)));
        bucket.last_refill = now;
        warn!(
            backoff_ms = backoff.as_millis() as u64,
            rate_factor = bucket.rate_factor,
            "remote throttled; backing off"
        );
    }

    /// Current state.
    pub fn state(&self) -> RateLimiterState {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now(), &self.config);
        RateLimiterState {
            tokens_remaining: bucket.tokens.floor() as u32,
            refill_rate: self.config.refill_per_sec * bucket.rate_factor,
            backoff_until: bucket.backoff_until,
        }
    }
}
