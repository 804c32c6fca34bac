//! Probe Rate Limiting - Token bucket pacing of outbound probes
//!
//! Capacity is `rate × burst_multiplier` tokens (at least one), refilled
//! continuously at `rate` tokens per minute. Each probe costs one token.
//! Time comes from `tokio::time` so the bucket follows a paused test clock.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Tolerance when comparing the token level against one whole token.
const TOKEN_EPSILON: f64 = 1e-9;

/// Re-check interval of `acquire` while the rate is zero.
const ZERO_RATE_POLL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    rate_per_minute: f64,
    burst_multiplier: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        if self.rate_per_minute > 0.0 {
            let added = elapsed.as_secs_f64() * self.rate_per_minute / 60.0;
            self.tokens = (self.tokens + added).min(self.capacity);
        }
    }

    /// Take one token, or report how long until one is available.
    fn take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.rate_per_minute <= 0.0 {
            return Err(ZERO_RATE_POLL);
        }
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            return Ok(());
        }

        let missing = 1.0 - self.tokens;
        let millis = (missing * 60_000.0 / self.rate_per_minute).ceil().max(1.0);
        Err(Duration::from_millis(millis as u64))
    }
}

fn capacity_for(rate_per_minute: f64, burst_multiplier: f64) -> f64 {
    (rate_per_minute * burst_multiplier).max(1.0)
}

/// Token bucket shared by the queue-processing loop.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket.
    pub fn new(rate_per_minute: f64, burst_multiplier: f64) -> Self {
        let rate_per_minute = rate_per_minute.max(0.0);
        let capacity = capacity_for(rate_per_minute, burst_multiplier);
        Self {
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                capacity,
                rate_per_minute,
                burst_multiplier,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.bucket.lock().take(Instant::now()).is_ok()
    }

    /// Wait until a token is available and take it.
    ///
    /// With a zero rate this only returns after `set_rate` re-enables sending.
    pub async fn acquire(&self) {
        loop {
            // Lock released before sleeping
            let wait = match self.bucket.lock().take(Instant::now()) {
                Ok(()) => return,
                Err(wait) => wait,
            };
            debug!(wait_ms = wait.as_millis() as u64, "Waiting for probe token");
            sleep(wait).await;
        }
    }

    /// Change the refill rate, keeping the tokens accumulated so far.
    pub fn set_rate(&self, rate_per_minute: f64) {
        let rate_per_minute = rate_per_minute.max(0.0);
        let mut bucket = self.bucket.lock();
        if (bucket.rate_per_minute - rate_per_minute).abs() < f64::EPSILON {
            return;
        }

        bucket.refill(Instant::now());
        info!(
            from = bucket.rate_per_minute,
            to = rate_per_minute,
            "Probe rate changed"
        );
        bucket.rate_per_minute = rate_per_minute;
        bucket.capacity = capacity_for(rate_per_minute, bucket.burst_multiplier);
        bucket.tokens = bucket.tokens.min(bucket.capacity);
    }

    /// Current refill rate in tokens per minute.
    pub fn rate(&self) -> f64 {
        self.bucket.lock().rate_per_minute
    }

    /// Tokens available now.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.tokens
    }

    /// Bucket capacity in tokens.
    pub fn capacity(&self) -> f64 {
        self.bucket.lock().capacity
    }
}
