//! Rate Limiter (spec §4.2): a token bucket per source key, refilled by
//! elapsed wall-clock time. Mirrors the bucket/states-map shape of
//! `noa_server_gateway::rate_limit`, trimmed to in-memory state only — the
//! teacher's sqlite-backed persistence has no counterpart in scope here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(burst: u32) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, refill_per_sec: u32, burst: u32, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec as f64).min(burst as f64);
        self.last_refill = now;
    }

    fn try_admit(&mut self, refill_per_sec: u32, burst: u32, now: Instant) -> bool {
        self.refill(refill_per_sec, burst, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct RateLimiter {
    refill_per_sec: u32,
    burst: u32,
    buckets: Mutex<HashMap<String, Bucket>>,
    shutdown: Notify,
}

impl RateLimiter {
    pub fn new(refill_per_sec: u32, burst: u32) -> Self {
        Self {
            refill_per_sec,
            burst,
            buckets: Mutex::new(HashMap::new()),
            shutdown: Notify::new(),
        }
    }

    /// Admit a request from `key` (normally the caller's source IP). Returns
    /// `true` if a token was available and consumed.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(self.burst));
        bucket.try_admit(self.refill_per_sec, self.burst, now)
    }

    /// Drop buckets that have sat idle longer than `idle_ttl`, so a
    /// long-running process doesn't accumulate one bucket per ephemeral
    /// source IP forever. `idle_ttl` is the sweep cadence itself (see
    /// `spawn_sweeper`): a bucket untouched for a full sweep cycle is idle.
    pub fn sweep(&self, idle_ttl: Duration) {
        let now = Instant::now();
        self.buckets
            .lock()
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < idle_ttl);
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Spawn the background eviction loop on its own private timer, per
    /// spec §9 "Cooperative background tasks" (no shared scheduler across
    /// sweeps). The eviction age is `interval` itself, so the two can never
    /// drift apart the way a separately hardcoded TTL constant would.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => limiter.sweep(interval),
                    _ = limiter.shutdown.notified() => break,
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_burst_then_rejects() {
        let limiter = RateLimiter::new(1, 3);
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(!limiter.check("1.2.3.4"));
    }

    #[test]
    fn separate_keys_have_independent_buckets() {
        let limiter = RateLimiter::new(1, 1);
        assert!(limiter.check("a"));
        assert!(limiter.check("b"));
        assert!(!limiter.check("a"));
    }

    #[test]
    fn sweep_keeps_fresh_buckets() {
        let limiter = RateLimiter::new(1, 1);
        limiter.check("a");
        assert_eq!(limiter.bucket_count(), 1);
        limiter.sweep(Duration::from_secs(600));
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[test]
    fn sweep_evicts_buckets_older_than_the_given_ttl() {
        let limiter = RateLimiter::new(1, 1);
        limiter.check("a");
        assert_eq!(limiter.bucket_count(), 1);
        limiter.sweep(Duration::from_secs(0));
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn refill_restores_tokens_over_time() {
        let mut bucket = Bucket::new(2);
        let start = Instant::now();
        bucket.tokens = 0.0;
        bucket.last_refill = start;
        let later = start + Duration::from_secs(1);
        assert!(bucket.try_admit(2, 2, later));
    }
}
