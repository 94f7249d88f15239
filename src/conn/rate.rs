//! Per-descriptor command rate limiting. Each live descriptor gets a
//! token bucket; commands past the burst allowance are dropped before
//! they reach the queue. The periodic cleanup timer prunes buckets
//! whose descriptors are gone.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Commands a descriptor may burst before throttling kicks in.
pub const BUCKET_CAPACITY: f64 = 30.0;

/// Steady-state refill, commands per second.
pub const REFILL_PER_SEC: f64 = 2.0;

/// Buckets untouched this long belong to dead descriptors.
const STALE_AFTER: Duration = Duration::from_secs(300);

struct Bucket {
    tokens: f64,
    touched: Instant,
}

#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<u64, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes one token for `id`, refilling for the time elapsed since
    /// the last command. False means the command should be dropped.
    pub fn allow(&self, id: u64) -> bool {
        let mut buckets = self.buckets.lock().expect("rate lock poisoned");
        let now = Instant::now();

        let bucket = buckets.entry(id).or_insert(Bucket {
            tokens: BUCKET_CAPACITY,
            touched: now,
        });

        let elapsed = now.duration_since(bucket.touched).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * REFILL_PER_SEC).min(BUCKET_CAPACITY);
        bucket.touched = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drops the bucket for a closed descriptor right away.
    pub fn forget(&self, id: u64) {
        self.buckets.lock().expect("rate lock poisoned").remove(&id);
    }

    /// Prunes buckets idle past the staleness window. Returns how many
    /// were dropped.
    pub fn cleanup(&self) -> usize {
        self.cleanup_older_than(STALE_AFTER)
    }

    pub fn cleanup_older_than(&self, stale: Duration) -> usize {
        let mut buckets = self.buckets.lock().expect("rate lock poisoned");
        let before = buckets.len();
        let now = Instant::now();
        buckets.retain(|_, b| now.duration_since(b.touched) < stale);
        before - buckets.len()
    }

    pub fn tracked(&self) -> usize {
        self.buckets.lock().expect("rate lock poisoned").len()
    }
}
