//! # Token Bucket Rate Limiting
//!
//! Generic token-bucket primitive used by the connection throttler, the
//! service router's work budgets, and the gateway's tunnel quotas.
//!
//! ## Design
//!
//! A bucket holds a capacity and a continuous refill rate. Consumption
//! lazily recomputes available tokens from elapsed time, so no background
//! timer is needed and an idle bucket costs nothing.
//!
//! Per-key bucket maps are bounded with `LruCache`: the keyspace (peer ids,
//! endpoint addresses) is attacker-controlled, so unbounded growth would be
//! a memory-exhaustion vector.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Instant;

use lru::LruCache;

/// A single token bucket with lazy elapsed-time refill.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            tokens: capacity as f64,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_update = now;
    }

    /// Consume one token. Returns false when the bucket is empty.
    pub fn try_consume(&mut self) -> bool {
        self.try_consume_n(1.0)
    }

    /// Consume `n` tokens atomically. Either all are taken or none.
    pub fn try_consume_n(&mut self, n: f64) -> bool {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Return a previously consumed token (cancellation path).
    /// Never exceeds capacity.
    pub fn release(&mut self) {
        self.refill();
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }

    /// Currently available tokens (after refill).
    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

/// Bounded map of per-key token buckets.
///
/// All keys share one capacity/rate configuration; a key's bucket is created
/// full on first sight. Least-recently-used keys are evicted when the map is
/// at capacity, which for an evicted-then-revisited key means a fresh (full)
/// bucket - acceptable, since the bound exists to protect memory, not to
/// remember every key forever.
pub struct KeyedBuckets<K: Hash + Eq> {
    buckets: Mutex<LruCache<K, TokenBucket>>,
    capacity: u32,
    refill_per_sec: f64,
}

impl<K: Hash + Eq> KeyedBuckets<K> {
    pub fn new(max_keys: usize, capacity: u32, refill_per_sec: f64) -> Self {
        let max_keys = NonZeroUsize::new(max_keys.max(1)).expect("max(1) is non-zero");
        Self {
            buckets: Mutex::new(LruCache::new(max_keys)),
            capacity,
            refill_per_sec,
        }
    }

    /// Consume one token from the key's bucket.
    pub fn try_consume(&self, key: K) -> bool {
        self.try_consume_n(key, 1.0)
    }

    /// Consume `n` tokens from the key's bucket.
    pub fn try_consume_n(&self, key: K, n: f64) -> bool {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let capacity = self.capacity;
        let refill = self.refill_per_sec;
        let bucket = buckets.get_or_insert_mut(key, || TokenBucket::new(capacity, refill));
        bucket.try_consume_n(n)
    }

    /// Return one token to the key's bucket (cancellation path).
    pub fn release(&self, key: &K) {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(bucket) = buckets.get_mut(key) {
            bucket.release();
        }
    }

    /// Available tokens for a key; full capacity if the key is untracked.
    pub fn available(&self, key: &K) -> f64 {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match buckets.get_mut(key) {
            Some(bucket) => bucket.available(),
            None => self.capacity as f64,
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
