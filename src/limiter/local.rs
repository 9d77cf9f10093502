//! Process-local token buckets, the fast path.
//!
//! One state per (tenant, resource), created full on first access and refilled
//! lazily. The map itself is a bounded LRU; its lock is held only to find or
//! create a slot, while refill-then-deduct runs under the slot's own lock so
//! unrelated keys never contend.

use crate::policy::PolicyKey;
use lru::LruCache;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LocalBucketState {
    pub capacity: u64,
    /// Published rate, used to notice policy edits
    refill_rate_config: Decimal,
    /// Same rate as a float for the refill arithmetic
    pub refill_rate: f64,
    pub tokens: f64,
    pub last_refill_millis: i64,
}

impl LocalBucketState {
    fn full(capacity: u64, refill_rate: Decimal, now_millis: i64) -> Self {
        Self {
            capacity,
            refill_rate_config: refill_rate,
            refill_rate: refill_rate.to_f64().unwrap_or(0.0),
            tokens: capacity as f64,
            last_refill_millis: now_millis,
        }
    }

    /// Credit tokens for the time since the last refill. Zero or negative
    /// elapsed time leaves the state untouched.
    fn refill(&mut self, now_millis: i64) {
        let elapsed_millis = now_millis - self.last_refill_millis;
        if elapsed_millis <= 0 {
            return;
        }

        let delta = self.refill_rate * (elapsed_millis as f64 / 1000.0);
        self.tokens = (self.tokens + delta).min(self.capacity as f64);
        self.last_refill_millis = now_millis;
    }

    /// Adopt edited policy parameters without resetting the fill level.
    fn adopt(&mut self, capacity: u64, refill_rate: Decimal) {
        if self.capacity != capacity {
            self.capacity = capacity;
            self.tokens = self.tokens.min(capacity as f64);
        }
        if self.refill_rate_config != refill_rate {
            self.refill_rate_config = refill_rate;
            self.refill_rate = refill_rate.to_f64().unwrap_or(0.0);
        }
    }

    fn try_take(&mut self, tokens: u64) -> bool {
        let requested = tokens as f64;
        if self.tokens >= requested {
            self.tokens -= requested;
            true
        } else {
            false
        }
    }
}

type Slot = Arc<Mutex<LocalBucketState>>;

pub struct LocalBucketEngine {
    buckets: Mutex<LruCache<PolicyKey, Slot>>,
}

impl LocalBucketEngine {
    pub fn new(max_buckets: NonZeroUsize) -> Self {
        Self {
            buckets: Mutex::new(LruCache::new(max_buckets)),
        }
    }

    /// Refill, then deduct `tokens` if enough are available.
    pub fn try_consume(
        &self,
        tenant_id: &str,
        resource_key: &str,
        capacity: u64,
        refill_rate: Decimal,
        tokens: u64,
        now_millis: i64,
    ) -> bool {
        let key = PolicyKey::new(tenant_id, resource_key);

        let (slot, fresh) = {
            let mut buckets = self.buckets.lock();
            match buckets.get(&key) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(Mutex::new(LocalBucketState::full(
                        capacity,
                        refill_rate,
                        now_millis,
                    )));
                    if let Some((evicted, _)) = buckets.push(key.clone(), Arc::clone(&slot)) {
                        if evicted != key {
                            debug!("Evicted local bucket {}", evicted);
                        }
                    }
                    (slot, true)
                }
            }
        };

        let mut state = slot.lock();
        if !fresh {
            state.adopt(capacity, refill_rate);
            state.refill(now_millis);
        }
        state.try_take(tokens)
    }

    /// Whole tokens left after refilling to `now_millis`; zero for an unknown key.
    pub fn estimate_remaining(&self, tenant_id: &str, resource_key: &str, now_millis: i64) -> u64 {
        let key = PolicyKey::new(tenant_id, resource_key);
        let slot = match self.buckets.lock().get(&key) {
            Some(slot) => Arc::clone(slot),
            None => return 0,
        };

        let mut state = slot.lock();
        state.refill(now_millis);
        state.tokens.floor().max(0.0) as u64
    }

    /// Copy of the state for a key, without refilling or touching recency.
    pub fn snapshot(&self, tenant_id: &str, resource_key: &str) -> Option<LocalBucketState> {
        let key = PolicyKey::new(tenant_id, resource_key);
        let slot = self.buckets.lock().peek(&key).map(Arc::clone)?;
        let state = slot.lock().clone();
        Some(state)
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.lock().is_empty()
    }
}
