//! Recently decided request ids, so a retried check gets its first answer
//! back instead of consuming again.
//!
//! The distributed tier already replays through its own markers; this cache
//! covers decisions made by the local tier, and repeats that would otherwise
//! be charged locally once the local bucket has refilled.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Recorded<T> {
    value: T,
    expires_at_millis: i64,
}

pub struct ReplayCache<T> {
    entries: DashMap<String, Recorded<T>>,
    ttl_millis: i64,
}

impl<T: Clone> ReplayCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_millis: ttl.as_millis().min(i64::MAX as u128) as i64,
        }
    }

    /// The value recorded for `request_id`, if it has not expired.
    pub fn get(&self, request_id: &str, now_millis: i64) -> Option<T> {
        self.entries
            .get(request_id)
            .filter(|recorded| recorded.expires_at_millis > now_millis)
            .map(|recorded| recorded.value.clone())
    }

    pub fn record(&self, request_id: &str, value: T, now_millis: i64) {
        self.entries.insert(
            request_id.to_string(),
            Recorded {
                value,
                expires_at_millis: now_millis.saturating_add(self.ttl_millis),
            },
        );
    }

    /// Replay the value recorded for `request_id`, or run `decide` while
    /// holding the entry and record what it returns.
    ///
    /// Concurrent callers with the same id are serialized, so `decide` runs
    /// at most once per live entry. `None` from `decide` records nothing.
    pub fn replay_or_decide<F>(&self, request_id: &str, now_millis: i64, decide: F) -> Option<T>
    where
        F: FnOnce() -> Option<T>,
    {
        let expires_at_millis = now_millis.saturating_add(self.ttl_millis);
        match self.entries.entry(request_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at_millis > now_millis {
                    return Some(occupied.get().value.clone());
                }
                match decide() {
                    Some(value) => {
                        occupied.insert(Recorded {
                            value: value.clone(),
                            expires_at_millis,
                        });
                        Some(value)
                    }
                    None => {
                        occupied.remove();
                        None
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let value = decide()?;
                vacant.insert(Recorded {
                    value: value.clone(),
                    expires_at_millis,
                });
                Some(value)
            }
        }
    }

    pub fn purge_expired(&self, now_millis: i64) {
        self.entries.retain(|_, recorded| recorded.expires_at_millis > now_millis);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
