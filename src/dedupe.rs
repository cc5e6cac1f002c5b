//! Dedupe cache (component B).
//!
//! Bounded `fingerprint -> arrival timestamp` mapping with LRU eviction at
//! a capacity and TTL expiry, behind a mutex so `observe` is safe to call
//! from any task.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

/// `(sender_user_id, message_id)` — the key spec §3 calls a fingerprint.
/// For file chunks, `message_id` is the composite `"{transfer_id}:{chunk_index}"`.
pub type Fingerprint = (String, String);

pub struct DedupeCache {
    inner: Mutex<LruCache<Fingerprint, Instant>>,
    ttl: Duration,
}

impl DedupeCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity.max(1)).unwrap();
        DedupeCache {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Returns `true` iff `fp` has not been seen within the TTL window
    /// (i.e. this arrival should be acted on). Always records the current
    /// arrival time for `fp`, including on a fresh "new" observation, so
    /// the TTL window slides forward — a busy fingerprint never ages out
    /// mid-conversation.
    pub fn observe(&self, fp: Fingerprint) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let now = Instant::now();
        let seen_recently = guard
            .get(&fp)
            .is_some_and(|&last| now.duration_since(last) < self.ttl);
        guard.put(fp, now);
        !seen_recently
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(sender: &str, msg_id: &str) -> Fingerprint {
        (sender.to_string(), msg_id.to_string())
    }

    #[test]
    fn first_observation_is_new() {
        let cache = DedupeCache::new(16, Duration::from_secs(60));
        assert!(cache.observe(fp("alice@1.1.1.1", "m1")));
    }

    #[test]
    fn repeat_observation_within_ttl_is_not_new() {
        let cache = DedupeCache::new(16, Duration::from_secs(60));
        assert!(cache.observe(fp("alice@1.1.1.1", "m1")));
        assert!(!cache.observe(fp("alice@1.1.1.1", "m1")));
        assert!(!cache.observe(fp("alice@1.1.1.1", "m1")));
    }

    #[test]
    fn repeat_observation_after_ttl_is_new_again() {
        let cache = DedupeCache::new(16, Duration::from_millis(20));
        assert!(cache.observe(fp("alice@1.1.1.1", "m1")));
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.observe(fp("alice@1.1.1.1", "m1")));
    }

    #[test]
    fn distinct_fingerprints_are_independent() {
        let cache = DedupeCache::new(16, Duration::from_secs(60));
        assert!(cache.observe(fp("alice@1.1.1.1", "m1")));
        assert!(cache.observe(fp("alice@1.1.1.1", "m2")));
        assert!(cache.observe(fp("bob@1.1.1.2", "m1")));
    }

    #[test]
    fn cache_bounded_by_capacity() {
        let cache = DedupeCache::new(2, Duration::from_secs(60));
        assert!(cache.observe(fp("a", "1")));
        assert!(cache.observe(fp("b", "1")));
        assert!(cache.observe(fp("c", "1"))); // evicts ("a","1")
        assert_eq!(cache.len(), 2);
        // ("a","1") was evicted, so it looks "new" again.
        assert!(cache.observe(fp("a", "1")));
    }
}
