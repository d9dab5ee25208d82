//! In-memory front for the proposal store.
//!
//! Holds proposal data for recent votes so an execution rarely touches the
//! durable store. Bounded by entry count and age; a miss falls through to the
//! [`ProposalStore`](crate::pending::ProposalStore).

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_PROPOSAL_CACHE_SIZE: usize = 50_000;
pub const DEFAULT_PROPOSAL_CACHE_TTL_SECS: u64 = 86_400; // 24 hours

/// Proposal key to value, dropping the oldest entry when full and hiding
/// entries older than the TTL.
pub struct BoundedPendingCache<T> {
    map: HashMap<[u8; 32], (T, Instant)>,
    max_size: usize,
    ttl: Duration,
}

impl<T> BoundedPendingCache<T> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            map: HashMap::new(),
            max_size: max_size.max(1),
            ttl,
        }
    }

    pub fn get(&self, key: &[u8; 32]) -> Option<&T> {
        match self.map.get(key) {
            Some((value, at)) if at.elapsed() < self.ttl => Some(value),
            _ => None,
        }
    }

    pub fn insert(&mut self, key: [u8; 32], value: T) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.map.retain(|_, (_, at)| now.duration_since(*at) < ttl);

        if self.map.len() >= self.max_size && !self.map.contains_key(&key) {
            if let Some(oldest) = self
                .map
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(k, _)| *k)
            {
                self.map.remove(&oldest);
            }
        }
        self.map.insert(key, (value, now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> [u8; 32] {
        [n; 32]
    }

    #[test]
    fn test_insert_and_get() {
        let mut cache = BoundedPendingCache::new(10, Duration::from_secs(60));
        cache.insert(key(1), "a");
        assert_eq!(cache.get(&key(1)), Some(&"a"));
        assert_eq!(cache.get(&key(2)), None);
    }

    #[test]
    fn test_full_cache_drops_oldest() {
        let mut cache = BoundedPendingCache::new(2, Duration::from_secs(60));
        cache.insert(key(1), 1);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(key(2), 2);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(key(3), 3);

        assert!(cache.get(&key(1)).is_none());
        assert_eq!(cache.get(&key(2)), Some(&2));
        assert_eq!(cache.get(&key(3)), Some(&3));
    }

    #[test]
    fn test_overwrite_keeps_other_entries() {
        let mut cache = BoundedPendingCache::new(2, Duration::from_secs(60));
        cache.insert(key(1), 1);
        cache.insert(key(2), 2);
        cache.insert(key(2), 20);

        assert_eq!(cache.get(&key(1)), Some(&1));
        assert_eq!(cache.get(&key(2)), Some(&20));
    }

    #[test]
    fn test_expired_entries_are_hidden() {
        let mut cache = BoundedPendingCache::new(10, Duration::from_millis(1));
        cache.insert(key(1), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&key(1)).is_none());
    }
}
