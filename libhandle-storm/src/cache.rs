use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::types::CheckOutcome;

/// Short-lived in-memory results, independent of the persistent cooldown store.
pub struct ResultCache {
    entries: DashMap<String, (CheckOutcome, Instant)>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, candidate: &str) -> Option<CheckOutcome> {
        let now = Instant::now();
        let hit = self.entries.get(candidate).and_then(|entry| {
            let (outcome, expires_at) = entry.value();
            (*expires_at > now).then(|| outcome.clone())
        });

        if hit.is_none() {
            self.entries.remove_if(candidate, |_, (_, expires_at)| *expires_at <= now);
        }
        hit
    }

    pub fn insert(&self, outcome: CheckOutcome) {
        if self.ttl.is_zero() {
            return;
        }
        let expires_at = Instant::now() + self.ttl;
        self.entries
            .insert(outcome.candidate.clone(), (outcome, expires_at));
    }

    /// Drops expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_within_ttl() {
        let cache = ResultCache::new(Duration::from_secs(60));
        cache.insert(CheckOutcome::available("abc", "Username is available"));
        let hit = cache.get("abc").unwrap();
        assert!(hit.is_available);
        assert!(cache.get("abd").is_none());
    }

    #[test]
    fn entries_expire() {
        let cache = ResultCache::new(Duration::from_millis(10));
        cache.insert(CheckOutcome::taken("abc", "Code: 1"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("abc").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn purge_removes_only_expired() {
        let cache = ResultCache::new(Duration::from_millis(10));
        cache.insert(CheckOutcome::taken("old", "Code: 1"));
        std::thread::sleep(Duration::from_millis(20));
        cache.insert(CheckOutcome::taken("new", "Code: 1"));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let cache = ResultCache::new(Duration::ZERO);
        cache.insert(CheckOutcome::taken("abc", "Code: 1"));
        assert!(cache.get("abc").is_none());
    }
}
