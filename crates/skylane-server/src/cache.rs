use dashmap::DashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub trait CacheEntry {
    fn fetched_at(&self) -> Instant;

    fn last_used(&self) -> Instant {
        self.fetched_at()
    }

    fn is_expired(&self, now: Instant, max_age: Duration) -> bool {
        now.saturating_duration_since(self.fetched_at()) > max_age
    }
}

/// Drop expired entries, then least recently used ones until at most
/// `max_entries` remain.
pub fn prune_cache<K, V>(cache: &DashMap<K, V>, max_entries: usize, max_age: Duration)
where
    K: Clone + Eq + Hash,
    V: CacheEntry,
{
    let now = Instant::now();
    cache.retain(|_, value| !value.is_expired(now, max_age));

    if cache.len() <= max_entries {
        return;
    }

    let mut entries: Vec<(K, Instant)> = cache
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().last_used()))
        .collect();
    entries.sort_by_key(|(_, last_used)| *last_used);
    for (key, _) in entries {
        if cache.len() <= max_entries {
            break;
        }
        cache.remove(&key);
    }
}
