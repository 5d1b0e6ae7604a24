use std::time::Duration;

use lru::LruCache;

use iso_types::Digest;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Resource bounds enforced by [`trim`](super::ContentAddressedCache::trim).
/// A zero limit (or `None` age) disables that constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub max_size: u64,
    pub min_free_space: u64,
    pub max_items: usize,
    pub max_age: Option<Duration>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            max_size: 50 * GIB,
            min_free_space: 2 * GIB,
            max_items: 100_000,
            max_age: Some(Duration::from_secs(21 * 24 * 60 * 60)),
        }
    }
}

impl CachePolicy {
    /// No limits at all; useful for scratch caches and tests.
    pub fn unbounded() -> Self {
        Self {
            max_size: 0,
            min_free_space: 0,
            max_items: 0,
            max_age: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub size: u64,
    /// Unix seconds.
    pub last_access: i64,
}

/// Outcome of [`CacheIndex::plan_trim`]. Entries listed here are already gone
/// from the index; their blobs still need removing.
#[derive(Debug, Default)]
pub(crate) struct TrimPlan {
    pub evicted: Vec<(Digest, CacheEntry)>,
    pub short_of_space: bool,
}

/// LRU bookkeeping shared by the cache implementations. Not thread-safe on
/// its own; each cache keeps it behind its single lock.
pub(crate) struct CacheIndex {
    lru: LruCache<Digest, CacheEntry>,
    total_size: u64,
    protected: Option<Digest>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self {
            lru: LruCache::unbounded(),
            total_size: 0,
            protected: None,
        }
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.lru.contains(digest)
    }

    pub fn peek(&self, digest: &Digest) -> Option<CacheEntry> {
        self.lru.peek(digest).copied()
    }

    /// Add or replace an entry as the most recently used one.
    pub fn insert(&mut self, digest: Digest, size: u64, now: i64) {
        let entry = CacheEntry {
            size,
            last_access: now,
        };
        if let Some(old) = self.lru.put(digest, entry) {
            self.total_size -= old.size;
        }
        self.total_size += size;
    }

    /// Mark as most recently used. `false` if unknown.
    pub fn touch(&mut self, digest: &Digest, now: i64) -> bool {
        match self.lru.get_mut(digest) {
            Some(entry) => {
                entry.last_access = now;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, digest: &Digest) -> Option<CacheEntry> {
        let entry = self.lru.pop(digest)?;
        self.total_size -= entry.size;
        if self.protected.as_ref() == Some(digest) {
            self.protected = None;
        }
        Some(entry)
    }

    pub fn protect(&mut self, digest: Option<Digest>) {
        self.protected = digest;
    }

    pub fn protected(&self) -> Option<&Digest> {
        self.protected.as_ref()
    }

    /// Entries from least to most recently used.
    pub fn entries(&self) -> impl Iterator<Item = (&Digest, &CacheEntry)> {
        self.lru.iter().rev()
    }

    fn next_victim(&self) -> Option<(Digest, CacheEntry)> {
        self.entries()
            .find(|(d, _)| self.protected.as_ref() != Some(*d))
            .map(|(d, e)| (d.clone(), *e))
    }

    /// Drop least recently used entries until `policy` holds, never touching
    /// the protected entry. `free_space` is the current disk headroom, if the
    /// cache lives on disk.
    pub fn plan_trim(&mut self, policy: &CachePolicy, now: i64, free_space: Option<u64>) -> TrimPlan {
        let cutoff = policy
            .max_age
            .map(|age| now.saturating_sub(i64::try_from(age.as_secs()).unwrap_or(i64::MAX)));
        let mut plan = TrimPlan::default();
        let mut freed = 0u64;
        let low_space = |freed: u64| {
            policy.min_free_space > 0
                && free_space.is_some_and(|free| free.saturating_add(freed) < policy.min_free_space)
        };

        while let Some((digest, entry)) = self.next_victim() {
            let expired = cutoff.is_some_and(|c| entry.last_access < c);
            let too_many = policy.max_items > 0 && self.lru.len() > policy.max_items;
            let too_big = policy.max_size > 0 && self.total_size > policy.max_size;
            if !(expired || too_many || too_big || low_space(freed)) {
                break;
            }
            self.remove(&digest);
            freed += entry.size;
            plan.evicted.push((digest, entry));
        }
        plan.short_of_space = low_space(freed);
        plan
    }
}
