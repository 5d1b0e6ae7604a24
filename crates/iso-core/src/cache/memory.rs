use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use tracing::debug;

use iso_types::Digest;

use super::policy::{CacheIndex, CachePolicy};
use super::{now, ContentAddressedCache};
use crate::error::{IsoError, Result};

struct Inner {
    index: CacheIndex,
    blobs: HashMap<Digest, Arc<[u8]>>,
}

/// In-process cache, used when no cache directory is configured.
pub struct MemoryCache {
    policy: CachePolicy,
    inner: Mutex<Inner>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(CachePolicy::unbounded())
    }
}

impl MemoryCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Inner {
                index: CacheIndex::new(),
                blobs: HashMap::new(),
            }),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn protect(&self, digest: Option<Digest>) {
        self.inner.lock().unwrap().index.protect(digest);
    }
}

impl ContentAddressedCache for MemoryCache {
    fn contains(&self, digest: &Digest) -> bool {
        self.inner.lock().unwrap().index.contains(digest)
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }

    fn total_size(&self) -> u64 {
        self.inner.lock().unwrap().index.total_size()
    }

    fn cached_digests(&self) -> Vec<Digest> {
        let inner = self.inner.lock().unwrap();
        inner.index.entries().map(|(d, _)| d.clone()).collect()
    }

    fn write(&self, digest: &Digest, content: &mut dyn Iterator<Item = Result<Vec<u8>>>) -> Result<()> {
        let mut data = Vec::new();
        for chunk in content {
            data.extend_from_slice(&chunk?);
        }
        let size = data.len() as u64;
        let mut inner = self.inner.lock().unwrap();
        inner.blobs.insert(digest.clone(), Arc::from(data));
        inner.index.insert(digest.clone(), size, now());
        inner.index.protect(Some(digest.clone()));
        Ok(())
    }

    fn open(&self, digest: &Digest) -> Result<Box<dyn Read + Send>> {
        let mut inner = self.inner.lock().unwrap();
        let blob = inner
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| IsoError::CacheMiss(digest.hex().to_string()))?;
        inner.index.touch(digest, now());
        Ok(Box::new(Cursor::new(blob)))
    }

    fn touch(&self, digest: &Digest) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let actual = match inner.blobs.get(digest) {
            Some(blob) => blob.len() as u64,
            None => return false,
        };
        if digest.size().is_some_and(|expected| expected != actual) {
            return false;
        }
        inner.index.touch(digest, now())
    }

    fn evict(&self, digest: &Digest) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.index.remove(digest);
        inner.blobs.remove(digest);
        Ok(())
    }

    fn trim(&self) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let plan = inner.index.plan_trim(&self.policy, now(), None);
        for (digest, _) in &plan.evicted {
            inner.blobs.remove(digest);
        }
        if !plan.evicted.is_empty() {
            debug!(evicted = plan.evicted.len(), "memory cache trimmed");
        }
        Ok(plan.evicted.len())
    }

    fn cleanup(&self) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let stale: Vec<Digest> = inner
            .index
            .entries()
            .filter(|(d, _)| !inner.blobs.contains_key(*d))
            .map(|(d, _)| d.clone())
            .collect();
        for digest in &stale {
            inner.index.remove(digest);
        }
        let index = &inner.index;
        inner.blobs.retain(|d, _| index.contains(d));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.trim().map(|_| ())
    }
}
