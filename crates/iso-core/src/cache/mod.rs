//! Local content-addressed caches.
//!
//! A cache keeps blobs keyed by digest under a [`CachePolicy`]. The index,
//! LRU order and protected entry of one instance sit behind a single lock;
//! every mutation goes through it. Trimming happens on open, on close and on
//! explicit request, so a session may run over its limits while it populates
//! the working set of one task.

mod disk;
mod memory;
mod policy;

use std::io::Read;
use std::path::PathBuf;

use iso_types::Digest;

use crate::error::Result;

pub use disk::DiskCache;
pub use memory::MemoryCache;
pub use policy::{CacheEntry, CachePolicy, GIB};

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub trait ContentAddressedCache: Send + Sync {
    fn contains(&self, digest: &Digest) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn total_size(&self) -> u64;

    /// Every indexed digest, least recently used first.
    fn cached_digests(&self) -> Vec<Digest>;

    /// Store a blob from a chunk stream and make it the most recently used
    /// and protected entry. An error yielded by `content` is returned as is
    /// and nothing is committed.
    fn write(&self, digest: &Digest, content: &mut dyn Iterator<Item = Result<Vec<u8>>>) -> Result<()>;

    /// Whole blob. Fails with [`IsoError::CacheMiss`](crate::error::IsoError::CacheMiss)
    /// when absent.
    fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.open(digest)?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn open(&self, digest: &Digest) -> Result<Box<dyn Read + Send>>;

    /// On-disk location of a cached blob, for caches that have one.
    fn path(&self, _digest: &Digest) -> Option<PathBuf> {
        None
    }

    /// Check the blob is still there (and of the digest's size when known),
    /// refreshing its timestamp. Never fails; `false` means "fetch again".
    fn touch(&self, digest: &Digest) -> bool;

    /// Remove a blob and its index entry. Absent blobs are not an error.
    fn evict(&self, digest: &Digest) -> Result<()>;

    /// Enforce the policy; returns how many entries were evicted.
    fn trim(&self) -> Result<usize>;

    /// Reconcile the index with what is actually stored.
    fn cleanup(&self) -> Result<()>;

    /// Final trim and, for persistent caches, save the index.
    fn close(&self) -> Result<()>;
}
