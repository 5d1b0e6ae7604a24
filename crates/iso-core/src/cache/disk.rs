use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use iso_types::{Digest, HashAlgorithm};

use super::policy::{CacheIndex, CachePolicy};
use super::{now, ContentAddressedCache};
use crate::error::{IsoError, Result};
use crate::platform::fs::available_free_space;

const STATE_FILE: &str = "state.mp";
const STATE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StateFile {
    version: u32,
    algo: String,
    /// Least recently used first.
    entries: Vec<StateRecord>,
}

#[derive(Serialize, Deserialize)]
struct StateRecord {
    digest: String,
    size: u64,
    last_access: i64,
}

/// Blobs stored one file per digest under a directory, with the index
/// persisted next to them in a MessagePack state file.
///
/// Opening loads the state, drops entries whose blob vanished, removes files
/// nobody indexes and trims. It fails with [`IsoError::NoMoreSpace`] when the
/// disk cannot offer the configured headroom even with the cache emptied.
pub struct DiskCache {
    root: PathBuf,
    policy: CachePolicy,
    algo: HashAlgorithm,
    index: Mutex<CacheIndex>,
    closed: AtomicBool,
}

impl DiskCache {
    pub fn open(root: impl Into<PathBuf>, policy: CachePolicy, algo: HashAlgorithm) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let cache = Self {
            root,
            policy,
            algo,
            index: Mutex::new(CacheIndex::new()),
            closed: AtomicBool::new(false),
        };
        cache.load();
        cache.cleanup()?;
        cache.trim()?;
        info!(
            root = %cache.root.display(),
            items = cache.len(),
            size = cache.total_size(),
            "disk cache opened"
        );
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn protect(&self, digest: Option<Digest>) {
        self.index.lock().unwrap().protect(digest);
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(digest.hex())
    }

    fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    fn load(&self) {
        let path = self.state_path();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("failed to read cache state {}: {e}", path.display());
                return;
            }
        };
        let state: StateFile = match rmp_serde::from_slice(&data) {
            Ok(state) => state,
            Err(e) => {
                warn!("discarding corrupted cache state {}: {e}", path.display());
                return;
            }
        };
        if state.version != STATE_VERSION || state.algo != self.algo.name() {
            warn!(
                "discarding cache state version {} for {}",
                state.version, state.algo
            );
            return;
        }
        let mut index = self.index.lock().unwrap();
        for record in state.entries {
            match Digest::new(self.algo, record.digest, Some(record.size)) {
                Ok(digest) => index.insert(digest, record.size, record.last_access),
                Err(e) => warn!("skipping cache state record: {e}"),
            }
        }
    }

    /// Write the index atomically.
    pub fn persist(&self) -> Result<()> {
        let state = {
            let index = self.index.lock().unwrap();
            StateFile {
                version: STATE_VERSION,
                algo: self.algo.name().to_string(),
                entries: index
                    .entries()
                    .map(|(d, e)| StateRecord {
                        digest: d.hex().to_string(),
                        size: e.size,
                        last_access: e.last_access,
                    })
                    .collect(),
            }
        };
        let data = rmp_serde::to_vec(&state)?;
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(&data)?;
        tmp.persist(self.state_path()).map_err(|e| e.error)?;
        Ok(())
    }

    fn blob_size(&self, digest: &Digest) -> Option<u64> {
        fs::metadata(self.blob_path(digest)).ok().map(|m| m.len())
    }
}

impl ContentAddressedCache for DiskCache {
    fn contains(&self, digest: &Digest) -> bool {
        self.index.lock().unwrap().contains(digest)
    }

    fn len(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    fn total_size(&self) -> u64 {
        self.index.lock().unwrap().total_size()
    }

    fn cached_digests(&self) -> Vec<Digest> {
        let index = self.index.lock().unwrap();
        index.entries().map(|(d, _)| d.clone()).collect()
    }

    fn write(&self, digest: &Digest, content: &mut dyn Iterator<Item = Result<Vec<u8>>>) -> Result<()> {
        let cache_err = |e: std::io::Error| IsoError::CacheWrite {
            digest: digest.hex().to_string(),
            reason: e.to_string(),
        };
        fs::create_dir_all(&self.root).map_err(cache_err)?;
        let mut tmp = NamedTempFile::new_in(&self.root).map_err(cache_err)?;
        let mut size = 0u64;
        for chunk in content {
            let chunk = chunk?;
            tmp.write_all(&chunk).map_err(cache_err)?;
            size += chunk.len() as u64;
        }
        tmp.flush().map_err(cache_err)?;

        // Rename under the lock so a concurrent trim never sees a blob
        // without its entry.
        let mut index = self.index.lock().unwrap();
        tmp.persist(self.blob_path(digest))
            .map_err(|e| cache_err(e.error))?;
        index.insert(digest.clone(), size, now());
        index.protect(Some(digest.clone()));
        Ok(())
    }

    fn open(&self, digest: &Digest) -> Result<Box<dyn Read + Send>> {
        let mut index = self.index.lock().unwrap();
        if !index.contains(digest) {
            return Err(IsoError::CacheMiss(digest.hex().to_string()));
        }
        match File::open(self.blob_path(digest)) {
            Ok(file) => {
                index.touch(digest, now());
                Ok(Box::new(file))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                index.remove(digest);
                Err(IsoError::CacheMiss(digest.hex().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn path(&self, digest: &Digest) -> Option<PathBuf> {
        self.contains(digest).then(|| self.blob_path(digest))
    }

    fn touch(&self, digest: &Digest) -> bool {
        let Some(actual) = self.blob_size(digest) else {
            return false;
        };
        if digest.size().is_some_and(|expected| expected != actual) {
            return false;
        }
        self.index.lock().unwrap().touch(digest, now())
    }

    fn evict(&self, digest: &Digest) -> Result<()> {
        let mut index = self.index.lock().unwrap();
        index.remove(digest);
        match fs::remove_file(self.blob_path(digest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn trim(&self) -> Result<usize> {
        let mut index = self.index.lock().unwrap();
        let free = available_free_space(&self.root);
        let plan = index.plan_trim(&self.policy, now(), free);
        for (digest, _) in &plan.evicted {
            if let Err(e) = fs::remove_file(self.blob_path(digest)) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove {}: {e}", digest.short());
                }
            }
        }
        if !plan.evicted.is_empty() {
            let freed: u64 = plan.evicted.iter().map(|(_, e)| e.size).sum();
            info!(
                evicted = plan.evicted.len(),
                freed,
                remaining = index.len(),
                "disk cache trimmed"
            );
        }
        if plan.short_of_space {
            return Err(IsoError::NoMoreSpace(format!(
                "{} bytes free in {}, at least {} required",
                available_free_space(&self.root).unwrap_or(0),
                self.root.display(),
                self.policy.min_free_space
            )));
        }
        Ok(plan.evicted.len())
    }

    fn cleanup(&self) -> Result<()> {
        let mut index = self.index.lock().unwrap();

        let indexed: Vec<Digest> = index.entries().map(|(d, _)| d.clone()).collect();
        for digest in indexed {
            let expected = index.peek(&digest).map(|e| e.size);
            let actual = fs::metadata(self.blob_path(&digest)).ok().map(|m| m.len());
            if actual.is_none() || actual != expected {
                debug!("dropping stale cache entry {}", digest.short());
                index.remove(&digest);
                let _ = fs::remove_file(self.blob_path(&digest));
            }
        }

        let mut orphans = 0usize;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == STATE_FILE {
                continue;
            }
            let known = Digest::new(self.algo, name.to_string(), None)
                .map(|d| index.contains(&d))
                .unwrap_or(false);
            if known {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                warn!("unexpected directory in cache: {}", path.display());
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => orphans += 1,
                Err(e) => warn!("failed to remove orphan {}: {e}", path.display()),
            }
        }
        if orphans > 0 {
            info!(orphans, "removed unindexed files from cache");
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let trimmed = self.trim();
        self.persist()?;
        trimmed.map(|_| ())
    }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to close disk cache {}: {e}", self.root.display());
        }
    }
}
