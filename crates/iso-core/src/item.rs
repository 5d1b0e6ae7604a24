use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use iso_types::{Digest, HashAlgorithm};

use crate::compress::{compression_level_for, DEFAULT_LEVEL};
use crate::error::Result;

#[derive(Debug)]
enum Source {
    File(PathBuf),
    Buffer(Arc<[u8]>),
}

/// A blob to upload: a file on disk or an in-memory buffer.
///
/// The digest is computed on first use unless supplied up front. Items are
/// shared as `Arc<Item>` between the caller and the upload tasks and never
/// mutated after the digest is known.
#[derive(Debug)]
pub struct Item {
    source: Source,
    digest: OnceLock<Digest>,
    size: Option<u64>,
    high_priority: bool,
    compression_level: u32,
}

impl Item {
    /// A file item. `digest` and `size` may be supplied if already known.
    pub fn file(path: impl Into<PathBuf>, digest: Option<Digest>, size: Option<u64>) -> Self {
        let path = path.into();
        let compression_level = compression_level_for(&path);
        let size = size.or_else(|| digest.as_ref().and_then(Digest::size));
        let cell = OnceLock::new();
        if let Some(d) = digest {
            let _ = cell.set(d.with_size(size));
        }
        Self {
            source: Source::File(path),
            digest: cell,
            size,
            high_priority: false,
            compression_level,
        }
    }

    pub fn buffer(data: impl Into<Arc<[u8]>>) -> Self {
        let data = data.into();
        Self {
            size: Some(data.len() as u64),
            source: Source::Buffer(data),
            digest: OnceLock::new(),
            high_priority: false,
            compression_level: DEFAULT_LEVEL,
        }
    }

    /// Mark as small and critical (manifests): scheduled before data files.
    pub fn high_priority(mut self) -> Self {
        self.high_priority = true;
        self
    }

    pub fn is_high_priority(&self) -> bool {
        self.high_priority
    }

    pub fn compression_level(&self) -> u32 {
        self.compression_level
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            Source::File(p) => Some(p),
            Source::Buffer(_) => None,
        }
    }

    /// Compute the digest if it is not known yet.
    pub fn prepare(&self, algo: HashAlgorithm) -> Result<&Digest> {
        if let Some(d) = self.digest.get() {
            return Ok(d);
        }
        let computed = match &self.source {
            Source::Buffer(data) => Digest::of_bytes(algo, data),
            Source::File(path) => Digest::of_reader(algo, &mut File::open(path)?)?,
        };
        // A racing prepare computed the same value; either one is fine.
        Ok(self.digest.get_or_init(|| computed))
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.get()
    }

    pub fn size(&self) -> Option<u64> {
        self.digest.get().and_then(Digest::size).or(self.size)
    }

    /// A fresh reader over the content; called again on every retry.
    pub fn content(&self) -> Result<Box<dyn Read + Send>> {
        match &self.source {
            Source::File(path) => Ok(Box::new(File::open(path)?)),
            Source::Buffer(data) => Ok(Box::new(std::io::Cursor::new(Arc::clone(data)))),
        }
    }
}
