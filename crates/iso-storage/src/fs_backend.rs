use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use iso_types::error::{IsoError, Result};
use iso_types::{Digest, Namespace};

use crate::{PushTicket, RemoteObjectStore};

/// Object store backed by a plain directory: one file per blob, named by its
/// hex digest.
pub struct FileSystemStore {
    root: PathBuf,
    location: String,
    namespace: Namespace,
}

impl FileSystemStore {
    /// Create a store rooted at the given directory, creating it if needed.
    pub fn new(root: impl AsRef<Path>, namespace: Namespace) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            location: root.to_string_lossy().into_owned(),
            root,
            namespace,
        })
    }

    fn object_path(&self, digest: &Digest) -> PathBuf {
        // Digest hex is validated on construction and cannot contain separators.
        self.root.join(digest.hex())
    }

    /// Write data to a temp file in the same directory, then atomically rename
    /// into place. This ensures readers never see a partial/corrupt file.
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.root);
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl RemoteObjectStore for FileSystemStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn contains(&self, digests: &[Digest]) -> Result<Vec<(usize, PushTicket)>> {
        let mut missing = Vec::new();
        for (i, digest) in digests.iter().enumerate() {
            match fs::metadata(self.object_path(digest)) {
                Ok(meta) if meta.is_file() => {}
                Ok(_) => missing.push((i, PushTicket::local())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    missing.push((i, PushTicket::local()))
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(missing)
    }

    fn push(&self, digest: &Digest, _ticket: &PushTicket, content: &[u8]) -> Result<()> {
        self.atomic_write(&self.object_path(digest), content)
    }

    fn fetch(&self, digest: &Digest, offset: u64) -> Result<Box<dyn Read + Send>> {
        let path = self.object_path(digest);
        let mut file = fs::File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => IsoError::Io(std::io::Error::new(
                e.kind(),
                format!("{} not found in {}", digest.hex(), self.location),
            )),
            _ => IsoError::Io(e),
        })?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        Ok(Box::new(file))
    }
}
