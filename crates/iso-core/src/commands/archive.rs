use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::Arc;

use rayon::prelude::*;
use regex::Regex;
use tracing::{debug, info};
use walkdir::WalkDir;

use iso_types::{Digest, HashAlgorithm};

use crate::error::{IsoError, Result};
use crate::item::Item;
use crate::manifest::{FileEntry, FileKind, Manifest};
use crate::platform::fs::file_mode;
use crate::storage::Storage;

/// Patterns skipped when archiving a directory, matched against paths
/// relative to it using `/` separators.
pub const DEFAULT_BLACKLIST: &[&str] = &[r"^.+\.(?:pyc|swp)$", r"^(?:.+/|)\.(?:git|svn)$"];

#[derive(Debug, Clone)]
pub struct Blacklist(Vec<Regex>);

impl Blacklist {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref())
                    .map_err(|e| IsoError::Config(format!("invalid blacklist pattern: {e}")))
            })
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    pub fn is_match(&self, relpath: &str) -> bool {
        self.0.iter().any(|re| re.is_match(relpath))
    }
}

impl Default for Blacklist {
    fn default() -> Self {
        Self(
            DEFAULT_BLACKLIST
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
        )
    }
}

#[derive(Debug, Default)]
pub struct ArchiveResult {
    /// Digest of each input path; directories map to their manifest.
    pub results: Vec<(Digest, PathBuf)>,
    /// Items the store did not have.
    pub uploaded: Vec<Arc<Item>>,
    /// Items the store already had.
    pub cached: Vec<Arc<Item>>,
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(rel.to_string_lossy().replace(MAIN_SEPARATOR, "/"))
}

/// Hash everything under `root` and build its file map.
///
/// Symlinks are recorded as links, not followed. Returned items point at the
/// regular files and already carry their digest.
pub fn directory_to_metadata(
    root: &Path,
    algo: HashAlgorithm,
    blacklist: &Blacklist,
) -> Result<(Vec<Arc<Item>>, BTreeMap<String, FileEntry>)> {
    let mut regular = Vec::new();
    let mut files = BTreeMap::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            relative_name(root, e.path()).map_or(true, |rel| !blacklist.is_match(&rel))
        });
    for entry in walker {
        let entry = entry.map_err(|e| IsoError::Other(format!("walking {}: {e}", root.display())))?;
        let Some(rel) = relative_name(root, entry.path()) else {
            continue;
        };
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            files.insert(
                rel.replace('/', &MAIN_SEPARATOR.to_string()),
                FileEntry::Symlink {
                    target: target.to_string_lossy().into_owned(),
                },
            );
        } else if file_type.is_file() {
            regular.push((rel, entry.into_path()));
        }
    }

    let hashed: Vec<(String, PathBuf, Digest, Option<u32>)> = regular
        .into_par_iter()
        .map(|(rel, path)| -> Result<(String, PathBuf, Digest, Option<u32>)> {
            let metadata = std::fs::metadata(&path)?;
            let mut file = std::fs::File::open(&path)?;
            let digest = Digest::of_reader(algo, &mut file)?;
            Ok((rel, path, digest, file_mode(&metadata)))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut items = Vec::with_capacity(hashed.len());
    for (rel, path, digest, mode) in hashed {
        let mut item = Item::file(path, Some(digest.clone()), digest.size());
        if rel.ends_with(".isolated") {
            item = item.high_priority();
        }
        items.push(Arc::new(item));
        files.insert(
            rel.replace('/', &MAIN_SEPARATOR.to_string()),
            FileEntry::Regular {
                digest,
                mode,
                kind: FileKind::Basic,
            },
        );
    }
    debug!(root = %root.display(), files = files.len(), "directory hashed");
    Ok((items, files))
}

/// Upload files and directories. Each directory is uploaded together with a
/// generated manifest whose digest stands for it in the results.
pub fn archive_paths(storage: &Storage, paths: &[PathBuf], blacklist: &Blacklist) -> Result<ArchiveResult> {
    let algo = storage.hash_algorithm();
    let mut unique = HashSet::new();
    for path in paths {
        let abs = std::path::absolute(path)?;
        if !unique.insert(abs) {
            return Err(IsoError::Config(format!(
                "duplicate entry: {}",
                path.display()
            )));
        }
    }

    let mut results = Vec::with_capacity(paths.len());
    let mut items: Vec<Arc<Item>> = Vec::new();
    for path in paths {
        let metadata = std::fs::metadata(path)
            .map_err(|e| IsoError::Config(format!("failed to process {}: {e}", path.display())))?;
        if metadata.is_dir() {
            let (dir_items, files) = directory_to_metadata(path, algo, blacklist)?;
            let mut manifest = Manifest::new(algo);
            manifest.files = files;
            let manifest_item = Item::buffer(manifest.to_bytes()?).high_priority();
            let digest = manifest_item.prepare(algo)?.clone();
            items.extend(dir_items);
            items.push(Arc::new(manifest_item));
            results.push((digest, path.clone()));
        } else if metadata.is_file() {
            let mut item = Item::file(path.clone(), None, Some(metadata.len()));
            if path.to_string_lossy().ends_with(".isolated") {
                item = item.high_priority();
            }
            let digest = item.prepare(algo)?.clone();
            items.push(Arc::new(item));
            results.push((digest, path.clone()));
        } else {
            return Err(IsoError::Config(format!(
                "{} is neither a file nor a directory",
                path.display()
            )));
        }
    }

    let pushed = storage.upload_items(&items)?;
    let (uploaded, cached): (Vec<_>, Vec<_>) = items
        .into_iter()
        .partition(|item| pushed.iter().any(|u| Arc::ptr_eq(u, item)));
    info!(
        uploaded = uploaded.len(),
        cached = cached.len(),
        "archive done"
    );
    Ok(ArchiveResult {
        results,
        uploaded,
        cached,
    })
}

/// Upload `(path, entry)` pairs whose digests are already known. Symlinks
/// and repeated paths are skipped.
pub fn upload_tree(storage: &Storage, entries: Vec<(PathBuf, FileEntry)>) -> Result<Vec<Arc<Item>>> {
    let mut seen = HashSet::new();
    let mut items = Vec::new();
    let mut skipped = 0usize;
    for (path, entry) in entries {
        match entry {
            FileEntry::Regular { digest, .. } if !seen.contains(&path) => {
                seen.insert(path.clone());
                let size = digest.size();
                items.push(Arc::new(Item::file(path, Some(digest), size)));
            }
            _ => skipped += 1,
        }
    }
    info!("skipped {skipped} duplicated entries");
    storage.upload_items(&items)
}
