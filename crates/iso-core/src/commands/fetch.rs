use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use iso_types::Digest;

use crate::cache::ContentAddressedCache;
use crate::error::{IsoError, Result};
use crate::fetch_queue::FetchQueue;
use crate::manifest::{resolve, FileEntry, FileKind, ResolvedBundle};
use crate::platform::fs::{apply_mode, create_symlink, place_file, LinkMode};
use crate::storage::Storage;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Symlink read-only files from the cache instead of hardlinking them.
    pub use_symlinks: bool,
}

#[derive(Debug, Default)]
struct FetchStats {
    files: u64,
    symlinks: u64,
    tar_members: u64,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Resolve the manifest `root` and materialize its tree into `outdir`.
///
/// `root` is a digest in the storage namespace, or the path of a local
/// manifest which is then injected into the cache. Fails with
/// [`IsoError::NoMoreSpace`] if trimming the cache afterwards dropped
/// anything this tree needed.
pub fn fetch_isolated(
    storage: Arc<Storage>,
    cache: Arc<dyn ContentAddressedCache>,
    root: &str,
    outdir: &Path,
    options: &FetchOptions,
) -> Result<ResolvedBundle> {
    debug!(root, outdir = %outdir.display(), "fetch_isolated");
    let algo = storage.hash_algorithm();
    let queue = FetchQueue::new(Arc::clone(&storage), Arc::clone(&cache));

    let root_digest = if algo.is_valid_hex(root) {
        Digest::new(algo, root, None)?
    } else {
        debug!("{root} is not a valid {} digest, assuming a file", algo.name());
        let path = std::path::absolute(root)?;
        queue.inject_local_file(&path).map_err(|e| {
            IsoError::Config(format!(
                "{root} doesn't seem to be a valid file nor digest: {e}"
            ))
        })?
    };

    let bundle = resolve(&queue, root_digest)?;

    fs::create_dir_all(outdir)?;
    let mut stats = FetchStats::default();
    create_directories(outdir, &bundle)?;
    stats.symlinks = create_symlinks(outdir, &bundle)?;
    fs::create_dir_all(outdir.join(&bundle.relative_cwd))?;

    let mut remaining: HashMap<Digest, Vec<(&str, &FileEntry)>> = HashMap::new();
    for (path, entry) in &bundle.files {
        if let Some(digest) = entry.digest() {
            remaining
                .entry(digest.clone())
                .or_default()
                .push((path.as_str(), entry));
            queue.wait_on(digest.clone());
        }
    }

    info!(
        "retrieving remaining files ({} of them)",
        queue.pending_count()
    );
    let mut last_update = Instant::now();
    {
        let detector = storage.deadlock_detector();
        while !remaining.is_empty() {
            detector.ping();
            let digest = queue.wait()?;
            let Some(targets) = remaining.remove(&digest) else {
                continue;
            };
            for (path, entry) in targets {
                materialize(cache.as_ref(), &digest, outdir, path, entry, &bundle, options, &mut stats)?;
            }
            if last_update.elapsed() > PROGRESS_INTERVAL {
                info!("{} files remaining...", remaining.len());
                last_update = Instant::now();
            }
        }
    }
    queue.wait_queue_empty()?;

    // Trimming may evict what was just fetched; that is fatal.
    cache.trim()?;
    if !queue.verify_all_cached() {
        return Err(IsoError::NoMoreSpace(format!(
            "Cache is too small to hold all requested files: cache={} bytes, {} items",
            cache.total_size(),
            cache.len()
        )));
    }
    info!(
        files = stats.files,
        symlinks = stats.symlinks,
        tar_members = stats.tar_members,
        "fetch done"
    );
    Ok(bundle)
}

// ---------------------------------------------------------------------------
// Tree layout
// ---------------------------------------------------------------------------

fn create_directories(outdir: &Path, bundle: &ResolvedBundle) -> Result<()> {
    for path in bundle.files.keys() {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(outdir.join(parent))?;
            }
        }
    }
    Ok(())
}

fn create_symlinks(outdir: &Path, bundle: &ResolvedBundle) -> Result<u64> {
    let mut count = 0;
    for (path, entry) in &bundle.files {
        if let FileEntry::Symlink { target } = entry {
            create_symlink(Path::new(target), &outdir.join(path))?;
            count += 1;
        }
    }
    Ok(count)
}

#[allow(clippy::too_many_arguments)]
fn materialize(
    cache: &dyn ContentAddressedCache,
    digest: &Digest,
    outdir: &Path,
    path: &str,
    entry: &FileEntry,
    bundle: &ResolvedBundle,
    options: &FetchOptions,
    stats: &mut FetchStats,
) -> Result<()> {
    let FileEntry::Regular { mode, kind, .. } = entry else {
        return Ok(());
    };
    let fullpath = outdir.join(path);
    match kind {
        FileKind::Basic => {
            // Only user bits are kept.
            let mut file_mode = mode.unwrap_or(0o500) & 0o700;
            if bundle.is_read_only() {
                file_mode &= 0o500;
            }
            put_file(cache, digest, &fullpath, file_mode, bundle.is_read_only(), options)?;
            stats.files += 1;
        }
        FileKind::Tar => {
            let basedir = fullpath.parent().unwrap_or(outdir).to_path_buf();
            stats.tar_members += extract_tar(cache.open(digest)?, &basedir, bundle.is_read_only())?;
        }
    }
    Ok(())
}

/// Link files of a read-only tree from a disk cache, copy everything else.
fn put_file(
    cache: &dyn ContentAddressedCache,
    digest: &Digest,
    dst: &Path,
    mode: u32,
    read_only: bool,
    options: &FetchOptions,
) -> Result<()> {
    if let (true, Some(src)) = (read_only, cache.path(digest)) {
        let link = if options.use_symlinks {
            LinkMode::SymlinkOrCopy
        } else {
            LinkMode::HardlinkOrCopy
        };
        place_file(&src, dst, mode, link)?;
        return Ok(());
    }
    write_stream(&mut cache.open(digest)?, dst, mode)
}

fn write_stream(src: &mut dyn Read, dst: &Path, mode: u32) -> Result<()> {
    let mut out = File::create(dst)?;
    io::copy(src, &mut out)?;
    drop(out);
    apply_mode(dst, mode)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tar payloads
// ---------------------------------------------------------------------------

/// Member path made relative and checked to stay below the extraction root.
fn sanitize_member(raw: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

fn extract_tar(reader: Box<dyn Read + Send>, basedir: &Path, read_only: bool) -> Result<u64> {
    let mut archive = tar::Archive::new(reader);
    let mut count = 0;
    for member in archive.entries()? {
        let mut member = member?;
        let raw_path = member.path()?.into_owned();
        if !member.header().entry_type().is_file() {
            warn!(
                "path {} is not a regular file ({:?}), skipped",
                raw_path.display(),
                member.header().entry_type()
            );
            continue;
        }
        let name = raw_path.to_string_lossy().replace('\\', "/");
        let Some(rel) = sanitize_member(Path::new(&name)) else {
            return Err(IsoError::Other(format!(
                "tar member {} is outside {}",
                raw_path.display(),
                basedir.display()
            )));
        };
        let target = basedir.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut mode = member.header().mode()? & 0o700;
        if read_only {
            mode &= 0o500;
        }
        write_stream(&mut member, &target, mode)?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_member_rejects_escapes() {
        assert_eq!(
            sanitize_member(Path::new("a/./b")),
            Some(PathBuf::from("a/b"))
        );
        assert!(sanitize_member(Path::new("../etc/passwd")).is_none());
        assert!(sanitize_member(Path::new("/abs")).is_none());
        assert!(sanitize_member(Path::new(".")).is_none());
    }
}
