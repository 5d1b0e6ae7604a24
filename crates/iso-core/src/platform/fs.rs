use std::path::Path;

use tracing::debug;

/// Bytes available to an unprivileged user on the filesystem holding `path`.
#[cfg(unix)]
pub fn available_free_space(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        debug!("statvfs failed: {}", std::io::Error::last_os_error());
        return None;
    }

    // Casts needed for cross-platform: types vary between Linux and macOS.
    #[allow(clippy::unnecessary_cast)]
    let avail = (stat.f_bavail as u64).checked_mul(stat.f_frsize as u64)?;
    Some(avail)
}

#[cfg(not(unix))]
pub fn available_free_space(_path: &Path) -> Option<u64> {
    None
}

pub fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }

    #[cfg(not(unix))]
    {
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_readonly((mode & 0o200) == 0);
        std::fs::set_permissions(path, perms)
    }
}

/// Permission bits of a file, or `None` where the platform has none.
pub fn file_mode(metadata: &std::fs::Metadata) -> Option<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Some(metadata.permissions().mode() & 0o7777)
    }

    #[cfg(not(unix))]
    {
        let _ = metadata;
        None
    }
}

pub fn create_symlink(link_target: &Path, target: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(link_target, target)
    }

    #[cfg(windows)]
    {
        std::os::windows::fs::symlink_file(link_target, target)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (link_target, target);
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "symlink creation is not supported on this platform",
        ))
    }
}

/// How [`place_file`] materializes a blob that already sits in a disk cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Copy,
    /// Hardlink, falling back to a copy across filesystems.
    HardlinkOrCopy,
    /// Symlink, falling back to a copy where symlinks are not allowed.
    SymlinkOrCopy,
}

/// Place `src` at `dst` and apply `mode`. Linked files share the cached
/// inode, so their mode must already be read-only.
pub fn place_file(src: &Path, dst: &Path, mode: u32, link: LinkMode) -> std::io::Result<()> {
    let linked = match link {
        LinkMode::Copy => false,
        LinkMode::HardlinkOrCopy => match std::fs::hard_link(src, dst) {
            Ok(()) => true,
            Err(e) => {
                debug!(src = %src.display(), "hardlink failed, copying: {e}");
                false
            }
        },
        LinkMode::SymlinkOrCopy => match create_symlink(src, dst) {
            Ok(()) => true,
            Err(e) => {
                debug!(src = %src.display(), "symlink failed, copying: {e}");
                false
            }
        },
    };
    if !linked {
        std::fs::copy(src, dst)?;
        apply_mode(dst, mode)?;
    } else if link == LinkMode::HardlinkOrCopy {
        apply_mode(dst, mode)?;
    }
    Ok(())
}
