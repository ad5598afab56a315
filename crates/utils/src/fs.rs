//! Tree permission and linking helpers used to materialize and tear down run trees

use isorun_core::TreeMode;
use std::fs;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Set or clear the write bits of a single file or directory.
///
/// Symlinks are left alone; changing them would change their target, which
/// usually lives in a shared cache.
pub fn set_read_only(path: &Path, read_only: bool) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }
    let mut permissions = metadata.permissions();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = permissions.mode();
        let new_mode = if read_only { mode & !0o222 } else { mode | 0o200 };
        if new_mode == mode {
            return Ok(());
        }
        permissions.set_mode(new_mode);
    }

    #[cfg(not(unix))]
    {
        if permissions.readonly() == read_only {
            return Ok(());
        }
        permissions.set_readonly(read_only);
    }

    fs::set_permissions(path, permissions)
}

/// Make every file and directory under `root` read-only
pub fn make_tree_read_only(root: &Path) -> io::Result<()> {
    // Children before parents, so a read-only directory never blocks a chmod below it
    for entry in WalkDir::new(root).contents_first(true) {
        let entry = entry.map_err(io::Error::from)?;
        set_read_only(entry.path(), true)?;
    }
    Ok(())
}

/// Make files read-only while keeping directories writable, so entries can
/// still be created and deleted but not modified
pub fn make_tree_files_read_only(root: &Path) -> io::Result<()> {
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::from)?;
        let is_dir = entry.file_type().is_dir();
        set_read_only(entry.path(), !is_dir)?;
    }
    Ok(())
}

/// Make every file and directory under `root` writable by the owner
pub fn make_tree_writable(root: &Path) -> io::Result<()> {
    // Parents first, so each directory is writable before its children are deleted
    set_read_only(root, false)?;
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        set_read_only(entry.path(), false)?;
    }
    Ok(())
}

/// Make a tree deletable without touching file modes where the platform
/// allows it, so hardlinked cache objects keep their permissions
pub fn make_tree_deletable(root: &Path) -> io::Result<()> {
    if cfg!(windows) {
        return make_tree_writable(root);
    }
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_dir() {
            set_read_only(entry.path(), false)?;
        }
    }
    Ok(())
}

/// Place `src` at `dst` according to the tree mode.
///
/// Hardlinks fall back to a copy when the two paths are on different
/// devices or the file system refuses links.
pub fn link_file(src: &Path, dst: &Path, mode: TreeMode) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match mode {
        TreeMode::Hardlink => match fs::hard_link(src, dst) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
            Err(e) => {
                tracing::debug!(
                    src = %src.display(),
                    dst = %dst.display(),
                    error = %e,
                    "hardlink failed, copying"
                );
                fs::copy(src, dst).map(|_| ())
            }
        },
        TreeMode::Symlink => symlink(src, dst),
        TreeMode::Copy => fs::copy(src, dst).map(|_| ()),
    }
}

/// Create a symlink at `link` pointing to `target`
pub fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }

    #[cfg(windows)]
    {
        if target.is_dir() {
            std::os::windows::fs::symlink_dir(target, link)
        } else {
            std::os::windows::fs::symlink_file(target, link)
        }
    }
}

/// Total size in bytes of the regular files under `root`, not following links
pub fn tree_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Whether `dir` exists and contains at least one entry
pub fn has_entries(dir: &Path) -> io::Result<bool> {
    match fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
