//! Output collector: link declared outputs from the run tree into the
//! output tree

use isorun_core::TreeMode;
use isorun_utils::fs::link_file;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Where a symlink chain ends up
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolved {
    File(PathBuf),
    Dir(PathBuf),
    Missing,
    Dangling(PathBuf),
    Cycle(PathBuf),
}

/// Follow `path` one link at a time until a real file or directory
fn resolve(path: &Path) -> io::Result<Resolved> {
    let mut current = path.to_path_buf();
    let mut visited = HashSet::new();
    loop {
        let metadata = match fs::symlink_metadata(&current) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(if current == path {
                    Resolved::Missing
                } else {
                    Resolved::Dangling(current)
                });
            }
            Err(e) => return Err(e),
        };
        let file_type = metadata.file_type();
        if file_type.is_dir() {
            return Ok(Resolved::Dir(current));
        }
        if !file_type.is_symlink() {
            return Ok(Resolved::File(current));
        }
        if !visited.insert(current.clone()) {
            return Ok(Resolved::Cycle(current));
        }
        let target = fs::read_link(&current)?;
        current = match current.parent() {
            Some(parent) if target.is_relative() => parent.join(target),
            _ => target,
        };
    }
}

/// Copy every declared output that exists into `out_dir`.
///
/// Files are hardlinked (copied across devices), directories expanded
/// recursively. Paths that do not exist are skipped; dangling or cyclic
/// links, directories already visited and paths that fail with an I/O
/// error are skipped with a warning. Returns the number of files collected.
pub fn collect_outputs(run_dir: &Path, out_dir: &Path, outputs: &[String]) -> usize {
    let mut collector = Collector::default();
    for output in outputs {
        collector.collect(&run_dir.join(output), &out_dir.join(output));
    }
    if !outputs.is_empty() {
        tracing::info!(
            declared = outputs.len(),
            collected = collector.collected,
            skipped = collector.skipped,
            "outputs collected"
        );
    }
    collector.collected
}

#[derive(Default)]
struct Collector {
    /// Canonical paths of directories already expanded
    visited_dirs: HashSet<PathBuf>,
    collected: usize,
    skipped: usize,
}

impl Collector {
    fn collect(&mut self, src: &Path, dst: &Path) {
        if let Err(e) = self.collect_path(src, dst) {
            self.skipped += 1;
            tracing::warn!(path = %src.display(), error = %e, "failed to collect output, skipping");
        }
    }

    fn collect_path(&mut self, src: &Path, dst: &Path) -> io::Result<()> {
        match resolve(src)? {
            Resolved::File(file) => {
                link_file(&file, dst, TreeMode::Hardlink)?;
                tracing::debug!(src = %src.display(), dst = %dst.display(), "output linked");
                self.collected += 1;
            }
            Resolved::Dir(dir) => {
                if !self.visited_dirs.insert(fs::canonicalize(&dir)?) {
                    self.skipped += 1;
                    tracing::warn!(path = %src.display(), dir = %dir.display(), "output directory already collected, skipping");
                    return Ok(());
                }
                fs::create_dir_all(dst)?;
                for entry in fs::read_dir(&dir)? {
                    let entry = entry?;
                    self.collect(&entry.path(), &dst.join(entry.file_name()));
                }
            }
            Resolved::Missing => {
                tracing::debug!(path = %src.display(), "declared output not found");
            }
            Resolved::Dangling(target) => {
                self.skipped += 1;
                tracing::warn!(path = %src.display(), target = %target.display(), "output is a dangling link, skipping");
            }
            Resolved::Cycle(at) => {
                self.skipped += 1;
                tracing::warn!(path = %src.display(), at = %at.display(), "output is a symlink cycle, skipping");
            }
        }
        Ok(())
    }
}
