//! Deletion of a single orphan unit with a race-closing re-check against the
//! PathSet, plus the ancestor-directory sweep that runs after a batch of
//! deletions.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Result, ScanError};
use crate::ignore::is_under_ignore_path;
use crate::normalize::is_strict_ancestor;
use crate::pathset::PathSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Deleted,
    SkippedInUse,
    SkippedMissing,
    SkippedIgnored,
    Failed(String),
}

fn check_boundary(scan_root: &Path, target: &Path) -> Result<()> {
    if !target.is_absolute() {
        return Err(ScanError::TargetNotAbsolute(target.to_path_buf()));
    }
    if target == scan_root {
        return Err(ScanError::TargetIsScanRoot(target.to_path_buf()));
    }
    if !is_strict_ancestor(scan_root, target) {
        return Err(ScanError::TargetEscapesRoot {
            target: target.to_path_buf(),
            root: scan_root.to_path_buf(),
        });
    }
    Ok(())
}

/// Validate, re-check against the PathSet, and remove a single orphan unit
/// (file, symlink, or directory).
pub fn safe_delete_target(
    scan_root: &Path,
    target: &Path,
    pathset: &PathSet,
    ignore_paths: &[PathBuf],
) -> Result<Disposition> {
    check_boundary(scan_root, target)?;

    if is_under_ignore_path(target, ignore_paths) {
        return Ok(Disposition::SkippedIgnored);
    }

    let link_meta = match fs::symlink_metadata(target) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Disposition::SkippedMissing)
        }
        Err(e) => return Ok(Disposition::Failed(ScanError::describe_io(&e))),
    };

    if link_meta.file_type().is_symlink() {
        if pathset.has(target) {
            return Ok(Disposition::SkippedInUse);
        }
        return match fs::remove_file(target) {
            Ok(()) => Ok(Disposition::Deleted),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Disposition::SkippedMissing),
            Err(e) => Ok(Disposition::Failed(ScanError::describe_io(&e))),
        };
    }

    if link_meta.is_file() {
        if pathset.has(target) {
            return Ok(Disposition::SkippedInUse);
        }
        return match fs::remove_file(target) {
            Ok(()) => Ok(Disposition::Deleted),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Disposition::SkippedMissing),
            Err(e) => Ok(Disposition::Failed(ScanError::describe_io(&e))),
        };
    }

    // Directory target: walk the whole tree first so every descendant is
    // seen before anything is removed. In-use wins immediately; an ignored
    // descendant only wins once the full walk confirms nothing is live.
    let mut saw_ignored = false;
    for entry in WalkDir::new(target).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                if let Some(io_err) = e.into_io_error() {
                    if io_err.kind() == std::io::ErrorKind::NotFound {
                        continue;
                    }
                    return Ok(Disposition::Failed(ScanError::describe_io(&io_err)));
                }
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }
        let path = entry.path();
        if entry.file_type().is_dir() {
            continue;
        }
        if pathset.has(path) {
            return Ok(Disposition::SkippedInUse);
        }
        if is_under_ignore_path(path, ignore_paths) {
            saw_ignored = true;
        }
    }

    if saw_ignored {
        return Ok(Disposition::SkippedIgnored);
    }

    match fs::remove_dir_all(target) {
        Ok(()) => Ok(Disposition::Deleted),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Disposition::SkippedMissing),
        Err(e) => Ok(Disposition::Failed(ScanError::describe_io(&e))),
    }
}

/// Remove `dir` only if it is already empty. Missing directories count as
/// success (idempotent sweep).
pub fn safe_delete_empty_dir(scan_root: &Path, dir: &Path) -> Result<()> {
    check_boundary(scan_root, dir)?;

    match fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) if is_dir_not_empty(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn is_dir_not_empty(e: &std::io::Error) -> bool {
    #[allow(unreachable_patterns)]
    match e.kind() {
        std::io::ErrorKind::DirectoryNotEmpty => true,
        // ENOTEMPTY (Unix) / ERROR_DIR_NOT_EMPTY (Windows) on older
        // toolchains where the dedicated ErrorKind isn't surfaced yet.
        _ => matches!(e.raw_os_error(), Some(39) | Some(66) | Some(145)),
    }
}

/// Collect ancestor directories worth attempting after a deletion pass:
/// starting at the parent of each deleted/missing target, walking upward
/// while still under the target's owning scan root, stopping at the first
/// ignored ancestor. `owning_root` should be the *longest* configured root
/// containing the path. Returned in descending path-length order so deeper
/// directories are tried first.
pub fn ancestor_sweep_candidates(
    deleted_or_missing: &[(PathBuf, PathBuf)], // (target, owning_root)
    ignore_paths: &[PathBuf],
) -> Vec<PathBuf> {
    let mut candidates: HashSet<PathBuf> = HashSet::new();

    for (target, root) in deleted_or_missing {
        let mut cur = match target.parent() {
            Some(p) => p.to_path_buf(),
            None => continue,
        };
        loop {
            if cur == *root || !is_strict_ancestor(root, &cur) {
                break;
            }
            if is_under_ignore_path(&cur, ignore_paths) {
                break;
            }
            candidates.insert(cur.clone());
            cur = match cur.parent() {
                Some(p) => p.to_path_buf(),
                None => break,
            };
        }
    }

    let mut out: Vec<PathBuf> = candidates.into_iter().collect();
    out.sort_by(|a, b| b.as_os_str().len().cmp(&a.as_os_str().len()));
    out
}

/// Find the owning scan root for `path`: the longest configured root that
/// contains it, so nested configured roots behave correctly.
pub fn owning_root<'a>(path: &Path, roots: &'a [PathBuf]) -> Option<&'a PathBuf> {
    roots
        .iter()
        .filter(|r| is_strict_ancestor(r, path) || r.as_path() == path)
        .max_by_key(|r| r.as_os_str().len())
}
