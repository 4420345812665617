//! Ignore-path and ignore-name rules applied by the walker and by
//! `safe_delete`. Directory rules are pruned during traversal; file rules are
//! applied per-entry; ignore *paths* are absolute paths configured per
//! instance and matched with a path-boundary check.

use std::path::Path;

use crate::normalize::is_ancestor_or_equal;

/// Directory names that are always pruned, matched case-insensitively.
const IGNORED_DIR_NAMES: &[&str] = &[
    "$recycle.bin",
    "recycle.bin",
    "recycler",
    ".recycle",
    ".trash",
    ".trash-1000",
    ".local/share/trash",
    ".snapshot",
    ".snapshots",
    ".zfs",
    ".timemachine",
];

/// Directory name prefixes that are always pruned.
const IGNORED_DIR_PREFIXES: &[&str] = &[
    ".snapshot",
    ".trashes",
    "trash-",
    "kube-config-map-",
    "..", // any name starting with ".." (includes "..data" used by k8s configmaps)
];

/// File names that are always skipped, matched case-insensitively.
const IGNORED_FILE_NAMES: &[&str] = &[".ds_store", "thumbs.db", "desktop.ini", ".directory"];

/// File name prefixes/suffixes that are always skipped.
const IGNORED_FILE_PREFIXES: &[&str] = &["._", ".fuse_hidden", ".~lock.", "~$"];
const IGNORED_FILE_SUFFIXES: &[&str] = &[".parts", ".!qb", ".part", ".crdownload"];

pub fn is_ignored_dir_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    IGNORED_DIR_NAMES.contains(&lower.as_str())
        || IGNORED_DIR_PREFIXES.iter().any(|p| lower.starts_with(p))
}

pub fn is_ignored_file_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    IGNORED_FILE_NAMES.contains(&lower.as_str())
        || IGNORED_FILE_PREFIXES.iter().any(|p| lower.starts_with(p))
        || IGNORED_FILE_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// True iff `path` lies at or beneath any of `ignore_paths` (path-boundary
/// respecting: `/a/foo` does not match an ignore path of `/a/foobar`).
pub fn is_under_ignore_path(path: &Path, ignore_paths: &[impl AsRef<Path>]) -> bool {
    ignore_paths
        .iter()
        .any(|ignored| is_ancestor_or_equal(ignored.as_ref(), path))
}

/// Validates that every configured ignore path is absolute, per the
/// pre-flight-failure policy for invalid settings.
pub fn validate_ignore_paths(ignore_paths: &[impl AsRef<Path>]) -> Result<(), std::path::PathBuf> {
    for p in ignore_paths {
        let p = p.as_ref();
        if !p.is_absolute() {
            return Err(p.to_path_buf());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_rules_cover_trash_and_snapshots() {
        assert!(is_ignored_dir_name("$RECYCLE.BIN"));
        assert!(is_ignored_dir_name(".Trash-1000"));
        assert!(is_ignored_dir_name(".snapshot"));
        assert!(is_ignored_dir_name("..data"));
        assert!(!is_ignored_dir_name("Movies"));
    }

    #[test]
    fn file_rules_cover_os_metadata_and_partials() {
        assert!(is_ignored_file_name(".DS_Store"));
        assert!(is_ignored_file_name("._resource"));
        assert!(is_ignored_file_name("download.mkv.parts"));
        assert!(!is_ignored_file_name("movie.mkv"));
    }

    #[test]
    fn ignore_path_boundary_is_respected() {
        let ignores = vec!["/a/foo"];
        assert!(!is_under_ignore_path(Path::new("/a/foobar/x"), &ignores));
        assert!(is_under_ignore_path(Path::new("/a/foo/x"), &ignores));
    }

    #[test]
    fn validate_rejects_relative_paths() {
        assert!(validate_ignore_paths(&["rel/path"]).is_err());
        assert!(validate_ignore_paths(&["/abs/path"]).is_ok());
    }
}
