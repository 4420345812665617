//! Path normalization shared by the PathSet, ignore matching, and scan-root
//! overlap detection: `clean()` always, case-fold on case-insensitive
//! filesystems, and fold Unicode normalization forms so visually identical
//! paths compare equal regardless of composed/decomposed encoding.

use std::path::{Component, Path, PathBuf};

use unicode_normalization::UnicodeNormalization;

/// Whether the current platform's filesystems are treated as case-insensitive
/// for the purposes of path comparison. This is a capability flag rather than
/// a live filesystem probe, matching the platform-split approach used for
/// inode dedup elsewhere in this crate.
#[cfg(target_os = "windows")]
pub const CASE_INSENSITIVE: bool = true;
#[cfg(not(target_os = "windows"))]
pub const CASE_INSENSITIVE: bool = false;

/// Collapse `.` components and redundant separators, without touching `..`
/// semantics beyond lexical collapsing (no symlink resolution is performed;
/// that is the caller's job when it matters).
pub fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.push(comp.as_os_str());
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

/// Produce the canonical key used for PathSet membership, ignore matching,
/// and scan-root overlap comparisons. Idempotent: `normalize(normalize(p)) ==
/// normalize(p)`.
pub fn normalize(path: &Path) -> PathBuf {
    let cleaned = clean(path);
    if !CASE_INSENSITIVE {
        return cleaned;
    }
    lower_fold(&cleaned)
}

fn lower_fold(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(s.nfc().collect::<String>().to_lowercase()),
        // Invalid UTF-8 can't be Unicode-normalized or case-folded safely;
        // preserve the original bytes rather than risk corrupting the path.
        None => path.to_path_buf(),
    }
}

/// True iff `ancestor` is `descendant`, or a strict path-boundary-respecting
/// prefix of it (so `/a/foo` is never considered an ancestor of `/a/foobar`).
pub fn is_ancestor_or_equal(ancestor: &Path, descendant: &Path) -> bool {
    let a = normalize(ancestor);
    let d = normalize(descendant);
    if a == d {
        return true;
    }
    d.strip_prefix(&a).is_ok()
}

/// True iff `ancestor` is a strict ancestor of `descendant` (not equal).
pub fn is_strict_ancestor(ancestor: &Path, descendant: &Path) -> bool {
    let a = normalize(ancestor);
    let d = normalize(descendant);
    a != d && d.strip_prefix(&a).is_ok()
}

/// Two scan-root sets overlap iff at least one pair of normalized roots is
/// equal or one strictly contains the other.
pub fn roots_overlap(a: &Path, b: &Path) -> bool {
    is_ancestor_or_equal(a, b) || is_ancestor_or_equal(b, a)
}

/// Parent component of `path`, if any, after lexical cleaning.
pub fn parent(path: &Path) -> Option<PathBuf> {
    clean(path).parent().map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_collapses_dot_and_separators() {
        assert_eq!(clean(Path::new("/a/./b//c")), PathBuf::from("/a/b/c"));
    }

    #[test]
    fn normalize_is_idempotent() {
        let p = Path::new("/a/./B//c");
        assert_eq!(normalize(normalize(p).as_path()), normalize(p));
    }

    #[test]
    fn ancestor_respects_path_boundary() {
        assert!(!is_ancestor_or_equal(Path::new("/a/foo"), Path::new("/a/foobar")));
        assert!(is_ancestor_or_equal(Path::new("/a/foo"), Path::new("/a/foo/bar")));
        assert!(is_ancestor_or_equal(Path::new("/a/foo"), Path::new("/a/foo")));
    }

    #[test]
    fn overlap_is_symmetric() {
        assert!(roots_overlap(Path::new("/r"), Path::new("/r/sub")));
        assert!(roots_overlap(Path::new("/r/sub"), Path::new("/r")));
        assert!(!roots_overlap(Path::new("/rA"), Path::new("/rB")));
    }
}
