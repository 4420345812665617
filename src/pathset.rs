//! Thread-safe snapshot of every file path currently referenced by a live
//! torrent, plus an ancestor-directory index so "is anything under this
//! directory live?" is an O(1) lookup instead of a prefix scan.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::normalize::{normalize, parent};

#[derive(Debug, Default)]
pub struct PathSet {
    files: RwLock<HashSet<PathBuf>>,
    dirs: RwLock<HashSet<PathBuf>>,
}

impl PathSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize `path`, insert it into the file map, then walk its parents
    /// up to (and excluding) the filesystem root, inserting each into the
    /// directory map.
    pub fn add(&self, path: &Path) {
        let key = normalize(path);

        {
            let mut files = self.files.write().unwrap();
            if !files.insert(key.clone()) {
                return; // already present; ancestors were inserted previously
            }
        }

        let mut dirs = self.dirs.write().unwrap();
        let mut cur = key;
        while let Some(p) = parent(&cur) {
            if p.as_os_str().is_empty() || p == cur {
                break;
            }
            if !dirs.insert(p.clone()) {
                break; // ancestors of this directory are already recorded
            }
            cur = p;
        }
    }

    pub fn has(&self, path: &Path) -> bool {
        let key = normalize(path);
        self.files.read().unwrap().contains(&key)
    }

    /// True iff at least one previously-added file lies at or below `dir`.
    pub fn has_any_in_dir(&self, dir: &Path) -> bool {
        let key = normalize(dir);
        self.dirs.read().unwrap().contains(&key) || self.files.read().unwrap().contains(&key)
    }

    pub fn len(&self) -> usize {
        self.files.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Union of both path and directory maps. Returns the number of paths
    /// newly added (paths that were not already present in `self`).
    pub fn merge_from(&self, other: &PathSet) -> usize {
        let mut added = 0usize;
        let other_files = other.files.read().unwrap();
        {
            let mut files = self.files.write().unwrap();
            for f in other_files.iter() {
                if files.insert(f.clone()) {
                    added += 1;
                }
            }
        }
        let other_dirs = other.dirs.read().unwrap();
        {
            let mut dirs = self.dirs.write().unwrap();
            for d in other_dirs.iter() {
                dirs.insert(d.clone());
            }
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_populates_ancestor_index() {
        let set = PathSet::new();
        set.add(Path::new("/r/a/b/c.mkv"));

        assert!(set.has(Path::new("/r/a/b/c.mkv")));
        assert!(set.has_any_in_dir(Path::new("/r/a/b")));
        assert!(set.has_any_in_dir(Path::new("/r/a")));
        assert!(set.has_any_in_dir(Path::new("/r")));
        assert!(!set.has_any_in_dir(Path::new("/other")));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn has_any_in_dir_false_for_unrelated_sibling() {
        let set = PathSet::new();
        set.add(Path::new("/r/a/foo/file.mkv"));
        assert!(!set.has_any_in_dir(Path::new("/r/a/foobar")));
    }

    #[test]
    fn merge_from_unions_paths_and_reports_new_count() {
        let a = PathSet::new();
        a.add(Path::new("/r/one.mkv"));

        let b = PathSet::new();
        b.add(Path::new("/r/one.mkv"));
        b.add(Path::new("/r/two.mkv"));

        let added = a.merge_from(&b);
        assert_eq!(added, 1);
        assert_eq!(a.len(), 2);
        assert!(a.has(Path::new("/r/two.mkv")));
    }

    #[test]
    fn merge_is_idempotent_on_directory_index() {
        let a = PathSet::new();
        a.add(Path::new("/r/a/one.mkv"));
        let b = PathSet::new();
        b.add(Path::new("/r/a/two.mkv"));
        a.merge_from(&b);
        assert!(a.has_any_in_dir(Path::new("/r/a")));
        assert!(a.has_any_in_dir(Path::new("/r")));
    }
}
