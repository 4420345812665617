//! Tree walker: enumerates orphan candidates beneath a scan root, grouping
//! Blu-ray/DVD disc layouts into a single deletion unit and suppressing any
//! unit that still has a live member somewhere in the PathSet.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::ignore::{is_ignored_dir_name, is_ignored_file_name, is_under_ignore_path};
use crate::normalize::is_strict_ancestor;
use crate::pathset::PathSet;

const DISC_MARKERS: &[&str] = &["bdmv", "video_ts"];

fn allowed_sibling_dirs(marker: &str) -> &'static [&'static str] {
    match marker {
        "bdmv" => &["certificate"],
        "video_ts" => &["audio_ts"],
        _ => &[],
    }
}

#[derive(Debug, Clone)]
pub struct OrphanUnit {
    pub path: PathBuf,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

struct Accum {
    path: PathBuf,
    size: u64,
    modified_at: SystemTime,
    is_disc: bool,
}

/// Walk `root`, returning the orphan units found and whether the walk was
/// truncated by `max_units` (0 means unbounded).
pub fn walk(
    root: &Path,
    pathset: &PathSet,
    ignore_paths: &[PathBuf],
    grace_period: Duration,
    max_units: usize,
) -> std::io::Result<(Vec<OrphanUnit>, bool)> {
    let mut units: HashMap<PathBuf, Accum> = HashMap::new();
    let mut in_use_units: HashSet<PathBuf> = HashSet::new();
    let mut decision_cache: HashMap<(PathBuf, &'static str), bool> = HashMap::new();
    #[cfg(unix)]
    let mut seen_inodes: HashSet<(u64, u64)> = HashSet::new();
    let mut truncated = false;
    let now = SystemTime::now();

    let walker = WalkDir::new(root).follow_links(false).into_iter();
    'walk: for entry in walker.filter_entry(|e| {
        e.depth() == 0
            || !e.file_type().is_dir()
            || !is_ignored_dir_name(e.file_name().to_string_lossy().as_ref())
    }) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                if let Some(io_err) = e.into_io_error() {
                    if io_err.kind() == std::io::ErrorKind::PermissionDenied {
                        continue; // per-file/dir permission errors are skipped silently
                    }
                    return Err(io_err);
                }
                continue;
            }
        };

        if entry.depth() == 0 {
            continue; // never consider the scan root itself
        }

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue; // symlinks are never followed nor reported
        }
        if file_type.is_dir() {
            continue; // directories themselves are never orphan candidates
        }

        let path = entry.path();
        let name = entry.file_name().to_string_lossy();

        if is_ignored_file_name(name.as_ref()) {
            continue;
        }
        if is_under_ignore_path(path, ignore_paths) {
            continue;
        }

        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue, // vanished mid-walk; not our problem to report
        };
        let modified = match meta.modified() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if now
            .duration_since(modified)
            .map(|age| age < grace_period)
            .unwrap_or(true)
        {
            continue; // too young, or clock skew makes it look like the future
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if meta.nlink() == 1 {
                let key = (meta.dev(), meta.ino());
                if !seen_inodes.insert(key) {
                    continue; // bind-mount duplicate of an already-visited file
                }
            }
        }

        let size = meta.len();
        let (unit_path, is_disc) =
            choose_unit(root, path, ignore_paths, pathset, &mut decision_cache);

        if in_use_units.contains(&unit_path) {
            continue;
        }

        let member_in_use = if is_disc {
            pathset.has_any_in_dir(&unit_path)
        } else {
            pathset.has(&unit_path)
        };
        if member_in_use {
            in_use_units.insert(unit_path.clone());
            units.remove(&unit_path);
            continue;
        }

        if !units.contains_key(&unit_path) {
            if max_units > 0 && units.len() >= max_units {
                truncated = true;
                break 'walk;
            }
            units.insert(
                unit_path.clone(),
                Accum {
                    path: unit_path.clone(),
                    size: 0,
                    modified_at: SystemTime::UNIX_EPOCH,
                    is_disc,
                },
            );
        }
        let acc = units.get_mut(&unit_path).unwrap();
        acc.size += size;
        if modified > acc.modified_at {
            acc.modified_at = modified;
        }
    }

    merge_file_units_under_disc_units(&mut units);

    let out = units
        .into_values()
        .map(|a| OrphanUnit {
            path: a.path,
            size: a.size,
            modified_at: DateTime::<Utc>::from(a.modified_at),
        })
        .collect();

    Ok((out, truncated))
}

/// Merge every standalone per-file unit that lies strictly under a chosen
/// disc-unit directory into that disc unit, deduplicating siblings that live
/// next to a disc image slated for wholesale deletion.
fn merge_file_units_under_disc_units(units: &mut HashMap<PathBuf, Accum>) {
    let disc_dirs: Vec<PathBuf> = units
        .values()
        .filter(|a| a.is_disc)
        .map(|a| a.path.clone())
        .collect();
    if disc_dirs.is_empty() {
        return;
    }

    let mut to_remove = Vec::new();
    let mut deltas: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
    for (key, acc) in units.iter() {
        if acc.is_disc {
            continue;
        }
        if let Some(owner) = disc_dirs.iter().find(|d| is_strict_ancestor(d, key)) {
            to_remove.push(key.clone());
            deltas.push((owner.clone(), acc.size, acc.modified_at));
        }
    }

    for key in &to_remove {
        units.remove(key);
    }
    for (owner, size, mtime) in deltas {
        if let Some(acc) = units.get_mut(&owner) {
            acc.size += size;
            if mtime > acc.modified_at {
                acc.modified_at = mtime;
            }
        }
    }
}

/// Determine the logical deletion unit for a candidate file: `(unit_path,
/// is_disc_unit)`. Non-disc files are always their own unit.
fn choose_unit(
    root: &Path,
    file: &Path,
    ignore_paths: &[PathBuf],
    pathset: &PathSet,
    cache: &mut HashMap<(PathBuf, &'static str), bool>,
) -> (PathBuf, bool) {
    let rel = match file.strip_prefix(root) {
        Ok(r) => r,
        Err(_) => return (file.to_path_buf(), false),
    };

    let marker_idx = rel.components().enumerate().find_map(|(i, c)| {
        let s = c.as_os_str().to_string_lossy().to_lowercase();
        DISC_MARKERS.iter().find(|m| **m == s).map(|m| (i, *m))
    });

    let Some((idx, marker)) = marker_idx else {
        return (file.to_path_buf(), false);
    };

    let marker_dir = root.join(rel.components().take(idx + 1).collect::<PathBuf>());

    if idx == 0 {
        return (marker_dir, true);
    }

    let parent_dir = root.join(rel.components().take(idx).collect::<PathBuf>());
    let cache_key = (parent_dir.clone(), marker);
    if let Some(&group_to_parent) = cache.get(&cache_key) {
        let unit = if group_to_parent { parent_dir } else { marker_dir };
        return (unit, true);
    }

    let protected = is_protected_by_ignore(&parent_dir, ignore_paths)
        || is_protected_by_ignore(&marker_dir, ignore_paths);
    if protected {
        // Grouping disabled for this file only; the decision is per-file
        // when an ignore path reaches inside the disc tree, so it is never
        // cached under (parent_dir, marker).
        return (file.to_path_buf(), false);
    }

    let group_to_parent = all_siblings_safe(&parent_dir, &marker_dir, marker, pathset);
    cache.insert(cache_key, group_to_parent);
    let unit = if group_to_parent { parent_dir } else { marker_dir };
    (unit, true)
}

fn is_protected_by_ignore(dir: &Path, ignore_paths: &[PathBuf]) -> bool {
    is_under_ignore_path(dir, ignore_paths)
        || ignore_paths.iter().any(|ig| is_strict_ancestor(dir, ig))
}

fn all_siblings_safe(parent_dir: &Path, marker_dir: &Path, marker: &str, pathset: &PathSet) -> bool {
    let allowed = allowed_sibling_dirs(marker);
    let entries = match std::fs::read_dir(parent_dir) {
        Ok(e) => e,
        Err(_) => return true, // parent unreadable; nothing contradicts grouping
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path == marker_dir {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };

        if file_type.is_dir() {
            if allowed.contains(&name.as_str()) {
                continue;
            }
            if !pathset.has_any_in_dir(&path) {
                continue;
            }
            return false;
        }

        if is_ignored_file_name(&name) {
            continue;
        }
        if !pathset.has(&path) {
            continue;
        }
        return false;
    }

    true
}
