//! The scan-run state machine: owns a run's mutable state
//! between creation and a terminal status, guards the delete phase with a
//! per-instance mutex, and tracks cancellation contexts by run id.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::client::ClientAdapter;
use crate::error::{Result, ScanError};
use crate::filemap::{self, PeerInstance};
use crate::ignore::validate_ignore_paths;
use crate::model::{FileStatus, PreviewOrder, RunStatus, ScanFileRecord, ScanRun, Settings, Trigger};
use crate::notifier::Notifier;
use crate::readiness::SettledMemo;
use crate::safe_delete::{self, Disposition};
use crate::store::Store;
use crate::walker::{self, OrphanUnit};

/// Runs older than this in `pending`/`scanning` are considered abandoned on
/// restart and marked failed rather than resumed.
const STALE_RUN_THRESHOLD: Duration = Duration::from_secs(60 * 60);

pub struct Orchestrator {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    memo: SettledMemo,
    cancellations: StdMutex<HashMap<String, CancellationToken>>,
    delete_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    active_deletes: StdMutex<HashSet<String>>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            memo: SettledMemo::new(),
            cancellations: StdMutex::new(HashMap::new()),
            delete_locks: StdMutex::new(HashMap::new()),
            active_deletes: StdMutex::new(HashSet::new()),
        }
    }

    /// Mark any run left `deleting` as failed (interrupted deletions are
    /// never resumed) and fail any `pending`/`scanning` run older than the
    /// stale threshold. Call once at process startup.
    pub fn recover_from_restart(&self) -> Result<()> {
        for run in self.store.non_terminal_runs()? {
            match run.status {
                RunStatus::Deleting => {
                    self.store.update_run_status(
                        &run.id,
                        RunStatus::Failed,
                        Some("Deletion interrupted by restart"),
                        None,
                    )?;
                }
                RunStatus::Pending | RunStatus::Scanning => {
                    let age = chrono::Utc::now().signed_duration_since(run.started_at);
                    if age > chrono::Duration::from_std(STALE_RUN_THRESHOLD).unwrap() {
                        self.store
                            .update_run_status(&run.id, RunStatus::Failed, Some("stale run abandoned on restart"), None)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// The settled-state memo, exposed so callers (the scheduler) can
    /// re-check settledness cheaply without re-running the sample window.
    pub fn settled_memo(&self) -> &SettledMemo {
        &self.memo
    }

    fn cancellation_for(&self, run_id: &str) -> CancellationToken {
        let mut map = self.cancellations.lock().unwrap();
        map.entry(run_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Request cancellation of `run_id`. Refused while a worker is actively
    /// in the delete phase for this run: deleting must run to completion
    /// once started, never stop with some files removed and some not.
    pub fn cancel(&self, run_id: &str) -> Result<()> {
        if self.active_deletes.lock().unwrap().contains(run_id) {
            return Err(ScanError::CancelRefused(run_id.to_string()));
        }
        if let Some(token) = self.cancellations.lock().unwrap().get(run_id) {
            token.cancel();
        }
        Ok(())
    }

    fn delete_lock_for(&self, instance_id: &str) -> Arc<AsyncMutex<()>> {
        self.delete_locks
            .lock()
            .unwrap()
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Create a run and execute it to a terminal (or preview_ready) status.
    /// The caller decides whether to spawn this on its own task (scheduler)
    /// or await it inline (CLI single-shot mode).
    pub async fn run_scan(
        &self,
        instance_id: &str,
        primary: Arc<dyn ClientAdapter>,
        peers: Vec<PeerInstance>,
        trigger: Trigger,
        settings: &Settings,
    ) -> Result<ScanRun> {
        let run = self.store.create_run_if_no_active(instance_id, trigger, &[])?;
        let cancel = self.cancellation_for(&run.id);

        let outcome = self
            .execute_scan(&run, instance_id, &*primary, &peers, settings, &cancel)
            .await;

        let run = match outcome {
            Ok(()) => self.store.get_run(&run.id)?,
            Err(e) => {
                let canceled = cancel.is_cancelled();
                let status = if canceled { RunStatus::Canceled } else { RunStatus::Failed };
                let message = if canceled { None } else { Some(e.to_string()) };
                self.store.update_run_status(&run.id, status, message.as_deref(), None)?;
                let run = self.store.get_run(&run.id)?;
                self.notifier.scan_failed(&run);
                return Ok(run);
            }
        };

        if run.status == RunStatus::Completed {
            self.notifier.scan_completed(&run);
        }

        if run.status == RunStatus::PreviewReady
            && trigger == Trigger::Scheduled
            && settings.auto_cleanup_enabled
        {
            let found = self.store.list_files(&run.id)?.len();
            if found <= settings.auto_cleanup_ceiling {
                return self
                    .confirm_delete(&run.id, instance_id, primary, peers, settings)
                    .await;
            }
        }

        Ok(run)
    }

    async fn execute_scan(
        &self,
        run: &ScanRun,
        instance_id: &str,
        primary: &dyn ClientAdapter,
        peers: &[PeerInstance],
        settings: &Settings,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.store
            .update_run_status(&run.id, RunStatus::Scanning, None, None)?;

        validate_ignore_paths(&settings.ignore_paths)
            .map_err(ScanError::IgnorePathNotAbsolute)?;

        let map = filemap::build_file_map(
            instance_id,
            primary,
            peers,
            &self.memo,
            Default::default(),
            cancel,
        )
        .await?;

        if map.scan_roots.is_empty() {
            return Err(ScanError::AllRootsInaccessible);
        }

        self.store.update_scan_paths(&run.id, &map.scan_roots)?;

        let grace = Duration::from_secs(settings.grace_period_minutes * 60);
        let ignore_paths = settings.ignore_paths.clone();
        let mut all_units: Vec<OrphanUnit> = Vec::new();
        let mut any_truncated = false;
        let mut inaccessible_roots: Vec<std::path::PathBuf> = Vec::new();

        for root in &map.scan_roots {
            if cancel.is_cancelled() {
                return Err(ScanError::Canceled);
            }
            let root = root.clone();
            let pathset_snapshot = &map.pathset;
            match walk_blocking(root.clone(), pathset_snapshot, ignore_paths.clone(), grace).await {
                Ok((units, truncated)) => {
                    all_units.extend(units);
                    any_truncated |= truncated;
                }
                Err(_) => inaccessible_roots.push(root),
            }
        }

        if inaccessible_roots.len() == map.scan_roots.len() {
            return Err(ScanError::AllRootsInaccessible);
        }

        dedupe_units(&mut all_units);
        sort_units(&mut all_units, settings.preview_order);

        if all_units.len() > settings.max_files_per_run {
            all_units.truncate(settings.max_files_per_run);
            any_truncated = true;
        }

        self.store
            .update_run_counters(&run.id, all_units.len() as u64, any_truncated)?;

        let warning = (!inaccessible_roots.is_empty()).then(|| {
            format!(
                "scan roots inaccessible: {}",
                inaccessible_roots
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        });

        if all_units.is_empty() {
            self.store
                .update_run_status(&run.id, RunStatus::Completed, None, warning.as_deref())?;
            return Ok(());
        }

        let records: Vec<ScanFileRecord> = all_units
            .into_iter()
            .map(|u| ScanFileRecord {
                id: uuid::Uuid::new_v4().to_string(),
                run_id: run.id.clone(),
                path: u.path,
                size: u.size,
                modified_at: u.modified_at,
                status: FileStatus::Pending,
                error_message: None,
            })
            .collect();
        self.store.insert_files(&records)?;

        self.store
            .update_run_status(&run.id, RunStatus::PreviewReady, None, warning.as_deref())?;
        Ok(())
    }

    /// Confirm deletion of a run's previewed files. Guarded by a per-instance
    /// mutex so a concurrent scan can never race the delete phase.
    pub async fn confirm_delete(
        &self,
        run_id: &str,
        instance_id: &str,
        primary: Arc<dyn ClientAdapter>,
        peers: Vec<PeerInstance>,
        settings: &Settings,
    ) -> Result<ScanRun> {
        let lock = self.delete_lock_for(instance_id);
        let _guard = lock.lock().await;

        let run = self.store.get_run(run_id)?;
        if run.status != RunStatus::PreviewReady {
            return Err(ScanError::RunNotPreviewReady(run_id.to_string()));
        }
        let cancel = self.cancellation_for(run_id);

        self.store
            .update_run_status(run_id, RunStatus::Deleting, None, None)?;

        self.active_deletes.lock().unwrap().insert(run_id.to_string());
        let outcome = self
            .execute_delete(&run, instance_id, &*primary, &peers, settings, &cancel)
            .await;
        self.active_deletes.lock().unwrap().remove(run_id);

        match outcome {
            Ok(()) => {}
            Err(e) => {
                let canceled = cancel.is_cancelled();
                let status = if canceled { RunStatus::Canceled } else { RunStatus::Failed };
                self.store.update_run_status(
                    run_id,
                    status,
                    (!canceled).then(|| e.to_string()).as_deref(),
                    None,
                )?;
            }
        }

        let run = self.store.get_run(run_id)?;
        if run.status == RunStatus::Completed {
            self.notifier.scan_completed(&run);
        } else if run.status == RunStatus::Failed {
            self.notifier.scan_failed(&run);
        }
        Ok(run)
    }

    async fn execute_delete(
        &self,
        run: &ScanRun,
        instance_id: &str,
        primary: &dyn ClientAdapter,
        peers: &[PeerInstance],
        settings: &Settings,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Fresh snapshot: the race-closing re-check against any
        // overlapping instance that may have added torrents since preview.
        let map = filemap::build_file_map(
            instance_id,
            primary,
            peers,
            &self.memo,
            Default::default(),
            cancel,
        )
        .await?;

        let records = self.store.list_files(&run.id)?;
        let roots = run.scan_paths.clone();
        let ignore_paths = settings.ignore_paths.clone();

        let mut files_deleted = 0u64;
        let mut bytes_reclaimed = 0u64;
        let mut attempted = 0u64;
        let mut failures = 0u64;
        let mut swept_targets: Vec<(std::path::PathBuf, std::path::PathBuf)> = Vec::new();

        for record in &records {
            if cancel.is_cancelled() {
                break;
            }
            let owning_root = match safe_delete::owning_root(&record.path, &roots) {
                Some(r) => r.clone(),
                None => continue,
            };

            attempted += 1;
            let disposition = delete_blocking(
                owning_root.clone(),
                record.path.clone(),
                &map.pathset,
                ignore_paths.clone(),
            )
            .await?;

            let (status, error_message) = match disposition {
                Disposition::Deleted => {
                    files_deleted += 1;
                    bytes_reclaimed += record.size;
                    swept_targets.push((record.path.clone(), owning_root));
                    (FileStatus::Deleted, None)
                }
                Disposition::SkippedMissing => {
                    swept_targets.push((record.path.clone(), owning_root));
                    (FileStatus::SkippedMissing, None)
                }
                Disposition::SkippedInUse => (FileStatus::SkippedInUse, None),
                Disposition::SkippedIgnored => (FileStatus::SkippedIgnored, None),
                Disposition::Failed(message) => {
                    failures += 1;
                    (FileStatus::Failed, Some(message))
                }
            };
            self.store
                .update_file_status(&record.id, status, error_message.as_deref())?;
        }

        let folders_deleted = sweep_ancestors(swept_targets, ignore_paths).await;

        self.store.record_deletion_progress(
            &run.id,
            files_deleted,
            folders_deleted,
            bytes_reclaimed,
        )?;

        if cancel.is_cancelled() {
            return Err(ScanError::Canceled);
        }

        if attempted > 0 && failures == attempted {
            return Err(ScanError::Other(anyhow::anyhow!(
                "all {failures} deletions failed"
            )));
        }

        let warning = (failures > 0).then(|| format!("{failures} of {attempted} deletions failed"));
        self.store
            .update_run_status(&run.id, RunStatus::Completed, None, warning.as_deref())?;
        Ok(())
    }
}

async fn walk_blocking(
    root: std::path::PathBuf,
    pathset: &crate::pathset::PathSet,
    ignore_paths: Vec<std::path::PathBuf>,
    grace: Duration,
) -> Result<(Vec<OrphanUnit>, bool)> {
    // walker::walk only needs read access to the PathSet, which is Sync;
    // spawn_blocking requires 'static so we pass references through a raw
    // pointer-free route by cloning the Arc-backed pieces the caller holds.
    // Here the PathSet itself lives on the stack of the calling future,
    // which outlives this await point, so a scoped thread would be ideal;
    // tokio's blocking pool has no scoped variant, so the walk runs inline
    // on the async worker thread instead (bounded by root directory size).
    tokio::task::block_in_place(|| walker::walk(&root, pathset, &ignore_paths, grace, 0))
        .map_err(|e| ScanError::WalkFailed { root, source: e })
}

async fn delete_blocking(
    scan_root: std::path::PathBuf,
    target: std::path::PathBuf,
    pathset: &crate::pathset::PathSet,
    ignore_paths: Vec<std::path::PathBuf>,
) -> Result<Disposition> {
    tokio::task::block_in_place(|| {
        safe_delete::safe_delete_target(&scan_root, &target, pathset, &ignore_paths)
    })
}

async fn sweep_ancestors(
    targets: Vec<(std::path::PathBuf, std::path::PathBuf)>,
    ignore_paths: Vec<std::path::PathBuf>,
) -> u64 {
    let candidates = safe_delete::ancestor_sweep_candidates(&targets, &ignore_paths);
    let mut removed = 0u64;
    for dir in candidates {
        let root = targets
            .iter()
            .find(|(_, r)| crate::normalize::is_strict_ancestor(r, &dir))
            .map(|(_, r)| r.clone());
        let Some(root) = root else { continue };
        let result = tokio::task::block_in_place(|| safe_delete::safe_delete_empty_dir(&root, &dir));
        if result.is_ok() && !dir.exists() {
            removed += 1;
        }
    }
    removed
}

fn dedupe_units(units: &mut Vec<OrphanUnit>) {
    use std::collections::HashMap as Map;
    let mut best: Map<std::path::PathBuf, OrphanUnit> = Map::new();
    for unit in units.drain(..) {
        let key = crate::normalize::normalize(&unit.path);
        best.entry(key)
            .and_modify(|existing| {
                if unit.size > existing.size {
                    existing.size = unit.size;
                }
                if unit.modified_at > existing.modified_at {
                    existing.modified_at = unit.modified_at;
                }
            })
            .or_insert(unit);
    }
    units.extend(best.into_values());
}

fn sort_units(units: &mut [OrphanUnit], order: PreviewOrder) {
    units.sort_by(|a, b| {
        let primary = match order {
            PreviewOrder::SizeDesc => b.size.cmp(&a.size),
            PreviewOrder::DirectorySizeDesc => b.size.cmp(&a.size),
        };
        primary.then_with(|| {
            a.path
                .to_string_lossy()
                .to_lowercase()
                .cmp(&b.path.to_string_lossy().to_lowercase())
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fixture::FixtureClient;
    use crate::client::{Torrent, TorrentState};
    use crate::store::SqliteStore;
    use std::fs;
    use tempfile::tempdir;

    fn settings() -> Settings {
        Settings {
            max_files_per_run: 100,
            grace_period_minutes: 0,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn clean_scan_with_no_orphans_completes_immediately() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("live.mkv"), b"x").unwrap();

        let client = Arc::new(FixtureClient::new());
        client.add_torrent(
            Torrent {
                hash: "H".to_string(),
                save_path: root.clone(),
                state: TorrentState::Seeding,
            },
            vec![crate::client::TorrentFile {
                name: "live.mkv".into(),
                size: 1,
            }],
        );

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let notifier = Arc::new(crate::notifier::LoggingNotifier);
        let orchestrator = Orchestrator::new(store.clone(), notifier);

        let run = orchestrator
            .run_scan("inst", client, vec![], Trigger::Manual, &settings())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.files_found, 0);
    }

    #[tokio::test]
    async fn scan_with_orphan_reaches_preview_ready_then_deletes_on_confirm() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("live.mkv"), b"x").unwrap();
        fs::write(root.join("orphan.mkv"), b"yy").unwrap();

        let client = Arc::new(FixtureClient::new());
        client.add_torrent(
            Torrent {
                hash: "H".to_string(),
                save_path: root.clone(),
                state: TorrentState::Seeding,
            },
            vec![crate::client::TorrentFile {
                name: "live.mkv".into(),
                size: 1,
            }],
        );

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let notifier = Arc::new(crate::notifier::LoggingNotifier);
        let orchestrator = Orchestrator::new(store.clone(), notifier);

        let run = orchestrator
            .run_scan("inst", client.clone(), vec![], Trigger::Manual, &settings())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::PreviewReady);
        assert_eq!(run.files_found, 1);

        let run = orchestrator
            .confirm_delete(&run.id, "inst", client, vec![], &settings())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.files_deleted, 1);
        assert!(!root.join("orphan.mkv").exists());
        assert!(root.join("live.mkv").exists());
    }

    #[tokio::test]
    async fn partial_root_failure_still_completes_with_warning() {
        let dir = tempdir().unwrap();
        let good_root = dir.path().join("good");
        fs::create_dir_all(&good_root).unwrap();
        fs::write(good_root.join("orphan.mkv"), b"x").unwrap();
        let missing_root = dir.path().join("missing");

        let client = Arc::new(FixtureClient::new());
        client.add_torrent(
            Torrent {
                hash: "A".to_string(),
                save_path: good_root.clone(),
                state: TorrentState::Seeding,
            },
            vec![],
        );
        client.add_torrent(
            Torrent {
                hash: "B".to_string(),
                save_path: missing_root.clone(),
                state: TorrentState::Seeding,
            },
            vec![],
        );

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let notifier = Arc::new(crate::notifier::LoggingNotifier);
        let orchestrator = Orchestrator::new(store.clone(), notifier);

        let run = orchestrator
            .run_scan("inst", client, vec![], Trigger::Manual, &settings())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::PreviewReady);
        assert_eq!(run.files_found, 1);
        assert!(run
            .warning_message
            .as_deref()
            .unwrap()
            .contains("missing"));
    }

    #[test]
    fn cancel_is_refused_while_delete_phase_is_active() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let run = store
            .create_run_if_no_active("inst", Trigger::Manual, &[])
            .unwrap();

        let notifier = Arc::new(crate::notifier::LoggingNotifier);
        let orchestrator = Orchestrator::new(store.clone(), notifier);
        orchestrator.cancellation_for(&run.id);
        orchestrator
            .active_deletes
            .lock()
            .unwrap()
            .insert(run.id.clone());

        let err = orchestrator.cancel(&run.id).unwrap_err();
        assert!(matches!(err, ScanError::CancelRefused(_)));

        orchestrator.active_deletes.lock().unwrap().remove(&run.id);
        assert!(orchestrator.cancel(&run.id).is_ok());
    }

    #[test]
    fn restart_recovery_fails_interrupted_deletions() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let run = store
            .create_run_if_no_active("inst", Trigger::Manual, &[])
            .unwrap();
        store
            .update_run_status(&run.id, RunStatus::Deleting, None, None)
            .unwrap();

        let notifier = Arc::new(crate::notifier::LoggingNotifier);
        let orchestrator = Orchestrator::new(store.clone(), notifier);
        orchestrator.recover_from_restart().unwrap();

        let reloaded = store.get_run(&run.id).unwrap();
        assert_eq!(reloaded.status, RunStatus::Failed);
        assert_eq!(
            reloaded.error_message.as_deref(),
            Some("Deletion interrupted by restart")
        );
    }
}
