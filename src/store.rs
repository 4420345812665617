//! Persistence contract and its SQLite-backed implementation
//! grounded on a small embedded-database-backed service: WAL journal mode, foreign
//! keys on, `prepare_cached` statements, chunked-transaction batch inserts.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, ScanError};
use crate::model::{FileStatus, PreviewOrder, RunStatus, ScanFileRecord, ScanRun, Settings, Trigger};

/// The persistence boundary the orchestrator depends on. A in-memory
/// implementation for tests lives alongside [`SqliteStore`] for callers that
/// don't want a real database (CLI demo mode, unit tests).
pub trait Store: Send + Sync {
    fn create_run_if_no_active(
        &self,
        instance_id: &str,
        trigger: Trigger,
        scan_paths: &[PathBuf],
    ) -> Result<ScanRun>;

    fn get_run(&self, run_id: &str) -> Result<ScanRun>;

    fn active_run_for_instance(&self, instance_id: &str) -> Result<Option<ScanRun>>;

    fn last_completed_run(&self, instance_id: &str) -> Result<Option<ScanRun>>;

    fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error_message: Option<&str>,
        warning_message: Option<&str>,
    ) -> Result<()>;

    fn update_run_counters(
        &self,
        run_id: &str,
        files_found: u64,
        truncated: bool,
    ) -> Result<()>;

    fn update_scan_paths(&self, run_id: &str, scan_paths: &[PathBuf]) -> Result<()>;

    fn record_deletion_progress(
        &self,
        run_id: &str,
        files_deleted: u64,
        folders_deleted: u64,
        bytes_reclaimed: u64,
    ) -> Result<()>;

    fn insert_files(&self, files: &[ScanFileRecord]) -> Result<()>;

    fn list_files(&self, run_id: &str) -> Result<Vec<ScanFileRecord>>;

    fn update_file_status(
        &self,
        file_id: &str,
        status: FileStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    fn non_terminal_runs(&self) -> Result<Vec<ScanRun>>;

    fn get_settings(&self, instance_id: &str) -> Result<Settings>;

    fn put_settings(&self, instance_id: &str, settings: &Settings) -> Result<()>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scan_runs (
                id               TEXT PRIMARY KEY,
                instance_id      TEXT NOT NULL,
                status           TEXT NOT NULL,
                trigger          TEXT NOT NULL,
                scan_paths       TEXT NOT NULL,
                files_found      INTEGER NOT NULL DEFAULT 0,
                files_deleted    INTEGER NOT NULL DEFAULT 0,
                folders_deleted  INTEGER NOT NULL DEFAULT 0,
                bytes_reclaimed  INTEGER NOT NULL DEFAULT 0,
                truncated        INTEGER NOT NULL DEFAULT 0,
                error_message    TEXT,
                warning_message  TEXT,
                started_at       TEXT NOT NULL,
                completed_at     TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_scan_runs_instance_status
                ON scan_runs(instance_id, status);

            CREATE TABLE IF NOT EXISTS scan_files (
                id            TEXT PRIMARY KEY,
                run_id        TEXT NOT NULL REFERENCES scan_runs(id),
                path          TEXT NOT NULL,
                size          INTEGER NOT NULL,
                modified_at   TEXT NOT NULL,
                status        TEXT NOT NULL,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_scan_files_run ON scan_files(run_id);

            CREATE TABLE IF NOT EXISTS scan_settings (
                instance_id           TEXT PRIMARY KEY,
                enabled               INTEGER NOT NULL,
                grace_period_minutes  INTEGER NOT NULL,
                ignore_paths          TEXT NOT NULL,
                scan_interval_hours   INTEGER NOT NULL,
                preview_order         TEXT NOT NULL,
                max_files_per_run     INTEGER NOT NULL,
                auto_cleanup_enabled  INTEGER NOT NULL,
                auto_cleanup_ceiling  INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<ScanRun> {
        let status: String = row.get("status")?;
        let trigger: String = row.get("trigger")?;
        let scan_paths: String = row.get("scan_paths")?;
        let started_at: String = row.get("started_at")?;
        let completed_at: Option<String> = row.get("completed_at")?;

        Ok(ScanRun {
            id: row.get("id")?,
            instance_id: row.get("instance_id")?,
            status: RunStatus::from_str(&status).unwrap_or(RunStatus::Failed),
            trigger: Trigger::from_str(&trigger).unwrap_or(Trigger::Manual),
            scan_paths: serde_json::from_str::<Vec<PathBuf>>(&scan_paths).unwrap_or_default(),
            files_found: row.get::<_, i64>("files_found")? as u64,
            files_deleted: row.get::<_, i64>("files_deleted")? as u64,
            folders_deleted: row.get::<_, i64>("folders_deleted")? as u64,
            bytes_reclaimed: row.get::<_, i64>("bytes_reclaimed")? as u64,
            truncated: row.get::<_, i64>("truncated")? != 0,
            error_message: row.get("error_message")?,
            warning_message: row.get("warning_message")?,
            started_at: parse_time(&started_at),
            completed_at: completed_at.as_deref().map(parse_time),
        })
    }
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl Store for SqliteStore {
    fn create_run_if_no_active(
        &self,
        instance_id: &str,
        trigger: Trigger,
        scan_paths: &[PathBuf],
    ) -> Result<ScanRun> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM scan_runs
                 WHERE instance_id = ?1
                   AND status NOT IN ('completed', 'failed', 'canceled')
                 LIMIT 1",
                params![instance_id],
                |r| r.get(0),
            )
            .optional()?;

        if existing.is_some() {
            return Err(ScanError::RunAlreadyActive(instance_id.to_string()));
        }

        let run = ScanRun {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            status: RunStatus::Pending,
            trigger,
            scan_paths: scan_paths.to_vec(),
            files_found: 0,
            files_deleted: 0,
            folders_deleted: 0,
            bytes_reclaimed: 0,
            truncated: false,
            error_message: None,
            warning_message: None,
            started_at: Utc::now(),
            completed_at: None,
        };

        tx.execute(
            "INSERT INTO scan_runs (
                id, instance_id, status, trigger, scan_paths, started_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.id,
                run.instance_id,
                run.status.to_string(),
                run.trigger.to_string(),
                serde_json::to_string(&run.scan_paths).unwrap_or_default(),
                run.started_at.to_rfc3339(),
            ],
        )?;

        tx.commit()?;
        Ok(run)
    }

    fn get_run(&self, run_id: &str) -> Result<ScanRun> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM scan_runs WHERE id = ?1",
            params![run_id],
            Self::row_to_run,
        )
        .optional()?
        .ok_or_else(|| ScanError::RunNotFound(run_id.to_string()))
    }

    fn active_run_for_instance(&self, instance_id: &str) -> Result<Option<ScanRun>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT * FROM scan_runs
                 WHERE instance_id = ?1
                   AND status NOT IN ('completed', 'failed', 'canceled')
                 LIMIT 1",
                params![instance_id],
                Self::row_to_run,
            )
            .optional()?)
    }

    fn last_completed_run(&self, instance_id: &str) -> Result<Option<ScanRun>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT * FROM scan_runs
                 WHERE instance_id = ?1 AND status = 'completed'
                 ORDER BY completed_at DESC LIMIT 1",
                params![instance_id],
                Self::row_to_run,
            )
            .optional()?)
    }

    fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error_message: Option<&str>,
        warning_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let completed_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        conn.execute(
            "UPDATE scan_runs
             SET status = ?1, error_message = ?2, warning_message = ?3, completed_at = COALESCE(?4, completed_at)
             WHERE id = ?5",
            params![status.to_string(), error_message, warning_message, completed_at, run_id],
        )?;
        Ok(())
    }

    fn update_run_counters(&self, run_id: &str, files_found: u64, truncated: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scan_runs SET files_found = ?1, truncated = ?2 WHERE id = ?3",
            params![files_found as i64, truncated as i64, run_id],
        )?;
        Ok(())
    }

    fn update_scan_paths(&self, run_id: &str, scan_paths: &[PathBuf]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scan_runs SET scan_paths = ?1 WHERE id = ?2",
            params![serde_json::to_string(scan_paths).unwrap_or_default(), run_id],
        )?;
        Ok(())
    }

    fn record_deletion_progress(
        &self,
        run_id: &str,
        files_deleted: u64,
        folders_deleted: u64,
        bytes_reclaimed: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scan_runs
             SET files_deleted = ?1, folders_deleted = ?2, bytes_reclaimed = ?3
             WHERE id = ?4",
            params![
                files_deleted as i64,
                folders_deleted as i64,
                bytes_reclaimed as i64,
                run_id
            ],
        )?;
        Ok(())
    }

    fn insert_files(&self, files: &[ScanFileRecord]) -> Result<()> {
        const BATCH_SIZE: usize = 1000;
        let mut conn = self.conn.lock().unwrap();
        for chunk in files.chunks(BATCH_SIZE) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO scan_files (id, run_id, path, size, modified_at, status, error_message)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for f in chunk {
                    stmt.execute(params![
                        f.id,
                        f.run_id,
                        f.path.to_string_lossy(),
                        f.size as i64,
                        f.modified_at.to_rfc3339(),
                        f.status.to_string(),
                        f.error_message,
                    ])?;
                }
            }
            tx.commit()?;
        }
        Ok(())
    }

    fn list_files(&self, run_id: &str) -> Result<Vec<ScanFileRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, path, size, modified_at, status, error_message
             FROM scan_files WHERE run_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                let path: String = row.get(2)?;
                let modified_at: String = row.get(4)?;
                let status: String = row.get(5)?;
                Ok(ScanFileRecord {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    path: PathBuf::from(path),
                    size: row.get::<_, i64>(3)? as u64,
                    modified_at: parse_time(&modified_at),
                    status: FileStatus::from_str(&status).unwrap_or(FileStatus::Failed),
                    error_message: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn update_file_status(
        &self,
        file_id: &str,
        status: FileStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scan_files SET status = ?1, error_message = ?2 WHERE id = ?3",
            params![status.to_string(), error_message, file_id],
        )?;
        Ok(())
    }

    fn non_terminal_runs(&self) -> Result<Vec<ScanRun>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM scan_runs WHERE status NOT IN ('completed', 'failed', 'canceled')",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn get_settings(&self, instance_id: &str) -> Result<Settings> {
        let conn = self.conn.lock().unwrap();
        let found = conn
            .query_row(
                "SELECT enabled, grace_period_minutes, ignore_paths, scan_interval_hours,
                        preview_order, max_files_per_run, auto_cleanup_enabled, auto_cleanup_ceiling
                 FROM scan_settings WHERE instance_id = ?1",
                params![instance_id],
                |row| {
                    let ignore_paths: String = row.get(2)?;
                    let preview_order: String = row.get(4)?;
                    Ok(Settings {
                        enabled: row.get::<_, i64>(0)? != 0,
                        grace_period_minutes: row.get::<_, i64>(1)? as u64,
                        ignore_paths: serde_json::from_str(&ignore_paths).unwrap_or_default(),
                        scan_interval_hours: row.get::<_, i64>(3)? as u64,
                        preview_order: PreviewOrder::from_str(&preview_order)
                            .unwrap_or(PreviewOrder::SizeDesc),
                        max_files_per_run: row.get::<_, i64>(5)? as usize,
                        auto_cleanup_enabled: row.get::<_, i64>(6)? != 0,
                        auto_cleanup_ceiling: row.get::<_, i64>(7)? as usize,
                    })
                },
            )
            .optional()?;
        Ok(found.unwrap_or_default())
    }

    fn put_settings(&self, instance_id: &str, settings: &Settings) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO scan_settings (
                instance_id, enabled, grace_period_minutes, ignore_paths, scan_interval_hours,
                preview_order, max_files_per_run, auto_cleanup_enabled, auto_cleanup_ceiling
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(instance_id) DO UPDATE SET
                enabled = excluded.enabled,
                grace_period_minutes = excluded.grace_period_minutes,
                ignore_paths = excluded.ignore_paths,
                scan_interval_hours = excluded.scan_interval_hours,
                preview_order = excluded.preview_order,
                max_files_per_run = excluded.max_files_per_run,
                auto_cleanup_enabled = excluded.auto_cleanup_enabled,
                auto_cleanup_ceiling = excluded.auto_cleanup_ceiling",
            params![
                instance_id,
                settings.enabled as i64,
                settings.grace_period_minutes as i64,
                serde_json::to_string(&settings.ignore_paths).unwrap_or_default(),
                settings.scan_interval_hours as i64,
                settings.preview_order.to_string(),
                settings.max_files_per_run as i64,
                settings.auto_cleanup_enabled as i64,
                settings.auto_cleanup_ceiling as i64,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_run_if_no_active_rejects_second_non_terminal_run() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .create_run_if_no_active("inst", Trigger::Manual, &[])
            .unwrap();
        let err = store
            .create_run_if_no_active("inst", Trigger::Manual, &[])
            .unwrap_err();
        assert!(matches!(err, ScanError::RunAlreadyActive(_)));
    }

    #[test]
    fn create_run_is_allowed_again_once_prior_run_is_terminal() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store
            .create_run_if_no_active("inst", Trigger::Manual, &[])
            .unwrap();
        store
            .update_run_status(&run.id, RunStatus::Completed, None, None)
            .unwrap();
        let second = store.create_run_if_no_active("inst", Trigger::Manual, &[]);
        assert!(second.is_ok());
    }

    #[test]
    fn insert_and_list_files_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store
            .create_run_if_no_active("inst", Trigger::Scheduled, &[PathBuf::from("/data")])
            .unwrap();

        let record = ScanFileRecord {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            path: PathBuf::from("/data/orphan.mkv"),
            size: 42,
            modified_at: Utc::now(),
            status: FileStatus::Pending,
            error_message: None,
        };
        store.insert_files(&[record.clone()]).unwrap();

        let files = store.list_files(&run.id).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, record.path);
        assert_eq!(files[0].status, FileStatus::Pending);
    }

    #[test]
    fn settings_default_when_unset_and_persist_after_put() {
        let store = SqliteStore::open_in_memory().unwrap();
        let defaults = store.get_settings("inst").unwrap();
        assert_eq!(defaults.grace_period_minutes, 60);

        let mut custom = defaults;
        custom.grace_period_minutes = 120;
        store.put_settings("inst", &custom).unwrap();
        let reloaded = store.get_settings("inst").unwrap();
        assert_eq!(reloaded.grace_period_minutes, 120);
    }

    #[test]
    fn non_terminal_runs_excludes_completed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store
            .create_run_if_no_active("inst", Trigger::Manual, &[])
            .unwrap();
        assert_eq!(store.non_terminal_runs().unwrap().len(), 1);
        store
            .update_run_status(&run.id, RunStatus::Completed, None, None)
            .unwrap();
        assert_eq!(store.non_terminal_runs().unwrap().len(), 0);
    }
}
