//! Data types shared by the store, orchestrator, and walker: the persisted
//! shape of a scan run and its files, and per-instance settings.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Scanning,
    PreviewReady,
    Deleting,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Canceled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Scanning => "scanning",
            RunStatus::PreviewReady => "preview_ready",
            RunStatus::Deleting => "deleting",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => RunStatus::Pending,
            "scanning" => RunStatus::Scanning,
            "preview_ready" => RunStatus::PreviewReady,
            "deleting" => RunStatus::Deleting,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "canceled" => RunStatus::Canceled,
            other => return Err(format!("unrecognized run status: {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    Manual,
    Scheduled,
    Webhook,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Trigger::Manual => "manual",
            Trigger::Scheduled => "scheduled",
            Trigger::Webhook => "webhook",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "manual" => Trigger::Manual,
            "scheduled" => Trigger::Scheduled,
            "webhook" => Trigger::Webhook,
            other => return Err(format!("unrecognized trigger: {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Pending,
    Deleted,
    SkippedInUse,
    SkippedMissing,
    SkippedIgnored,
    Failed,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileStatus::Pending => "pending",
            FileStatus::Deleted => "deleted",
            FileStatus::SkippedInUse => "skipped_in_use",
            FileStatus::SkippedMissing => "skipped_missing",
            FileStatus::SkippedIgnored => "skipped_ignored",
            FileStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => FileStatus::Pending,
            "deleted" => FileStatus::Deleted,
            "skipped_in_use" => FileStatus::SkippedInUse,
            "skipped_missing" => FileStatus::SkippedMissing,
            "skipped_ignored" => FileStatus::SkippedIgnored,
            "failed" => FileStatus::Failed,
            other => return Err(format!("unrecognized file status: {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreviewOrder {
    SizeDesc,
    DirectorySizeDesc,
}

impl std::fmt::Display for PreviewOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PreviewOrder::SizeDesc => "size_desc",
            PreviewOrder::DirectorySizeDesc => "directory_size_desc",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for PreviewOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "size_desc" => PreviewOrder::SizeDesc,
            "directory_size_desc" => PreviewOrder::DirectorySizeDesc,
            other => return Err(format!("unrecognized preview order: {other}")),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ScanRun {
    pub id: String,
    pub instance_id: String,
    pub status: RunStatus,
    pub trigger: Trigger,
    pub scan_paths: Vec<PathBuf>,
    pub files_found: u64,
    pub files_deleted: u64,
    pub folders_deleted: u64,
    pub bytes_reclaimed: u64,
    pub truncated: bool,
    pub error_message: Option<String>,
    pub warning_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One orphan unit as persisted against a run: a file or a disc-layout
/// directory collapsed into a single deletion target.
#[derive(Debug, Clone)]
pub struct ScanFileRecord {
    pub id: String,
    pub run_id: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub status: FileStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub enabled: bool,
    pub grace_period_minutes: u64,
    pub ignore_paths: Vec<PathBuf>,
    pub scan_interval_hours: u64,
    pub preview_order: PreviewOrder,
    pub max_files_per_run: usize,
    pub auto_cleanup_enabled: bool,
    pub auto_cleanup_ceiling: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            grace_period_minutes: 60,
            ignore_paths: Vec::new(),
            scan_interval_hours: 24,
            preview_order: PreviewOrder::SizeDesc,
            max_files_per_run: 10_000,
            auto_cleanup_enabled: false,
            auto_cleanup_ceiling: 25,
        }
    }
}
