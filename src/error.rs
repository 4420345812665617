use std::path::PathBuf;

use thiserror::Error;

/// Library-wide error type. Variants line up with the policy table in the
/// design doc so callers can match on *kind* instead of parsing messages.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("instance {0} already has a non-terminal scan run")]
    RunAlreadyActive(String),

    #[error("run {0} not found")]
    RunNotFound(String),

    #[error("run {0} is not in preview_ready status")]
    RunNotPreviewReady(String),

    #[error("run {0} is actively deleting and cannot be canceled")]
    CancelRefused(String),

    #[error("readiness check failed for instance {instance}: {reason}")]
    NotReady { instance: String, reason: String },

    #[error("settling check failed for instance {instance}: {reason}")]
    NotSettled { instance: String, reason: String },

    #[error("failed to fetch torrents/files from primary instance {instance}: {source}")]
    PrimaryFetchFailed {
        instance: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("overlapping instance {instance} is unreachable, refusing to scan: {source}")]
    OverlappingInstanceUnreachable {
        instance: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("torrent {hash} returned no files despite not fetching metadata")]
    IncompleteFileList { hash: String },

    #[error("walk of scan root {root} failed: {source}")]
    WalkFailed {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("all configured scan roots were inaccessible")]
    AllRootsInaccessible,

    #[error("ignore path is not absolute: {0}")]
    IgnorePathNotAbsolute(PathBuf),

    #[error("deletion target must be an absolute path: {0}")]
    TargetNotAbsolute(PathBuf),

    #[error("deletion target equals its scan root: {0}")]
    TargetIsScanRoot(PathBuf),

    #[error("deletion target escapes its scan root: target={target} root={root}")]
    TargetEscapesRoot { target: PathBuf, root: PathBuf },

    #[error("a directory was passed to the file-only delete helper: {0}")]
    DirectoryNotAllowed(PathBuf),

    #[error("deletion was interrupted by a process restart")]
    InterruptedByRestart,

    #[error("scan run was canceled")]
    Canceled,

    #[error("operation timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client adapter error: {0}")]
    Client(#[source] anyhow::Error),

    #[error("{0}")]
    Other(#[source] anyhow::Error),
}

pub type Result<T, E = ScanError> = std::result::Result<T, E>;

impl ScanError {
    /// True for the "absolute refusal" kind: a programmer error that should
    /// never be reachable from user input, as opposed to a recoverable,
    /// user-facing condition.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            ScanError::TargetNotAbsolute(_)
                | ScanError::TargetIsScanRoot(_)
                | ScanError::TargetEscapesRoot { .. }
                | ScanError::DirectoryNotAllowed(_)
        )
    }

    /// A short, user-facing message disambiguating read-only vs. permission
    /// errors, used when classifying a failed delete.
    pub fn describe_io(err: &std::io::Error) -> String {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => "permission denied".to_string(),
            std::io::ErrorKind::NotFound => "file missing".to_string(),
            _ if err.raw_os_error() == Some(30) => "read-only filesystem".to_string(),
            _ => format!("{err}"),
        }
    }
}
