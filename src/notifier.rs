//! Fire-and-forget completion notifications. Real delivery
//! (webhooks, push) is an external collaborator; the logging implementation
//! gives the orchestrator something concrete to call.

use crate::model::ScanRun;

pub trait Notifier: Send + Sync {
    fn scan_completed(&self, run: &ScanRun);
    fn scan_failed(&self, run: &ScanRun);
}

pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn scan_completed(&self, run: &ScanRun) {
        log::info!(
            "orphan_scan_completed instance={} run={} files_deleted={} bytes_reclaimed={}",
            run.instance_id,
            run.id,
            run.files_deleted,
            run.bytes_reclaimed,
        );
    }

    fn scan_failed(&self, run: &ScanRun) {
        log::warn!(
            "orphan_scan_failed instance={} run={} error={}",
            run.instance_id,
            run.id,
            run.error_message.as_deref().unwrap_or("unknown"),
        );
    }
}
