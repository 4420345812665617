//! 5-minute tick loop that fans a scan task out per due instance, with
//! jittered start times and a pre-flight gate re-check right before the run
//! actually begins.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::client::ClientAdapter;
use crate::filemap::PeerInstance;
use crate::model::{Settings, Trigger};
use crate::orchestrator::Orchestrator;
use crate::readiness;
use crate::store::Store;

const TICK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// One configured client instance the scheduler is responsible for.
pub struct Instance {
    pub id: String,
    pub client: Arc<dyn ClientAdapter>,
    pub local_fs_access: bool,
    pub orphan_scan_enabled: bool,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    orchestrator: Arc<Orchestrator>,
    max_jitter: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, orchestrator: Arc<Orchestrator>, max_jitter: Duration) -> Self {
        Self {
            store,
            orchestrator,
            max_jitter,
        }
    }

    /// Run the tick loop until `cancel` fires. Intended to be spawned as its
    /// own long-lived task.
    pub async fn run(&self, instances: Vec<Instance>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(&instances, &cancel).await;
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn tick(&self, instances: &[Instance], cancel: &CancellationToken) {
        for instance in instances {
            if !instance.local_fs_access || !instance.orphan_scan_enabled {
                continue;
            }
            if !self.is_due(&instance.id) {
                continue;
            }

            let jitter = {
                let max_ms = self.max_jitter.as_millis().max(1) as u64;
                Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
            };

            let id = instance.id.clone();
            let client = instance.client.clone();
            let store = self.store.clone();
            let orchestrator = self.orchestrator.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(jitter) => {}
                    _ = cancel.cancelled() => return,
                }

                let settings = match store.get_settings(&id) {
                    Ok(s) => s,
                    Err(_) => return,
                };
                if !settings.enabled {
                    return;
                }
                if readiness::check_gates(&*client, &id, chrono::Utc::now()).is_err() {
                    return;
                }
                let recovery = client.last_recovery_time();
                if orchestrator.settled_memo().get(&id, recovery) != Some(true) {
                    return;
                }

                let peers: Vec<PeerInstance> = Vec::new();
                let _ = orchestrator
                    .run_scan(&id, client, peers, Trigger::Scheduled, &settings)
                    .await;
            });
        }
    }

    fn is_due(&self, instance_id: &str) -> bool {
        match self.store.last_completed_run(instance_id) {
            Ok(Some(run)) => {
                let settings = self
                    .store
                    .get_settings(instance_id)
                    .unwrap_or_else(|_| Settings::default());
                let interval = chrono::Duration::hours(settings.scan_interval_hours as i64);
                let due_at = run.completed_at.unwrap_or(run.started_at) + interval;
                chrono::Utc::now() >= due_at
            }
            Ok(None) => true, // never run: due immediately
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    #[test]
    fn instance_never_run_is_immediately_due() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(crate::notifier::LoggingNotifier),
        ));
        let scheduler = Scheduler::new(store, orchestrator, Duration::from_secs(30));
        assert!(scheduler.is_due("inst"));
    }

    #[test]
    fn instance_with_recent_completed_run_is_not_due() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .put_settings(
                "inst",
                &Settings {
                    scan_interval_hours: 24,
                    ..Settings::default()
                },
            )
            .unwrap();
        let run = store
            .create_run_if_no_active("inst", Trigger::Manual, &[])
            .unwrap();
        store
            .update_run_status(&run.id, crate::model::RunStatus::Completed, None, None)
            .unwrap();

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(crate::notifier::LoggingNotifier),
        ));
        let scheduler = Scheduler::new(store, orchestrator, Duration::from_secs(30));
        assert!(!scheduler.is_due("inst"));
    }
}
