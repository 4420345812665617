//! Readiness and settling gates: decides whether a client's
//! torrent state is trustworthy enough to scan against.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::client::{ClientAdapter, TorrentState};
use crate::error::{Result, ScanError};

const RECOVERY_GRACE: Duration = Duration::from_secs(3 * 60);
const SYNC_STALENESS: Duration = Duration::from_secs(2 * 60);

#[derive(Debug, Clone, Copy)]
pub struct SettlingConfig {
    pub samples: usize,
    pub interval: Duration,
    pub busy_fraction_ceiling: f64,
}

impl Default for SettlingConfig {
    fn default() -> Self {
        Self {
            samples: 4,
            interval: Duration::from_secs(20),
            busy_fraction_ceiling: 0.05,
        }
    }
}

/// Cheap gates checked before (and, by the scheduler, again right before)
/// committing to a full settling check.
pub fn check_gates(client: &dyn ClientAdapter, instance: &str, now: DateTime<Utc>) -> Result<()> {
    if !client.is_healthy() {
        return Err(ScanError::NotReady {
            instance: instance.to_string(),
            reason: "client is unhealthy".to_string(),
        });
    }

    if let Some(recovery) = client.last_recovery_time() {
        let since = now.signed_duration_since(recovery);
        if since < chrono::Duration::from_std(RECOVERY_GRACE).unwrap() {
            return Err(ScanError::NotReady {
                instance: instance.to_string(),
                reason: "client recently recovered and is within its grace period".to_string(),
            });
        }
    }

    match client.last_sync_time() {
        None => {
            return Err(ScanError::NotReady {
                instance: instance.to_string(),
                reason: "client has never completed a sync".to_string(),
            })
        }
        Some(sync) => {
            if let Some(recovery) = client.last_recovery_time() {
                if sync < recovery {
                    return Err(ScanError::NotReady {
                        instance: instance.to_string(),
                        reason: "last sync predates the client's last recovery".to_string(),
                    });
                }
            }
            let age = now.signed_duration_since(sync);
            if age < chrono::Duration::zero()
                || age > chrono::Duration::from_std(SYNC_STALENESS).unwrap()
            {
                return Err(ScanError::NotReady {
                    instance: instance.to_string(),
                    reason: "last sync is stale".to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Memoizes settling results per `(instance, last_recovery_time)` so the 4×
/// sample window only runs once per recovery event.
#[derive(Default)]
pub struct SettledMemo {
    entries: RwLock<HashMap<String, (Option<DateTime<Utc>>, bool)>>,
}

impl SettledMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, instance: &str, recovery: Option<DateTime<Utc>>) -> Option<bool> {
        let entries = self.entries.read().unwrap();
        entries.get(instance).and_then(|(r, settled)| {
            if *r == recovery {
                Some(*settled)
            } else {
                None
            }
        })
    }

    pub fn record(&self, instance: &str, recovery: Option<DateTime<Utc>>, settled: bool) {
        self.entries
            .write()
            .unwrap()
            .insert(instance.to_string(), (recovery, settled));
    }

    /// Invalidated whenever a fresh build fails for this instance, so the
    /// next attempt re-runs the full settling window instead of trusting a
    /// memoized success that turned out to be unreliable.
    pub fn invalidate(&self, instance: &str) {
        self.entries.write().unwrap().remove(instance);
    }
}

struct Sample {
    count: usize,
    busy: usize,
}

/// Run (or recall the memoized result of) the settling check for `instance`.
pub async fn ensure_settled(
    client: &dyn ClientAdapter,
    instance: &str,
    memo: &SettledMemo,
    config: SettlingConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let recovery = client.last_recovery_time();
    if let Some(settled) = memo.get(instance, recovery) {
        return if settled {
            Ok(())
        } else {
            Err(ScanError::NotSettled {
                instance: instance.to_string(),
                reason: "memoized settling check previously failed".to_string(),
            })
        };
    }

    let result = run_settling_window(client, config, cancel).await;
    let settled = result.is_ok();
    memo.record(instance, recovery, settled);

    result.map_err(|reason| ScanError::NotSettled {
        instance: instance.to_string(),
        reason,
    })
}

async fn run_settling_window(
    client: &dyn ClientAdapter,
    config: SettlingConfig,
    cancel: &CancellationToken,
) -> std::result::Result<(), String> {
    let mut samples = Vec::with_capacity(config.samples);

    for i in 0..config.samples {
        if i > 0 {
            tokio::select! {
                _ = tokio::time::sleep(config.interval) => {}
                _ = cancel.cancelled() => return Err("canceled during settling window".to_string()),
            }
        }

        let torrents = client
            .list_torrents()
            .await
            .map_err(|e| format!("failed to sample torrent list: {e}"))?;
        let busy = torrents.iter().filter(|t| t.state.is_busy()).count();
        samples.push(Sample {
            count: torrents.len(),
            busy,
        });
    }

    let last = samples.last().unwrap();
    if last.count == 0 {
        return Err("no torrents present in the final sample".to_string());
    }

    let min = samples.iter().map(|s| s.count).min().unwrap();
    let max = samples.iter().map(|s| s.count).max().unwrap();
    let allowed_spread = ((max as f64 / 1000.0).floor() as usize).max(10);
    if max - min > allowed_spread {
        return Err(format!(
            "torrent count unstable across samples (min={min}, max={max})"
        ));
    }
    for pair in samples.windows(2) {
        let delta = pair[1].count.abs_diff(pair[0].count);
        if delta >= 50 {
            return Err(format!("batch-load jump of {delta} detected between samples"));
        }
    }

    let total_count: usize = samples.iter().map(|s| s.count).sum();
    let total_busy: usize = samples.iter().map(|s| s.busy).sum();
    if total_count > 0 {
        let fraction = total_busy as f64 / total_count as f64;
        if fraction > config.busy_fraction_ceiling {
            return Err(format!(
                "too many torrents busy checking/allocating ({:.1}%)",
                fraction * 100.0
            ));
        }
    }

    match client.last_sync_time() {
        Some(sync) => {
            let age = Utc::now().signed_duration_since(sync);
            if age < chrono::Duration::zero()
                || age > chrono::Duration::from_std(SYNC_STALENESS).unwrap()
            {
                return Err("sync went stale during the settling window".to_string());
            }
        }
        None => return Err("client has no sync time after the settling window".to_string()),
    }

    Ok(())
}

/// Eligible torrents for the file-completeness check: every torrent that
/// isn't still fetching metadata (those legitimately expose no files yet).
pub fn eligible_for_completeness_check<'a>(
    torrents: &'a [crate::client::Torrent],
) -> impl Iterator<Item = &'a crate::client::Torrent> {
    torrents
        .iter()
        .filter(|t| !TorrentState::is_fetching_metadata(t.state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fixture::FixtureClient;
    use crate::client::{Torrent, TorrentFile, TorrentState};

    #[test]
    fn gates_reject_unhealthy_client() {
        let client = FixtureClient::new();
        client.set_healthy(false);
        let err = check_gates(&client, "inst", Utc::now()).unwrap_err();
        assert!(matches!(err, ScanError::NotReady { .. }));
    }

    #[test]
    fn gates_reject_recent_recovery() {
        let client = FixtureClient::new();
        client.set_last_recovery_time(Some(Utc::now()));
        let err = check_gates(&client, "inst", Utc::now()).unwrap_err();
        assert!(matches!(err, ScanError::NotReady { .. }));
    }

    #[test]
    fn gates_reject_stale_sync() {
        let client = FixtureClient::new();
        client.set_last_sync_time(Some(Utc::now() - chrono::Duration::minutes(10)));
        let err = check_gates(&client, "inst", Utc::now()).unwrap_err();
        assert!(matches!(err, ScanError::NotReady { .. }));
    }

    #[test]
    fn gates_pass_for_healthy_fresh_client() {
        let client = FixtureClient::new();
        assert!(check_gates(&client, "inst", Utc::now()).is_ok());
    }

    #[tokio::test]
    async fn settling_passes_for_stable_non_busy_torrents() {
        let client = FixtureClient::new();
        for i in 0..5 {
            client.add_torrent(
                Torrent {
                    hash: format!("h{i}"),
                    save_path: "/data".into(),
                    state: TorrentState::Seeding,
                },
                vec![TorrentFile {
                    name: "a.mkv".into(),
                    size: 1,
                }],
            );
        }
        let memo = SettledMemo::new();
        let config = SettlingConfig {
            samples: 2,
            interval: Duration::from_millis(1),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let result = ensure_settled(&client, "inst", &memo, config, &cancel).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn settling_memoizes_until_recovery_advances() {
        let client = FixtureClient::new();
        client.add_torrent(
            Torrent {
                hash: "h".to_string(),
                save_path: "/data".into(),
                state: TorrentState::Seeding,
            },
            vec![],
        );
        let memo = SettledMemo::new();
        let config = SettlingConfig {
            samples: 1,
            interval: Duration::from_millis(1),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        ensure_settled(&client, "inst", &memo, config, &cancel)
            .await
            .unwrap();
        assert_eq!(memo.get("inst", None), Some(true));

        // Recovery time advances: memo entry for the old key is stale.
        client.set_last_recovery_time(Some(Utc::now() - chrono::Duration::minutes(10)));
        assert_eq!(memo.get("inst", client.last_recovery_time()), None);
    }

    #[tokio::test]
    async fn settling_fails_on_empty_final_sample() {
        let client = FixtureClient::new();
        let memo = SettledMemo::new();
        let config = SettlingConfig {
            samples: 1,
            interval: Duration::from_millis(1),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let result = ensure_settled(&client, "inst", &memo, config, &cancel).await;
        assert!(result.is_err());
    }
}
