//! Builds the authoritative [`PathSet`] + scan-root list for a scan run by
//! querying the primary torrent-client instance and merging in any other
//! configured instance whose scan roots overlap the primary's.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::ClientAdapter;
use crate::error::{Result, ScanError};
use crate::normalize::{normalize, roots_overlap};
use crate::pathset::PathSet;
use crate::readiness::{self, SettledMemo, SettlingConfig};

const PRIMARY_BUILD_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const OVERLAPPING_BUILD_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const CONFIRMATION_BUILD_TIMEOUT: Duration = Duration::from_secs(90);
const QUICK_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

pub struct FileMap {
    pub pathset: PathSet,
    pub scan_roots: Vec<PathBuf>,
    pub torrent_count: usize,
}

/// A configured instance other than the one currently being scanned.
pub struct PeerInstance {
    pub id: String,
    pub client: Arc<dyn ClientAdapter>,
    pub local_fs_access: bool,
    /// Scan roots from the instance's last completed run, used when a live
    /// discovery fetch times out.
    pub last_known_scan_roots: Vec<PathBuf>,
}

/// Build a file map against a single client, with no cross-instance merging:
/// readiness + settling gates, then a full torrent/file fetch.
pub async fn build_single_instance_map(
    instance_id: &str,
    client: &dyn ClientAdapter,
    memo: &SettledMemo,
    settling_config: SettlingConfig,
    cancel: &CancellationToken,
) -> Result<FileMap> {
    readiness::check_gates(client, instance_id, chrono::Utc::now())?;
    readiness::ensure_settled(client, instance_id, memo, settling_config, cancel).await?;

    let torrents = client
        .list_torrents()
        .await
        .map_err(ScanError::Client)?;

    let mut hashes = Vec::new();
    let mut save_paths = std::collections::HashMap::new();
    for t in &torrents {
        if !t.save_path.is_absolute() {
            continue;
        }
        let hash = t.hash.trim().to_lowercase();
        save_paths.insert(hash.clone(), normalize(&t.save_path));
        hashes.push(hash);
    }

    let files = client
        .list_files_for_hashes(&hashes, true)
        .await
        .map_err(ScanError::Client)?;

    let fetched: HashSet<String> = hashes.iter().cloned().collect();
    let eligible = readiness::eligible_for_completeness_check(&torrents)
        .map(|t| t.hash.trim().to_lowercase())
        .filter(|hash| fetched.contains(hash))
        .collect::<Vec<_>>();
    for hash in &eligible {
        match files.get(hash) {
            Some(list) if !list.is_empty() => {}
            _ => return Err(ScanError::IncompleteFileList { hash: hash.clone() }),
        }
    }

    let pathset = PathSet::new();
    let mut scan_roots: HashSet<PathBuf> = HashSet::new();
    for (hash, save_path) in &save_paths {
        scan_roots.insert(save_path.clone());
        if let Some(file_list) = files.get(hash) {
            for f in file_list {
                pathset.add(&save_path.join(&f.name));
            }
        }
    }

    Ok(FileMap {
        pathset,
        scan_roots: scan_roots.into_iter().collect(),
        torrent_count: torrents.len(),
    })
}

async fn quick_scan_roots(client: &dyn ClientAdapter) -> Result<HashSet<PathBuf>> {
    let torrents = tokio::time::timeout(QUICK_DISCOVERY_TIMEOUT, client.list_torrents())
        .await
        .map_err(|_| ScanError::TimedOut(QUICK_DISCOVERY_TIMEOUT))?
        .map_err(ScanError::Client)?;
    Ok(torrents
        .iter()
        .filter(|t| t.save_path.is_absolute())
        .map(|t| normalize(&t.save_path))
        .collect())
}

fn any_overlap(a: &HashSet<PathBuf>, primary_roots: &[PathBuf]) -> bool {
    a.iter()
        .any(|r| primary_roots.iter().any(|p| roots_overlap(r, p)))
}

/// Full build: primary instance plus any overlapping peer.
pub async fn build_file_map(
    primary_id: &str,
    primary: &dyn ClientAdapter,
    peers: &[PeerInstance],
    memo: &SettledMemo,
    settling_config: SettlingConfig,
    cancel: &CancellationToken,
) -> Result<FileMap> {
    let primary_map = tokio::time::timeout(
        PRIMARY_BUILD_TIMEOUT,
        build_single_instance_map(primary_id, primary, memo, settling_config, cancel),
    )
    .await
    .map_err(|_| ScanError::TimedOut(PRIMARY_BUILD_TIMEOUT))??;

    let pathset = primary_map.pathset;
    let mut scan_roots: HashSet<PathBuf> = primary_map.scan_roots.iter().cloned().collect();

    for peer in peers {
        if peer.id == primary_id || !peer.local_fs_access {
            continue;
        }

        let primary_roots: Vec<PathBuf> = scan_roots.iter().cloned().collect();

        let quick_roots = match tokio::time::timeout(
            QUICK_DISCOVERY_TIMEOUT,
            quick_scan_roots(&*peer.client),
        )
        .await
        {
            Ok(Ok(roots)) => roots,
            _ => peer
                .last_known_scan_roots
                .iter()
                .cloned()
                .map(|p| normalize(&p))
                .collect(),
        };

        if any_overlap(&quick_roots, &primary_roots) {
            let built = tokio::time::timeout(
                OVERLAPPING_BUILD_TIMEOUT,
                build_single_instance_map(&peer.id, &*peer.client, memo, settling_config, cancel),
            )
            .await
            .map_err(|_| ScanError::OverlappingInstanceUnreachable {
                instance: peer.id.clone(),
                source: anyhow::anyhow!("timed out after {:?}", OVERLAPPING_BUILD_TIMEOUT),
            })?
            .map_err(|e| ScanError::OverlappingInstanceUnreachable {
                instance: peer.id.clone(),
                source: anyhow::anyhow!(e),
            })?;

            pathset.merge_from(&built.pathset);
            scan_roots.extend(built.scan_roots);
            continue;
        }

        // Quick discovery found no overlap; run one fully-settled
        // confirmation build before concluding this peer is irrelevant.
        let confirm = tokio::time::timeout(
            CONFIRMATION_BUILD_TIMEOUT,
            build_single_instance_map(&peer.id, &*peer.client, memo, settling_config, cancel),
        )
        .await;

        if let Ok(Ok(confirmed)) = confirm {
            if any_overlap(
                &confirmed.scan_roots.iter().cloned().collect(),
                &primary_roots,
            ) {
                pathset.merge_from(&confirmed.pathset);
                scan_roots.extend(confirmed.scan_roots);
            }
        }
        // Confirmation failure or no-overlap confirmation: peer is ignored.
    }

    Ok(FileMap {
        pathset,
        scan_roots: scan_roots.into_iter().collect(),
        torrent_count: primary_map.torrent_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fixture::FixtureClient;
    use crate::client::{Torrent, TorrentFile, TorrentState};

    fn client_with(save_path: &str, files: Vec<(&str, u64)>) -> FixtureClient {
        let client = FixtureClient::new();
        client.add_torrent(
            Torrent {
                hash: "ABCDEF".to_string(),
                save_path: PathBuf::from(save_path),
                state: TorrentState::Seeding,
            },
            files
                .into_iter()
                .map(|(name, size)| TorrentFile {
                    name: PathBuf::from(name),
                    size,
                })
                .collect(),
        );
        client
    }

    #[tokio::test]
    async fn single_instance_populates_pathset_from_save_path_and_files() {
        let client = client_with("/data", vec![("movie.mkv", 10)]);
        let memo = SettledMemo::new();
        let cancel = CancellationToken::new();
        let map = build_single_instance_map(
            "inst",
            &client,
            &memo,
            SettlingConfig {
                samples: 1,
                interval: Duration::from_millis(1),
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap();

        assert!(map.pathset.has(&PathBuf::from("/data/movie.mkv")));
        assert_eq!(map.scan_roots, vec![PathBuf::from("/data")]);
    }

    #[tokio::test]
    async fn torrent_with_relative_save_path_does_not_fail_the_build() {
        let client = FixtureClient::new();
        client.add_torrent(
            Torrent {
                hash: "ABS".to_string(),
                save_path: PathBuf::from("/data"),
                state: TorrentState::Seeding,
            },
            vec![TorrentFile {
                name: PathBuf::from("movie.mkv"),
                size: 10,
            }],
        );
        client.add_torrent(
            Torrent {
                hash: "REL".to_string(),
                save_path: PathBuf::from("relative/path"),
                state: TorrentState::Seeding,
            },
            vec![],
        );

        let memo = SettledMemo::new();
        let cancel = CancellationToken::new();
        let map = build_single_instance_map(
            "inst",
            &client,
            &memo,
            SettlingConfig {
                samples: 1,
                interval: Duration::from_millis(1),
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap();

        assert!(map.pathset.has(&PathBuf::from("/data/movie.mkv")));
        assert_eq!(map.scan_roots, vec![PathBuf::from("/data")]);
    }

    #[tokio::test]
    async fn overlapping_peer_is_merged_into_primary_pathset() {
        let primary = client_with("/r", vec![("one.mkv", 1)]);
        let peer_client: Arc<dyn ClientAdapter> = Arc::new(client_with("/r", vec![("two.mkv", 2)]));

        let peers = vec![PeerInstance {
            id: "peer".to_string(),
            client: peer_client,
            local_fs_access: true,
            last_known_scan_roots: vec![],
        }];

        let memo = SettledMemo::new();
        let cancel = CancellationToken::new();
        let config = SettlingConfig {
            samples: 1,
            interval: Duration::from_millis(1),
            ..Default::default()
        };

        let map = build_file_map("primary", &primary, &peers, &memo, config, &cancel)
            .await
            .unwrap();

        assert!(map.pathset.has(&PathBuf::from("/r/one.mkv")));
        assert!(map.pathset.has(&PathBuf::from("/r/two.mkv")));
    }

    #[tokio::test]
    async fn non_overlapping_peer_is_ignored() {
        let primary = client_with("/rA", vec![("one.mkv", 1)]);
        let peer_client: Arc<dyn ClientAdapter> = Arc::new(client_with("/rB", vec![("two.mkv", 2)]));

        let peers = vec![PeerInstance {
            id: "peer".to_string(),
            client: peer_client,
            local_fs_access: true,
            last_known_scan_roots: vec![],
        }];

        let memo = SettledMemo::new();
        let cancel = CancellationToken::new();
        let config = SettlingConfig {
            samples: 1,
            interval: Duration::from_millis(1),
            ..Default::default()
        };

        let map = build_file_map("primary", &primary, &peers, &memo, config, &cancel)
            .await
            .unwrap();

        assert!(map.pathset.has(&PathBuf::from("/rA/one.mkv")));
        assert!(!map.pathset.has(&PathBuf::from("/rB/two.mkv")));
    }

    #[tokio::test]
    async fn instance_without_local_fs_access_is_skipped() {
        let primary = client_with("/r", vec![("one.mkv", 1)]);
        let peer_client: Arc<dyn ClientAdapter> = Arc::new(client_with("/r", vec![("two.mkv", 2)]));

        let peers = vec![PeerInstance {
            id: "peer".to_string(),
            client: peer_client,
            local_fs_access: false,
            last_known_scan_roots: vec![],
        }];

        let memo = SettledMemo::new();
        let cancel = CancellationToken::new();
        let config = SettlingConfig {
            samples: 1,
            interval: Duration::from_millis(1),
            ..Default::default()
        };

        let map = build_file_map("primary", &primary, &peers, &memo, config, &cancel)
            .await
            .unwrap();

        assert!(!map.pathset.has(&PathBuf::from("/r/two.mkv")));
    }
}
