//! The torrent-client adapter contract. A concrete adapter for any
//! particular torrent client (qBittorrent, Transmission, …) is an external
//! collaborator and out of scope for this crate; only the trait boundary and
//! a minimal in-memory fixture (used by tests and the CLI demo mode) live
//! here.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    Downloading,
    Seeding,
    Checking,
    Allocating,
    FetchingMetadata,
    Paused,
    Error,
}

impl TorrentState {
    pub fn is_busy(self) -> bool {
        matches!(self, TorrentState::Checking | TorrentState::Allocating)
    }

    pub fn is_fetching_metadata(self) -> bool {
        matches!(self, TorrentState::FetchingMetadata)
    }
}

#[derive(Debug, Clone)]
pub struct Torrent {
    pub hash: String,
    pub save_path: PathBuf,
    pub state: TorrentState,
}

#[derive(Debug, Clone)]
pub struct TorrentFile {
    pub name: PathBuf,
    pub size: u64,
}

/// The subset of a torrent-client's control API the scanner depends on.
/// Implementations are expected to be cheap to clone/share (`Arc`-wrapped)
/// since the orchestrator may hold one per configured instance.
#[async_trait::async_trait]
pub trait ClientAdapter: Send + Sync {
    fn is_healthy(&self) -> bool;

    /// `None` if the client has never recovered from an outage.
    fn last_recovery_time(&self) -> Option<DateTime<Utc>>;

    /// `None` if the client has never completed a sync.
    fn last_sync_time(&self) -> Option<DateTime<Utc>>;

    async fn list_torrents(&self) -> anyhow::Result<Vec<Torrent>>;

    /// `force_refresh` asks the client to bypass any internal cache; the
    /// scanner always passes `true` per the external interface contract.
    async fn list_files_for_hashes(
        &self,
        hashes: &[String],
        force_refresh: bool,
    ) -> anyhow::Result<HashMap<String, Vec<TorrentFile>>>;
}

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixture {
    use super::*;
    use std::sync::RwLock;

    /// A fully in-memory [`ClientAdapter`] for tests and CLI demo mode.
    pub struct FixtureClient {
        healthy: RwLock<bool>,
        last_recovery: RwLock<Option<DateTime<Utc>>>,
        last_sync: RwLock<Option<DateTime<Utc>>>,
        torrents: RwLock<Vec<Torrent>>,
        files: RwLock<HashMap<String, Vec<TorrentFile>>>,
    }

    impl FixtureClient {
        pub fn new() -> Self {
            Self {
                healthy: RwLock::new(true),
                last_recovery: RwLock::new(None),
                last_sync: RwLock::new(Some(Utc::now())),
                torrents: RwLock::new(Vec::new()),
                files: RwLock::new(HashMap::new()),
            }
        }

        pub fn set_healthy(&self, healthy: bool) {
            *self.healthy.write().unwrap() = healthy;
        }

        pub fn set_last_sync_time(&self, at: Option<DateTime<Utc>>) {
            *self.last_sync.write().unwrap() = at;
        }

        pub fn set_last_recovery_time(&self, at: Option<DateTime<Utc>>) {
            *self.last_recovery.write().unwrap() = at;
        }

        pub fn add_torrent(&self, torrent: Torrent, files: Vec<TorrentFile>) {
            let hash = torrent.hash.clone();
            self.torrents.write().unwrap().push(torrent);
            self.files.write().unwrap().insert(hash, files);
        }
    }

    impl Default for FixtureClient {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait::async_trait]
    impl ClientAdapter for FixtureClient {
        fn is_healthy(&self) -> bool {
            *self.healthy.read().unwrap()
        }

        fn last_recovery_time(&self) -> Option<DateTime<Utc>> {
            *self.last_recovery.read().unwrap()
        }

        fn last_sync_time(&self) -> Option<DateTime<Utc>> {
            *self.last_sync.read().unwrap()
        }

        async fn list_torrents(&self) -> anyhow::Result<Vec<Torrent>> {
            Ok(self.torrents.read().unwrap().clone())
        }

        async fn list_files_for_hashes(
            &self,
            hashes: &[String],
            _force_refresh: bool,
        ) -> anyhow::Result<HashMap<String, Vec<TorrentFile>>> {
            let files = self.files.read().unwrap();
            Ok(hashes
                .iter()
                .filter_map(|h| files.get(h).map(|f| (h.clone(), f.clone())))
                .collect())
        }
    }
}
