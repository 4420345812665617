//! Orphan file scanning for torrent save directories: finds files/directories
//! under configured scan roots that no managed torrent (on this or an
//! overlapping client instance) references, previews them, and deletes them
//! only after a race-closing re-check against a fresh torrent snapshot.

pub mod client;
pub mod config;
pub mod error;
pub mod filemap;
pub mod ignore;
pub mod model;
pub mod normalize;
pub mod notifier;
pub mod orchestrator;
pub mod pathset;
pub mod readiness;
pub mod safe_delete;
pub mod scheduler;
pub mod store;
pub mod walker;

pub use error::{Result, ScanError};
