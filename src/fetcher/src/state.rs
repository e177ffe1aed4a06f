//! Persisted per-node fetch state. Written only after a cycle fully
//! succeeds; a failed cycle leaves the previous state untouched.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetcherState {
    /// Timestamp of the last manifest this node accepted; any manifest
    /// older than this is a replay and is rejected.
    pub last_verified_timestamp: u64,
    /// Image the "current" pointer names, if one has been published.
    pub current_image: Option<u64>,
}

impl FetcherState {
    /// Missing state means a fresh node; an unreadable file is treated the
    /// same, with a warning, rather than wedging the fetch loop.
    pub fn load(path: &Path) -> Self {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!("Cannot read fetcher state {}: {}", path.display(), e);
                return Self::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(e) => {
                warn!("Discarding corrupt fetcher state {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        manifest::util::write_atomic(path, serde_json::to_string(self)?.as_bytes())?;
        Ok(())
    }
}
