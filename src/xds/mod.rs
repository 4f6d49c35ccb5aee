//! xDS control plane: snapshot building, caching, and discovery serving
//!
//! The `SnapshotManager` is the publisher: it owns the version counter and
//! serializes rebuilds so the cache only ever holds internally consistent,
//! monotonically versioned snapshots for the `gateway` node.

pub mod builder;
pub mod cache;
pub mod server;

use std::sync::{Arc, Mutex};

use tracing::info;

use crate::config::NODE_ID;
use crate::error::Result;
use crate::store::ViewStore;

pub use cache::{Snapshot, SnapshotCache};
pub use server::DiscoveryServer;

/// Owns the live snapshot and the version counter
pub struct SnapshotManager {
    version: Mutex<u64>,
    cache: Arc<SnapshotCache>,
    store: Arc<ViewStore>,
    base_hostname: String,
}

impl SnapshotManager {
    /// Create a manager over a fresh cache
    pub fn new(base_hostname: impl Into<String>, store: Arc<ViewStore>) -> Self {
        Self {
            version: Mutex::new(0),
            cache: Arc::new(SnapshotCache::new()),
            store,
            base_hostname: base_hostname.into(),
        }
    }

    /// The cache the discovery server serves from
    pub fn cache(&self) -> Arc<SnapshotCache> {
        Arc::clone(&self.cache)
    }

    /// Build and publish version 1 from the current store contents
    ///
    /// Called once before any xDS client may connect.
    pub fn initialize(&self) -> Result<()> {
        self.rebuild()
    }

    /// Rebuild and atomically install a new snapshot
    ///
    /// The lock is held across the full rebuild so concurrent rebuilds
    /// serialize and versions stay monotonic. The counter is not rolled
    /// back on failure; the previous snapshot stays live.
    pub fn rebuild(&self) -> Result<()> {
        let mut version = self.version.lock().unwrap_or_else(|e| e.into_inner());
        *version += 1;

        let views = self.store.list_views();
        let snapshot = builder::build_snapshot(*version, &views, &self.base_hostname)?;
        self.cache.set(NODE_ID, snapshot);

        info!(version = *version, views = views.len(), "pushed xDS snapshot");
        Ok(())
    }
}
