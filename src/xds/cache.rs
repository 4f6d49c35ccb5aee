//! Versioned snapshot storage for the discovery server
//!
//! A snapshot is an immutable, consistent bundle of encoded xDS resources
//! for one node identity. The cache holds the live snapshot per node and
//! wakes subscribed discovery streams whenever one is replaced.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;

/// Type URL for Listener resources (LDS)
pub const TYPE_LISTENER: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";

/// Type URL for RouteConfiguration resources (RDS)
pub const TYPE_ROUTE: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";

/// Type URL for Cluster resources (CDS)
pub const TYPE_CLUSTER: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

/// Type URL for ClusterLoadAssignment resources (EDS)
pub const TYPE_ENDPOINT: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

/// An encoded xDS resource together with its name
#[derive(Debug, Clone)]
pub struct NamedResource {
    /// Resource name (cluster name, listener name, ...)
    pub name: String,
    /// Encoded resource payload
    pub resource: envoy_types::pb::google::protobuf::Any,
}

/// Immutable bundle of resources for one configuration version
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    version: String,
    resources: HashMap<String, Vec<NamedResource>>,
}

impl Snapshot {
    /// Create an empty snapshot at a version
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            resources: HashMap::new(),
        }
    }

    /// Version string stamped on every response built from this snapshot
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Install the resource list for a type
    pub fn set_resources(&mut self, type_url: &str, resources: Vec<NamedResource>) {
        self.resources.insert(type_url.to_string(), resources);
    }

    /// Resources of a type; empty for unknown types
    pub fn resources_of(&self, type_url: &str) -> &[NamedResource] {
        self.resources.get(type_url).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Names of resources of a type
    pub fn names_of(&self, type_url: &str) -> Vec<&str> {
        self.resources_of(type_url)
            .iter()
            .map(|r| r.name.as_str())
            .collect()
    }
}

/// Node-keyed snapshot cache with change broadcast
pub struct SnapshotCache {
    snapshots: RwLock<HashMap<String, Arc<Snapshot>>>,
    epoch: watch::Sender<u64>,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    /// Create an empty cache
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            snapshots: RwLock::new(HashMap::new()),
            epoch,
        }
    }

    /// Current snapshot for a node
    pub fn get(&self, node: &str) -> Option<Arc<Snapshot>> {
        let snapshots = self.snapshots.read().unwrap_or_else(|e| e.into_inner());
        snapshots.get(node).cloned()
    }

    /// Atomically replace a node's snapshot and wake all streams
    pub fn set(&self, node: &str, snapshot: Snapshot) {
        {
            let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
            snapshots.insert(node.to_string(), Arc::new(snapshot));
        }
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Subscribe to snapshot replacements
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }
}
