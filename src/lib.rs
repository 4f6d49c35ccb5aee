//! Viewgate: a per-gateway control-plane sidecar for scale-to-zero view
//! backends.
//!
//! The sidecar watches the cluster for view Services and their
//! EndpointSlices, projects that inventory into Envoy xDS snapshots, and
//! answers the proxy's ext_authz checks so that requests for cold views are
//! held while the backing workload starts.
//!
//! ```text
//! watch events ──▶ ViewStore ──notify──▶ SnapshotManager ──▶ xDS streams
//!                      ▲                                        │
//!                      │ poll                                   ▼
//! ext_authz Check ─────┴──── create Job                       Envoy
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod extauthz;
pub mod store;
pub mod view;
pub mod workload;
pub mod xds;

pub use config::Config;
pub use error::{Error, Result};
pub use store::ViewStore;
pub use workload::WorkloadClient;
pub use xds::SnapshotManager;
