//! Sidecar configuration
//!
//! Runtime settings come from the environment; everything that is part of
//! the wire contract with the edge proxy's bootstrap config is a constant.

use std::net::SocketAddr;

use crate::error::{Error, Result};

/// Namespace all view objects live in unless overridden
pub const DEFAULT_NAMESPACE: &str = "ui";

/// Name prefix for view Services, Jobs, and xDS resources
pub const VIEW_NAME_PREFIX: &str = "view-";

/// Application marker label value (`app=<this>`)
pub const LABEL_APP: &str = "viewgate";

/// Label carrying the view name on Services, Jobs, and pods
pub const LABEL_VIEW_NAME: &str = "viewgate.dev/view-name";

/// Annotation carrying the subset cluster
pub const ANNO_CLUSTER: &str = "viewgate.dev/cluster";

/// Annotation carrying the subset namespace
pub const ANNO_NAMESPACE: &str = "viewgate.dev/namespace";

/// xDS node identity the edge proxy fetches configuration under
pub const NODE_ID: &str = "gateway";

/// Port the per-view workload serves HTTP on
pub const WORKLOAD_PORT: u16 = 8080;

/// Sidecar configuration, resolved once at startup
#[derive(Debug, Clone)]
pub struct Config {
    /// Base hostname used to derive view names from request hosts
    pub base_hostname: String,
    /// Namespace for view Services and Jobs
    pub namespace: String,
    /// Image for the view's application container
    pub workload_image: String,
    /// Image for the per-view envoy sidecar container
    pub proxy_image: String,
    /// Admin HTTP listen address
    pub api_addr: SocketAddr,
    /// xDS + ext_authz gRPC listen address
    pub grpc_addr: SocketAddr,
}

impl Config {
    /// Load configuration from the environment
    ///
    /// `GATEWAY_HOSTNAME` is required; everything else has defaults that
    /// match the gateway deployment manifests.
    pub fn from_env() -> Result<Self> {
        let base_hostname = std::env::var("GATEWAY_HOSTNAME")
            .map_err(|_| Error::config("GATEWAY_HOSTNAME must be set"))?;
        if base_hostname.is_empty() {
            return Err(Error::config("GATEWAY_HOSTNAME must not be empty"));
        }

        Ok(Self {
            base_hostname,
            namespace: env_or("VIEW_NAMESPACE", DEFAULT_NAMESPACE),
            workload_image: env_or("WORKLOAD_IMAGE", "viewgate/view-backend:latest"),
            proxy_image: env_or("PROXY_IMAGE", "envoyproxy/envoy:distroless-v1.33-latest"),
            api_addr: "0.0.0.0:18080".parse().map_err(|e| Error::config(format!("api addr: {e}")))?,
            grpc_addr: "0.0.0.0:18000".parse().map_err(|e| Error::config(format!("grpc addr: {e}")))?,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Kubernetes object name for a view (`view-<name>`)
pub fn view_object_name(view: &str) -> String {
    format!("{VIEW_NAME_PREFIX}{view}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_object_name_prefixes() {
        assert_eq!(view_object_name("test01"), "view-test01");
    }
}
