//! View data model
//!
//! A view is a named, externally declared routing target. The admin API
//! declares views; the store tracks their live state as observed from the
//! cluster.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z][a-z0-9-]*[a-z0-9]$").unwrap());

/// Routing descriptor for a view's backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subset {
    /// Backend cluster to launch the view against
    pub cluster: String,
    /// Optional backend namespace within the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Admin request body declaring a view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewSpec {
    /// View name (3-8 chars, `^[a-z][a-z0-9-]*[a-z0-9]$`)
    pub name: String,
    /// Backend subset
    pub subset: Subset,
}

/// Admin response element: a view plus its computed readiness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct View {
    /// View name
    pub name: String,
    /// Backend subset
    pub subset: Subset,
    /// True iff at least one endpoint is ready
    pub ready: bool,
}

/// One reachable address for a view's backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEndpoint {
    /// IP or hostname
    pub address: String,
    /// Target port
    pub port: u16,
    /// Serving condition of the endpoint
    pub ready: bool,
}

/// Live state of a view as observed from the cluster
#[derive(Debug, Clone, Default)]
pub struct ViewState {
    /// View name
    pub name: String,
    /// Current subset, copied from service annotations
    pub subset: Subset,
    /// All observed endpoints, ready or not
    pub endpoints: Vec<ViewEndpoint>,
}

impl ViewState {
    /// Endpoints whose serving condition is true
    pub fn ready_endpoints(&self) -> Vec<ViewEndpoint> {
        self.endpoints.iter().filter(|ep| ep.ready).cloned().collect()
    }
}

/// Validate an admin view declaration
pub fn validate_spec(spec: &ViewSpec) -> Result<()> {
    if spec.name.len() < 3 || spec.name.len() > 8 {
        return Err(Error::validation(format!(
            "name must be 3-8 characters, got {}",
            spec.name.len()
        )));
    }
    if !NAME_RE.is_match(&spec.name) {
        return Err(Error::validation(format!(
            "name must match {}",
            NAME_RE.as_str()
        )));
    }
    if spec.subset.cluster.is_empty() {
        return Err(Error::validation("subset.cluster is required"));
    }
    Ok(())
}
