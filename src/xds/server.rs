//! State-of-the-world discovery streams
//!
//! Serves the aggregated discovery service plus the four type-specific
//! services over the shared snapshot cache. Every stream follows the same
//! loop: answer requests against the current snapshot, push again when the
//! cache installs a new version, skip types the client has already acked.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::ClusterDiscoveryService;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryService;
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryService;
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::ListenerDiscoveryService;
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::RouteDiscoveryService;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, trace, warn};

use crate::xds::cache::{
    Snapshot, SnapshotCache, TYPE_CLUSTER, TYPE_ENDPOINT, TYPE_LISTENER, TYPE_ROUTE,
};

/// Push order on snapshot change; clusters and endpoints go out before the
/// resources that reference them
const PUSH_ORDER: [&str; 4] = [TYPE_CLUSTER, TYPE_ENDPOINT, TYPE_LISTENER, TYPE_ROUTE];

type SotwStream = Pin<Box<dyn Stream<Item = std::result::Result<DiscoveryResponse, Status>> + Send>>;

/// gRPC front-end over the snapshot cache
#[derive(Clone)]
pub struct DiscoveryServer {
    cache: Arc<SnapshotCache>,
}

impl DiscoveryServer {
    /// Create a server over a cache
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self { cache }
    }

    fn open_stream(
        &self,
        inbound: Streaming<DiscoveryRequest>,
        default_type: Option<&'static str>,
    ) -> Response<SotwStream> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run_stream(Arc::clone(&self.cache), inbound, tx, default_type));
        Response::new(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Per-type subscription state within one stream
#[derive(Debug, Default)]
struct TypeState {
    sent_version: Option<String>,
    names: Vec<String>,
}

async fn run_stream(
    cache: Arc<SnapshotCache>,
    mut inbound: Streaming<DiscoveryRequest>,
    tx: mpsc::Sender<std::result::Result<DiscoveryResponse, Status>>,
    default_type: Option<&'static str>,
) {
    let mut node_id: Option<String> = None;
    let mut states: HashMap<String, TypeState> = HashMap::new();
    let mut updates = cache.subscribe();
    let mut nonce = 0u64;

    loop {
        tokio::select! {
            request = inbound.message() => {
                let request = match request {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "discovery stream closed");
                        break;
                    }
                };

                let type_url = if request.type_url.is_empty() {
                    match default_type {
                        Some(t) => t.to_string(),
                        None => continue,
                    }
                } else {
                    request.type_url.clone()
                };

                if let Some(node) = &request.node {
                    if !node.id.is_empty() {
                        node_id = Some(node.id.clone());
                    }
                }

                let state = states.entry(type_url.clone()).or_default();
                let names_changed = state.names != request.resource_names;
                state.names = request.resource_names.clone();

                if let Some(detail) = &request.error_detail {
                    warn!(
                        type_url = %type_url,
                        version = %request.version_info,
                        error = %detail.message,
                        "client rejected configuration"
                    );
                    continue;
                }

                let Some(snapshot) = node_id.as_deref().and_then(|n| cache.get(n)) else {
                    trace!(type_url = %type_url, "no snapshot for node yet");
                    continue;
                };

                if !should_respond(state, snapshot.version(), &request.version_info, names_changed) {
                    trace!(type_url = %type_url, version = %request.version_info, "ack");
                    continue;
                }

                nonce += 1;
                let response = build_response(&snapshot, &state.names, &type_url, nonce);
                state.sent_version = Some(snapshot.version().to_string());
                if tx.send(Ok(response)).await.is_err() {
                    break;
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(snapshot) = node_id.as_deref().and_then(|n| cache.get(n)) else {
                    continue;
                };
                let mut closed = false;
                for type_url in ordered_types(&states) {
                    let Some(state) = states.get_mut(&type_url) else {
                        continue;
                    };
                    if state.sent_version.as_deref() == Some(snapshot.version()) {
                        continue;
                    }
                    nonce += 1;
                    let response = build_response(&snapshot, &state.names, &type_url, nonce);
                    state.sent_version = Some(snapshot.version().to_string());
                    if tx.send(Ok(response)).await.is_err() {
                        closed = true;
                        break;
                    }
                }
                if closed {
                    break;
                }
            }
        }
    }
}

/// Subscribed type URLs in the canonical push order
fn ordered_types(states: &HashMap<String, TypeState>) -> Vec<String> {
    let mut ordered: Vec<String> = PUSH_ORDER
        .iter()
        .filter(|t| states.contains_key(**t))
        .map(|t| t.to_string())
        .collect();
    for type_url in states.keys() {
        if !PUSH_ORDER.contains(&type_url.as_str()) {
            ordered.push(type_url.clone());
        }
    }
    ordered
}

/// A type is re-sent when the client is behind the snapshot version or its
/// subscription set changed; matching acks are absorbed.
fn should_respond(
    state: &TypeState,
    snapshot_version: &str,
    acked_version: &str,
    names_changed: bool,
) -> bool {
    if names_changed {
        return true;
    }
    !(state.sent_version.as_deref() == Some(snapshot_version) && acked_version == snapshot_version)
}

/// Assemble a SotW response, honoring a non-wildcard subscription
fn build_response(
    snapshot: &Snapshot,
    names: &[String],
    type_url: &str,
    nonce: u64,
) -> DiscoveryResponse {
    let resources = snapshot
        .resources_of(type_url)
        .iter()
        .filter(|r| names.is_empty() || names.iter().any(|n| n == &r.name))
        .map(|r| r.resource.clone())
        .collect();

    DiscoveryResponse {
        version_info: snapshot.version().to_string(),
        resources,
        type_url: type_url.to_string(),
        nonce: format!("{nonce:08x}"),
        ..Default::default()
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for DiscoveryServer {
    type StreamAggregatedResourcesStream = SotwStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        Ok(self.open_stream(request.into_inner(), None))
    }

    type DeltaAggregatedResourcesStream =
        Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("delta xDS is not supported"))
    }
}

#[tonic::async_trait]
impl ListenerDiscoveryService for DiscoveryServer {
    type StreamListenersStream = SotwStream;

    async fn stream_listeners(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamListenersStream>, Status> {
        Ok(self.open_stream(request.into_inner(), Some(TYPE_LISTENER)))
    }

    type DeltaListenersStream =
        Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

    async fn delta_listeners(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaListenersStream>, Status> {
        Err(Status::unimplemented("delta xDS is not supported"))
    }

    async fn fetch_listeners(
        &self,
        _request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        Err(Status::unimplemented("fetch is not supported"))
    }
}

#[tonic::async_trait]
impl RouteDiscoveryService for DiscoveryServer {
    type StreamRoutesStream = SotwStream;

    async fn stream_routes(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamRoutesStream>, Status> {
        Ok(self.open_stream(request.into_inner(), Some(TYPE_ROUTE)))
    }

    type DeltaRoutesStream =
        Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

    async fn delta_routes(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaRoutesStream>, Status> {
        Err(Status::unimplemented("delta xDS is not supported"))
    }

    async fn fetch_routes(
        &self,
        _request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        Err(Status::unimplemented("fetch is not supported"))
    }
}

#[tonic::async_trait]
impl ClusterDiscoveryService for DiscoveryServer {
    type StreamClustersStream = SotwStream;

    async fn stream_clusters(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamClustersStream>, Status> {
        Ok(self.open_stream(request.into_inner(), Some(TYPE_CLUSTER)))
    }

    type DeltaClustersStream =
        Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

    async fn delta_clusters(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaClustersStream>, Status> {
        Err(Status::unimplemented("delta xDS is not supported"))
    }

    async fn fetch_clusters(
        &self,
        _request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        Err(Status::unimplemented("fetch is not supported"))
    }
}

#[tonic::async_trait]
impl EndpointDiscoveryService for DiscoveryServer {
    type StreamEndpointsStream = SotwStream;

    async fn stream_endpoints(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamEndpointsStream>, Status> {
        Ok(self.open_stream(request.into_inner(), Some(TYPE_ENDPOINT)))
    }

    type DeltaEndpointsStream =
        Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

    async fn delta_endpoints(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaEndpointsStream>, Status> {
        Err(Status::unimplemented("delta xDS is not supported"))
    }

    async fn fetch_endpoints(
        &self,
        _request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        Err(Status::unimplemented("fetch is not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::cache::NamedResource;

    fn snapshot_with_clusters(version: &str, names: &[&str]) -> Snapshot {
        let mut snapshot = Snapshot::new(version);
        snapshot.set_resources(
            TYPE_CLUSTER,
            names
                .iter()
                .map(|name| NamedResource {
                    name: name.to_string(),
                    resource: envoy_types::pb::google::protobuf::Any {
                        type_url: TYPE_CLUSTER.to_string(),
                        value: vec![],
                    },
                })
                .collect(),
        );
        snapshot
    }

    #[test]
    fn first_request_gets_response() {
        let state = TypeState::default();
        assert!(should_respond(&state, "1", "", false));
    }

    #[test]
    fn matching_ack_is_absorbed() {
        let state = TypeState {
            sent_version: Some("2".to_string()),
            names: vec![],
        };
        assert!(!should_respond(&state, "2", "2", false));
    }

    #[test]
    fn stale_client_version_triggers_resend() {
        let state = TypeState {
            sent_version: Some("2".to_string()),
            names: vec![],
        };
        // Cache moved to 3 since our last send.
        assert!(should_respond(&state, "3", "2", false));
    }

    #[test]
    fn subscription_change_triggers_resend() {
        let state = TypeState {
            sent_version: Some("2".to_string()),
            names: vec!["view-abc".to_string()],
        };
        assert!(should_respond(&state, "2", "2", true));
    }

    #[test]
    fn wildcard_response_carries_all_resources() {
        let snapshot = snapshot_with_clusters("4", &["sidecar_api", "view-abc"]);
        let response = build_response(&snapshot, &[], TYPE_CLUSTER, 1);

        assert_eq!(response.version_info, "4");
        assert_eq!(response.type_url, TYPE_CLUSTER);
        assert_eq!(response.resources.len(), 2);
        assert!(!response.nonce.is_empty());
    }

    #[test]
    fn named_subscription_filters_resources() {
        let snapshot = snapshot_with_clusters("4", &["sidecar_api", "view-abc", "view-xyz"]);
        let names = vec!["view-xyz".to_string(), "view-missing".to_string()];
        let response = build_response(&snapshot, &names, TYPE_CLUSTER, 2);

        assert_eq!(response.resources.len(), 1);
    }

    #[test]
    fn nonces_differ_between_responses() {
        let snapshot = snapshot_with_clusters("1", &[]);
        let a = build_response(&snapshot, &[], TYPE_CLUSTER, 1);
        let b = build_response(&snapshot, &[], TYPE_CLUSTER, 2);
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn push_order_references_before_referrers() {
        let mut states = HashMap::new();
        states.insert(TYPE_ROUTE.to_string(), TypeState::default());
        states.insert(TYPE_CLUSTER.to_string(), TypeState::default());
        states.insert(TYPE_LISTENER.to_string(), TypeState::default());

        let ordered = ordered_types(&states);
        assert_eq!(ordered, vec![TYPE_CLUSTER, TYPE_LISTENER, TYPE_ROUTE]);
    }
}
