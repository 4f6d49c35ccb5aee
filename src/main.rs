//! Viewgate sidecar entry point
//!
//! Wires the view store, snapshot publisher, discovery server,
//! authorization gate, and admin API together, then runs until SIGTERM.

use std::sync::Arc;

use envoy_types::pb::envoy::service::auth::v3::authorization_server::AuthorizationServer;
use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::ClusterDiscoveryServiceServer;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer;
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryServiceServer;
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::ListenerDiscoveryServiceServer;
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::RouteDiscoveryServiceServer;
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use viewgate::api::{self, ApiState};
use viewgate::extauthz::AuthGate;
use viewgate::workload::Orchestrator;
use viewgate::xds::DiscoveryServer;
use viewgate::{Config, SnapshotManager, ViewStore, WorkloadClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,viewgate=debug,kube=info,tower=warn,hyper=warn"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(base_hostname = %config.base_hostname, namespace = %config.namespace, "starting viewgate");

    let client = Client::try_default().await?;
    let workloads = Arc::new(WorkloadClient::new(client.clone(), &config));
    let orchestrator: Arc<dyn Orchestrator> = workloads.clone();

    let (store, mut changes) = ViewStore::new(client, &config.namespace);

    // Publish version 1 before any xDS client can connect, then rebuild on
    // every store change in notification order.
    let snapshots = Arc::new(SnapshotManager::new(&config.base_hostname, Arc::clone(&store)));
    snapshots.initialize()?;
    {
        let snapshots = Arc::clone(&snapshots);
        tokio::spawn(async move {
            while changes.recv().await.is_some() {
                if let Err(e) = snapshots.rebuild() {
                    error!(error = %e, "failed to rebuild xDS snapshot");
                }
            }
        });
    }

    let shutdown = CancellationToken::new();

    // Blocks until both watch caches have completed their initial list.
    store.start(shutdown.clone()).await?;

    let api_state = ApiState {
        store: Arc::clone(&store),
        orchestrator: Arc::clone(&orchestrator),
    };
    let api_addr = config.api_addr;
    let listener = tokio::net::TcpListener::bind(api_addr).await?;
    let http_shutdown = shutdown.clone();
    let http_task = tokio::spawn(async move {
        info!(addr = %api_addr, "admin API listening");
        axum::serve(listener, api::router(api_state))
            .with_graceful_shutdown(http_shutdown.cancelled_owned())
            .await
    });

    let discovery = DiscoveryServer::new(snapshots.cache());
    let gate = AuthGate::new(
        Arc::clone(&store),
        orchestrator,
        &config.base_hostname,
        shutdown.clone(),
    );
    let grpc_addr = config.grpc_addr;
    let grpc_shutdown = shutdown.clone();
    let grpc_task = tokio::spawn(async move {
        info!(addr = %grpc_addr, "xDS + ext_authz server listening");
        tonic::transport::Server::builder()
            .add_service(AggregatedDiscoveryServiceServer::new(discovery.clone()))
            .add_service(ListenerDiscoveryServiceServer::new(discovery.clone()))
            .add_service(RouteDiscoveryServiceServer::new(discovery.clone()))
            .add_service(ClusterDiscoveryServiceServer::new(discovery.clone()))
            .add_service(EndpointDiscoveryServiceServer::new(discovery))
            .add_service(AuthorizationServer::new(gate))
            .serve_with_shutdown(grpc_addr, grpc_shutdown.cancelled_owned())
            .await
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    info!("shutting down");
    shutdown.cancel();

    http_task.await??;
    grpc_task.await??;
    Ok(())
}
