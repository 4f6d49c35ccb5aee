//! Envoy ext_authz gate for view requests
//!
//! Every request entering the gateway listener passes through here. Hosts
//! that resolve to a warm view are allowed straight through; hosts that
//! resolve to a cold view trigger workload creation and are held until the
//! view's endpoints turn ready, the deadline passes, or the caller goes
//! away.

use std::sync::Arc;
use std::time::Duration;

use envoy_types::pb::envoy::r#type::v3::{HttpStatus, StatusCode};
use envoy_types::pb::envoy::service::auth::v3::authorization_server::Authorization;
use envoy_types::pb::envoy::service::auth::v3::{
    check_response, CheckRequest, CheckResponse, DeniedHttpResponse,
};
use envoy_types::pb::google::rpc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Request, Response, Status};
use tracing::{error, info, warn};

use crate::store::ViewStore;
use crate::view::Subset;
use crate::workload::Orchestrator;

/// How often the gate re-checks the store during a cold start
const COLD_START_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Hard deadline for a cold start before the request is refused
const COLD_START_TIMEOUT: Duration = Duration::from_secs(60);

/// ext_authz service holding requests for cold views
pub struct AuthGate {
    store: Arc<ViewStore>,
    orchestrator: Arc<dyn Orchestrator>,
    base_hostname: String,
    shutdown: CancellationToken,
}

impl AuthGate {
    /// Create the gate
    pub fn new(
        store: Arc<ViewStore>,
        orchestrator: Arc<dyn Orchestrator>,
        base_hostname: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            orchestrator,
            base_hostname: base_hostname.into(),
            shutdown,
        }
    }

    /// Decide a single check for the given request host
    pub async fn check_host(&self, host: &str) -> CheckResponse {
        let view_name = self.parse_view_name(host);
        if view_name.is_empty() {
            // Passthrough; the default virtual host answers.
            return allow();
        }

        let Some(view) = self.store.get_view(&view_name) else {
            info!(view = %view_name, "no service for view");
            return denied(Code::NotFound, StatusCode::NotFound, "view not found");
        };

        if !self.store.ready_endpoints(&view_name).is_empty() {
            return allow();
        }

        self.cold_start(&view_name, &view.subset).await
    }

    /// Derive the view name from a request host
    ///
    /// The bare base hostname is not a view. A host suffixed with the base
    /// hostname names the view in its prefix. Any other host with a single
    /// label before its first dot also names a view, so gateways fronted by
    /// name-based virtual hosting at a different apex keep working.
    pub fn parse_view_name(&self, host: &str) -> String {
        let host = match host.rsplit_once(':') {
            Some((without_port, _)) => without_port,
            None => host,
        };

        if host == self.base_hostname {
            return String::new();
        }

        if let Some(prefix) = host.strip_suffix(&format!(".{}", self.base_hostname)) {
            return prefix.to_string();
        }

        if let Some((prefix, _)) = host.split_once('.') {
            return prefix.to_string();
        }

        String::new()
    }

    /// Create the workload and wait for a ready endpoint to surface
    ///
    /// The store is never mutated here; the watch-driven endpoint rebuild
    /// delivers the new endpoints. Concurrent cold starts for the same view
    /// are all safe because workload creation is idempotent.
    async fn cold_start(&self, view_name: &str, subset: &Subset) -> CheckResponse {
        let started = Instant::now();
        info!(view = %view_name, "cold start begun");

        if let Err(e) = self.orchestrator.create_workload(view_name, subset).await {
            error!(view = %view_name, error = %e, "cold start workload creation failed");
            return denied(
                Code::Internal,
                StatusCode::ServiceUnavailable,
                "failed to create workload",
            );
        }

        let deadline = tokio::time::sleep(COLD_START_TIMEOUT);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(COLD_START_POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    warn!(
                        view = %view_name,
                        elapsed_ms = started.elapsed().as_millis(),
                        "cold start cancelled"
                    );
                    return denied(
                        Code::DeadlineExceeded,
                        StatusCode::GatewayTimeout,
                        "request cancelled",
                    );
                }
                _ = &mut deadline => {
                    warn!(
                        view = %view_name,
                        elapsed_ms = started.elapsed().as_millis(),
                        "cold start timeout"
                    );
                    return denied(
                        Code::DeadlineExceeded,
                        StatusCode::ServiceUnavailable,
                        "workload not ready",
                    );
                }
                _ = ticker.tick() => {
                    if !self.store.ready_endpoints(view_name).is_empty() {
                        info!(
                            view = %view_name,
                            elapsed_ms = started.elapsed().as_millis(),
                            "cold start complete"
                        );
                        return allow();
                    }
                }
            }
        }
    }
}

#[tonic::async_trait]
impl Authorization for AuthGate {
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> std::result::Result<Response<CheckResponse>, Status> {
        let request = request.into_inner();
        let host = request
            .attributes
            .as_ref()
            .and_then(|a| a.request.as_ref())
            .and_then(|r| r.http.as_ref())
            .map(|h| h.host.clone())
            .unwrap_or_default();

        Ok(Response::new(self.check_host(&host).await))
    }
}

fn allow() -> CheckResponse {
    CheckResponse {
        status: Some(rpc::Status {
            code: Code::Ok as i32,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn denied(code: Code, http_status: StatusCode, body: &str) -> CheckResponse {
    CheckResponse {
        status: Some(rpc::Status {
            code: code as i32,
            ..Default::default()
        }),
        http_response: Some(check_response::HttpResponse::DeniedResponse(
            DeniedHttpResponse {
                status: Some(HttpStatus {
                    code: http_status as i32,
                }),
                body: body.to_string(),
                ..Default::default()
            },
        )),
        ..Default::default()
    }
}
