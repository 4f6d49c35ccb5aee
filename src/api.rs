//! Admin HTTP API
//!
//! Thin CRUD over the orchestrator: views are declared and removed here,
//! but the view store only ever changes through the watch streams. The edge
//! proxy forwards `/_api/` to this server with ext_authz disabled.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::store::ViewStore;
use crate::view::{validate_spec, View, ViewSpec};
use crate::workload::Orchestrator;

/// Shared state for the admin handlers
#[derive(Clone)]
pub struct ApiState {
    /// View inventory, for listing and the conflict guard
    pub store: Arc<ViewStore>,
    /// Orchestrator mutations
    pub orchestrator: Arc<dyn Orchestrator>,
}

/// Build the admin router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/_api/views", get(list_views).post(create_view))
        .route("/_api/views/{name}", delete(delete_view))
        .with_state(state)
}

async fn create_view(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<ViewSpec>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(spec) = payload.map_err(|_| Error::validation("invalid JSON"))?;
    validate_spec(&spec)?;

    if state.store.has_service(&spec.name) {
        return Err(Error::Conflict);
    }

    state
        .orchestrator
        .create_service(&spec.name, &spec.subset)
        .await
        .map_err(|e| if e.is_already_exists() { Error::Conflict } else { e })?;

    info!(view = %spec.name, cluster = %spec.subset.cluster, "view created");

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "name": spec.name, "subset": spec.subset })),
    ))
}

async fn list_views(State(state): State<ApiState>) -> Json<Vec<View>> {
    let mut views: Vec<View> = state
        .store
        .list_views()
        .into_iter()
        .map(|s| View {
            ready: !s.ready_endpoints().is_empty(),
            name: s.name,
            subset: s.subset,
        })
        .collect();
    views.sort_by(|a, b| a.name.cmp(&b.name));
    Json(views)
}

async fn delete_view(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    // Removal is best effort; the watch stream performs the store eviction
    // and the snapshot rebuild once the Service is actually gone.
    if let Err(e) = state.orchestrator.delete_workload(&name).await {
        warn!(view = %name, error = %e, "failed to delete workload");
    }
    if let Err(e) = state.orchestrator.delete_service(&name).await {
        warn!(view = %name, error = %e, "failed to delete service");
    }

    info!(view = %name, "view deleted");

    Json(serde_json::json!({ "status": "deleted", "name": name }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::{Subset, ViewEndpoint, ViewState};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingOrchestrator {
        created: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
        conflict: bool,
        fail: bool,
    }

    #[async_trait]
    impl Orchestrator for RecordingOrchestrator {
        async fn create_service(&self, name: &str, _subset: &Subset) -> Result<()> {
            if self.conflict {
                let ae = kube::core::ErrorResponse {
                    status: "Failure".into(),
                    message: "already exists".into(),
                    reason: "AlreadyExists".into(),
                    code: 409,
                };
                return Err(Error::Kube(kube::Error::Api(ae)));
            }
            if self.fail {
                return Err(Error::internal("boom"));
            }
            self.created.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn create_workload(&self, _name: &str, _subset: &Subset) -> Result<()> {
            Ok(())
        }

        async fn delete_workload(&self, name: &str) -> Result<()> {
            self.deleted.lock().unwrap().push(format!("job/{name}"));
            Ok(())
        }

        async fn delete_service(&self, name: &str) -> Result<()> {
            self.deleted.lock().unwrap().push(format!("service/{name}"));
            Ok(())
        }
    }

    fn test_store() -> Arc<ViewStore> {
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = kube::Client::try_from(config).unwrap();
        ViewStore::new(client, "ui").0
    }

    fn app(store: Arc<ViewStore>, orchestrator: Arc<RecordingOrchestrator>) -> Router {
        router(ApiState {
            store,
            orchestrator,
        })
    }

    fn post_view(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/_api/views")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_returns_201_with_view() {
        let orchestrator = Arc::new(RecordingOrchestrator::default());
        let app = app(test_store(), Arc::clone(&orchestrator));

        let response = app
            .oneshot(post_view(r#"{"name":"abc","subset":{"cluster":"dev"}}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["name"], "abc");
        assert_eq!(body["subset"]["cluster"], "dev");
        assert_eq!(*orchestrator.created.lock().unwrap(), vec!["abc"]);
    }

    #[tokio::test]
    async fn create_rejects_invalid_name() {
        let app = app(test_store(), Arc::new(RecordingOrchestrator::default()));

        let response = app
            .oneshot(post_view(r#"{"name":"ab","subset":{"cluster":"dev"}}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("3-8 characters"));
    }

    #[tokio::test]
    async fn create_rejects_missing_cluster() {
        let app = app(test_store(), Arc::new(RecordingOrchestrator::default()));

        let response = app
            .oneshot(post_view(r#"{"name":"abc","subset":{"cluster":""}}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_rejects_invalid_json() {
        let app = app(test_store(), Arc::new(RecordingOrchestrator::default()));

        let response = app.oneshot(post_view("{not json")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "invalid JSON");
    }

    #[tokio::test]
    async fn create_duplicate_returns_409() {
        let store = test_store();
        store.insert_for_test(ViewState {
            name: "abc".to_string(),
            subset: Subset {
                cluster: "dev".to_string(),
                namespace: None,
            },
            endpoints: vec![],
        });
        let app = app(store, Arc::new(RecordingOrchestrator::default()));

        let response = app
            .oneshot(post_view(r#"{"name":"abc","subset":{"cluster":"dev"}}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["error"], "view already exists");
    }

    #[tokio::test]
    async fn create_maps_orchestrator_conflict_to_409() {
        let orchestrator = Arc::new(RecordingOrchestrator {
            conflict: true,
            ..Default::default()
        });
        let app = app(test_store(), orchestrator);

        let response = app
            .oneshot(post_view(r#"{"name":"abc","subset":{"cluster":"dev"}}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn create_maps_orchestrator_failure_to_500() {
        let orchestrator = Arc::new(RecordingOrchestrator {
            fail: true,
            ..Default::default()
        });
        let app = app(test_store(), orchestrator);

        let response = app
            .oneshot(post_view(r#"{"name":"abc","subset":{"cluster":"dev"}}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn list_reports_readiness() {
        let store = test_store();
        store.insert_for_test(ViewState {
            name: "warm".to_string(),
            subset: Subset {
                cluster: "dev".to_string(),
                namespace: None,
            },
            endpoints: vec![ViewEndpoint {
                address: "10.0.0.1".to_string(),
                port: 8080,
                ready: true,
            }],
        });
        store.insert_for_test(ViewState {
            name: "cold".to_string(),
            subset: Subset {
                cluster: "dev".to_string(),
                namespace: None,
            },
            endpoints: vec![],
        });
        let app = app(store, Arc::new(RecordingOrchestrator::default()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/_api/views")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(body[0]["name"], "cold");
        assert_eq!(body[0]["ready"], false);
        assert_eq!(body[1]["name"], "warm");
        assert_eq!(body[1]["ready"], true);
    }

    #[tokio::test]
    async fn delete_is_best_effort_and_always_200() {
        let orchestrator = Arc::new(RecordingOrchestrator::default());
        let app = app(test_store(), Arc::clone(&orchestrator));

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/_api/views/abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "deleted");
        assert_eq!(body["name"], "abc");
        assert_eq!(
            *orchestrator.deleted.lock().unwrap(),
            vec!["job/abc", "service/abc"]
        );
    }
}
