//! Kubernetes mutations for view Services and Jobs
//!
//! Declares the per-view objects: a headless Service that publishes
//! not-ready addresses (so endpoints surface the moment pods register) and
//! a one-shot Job running the view's backend next to an envoy sidecar. The
//! labels and annotations attached here are the contract that lets the
//! store's watches correlate everything back to the view.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvFromSource, EnvVar, HTTPGetAction,
    PodSpec, PodTemplateSpec, Probe, SecretEnvSource, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, PostParams, PropagationPolicy};
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::{
    view_object_name, Config, ANNO_CLUSTER, ANNO_NAMESPACE, LABEL_APP, LABEL_VIEW_NAME,
    WORKLOAD_PORT,
};
use crate::error::{Error, Result};
use crate::view::Subset;

/// ConfigMap holding the per-view envoy sidecar bootstrap
const PROXY_CONFIG_MAP: &str = "view-proxy-config";

/// ConfigMap holding backend init scripts
const BACKEND_INIT_CONFIG_MAP: &str = "view-backend-init";

/// Secret with backend credentials, injected via env
const BACKEND_ENV_SECRET: &str = "view-backend-env";

/// Hard activity deadline for view workloads
const WORKLOAD_DEADLINE_SECS: i64 = 3600;

/// Orchestrator operations the gate and the admin API consume
///
/// Seam between the sidecar and the cluster so both can be exercised
/// without one.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Declare the view's persistent routing target
    async fn create_service(&self, name: &str, subset: &Subset) -> Result<()>;
    /// Declare the view's workload; must be idempotent
    async fn create_workload(&self, name: &str, subset: &Subset) -> Result<()>;
    /// Remove the view's workload; absence is success
    async fn delete_workload(&self, name: &str) -> Result<()>;
    /// Remove the view's routing target; absence is success
    async fn delete_service(&self, name: &str) -> Result<()>;
}

/// Typed Kubernetes client for view objects
#[derive(Clone)]
pub struct WorkloadClient {
    services: Api<Service>,
    jobs: Api<Job>,
    namespace: String,
    workload_image: String,
    proxy_image: String,
}

impl WorkloadClient {
    /// Create a client scoped to the configured view namespace
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            services: Api::namespaced(client.clone(), &config.namespace),
            jobs: Api::namespaced(client, &config.namespace),
            namespace: config.namespace.clone(),
            workload_image: config.workload_image.clone(),
            proxy_image: config.proxy_image.clone(),
        }
    }

    /// Declare the view's persistent routing target
    ///
    /// An AlreadyExists failure propagates so the admin API can report the
    /// conflict.
    pub async fn create_service(&self, name: &str, subset: &Subset) -> Result<()> {
        let svc = self.build_service(name, subset);
        self.services
            .create(&PostParams::default(), &svc)
            .await
            .map_err(Error::Kube)?;
        info!(view = %name, namespace = %self.namespace, "service created");
        Ok(())
    }

    /// Declare the view's workload; an existing Job satisfies the intent
    pub async fn create_job(&self, name: &str, subset: &Subset) -> Result<()> {
        let job = self.build_job(name, subset);
        match self.jobs.create(&PostParams::default(), &job).await {
            Ok(_) => {
                info!(view = %name, "job created");
                Ok(())
            }
            Err(e) => {
                let err = Error::Kube(e);
                if err.is_already_exists() {
                    debug!(view = %name, "job already exists");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Delete the view's Job; absence is success
    pub async fn delete_job(&self, name: &str) -> Result<()> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match self.jobs.delete(&view_object_name(name), &params).await {
            Ok(_) => {
                info!(view = %name, "job deleted");
                Ok(())
            }
            Err(e) => {
                let err = Error::Kube(e);
                if err.is_not_found() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Delete the view's Service; absence is success
    pub async fn delete_service(&self, name: &str) -> Result<()> {
        match self
            .services
            .delete(&view_object_name(name), &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!(view = %name, "service deleted");
                Ok(())
            }
            Err(e) => {
                let err = Error::Kube(e);
                if err.is_not_found() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    fn metadata(&self, name: &str, subset: &Subset) -> ObjectMeta {
        ObjectMeta {
            name: Some(view_object_name(name)),
            namespace: Some(self.namespace.clone()),
            labels: Some(view_labels(name)),
            annotations: Some(subset_annotations(subset)),
            ..Default::default()
        }
    }

    fn build_service(&self, name: &str, subset: &Subset) -> Service {
        Service {
            metadata: self.metadata(name, subset),
            spec: Some(ServiceSpec {
                // Headless: the sidecar resolves endpoints itself via
                // EndpointSlices and EDS, no cluster IP needed.
                cluster_ip: Some("None".to_string()),
                publish_not_ready_addresses: Some(true),
                selector: Some(BTreeMap::from([(
                    LABEL_VIEW_NAME.to_string(),
                    name.to_string(),
                )])),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: WORKLOAD_PORT as i32,
                    target_port: Some(IntOrString::Int(WORKLOAD_PORT as i32)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_job(&self, name: &str, subset: &Subset) -> Job {
        let backend = Container {
            name: "backend".to_string(),
            image: Some(self.workload_image.clone()),
            env: Some(vec![
                EnvVar {
                    name: "SUBSET_CLUSTER".to_string(),
                    value: Some(subset.cluster.clone()),
                    ..Default::default()
                },
                EnvVar {
                    name: "SUBSET_NAMESPACE".to_string(),
                    value: Some(subset.namespace.clone().unwrap_or_default()),
                    ..Default::default()
                },
            ]),
            env_from: Some(vec![EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: BACKEND_ENV_SECRET.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            volume_mounts: Some(vec![VolumeMount {
                name: "backend-init".to_string(),
                mount_path: "/etc/backend-init".to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        };

        // The proxy sidecar owns the serving port; its readiness probe is
        // what flips the endpoint's Serving condition.
        let proxy = Container {
            name: "proxy".to_string(),
            image: Some(self.proxy_image.clone()),
            ports: Some(vec![ContainerPort {
                name: Some("http".to_string()),
                container_port: WORKLOAD_PORT as i32,
                ..Default::default()
            }]),
            volume_mounts: Some(vec![VolumeMount {
                name: "proxy-config".to_string(),
                mount_path: "/etc/envoy".to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
            readiness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/".to_string()),
                    port: IntOrString::Int(WORKLOAD_PORT as i32),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(5),
                period_seconds: Some(5),
                ..Default::default()
            }),
            ..Default::default()
        };

        Job {
            metadata: self.metadata(name, subset),
            spec: Some(JobSpec {
                active_deadline_seconds: Some(WORKLOAD_DEADLINE_SECS),
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(view_labels(name)),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![backend, proxy],
                        volumes: Some(vec![
                            Volume {
                                name: "proxy-config".to_string(),
                                config_map: Some(ConfigMapVolumeSource {
                                    name: PROXY_CONFIG_MAP.to_string(),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                            Volume {
                                name: "backend-init".to_string(),
                                config_map: Some(ConfigMapVolumeSource {
                                    name: BACKEND_INIT_CONFIG_MAP.to_string(),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }
}

#[async_trait]
impl Orchestrator for WorkloadClient {
    async fn create_service(&self, name: &str, subset: &Subset) -> Result<()> {
        WorkloadClient::create_service(self, name, subset).await
    }

    async fn create_workload(&self, name: &str, subset: &Subset) -> Result<()> {
        self.create_job(name, subset).await
    }

    async fn delete_workload(&self, name: &str) -> Result<()> {
        self.delete_job(name).await
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        WorkloadClient::delete_service(self, name).await
    }
}

fn view_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), LABEL_APP.to_string()),
        (LABEL_VIEW_NAME.to_string(), name.to_string()),
    ])
}

fn subset_annotations(subset: &Subset) -> BTreeMap<String, String> {
    BTreeMap::from([
        (ANNO_CLUSTER.to_string(), subset.cluster.clone()),
        (
            ANNO_NAMESPACE.to_string(),
            subset.namespace.clone().unwrap_or_default(),
        ),
    ])
}
