//! In-memory view inventory fed by cluster watches
//!
//! The store is the single source the snapshot builder and the
//! authorization gate read from. It is populated exclusively by two watch
//! streams: view Services (filtered by the app label) and EndpointSlices
//! (unfiltered, correlated through the well-known service-name label).
//! Every committed mutation emits one change notification.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::ListParams;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ANNO_CLUSTER, ANNO_NAMESPACE, LABEL_APP, LABEL_VIEW_NAME, VIEW_NAME_PREFIX};
use crate::error::Result;
use crate::view::{Subset, ViewEndpoint, ViewState};

/// Label EndpointSlices carry to point back at their owning Service
const LABEL_SERVICE_NAME: &str = "kubernetes.io/service-name";

/// Thread-safe mapping from view name to observed view state
pub struct ViewStore {
    views: RwLock<HashMap<String, ViewState>>,
    notify: mpsc::UnboundedSender<()>,
    client: Client,
    namespace: String,
}

impl ViewStore {
    /// Create a store and the change-notification receiver fed by it
    pub fn new(client: Client, namespace: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (notify, changes) = mpsc::unbounded_channel();
        let store = Arc::new(Self {
            views: RwLock::new(HashMap::new()),
            notify,
            client,
            namespace: namespace.into(),
        });
        (store, changes)
    }

    /// Start both watch streams and wait for their initial list to complete
    ///
    /// Returns once both caches are synced; a change notification is emitted
    /// at that point so the publisher builds a snapshot covering the initial
    /// inventory. The watchers keep running until `token` is cancelled.
    pub async fn start(self: &Arc<Self>, token: CancellationToken) -> Result<()> {
        let (svc_synced_tx, svc_synced) = oneshot::channel();
        let (eps_synced_tx, eps_synced) = oneshot::channel();

        tokio::spawn(Arc::clone(self).watch_services(token.clone(), svc_synced_tx));
        tokio::spawn(Arc::clone(self).watch_endpoint_slices(token.clone(), eps_synced_tx));

        let _ = svc_synced.await;
        let _ = eps_synced.await;
        info!(namespace = %self.namespace, "view watchers synced");

        self.emit_change();
        Ok(())
    }

    async fn watch_services(self: Arc<Self>, token: CancellationToken, synced: oneshot::Sender<()>) {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let config = watcher::Config::default().labels(&format!("app={LABEL_APP}"));
        let mut stream = watcher::watcher(api, config).default_backoff().boxed();
        let mut synced = Some(synced);
        // Views seen during a (re-)list; anything absent at InitDone was
        // deleted while the watch was down.
        let mut listed: Option<HashSet<String>> = None;

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = stream.next() => event,
            };
            match event {
                Some(Ok(Event::Apply(svc))) => self.apply_service(&svc),
                Some(Ok(Event::InitApply(svc))) => {
                    if let (Some(listed), Some(name)) = (listed.as_mut(), view_name_of(&svc)) {
                        listed.insert(name);
                    }
                    self.apply_service(&svc);
                }
                Some(Ok(Event::Delete(svc))) => self.remove_service(&svc),
                Some(Ok(Event::Init)) => listed = Some(HashSet::new()),
                Some(Ok(Event::InitDone)) => {
                    if let Some(listed) = listed.take() {
                        self.retain_views(&listed);
                    }
                    if let Some(tx) = synced.take() {
                        let _ = tx.send(());
                    }
                }
                Some(Err(e)) => warn!(error = %e, "service watch error, backing off"),
                None => break,
            }
        }
        info!("service watcher stopped");
    }

    async fn watch_endpoint_slices(
        self: Arc<Self>,
        token: CancellationToken,
        synced: oneshot::Sender<()>,
    ) {
        // EndpointSlices are labeled with kubernetes.io/service-name rather
        // than the app label, so this watch is unfiltered.
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut stream = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();
        let mut synced = Some(synced);

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = stream.next() => event,
            };
            match event {
                Some(Ok(Event::Apply(slice) | Event::InitApply(slice) | Event::Delete(slice))) => {
                    self.handle_slice_event(&slice).await;
                }
                Some(Ok(Event::Init)) => {}
                Some(Ok(Event::InitDone)) => {
                    if let Some(tx) = synced.take() {
                        let _ = tx.send(());
                    }
                }
                Some(Err(e)) => warn!(error = %e, "endpointslice watch error, backing off"),
                None => break,
            }
        }
        info!("endpointslice watcher stopped");
    }

    /// Upsert a view from its Service object
    pub fn apply_service(&self, svc: &Service) {
        let Some(name) = view_name_of(svc) else { return };

        let annotations = svc.metadata.annotations.clone().unwrap_or_default();
        let subset = Subset {
            cluster: annotations.get(ANNO_CLUSTER).cloned().unwrap_or_default(),
            namespace: annotations
                .get(ANNO_NAMESPACE)
                .filter(|ns| !ns.is_empty())
                .cloned(),
        };

        {
            let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());
            let state = views.entry(name.clone()).or_insert_with(|| ViewState {
                name: name.clone(),
                ..ViewState::default()
            });
            state.subset = subset;
        }

        info!(view = %name, "service updated");
        self.emit_change();
    }

    /// Remove a view on Service deletion
    pub fn remove_service(&self, svc: &Service) {
        let Some(name) = view_name_of(svc) else { return };

        {
            let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());
            views.remove(&name);
        }

        info!(view = %name, "service deleted");
        self.emit_change();
    }

    /// React to any EndpointSlice event touching a view service
    async fn handle_slice_event(&self, slice: &EndpointSlice) {
        let svc_name = slice
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_SERVICE_NAME).cloned())
            .unwrap_or_default();

        let Some(view_name) = svc_name.strip_prefix(VIEW_NAME_PREFIX) else {
            return;
        };
        if !self.has_service(view_name) {
            return;
        }

        self.rebuild_endpoints(view_name).await;
        self.emit_change();
    }

    /// Replace a view's endpoint set from the current EndpointSlice list
    ///
    /// The list happens outside the lock; only the commit takes the write
    /// lock.
    pub async fn rebuild_endpoints(&self, view_name: &str) {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), &self.namespace);
        let selector = format!("{LABEL_SERVICE_NAME}={VIEW_NAME_PREFIX}{view_name}");
        let slices = match api.list(&ListParams::default().labels(&selector)).await {
            Ok(list) => list.items,
            Err(e) => {
                error!(view = %view_name, error = %e, "failed to list endpointslices");
                return;
            }
        };

        let endpoints = flatten_slices(&slices);
        let count = endpoints.len();

        {
            let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = views.get_mut(view_name) {
                state.endpoints = endpoints;
            }
        }

        debug!(view = %view_name, count, "endpoints rebuilt");
    }

    /// Current state of one view, if known
    pub fn get_view(&self, name: &str) -> Option<ViewState> {
        let views = self.views.read().unwrap_or_else(|e| e.into_inner());
        views.get(name).cloned()
    }

    /// Snapshot of all view states; order is unspecified
    pub fn list_views(&self) -> Vec<ViewState> {
        let views = self.views.read().unwrap_or_else(|e| e.into_inner());
        views.values().cloned().collect()
    }

    /// Ready endpoints of one view; empty when the view is unknown
    pub fn ready_endpoints(&self, name: &str) -> Vec<ViewEndpoint> {
        let views = self.views.read().unwrap_or_else(|e| e.into_inner());
        views
            .get(name)
            .map(|state| state.ready_endpoints())
            .unwrap_or_default()
    }

    /// Drop views whose Service vanished while the watch was down
    fn retain_views(&self, listed: &HashSet<String>) {
        let evicted: Vec<String> = {
            let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());
            let stale: Vec<String> = views
                .keys()
                .filter(|name| !listed.contains(*name))
                .cloned()
                .collect();
            for name in &stale {
                views.remove(name);
            }
            stale
        };

        for name in &evicted {
            info!(view = %name, "service gone after relist");
            self.emit_change();
        }
    }

    /// Cheap existence check used by the admin API's conflict guard
    pub fn has_service(&self, name: &str) -> bool {
        let views = self.views.read().unwrap_or_else(|e| e.into_inner());
        views.contains_key(name)
    }

    fn emit_change(&self) {
        // Receiver dropping means the publisher is gone; nothing to do.
        let _ = self.notify.send(());
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, state: ViewState) {
        let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());
        views.insert(state.name.clone(), state);
    }
}

fn view_name_of(svc: &Service) -> Option<String> {
    svc.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_VIEW_NAME))
        .filter(|name| !name.is_empty())
        .cloned()
}

/// Flatten EndpointSlices into view endpoints
///
/// Each slice contributes its first port (8080 when absent) for every
/// address of every endpoint. Readiness is the per-endpoint Serving
/// condition, defaulting to false: the view Service publishes not-ready
/// addresses, which forces the Ready condition true and makes it useless
/// for gating.
pub fn flatten_slices(slices: &[EndpointSlice]) -> Vec<ViewEndpoint> {
    let mut endpoints = Vec::new();
    for slice in slices {
        let port = slice
            .ports
            .as_ref()
            .and_then(|ports| ports.first())
            .and_then(|p| p.port)
            .map(|p| p as u16)
            .unwrap_or(8080);

        for ep in &slice.endpoints {
            let ready = ep
                .conditions
                .as_ref()
                .and_then(|c| c.serving)
                .unwrap_or(false);
            for addr in &ep.addresses {
                endpoints.push(ViewEndpoint {
                    address: addr.clone(),
                    port,
                    ready,
                });
            }
        }
    }
    endpoints
}
