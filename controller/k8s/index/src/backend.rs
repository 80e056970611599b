//! The orchestrator API surface the sync workers consume, as a seam so
//! tests can run against an in-memory fake.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bigip_controller_k8s_api as k8s;
use k8s::{Api, Client, ListParams, Resource, ResourceExt};
use tokio::sync::watch;
use tracing::warn;

use crate::informer::{spawn_watch_stream, AppInformer, Informer, StreamFactory};
use crate::DEFAULT_CONFIGMAP_LABEL;

pub const DEFAULT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/service-ca.crt";

/// Event reasons surfaced on Ingress objects.
pub mod reason {
    pub const RESOURCE_CONFIGURED: &str = "ResourceConfigured";
    pub const SERVICE_NOT_FOUND: &str = "ServiceNotFound";
    pub const ENDPOINTS_NOT_FOUND: &str = "EndpointsNotFound";
    pub const INCORRECT_BACKEND_SERVICE_TYPE: &str = "IncorrectBackendServiceType";
    pub const INVALID_DATA: &str = "InvalidData";
    pub const STATUS_IP_ERROR: &str = "StatusIPError";
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<k8s::Secret>;

    async fn update_config_map(&self, cm: &k8s::ConfigMap) -> Result<()>;

    async fn update_ingress_status(&self, ing: &k8s::Ingress) -> Result<()>;

    /// Reads the cluster default CA bundle.
    fn read_default_ca(&self) -> Result<String>;

    /// Records an event on an Ingress. When `ingress` is absent the target
    /// is resolved from the virtual-server name. Fire-and-forget.
    fn record_ingress_event(
        &self,
        ingress: Option<&k8s::Ingress>,
        reason: &str,
        message: &str,
        rs_name: &str,
    );
}

/// Production backend over an authenticated `kube` client.
pub struct KubeBackend {
    client: Client,
    reporter: k8s::events::Reporter,
    ca_path: String,
}

// === impl KubeBackend ===

impl KubeBackend {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: k8s::events::Reporter {
                controller: "bigip-controller".into(),
                instance: std::env::var("HOSTNAME").ok(),
            },
            ca_path: DEFAULT_CA_PATH.to_string(),
        }
    }
}

#[async_trait]
impl Backend for KubeBackend {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<k8s::Secret> {
        Api::<k8s::Secret>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await
            .with_context(|| format!("getting secret {namespace}/{name}"))
    }

    async fn update_config_map(&self, cm: &k8s::ConfigMap) -> Result<()> {
        let namespace = cm.namespace().context("configmap must have a namespace")?;
        let name = cm.name_unchecked();
        Api::<k8s::ConfigMap>::namespaced(self.client.clone(), &namespace)
            .replace(&name, &Default::default(), cm)
            .await
            .with_context(|| format!("updating configmap {namespace}/{name}"))?;
        Ok(())
    }

    async fn update_ingress_status(&self, ing: &k8s::Ingress) -> Result<()> {
        let namespace = ing.namespace().context("ingress must have a namespace")?;
        let name = ing.name_unchecked();
        Api::<k8s::Ingress>::namespaced(self.client.clone(), &namespace)
            .replace_status(&name, &Default::default(), serde_json::to_vec(ing)?)
            .await
            .with_context(|| format!("updating ingress status {namespace}/{name}"))?;
        Ok(())
    }

    fn read_default_ca(&self) -> Result<String> {
        std::fs::read_to_string(&self.ca_path)
            .with_context(|| format!("reading cluster default CA {}", self.ca_path))
    }

    fn record_ingress_event(
        &self,
        ingress: Option<&k8s::Ingress>,
        reason: &str,
        message: &str,
        rs_name: &str,
    ) {
        let client = self.client.clone();
        let reporter = self.reporter.clone();
        let reason = reason.to_string();
        let message = message.to_string();
        let target = ingress.cloned();
        let rs_name = rs_name.to_string();
        tokio::spawn(async move {
            let ing = match target {
                Some(ing) => ing,
                None => {
                    let Some((namespace, name)) =
                        bigip_controller_core::names::ingress_from_vs_name(&rs_name)
                    else {
                        warn!(%rs_name, "Could not derive an Ingress from the virtual-server name");
                        return;
                    };
                    match Api::<k8s::Ingress>::namespaced(client.clone(), namespace)
                        .get(name)
                        .await
                    {
                        Ok(ing) => ing,
                        Err(error) => {
                            warn!(%namespace, %name, %error, "Could not find Ingress resource");
                            return;
                        }
                    }
                }
            };

            let recorder = k8s::events::Recorder::new(client, reporter, ing.object_ref(&()));
            if let Err(error) = recorder
                .publish(k8s::events::Event {
                    type_: k8s::events::EventType::Normal,
                    reason,
                    note: Some(message),
                    action: "Sync".to_string(),
                    secondary: None,
                })
                .await
            {
                warn!(%error, "Failed to record Ingress event");
            }
        });
    }
}

/// Builds live watch streams for informer bundles.
pub struct KubeStreams {
    client: Client,
    route_label: Option<String>,
    namespace_label: Option<String>,
    with_routes: bool,
}

// === impl KubeStreams ===

impl KubeStreams {
    pub fn new(
        client: Client,
        with_routes: bool,
        route_label: Option<String>,
        namespace_label: Option<String>,
    ) -> Self {
        Self {
            client,
            route_label,
            namespace_label,
            with_routes,
        }
    }

    fn api<T: Resource<DynamicType = (), Scope = k8s::NamespaceResourceScope>>(
        &self,
        namespace: &str,
    ) -> Api<T> {
        if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }
}

impl StreamFactory for KubeStreams {
    fn start_app_informer(&self, inf: &AppInformer, stop: watch::Receiver<bool>) {
        let ns = inf.namespace.clone();

        let lp = ListParams::default().labels(DEFAULT_CONFIGMAP_LABEL);
        spawn_watch_stream(
            inf.configmaps.clone(),
            k8s::watcher(self.api::<k8s::ConfigMap>(&ns), lp),
            stop.clone(),
        );
        spawn_watch_stream(
            inf.services.clone(),
            k8s::watcher(self.api::<k8s::Service>(&ns), ListParams::default()),
            stop.clone(),
        );
        spawn_watch_stream(
            inf.endpoints.clone(),
            k8s::watcher(self.api::<k8s::Endpoints>(&ns), ListParams::default()),
            stop.clone(),
        );
        spawn_watch_stream(
            inf.ingresses.clone(),
            k8s::watcher(self.api::<k8s::Ingress>(&ns), ListParams::default()),
            stop.clone(),
        );
        if self.with_routes {
            if let Some(routes) = &inf.routes {
                let lp = match &self.route_label {
                    Some(label) => ListParams::default().labels(label),
                    None => ListParams::default(),
                };
                spawn_watch_stream(routes.clone(), k8s::watcher(self.api::<k8s::Route>(&ns), lp), stop);
            }
        }
    }

    fn start_namespace_informer(&self, inf: &Informer<k8s::Namespace>, stop: watch::Receiver<bool>) {
        let lp = match &self.namespace_label {
            Some(label) => ListParams::default().labels(label),
            None => ListParams::default(),
        };
        spawn_watch_stream(
            inf.clone(),
            k8s::watcher(Api::<k8s::Namespace>::all(self.client.clone()), lp),
            stop,
        );
    }
}
