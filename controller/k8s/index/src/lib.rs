#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The reconciliation engine: per-namespace watch caches funneling change
//! notifications through rate-limited work queues into a single-writer sync
//! loop that keeps the emitted load-balancer configuration coherent.

pub mod backend;
mod configmap;
mod ingress;
pub mod informer;
mod nodes;
mod output;
pub mod queue;
mod route;
mod sync;

#[cfg(test)]
mod tests;

pub use self::backend::{Backend, KubeBackend, KubeStreams};
pub use self::informer::{AppInformer, Delta, Informer, StreamFactory};
pub use self::queue::RateLimitingQueue;

use ahash::AHashMap as HashMap;
use anyhow::{bail, Result};
use bigip_controller_core::{
    irules, CustomProfile, IRule, InternalDataGroup, NameRef, Resources, SecretKey,
    ServiceQueueKey, DEFAULT_HTTPS_PORT, DEFAULT_PARTITION,
};
use bigip_controller_core::ConfigWriter;
use bigip_controller_k8s_api as k8s;
use parking_lot::Mutex;
use std::sync::{atomic::AtomicBool, Arc};
use tokio::sync::watch;
use tracing::{debug, warn};

pub const DEFAULT_CONFIGMAP_LABEL: &str = "f5type in (virtual-server)";

const VS_BIND_ADDR_ANNOTATION: &str = "status.virtual-server.f5.com/ip";
const INGRESS_SSL_REDIRECT_ANNOTATION: &str = "ingress.kubernetes.io/ssl-redirect";
const INGRESS_ALLOW_HTTP_ANNOTATION: &str = "ingress.kubernetes.io/allow-http";
const INGRESS_HEALTH_MONITOR_ANNOTATION: &str = "virtual-server.f5.com/health";
const BIND_ADDR_ANNOTATION: &str = "virtual-server.f5.com/ip";
const PARTITION_ANNOTATION: &str = "virtual-server.f5.com/partition";
const BALANCE_ANNOTATION: &str = "virtual-server.f5.com/balance";
const HTTP_PORT_ANNOTATION: &str = "virtual-server.f5.com/http-port";
const HTTPS_PORT_ANNOTATION: &str = "virtual-server.f5.com/https-port";

/// Options for OpenShift route handling.
#[derive(Clone, Debug)]
pub struct RouteConfig {
    /// Bind address of the shared route virtual servers.
    pub vs_addr: String,
    /// Label selector for the route informers; `None` watches everything.
    pub label: Option<String>,
}

pub struct Params {
    pub backend: Arc<dyn Backend>,
    pub writer: Arc<dyn ConfigWriter>,
    /// Watch-stream supplier; absent in tests, which drive informers directly.
    pub streams: Option<Arc<dyn StreamFactory>>,
    pub use_node_internal: bool,
    pub is_node_port: bool,
    pub route_config: Option<RouteConfig>,
    pub initial_state: bool,
}

/// The engine. Owns every store; passed by `Arc` into the worker tasks.
///
/// Lock order where nested: informers, resources, old_nodes,
/// custom_profiles, irules, int_dg. No lock is held across an orchestrator
/// call.
pub struct Manager {
    pub(crate) resources: Mutex<Resources>,
    pub(crate) custom_profiles: Mutex<HashMap<SecretKey, CustomProfile>>,
    pub(crate) irules: Mutex<HashMap<NameRef, IRule>>,
    pub(crate) int_dg: Mutex<HashMap<NameRef, InternalDataGroup>>,
    pub(crate) old_nodes: Mutex<Vec<String>>,
    informers: Mutex<InformerSet>,
    pub(crate) vs_queue: RateLimitingQueue<ServiceQueueKey>,
    pub(crate) ns_queue: RateLimitingQueue<String>,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) writer: Arc<dyn ConfigWriter>,
    streams: Option<Arc<dyn StreamFactory>>,
    use_node_internal: bool,
    is_node_port: bool,
    pub(crate) route_config: Option<RouteConfig>,
    pub(crate) initial_state: AtomicBool,
}

struct InformerSet {
    app: HashMap<String, Arc<AppInformer>>,
    namespace: Option<Informer<k8s::Namespace>>,
    ns_stop: Option<watch::Sender<bool>>,
}

/// Runs a worker, restarting it if it panics. A clean return (queue
/// shutdown) ends the task.
fn spawn_supervised<F, Fut>(name: &'static str, mut worker: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match tokio::spawn(worker()).await {
                Ok(()) => return,
                Err(error) => {
                    warn!(%name, %error, "Worker terminated unexpectedly; restarting");
                }
            }
        }
    });
}

// === impl Manager ===

impl Manager {
    pub fn new(params: Params) -> Arc<Self> {
        Arc::new(Self {
            resources: Mutex::new(Resources::new()),
            custom_profiles: Mutex::new(HashMap::new()),
            irules: Mutex::new(HashMap::new()),
            int_dg: Mutex::new(HashMap::new()),
            old_nodes: Mutex::new(Vec::new()),
            informers: Mutex::new(InformerSet {
                app: HashMap::new(),
                namespace: None,
                ns_stop: None,
            }),
            vs_queue: RateLimitingQueue::new(),
            ns_queue: RateLimitingQueue::new(),
            backend: params.backend,
            writer: params.writer,
            streams: params.streams,
            use_node_internal: params.use_node_internal,
            is_node_port: params.is_node_port,
            route_config: params.route_config,
            initial_state: AtomicBool::new(params.initial_state),
        })
    }

    pub fn is_node_port(&self) -> bool {
        self.is_node_port
    }

    pub fn use_node_internal(&self) -> bool {
        self.use_node_internal
    }

    pub(crate) fn manages_routes(&self) -> bool {
        self.route_config.is_some()
    }

    pub(crate) fn add_irule(&self, name: &str, partition: &str, code: String) {
        let mut irules = self.irules.lock();
        irules.insert(
            NameRef::new(name, partition),
            IRule::new(name, partition, code),
        );
    }

    pub(crate) fn add_internal_data_group(&self, name: &str, partition: &str) {
        let mut dgs = self.int_dg.lock();
        dgs.insert(
            NameRef::new(name, partition),
            InternalDataGroup::new(name, partition),
        );
    }

    fn watching_all_namespaces_locked(informers: &InformerSet) -> bool {
        !informers.app.is_empty() && informers.app.contains_key("")
    }

    /// Adds a namespace informer bundle. `""` watches all namespaces and is
    /// mutually exclusive with specific ones.
    pub fn add_namespace(&self, namespace: &str) -> Result<Arc<AppInformer>> {
        let mut informers = self.informers.lock();
        self.add_namespace_locked(&mut informers, namespace)
    }

    fn add_namespace_locked(
        &self,
        informers: &mut InformerSet,
        namespace: &str,
    ) -> Result<Arc<AppInformer>> {
        if Self::watching_all_namespaces_locked(informers) {
            bail!("cannot add additional namespaces when already watching all");
        }
        if !informers.app.is_empty() && namespace.is_empty() {
            bail!("cannot watch all namespaces when already watching specific ones");
        }
        if let Some(inf) = informers.app.get(namespace) {
            return Ok(inf.clone());
        }
        let inf = Arc::new(AppInformer::new(
            namespace,
            self.vs_queue.clone(),
            self.manages_routes(),
        ));
        informers.app.insert(namespace.to_string(), inf.clone());
        Ok(inf)
    }

    pub fn remove_namespace(&self, namespace: &str) -> Result<()> {
        let mut informers = self.informers.lock();
        Self::remove_namespace_locked(&mut informers, namespace).map(|_| ())
    }

    fn remove_namespace_locked(
        informers: &mut InformerSet,
        namespace: &str,
    ) -> Result<Arc<AppInformer>> {
        informers
            .app
            .remove(namespace)
            .ok_or_else(|| anyhow::anyhow!("no informers exist for namespace {namespace}"))
    }

    /// Installs the namespace-label informer that drives dynamic namespace
    /// membership. Mutually exclusive with explicit namespace informers.
    pub fn add_namespace_label_informer(&self) -> Result<Informer<k8s::Namespace>> {
        let mut informers = self.informers.lock();
        if informers.namespace.is_some() {
            bail!("already have a namespace label informer added");
        }
        if !informers.app.is_empty() {
            bail!("cannot set a namespace label informer when informers have been setup for one or more namespaces");
        }
        let queue = self.ns_queue.clone();
        let inf = Informer::new(move |ns: &k8s::Namespace| {
            queue.add(k8s::ResourceExt::name_unchecked(ns));
        });
        informers.namespace = Some(inf.clone());
        Ok(inf)
    }

    pub fn get_watched_namespaces(&self) -> Vec<String> {
        self.informers.lock().app.keys().cloned().collect()
    }

    pub(crate) fn get_namespace_informer(&self, namespace: &str) -> Option<Arc<AppInformer>> {
        let informers = self.informers.lock();
        Self::get_namespace_informer_locked(&informers, namespace)
    }

    fn get_namespace_informer_locked(
        informers: &InformerSet,
        namespace: &str,
    ) -> Option<Arc<AppInformer>> {
        let to_find = if Self::watching_all_namespaces_locked(informers) {
            ""
        } else {
            namespace
        };
        informers.app.get(to_find).cloned()
    }

    /// All informer bundles, for walks that span namespaces.
    pub(crate) fn app_informers(&self) -> Vec<Arc<AppInformer>> {
        self.informers.lock().app.values().cloned().collect()
    }

    /// Runs the engine until the shutdown signal fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.add_irule(
            irules::HTTP_REDIRECT_IRULE_NAME,
            DEFAULT_PARTITION,
            irules::http_redirect_irule(DEFAULT_HTTPS_PORT),
        );
        if self.manages_routes() {
            self.add_irule(
                irules::SSL_PASSTHROUGH_IRULE_NAME,
                DEFAULT_PARTITION,
                irules::ssl_passthrough_irule(),
            );
            self.add_internal_data_group(irules::PASSTHROUGH_HOSTS_DG_NAME, DEFAULT_PARTITION);
            self.add_internal_data_group(irules::REENCRYPT_HOSTS_DG_NAME, DEFAULT_PARTITION);
        }

        // Namespace-label informer, when configured.
        let ns_inf = {
            let mut informers = self.informers.lock();
            if let Some(inf) = informers.namespace.clone() {
                let (stop_tx, stop_rx) = watch::channel(false);
                informers.ns_stop = Some(stop_tx);
                if let Some(streams) = &self.streams {
                    streams.start_namespace_informer(&inf, stop_rx);
                }
                Some(inf)
            } else {
                None
            }
        };
        if let Some(inf) = &ns_inf {
            if self.streams.is_some() {
                inf.store().wait_synced().await;
            }
            let mgr = self.clone();
            spawn_supervised("namespace", move || {
                let mgr = mgr.clone();
                async move { mgr.namespace_worker().await }
            });
        }

        self.start_and_sync_app_informers().await;

        let mgr = self.clone();
        spawn_supervised("virtual-server", move || {
            let mgr = mgr.clone();
            async move { mgr.virtual_server_worker().await }
        });

        let _ = shutdown.changed().await;
        self.stop_app_informers();
        {
            let informers = self.informers.lock();
            if let Some(stop) = &informers.ns_stop {
                let _ = stop.send(true);
            }
        }
        self.vs_queue.shut_down();
        self.ns_queue.shut_down();
    }

    pub(crate) async fn start_and_sync_app_informers(&self) {
        let bundles = {
            let informers = self.informers.lock();
            for inf in informers.app.values() {
                inf.start(self.streams.as_ref());
            }
            informers.app.values().cloned().collect::<Vec<_>>()
        };
        for inf in bundles {
            inf.wait_for_cache_sync().await;
        }
    }

    fn stop_app_informers(&self) {
        let informers = self.informers.lock();
        for inf in informers.app.values() {
            inf.stop();
        }
    }

    pub(crate) async fn namespace_worker(&self) {
        while self.process_next_namespace().await {}
    }

    pub(crate) async fn process_next_namespace(&self) -> bool {
        let Some(key) = self.ns_queue.get().await else {
            return false;
        };
        match self.sync_namespace(&key).await {
            Ok(()) => {
                self.ns_queue.forget(&key);
            }
            Err(error) => {
                warn!(namespace = %key, %error, "Namespace sync failed");
                self.ns_queue.add_rate_limited(key.clone());
            }
        }
        self.ns_queue.done(&key);
        true
    }

    async fn sync_namespace(&self, ns_name: &str) -> Result<()> {
        let ns_inf = self.informers.lock().namespace.clone();
        let Some(ns_inf) = ns_inf else {
            return Ok(());
        };
        let exists = ns_inf.store().get("", ns_name).is_some();

        enum Action {
            None,
            Added(Arc<AppInformer>),
            Removed(Arc<AppInformer>),
        }
        let action = {
            let mut informers = self.informers.lock();
            let found = Self::get_namespace_informer_locked(&informers, ns_name);
            match (exists, found) {
                (true, Some(_)) | (false, None) => Action::None,
                (true, None) => {
                    let inf = self.add_namespace_locked(&mut informers, ns_name)?;
                    inf.start(self.streams.as_ref());
                    Action::Added(inf)
                }
                (false, Some(inf)) => {
                    Self::remove_namespace_locked(&mut informers, ns_name)?;
                    Action::Removed(inf)
                }
            }
        };

        match action {
            Action::None => {}
            Action::Added(inf) => {
                inf.wait_for_cache_sync().await;
                debug!(namespace = %ns_name, "Added namespace informers");
            }
            Action::Removed(inf) => {
                // Namespace was de-watched: drop its resources.
                inf.stop();
                let mut resources = self.resources.lock();
                let mut doomed = Vec::new();
                resources.for_each(|key, _| {
                    if key.namespace == ns_name {
                        doomed.push(key.clone());
                    }
                });
                doomed.sort();
                doomed.dedup();
                let mut deleted = 0;
                for key in &doomed {
                    if resources.delete(key, "") {
                        deleted += 1;
                    }
                }
                if deleted > 0 {
                    self.output_config_locked(&resources);
                }
                debug!(namespace = %ns_name, %deleted, "Removed namespace informers");
            }
        }
        Ok(())
    }
}
