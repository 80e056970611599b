//! List/watch caches and the per-namespace informer bundle.
//!
//! The orchestrator client is consumed as a stream of typed add/update/delete
//! events ([`Delta`]); the production adapter maps `kube` watcher events into
//! deltas, while tests feed deltas directly.

use crate::queue::RateLimitingQueue;
use ahash::AHashMap as HashMap;
use bigip_controller_core::ServiceQueueKey;
use bigip_controller_k8s_api as k8s;
use futures::prelude::*;
use k8s::{Resource, ResourceExt};
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{watch, Notify};
use tracing::info;

/// One observed change to a watched resource collection.
#[derive(Clone, Debug)]
pub enum Delta<T> {
    Apply(T),
    Delete(T),
    Restart(Vec<T>),
}

impl<T> From<k8s::watcher::Event<T>> for Delta<T> {
    fn from(ev: k8s::watcher::Event<T>) -> Self {
        match ev {
            k8s::watcher::Event::Applied(obj) => Delta::Apply(obj),
            k8s::watcher::Event::Deleted(obj) => Delta::Delete(obj),
            k8s::watcher::Event::Restarted(objs) => Delta::Restart(objs),
        }
    }
}

/// A shared cache of watched objects, indexed by namespace and name.
pub struct Store<T> {
    inner: Arc<RwLock<StoreState<T>>>,
    sync_notify: Arc<Notify>,
}

struct StoreState<T> {
    objects: HashMap<(String, String), T>,
    synced: bool,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            sync_notify: self.sync_notify.clone(),
        }
    }
}

// === impl Store ===

impl<T: Resource<DynamicType = ()> + Clone> Store<T> {
    fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreState {
                objects: HashMap::new(),
                synced: false,
            })),
            sync_notify: Arc::new(Notify::new()),
        }
    }

    fn key_of(obj: &T) -> (String, String) {
        (obj.namespace().unwrap_or_default(), obj.name_unchecked())
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<T> {
        self.inner
            .read()
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// All cached objects of `namespace`, in stable name order.
    pub fn by_namespace(&self, namespace: &str) -> Vec<T> {
        let state = self.inner.read();
        let mut named = state
            .objects
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .collect::<Vec<_>>();
        named.sort_by(|((_, a), _), ((_, b), _)| a.cmp(b));
        named.into_iter().map(|(_, obj)| obj.clone()).collect()
    }

    /// Every cached object, in stable key order.
    pub fn all(&self) -> Vec<T> {
        let state = self.inner.read();
        let mut keyed = state.objects.iter().collect::<Vec<_>>();
        keyed.sort_by(|(a, _), (b, _)| a.cmp(b));
        keyed.into_iter().map(|(_, obj)| obj.clone()).collect()
    }

    pub fn has_synced(&self) -> bool {
        self.inner.read().synced
    }

    pub async fn wait_synced(&self) {
        loop {
            let notified = self.sync_notify.notified();
            if self.inner.read().synced {
                return;
            }
            notified.await;
        }
    }
}

/// A cache plus the event handler that feeds the work queues. Handlers must
/// never block; they only compute queue keys and call `add`.
pub struct Informer<T> {
    store: Store<T>,
    handler: Arc<dyn Fn(&T) + Send + Sync>,
}

impl<T> Clone for Informer<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            handler: self.handler.clone(),
        }
    }
}

// === impl Informer ===

impl<T: Resource<DynamicType = ()> + Clone> Informer<T> {
    pub fn new(handler: impl Fn(&T) + Send + Sync + 'static) -> Self {
        Self {
            store: Store::new(),
            handler: Arc::new(handler),
        }
    }

    pub fn store(&self) -> &Store<T> {
        &self.store
    }

    pub fn handle_delta(&self, delta: Delta<T>) {
        match delta {
            Delta::Apply(obj) => {
                {
                    let mut state = self.store.inner.write();
                    state.objects.insert(Store::key_of(&obj), obj.clone());
                    if !state.synced {
                        state.synced = true;
                        self.store.sync_notify.notify_waiters();
                    }
                }
                (self.handler)(&obj);
            }
            Delta::Delete(obj) => {
                self.store.inner.write().objects.remove(&Store::key_of(&obj));
                (self.handler)(&obj);
            }
            Delta::Restart(objs) => {
                {
                    let mut state = self.store.inner.write();
                    state.objects = objs
                        .iter()
                        .map(|obj| (Store::key_of(obj), obj.clone()))
                        .collect();
                    state.synced = true;
                    self.store.sync_notify.notify_waiters();
                }
                for obj in &objs {
                    (self.handler)(obj);
                }
            }
        }
    }
}

/// Pumps a watch stream into an informer until the stop signal fires.
///
/// Stream errors are logged and retried after a pause, in line with the
/// expectation that the watch never terminates.
pub fn spawn_watch_stream<T, S>(informer: Informer<T>, stream: S, mut stop: watch::Receiver<bool>)
where
    T: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    S: Stream<Item = k8s::watcher::Result<k8s::watcher::Event<T>>> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::pin!(stream);
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                ev = stream.next() => match ev {
                    Some(Ok(ev)) => informer.handle_delta(ev.into()),
                    Some(Err(error)) => {
                        info!(%error, "Watch disconnected");
                        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                    }
                    None => return,
                },
            }
        }
    });
}

/// Supplies watch streams for informers when the controller runs against a
/// live API server. Absent in unit tests, which drive informers directly.
pub trait StreamFactory: Send + Sync {
    fn start_app_informer(&self, inf: &AppInformer, stop: watch::Receiver<bool>);
    fn start_namespace_informer(&self, inf: &Informer<k8s::Namespace>, stop: watch::Receiver<bool>);
}

/// The per-namespace bundle of watch caches sharing one stop signal.
pub struct AppInformer {
    pub namespace: String,
    pub configmaps: Informer<k8s::ConfigMap>,
    pub services: Informer<k8s::Service>,
    pub endpoints: Informer<k8s::Endpoints>,
    pub ingresses: Informer<k8s::Ingress>,
    pub routes: Option<Informer<k8s::Route>>,
    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
}

// === impl AppInformer ===

impl AppInformer {
    pub fn new(
        namespace: impl Into<String>,
        vs_queue: RateLimitingQueue<ServiceQueueKey>,
        with_routes: bool,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);

        let configmaps = {
            let queue = vs_queue.clone();
            Informer::new(move |cm: &k8s::ConfigMap| {
                if let Some(key) = crate::configmap::queue_key_for_config_map(cm) {
                    queue.add(key);
                }
            })
        };
        let services = {
            let queue = vs_queue.clone();
            Informer::new(move |svc: &k8s::Service| {
                if let Some(ns) = svc.namespace() {
                    queue.add(ServiceQueueKey::new(ns, svc.name_unchecked()));
                }
            })
        };
        let endpoints = {
            let queue = vs_queue.clone();
            Informer::new(move |ep: &k8s::Endpoints| {
                if let Some(ns) = ep.namespace() {
                    queue.add(ServiceQueueKey::new(ns, ep.name_unchecked()));
                }
            })
        };
        let ingresses = {
            let queue = vs_queue.clone();
            Informer::new(move |ing: &k8s::Ingress| {
                for key in crate::ingress::queue_keys_for_ingress(ing) {
                    queue.add(key);
                }
            })
        };
        let routes = with_routes.then(|| {
            let queue = vs_queue;
            Informer::new(move |route: &k8s::Route| {
                if let Some(ns) = route.namespace() {
                    queue.add(ServiceQueueKey::new(ns, route.spec.to.name.clone()));
                }
            })
        });

        Self {
            namespace: namespace.into(),
            configmaps,
            services,
            endpoints,
            ingresses,
            routes,
            stop_tx,
            started: AtomicBool::new(false),
        }
    }

    pub fn start(&self, factory: Option<&Arc<dyn StreamFactory>>) {
        if let Some(factory) = factory {
            factory.start_app_informer(self, self.stop_tx.subscribe());
            self.started.store(true, Ordering::Release);
        }
    }

    /// Resolves once every cache in the bundle has completed its first full
    /// list. Immediate when the bundle was never started (direct-drive mode).
    pub async fn wait_for_cache_sync(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        self.configmaps.store().wait_synced().await;
        self.services.store().wait_synced().await;
        self.endpoints.store().wait_synced().await;
        self.ingresses.store().wait_synced().await;
        if let Some(routes) = &self.routes {
            routes.store().wait_synced().await;
        }
    }

    /// Closes the shared stop signal; all stream workers exit.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}
