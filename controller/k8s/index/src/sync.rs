//! The virtual-server sync worker: the single writer of the resource,
//! profile, iRule, and data-group stores.

use crate::{backend::reason, AppInformer, Manager};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::Result;
use bigip_controller_core::{names, Member, NameRef, ResourceConfig, ResourceType, ServiceKey, ServiceQueueKey};
use bigip_controller_k8s_api as k8s;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Names of stored configs for one queue key, indexed by service port.
/// Entries that survive the sub-syncs are stale and get deleted.
pub(crate) type ResourceMap = HashMap<i32, Vec<String>>;

#[derive(Debug, Default)]
pub(crate) struct VsSyncStats {
    pub vs_found: usize,
    pub vs_updated: usize,
    pub vs_deleted: usize,
    pub cp_updated: usize,
    pub dg_updated: usize,
}

impl VsSyncStats {
    fn emit_needed(&self) -> bool {
        self.vs_updated > 0 || self.vs_deleted > 0 || self.cp_updated > 0 || self.dg_updated > 0
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum PoolBackendError {
    #[error("requested service backend '{0}' not of NodePort type")]
    IncorrectBackendServiceType(String),
    #[error("endpoints for service '{0}' not found")]
    EndpointsNotFound(String),
}

impl PoolBackendError {
    fn reason(&self) -> &'static str {
        match self {
            Self::IncorrectBackendServiceType(_) => reason::INCORRECT_BACKEND_SERVICE_TYPE,
            Self::EndpointsNotFound(_) => reason::ENDPOINTS_NOT_FOUND,
        }
    }
}

// === impl Manager ===

impl Manager {
    pub(crate) async fn virtual_server_worker(&self) {
        while self.process_next_virtual_server().await {}
    }

    pub(crate) async fn process_next_virtual_server(&self) -> bool {
        let Some(key) = self.vs_queue.get().await else {
            return false;
        };
        match self.sync_virtual_server(&key).await {
            Ok(()) => {
                self.vs_queue.forget(&key);
            }
            Err(error) => {
                warn!(key = %key, %error, "Virtual-server sync failed");
                self.vs_queue.add_rate_limited(key.clone());
            }
        }
        self.vs_queue.done(&key);
        true
    }

    pub(crate) async fn sync_virtual_server(&self, s_key: &ServiceQueueKey) -> Result<()> {
        let Some(app_inf) = self.get_namespace_informer(&s_key.namespace) else {
            // Namespaces are checked before enqueueing, so this is a stale event.
            warn!(
                namespace = %s_key.namespace,
                "Received an update for an item from an un-watched namespace"
            );
            return Ok(());
        };

        let svc = app_inf
            .services
            .store()
            .get(&s_key.namespace, &s_key.service_name);

        let svc_port_map: HashSet<i32> = svc
            .iter()
            .filter_map(|s| s.spec.as_ref())
            .filter_map(|spec| spec.ports.as_ref())
            .flatten()
            .map(|p| p.port)
            .collect();

        let mut rs_map = self.get_resources_for_key(s_key);

        let mut stats = VsSyncStats::default();
        self.sync_configmaps(&mut stats, s_key, &mut rs_map, &svc_port_map, svc.as_ref(), &app_inf)
            .await?;
        self.sync_ingresses(&mut stats, s_key, &mut rs_map, &svc_port_map, svc.as_ref(), &app_inf)
            .await?;
        if app_inf.routes.is_some() {
            self.sync_routes(&mut stats, s_key, &mut rs_map, &svc_port_map, svc.as_ref(), &app_inf)
                .await?;
        }

        if !rs_map.is_empty() {
            // Ports remain that no longer back any source resource.
            stats.vs_deleted += self.delete_unused_resources(s_key, &rs_map);
            self.delete_unused_routes();
        }
        debug!(
            updated = stats.vs_updated,
            found = stats.vs_found,
            deleted = stats.vs_deleted,
            "Synced virtual servers"
        );

        self.delete_unused_profiles(&s_key.namespace);

        if stats.emit_needed() {
            self.output_config();
        } else if self.vs_queue.is_empty()
            && self.ns_queue.is_empty()
            && !self.initial_state.load(Ordering::Acquire)
        {
            // Initial list is complete and nothing changed; emit once so the
            // writer sees the steady state.
            let resources = self.resources.lock();
            self.output_config_locked(&resources);
        }
        Ok(())
    }

    fn get_resources_for_key(&self, s_key: &ServiceQueueKey) -> ResourceMap {
        let resources = self.resources.lock();
        let mut rs_map = ResourceMap::new();
        resources.for_each(|key, cfg| {
            if key.namespace == s_key.namespace && key.service_name == s_key.service_name {
                rs_map
                    .entry(key.service_port)
                    .or_default()
                    .push(cfg.virtual_server.virtual_server_name.clone());
            }
        });
        rs_map
    }

    /// Common handling for ConfigMaps, Ingresses, and Routes. Returns
    /// whether the config belongs to this key plus found/updated counts;
    /// counts are only reported when the config is ours.
    pub(crate) fn handle_config_for_type(
        &self,
        rs_cfg: &mut ResourceConfig,
        s_key: &ServiceQueueKey,
        rs_map: &mut ResourceMap,
        rs_name: &str,
        svc_port_map: &HashSet<i32>,
        svc: Option<&k8s::Service>,
        app_inf: &AppInformer,
        curr_route_svc: Option<&str>,
    ) -> (bool, usize, usize) {
        let mut vs_found = 0;
        let mut vs_updated = 0;

        let Some(pl_idx) = rs_cfg.pool_index_for_service(&s_key.service_name) else {
            // Not ours: drop any pools bound to this service across every
            // stored copy of the resource.
            let mut resources = self.resources.lock();
            for (key, mut cfg) in resources.get_all_with_name(rs_name) {
                cfg.pools.retain(|p| p.service_name != s_key.service_name);
                resources.assign(key, rs_name.to_string(), cfg);
            }
            return (false, vs_found, vs_updated);
        };
        let pool = rs_cfg.pools[pl_idx].clone();
        let svc_key = ServiceKey {
            namespace: s_key.namespace.clone(),
            service_name: pool.service_name.clone(),
            service_port: pool.service_port,
        };

        // Matched: consume the candidate so it survives garbage collection.
        // For routes, only when the processed route still targets this
        // service; otherwise a deleted route would be rescued by a sibling
        // sharing its virtual name.
        if curr_route_svc.map_or(true, |route_svc| route_svc == s_key.service_name) {
            if let Some(list) = rs_map.get_mut(&pool.service_port) {
                if list.len() == 1 {
                    rs_map.remove(&pool.service_port);
                } else {
                    list.retain(|name| name != rs_name);
                }
            }
        }

        if !svc_port_map.contains(&pool.service_port) {
            info!(
                port = pool.service_port,
                service = %pool.service_name,
                "Port for service was not found"
            );
            if self.deactivate_virtual_server(&svc_key, rs_name, rs_cfg, pl_idx) {
                vs_updated += 1;
            }
        }

        let Some(svc) = svc else {
            // The service is gone; leave the virtual in place, deactivated.
            info!(service = %pool.service_name, "Service has not been found");
            if self.deactivate_virtual_server(&svc_key, rs_name, rs_cfg, pl_idx) {
                vs_updated += 1;
            }
            if names::is_ingress_vs_name(rs_name) {
                let msg = format!("Service '{}' has not been found.", pool.service_name);
                self.backend
                    .record_ingress_event(None, reason::SERVICE_NOT_FOUND, &msg, rs_name);
            }
            return (true, vs_found + 1, vs_updated);
        };

        vs_found += 1;
        let backend_result = if self.is_node_port() {
            self.update_pool_members_for_node_port(svc, &svc_key, rs_cfg, pl_idx)
        } else {
            self.update_pool_members_for_cluster(svc, &svc_key, rs_cfg, app_inf, pl_idx)
        };

        if self.save_virtual_server(&svc_key, rs_name, rs_cfg) {
            vs_updated += 1;
            if let Err(error) = &backend_result {
                if names::is_ingress_vs_name(rs_name) {
                    self.backend.record_ingress_event(
                        None,
                        error.reason(),
                        &error.to_string(),
                        rs_name,
                    );
                }
            }
        }

        (true, vs_found, vs_updated)
    }

    fn update_pool_members_for_node_port(
        &self,
        svc: &k8s::Service,
        svc_key: &ServiceKey,
        rs_cfg: &mut ResourceConfig,
        index: usize,
    ) -> Result<(), PoolBackendError> {
        let spec = svc.spec.as_ref();
        if spec.and_then(|s| s.type_.as_deref()) != Some("NodePort") {
            return Err(PoolBackendError::IncorrectBackendServiceType(
                svc_key.service_name.clone(),
            ));
        }
        for port_spec in spec.and_then(|s| s.ports.as_ref()).into_iter().flatten() {
            if port_spec.port == svc_key.service_port {
                let node_port = port_spec.node_port.unwrap_or_default();
                debug!(?svc_key, node_port, "Service backend matched");
                rs_cfg.meta_data.active = true;
                rs_cfg.meta_data.node_port = node_port;
                rs_cfg.pools[index].members = self.endpoints_for_node_port(node_port);
            }
        }
        Ok(())
    }

    fn update_pool_members_for_cluster(
        &self,
        svc: &k8s::Service,
        svc_key: &ServiceKey,
        rs_cfg: &mut ResourceConfig,
        app_inf: &AppInformer,
        index: usize,
    ) -> Result<(), PoolBackendError> {
        let Some(endpoints) = app_inf
            .endpoints
            .store()
            .get(&svc_key.namespace, &svc_key.service_name)
        else {
            return Err(PoolBackendError::EndpointsNotFound(format!(
                "{}/{}",
                svc_key.namespace, svc_key.service_name
            )));
        };
        let ports = svc.spec.as_ref().and_then(|s| s.ports.as_ref());
        for port_spec in ports.into_iter().flatten() {
            if port_spec.port == svc_key.service_port {
                let members = endpoints_for_service(port_spec.name.as_deref(), &endpoints);
                debug!(?svc_key, ?members, "Found endpoints for backend");
                rs_cfg.meta_data.active = true;
                rs_cfg.pools[index].members = members;
            }
        }
        Ok(())
    }

    fn deactivate_virtual_server(
        &self,
        svc_key: &ServiceKey,
        rs_name: &str,
        rs_cfg: &mut ResourceConfig,
        index: usize,
    ) -> bool {
        let mut resources = self.resources.lock();
        rs_cfg.meta_data.active = false;
        rs_cfg.pools[index].members.clear();
        let update = match resources.get(svc_key, rs_name) {
            Some(stored) => {
                let changed = stored != rs_cfg;
                if changed {
                    debug!(?svc_key, %rs_name, "Deactivating config for deleted backend");
                }
                changed
            }
            // Not stored yet: put in the virtual from the source resource.
            None => true,
        };
        if update {
            resources.assign(svc_key.clone(), rs_name.to_string(), rs_cfg.clone());
        }
        update
    }

    /// Persists the config iff it differs from the stored copy.
    pub(crate) fn save_virtual_server(
        &self,
        svc_key: &ServiceKey,
        rs_name: &str,
        rs_cfg: &ResourceConfig,
    ) -> bool {
        let mut resources = self.resources.lock();
        if let Some(stored) = resources.get(svc_key, rs_name) {
            if stored == rs_cfg {
                return false;
            }
            warn!(?svc_key, "Overwriting existing entry for backend");
        }
        resources.assign(svc_key.clone(), rs_name.to_string(), rs_cfg.clone());
        true
    }

    /// True once every pool of a multi-service resource has a stored copy.
    pub(crate) fn process_all_multi_svc(&self, num_pools: usize, rs_name: &str) -> bool {
        let resources = self.resources.lock();
        resources.get_all_with_name(rs_name).len() == num_pools
    }

    fn delete_unused_resources(&self, s_key: &ServiceQueueKey, rs_map: &ResourceMap) -> usize {
        let mut resources = self.resources.lock();
        let mut deleted = 0;
        for (port, names) in rs_map {
            let key = ServiceKey {
                namespace: s_key.namespace.clone(),
                service_name: s_key.service_name.clone(),
                service_port: *port,
            };
            for name in names {
                if resources.delete(&key, name) {
                    deleted += 1;
                }
            }
        }
        deleted
    }

    /// After a route deletion, prunes pools, rules, and client-ssl profile
    /// references the route contributed to the shared route virtuals.
    fn delete_unused_routes(&self) {
        let mut resources = self.resources.lock();
        let mut route_cfgs = Vec::new();
        resources.for_each(|key, cfg| {
            if cfg.meta_data.resource_type == ResourceType::Route {
                route_cfgs.push((key.clone(), cfg.clone()));
            }
        });

        for (key, mut cfg) in route_cfgs {
            let rs_name = cfg.virtual_server.virtual_server_name.clone();
            let mut doomed_pools = Vec::new();
            for (i, pool) in cfg.pools.iter().enumerate() {
                let pool_key = ServiceKey {
                    namespace: key.namespace.clone(),
                    service_name: pool.service_name.clone(),
                    service_port: pool.service_port,
                };
                if resources.get(&pool_key, &rs_name).is_none() {
                    doomed_pools.push((i, format!("/{}/{}", cfg.virtual_server.partition, pool.name)));
                }
            }
            if doomed_pools.is_empty() {
                resources.assign(key, rs_name, cfg);
                continue;
            }

            let mut route_name = None;
            for (_, pool_path) in &doomed_pools {
                for policy in cfg.policies.clone() {
                    let remaining: Vec<_> = policy
                        .rules
                        .iter()
                        .filter(|rule| {
                            let hit = rule
                                .actions
                                .first()
                                .map_or(false, |action| action.pool == *pool_path);
                            if hit {
                                route_name = names::route_name_from_rule(&rule.name)
                                    .map(str::to_string);
                            }
                            !hit
                        })
                        .cloned()
                        .collect();
                    if remaining.is_empty() {
                        cfg.remove_policy(&NameRef::new(&policy.name, &policy.partition));
                    } else if remaining.len() != policy.rules.len() {
                        let mut policy = policy;
                        policy.rules = remaining;
                        cfg.set_policy(policy);
                    }
                }
            }
            for (i, _) in doomed_pools.iter().rev() {
                cfg.pools.remove(*i);
            }
            if let Some(route_name) = &route_name {
                let profile = format!(
                    "{}/{}",
                    cfg.virtual_server.partition,
                    names::format_route_client_ssl_name(route_name)
                );
                cfg.virtual_server.remove_frontend_ssl_profile_name(&profile);
            }
            resources.assign(key, rs_name, cfg);
        }
    }

    /// Drops custom profiles of `namespace` that no live config references.
    fn delete_unused_profiles(&self, namespace: &str) {
        let resources = self.resources.lock();
        let mut profiles = self.custom_profiles.lock();
        profiles.retain(|key, profile| {
            if key.namespace != namespace {
                return true;
            }
            let mut found = false;
            resources.for_each(|_, cfg| {
                if key.resource_name == cfg.virtual_server.virtual_server_name
                    && cfg.virtual_server.references_profile(profile)
                {
                    found = true;
                }
            });
            found
        });
    }

    pub(crate) fn endpoints_for_node_port(&self, node_port: i32) -> Vec<Member> {
        self.nodes_from_cache()
            .into_iter()
            .map(|addr| Member::new(addr, node_port))
            .collect()
    }
}

/// Ready addresses of every subset port matching the service port's name.
fn endpoints_for_service(port_name: Option<&str>, endpoints: &k8s::Endpoints) -> Vec<Member> {
    let mut members = Vec::new();
    for subset in endpoints.subsets.iter().flatten() {
        for port in subset.ports.iter().flatten() {
            if port.name.as_deref() == port_name {
                for addr in subset.addresses.iter().flatten() {
                    members.push(Member::new(addr.ip.clone(), port.port));
                }
            }
        }
    }
    members
}
