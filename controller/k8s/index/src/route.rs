//! Route syncing: the shared HTTP/HTTPS route virtuals, TLS termination
//! handling, and the passthrough/re-encrypt data groups.

use crate::{
    ingress::PortStruct,
    informer::AppInformer,
    sync::{ResourceMap, VsSyncStats},
    Manager,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::Result;
use bigip_controller_core::{
    irules, names, Action, Condition, CustomProfile, CustomProfileContext, InternalDataGroup,
    NameRef, Policy, Pool, ProfileRef, ResourceConfig, ResourceType, Rule, SecretKey,
    ServiceQueueKey, Virtual, VirtualAddress, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT,
    DEFAULT_PARTITION,
};
use bigip_controller_k8s_api as k8s;
use k8s::ResourceExt;
use tracing::error;

pub(crate) const ROUTE_HTTP_VS_NAME: &str = "openshift_route_http";
pub(crate) const ROUTE_HTTPS_VS_NAME: &str = "openshift_route_https";
const DEFAULT_CLIENT_SSL_PROFILE: &str = "Common/clientssl";
const DEFAULT_SERVER_SSL_PROFILE_NAME: &str = "openshift_route_cluster_default-server-ssl";

fn route_pool_path(partition: &str, namespace: &str, service: &str) -> String {
    format!(
        "/{partition}/{}",
        names::format_route_pool_name(namespace, service)
    )
}

fn update_data_group_for_route(
    route: &k8s::Route,
    partition: &str,
    dg_name: &str,
    dg_map: &mut HashMap<NameRef, InternalDataGroup>,
) {
    let Some(namespace) = route.namespace() else {
        return;
    };
    let host = &route.spec.host;
    if host.is_empty() {
        return;
    }
    dg_map
        .entry(NameRef::new(dg_name, partition))
        .or_insert_with(|| InternalDataGroup::new(dg_name, partition))
        .add_or_update_record(host, &route_pool_path(partition, &namespace, &route.spec.to.name));
}

// === impl Manager ===

impl Manager {
    /// Routes across all watched namespaces in their global precedence
    /// order: creation timestamp ascending, ties broken by name.
    pub(crate) fn ordered_routes(&self) -> Vec<k8s::Route> {
        let mut routes = Vec::new();
        for inf in self.app_informers() {
            if let Some(route_inf) = &inf.routes {
                routes.extend(route_inf.store().all());
            }
        }
        routes.sort_by(|a, b| {
            (a.metadata.creation_timestamp.as_ref().map(|t| t.0), a.name_unchecked())
                .cmp(&(b.metadata.creation_timestamp.as_ref().map(|t| t.0), b.name_unchecked()))
        });
        routes
    }

    pub(crate) async fn sync_routes(
        &self,
        stats: &mut VsSyncStats,
        s_key: &ServiceQueueKey,
        rs_map: &mut ResourceMap,
        svc_port_map: &HashSet<i32>,
        svc: Option<&k8s::Service>,
        app_inf: &AppInformer,
    ) -> Result<()> {
        let Some(route_config) = self.route_config.clone() else {
            return Ok(());
        };

        // The data groups span namespaces; rebuild them from every route
        // while syncing this namespace's virtuals.
        let mut dg_map: HashMap<NameRef, InternalDataGroup> = HashMap::new();
        for route in self.ordered_routes() {
            if let Some(tls) = &route.spec.tls {
                match tls.termination {
                    k8s::TlsTermination::Passthrough => update_data_group_for_route(
                        &route,
                        DEFAULT_PARTITION,
                        irules::PASSTHROUGH_HOSTS_DG_NAME,
                        &mut dg_map,
                    ),
                    k8s::TlsTermination::Reencrypt => update_data_group_for_route(
                        &route,
                        DEFAULT_PARTITION,
                        irules::REENCRYPT_HOSTS_DG_NAME,
                        &mut dg_map,
                    ),
                    k8s::TlsTermination::Edge => {}
                }
            }
            if route.namespace().as_deref() != Some(s_key.namespace.as_str()) {
                continue;
            }

            for ps in [
                PortStruct {
                    protocol: "http",
                    port: DEFAULT_HTTP_PORT,
                },
                PortStruct {
                    protocol: "https",
                    port: DEFAULT_HTTPS_PORT,
                },
            ] {
                let mut rs_cfg = self.create_rs_config_from_route(&route, &route_config.vs_addr, &ps);

                if ps.port == DEFAULT_HTTPS_PORT {
                    if let Some(tls) = &route.spec.tls {
                        match tls.termination {
                            k8s::TlsTermination::Edge => {
                                self.set_client_ssl_profile(stats, s_key, &mut rs_cfg, &route);
                            }
                            k8s::TlsTermination::Reencrypt => {
                                self.set_client_ssl_profile(stats, s_key, &mut rs_cfg, &route);
                                self.set_server_ssl_profile(stats, s_key, &mut rs_cfg, &route);
                            }
                            k8s::TlsTermination::Passthrough => {}
                        }
                    }
                }

                let rs_name = rs_cfg.virtual_server.virtual_server_name.clone();
                let (ours, found, updated) = self.handle_config_for_type(
                    &mut rs_cfg,
                    s_key,
                    rs_map,
                    &rs_name,
                    svc_port_map,
                    svc,
                    app_inf,
                    Some(&route.spec.to.name),
                );
                if !ours {
                    continue;
                }
                stats.vs_found += found;
                stats.vs_updated += updated;

                // All routes sharing a protocol share this virtual; force
                // every stored copy in the partition into the same state.
                let mut resources = self.resources.lock();
                for (key, cfg) in resources.get_all_with_name(&rs_name) {
                    if cfg.virtual_server.partition == rs_cfg.virtual_server.partition
                        && cfg != rs_cfg
                    {
                        resources.assign(key, rs_name.clone(), rs_cfg.clone());
                    }
                }
            }
        }

        self.update_route_data_groups(stats, dg_map);
        Ok(())
    }

    /// Builds (or extends) the shared route virtual for one protocol with
    /// this route's pool and forwarding rule.
    fn create_rs_config_from_route(
        &self,
        route: &k8s::Route,
        vs_addr: &str,
        ps: &PortStruct,
    ) -> ResourceConfig {
        let namespace = route.namespace().unwrap_or_default();
        let https = ps.port == DEFAULT_HTTPS_PORT;
        let vs_name = if https {
            ROUTE_HTTPS_VS_NAME
        } else {
            ROUTE_HTTP_VS_NAME
        };

        let existing = {
            let resources = self.resources.lock();
            resources
                .get_all_with_name(vs_name)
                .into_iter()
                .next()
                .map(|(_, cfg)| cfg)
        };
        let mut cfg = existing.unwrap_or_else(|| {
            ResourceConfig::new(ResourceType::Route, Virtual::new(vs_name, DEFAULT_PARTITION))
        });
        cfg.virtual_server.virtual_address = Some(VirtualAddress {
            bind_addr: vs_addr.to_string(),
            port: ps.port,
        });

        let service = &route.spec.to.name;
        let service_port = route
            .spec
            .port
            .as_ref()
            .and_then(|p| p.target_port.parse().ok())
            .unwrap_or(if route.spec.tls.is_some() {
                DEFAULT_HTTPS_PORT
            } else {
                DEFAULT_HTTP_PORT
            });
        let pool_name = names::format_route_pool_name(&namespace, service);
        if !cfg.pools.iter().any(|p| p.name == pool_name) {
            cfg.pools.push(Pool {
                name: pool_name.clone(),
                service_name: service.clone(),
                service_port,
                members: Vec::new(),
            });
        }

        let termination = route.spec.tls.as_ref().map(|tls| tls.termination);
        if https
            && matches!(
                termination,
                Some(k8s::TlsTermination::Passthrough) | Some(k8s::TlsTermination::Reencrypt)
            )
        {
            cfg.virtual_server.add_irule(format!(
                "/{}/{}",
                DEFAULT_PARTITION,
                irules::SSL_PASSTHROUGH_IRULE_NAME
            ));
        }

        // Passthrough is routed by SNI alone; everything else gets an L7
        // forwarding rule on the matching virtual.
        let add_rule = match termination {
            None => !https,
            Some(k8s::TlsTermination::Passthrough) => false,
            Some(_) => {
                https
                    || route
                        .spec
                        .tls
                        .as_ref()
                        .and_then(|tls| tls.insecure_edge_termination_policy.as_deref())
                        == Some("Allow")
            }
        };
        if add_rule {
            let rule_name = names::format_route_rule_name(&namespace, &route.name_unchecked());
            let mut conditions = Vec::new();
            if !route.spec.host.is_empty() {
                conditions.push(Condition::host(&route.spec.host));
            }
            if let Some(path) = route.spec.path.as_deref() {
                for (i, segment) in path.split('/').filter(|s| !s.is_empty()).enumerate() {
                    conditions.push(Condition::path_segment(i as i32 + 1, segment));
                }
            }
            let action = Action::forward_to(format!(
                "/{}/{pool_name}",
                cfg.virtual_server.partition
            ));

            let mut policy = cfg
                .policies
                .iter()
                .find(|p| p.name == vs_name)
                .cloned()
                .unwrap_or_else(|| Policy::forwarding(vs_name, DEFAULT_PARTITION));
            match policy.rules.iter_mut().find(|r| r.name == rule_name) {
                Some(rule) => {
                    rule.actions = vec![action];
                    rule.conditions = conditions;
                }
                None => {
                    let ordinal = policy.rules.len();
                    policy.rules.push(Rule {
                        name: rule_name,
                        ordinal,
                        actions: vec![action],
                        conditions,
                    });
                }
            }
            cfg.set_policy(policy);
        }

        cfg
    }

    fn set_client_ssl_profile(
        &self,
        stats: &mut VsSyncStats,
        s_key: &ServiceQueueKey,
        rs_cfg: &mut ResourceConfig,
        route: &k8s::Route,
    ) {
        let mut profile_name = DEFAULT_CLIENT_SSL_PROFILE.to_string();
        let tls = route.spec.tls.as_ref();
        let cert = tls.and_then(|t| t.certificate.as_deref()).unwrap_or_default();
        let key = tls.and_then(|t| t.key.as_deref()).unwrap_or_default();
        if !cert.is_empty() && !key.is_empty() {
            let profile = CustomProfile {
                name: names::format_route_client_ssl_name(&route.name_unchecked()),
                partition: rs_cfg.virtual_server.partition.clone(),
                context: CustomProfileContext::Client,
                cert: cert.to_string(),
                key: key.to_string(),
                server_name: Some(route.spec.host.clone()),
            };
            let skey = SecretKey {
                name: profile.name.clone(),
                namespace: s_key.namespace.clone(),
                resource_name: rs_cfg.virtual_server.virtual_server_name.clone(),
            };
            profile_name = format!("{}/{}", profile.partition, profile.name);
            let mut profiles = self.custom_profiles.lock();
            if let Some(existing) = profiles.get(&skey) {
                if *existing != profile {
                    stats.cp_updated += 1;
                }
            }
            profiles.insert(skey, profile);
        }
        rs_cfg
            .virtual_server
            .add_frontend_ssl_profile_name(profile_name);
    }

    fn set_server_ssl_profile(
        &self,
        stats: &mut VsSyncStats,
        s_key: &ServiceQueueKey,
        rs_cfg: &mut ResourceConfig,
        route: &k8s::Route,
    ) {
        let destination_ca = route
            .spec
            .tls
            .as_ref()
            .and_then(|t| t.destination_ca_certificate.as_deref())
            .unwrap_or_default();
        if !destination_ca.is_empty() {
            let profile = ProfileRef {
                name: names::format_route_server_ssl_name(
                    &s_key.namespace,
                    &route.name_unchecked(),
                ),
                partition: rs_cfg.virtual_server.partition.clone(),
                context: CustomProfileContext::Server,
            };
            let cp = CustomProfile::from_cert(&profile, destination_ca);
            let skey = SecretKey {
                name: cp.name.clone(),
                namespace: s_key.namespace.clone(),
                resource_name: rs_cfg.virtual_server.virtual_server_name.clone(),
            };
            {
                let mut profiles = self.custom_profiles.lock();
                if let Some(existing) = profiles.get(&skey) {
                    if *existing != cp {
                        stats.cp_updated += 1;
                    }
                }
                profiles.insert(skey, cp);
            }
            rs_cfg.virtual_server.add_or_update_profile(profile);
        } else {
            let (profile, added) = self.load_default_cert(
                &s_key.namespace,
                &rs_cfg.virtual_server.virtual_server_name,
            );
            if let Some(profile) = profile {
                rs_cfg.virtual_server.add_or_update_profile(profile);
            }
            if added {
                stats.cp_updated += 1;
            }
        }
    }

    /// Materializes a server-SSL profile from the cluster default CA. The
    /// file is read once per namespace; later calls reuse the stored profile.
    fn load_default_cert(&self, namespace: &str, rs_name: &str) -> (Option<ProfileRef>, bool) {
        let profile = ProfileRef {
            name: DEFAULT_SERVER_SSL_PROFILE_NAME.to_string(),
            partition: DEFAULT_PARTITION.to_string(),
            context: CustomProfileContext::Server,
        };
        let skey = SecretKey {
            name: profile.name.clone(),
            namespace: namespace.to_string(),
            resource_name: rs_name.to_string(),
        };
        let mut profiles = self.custom_profiles.lock();
        if profiles.contains_key(&skey) {
            return (Some(profile), false);
        }
        match self.backend.read_default_ca() {
            Ok(ca) => {
                profiles.insert(skey, CustomProfile::from_cert(&profile, ca));
                (Some(profile), true)
            }
            Err(err) => {
                error!(error = %err, "Unable to load default cluster certificate");
                (None, false)
            }
        }
    }

    /// Swaps in the freshly-built route data groups, counting a change per
    /// group whose record set differs.
    fn update_route_data_groups(
        &self,
        stats: &mut VsSyncStats,
        mut dg_map: HashMap<NameRef, InternalDataGroup>,
    ) {
        let mut dgs = self.int_dg.lock();
        for dg_name in [
            irules::PASSTHROUGH_HOSTS_DG_NAME,
            irules::REENCRYPT_HOSTS_DG_NAME,
        ] {
            let nr = NameRef::new(dg_name, DEFAULT_PARTITION);
            let fresh = dg_map
                .remove(&nr)
                .unwrap_or_else(|| InternalDataGroup::new(dg_name, DEFAULT_PARTITION));
            let changed = dgs.get(&nr).map_or(!fresh.records.is_empty(), |old| *old != fresh);
            if changed {
                stats.dg_updated += 1;
            }
            dgs.insert(nr, fresh);
        }
    }
}
