//! Ingress syncing: per-port virtual construction, TLS handling, health
//! monitors, and status reflection.

use crate::{
    backend::reason,
    informer::{AppInformer, Store},
    sync::{ResourceMap, VsSyncStats},
    Manager, BALANCE_ANNOTATION, BIND_ADDR_ANNOTATION, HTTPS_PORT_ANNOTATION,
    HTTP_PORT_ANNOTATION, INGRESS_ALLOW_HTTP_ANNOTATION, INGRESS_HEALTH_MONITOR_ANNOTATION,
    INGRESS_SSL_REDIRECT_ANNOTATION, PARTITION_ANNOTATION,
};
use ahash::AHashSet as HashSet;
use anyhow::Result;
use bigip_controller_core::{
    irules, names, Action, Condition, Monitor, Policy, Pool, ResourceConfig, ResourceType, Rule,
    ServiceQueueKey, Virtual, VirtualAddress, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT,
    DEFAULT_PARTITION,
};
use bigip_controller_k8s_api as k8s;
use k8s::ResourceExt;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

#[derive(Clone, Debug)]
pub(crate) struct PortStruct {
    pub protocol: &'static str,
    pub port: i32,
}

/// A health monitor requested via the Ingress annotation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngressHealthMonitor {
    path: String,
    interval: i32,
    timeout: i32,
    #[serde(default)]
    send: Option<String>,
}

/// One queue key per distinct backend service the Ingress references.
pub(crate) fn queue_keys_for_ingress(ing: &k8s::Ingress) -> Vec<ServiceQueueKey> {
    let Some(namespace) = ing.namespace() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    let mut push = |service: &str| {
        if seen.insert(service.to_string()) {
            keys.push(ServiceQueueKey::new(namespace.clone(), service));
        }
    };
    if let Some(spec) = &ing.spec {
        if let Some(backend) = spec.default_backend.as_ref().and_then(|b| b.service.as_ref()) {
            push(&backend.name);
        }
        for rule in spec.rules.iter().flatten() {
            for path in rule.http.iter().flat_map(|h| h.paths.iter()) {
                if let Some(svc) = path.backend.service.as_ref() {
                    push(&svc.name);
                }
            }
        }
    }
    keys
}

fn get_boolean_annotation(ing: &k8s::Ingress, key: &str, default: bool) -> bool {
    match ing.annotations().get(key) {
        None => default,
        Some(val) => val.parse().unwrap_or_else(|_| {
            error!(%val, %key, "Unable to parse boolean annotation value");
            default
        }),
    }
}

fn get_port_annotation(ing: &k8s::Ingress, key: &str, default: i32) -> i32 {
    ing.annotations()
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Resolves a backend port to a number, looking named ports up on the
/// Service.
fn resolve_backend_port(
    port: Option<&k8s::ServiceBackendPort>,
    service: &str,
    namespace: &str,
    services: &Store<k8s::Service>,
) -> Option<i32> {
    let port = port?;
    if let Some(number) = port.number {
        return Some(number);
    }
    let name = port.name.as_deref()?;
    let svc = services.get(namespace, service)?;
    svc.spec?
        .ports?
        .iter()
        .find(|p| p.name.as_deref() == Some(name))
        .map(|p| p.port)
}

pub(crate) fn create_rs_config_from_ingress(
    ing: &k8s::Ingress,
    namespace: &str,
    services: &Store<k8s::Service>,
    port: &PortStruct,
) -> Option<ResourceConfig> {
    if let Some(class) = ing.annotations().get(INGRESS_CLASS_ANNOTATION) {
        if !class.is_empty() && class != "f5" {
            return None;
        }
    }
    let spec = ing.spec.as_ref()?;

    let vs_name = names::format_ingress_vs_name(namespace, &ing.name_unchecked(), port.protocol);
    let partition = ing
        .annotations()
        .get(PARTITION_ANNOTATION)
        .cloned()
        .unwrap_or_else(|| DEFAULT_PARTITION.to_string());

    let mut virtual_server = Virtual::new(&vs_name, &partition);
    if let Some(balance) = ing.annotations().get(BALANCE_ANNOTATION) {
        virtual_server.balance = balance.clone();
    }
    virtual_server.virtual_address = Some(VirtualAddress {
        bind_addr: ing
            .annotations()
            .get(BIND_ADDR_ANNOTATION)
            .cloned()
            .unwrap_or_default(),
        port: port.port,
    });

    let mut cfg = ResourceConfig::new(ResourceType::Ingress, virtual_server);

    if let Some(backend) = spec.default_backend.as_ref().and_then(|b| b.service.as_ref()) {
        let service_port =
            resolve_backend_port(backend.port.as_ref(), &backend.name, namespace, services)?;
        cfg.pools.push(Pool {
            name: names::format_ingress_pool_name(namespace, &backend.name),
            service_name: backend.name.clone(),
            service_port,
            members: Vec::new(),
        });
        return Some(cfg);
    }

    // Multi-service: one pool per distinct backend plus a forwarding policy.
    let mut policy = Policy::forwarding(&vs_name, &partition);
    for rule in spec.rules.iter().flatten() {
        for path in rule.http.iter().flat_map(|h| h.paths.iter()) {
            let Some(backend) = path.backend.service.as_ref() else {
                continue;
            };
            let Some(service_port) =
                resolve_backend_port(backend.port.as_ref(), &backend.name, namespace, services)
            else {
                continue;
            };
            let pool_name = names::format_ingress_pool_name(namespace, &backend.name);
            if !cfg.pools.iter().any(|p| p.name == pool_name) {
                cfg.pools.push(Pool {
                    name: pool_name.clone(),
                    service_name: backend.name.clone(),
                    service_port,
                    members: Vec::new(),
                });
            }

            let mut conditions = Vec::new();
            if let Some(host) = rule.host.as_deref().filter(|h| !h.is_empty()) {
                conditions.push(Condition::host(host));
            }
            if let Some(path) = path.path.as_deref() {
                for (i, segment) in path.split('/').filter(|s| !s.is_empty()).enumerate() {
                    conditions.push(Condition::path_segment(i as i32 + 1, segment));
                }
            }
            let ordinal = policy.rules.len();
            policy.rules.push(Rule {
                name: format!("{vs_name}_rule_{ordinal}"),
                ordinal,
                actions: vec![Action::forward_to(format!("/{partition}/{pool_name}"))],
                conditions,
            });
        }
    }
    if cfg.pools.is_empty() {
        return None;
    }
    if !policy.rules.is_empty() {
        cfg.set_policy(policy);
    }
    Some(cfg)
}

// === impl Manager ===

impl Manager {
    /// The ports an Ingress requires, per its TLS section and annotations.
    pub(crate) fn virtual_ports(&self, ing: &k8s::Ingress) -> Vec<PortStruct> {
        let http_port = get_port_annotation(ing, HTTP_PORT_ANNOTATION, DEFAULT_HTTP_PORT);
        let https_port = get_port_annotation(ing, HTTPS_PORT_ANNOTATION, DEFAULT_HTTPS_PORT);
        let ssl_redirect = get_boolean_annotation(ing, INGRESS_SSL_REDIRECT_ANNOTATION, true);
        let allow_http = get_boolean_annotation(ing, INGRESS_ALLOW_HTTP_ANNOTATION, false);

        let http = PortStruct {
            protocol: "http",
            port: http_port,
        };
        let https = PortStruct {
            protocol: "https",
            port: https_port,
        };
        let has_tls = ing
            .spec
            .as_ref()
            .and_then(|s| s.tls.as_ref())
            .map_or(false, |tls| !tls.is_empty());
        if has_tls {
            if ssl_redirect || allow_http {
                vec![http, https]
            } else {
                vec![https]
            }
        } else {
            vec![http]
        }
    }

    pub(crate) async fn sync_ingresses(
        &self,
        stats: &mut VsSyncStats,
        s_key: &ServiceQueueKey,
        rs_map: &mut ResourceMap,
        svc_port_map: &HashSet<i32>,
        svc: Option<&k8s::Service>,
        app_inf: &AppInformer,
    ) -> Result<()> {
        for ing in app_inf.ingresses.store().by_namespace(&s_key.namespace) {
            for port in self.virtual_ports(&ing) {
                let Some(mut rs_cfg) = create_rs_config_from_ingress(
                    &ing,
                    &s_key.namespace,
                    app_inf.services.store(),
                    &port,
                ) else {
                    continue;
                };

                if self.handle_ingress_tls(&mut rs_cfg, &ing).await {
                    stats.cp_updated += 1;
                }

                let rs_name = rs_cfg.virtual_server.virtual_server_name.clone();
                if let Some(hm) = ing.annotations().get(INGRESS_HEALTH_MONITOR_ANNOTATION) {
                    match serde_json::from_str::<Vec<IngressHealthMonitor>>(hm) {
                        Err(parse_err) => {
                            let msg = format!(
                                "Unable to parse health monitor JSON array '{hm}': {parse_err}"
                            );
                            error!("{msg}");
                            self.backend.record_ingress_event(
                                Some(&ing),
                                reason::INVALID_DATA,
                                &msg,
                                &rs_name,
                            );
                        }
                        Ok(monitors) => {
                            let single = ing
                                .spec
                                .as_ref()
                                .map_or(false, |s| s.default_backend.is_some());
                            if single {
                                handle_single_service_health_monitors(&mut rs_cfg, &monitors);
                            } else {
                                handle_multi_service_health_monitors(&ing, &mut rs_cfg, &monitors);
                            }
                        }
                    }
                    rs_cfg.sort_monitors();
                }

                // Keep policies identical across every stored copy of this
                // virtual (multi-service Ingresses store one copy per key).
                {
                    let mut resources = self.resources.lock();
                    for (key, mut cfg) in resources.get_all_with_name(&rs_name) {
                        for policy in rs_cfg.policies.clone() {
                            if policy.name == rs_name {
                                cfg.set_policy(policy);
                            }
                        }
                        resources.assign(key, rs_name.clone(), cfg);
                    }
                }

                let (ours, found, mut updated) = self.handle_config_for_type(
                    &mut rs_cfg,
                    s_key,
                    rs_map,
                    &rs_name,
                    svc_port_map,
                    svc,
                    app_inf,
                    None,
                );
                if !ours {
                    continue;
                }
                // Hold back the emission while a multi-service build-up is
                // still missing pools.
                if updated > 0 && !self.process_all_multi_svc(rs_cfg.pools.len(), &rs_name) {
                    updated -= 1;
                }
                stats.vs_found += found;
                stats.vs_updated += updated;
                if updated > 0 {
                    let msg = format!("Created a ResourceConfig '{rs_name}' for the Ingress.");
                    self.backend.record_ingress_event(
                        Some(&ing),
                        reason::RESOURCE_CONFIGURED,
                        &msg,
                        "",
                    );
                }

                self.set_ingress_status(&ing, &rs_cfg).await;
            }
        }
        Ok(())
    }

    /// TLS for one Ingress virtual: SSL profiles on the HTTPS port, the
    /// redirect iRule on the HTTP port. Returns whether a custom profile
    /// was updated.
    async fn handle_ingress_tls(&self, rs_cfg: &mut ResourceConfig, ing: &k8s::Ingress) -> bool {
        let tls = match ing.spec.as_ref().and_then(|s| s.tls.as_ref()) {
            Some(tls) if !tls.is_empty() => tls,
            _ => return false,
        };
        let Some(va) = rs_cfg.virtual_server.virtual_address.clone() else {
            return false;
        };
        if va.bind_addr.is_empty() {
            // Pool-only mode.
            return false;
        }

        let https_port = get_port_annotation(ing, HTTPS_PORT_ANNOTATION, DEFAULT_HTTPS_PORT);
        if va.port == https_port {
            let namespace = ing.namespace().unwrap_or_default();
            let mut updated = false;
            for entry in tls {
                let Some(secret_name) = entry.secret_name.as_deref() else {
                    continue;
                };
                let secret = match self.backend.get_secret(&namespace, secret_name).await {
                    Ok(secret) => secret,
                    Err(error) => {
                        info!(
                            %secret_name,
                            %error,
                            "Couldn't find Secret, parsing name as a profile path"
                        );
                        rs_cfg.virtual_server.add_frontend_ssl_profile_name(
                            names::format_ingress_ssl_profile_name(secret_name),
                        );
                        continue;
                    }
                };
                match self.handle_ssl_profile(
                    &rs_cfg.virtual_server.virtual_server_name.clone(),
                    &rs_cfg.virtual_server.partition.clone(),
                    &secret,
                    &namespace,
                ) {
                    Ok(cp_updated) => updated = updated || cp_updated,
                    Err(error) => {
                        warn!(%error, "Invalid TLS Secret");
                        continue;
                    }
                }
                let path = format!("{}/{}", rs_cfg.virtual_server.partition, secret_name);
                rs_cfg
                    .virtual_server
                    .add_frontend_ssl_profile_name(names::format_ingress_ssl_profile_name(&path));
            }
            return updated;
        }

        // The HTTP virtual: redirect or allow, per annotations.
        let ssl_redirect = get_boolean_annotation(ing, INGRESS_SSL_REDIRECT_ANNOTATION, true);
        let allow_http = get_boolean_annotation(ing, INGRESS_ALLOW_HTTP_ANNOTATION, false);
        if ssl_redirect {
            debug!("TLS: Applying HTTP redirect iRule");
            let mut rule_name =
                format!("/{}/{}", DEFAULT_PARTITION, irules::HTTP_REDIRECT_IRULE_NAME);
            if https_port != DEFAULT_HTTPS_PORT {
                rule_name = format!("{rule_name}_{https_port}");
                self.add_irule(
                    &format!("{}_{https_port}", irules::HTTP_REDIRECT_IRULE_NAME),
                    DEFAULT_PARTITION,
                    irules::http_redirect_irule(https_port),
                );
            }
            rs_cfg.virtual_server.add_irule(rule_name);
        } else if allow_http {
            debug!("TLS: Not applying any policies");
        }
        false
    }

    /// Materializes a client-SSL profile from a Secret. The first install is
    /// not reported as an update; the initial emission after startup already
    /// carries it. Overwriting a differing profile is.
    pub(crate) fn handle_ssl_profile(
        &self,
        rs_name: &str,
        partition: &str,
        secret: &k8s::Secret,
        namespace: &str,
    ) -> Result<bool> {
        use bigip_controller_core::{CustomProfile, CustomProfileContext, SecretKey};

        let name = secret.name_unchecked();
        let data = secret.data.as_ref();
        let cert = data
            .and_then(|d| d.get("tls.crt"))
            .ok_or_else(|| anyhow::anyhow!("invalid Secret '{name}': 'tls.crt' field not specified"))?;
        let key = data
            .and_then(|d| d.get("tls.key"))
            .ok_or_else(|| anyhow::anyhow!("invalid Secret '{name}': 'tls.key' field not specified"))?;

        let profile = CustomProfile {
            name: name.clone(),
            partition: partition.to_string(),
            context: CustomProfileContext::Client,
            cert: String::from_utf8_lossy(&cert.0).into_owned(),
            key: String::from_utf8_lossy(&key.0).into_owned(),
            server_name: None,
        };
        let skey = SecretKey {
            name,
            namespace: namespace.to_string(),
            resource_name: rs_name.to_string(),
        };
        let mut profiles = self.custom_profiles.lock();
        match profiles.get(&skey) {
            Some(existing) if *existing == profile => Ok(false),
            Some(_) => {
                profiles.insert(skey, profile);
                Ok(true)
            }
            None => {
                profiles.insert(skey, profile);
                Ok(false)
            }
        }
    }

    /// Reflects the bind address onto the Ingress status, swallowing the
    /// conflicts that multi-service syncs race into.
    async fn set_ingress_status(&self, ing: &k8s::Ingress, rs_cfg: &ResourceConfig) {
        let Some(bind_addr) = rs_cfg
            .virtual_server
            .virtual_address
            .as_ref()
            .map(|va| va.bind_addr.clone())
            .filter(|addr| !addr.is_empty())
        else {
            return;
        };

        let mut ing = ing.clone();
        let lb_ingress = k8s::LoadBalancerIngress {
            ip: Some(bind_addr.clone()),
            ..Default::default()
        };
        let status = ing.status.get_or_insert_with(Default::default);
        let lb = status.load_balancer.get_or_insert_with(Default::default);
        match lb.ingress.as_mut() {
            None => lb.ingress = Some(vec![lb_ingress]),
            Some(entries) if entries.is_empty() => entries.push(lb_ingress),
            Some(entries) => {
                if entries[0].ip.as_deref() == Some(bind_addr.as_str()) {
                    return;
                }
                entries[0] = lb_ingress;
            }
        }

        if let Err(error) = self.backend.update_ingress_status(&ing).await {
            if error.to_string().contains("object has been modified") {
                return;
            }
            let warning = format!(
                "Error when setting Ingress status IP for virtual server {}: {error}",
                rs_cfg.virtual_server.virtual_server_name
            );
            warn!("{warning}");
            self.backend
                .record_ingress_event(Some(&ing), reason::STATUS_IP_ERROR, &warning, "");
        }
    }
}

fn monitor_from(request: &IngressHealthMonitor, name: String, partition: &str) -> Monitor {
    Monitor {
        name,
        partition: partition.to_string(),
        protocol: "http".to_string(),
        interval: request.interval,
        timeout: request.timeout,
        send: request.send.clone(),
    }
}

fn handle_single_service_health_monitors(
    rs_cfg: &mut ResourceConfig,
    monitors: &[IngressHealthMonitor],
) {
    let partition = rs_cfg.virtual_server.partition.clone();
    let pool_name = rs_cfg.pools[0].name.clone();
    for (i, request) in monitors.iter().enumerate() {
        rs_cfg.set_monitor(monitor_from(request, format!("{pool_name}_{i}_http"), &partition));
    }
}

/// Matches each monitor's `host/path` against the Ingress rules to find the
/// backing pool.
fn handle_multi_service_health_monitors(
    ing: &k8s::Ingress,
    rs_cfg: &mut ResourceConfig,
    monitors: &[IngressHealthMonitor],
) {
    let Some(namespace) = ing.namespace() else {
        return;
    };
    let partition = rs_cfg.virtual_server.partition.clone();
    for (i, request) in monitors.iter().enumerate() {
        let (host, uri) = match request.path.split_once('/') {
            Some((host, uri)) => (host, format!("/{uri}")),
            None => (request.path.as_str(), "/".to_string()),
        };
        let mut matched = None;
        for rule in ing.spec.iter().flat_map(|s| s.rules.iter().flatten()) {
            if rule.host.as_deref() != Some(host) {
                continue;
            }
            for path in rule.http.iter().flat_map(|h| h.paths.iter()) {
                if path.path.as_deref().unwrap_or("/") == uri {
                    matched = path.backend.service.as_ref().map(|s| s.name.clone());
                }
            }
        }
        let Some(service) = matched else {
            warn!(path = %request.path, "Health monitor path matched no Ingress rule");
            continue;
        };
        let pool_name = names::format_ingress_pool_name(&namespace, &service);
        if rs_cfg.pools.iter().any(|p| p.name == pool_name) {
            rs_cfg.set_monitor(monitor_from(request, format!("{pool_name}_{i}_http"), &partition));
        }
    }
}
