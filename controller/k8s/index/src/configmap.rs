//! Parsing and syncing of virtual-server ConfigMaps.

use crate::{
    informer::AppInformer,
    sync::{ResourceMap, VsSyncStats},
    Manager, VS_BIND_ADDR_ANNOTATION,
};
use ahash::AHashSet as HashSet;
use anyhow::{Context, Result};
use bigip_controller_core::{
    names, Monitor, Pool, ResourceConfig, ResourceType, ServiceQueueKey, Virtual, VirtualAddress,
    DEFAULT_PARTITION,
};
use bigip_controller_k8s_api as k8s;
use k8s::ResourceExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

/// The `data` blob of an `f5type: virtual-server` ConfigMap.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VsBlob {
    virtual_server: VsDefinition,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VsDefinition {
    frontend: VsFrontend,
    backend: VsBackend,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct VsFrontend {
    partition: Option<String>,
    virtual_address: Option<VsVirtualAddress>,
    balance: Option<String>,
    mode: Option<String>,
    ssl_profile: Option<VsSslProfile>,
    iapp: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VsVirtualAddress {
    bind_addr: String,
    port: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct VsSslProfile {
    f5_profile_name: Option<String>,
    f5_profile_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VsBackend {
    service_name: String,
    service_port: i32,
    #[serde(default)]
    health_monitors: Vec<VsHealthMonitor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VsHealthMonitor {
    protocol: String,
    interval: i32,
    timeout: i32,
    #[serde(default)]
    send: Option<String>,
}

pub(crate) fn parse_config_map(cm: &k8s::ConfigMap) -> Result<ResourceConfig> {
    let namespace = cm.namespace().context("configmap must have a namespace")?;
    let name = cm.name_unchecked();
    let data = cm
        .data
        .as_ref()
        .and_then(|d| d.get("data"))
        .context("missing 'data' key")?;
    let blob: VsBlob = serde_json::from_str(data).context("parsing virtual-server blob")?;
    let vs = blob.virtual_server;

    let vs_name = names::format_config_map_vs_name(&namespace, &name);
    let partition = vs
        .frontend
        .partition
        .unwrap_or_else(|| DEFAULT_PARTITION.to_string());

    let mut virtual_server = Virtual::new(&vs_name, partition);
    if let Some(balance) = vs.frontend.balance {
        virtual_server.balance = balance;
    }
    if let Some(mode) = vs.frontend.mode {
        virtual_server.mode = mode;
    }
    if let Some(va) = vs.frontend.virtual_address {
        virtual_server.virtual_address = Some(VirtualAddress {
            bind_addr: va.bind_addr,
            port: va.port,
        });
    }
    virtual_server.iapp = vs.frontend.iapp;
    if let Some(ssl) = vs.frontend.ssl_profile {
        if let Some(name) = ssl.f5_profile_name {
            virtual_server.add_frontend_ssl_profile_name(name);
        }
        for name in ssl.f5_profile_names {
            virtual_server.add_frontend_ssl_profile_name(name);
        }
    }

    let mut cfg = ResourceConfig::new(ResourceType::ConfigMap, virtual_server);
    cfg.pools.push(Pool {
        name: vs_name.clone(),
        service_name: vs.backend.service_name,
        service_port: vs.backend.service_port,
        members: Vec::new(),
    });
    for (i, hm) in vs.backend.health_monitors.into_iter().enumerate() {
        cfg.set_monitor(Monitor {
            name: format!("{vs_name}_{i}_{}", hm.protocol),
            partition: cfg.virtual_server.partition.clone(),
            protocol: hm.protocol,
            interval: hm.interval,
            timeout: hm.timeout,
            send: hm.send,
        });
    }
    cfg.sort_monitors();
    Ok(cfg)
}

/// A ConfigMap is enqueueable if it parses and declares a backend.
pub(crate) fn queue_key_for_config_map(cm: &k8s::ConfigMap) -> Option<ServiceQueueKey> {
    let namespace = cm.namespace()?;
    match parse_config_map(cm) {
        Ok(cfg) => Some(ServiceQueueKey::new(namespace, cfg.pools[0].service_name.clone())),
        Err(error) => {
            debug!(
                configmap = %cm.name_unchecked(),
                %error,
                "Ignoring unparseable ConfigMap"
            );
            None
        }
    }
}

// === impl Manager ===

impl Manager {
    pub(crate) async fn sync_configmaps(
        &self,
        stats: &mut VsSyncStats,
        s_key: &ServiceQueueKey,
        rs_map: &mut ResourceMap,
        svc_port_map: &HashSet<i32>,
        svc: Option<&k8s::Service>,
        app_inf: &AppInformer,
    ) -> Result<()> {
        for cm in app_inf.configmaps.store().by_namespace(&s_key.namespace) {
            let mut rs_cfg = match parse_config_map(&cm) {
                Ok(cfg) => cfg,
                Err(error) => {
                    // The user will re-deliver a fixed ConfigMap via a watch
                    // update; meanwhile any virtual it used to define is gone.
                    warn!(
                        configmap = %cm.name_unchecked(),
                        namespace = %s_key.namespace,
                        %error,
                        "Could not get config for ConfigMap"
                    );
                    if self.handle_config_map_parse_failure(&cm).await {
                        stats.vs_deleted += 1;
                    }
                    continue;
                }
            };

            // Frontend SSL profiles may name Secrets; materialize those and
            // rewrite the reference. Anything else is a BIG-IP profile path.
            for profile in rs_cfg.virtual_server.frontend_ssl_profile_names() {
                let secret = match self.backend.get_secret(&s_key.namespace, &profile).await {
                    Ok(secret) => secret,
                    Err(_) => {
                        info!(%profile, "Couldn't find Secret, parsing name as a profile path");
                        continue;
                    }
                };
                match self.handle_ssl_profile(
                    &rs_cfg.virtual_server.virtual_server_name,
                    &rs_cfg.virtual_server.partition.clone(),
                    &secret,
                    &s_key.namespace,
                ) {
                    Ok(updated) => {
                        if updated {
                            stats.cp_updated += 1;
                        }
                    }
                    Err(error) => {
                        warn!(%error, "Invalid TLS Secret");
                        continue;
                    }
                }
                let partition = rs_cfg.virtual_server.partition.clone();
                rs_cfg.virtual_server.remove_frontend_ssl_profile_name(&profile);
                rs_cfg.virtual_server.add_frontend_ssl_profile_name(
                    names::format_ingress_ssl_profile_name(&format!("{partition}/{profile}")),
                );
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
                None,
            );
            if !ours {
                continue;
            }
            stats.vs_found += found;
            stats.vs_updated += updated;

            if rs_cfg.virtual_server.iapp.is_none() {
                if let Some(va) = &rs_cfg.virtual_server.virtual_address {
                    if !va.bind_addr.is_empty() {
                        self.set_bind_addr_annotation(&cm, &va.bind_addr).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// A previously-valid ConfigMap went invalid: delete its virtual and
    /// clear the status annotation. Returns true if a virtual was deleted.
    async fn handle_config_map_parse_failure(&self, cm: &k8s::ConfigMap) -> bool {
        let Some(namespace) = cm.namespace() else {
            return false;
        };
        let rs_name = names::format_config_map_vs_name(&namespace, &cm.name_unchecked());
        let deleted = {
            let mut resources = self.resources.lock();
            let copies = resources.get_all_with_name(&rs_name);
            for (key, _) in &copies {
                resources.delete(key, &rs_name);
            }
            !copies.is_empty()
        };
        if deleted {
            warn!(
                configmap = %cm.name_unchecked(),
                "Deleted virtual server associated with ConfigMap"
            );
            if cm.annotations().contains_key(VS_BIND_ADDR_ANNOTATION) {
                let mut cm = cm.clone();
                if let Some(annotations) = cm.metadata.annotations.as_mut() {
                    annotations.remove(VS_BIND_ADDR_ANNOTATION);
                }
                if let Err(error) = self.backend.update_config_map(&cm).await {
                    warn!(%error, "Error when clearing status IP annotation");
                }
            }
        }
        deleted
    }

    /// Reflects the virtual's bind address back onto the ConfigMap.
    async fn set_bind_addr_annotation(&self, cm: &k8s::ConfigMap, bind_addr: &str) {
        if cm.annotations().get(VS_BIND_ADDR_ANNOTATION).map(String::as_str) == Some(bind_addr) {
            return;
        }
        let mut cm = cm.clone();
        cm.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(VS_BIND_ADDR_ANNOTATION.to_string(), bind_addr.to_string());
        match self.backend.update_config_map(&cm).await {
            Ok(()) => debug!(
                configmap = %cm.name_unchecked(),
                %bind_addr,
                "Updated ConfigMap bind-address annotation"
            ),
            Err(error) => warn!(%error, "Error when creating status IP annotation"),
        }
    }
}
