//! The canonical representation of one virtual server.
//!
//! Mutators keep every list that the model treats as a set (SSL profile
//! names, monitors, data-group records) sorted and deduplicated, so the
//! derived `PartialEq` is a canonical deep-equality comparison.

use crate::profile::{CustomProfile, ProfileRef};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PARTITION: &str = "velcro";
pub const DEFAULT_HTTP_PORT: i32 = 80;
pub const DEFAULT_HTTPS_PORT: i32 = 443;

/// Identifies one backend: a service port in a namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub namespace: String,
    pub service_name: String,
    pub service_port: i32,
}

/// The reconciliation unit; one key may cover many ports and resources.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceQueueKey {
    pub namespace: String,
    pub service_name: String,
}

impl ServiceQueueKey {
    pub fn new(namespace: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            service_name: service_name.into(),
        }
    }
}

impl std::fmt::Display for ServiceQueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.service_name)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    ConfigMap,
    Ingress,
    Route,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaData {
    pub active: bool,
    pub node_port: i32,
    pub resource_type: ResourceType,
}

impl MetaData {
    pub fn new(resource_type: ResourceType) -> Self {
        Self {
            active: false,
            node_port: 0,
            resource_type,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub address: String,
    pub port: i32,
    pub session: String,
}

impl Member {
    pub fn new(address: impl Into<String>, port: i32) -> Self {
        Self {
            address: address.into(),
            port,
            session: "user-enabled".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    pub name: String,
    pub service_name: String,
    pub service_port: i32,
    pub members: Vec<Member>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Monitor {
    pub name: String,
    pub partition: String,
    pub protocol: String,
    pub interval: i32,
    pub timeout: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub name: String,
    pub equals: bool,
    pub http_host: bool,
    pub http_uri: bool,
    pub path_segment: bool,
    pub index: i32,
    pub values: Vec<String>,
}

impl Condition {
    pub fn host(value: impl Into<String>) -> Self {
        Self {
            name: "0".to_string(),
            equals: true,
            http_host: true,
            http_uri: false,
            path_segment: false,
            index: 0,
            values: vec![value.into()],
        }
    }

    /// Matches one path segment at 1-based `index`.
    pub fn path_segment(index: i32, value: impl Into<String>) -> Self {
        Self {
            name: index.to_string(),
            equals: true,
            http_host: false,
            http_uri: true,
            path_segment: true,
            index,
            values: vec![value.into()],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub name: String,
    pub pool: String,
    pub forward: bool,
    pub request: bool,
}

impl Action {
    pub fn forward_to(pool_path: impl Into<String>) -> Self {
        Self {
            name: "0".to_string(),
            pool: pool_path.into(),
            forward: true,
            request: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub name: String,
    pub ordinal: usize,
    pub actions: Vec<Action>,
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub name: String,
    pub partition: String,
    pub strategy: String,
    pub requires: Vec<String>,
    pub controls: Vec<String>,
    pub rules: Vec<Rule>,
}

impl Policy {
    pub fn forwarding(name: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition: partition.into(),
            strategy: "first-match".to_string(),
            requires: vec!["http".to_string()],
            controls: vec!["forwarding".to_string()],
            rules: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualAddress {
    pub bind_addr: String,
    pub port: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Virtual {
    pub virtual_server_name: String,
    pub partition: String,
    pub balance: String,
    pub mode: String,
    /// Absent for pool-only configurations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_address: Option<VirtualAddress>,
    /// Client-side SSL profile references, kept sorted and deduplicated.
    pub ssl_profiles: Vec<String>,
    /// Ordered iRule references.
    pub irules: Vec<String>,
    pub policies: Vec<crate::irules::NameRef>,
    /// Server-side and other attached profiles.
    pub profiles: Vec<ProfileRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iapp: Option<String>,
}

impl Virtual {
    pub fn new(name: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            virtual_server_name: name.into(),
            partition: partition.into(),
            balance: "round-robin".to_string(),
            mode: "http".to_string(),
            virtual_address: None,
            ssl_profiles: Vec::new(),
            irules: Vec::new(),
            policies: Vec::new(),
            profiles: Vec::new(),
            iapp: None,
        }
    }

    pub fn frontend_ssl_profile_names(&self) -> Vec<String> {
        self.ssl_profiles.clone()
    }

    pub fn add_frontend_ssl_profile_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        if let Err(idx) = self.ssl_profiles.binary_search(&name) {
            self.ssl_profiles.insert(idx, name);
        }
    }

    pub fn remove_frontend_ssl_profile_name(&mut self, name: &str) -> bool {
        match self.ssl_profiles.binary_search_by(|p| p.as_str().cmp(name)) {
            Ok(idx) => {
                self.ssl_profiles.remove(idx);
                true
            }
            Err(_) => false,
        }
    }

    pub fn add_irule(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.irules.contains(&name) {
            self.irules.push(name);
        }
    }

    pub fn add_policy_ref(&mut self, name: impl Into<String>, partition: impl Into<String>) {
        let nr = crate::irules::NameRef {
            name: name.into(),
            partition: partition.into(),
        };
        if !self.policies.contains(&nr) {
            self.policies.push(nr);
        }
    }

    /// Replaces a profile with the same name and partition, or appends.
    pub fn add_or_update_profile(&mut self, profile: ProfileRef) {
        for p in self.profiles.iter_mut() {
            if p.name == profile.name && p.partition == profile.partition {
                *p = profile;
                return;
            }
        }
        self.profiles.push(profile);
        self.profiles
            .sort_by(|a, b| (&a.partition, &a.name).cmp(&(&b.partition, &b.name)));
    }

    /// True if any attached reference resolves to `profile`.
    pub fn references_profile(&self, profile: &CustomProfile) -> bool {
        let path = format!("{}/{}", profile.partition, profile.name);
        self.ssl_profiles.iter().any(|p| *p == path)
            || self
                .profiles
                .iter()
                .any(|p| p.name == profile.name && p.partition == profile.partition)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    pub meta_data: MetaData,
    pub virtual_server: Virtual,
    pub pools: Vec<Pool>,
    pub policies: Vec<Policy>,
    pub monitors: Vec<Monitor>,
}

// === impl ResourceConfig ===

impl ResourceConfig {
    pub fn new(resource_type: ResourceType, virtual_server: Virtual) -> Self {
        Self {
            meta_data: MetaData::new(resource_type),
            virtual_server,
            pools: Vec::new(),
            policies: Vec::new(),
            monitors: Vec::new(),
        }
    }

    pub fn pool_index_for_service(&self, service_name: &str) -> Option<usize> {
        self.pools
            .iter()
            .position(|p| p.service_name == service_name)
    }

    pub fn find_policy(&self, control: &str) -> Option<&Policy> {
        self.policies
            .iter()
            .find(|p| p.controls.iter().any(|c| c == control))
    }

    /// Replaces the policy with the same name, or appends it.
    pub fn set_policy(&mut self, policy: Policy) {
        self.virtual_server
            .add_policy_ref(policy.name.clone(), policy.partition.clone());
        for p in self.policies.iter_mut() {
            if p.name == policy.name {
                *p = policy;
                return;
            }
        }
        self.policies.push(policy);
    }

    pub fn remove_policy(&mut self, nr: &crate::irules::NameRef) {
        self.policies
            .retain(|p| !(p.name == nr.name && p.partition == nr.partition));
        self.virtual_server.policies.retain(|p| p != nr);
    }

    pub fn set_monitor(&mut self, monitor: Monitor) {
        for m in self.monitors.iter_mut() {
            if m.name == monitor.name {
                *m = monitor;
                return;
            }
        }
        self.monitors.push(monitor);
    }

    pub fn sort_monitors(&mut self) {
        self.monitors.sort_by(|a, b| a.name.cmp(&b.name));
    }
}
