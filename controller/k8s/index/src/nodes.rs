//! Node-list updates feeding node-port pool membership.

use crate::Manager;
use bigip_controller_core::Member;
use bigip_controller_k8s_api as k8s;
use std::sync::atomic::Ordering;
use tracing::info;

// === impl Manager ===

impl Manager {
    /// Processes a fresh node list from the poller. The first call records
    /// the baseline; later calls rewrite node-port pool members and emit
    /// when the schedulable address set changed.
    pub fn process_node_update(&self, nodes: Vec<k8s::Node>) {
        let mut new_nodes = self.node_addresses(&nodes);
        new_nodes.sort();

        let resources = self.resources.lock();
        let changed = {
            let mut old_nodes = self.old_nodes.lock();
            if !self.initial_state.load(Ordering::Acquire) {
                *old_nodes = new_nodes;
                return;
            }
            if *old_nodes == new_nodes {
                false
            } else {
                *old_nodes = new_nodes.clone();
                true
            }
        };
        if !changed {
            return;
        }

        info!("ProcessNodeUpdate: Change in Node state detected");
        let mut resources = resources;
        let mut entries = Vec::new();
        resources.for_each(|key, cfg| {
            entries.push((key.clone(), cfg.clone()));
        });
        for (key, mut cfg) in entries {
            let members = new_nodes
                .iter()
                .map(|addr| Member::new(addr.clone(), cfg.meta_data.node_port))
                .collect();
            if let Some(pool) = cfg.pools.first_mut() {
                pool.members = members;
            }
            let name = cfg.virtual_server.virtual_server_name.clone();
            resources.assign(key, name, cfg);
        }
        self.output_config_locked(&resources);
    }

    /// Addresses of schedulable nodes, internal or external per config.
    fn node_addresses(&self, nodes: &[k8s::Node]) -> Vec<String> {
        let addr_type = if self.use_node_internal() {
            "InternalIP"
        } else {
            "ExternalIP"
        };
        let mut addrs = Vec::new();
        for node in nodes {
            if node
                .spec
                .as_ref()
                .and_then(|s| s.unschedulable)
                .unwrap_or(false)
            {
                continue;
            }
            for addr in node
                .status
                .iter()
                .flat_map(|s| s.addresses.iter().flatten())
            {
                if addr.type_ == addr_type {
                    addrs.push(addr.address.clone());
                }
            }
        }
        addrs
    }

    /// A copy of the node address cache.
    pub(crate) fn nodes_from_cache(&self) -> Vec<String> {
        self.old_nodes.lock().clone()
    }
}
