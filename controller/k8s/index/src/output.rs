//! Serialization of the stores into one coherent document for the writer.

use crate::Manager;
use bigip_controller_core::{ConfigDocument, ResourceConfig, Resources};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

// === impl Manager ===

impl Manager {
    pub(crate) fn output_config(&self) {
        let resources = self.resources.lock();
        self.output_config_locked(&resources);
    }

    /// Assembles and writes the document. Expects the resources lock held so
    /// emissions serialize against the sync worker.
    pub(crate) fn output_config_locked(&self, resources: &Resources) {
        // Copies of a virtual differ only in per-pool members; merge each
        // pool's members from the copy stored under that pool's backend key.
        let mut merged: BTreeMap<String, ResourceConfig> = BTreeMap::new();
        resources.for_each(|key, cfg| {
            if !cfg.meta_data.active {
                return;
            }
            let entry = merged
                .entry(cfg.virtual_server.virtual_server_name.clone())
                .or_insert_with(|| cfg.clone());
            for (i, pool) in cfg.pools.iter().enumerate() {
                if pool.service_name == key.service_name
                    && pool.service_port == key.service_port
                    && i < entry.pools.len()
                {
                    entry.pools[i].members = pool.members.clone();
                }
            }
        });

        let custom_profiles = {
            let profiles = self.custom_profiles.lock();
            let mut entries: Vec<_> = profiles.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut out = Vec::new();
            for (_, profile) in entries {
                // The same profile may be stored under several owner keys.
                if !out.contains(profile) {
                    out.push(profile.clone());
                }
            }
            out.sort_by(|a, b| (&a.partition, &a.name).cmp(&(&b.partition, &b.name)));
            out
        };

        let irules = {
            let irules = self.irules.lock();
            let mut out: Vec<_> = irules.values().cloned().collect();
            out.sort_by(|a, b| (&a.partition, &a.name).cmp(&(&b.partition, &b.name)));
            out
        };

        let internal_data_groups = {
            let dgs = self.int_dg.lock();
            let mut out: Vec<_> = dgs.values().cloned().collect();
            out.sort_by(|a, b| (&a.partition, &a.name).cmp(&(&b.partition, &b.name)));
            out
        };

        let document = ConfigDocument {
            resources: merged.into_values().collect(),
            custom_profiles,
            irules,
            internal_data_groups,
        };
        let bytes = match document.to_bytes() {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "Failed to serialize config document");
                return;
            }
        };
        match self.writer.write_config(&bytes) {
            Ok(()) => {
                debug!(bytes = bytes.len(), "Wrote config document");
                self.initial_state.store(true, Ordering::Release);
            }
            Err(error) => warn!(%error, "Failed to write config document"),
        }
    }
}
