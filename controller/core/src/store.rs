//! The resource store: `(serviceKey, resourceName) -> ResourceConfig` with a
//! reverse index for "all copies of a resource name" lookups.

use crate::config::{ResourceConfig, ServiceKey};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};

#[derive(Debug, Default)]
pub struct Resources {
    configs: HashMap<ServiceKey, HashMap<String, ResourceConfig>>,
    by_name: HashMap<String, HashSet<ServiceKey>>,
}

// === impl Resources ===

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ServiceKey, name: &str) -> Option<&ResourceConfig> {
        self.configs.get(key)?.get(name)
    }

    pub fn assign(&mut self, key: ServiceKey, name: String, cfg: ResourceConfig) {
        self.by_name
            .entry(name.clone())
            .or_default()
            .insert(key.clone());
        self.configs.entry(key).or_default().insert(name, cfg);
    }

    /// Deletes one named entry, or every entry under `key` when `name` is
    /// empty. Returns true if anything was removed.
    pub fn delete(&mut self, key: &ServiceKey, name: &str) -> bool {
        let Some(named) = self.configs.get_mut(key) else {
            return false;
        };
        let mut deleted = false;
        if name.is_empty() {
            for name in named.keys() {
                if let Some(keys) = self.by_name.get_mut(name) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.by_name.remove(name);
                    }
                }
                deleted = true;
            }
            self.configs.remove(key);
        } else if named.remove(name).is_some() {
            deleted = true;
            if named.is_empty() {
                self.configs.remove(key);
            }
            if let Some(keys) = self.by_name.get_mut(name) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_name.remove(name);
                }
            }
        }
        deleted
    }

    pub fn for_each(&self, mut f: impl FnMut(&ServiceKey, &ResourceConfig)) {
        for (key, named) in self.configs.iter() {
            for cfg in named.values() {
                f(key, cfg);
            }
        }
    }

    /// All stored copies of `name`, in stable key order.
    pub fn get_all_with_name(&self, name: &str) -> Vec<(ServiceKey, ResourceConfig)> {
        let Some(keys) = self.by_name.get(name) else {
            return Vec::new();
        };
        let mut keys = keys.iter().cloned().collect::<Vec<_>>();
        keys.sort();
        keys.into_iter()
            .filter_map(|key| {
                let cfg = self.configs.get(&key)?.get(name)?.clone();
                Some((key, cfg))
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.configs.values().map(|named| named.len()).sum()
    }
}
