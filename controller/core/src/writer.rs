//! The emitted configuration document and the downstream writer seam.

use crate::{
    config::ResourceConfig,
    irules::{IRule, InternalDataGroup},
    profile::CustomProfile,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;

/// The downstream config sink. Writers are expected to be idempotent:
/// byte-identical input produces no downstream action.
pub trait ConfigWriter: Send + Sync {
    fn write_config(&self, document: &[u8]) -> Result<()>;
}

/// One coherent snapshot of the desired load-balancer state. Sections are
/// sorted by the emitter so identical state serializes to identical bytes.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    pub resources: Vec<ResourceConfig>,
    pub custom_profiles: Vec<CustomProfile>,
    pub irules: Vec<IRule>,
    pub internal_data_groups: Vec<InternalDataGroup>,
}

impl ConfigDocument {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("serializing config document")
    }
}

/// Writes each document to a file, replacing it atomically.
#[derive(Debug)]
pub struct FileWriter {
    path: PathBuf,
}

impl FileWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigWriter for FileWriter {
    fn write_config(&self, document: &[u8]) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, document)
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming to {}", self.path.display()))?;
        Ok(())
    }
}
