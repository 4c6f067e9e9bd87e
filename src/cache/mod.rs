//! Hand-off of [`PluginConf`] records from ADD to DEL.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

use crate::types::PluginConf;

/// Keyed store of attachment records.
pub trait StateCache {
    /// Key of the record for one (network, container, interface) attachment.
    fn state_ref(&self, network: &str, container_id: &str, ifname: &str) -> String {
        format!("{}-{}-{}", network, container_id, ifname)
    }
    fn save(&self, state_ref: &str, conf: &PluginConf) -> Result<()>;
    fn load(&self, state_ref: &str) -> Result<PluginConf>;
    fn delete(&self, state_ref: &str) -> Result<()>;
}

/// One JSON file per record under a cache directory.
#[derive(Debug, Clone)]
pub struct FsStateCache {
    dir: PathBuf,
}

impl FsStateCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, state_ref: &str) -> PathBuf {
        self.dir.join(state_ref)
    }

    /// Refs of every record in the cache, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut refs = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read cache directory {}", self.dir.display()))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        refs.sort();
        Ok(refs)
    }
}

impl StateCache for FsStateCache {
    fn save(&self, state_ref: &str, conf: &PluginConf) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create cache directory {}", self.dir.display()))?;
        let json = serde_json::to_vec(conf).context("Failed to serialize plugin state")?;
        let path = self.path(state_ref);
        fs::write(&path, json)
            .with_context(|| format!("Failed to write cache record {}", path.display()))?;
        debug!(path = %path.display(), "saved plugin state");
        Ok(())
    }

    fn load(&self, state_ref: &str) -> Result<PluginConf> {
        let path = self.path(state_ref);
        let bytes = fs::read(&path)
            .with_context(|| format!("Failed to read cache record {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse cache record {}", path.display()))
    }

    fn delete(&self, state_ref: &str) -> Result<()> {
        let path = self.path(state_ref);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to remove cache record {}", path.display()))
            }
        }
    }
}
