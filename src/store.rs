//! Alert configuration store
//!
//! The tracker reads alert configurations through `ConfigStore` and only ever
//! writes back one thing: a discovered pool list. Writes mark the store dirty;
//! a periodic task flushes dirty state to disk (fire-and-forget).
//!
//! Created: 2026-10-05

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::{debug, info, warn};

use crate::types::{normalize_addr, AlertConfig, ChainId, DestinationId};

pub trait ConfigStore: Send + Sync {
    /// Copy of every configuration
    fn snapshot(&self) -> Vec<AlertConfig>;

    /// Replace the pool list of the config identified by
    /// (destination, chain, token). Returns false if no such config exists.
    fn set_pools(&self, destination: &DestinationId, chain: &ChainId, token: &str, pools: Vec<String>) -> bool;

    /// Request a persist at the next flush
    fn mark_dirty(&self);
}

fn same_config(cfg: &AlertConfig, destination: &DestinationId, chain: &ChainId, token: &str) -> bool {
    &cfg.destination == destination && &cfg.chain == chain && normalize_addr(&cfg.token) == normalize_addr(token)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    alerts: Vec<AlertConfig>,
}

/// JSON-file backed store: `{"alerts": [ ... ]}`
pub struct JsonConfigStore {
    path: Option<PathBuf>,
    configs: RwLock<Vec<AlertConfig>>,
    dirty: AtomicBool,
}

impl JsonConfigStore {
    /// Load from `path`; a missing file yields an empty store.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let configs = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read alert store: {}", path.display()))?;
            let file: StoreFile = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse alert store: {}", path.display()))?;
            file.alerts
        } else {
            warn!("Alert store {} not found, starting empty", path.display());
            Vec::new()
        };

        info!("Loaded {} alert configs from {}", configs.len(), path.display());
        Ok(Self {
            path: Some(path),
            configs: RwLock::new(configs),
            dirty: AtomicBool::new(false),
        })
    }

    /// Store without a backing file (flush is a no-op)
    pub fn in_memory(configs: Vec<AlertConfig>) -> Self {
        Self {
            path: None,
            configs: RwLock::new(configs),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Add or replace a configuration (same destination, chain and token)
    pub fn upsert(&self, config: AlertConfig) {
        {
            let mut configs = self.configs.write().unwrap_or_else(|e| e.into_inner());
            match configs
                .iter_mut()
                .find(|c| same_config(c, &config.destination, &config.chain, &config.token))
            {
                Some(existing) => *existing = config,
                None => configs.push(config),
            }
        }
        self.mark_dirty();
    }

    /// Write to disk if dirty. Returns true if a write happened.
    /// The file is replaced atomically (write temp, then rename).
    pub fn flush(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            self.dirty.store(false, Ordering::SeqCst);
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        let file = StoreFile {
            alerts: self.snapshot(),
        };
        let result = write_atomic(path, &file);
        if result.is_err() {
            // Retry on the next flush
            self.dirty.store(true, Ordering::SeqCst);
        }
        result?;

        debug!("Alert store flushed to {}", path.display());
        Ok(true)
    }
}

fn write_atomic(path: &Path, file: &StoreFile) -> Result<()> {
    let json = serde_json::to_string_pretty(file).context("Failed to serialize alert store")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

impl ConfigStore for JsonConfigStore {
    fn snapshot(&self) -> Vec<AlertConfig> {
        self.configs.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_pools(&self, destination: &DestinationId, chain: &ChainId, token: &str, pools: Vec<String>) -> bool {
        let mut configs = self.configs.write().unwrap_or_else(|e| e.into_inner());
        match configs.iter_mut().find(|c| same_config(c, destination, chain, token)) {
            Some(cfg) => {
                cfg.pools = pools;
                true
            }
            None => false,
        }
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }
}
