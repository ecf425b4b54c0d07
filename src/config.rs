//! Configuration management
//!
//! Tracker settings come from a TOML file; secrets and per-chain RPC
//! endpoints come from the environment (.env loaded via dotenv).
//!
//! ```toml
//! [tracker]
//! sync_interval_secs = 15
//! cooldown_secs = 3
//!
//! [api]
//! timeout_secs = 10
//!
//! [[chain]]
//! id = "base"
//! chain_id = 8453
//! native_symbol = "ETH"
//! wrapped_native = "0x4200000000000000000000000000000000000006"
//! default_native_price_usd = 2500.0
//! ```
//!
//! `RPC_URL_<CHAIN>` (e.g. `RPC_URL_BASE`) overrides a chain's `rpc_url`.
//!
//! Created: 2026-10-04

use alloy::primitives::{address, Address};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::types::ChainId;

/// Top-level settings file
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub tracker: TrackerSettings,
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default = "default_chains", rename = "chain")]
    pub chains: Vec<ChainSettings>,
}

/// Timings, floors and caps for the tracking core
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerSettings {
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_pair_ttl")]
    pub pair_ttl_secs: u64,
    #[serde(default = "default_native_price_ttl")]
    pub native_price_ttl_secs: u64,
    #[serde(default = "default_position_floor")]
    pub position_floor_usd: f64,
    #[serde(default = "default_discovery_min_liquidity")]
    pub discovery_min_liquidity_usd: f64,
    #[serde(default = "default_discovery_max_pools")]
    pub discovery_max_pools: usize,
    /// Minimum gap between opportunistic re-discoveries for one config
    #[serde(default = "default_self_heal_interval")]
    pub self_heal_interval_secs: u64,
    #[serde(default = "default_resync_delay")]
    pub resync_delay_secs: u64,
    #[serde(default = "default_scanner_interval")]
    pub scanner_interval_secs: u64,
    #[serde(default = "default_scanner_min_liquidity")]
    pub scanner_min_liquidity_usd: f64,
    #[serde(default = "default_scanner_max_age")]
    pub scanner_max_age_mins: i64,
    #[serde(default = "default_scanner_top_n")]
    pub scanner_top_n: usize,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_store_flush")]
    pub store_flush_secs: u64,
    /// Capacity of the decoded-event channel between subscriptions and handlers
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_sync_interval() -> u64 { 15 }
fn default_cooldown() -> u64 { 3 }
fn default_pair_ttl() -> u64 { 15 }
fn default_native_price_ttl() -> u64 { 30 }
fn default_position_floor() -> f64 { 100.0 }
fn default_discovery_min_liquidity() -> f64 { 1_000.0 }
fn default_discovery_max_pools() -> usize { 15 }
fn default_self_heal_interval() -> u64 { 300 }
fn default_resync_delay() -> u64 { 2 }
fn default_scanner_interval() -> u64 { 20 }
fn default_scanner_min_liquidity() -> f64 { 5_000.0 }
fn default_scanner_max_age() -> i64 { 60 }
fn default_scanner_top_n() -> usize { 5 }
fn default_backoff_base_ms() -> u64 { 1_000 }
fn default_backoff_max_secs() -> u64 { 60 }
fn default_store_flush() -> u64 { 10 }
fn default_event_buffer() -> usize { 4_096 }

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval(),
            cooldown_secs: default_cooldown(),
            pair_ttl_secs: default_pair_ttl(),
            native_price_ttl_secs: default_native_price_ttl(),
            position_floor_usd: default_position_floor(),
            discovery_min_liquidity_usd: default_discovery_min_liquidity(),
            discovery_max_pools: default_discovery_max_pools(),
            self_heal_interval_secs: default_self_heal_interval(),
            resync_delay_secs: default_resync_delay(),
            scanner_interval_secs: default_scanner_interval(),
            scanner_min_liquidity_usd: default_scanner_min_liquidity(),
            scanner_max_age_mins: default_scanner_max_age(),
            scanner_top_n: default_scanner_top_n(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_secs: default_backoff_max_secs(),
            store_flush_secs: default_store_flush(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl TrackerSettings {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn pair_ttl(&self) -> Duration {
        Duration::from_secs(self.pair_ttl_secs)
    }

    pub fn native_price_ttl(&self) -> Duration {
        Duration::from_secs(self.native_price_ttl_secs)
    }

    pub fn self_heal_interval(&self) -> Duration {
        Duration::from_secs(self.self_heal_interval_secs)
    }

    pub fn resync_delay(&self) -> Duration {
        Duration::from_secs(self.resync_delay_secs)
    }

    pub fn scanner_interval(&self) -> Duration {
        Duration::from_secs(self.scanner_interval_secs.max(1))
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn store_flush_interval(&self) -> Duration {
        Duration::from_secs(self.store_flush_secs.max(1))
    }
}

/// External market-data endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_dexscreener_url")]
    pub dexscreener_url: String,
    #[serde(default = "default_geckoterminal_url")]
    pub geckoterminal_url: String,
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
}

fn default_dexscreener_url() -> String { "https://api.dexscreener.com".to_string() }
fn default_geckoterminal_url() -> String { "https://api.geckoterminal.com/api/v2".to_string() }
fn default_api_timeout() -> u64 { 10 }

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            dexscreener_url: default_dexscreener_url(),
            geckoterminal_url: default_geckoterminal_url(),
            timeout_secs: default_api_timeout(),
        }
    }
}

/// One supported chain
#[derive(Debug, Clone, Deserialize)]
pub struct ChainSettings {
    pub id: ChainId,
    pub chain_id: u64,
    /// ws(s):// selects streaming transport, anything else polling
    #[serde(default)]
    pub rpc_url: String,
    pub native_symbol: String,
    pub wrapped_native: Address,
    /// Native price used when every price lookup fails
    pub default_native_price_usd: f64,
    /// Chain slug on DexScreener (defaults to `id`)
    #[serde(default)]
    pub dexscreener_id: Option<String>,
    /// Network slug on GeckoTerminal (defaults to `id`)
    #[serde(default)]
    pub geckoterminal_id: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_true")]
    pub scanner_enabled: bool,
}

fn default_poll_interval() -> u64 { 2_000 }
fn default_true() -> bool { true }

impl ChainSettings {
    pub fn dexscreener_slug(&self) -> &str {
        self.dexscreener_id.as_deref().unwrap_or(self.id.as_str())
    }

    pub fn geckoterminal_slug(&self) -> &str {
        self.geckoterminal_id.as_deref().unwrap_or(self.id.as_str())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(100))
    }

    pub fn has_endpoint(&self) -> bool {
        !self.rpc_url.trim().is_empty()
    }

    /// Env var that overrides this chain's RPC URL
    pub fn rpc_env_key(&self) -> String {
        format!("RPC_URL_{}", self.id.as_str().to_uppercase().replace('-', "_"))
    }
}

fn builtin_chain(
    id: &str,
    chain_id: u64,
    native_symbol: &str,
    wrapped_native: Address,
    default_native_price_usd: f64,
    geckoterminal_id: &str,
) -> ChainSettings {
    ChainSettings {
        id: ChainId::new(id),
        chain_id,
        rpc_url: String::new(),
        native_symbol: native_symbol.to_string(),
        wrapped_native,
        default_native_price_usd,
        dexscreener_id: None,
        geckoterminal_id: Some(geckoterminal_id.to_string()),
        poll_interval_ms: default_poll_interval(),
        scanner_enabled: true,
    }
}

/// Chains supported out of the box (endpoints still come from the environment)
pub fn default_chains() -> Vec<ChainSettings> {
    vec![
        builtin_chain("ethereum", 1, "ETH", address!("C02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2"), 2500.0, "eth"),
        builtin_chain("base", 8453, "ETH", address!("4200000000000000000000000000000000000006"), 2500.0, "base"),
        builtin_chain("bsc", 56, "BNB", address!("bb4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c"), 600.0, "bsc"),
        builtin_chain("polygon", 137, "POL", address!("0d500B1d8E8eF31E21C99d1Db9A6444d3ADf1270"), 0.5, "polygon_pos"),
    ]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tracker: TrackerSettings::default(),
            api: ApiSettings::default(),
            chains: default_chains(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read settings file: {}", path.as_ref().display()))?;

        let settings: Self = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML settings")?;

        Ok(settings)
    }

    /// Load the file if present, otherwise fall back to built-in defaults.
    /// Environment overrides are applied in both cases.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut settings = if path.as_ref().exists() {
            let s = Self::load(path.as_ref())?;
            info!("Settings loaded from {} ({} chains)", path.as_ref().display(), s.chains.len());
            s
        } else {
            warn!("Settings file {} not found, using defaults", path.as_ref().display());
            Self::default()
        };

        settings.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Apply `RPC_URL_<CHAIN>` overrides using `lookup` as the env source.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for chain in &mut self.chains {
            if let Some(url) = lookup(&chain.rpc_env_key()).filter(|u| !u.trim().is_empty()) {
                chain.rpc_url = url.trim().to_string();
            }
        }
    }

    pub fn chain(&self, id: &ChainId) -> Option<&ChainSettings> {
        self.chains.iter().find(|c| &c.id == id)
    }

    /// Chains with a usable RPC endpoint
    pub fn connected_chains(&self) -> impl Iterator<Item = &ChainSettings> {
        self.chains.iter().filter(|c| c.has_endpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[tracker]
cooldown_secs = 5

[[chain]]
id = "Base"
chain_id = 8453
rpc_url = "wss://base.example"
native_symbol = "ETH"
wrapped_native = "0x4200000000000000000000000000000000000006"
default_native_price_usd = 2500.0
"#;

        let settings: Settings = toml::from_str(toml_str).unwrap();
        assert_eq!(settings.tracker.cooldown_secs, 5);
        assert_eq!(settings.tracker.pair_ttl_secs, 15);
        assert_eq!(settings.tracker.discovery_max_pools, 15);
        assert_eq!(settings.chains.len(), 1);

        let base = settings.chain(&ChainId::new("base")).unwrap();
        assert_eq!(base.dexscreener_slug(), "base");
        assert_eq!(base.poll_interval_ms, 2_000);
        assert!(base.scanner_enabled);
        assert_eq!(settings.api.timeout_secs, 10);
    }

    #[test]
    fn test_defaults_without_chain_section() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.chains.len(), 4);
        assert_eq!(settings.tracker.sync_interval(), Duration::from_secs(15));
        assert_eq!(settings.tracker.native_price_ttl(), Duration::from_secs(30));
        // No endpoints until the environment supplies them
        assert_eq!(settings.connected_chains().count(), 0);
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::default();
        settings.apply_env_overrides(|key| match key {
            "RPC_URL_BSC" => Some("https://bsc.example".to_string()),
            "RPC_URL_BASE" => Some("  ".to_string()),
            _ => None,
        });

        let bsc = settings.chain(&ChainId::new("bsc")).unwrap();
        assert_eq!(bsc.rpc_url, "https://bsc.example");
        assert!(!settings.chain(&ChainId::new("base")).unwrap().has_endpoint());
        assert_eq!(settings.connected_chains().count(), 1);
    }

    #[test]
    fn test_geckoterminal_slug() {
        let settings = Settings::default();
        let polygon = settings.chain(&ChainId::new("polygon")).unwrap();
        assert_eq!(polygon.geckoterminal_slug(), "polygon_pos");
        assert_eq!(polygon.rpc_env_key(), "RPC_URL_POLYGON");
    }
}
