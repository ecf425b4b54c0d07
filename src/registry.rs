//! Pair Registry: reconcile watched pools with alert configurations
//!
//! Purpose:
//!     Make the set of subscribed pools match the union of pools referenced by
//!     alert configurations, discovering pools for configurations that have
//!     none.
//!
//! Created: 2026-10-06
//!
//! Sync cycle (in order):
//!     1. Required set per chain = union of configured pool addresses
//!     2. Tracked pools no longer required are detached
//!     3. Configs with no pools run discovery; results are written back
//!     4. Required pools not yet tracked are registered and subscribed;
//!        tracked pools with an incomplete subscription set are resubscribed
//!
//! Re-running with unchanged configuration makes no subscription changes.

use alloy::primitives::Address;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::error::{WatchError, WatchResult};
use crate::market::PoolDiscovery;
use crate::store::ConfigStore;
use crate::types::{addr_key, normalize_addr, parse_address, AlertConfig, ChainId, DestinationId, PoolCandidate, PoolMeta};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub removed: usize,
    pub discovered: usize,
    pub added: usize,
    pub resubscribed: usize,
    pub skipped: usize,
}

impl SyncReport {
    pub fn is_quiet(&self) -> bool {
        *self == SyncReport::default()
    }
}

/// Lowercased pool addresses per chain across all configurations
pub fn required_pools(configs: &[AlertConfig]) -> BTreeMap<ChainId, BTreeSet<String>> {
    let mut required: BTreeMap<ChainId, BTreeSet<String>> = BTreeMap::new();
    for cfg in configs {
        let set = required.entry(cfg.chain.clone()).or_default();
        set.extend(cfg.pools.iter().map(|p| normalize_addr(p)).filter(|p| !p.is_empty()));
    }
    required
}

/// Candidates on `chain` with liquidity >= `min_liquidity`, deepest first,
/// at most `max` addresses.
pub fn select_candidates(candidates: &[PoolCandidate], chain: &ChainId, min_liquidity: f64, max: usize) -> Vec<String> {
    let mut eligible: Vec<&PoolCandidate> = candidates
        .iter()
        .filter(|c| &c.chain == chain && c.liquidity_usd >= min_liquidity)
        .filter(|c| parse_address(&c.pool_address).is_some())
        .collect();
    eligible.sort_by(|a, b| b.liquidity_usd.total_cmp(&a.liquidity_usd));

    let mut seen = BTreeSet::new();
    eligible
        .into_iter()
        .map(|c| normalize_addr(&c.pool_address))
        .filter(|p| seen.insert(p.clone()))
        .take(max)
        .collect()
}

type HealKey = (DestinationId, ChainId, String);

pub struct PairRegistry {
    conn: Arc<ConnectionManager>,
    store: Arc<dyn ConfigStore>,
    discovery: Arc<dyn PoolDiscovery>,
    min_liquidity_usd: f64,
    max_pools: usize,
    heal_interval: Duration,
    last_heal: DashMap<HealKey, Instant>,
}

impl PairRegistry {
    pub fn new(
        conn: Arc<ConnectionManager>,
        store: Arc<dyn ConfigStore>,
        discovery: Arc<dyn PoolDiscovery>,
        min_liquidity_usd: f64,
        max_pools: usize,
        heal_interval: Duration,
    ) -> Self {
        Self {
            conn,
            store,
            discovery,
            min_liquidity_usd,
            max_pools,
            heal_interval,
            last_heal: DashMap::new(),
        }
    }

    /// One reconciliation pass.
    pub async fn sync(&self) -> SyncReport {
        let mut report = SyncReport::default();

        let configs = self.store.snapshot();
        let required = required_pools(&configs);
        report.removed = self.remove_unrequired(&required);

        report.discovered = self.discover_missing(&configs).await;
        let (configs, required) = if report.discovered > 0 {
            let configs = self.store.snapshot();
            let required = required_pools(&configs);
            (configs, required)
        } else {
            (configs, required)
        };

        for (chain, pools) in &required {
            self.add_required(chain, pools, &configs, &mut report).await;
        }

        if !report.is_quiet() {
            info!(
                "Registry sync: +{} -{} resubscribed {} discovered {} skipped {} | tracking {}",
                report.added,
                report.removed,
                report.resubscribed,
                report.discovered,
                report.skipped,
                self.conn.pair_count()
            );
        }
        report
    }

    fn remove_unrequired(&self, required: &BTreeMap<ChainId, BTreeSet<String>>) -> usize {
        let mut removed = 0;
        for chain in self.conn.chains() {
            let wanted = required.get(&chain);
            for pool in self.conn.tracked_pools(&chain) {
                if wanted.map_or(false, |set| set.contains(&addr_key(&pool))) {
                    continue;
                }
                if self.conn.detach_pair(&chain, pool) {
                    info!("Stopped watching {} on {}", pool, chain);
                    removed += 1;
                }
            }
        }
        removed
    }

    async fn discover_missing(&self, configs: &[AlertConfig]) -> usize {
        let mut updated = 0;
        for cfg in configs.iter().filter(|c| c.pools.is_empty()) {
            match self.discover(cfg).await {
                Ok(Some(_)) => updated += 1,
                Ok(None) => debug!("No pools found for {} on {}", cfg.token, cfg.chain),
                Err(e) => warn!("Pool discovery for {} on {} failed: {}", cfg.token, cfg.chain, e),
            }
        }
        updated
    }

    /// Look up pools for `cfg` and write them back. Existing pools are kept
    /// first; the write happens only if the list grows.
    pub async fn discover(&self, cfg: &AlertConfig) -> WatchResult<Option<Vec<String>>> {
        if cfg.token_address().is_none() {
            return Err(WatchError::MalformedInput(format!("token address {:?}", cfg.token)));
        }

        let candidates = self.discovery.token_pools(&cfg.chain, &cfg.token).await?;
        let selected = select_candidates(&candidates, &cfg.chain, self.min_liquidity_usd, self.max_pools);

        let mut merged: Vec<String> = cfg.pools.iter().map(|p| normalize_addr(p)).collect();
        for pool in selected {
            if merged.len() >= self.max_pools.max(cfg.pools.len()) {
                break;
            }
            if !merged.contains(&pool) {
                merged.push(pool);
            }
        }
        if merged.len() <= cfg.pools.len() {
            return Ok(None);
        }

        if !self.store.set_pools(&cfg.destination, &cfg.chain, &cfg.token, merged.clone()) {
            // Config removed while we were looking
            return Ok(None);
        }
        self.store.mark_dirty();
        info!(
            "Discovered {} pools for {} on {} ({})",
            merged.len(),
            cfg.token,
            cfg.chain,
            cfg.destination
        );
        Ok(Some(merged))
    }

    /// Opportunistic re-discovery for configs with at most one pool, at most
    /// once per heal interval per config. Returns true if pools were added.
    pub async fn self_heal(&self, cfg: &AlertConfig, now: Instant) -> bool {
        if cfg.pools.len() > 1 {
            return false;
        }

        let key = (cfg.destination.clone(), cfg.chain.clone(), normalize_addr(&cfg.token));
        match self.last_heal.entry(key) {
            Entry::Occupied(mut e) => {
                if now.saturating_duration_since(*e.get()) < self.heal_interval {
                    return false;
                }
                e.insert(now);
            }
            Entry::Vacant(e) => {
                e.insert(now);
            }
        }

        match self.discover(cfg).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                debug!("Self-heal discovery for {} failed: {}", cfg.token, e);
                false
            }
        }
    }

    async fn add_required(
        &self,
        chain: &ChainId,
        pools: &BTreeSet<String>,
        configs: &[AlertConfig],
        report: &mut SyncReport,
    ) {
        let mut chain_ready = false;

        for pool_str in pools {
            let Some(pool) = parse_address(pool_str) else {
                warn!("Skipping malformed pool address {:?} on {}", pool_str, chain);
                report.skipped += 1;
                continue;
            };

            if let Some(complete) = self.conn.is_complete(chain, pool) {
                if !complete && self.conn.resubscribe(chain, pool).await > 0 {
                    report.resubscribed += 1;
                }
                continue;
            }

            if !chain_ready {
                if let Err(e) = self.conn.ensure(chain).await {
                    warn!("Chain {} unavailable, {} pools deferred: {}", chain, pools.len(), e);
                    return;
                }
                chain_ready = true;
            }

            match self.register(chain, pool, configs).await {
                Ok(subs) => {
                    debug!("Watching {} on {} ({} subscriptions)", pool, chain, subs);
                    report.added += 1;
                }
                Err(e) => {
                    warn!("Could not register {} on {}: {}", pool, chain, e);
                    report.skipped += 1;
                }
            }
        }
    }

    async fn register(&self, chain: &ChainId, pool: Address, configs: &[AlertConfig]) -> WatchResult<usize> {
        let reader = self
            .conn
            .reader(chain)
            .ok_or_else(|| WatchError::ConnectionLost {
                chain: chain.clone(),
                reason: "no handle".into(),
            })?;
        let (token0, token1) = reader.pool_tokens(pool).await?;

        let pool_key = addr_key(&pool);
        let referencing: Vec<Address> = configs
            .iter()
            .filter(|c| c.references_pool(chain, &pool_key))
            .filter_map(AlertConfig::token_address)
            .collect();

        let tracked_token = match referencing.iter().find(|t| **t == token0 || **t == token1) {
            Some(t) => *t,
            None => {
                let fallback = referencing
                    .first()
                    .copied()
                    .ok_or_else(|| WatchError::MalformedInput(format!("no valid token for pool {}", pool)))?;
                warn!("Pool {} on {} holds neither configured token; no buys will match", pool, chain);
                fallback
            }
        };

        let meta = PoolMeta {
            chain: chain.clone(),
            pool,
            token0,
            token1,
            tracked_token,
        };
        self.conn.attach_pair(meta).await
    }

    pub fn clear(&self) {
        self.last_heal.clear();
    }
}
