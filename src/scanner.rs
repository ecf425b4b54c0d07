//! New-Pool Scanner
//!
//! Polls each chain for freshly created pools and logs the most liquid ones.
//! Informational only: nothing here feeds the watched pool set.
//!
//! Created: 2026-10-06

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::WatchResult;
use crate::market::PoolDiscovery;
use crate::types::{ChainId, PoolCandidate};

/// Candidates with liquidity >= `min_liquidity` created no earlier than
/// `max_age` before `now`, deepest first, at most `top_n`.
/// Pools without a creation time are excluded.
pub fn fresh_pools(
    candidates: Vec<PoolCandidate>,
    now: DateTime<Utc>,
    min_liquidity: f64,
    max_age: chrono::Duration,
    top_n: usize,
) -> Vec<PoolCandidate> {
    let mut fresh: Vec<PoolCandidate> = candidates
        .into_iter()
        .filter(|c| c.liquidity_usd >= min_liquidity)
        .filter(|c| c.created_at.map_or(false, |t| now.signed_duration_since(t) <= max_age))
        .collect();
    fresh.sort_by(|a, b| b.liquidity_usd.total_cmp(&a.liquidity_usd));
    fresh.truncate(top_n);
    fresh
}

pub struct NewPoolScanner {
    discovery: Arc<dyn PoolDiscovery>,
    interval: Duration,
    min_liquidity_usd: f64,
    max_age: chrono::Duration,
    top_n: usize,
}

impl NewPoolScanner {
    pub fn new(
        discovery: Arc<dyn PoolDiscovery>,
        interval: Duration,
        min_liquidity_usd: f64,
        max_age_mins: i64,
        top_n: usize,
    ) -> Self {
        Self {
            discovery,
            interval,
            min_liquidity_usd,
            max_age: chrono::Duration::minutes(max_age_mins),
            top_n,
        }
    }

    pub async fn scan_once(&self, chain: &ChainId) -> WatchResult<Vec<PoolCandidate>> {
        let candidates = self.discovery.new_pools(chain).await?;
        let total = candidates.len();
        let fresh = fresh_pools(candidates, Utc::now(), self.min_liquidity_usd, self.max_age, self.top_n);

        debug!("New-pool scan {}: {} candidates, {} pass filters", chain, total, fresh.len());
        for c in &fresh {
            info!(
                "New pool on {}: {} [{}] {} | liquidity ${:.0}",
                chain,
                c.pool_address,
                c.dex_id,
                c.base_symbol.as_deref().unwrap_or("?"),
                c.liquidity_usd
            );
        }
        Ok(fresh)
    }

    /// Scan `chain` every interval until `cancel` fires.
    pub async fn run(self: Arc<Self>, chain: ChainId, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("New-pool scanner started for {} (every {:?})", chain, self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_once(&chain).await {
                        warn!("New-pool scan on {} failed: {}", chain, e);
                    }
                }
            }
        }
        debug!("New-pool scanner stopped for {}", chain);
    }
}
