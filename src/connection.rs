//! Connection Manager: one handle per chain, with pool runtimes attached
//!
//! Purpose:
//!     Own every chain handle and the per-pool subscriptions running on it.
//!     Recreate dead streaming handles and reattach every tracked pool so a
//!     dropped socket never silently stops alerts.
//!
//! Created: 2026-10-04
//!
//! Design:
//!     - ChainRuntime per chain (handle, transport, generation, pairs)
//!     - Generation counter bumps on every (re)connect; subscriptions created
//!       against an older generation are dropped instead of installed
//!     - Connect failures arm a per-chain backoff (base 1s, cap 60s, jitter);
//!       callers retry on a later sync cycle once the backoff has elapsed
//!     - DashMap guards are never held across .await

use alloy::primitives::Address;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chain::{ChainConnector, ChainHandle, ChainReader, PoolSubscription, TransportKind};
use crate::error::{WatchError, WatchResult};
use crate::types::{ChainId, PoolEvent, PoolMeta, ProtocolVersion};

/// Bounded exponential backoff with jitter for reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    failures: u32,
    next_attempt: Option<Instant>,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
            next_attempt: None,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |at| now >= at)
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.next_attempt
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(now))
    }

    /// Un-jittered delay after `failures` consecutive failures
    pub fn ceiling(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }

    /// Record a failure at `now` and return the delay before the next attempt.
    /// The delay is drawn uniformly from [ceiling / 2, ceiling].
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let ceiling = self.ceiling(self.failures);
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        let delay = ceiling.mul_f64(factor);
        self.next_attempt = Some(now + delay);
        delay
    }
}

/// One watched pool on one chain.
pub struct PairRuntime {
    pub meta: PoolMeta,
    subscriptions: HashMap<ProtocolVersion, PoolSubscription>,
}

impl PairRuntime {
    fn new(meta: PoolMeta) -> Self {
        Self {
            meta,
            subscriptions: HashMap::new(),
        }
    }

    fn missing_versions(&self) -> Vec<ProtocolVersion> {
        ProtocolVersion::ALL
            .iter()
            .copied()
            .filter(|v| self.subscriptions.get(v).map_or(true, |s| s.is_finished()))
            .collect()
    }

    /// Every protocol version has a live subscription
    pub fn is_complete(&self) -> bool {
        self.missing_versions().is_empty()
    }
}

pub struct ChainRuntime {
    handle: Arc<dyn ChainHandle>,
    transport: TransportKind,
    generation: u64,
    pairs: HashMap<Address, PairRuntime>,
}

impl ChainRuntime {
    fn new(handle: Arc<dyn ChainHandle>, generation: u64) -> Self {
        Self {
            transport: handle.transport(),
            handle,
            generation,
            pairs: HashMap::new(),
        }
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn ChainConnector>,
    events: mpsc::Sender<PoolEvent>,
    runtimes: DashMap<ChainId, ChainRuntime>,
    backoff: DashMap<ChainId, ReconnectBackoff>,
    backoff_base: Duration,
    backoff_max: Duration,
    generation: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn ChainConnector>,
        events: mpsc::Sender<PoolEvent>,
        backoff_base: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self {
            connector,
            events,
            runtimes: DashMap::new(),
            backoff: DashMap::new(),
            backoff_base,
            backoff_max,
            generation: AtomicU64::new(0),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn check_backoff(&self, chain: &ChainId) -> WatchResult<()> {
        if let Some(b) = self.backoff.get(chain) {
            let now = Instant::now();
            if !b.ready(now) {
                return Err(WatchError::ConnectionLost {
                    chain: chain.clone(),
                    reason: format!("backing off, next attempt in {:.1}s", b.remaining(now).as_secs_f64()),
                });
            }
        }
        Ok(())
    }

    fn record_failure(&self, chain: &ChainId, err: &WatchError) {
        let (base, max) = (self.backoff_base, self.backoff_max);
        let mut entry = self
            .backoff
            .entry(chain.clone())
            .or_insert_with(|| ReconnectBackoff::new(base, max));
        let delay = entry.record_failure(Instant::now());
        warn!(
            "Connect {} failed ({} consecutive): {} | retry in {:.1}s",
            chain,
            entry.failures(),
            err,
            delay.as_secs_f64()
        );
    }

    async fn connect(&self, chain: &ChainId) -> WatchResult<Arc<dyn ChainHandle>> {
        self.check_backoff(chain)?;
        match self.connector.connect(chain).await {
            Ok(handle) => {
                self.backoff.remove(chain);
                Ok(handle)
            }
            Err(e) => {
                self.record_failure(chain, &e);
                Err(e)
            }
        }
    }

    /// Handle for `chain`, connecting on first use. Idempotent.
    pub async fn ensure(&self, chain: &ChainId) -> WatchResult<Arc<dyn ChainHandle>> {
        if let Some(rt) = self.runtimes.get(chain) {
            return Ok(Arc::clone(&rt.handle));
        }

        let handle = self.connect(chain).await?;
        let generation = self.next_generation();

        let (current, installed) = match self.runtimes.entry(chain.clone()) {
            Entry::Occupied(e) => (Arc::clone(&e.get().handle), false),
            Entry::Vacant(e) => {
                e.insert(ChainRuntime::new(Arc::clone(&handle), generation));
                (Arc::clone(&handle), true)
            }
        };

        if installed {
            info!("Chain {} ready ({:?})", chain, handle.transport());
        } else {
            // Lost a race with a concurrent ensure
            handle.close();
        }
        Ok(current)
    }

    fn current(&self, chain: &ChainId) -> Option<(Arc<dyn ChainHandle>, u64)> {
        self.runtimes
            .get(chain)
            .map(|rt| (Arc::clone(&rt.handle), rt.generation))
    }

    async fn subscribe_versions(
        &self,
        handle: &Arc<dyn ChainHandle>,
        meta: &PoolMeta,
        versions: &[ProtocolVersion],
    ) -> Vec<PoolSubscription> {
        let mut subs = Vec::with_capacity(versions.len());
        for &version in versions {
            match handle.subscribe_pool(meta.clone(), version, self.events.clone()).await {
                Ok(sub) => subs.push(sub),
                Err(e) => warn!("Subscribe {} {} on {} failed: {}", version, meta.pool, meta.chain, e),
            }
        }
        subs
    }

    /// Install subscriptions if the chain is still on `generation`.
    /// With `create` false, a pool removed meanwhile is not re-inserted.
    fn install(
        &self,
        meta: &PoolMeta,
        generation: u64,
        subs: Vec<PoolSubscription>,
        create: bool,
    ) -> Option<usize> {
        let mut rt = self.runtimes.get_mut(&meta.chain)?;
        if rt.generation != generation {
            debug!("Dropping subscriptions for {}: chain runtime replaced", meta.pool);
            return None;
        }

        let pair = if create {
            rt.pairs
                .entry(meta.pool)
                .or_insert_with(|| PairRuntime::new(meta.clone()))
        } else {
            rt.pairs.get_mut(&meta.pool)?
        };

        let installed = subs.len();
        for sub in subs {
            pair.subscriptions.insert(sub.version(), sub);
        }
        Some(installed)
    }

    /// Register a new pool and subscribe every protocol version.
    /// Returns the number of live subscriptions created.
    pub async fn attach_pair(&self, meta: PoolMeta) -> WatchResult<usize> {
        self.ensure(&meta.chain).await?;
        let (handle, generation) = self
            .current(&meta.chain)
            .ok_or_else(|| WatchError::ConnectionLost {
                chain: meta.chain.clone(),
                reason: "runtime cleared during attach".into(),
            })?;

        let subs = self.subscribe_versions(&handle, &meta, &ProtocolVersion::ALL).await;
        self.install(&meta, generation, subs, true)
            .ok_or_else(|| WatchError::ConnectionLost {
                chain: meta.chain.clone(),
                reason: "runtime replaced during attach".into(),
            })
    }

    /// Fill in missing or finished subscriptions of a tracked pool.
    pub async fn resubscribe(&self, chain: &ChainId, pool: Address) -> usize {
        let Some((handle, generation, meta, missing)) = self.runtimes.get(chain).and_then(|rt| {
            rt.pairs.get(&pool).map(|p| {
                (Arc::clone(&rt.handle), rt.generation, p.meta.clone(), p.missing_versions())
            })
        }) else {
            return 0;
        };
        if missing.is_empty() {
            return 0;
        }

        let subs = self.subscribe_versions(&handle, &meta, &missing).await;
        self.install(&meta, generation, subs, false).unwrap_or(0)
    }

    /// Stop watching a pool. Returns true if it was tracked.
    pub fn detach_pair(&self, chain: &ChainId, pool: Address) -> bool {
        self.runtimes
            .get_mut(chain)
            .map_or(false, |mut rt| rt.pairs.remove(&pool).is_some())
    }

    /// Probe streaming handles; reconnect the dead ones and reattach their
    /// pools. Returns (chain, pools reattached) for every reconnect.
    pub async fn health_check(&self) -> Vec<(ChainId, usize)> {
        let streaming: Vec<(ChainId, Arc<dyn ChainHandle>)> = self
            .runtimes
            .iter()
            .filter(|rt| rt.transport == TransportKind::Streaming)
            .map(|rt| (rt.key().clone(), Arc::clone(&rt.handle)))
            .collect();

        let mut reconnected = Vec::new();
        for (chain, handle) in streaming {
            if handle.is_open().await {
                continue;
            }
            warn!("Connection to {} lost, reconnecting", chain);
            match self.reconnect(&chain).await {
                Ok(n) => reconnected.push((chain, n)),
                Err(e) => warn!("Reconnect {} deferred: {}", chain, e),
            }
        }
        reconnected
    }

    async fn reconnect(&self, chain: &ChainId) -> WatchResult<usize> {
        let handle = self.connect(chain).await?;
        let generation = self.next_generation();

        let swapped = self.runtimes.get_mut(chain).map(|mut rt| {
            let old = std::mem::replace(&mut rt.handle, Arc::clone(&handle));
            rt.transport = handle.transport();
            rt.generation = generation;
            for pair in rt.pairs.values_mut() {
                pair.subscriptions.clear();
            }
            let metas: Vec<PoolMeta> = rt.pairs.values().map(|p| p.meta.clone()).collect();
            (old, metas)
        });

        let Some((old, metas)) = swapped else {
            // Runtime cleared while connecting
            handle.close();
            return Ok(0);
        };
        old.close();

        let mut reattached = 0;
        for meta in &metas {
            let subs = self.subscribe_versions(&handle, meta, &ProtocolVersion::ALL).await;
            if self.install(meta, generation, subs, false).unwrap_or(0) > 0 {
                reattached += 1;
            }
        }

        info!("Reconnected {} | reattached {}/{} pools", chain, reattached, metas.len());
        Ok(reattached)
    }

    pub fn reader(&self, chain: &ChainId) -> Option<Arc<dyn ChainReader>> {
        self.runtimes.get(chain).map(|rt| rt.handle.reader())
    }

    pub fn chains(&self) -> Vec<ChainId> {
        self.runtimes.iter().map(|rt| rt.key().clone()).collect()
    }

    pub fn tracked_pools(&self, chain: &ChainId) -> Vec<Address> {
        self.runtimes
            .get(chain)
            .map(|rt| rt.pairs.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_tracked(&self, chain: &ChainId, pool: Address) -> bool {
        self.runtimes
            .get(chain)
            .map_or(false, |rt| rt.pairs.contains_key(&pool))
    }

    pub fn pair_meta(&self, chain: &ChainId, pool: Address) -> Option<PoolMeta> {
        self.runtimes
            .get(chain)
            .and_then(|rt| rt.pairs.get(&pool).map(|p| p.meta.clone()))
    }

    /// None if the pool is not tracked
    pub fn is_complete(&self, chain: &ChainId, pool: Address) -> Option<bool> {
        self.runtimes
            .get(chain)
            .and_then(|rt| rt.pairs.get(&pool).map(PairRuntime::is_complete))
    }

    pub fn pair_count(&self) -> usize {
        self.runtimes.iter().map(|rt| rt.pairs.len()).sum()
    }

    /// Close every handle and forget all runtimes and backoff state.
    pub fn clear(&self) {
        for rt in self.runtimes.iter() {
            rt.handle.close();
        }
        self.runtimes.clear();
        self.backoff.clear();
    }
}
