//! Tracker: the coordinator owning all runtime state
//!
//! Purpose:
//!     Wire connections, registry, enrichment, position tracking, cooldowns
//!     and dispatch into one value with an explicit lifecycle.
//!
//! Created: 2026-10-07
//!
//! Tasks (all bound to one CancellationToken):
//!     - sync loop: health check + registry sync every sync interval
//!     - event loop: receives decoded swaps, spawns one handler per event
//!     - new-pool scanners: one per chain with an endpoint
//!
//! Lifecycle:
//!     start()        spawn the tasks (once)
//!     clear_caches() wipe connections, caches, cooldowns; resync after 2s
//!     shutdown()     cancel tasks, drop subscriptions, close handles (idempotent)

use alloy::primitives::Address;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::alert::{AlertPayload, AlertSink};
use crate::chain::ChainConnector;
use crate::config::{ChainSettings, Settings, TrackerSettings};
use crate::connection::ConnectionManager;
use crate::cooldown::{CooldownGate, GateDecision};
use crate::decoder::{buy_legs, normalize};
use crate::dispatch::DispatchQueue;
use crate::enrichment::{EnrichedSwap, Enrichment};
use crate::market::{NativePriceSource, PairDetailSource, PoolDiscovery};
use crate::position::PositionTracker;
use crate::registry::{PairRegistry, SyncReport};
use crate::scanner::NewPoolScanner;
use crate::store::ConfigStore;
use crate::types::{addr_key, AlertConfig, CanonicalSwap, PoolEvent, PositionChange};

/// External collaborators the tracker is built from
pub struct TrackerDeps {
    pub connector: Arc<dyn ChainConnector>,
    pub store: Arc<dyn ConfigStore>,
    pub discovery: Arc<dyn PoolDiscovery>,
    pub pair_details: Arc<dyn PairDetailSource>,
    pub native_prices: Arc<dyn NativePriceSource>,
    pub dispatch: Arc<dyn DispatchQueue>,
    pub sink: Arc<dyn AlertSink>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    pub events: u64,
    pub buys: u64,
    pub alerts: u64,
}

#[derive(Default)]
struct Counters {
    events: AtomicU64,
    buys: AtomicU64,
    alerts: AtomicU64,
}

pub struct Tracker {
    settings: TrackerSettings,
    chains: Vec<ChainSettings>,
    conn: Arc<ConnectionManager>,
    registry: PairRegistry,
    enrichment: Enrichment,
    positions: PositionTracker,
    cooldown: CooldownGate,
    scanner: Arc<NewPoolScanner>,
    store: Arc<dyn ConfigStore>,
    dispatch: Arc<dyn DispatchQueue>,
    sink: Arc<dyn AlertSink>,
    events_rx: Mutex<Option<mpsc::Receiver<PoolEvent>>>,
    cancel: CancellationToken,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    sync_lock: tokio::sync::Mutex<()>,
    started: AtomicBool,
    shutting_down: AtomicBool,
    counters: Counters,
}

impl Tracker {
    pub fn new(settings: &Settings, deps: TrackerDeps) -> Arc<Self> {
        let t = &settings.tracker;
        let (events_tx, events_rx) = mpsc::channel(t.event_buffer.max(1));

        let conn = Arc::new(ConnectionManager::new(
            deps.connector,
            events_tx,
            t.backoff_base(),
            t.backoff_max(),
        ));
        let registry = PairRegistry::new(
            Arc::clone(&conn),
            Arc::clone(&deps.store),
            Arc::clone(&deps.discovery),
            t.discovery_min_liquidity_usd,
            t.discovery_max_pools,
            t.self_heal_interval(),
        );
        let enrichment = Enrichment::new(
            deps.pair_details,
            deps.native_prices,
            t.pair_ttl(),
            t.native_price_ttl(),
            &settings.chains,
        );
        let scanner = Arc::new(NewPoolScanner::new(
            deps.discovery,
            t.scanner_interval(),
            t.scanner_min_liquidity_usd,
            t.scanner_max_age_mins,
            t.scanner_top_n,
        ));

        Arc::new(Self {
            settings: t.clone(),
            chains: settings.chains.clone(),
            conn,
            registry,
            enrichment,
            positions: PositionTracker::new(t.position_floor_usd),
            cooldown: CooldownGate::new(t.cooldown()),
            scanner,
            store: deps.store,
            dispatch: deps.dispatch,
            sink: deps.sink,
            events_rx: Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            sync_lock: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.conn
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            events: self.counters.events.load(Ordering::Relaxed),
            buys: self.counters.buys.load(Ordering::Relaxed),
            alerts: self.counters.alerts.load(Ordering::Relaxed),
        }
    }

    /// Spawn the sync loop, event loop and scanners. Calling twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.is_shutting_down() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let rx = self
            .events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let mut tasks = self.tasks.lock().await;

        if let Some(rx) = rx {
            tasks.spawn(Arc::clone(self).event_loop(rx));
        }
        tasks.spawn(Arc::clone(self).sync_loop());

        let scanned: Vec<_> = self
            .chains
            .iter()
            .filter(|c| c.has_endpoint() && c.scanner_enabled)
            .map(|c| c.id.clone())
            .collect();
        for chain in &scanned {
            tasks.spawn(Arc::clone(&self.scanner).run(chain.clone(), self.cancel.child_token()));
        }

        info!(
            "Tracker started | sync every {:?} | {} scanners",
            self.settings.sync_interval(),
            scanned.len()
        );
    }

    async fn sync_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.sync_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sync_once().await;
                }
            }
        }
        debug!("Sync loop stopped");
    }

    async fn event_loop(self: Arc<Self>, mut rx: mpsc::Receiver<PoolEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let tracker = Arc::clone(&self);
                    tokio::spawn(async move {
                        tracker.handle_event(event).await;
                    });
                }
            }
        }
        debug!("Event loop stopped");
    }

    /// One health check + registry sync. Cycles never overlap.
    pub async fn sync_once(&self) -> SyncReport {
        let _guard = self.sync_lock.lock().await;
        if self.is_shutting_down() {
            return SyncReport::default();
        }

        for (chain, n) in self.conn.health_check().await {
            info!("Health check: {} reconnected, {} pools reattached", chain, n);
        }
        let report = self.registry.sync().await;

        let longest = self
            .store
            .snapshot()
            .iter()
            .filter_map(|c| c.cooldown_secs)
            .map(Duration::from_secs)
            .fold(self.settings.cooldown(), Duration::max);
        self.cooldown.cleanup(Instant::now(), longest);

        report
    }

    /// Wipe connections, caches and cooldowns; resync after the resync delay.
    pub fn clear_caches(self: &Arc<Self>) {
        if self.is_shutting_down() {
            return;
        }

        self.conn.clear();
        self.enrichment.clear();
        self.cooldown.clear();
        self.registry.clear();
        info!("Caches cleared, resync in {:?}", self.settings.resync_delay());

        // Detached; ends with the cancel token
        let tracker = Arc::clone(self);
        let delay = self.settings.resync_delay();
        tokio::spawn(async move {
            tokio::select! {
                _ = tracker.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    tracker.sync_once().await;
                }
            }
        });
    }

    /// Stop everything. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Tracker shutting down");

        self.cancel.cancel();
        self.tasks.lock().await.shutdown().await;
        self.conn.clear();

        let s = self.stats();
        info!("Tracker stopped | events {} | buys {} | alerts {}", s.events, s.buys, s.alerts);
    }

    /// Process one decoded swap. Returns the number of alerts dispatched.
    pub async fn handle_event(&self, event: PoolEvent) -> usize {
        if self.is_shutting_down() {
            return 0;
        }
        self.counters.events.fetch_add(1, Ordering::Relaxed);

        let meta = &event.meta;
        let swap = normalize(&event.event, meta, event.tx_hash, event.block_number);
        let Some(legs) = buy_legs(&swap, meta) else {
            return 0;
        };
        self.counters.buys.fetch_add(1, Ordering::Relaxed);

        let pool_key = addr_key(&meta.pool);
        let targets: Vec<AlertConfig> = self
            .store
            .snapshot()
            .into_iter()
            .filter(|c| c.references_pool(&meta.chain, &pool_key))
            .filter(|c| c.token_address() == Some(meta.tracked_token))
            .collect();
        if targets.is_empty() {
            debug!("Buy on {} has no subscribers", pool_key);
            return 0;
        }

        let Some(reader) = self.conn.reader(&meta.chain) else {
            debug!("Chain {} cleared while handling {}", meta.chain, swap.tx_hash);
            return 0;
        };

        let enriched = self.enrichment.enrich(reader.as_ref(), meta, &legs).await;
        let position = self
            .positions
            .position_change(
                reader.as_ref(),
                meta.tracked_token,
                swap.counterparty,
                swap.block_number,
                legs.tracked_out,
                // Unpriced buys stay below the position floor
                enriched.usd_value.unwrap_or(0.0),
            )
            .await;

        // State may have changed while enrichment was in flight
        if self.is_shutting_down() || !self.conn.is_tracked(&meta.chain, meta.pool) {
            return 0;
        }
        // Destinations that dropped the pool meanwhile are not alerted
        let targets: Vec<AlertConfig> = self
            .store
            .snapshot()
            .into_iter()
            .filter(|c| targets.iter().any(|t| t.destination == c.destination))
            .filter(|c| c.references_pool(&meta.chain, &pool_key))
            .filter(|c| c.token_address() == Some(meta.tracked_token))
            .collect();

        let mut dispatched = 0;
        for cfg in &targets {
            match self.cooldown.admit(cfg, &pool_key, enriched.usd_value, Instant::now()) {
                GateDecision::Accepted => {
                    let payload = build_payload(cfg, &swap, &enriched, position);
                    info!("Buy alert -> {}: {}", cfg.destination, payload.headline());
                    let sink = Arc::clone(&self.sink);
                    self.dispatch.submit(
                        &cfg.destination,
                        Box::pin(async move { sink.deliver(&payload).await }),
                    );
                    dispatched += 1;
                }
                rejected => debug!("Alert for {} on {} rejected: {:?}", cfg.destination, pool_key, rejected),
            }
        }
        self.counters.alerts.fetch_add(dispatched as u64, Ordering::Relaxed);

        for cfg in targets.iter().filter(|c| c.pools.len() <= 1) {
            if self.registry.self_heal(cfg, Instant::now()).await {
                info!("Self-heal found more pools for {} ({})", cfg.token, cfg.destination);
            }
        }

        dispatched
    }
}

fn symbol_or(symbol: &str, token: Address) -> String {
    if symbol.is_empty() {
        addr_key(&token)
    } else {
        symbol.to_string()
    }
}

fn build_payload(cfg: &AlertConfig, swap: &CanonicalSwap, e: &EnrichedSwap, position: PositionChange) -> AlertPayload {
    let token = cfg.token_address().unwrap_or_default();
    AlertPayload {
        destination: cfg.destination.clone(),
        chain: swap.chain.clone(),
        pool: addr_key(&swap.pool),
        version: swap.version,
        token_symbol: symbol_or(&e.token_symbol, token),
        base_symbol: e.base_symbol.clone(),
        tx_hash: format!("{:#x}", swap.tx_hash),
        block_number: swap.block_number,
        buyer: addr_key(&swap.counterparty),
        spent: e.base_amount,
        received: e.tracked_amount,
        usd_value: e.usd_value,
        price_usd: e.token_price_usd,
        market_cap: e.detail.market_cap,
        liquidity_usd: e.detail.liquidity_usd,
        volume_24h: e.detail.volume_24h,
        position,
        emoji_bar: cfg.emoji_bar(e.usd_value.unwrap_or(0.0)),
        media: cfg.media.clone(),
        timestamp: Utc::now(),
    }
}
