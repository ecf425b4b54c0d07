//! Chain Access: handles, readers and per-pool log subscriptions
//!
//! Purpose:
//!     Everything the tracker needs from a chain endpoint, behind traits so the
//!     coordinator can be driven by in-memory fakes in tests.
//!
//! Created: 2026-10-04
//!
//! Transports (one log pump per chain, fed by a LogRouter):
//!     - Streaming (ws:// / wss://): a single eth_subscribe("logs") over all
//!       watched addresses and swap topics, re-issued when the set changes
//!     - Polling (anything else): one eth_getLogs over [next, head] per tick
//!
//! Pool subscriptions are router entries; the pump decodes each log and
//! pushes a PoolEvent to the pool it came from. Dropping a subscription
//! removes its entry.

use alloy::eips::BlockId;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ChainSettings;
use crate::contracts::{IUniswapV2Pair, IERC20};
use crate::decoder::{decode_log, swap_topic};
use crate::error::{WatchError, WatchResult};
use crate::types::{ChainId, PoolEvent, PoolMeta, ProtocolVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Streaming,
    Polling,
}

impl TransportKind {
    pub fn for_url(url: &str) -> Self {
        let lower = url.trim().to_lowercase();
        if lower.starts_with("ws://") || lower.starts_with("wss://") {
            TransportKind::Streaming
        } else {
            TransportKind::Polling
        }
    }
}

/// Read-only chain queries used by registration, enrichment and positions.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// (token0, token1) of a pool
    async fn pool_tokens(&self, pool: Address) -> WatchResult<(Address, Address)>;

    async fn decimals(&self, token: Address) -> WatchResult<u8>;

    /// ERC20 balance of `holder` as of `block`
    async fn balance_at(&self, token: Address, holder: Address, block: u64) -> WatchResult<U256>;
}

/// A live connection to one chain.
#[async_trait]
pub trait ChainHandle: Send + Sync {
    fn chain(&self) -> &ChainId;

    fn transport(&self) -> TransportKind;

    fn reader(&self) -> Arc<dyn ChainReader>;

    /// Whether the underlying connection still answers.
    async fn is_open(&self) -> bool;

    /// Start forwarding `version` swap logs of `meta.pool` into `events`.
    async fn subscribe_pool(
        &self,
        meta: PoolMeta,
        version: ProtocolVersion,
        events: mpsc::Sender<PoolEvent>,
    ) -> WatchResult<PoolSubscription>;

    /// Mark the handle dead. Subscriptions owned elsewhere are aborted by
    /// their owners.
    fn close(&self);
}

/// Creates handles for configured chains.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    async fn connect(&self, chain: &ChainId) -> WatchResult<Arc<dyn ChainHandle>>;
}

#[derive(Debug)]
enum Forwarder {
    /// Dedicated task owned by the subscription
    Task(JoinHandle<()>),
    /// Entry in the chain-wide log router
    Route(RouteGuard),
}

/// Forwarding of one pool's logs for one protocol version. Dropping it stops
/// the forwarding.
#[derive(Debug)]
pub struct PoolSubscription {
    version: ProtocolVersion,
    forwarder: Forwarder,
}

impl PoolSubscription {
    pub fn new(version: ProtocolVersion, task: JoinHandle<()>) -> Self {
        Self {
            version,
            forwarder: Forwarder::Task(task),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// True once forwarding has stopped (socket closed, task aborted)
    pub fn is_finished(&self) -> bool {
        match &self.forwarder {
            Forwarder::Task(task) => task.is_finished(),
            Forwarder::Route(guard) => guard.router.is_closed(),
        }
    }
}

impl Drop for PoolSubscription {
    fn drop(&mut self) {
        if let Forwarder::Task(task) = &self.forwarder {
            task.abort();
        }
    }
}

type RouteKey = (Address, ProtocolVersion);

struct Route {
    meta: PoolMeta,
    events: mpsc::Sender<PoolEvent>,
}

struct RouteGuard {
    key: RouteKey,
    router: Arc<LogRouter>,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.router.remove(&self.key);
    }
}

impl fmt::Debug for RouteGuard {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RouteGuard")
            .field("pool", &self.key.0)
            .field("version", &self.key.1)
            .finish()
    }
}

/// Chain-wide table of watched (pool, version) pairs.
///
/// One log pump per chain fetches every watched address and swap topic in a
/// single filter and hands each log to the pool it belongs to.
pub struct LogRouter {
    routes: DashMap<RouteKey, Route>,
    changes: watch::Sender<u64>,
    closed: AtomicBool,
}

impl LogRouter {
    pub fn new() -> Arc<Self> {
        let (changes, _) = watch::channel(0);
        Arc::new(Self {
            routes: DashMap::new(),
            changes,
            closed: AtomicBool::new(false),
        })
    }

    /// Route `version` swap logs emitted by `meta.pool` into `events` until
    /// the returned subscription is dropped.
    pub fn subscribe(self: &Arc<Self>, meta: PoolMeta, version: ProtocolVersion, events: mpsc::Sender<PoolEvent>) -> PoolSubscription {
        let key = (meta.pool, version);
        self.routes.insert(key, Route { meta, events });
        self.changes.send_modify(|v| *v += 1);
        PoolSubscription {
            version,
            forwarder: Forwarder::Route(RouteGuard {
                key,
                router: Arc::clone(self),
            }),
        }
    }

    fn remove(&self, key: &RouteKey) {
        if self.routes.remove(key).is_some() {
            self.changes.send_modify(|v| *v += 1);
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Bumped on every route added or removed
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.changes.send_modify(|v| *v += 1);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sorted watched addresses and the swap topics in use
    pub fn watched(&self) -> (Vec<Address>, Vec<B256>) {
        let mut addresses = BTreeSet::new();
        let mut topics = BTreeSet::new();
        for entry in self.routes.iter() {
            let (pool, version) = *entry.key();
            addresses.insert(pool);
            topics.insert(swap_topic(version));
        }
        (addresses.into_iter().collect(), topics.into_iter().collect())
    }

    /// One filter over every watched pool, None while nothing is watched
    pub fn filter(&self) -> Option<Filter> {
        let (addresses, topics) = self.watched();
        if addresses.is_empty() {
            return None;
        }
        Some(Filter::new().address(addresses).event_signature(topics))
    }

    /// Decode `log` and forward it to its pool. Returns true if delivered.
    pub async fn dispatch(&self, log: &Log) -> bool {
        if log.removed {
            return false;
        }
        let Some(event) = decode_log(log) else {
            return false;
        };
        let key = (log.address(), event.version());
        let Some((meta, events)) = self.routes.get(&key).map(|r| (r.meta.clone(), r.events.clone())) else {
            return false;
        };
        let (Some(tx_hash), Some(block_number)) = (log.transaction_hash, log.block_number) else {
            debug!("Pending log on {} skipped (no tx hash / block)", meta.pool);
            return false;
        };

        events
            .send(PoolEvent {
                meta,
                event,
                tx_hash,
                block_number,
            })
            .await
            .is_ok()
    }
}

/// HTTP transport: one eth_getLogs over [next, head] per tick for the whole chain.
async fn pump_polling(provider: DynProvider, router: Arc<LogRouter>, interval: Duration, chain: ChainId) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut next_block: Option<u64> = None;

    while !router.is_closed() {
        ticker.tick().await;

        let head = match provider.get_block_number().await {
            Ok(b) => b,
            Err(e) => {
                debug!("Poll head failed on {}: {}", chain, e);
                continue;
            }
        };

        // First tick only anchors the cursor; history is not replayed
        let Some(from) = next_block else {
            next_block = Some(head + 1);
            continue;
        };
        if from > head {
            continue;
        }
        let Some(filter) = router.filter() else {
            next_block = Some(head + 1);
            continue;
        };

        match provider.get_logs(&filter.from_block(from).to_block(head)).await {
            Ok(logs) => {
                for log in &logs {
                    router.dispatch(log).await;
                }
                next_block = Some(head + 1);
            }
            Err(e) => warn!("eth_getLogs {}-{} failed on {}: {}", from, head, chain, e),
        }
    }
}

/// WebSocket transport: one log subscription covering every watched pool,
/// re-issued whenever the watched set changes.
async fn pump_streaming(provider: DynProvider, router: Arc<LogRouter>, alive: Arc<AtomicBool>, chain: ChainId) {
    let mut changes = router.changes();

    loop {
        changes.borrow_and_update();
        if router.is_closed() {
            return;
        }
        let Some(filter) = router.filter() else {
            if changes.changed().await.is_err() {
                return;
            }
            continue;
        };

        let sub = match provider.subscribe_logs(&filter).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("Log subscription on {} failed: {}", chain, e);
                break;
            }
        };
        debug!("Log subscription on {} covers {} routes", chain, router.len());

        let mut stream = sub.into_stream();
        let resubscribe = loop {
            tokio::select! {
                log = stream.next() => match log {
                    Some(log) => {
                        router.dispatch(&log).await;
                    }
                    None => break false,
                },
                changed = changes.changed() => break changed.is_ok(),
            }
        };
        if !resubscribe {
            warn!("Log stream closed on {}", chain);
            break;
        }
        // Registrations arrive in bursts during a sync
        tokio::time::sleep(RESUBSCRIBE_SETTLE).await;
    }

    alive.store(false, Ordering::SeqCst);
    router.close();
}

const RESUBSCRIBE_SETTLE: Duration = Duration::from_millis(250);

// ── alloy implementation ─────────────────────────────────────────────

pub struct AlloyReader {
    provider: DynProvider,
}

impl AlloyReader {
    pub fn new(provider: DynProvider) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ChainReader for AlloyReader {
    async fn pool_tokens(&self, pool: Address) -> WatchResult<(Address, Address)> {
        // token0()/token1() share selectors across V2 and V3 pools
        let pair = IUniswapV2Pair::new(pool, &self.provider);
        let token0 = pair.token0().call().await.map_err(WatchError::rpc)?;
        let token1 = pair.token1().call().await.map_err(WatchError::rpc)?;
        Ok((token0, token1))
    }

    async fn decimals(&self, token: Address) -> WatchResult<u8> {
        IERC20::new(token, &self.provider)
            .decimals()
            .call()
            .await
            .map_err(WatchError::rpc)
    }

    async fn balance_at(&self, token: Address, holder: Address, block: u64) -> WatchResult<U256> {
        IERC20::new(token, &self.provider)
            .balanceOf(holder)
            .block(BlockId::number(block))
            .call()
            .await
            .map_err(WatchError::rpc)
    }
}

pub struct AlloyChainHandle {
    chain: ChainId,
    transport: TransportKind,
    provider: DynProvider,
    reader: Arc<AlloyReader>,
    router: Arc<LogRouter>,
    /// Cleared when the stream ends or the handle is closed
    alive: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl AlloyChainHandle {
    pub async fn connect(settings: &ChainSettings) -> WatchResult<Self> {
        let chain = settings.id.clone();
        let url = settings.rpc_url.trim();
        if url.is_empty() {
            return Err(WatchError::MalformedInput(format!("no rpc url for {}", chain)));
        }

        let transport = TransportKind::for_url(url);
        let provider = match transport {
            TransportKind::Streaming => ProviderBuilder::new()
                .connect_ws(WsConnect::new(url))
                .await
                .map_err(|e| WatchError::ConnectionLost {
                    chain: chain.clone(),
                    reason: e.to_string(),
                })?
                .erased(),
            TransportKind::Polling => {
                let parsed = url
                    .parse()
                    .map_err(|e| WatchError::MalformedInput(format!("rpc url for {}: {}", chain, e)))?;
                ProviderBuilder::new().connect_http(parsed).erased()
            }
        };

        let block = provider
            .get_block_number()
            .await
            .map_err(|e| WatchError::ConnectionLost {
                chain: chain.clone(),
                reason: e.to_string(),
            })?;
        info!("Connected to {} ({:?}) | block {}", chain, transport, block);

        let router = LogRouter::new();
        let alive = Arc::new(AtomicBool::new(true));
        let pump = match transport {
            TransportKind::Streaming => tokio::spawn(pump_streaming(
                provider.clone(),
                Arc::clone(&router),
                Arc::clone(&alive),
                chain.clone(),
            )),
            TransportKind::Polling => tokio::spawn(pump_polling(
                provider.clone(),
                Arc::clone(&router),
                settings.poll_interval(),
                chain.clone(),
            )),
        };

        Ok(Self {
            chain,
            transport,
            reader: Arc::new(AlloyReader::new(provider.clone())),
            provider,
            router,
            alive,
            pump,
        })
    }
}

impl Drop for AlloyChainHandle {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl ChainHandle for AlloyChainHandle {
    fn chain(&self) -> &ChainId {
        &self.chain
    }

    fn transport(&self) -> TransportKind {
        self.transport
    }

    fn reader(&self) -> Arc<dyn ChainReader> {
        self.reader.clone()
    }

    async fn is_open(&self) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        match self.provider.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                debug!("Health probe failed on {}: {}", self.chain, e);
                false
            }
        }
    }

    async fn subscribe_pool(
        &self,
        meta: PoolMeta,
        version: ProtocolVersion,
        events: mpsc::Sender<PoolEvent>,
    ) -> WatchResult<PoolSubscription> {
        if !self.alive.load(Ordering::SeqCst) || self.router.is_closed() {
            return Err(WatchError::ConnectionLost {
                chain: self.chain.clone(),
                reason: "log pump stopped".into(),
            });
        }
        Ok(self.router.subscribe(meta, version, events))
    }

    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.router.close();
        self.pump.abort();
    }
}

/// Connects chains from settings using alloy providers.
pub struct AlloyConnector {
    chains: HashMap<ChainId, ChainSettings>,
}

impl AlloyConnector {
    pub fn new<'a>(chains: impl IntoIterator<Item = &'a ChainSettings>) -> Self {
        Self {
            chains: chains
                .into_iter()
                .filter(|c| c.has_endpoint())
                .map(|c| (c.id.clone(), c.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl ChainConnector for AlloyConnector {
    async fn connect(&self, chain: &ChainId) -> WatchResult<Arc<dyn ChainHandle>> {
        let settings = self
            .chains
            .get(chain)
            .ok_or_else(|| WatchError::UnknownChain(chain.clone()))?;
        let handle = AlloyChainHandle::connect(settings).await?;
        Ok(Arc::new(handle))
    }
}
