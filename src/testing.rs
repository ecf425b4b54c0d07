//! In-memory fakes for chain access, market data and alert delivery
//!
//! Created: 2026-10-07

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::alert::{AlertPayload, AlertSink};
use crate::chain::{ChainConnector, ChainHandle, ChainReader, PoolSubscription, TransportKind};
use crate::error::{WatchError, WatchResult};
use crate::market::{NativePriceSource, PairDetailSource, PoolDiscovery};
use crate::types::{
    parse_address, AlertConfig, ChainId, DestinationId, PairDetail, PoolCandidate, PoolEvent, PoolMeta,
    ProtocolVersion,
};

/// `n * 10^decimals`
pub fn units(n: u64, decimals: u8) -> U256 {
    U256::from(n) * U256::from(10u64).pow(U256::from(decimals))
}

/// Pool `pool_byte` with token0 = base, token1 = tracked
pub fn pool_meta(chain: &str, pool_byte: u8, tracked_byte: u8, base_byte: u8) -> PoolMeta {
    let tracked = Address::repeat_byte(tracked_byte);
    PoolMeta {
        chain: ChainId::new(chain),
        pool: Address::repeat_byte(pool_byte),
        token0: Address::repeat_byte(base_byte),
        token1: tracked,
        tracked_token: tracked,
    }
}

pub fn alert_config(destination: &str, chain: &str, token: &str, pools: &[&str]) -> AlertConfig {
    AlertConfig {
        destination: DestinationId::new(destination),
        chain: ChainId::new(chain),
        token: token.to_string(),
        pools: pools.iter().map(|p| p.to_string()).collect(),
        emoji: "X".into(),
        min_buy_usd: 0.0,
        max_buy_usd: None,
        dollars_per_emoji: 50.0,
        cooldown_secs: None,
        media: None,
    }
}

pub fn candidate(chain: &str, pool_address: &str, liquidity_usd: f64) -> PoolCandidate {
    PoolCandidate {
        chain: ChainId::new(chain),
        pool_address: pool_address.to_string(),
        dex_id: "uniswap".into(),
        liquidity_usd,
        base_symbol: None,
        created_at: None,
    }
}

fn addr(s: &str) -> Address {
    parse_address(s).unwrap_or_else(|| panic!("bad test address {}", s))
}

#[derive(Default)]
pub struct FakeReader {
    pool_tokens: Mutex<HashMap<Address, (Address, Address)>>,
    decimals: Mutex<HashMap<Address, u8>>,
    balances: Mutex<HashMap<(Address, Address, u64), U256>>,
    fail_balance: AtomicBool,
    pool_token_calls: AtomicUsize,
    balance_calls: AtomicUsize,
}

impl FakeReader {
    pub fn set_pool_tokens(&self, pool: &str, token0: &str, token1: &str) {
        self.pool_tokens
            .lock()
            .unwrap()
            .insert(addr(pool), (addr(token0), addr(token1)));
    }

    pub fn pool_token_calls(&self) -> usize {
        self.pool_token_calls.load(Ordering::SeqCst)
    }

    pub fn set_decimals(&self, token: Address, decimals: u8) {
        self.decimals.lock().unwrap().insert(token, decimals);
    }

    pub fn set_balance(&self, token: Address, holder: Address, block: u64, balance: U256) {
        self.balances.lock().unwrap().insert((token, holder, block), balance);
    }

    pub fn balance_calls(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_balance(&self, fail: bool) {
        self.fail_balance.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChainReader for FakeReader {
    async fn pool_tokens(&self, pool: Address) -> WatchResult<(Address, Address)> {
        self.pool_token_calls.fetch_add(1, Ordering::SeqCst);
        self.pool_tokens
            .lock()
            .unwrap()
            .get(&pool)
            .copied()
            .ok_or_else(|| WatchError::rpc(format!("execution reverted: {}", pool)))
    }

    async fn decimals(&self, token: Address) -> WatchResult<u8> {
        self.decimals
            .lock()
            .unwrap()
            .get(&token)
            .copied()
            .ok_or_else(|| WatchError::rpc("execution reverted"))
    }

    async fn balance_at(&self, token: Address, holder: Address, block: u64) -> WatchResult<U256> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_balance.load(Ordering::SeqCst) {
            return Err(WatchError::rpc("header not found"));
        }
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&(token, holder, block))
            .copied()
            .unwrap_or(U256::ZERO))
    }
}

pub struct FakeHandle {
    chain: ChainId,
    transport: TransportKind,
    reader: Arc<FakeReader>,
    open: AtomicBool,
    closed: AtomicBool,
    fail_subscribe: AtomicBool,
    subscribe_calls: AtomicUsize,
    senders: Mutex<Vec<mpsc::Sender<PoolEvent>>>,
}

impl FakeHandle {
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Push an event as if a subscription had received it
    pub async fn emit(&self, event: PoolEvent) {
        let sender = self.senders.lock().unwrap().first().cloned();
        if let Some(tx) = sender {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl ChainHandle for FakeHandle {
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
        self.open.load(Ordering::SeqCst) && !self.is_closed()
    }

    async fn subscribe_pool(
        &self,
        _meta: PoolMeta,
        version: ProtocolVersion,
        events: mpsc::Sender<PoolEvent>,
    ) -> WatchResult<PoolSubscription> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(WatchError::rpc("subscription rejected"));
        }

        self.senders.lock().unwrap().push(events.clone());
        let task = tokio::spawn(async move {
            let _events = events;
            std::future::pending::<()>().await;
        });
        Ok(PoolSubscription::new(version, task))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeConnector {
    transport: TransportKind,
    reader: Arc<FakeReader>,
    fail: AtomicBool,
    connect_calls: AtomicUsize,
    handles: Mutex<Vec<Arc<FakeHandle>>>,
}

impl FakeConnector {
    fn with_transport(transport: TransportKind) -> Self {
        Self {
            transport,
            reader: Arc::new(FakeReader::default()),
            fail: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn streaming() -> Self {
        Self::with_transport(TransportKind::Streaming)
    }

    pub fn polling() -> Self {
        Self::with_transport(TransportKind::Polling)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Most recently created handle
    pub fn latest(&self) -> Arc<FakeHandle> {
        self.handles
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no handle created yet")
    }

    /// Reader shared by every handle this connector creates
    pub fn reader(&self) -> Arc<FakeReader> {
        self.reader.clone()
    }
}

#[async_trait]
impl ChainConnector for FakeConnector {
    async fn connect(&self, chain: &ChainId) -> WatchResult<Arc<dyn ChainHandle>> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(WatchError::ConnectionLost {
                chain: chain.clone(),
                reason: "connection refused".into(),
            });
        }

        let handle = Arc::new(FakeHandle {
            chain: chain.clone(),
            transport: self.transport,
            reader: self.reader.clone(),
            open: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            subscribe_calls: AtomicUsize::new(0),
            senders: Mutex::new(Vec::new()),
        });
        self.handles.lock().unwrap().push(handle.clone());
        Ok(handle)
    }
}

#[derive(Default)]
pub struct FakeDiscovery {
    token_pools: Mutex<HashMap<(ChainId, String), Vec<PoolCandidate>>>,
    new_pools: Mutex<HashMap<ChainId, Vec<PoolCandidate>>>,
    token_pool_calls: AtomicUsize,
    new_pool_calls: AtomicUsize,
}

impl FakeDiscovery {
    pub fn set_token_pools(&self, chain: &str, token: &str, pools: Vec<PoolCandidate>) {
        self.token_pools
            .lock()
            .unwrap()
            .insert((ChainId::new(chain), token.to_lowercase()), pools);
    }

    pub fn set_new_pools(&self, chain: &str, pools: Vec<PoolCandidate>) {
        self.new_pools.lock().unwrap().insert(ChainId::new(chain), pools);
    }

    pub fn token_pool_calls(&self) -> usize {
        self.token_pool_calls.load(Ordering::SeqCst)
    }

    pub fn new_pool_calls(&self) -> usize {
        self.new_pool_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PoolDiscovery for FakeDiscovery {
    async fn token_pools(&self, chain: &ChainId, token: &str) -> WatchResult<Vec<PoolCandidate>> {
        self.token_pool_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .token_pools
            .lock()
            .unwrap()
            .get(&(chain.clone(), token.to_lowercase()))
            .cloned()
            .unwrap_or_default())
    }

    async fn new_pools(&self, chain: &ChainId) -> WatchResult<Vec<PoolCandidate>> {
        self.new_pool_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.new_pools.lock().unwrap().get(chain).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeMarket {
    native: Mutex<HashMap<ChainId, f64>>,
    details: Mutex<HashMap<(ChainId, Address), PairDetail>>,
    fail: AtomicBool,
    native_calls: AtomicUsize,
    pair_calls: AtomicUsize,
}

impl FakeMarket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_native_price(&self, chain: &str, price: f64) {
        self.native.lock().unwrap().insert(ChainId::new(chain), price);
    }

    pub fn set_pair_detail(&self, chain: &str, pool: Address, detail: PairDetail) {
        self.details.lock().unwrap().insert((ChainId::new(chain), pool), detail);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn native_calls(&self) -> usize {
        self.native_calls.load(Ordering::SeqCst)
    }

    pub fn pair_calls(&self) -> usize {
        self.pair_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PairDetailSource for FakeMarket {
    async fn pair_detail(&self, chain: &ChainId, pool: Address) -> WatchResult<PairDetail> {
        self.pair_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(WatchError::lookup("503 Service Unavailable"));
        }
        Ok(self
            .details
            .lock()
            .unwrap()
            .get(&(chain.clone(), pool))
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl NativePriceSource for FakeMarket {
    async fn native_price_usd(&self, chain: &ChainId) -> WatchResult<f64> {
        self.native_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(WatchError::lookup("503 Service Unavailable"));
        }
        self.native
            .lock()
            .unwrap()
            .get(chain)
            .copied()
            .ok_or_else(|| WatchError::lookup(format!("no price for {}", chain)))
    }
}

/// Sink that keeps every delivered payload
#[derive(Default)]
pub struct RecordingSink {
    payloads: Mutex<Vec<AlertPayload>>,
}

impl RecordingSink {
    pub fn payloads(&self) -> Vec<AlertPayload> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn deliver(&self, payload: &AlertPayload) -> WatchResult<()> {
        self.payloads.lock().unwrap().push(payload.clone());
        Ok(())
    }
}
