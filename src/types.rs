//! Core data structures shared by the tracking pipeline
//!
//! Created: 2026-10-02

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::decoder::SwapEvent;

/// Upper bound on emoji repetitions in one alert
pub const MAX_EMOJI_REPEAT: usize = 100;

/// Chain identifier (lowercase slug, e.g. "ethereum", "base", "bsc")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ChainId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<ChainId> for String {
    fn from(c: ChainId) -> Self {
        c.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Alert destination (group/chat identifier owned by the transport)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationId(pub String);

impl DestinationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pool generations we subscribe to. Each reports swaps with its own event layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V2,
    V3,
    V4,
}

impl ProtocolVersion {
    pub const ALL: [ProtocolVersion; 3] = [ProtocolVersion::V2, ProtocolVersion::V3, ProtocolVersion::V4];
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolVersion::V2 => write!(f, "V2"),
            ProtocolVersion::V3 => write!(f, "V3"),
            ProtocolVersion::V4 => write!(f, "V4"),
        }
    }
}

/// Lowercase an address string for comparisons and map keys.
pub fn normalize_addr(addr: &str) -> String {
    addr.trim().to_lowercase()
}

/// Parse a well-formed `0x`-prefixed 20-byte hex address.
/// Checksum casing is not enforced; anything else is rejected.
pub fn parse_address(addr: &str) -> Option<Address> {
    let trimmed = addr.trim();
    let hex = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X"))?;
    if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    hex.parse::<Address>().ok()
}

/// Key form of an alloy address (lowercase hex with 0x)
pub fn addr_key(addr: &Address) -> String {
    format!("{:#x}", addr)
}

/// One operator-configured alert: a destination watching one token on one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    pub destination: DestinationId,
    pub chain: ChainId,
    /// Tracked token address (validated on use)
    pub token: String,
    /// Pool addresses to watch; empty triggers pool discovery
    #[serde(default)]
    pub pools: Vec<String>,
    #[serde(default = "default_emoji")]
    pub emoji: String,
    #[serde(default)]
    pub min_buy_usd: f64,
    #[serde(default)]
    pub max_buy_usd: Option<f64>,
    #[serde(default = "default_dollars_per_emoji")]
    pub dollars_per_emoji: f64,
    /// Per-config cooldown override in seconds
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
    /// Image/animation reference forwarded to the transport
    #[serde(default)]
    pub media: Option<String>,
}

fn default_emoji() -> String {
    "🟢".to_string()
}

fn default_dollars_per_emoji() -> f64 {
    50.0
}

impl AlertConfig {
    /// True if this config watches `pool` on `chain` (case-insensitive).
    pub fn references_pool(&self, chain: &ChainId, pool: &str) -> bool {
        if &self.chain != chain {
            return false;
        }
        let key = normalize_addr(pool);
        self.pools.iter().any(|p| normalize_addr(p) == key)
    }

    pub fn token_address(&self) -> Option<Address> {
        parse_address(&self.token)
    }

    /// Emoji repeated once per `dollars_per_emoji` of USD value.
    /// Always at least one, capped at MAX_EMOJI_REPEAT.
    pub fn emoji_bar(&self, usd_value: f64) -> String {
        let count = if self.dollars_per_emoji > 0.0 && usd_value.is_finite() {
            (usd_value / self.dollars_per_emoji).floor().max(1.0) as usize
        } else {
            1
        };
        self.emoji.repeat(count.min(MAX_EMOJI_REPEAT))
    }
}

/// Static facts about a watched pool, carried by every event it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMeta {
    pub chain: ChainId,
    pub pool: Address,
    pub token0: Address,
    pub token1: Address,
    pub tracked_token: Address,
}

impl PoolMeta {
    /// Which side of the pool the tracked token sits on (None if neither).
    pub fn tracked_side(&self) -> Option<PoolSide> {
        if self.token0 == self.tracked_token {
            Some(PoolSide::Token0)
        } else if self.token1 == self.tracked_token {
            Some(PoolSide::Token1)
        } else {
            None
        }
    }

    /// The non-tracked asset of the pool.
    pub fn base_token(&self) -> Address {
        if self.token0 == self.tracked_token {
            self.token1
        } else {
            self.token0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSide {
    Token0,
    Token1,
}

/// A decoded swap event on a watched pool, as emitted by a subscription.
#[derive(Debug, Clone)]
pub struct PoolEvent {
    pub meta: PoolMeta,
    pub event: SwapEvent,
    pub tx_hash: B256,
    pub block_number: u64,
}

/// Protocol-independent trade record: four unsigned legs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalSwap {
    pub chain: ChainId,
    pub pool: Address,
    pub version: ProtocolVersion,
    pub amount0_in: U256,
    pub amount1_in: U256,
    pub amount0_out: U256,
    pub amount1_out: U256,
    pub tx_hash: B256,
    pub block_number: u64,
    /// Recipient/sender reported by the event; treated as the buyer
    pub counterparty: Address,
}

/// A qualifying buy: base asset in, tracked token out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyLegs {
    pub base_in: U256,
    pub tracked_out: U256,
}

/// Buyer position change after a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionChange {
    /// Prior balance zero, value below floor, or lookup failed
    Unknown,
    /// Rounded percentage increase over the prior balance
    Increase(i64),
}

impl fmt::Display for PositionChange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PositionChange::Unknown => write!(f, "unknown"),
            PositionChange::Increase(p) => write!(f, "+{}%", p),
        }
    }
}

/// Pool surfaced by a discovery lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolCandidate {
    pub chain: ChainId,
    pub pool_address: String,
    pub dex_id: String,
    pub liquidity_usd: f64,
    #[serde(default)]
    pub base_symbol: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Pair-level market facts from a pair-detail lookup
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PairDetail {
    pub price_usd: Option<f64>,
    pub volume_24h: f64,
    pub market_cap: f64,
    pub liquidity_usd: f64,
    pub base_symbol: String,
    pub base_address: Option<Address>,
    pub quote_symbol: String,
}
