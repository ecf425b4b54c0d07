//! Market Data: pool discovery, pair details and native prices over HTTP
//!
//! Purpose:
//!     Collaborator traits the tracker consumes for off-chain market facts,
//!     plus the reqwest-backed client that implements them.
//!
//! Created: 2026-10-05
//!
//! Sources:
//!     - DexScreener: pools for a token, pair details, native price via the
//!       wrapped-native token's deepest pair
//!     - GeckoTerminal: freshly created pools per network
//!
//! All numeric fields arrive as loosely typed JSON (strings or numbers) and
//! are parsed leniently; missing values become zero / None.

use alloy::primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::config::{ApiSettings, ChainSettings};
use crate::error::{WatchError, WatchResult};
use crate::types::{addr_key, normalize_addr, parse_address, ChainId, PairDetail, PoolCandidate};

#[async_trait]
pub trait PoolDiscovery: Send + Sync {
    /// Pools trading `token` on `chain`, in source order
    async fn token_pools(&self, chain: &ChainId, token: &str) -> WatchResult<Vec<PoolCandidate>>;

    /// Recently created pools on `chain`
    async fn new_pools(&self, chain: &ChainId) -> WatchResult<Vec<PoolCandidate>>;
}

#[async_trait]
pub trait PairDetailSource: Send + Sync {
    async fn pair_detail(&self, chain: &ChainId, pool: Address) -> WatchResult<PairDetail>;
}

#[async_trait]
pub trait NativePriceSource: Send + Sync {
    async fn native_price_usd(&self, chain: &ChainId) -> WatchResult<f64>;
}

// ── DexScreener wire types ───────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Num {
    Float(f64),
    Text(String),
}

impl Num {
    fn value(&self) -> Option<f64> {
        let parsed: Option<f64> = match self {
            Num::Float(f) => Some(*f),
            Num::Text(s) => s.trim().parse().ok(),
        };
        parsed.filter(|v| v.is_finite())
    }
}

fn num(v: &Option<Num>) -> Option<f64> {
    v.as_ref().and_then(Num::value)
}

#[derive(Debug, Clone, Deserialize)]
struct DexToken {
    address: String,
    #[serde(default)]
    symbol: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DexVolume {
    #[serde(default)]
    h24: Option<Num>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DexLiquidity {
    #[serde(default)]
    usd: Option<Num>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DexPair {
    chain_id: String,
    #[serde(default)]
    dex_id: String,
    pair_address: String,
    base_token: DexToken,
    quote_token: DexToken,
    #[serde(default)]
    price_native: Option<Num>,
    #[serde(default)]
    price_usd: Option<Num>,
    #[serde(default)]
    volume: DexVolume,
    #[serde(default)]
    liquidity: DexLiquidity,
    #[serde(default)]
    fdv: Option<Num>,
    #[serde(default)]
    market_cap: Option<Num>,
    /// Milliseconds since epoch
    #[serde(default)]
    pair_created_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct DexPairsResponse {
    #[serde(default)]
    pairs: Option<Vec<DexPair>>,
}

impl DexPair {
    fn liquidity_usd(&self) -> f64 {
        num(&self.liquidity.usd).unwrap_or(0.0)
    }

    fn to_candidate(&self, chain: &ChainId) -> PoolCandidate {
        PoolCandidate {
            chain: chain.clone(),
            pool_address: normalize_addr(&self.pair_address),
            dex_id: self.dex_id.clone(),
            liquidity_usd: self.liquidity_usd(),
            base_symbol: Some(self.base_token.symbol.clone()).filter(|s| !s.is_empty()),
            created_at: self
                .pair_created_at
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        }
    }

    fn to_detail(&self) -> PairDetail {
        PairDetail {
            price_usd: num(&self.price_usd),
            volume_24h: num(&self.volume.h24).unwrap_or(0.0),
            // Fully diluted when reported, market cap otherwise
            market_cap: num(&self.fdv).or_else(|| num(&self.market_cap)).unwrap_or(0.0),
            liquidity_usd: self.liquidity_usd(),
            base_symbol: self.base_token.symbol.clone(),
            base_address: parse_address(&self.base_token.address),
            quote_symbol: self.quote_token.symbol.clone(),
        }
    }

    /// USD price of `token` if it is one side of this pair.
    fn usd_price_of(&self, token: &Address) -> Option<f64> {
        let price_usd = num(&self.price_usd)?;
        let key = addr_key(token);
        if normalize_addr(&self.base_token.address) == key {
            return Some(price_usd);
        }
        if normalize_addr(&self.quote_token.address) == key {
            // priceNative = base priced in quote
            let price_native = num(&self.price_native).filter(|p| *p > 0.0)?;
            return Some(price_usd / price_native);
        }
        None
    }
}

fn candidates_on_chain(pairs: &[DexPair], chain: &ChainId, slug: &str) -> Vec<PoolCandidate> {
    pairs
        .iter()
        .filter(|p| p.chain_id.eq_ignore_ascii_case(slug))
        .map(|p| p.to_candidate(chain))
        .collect()
}

fn native_price_from_pairs(pairs: &[DexPair], wrapped_native: &Address) -> Option<f64> {
    pairs
        .iter()
        .filter_map(|p| p.usd_price_of(wrapped_native).map(|price| (p.liquidity_usd(), price)))
        .filter(|(_, price)| *price > 0.0)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, price)| price)
}

// ── GeckoTerminal wire types ─────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct GeckoResponse {
    #[serde(default)]
    data: Vec<GeckoPool>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeckoPool {
    attributes: GeckoAttributes,
    #[serde(default)]
    relationships: Option<GeckoRelationships>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeckoAttributes {
    address: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    reserve_in_usd: Option<Num>,
    #[serde(default)]
    pool_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeckoRelationships {
    #[serde(default)]
    dex: Option<GeckoRelation>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeckoRelation {
    data: Option<GeckoRef>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeckoRef {
    id: String,
}

fn gecko_candidates(resp: GeckoResponse, chain: &ChainId) -> Vec<PoolCandidate> {
    resp.data
        .into_iter()
        .map(|p| PoolCandidate {
            chain: chain.clone(),
            pool_address: normalize_addr(&p.attributes.address),
            dex_id: p
                .relationships
                .and_then(|r| r.dex)
                .and_then(|d| d.data)
                .map(|d| d.id)
                .unwrap_or_default(),
            liquidity_usd: num(&p.attributes.reserve_in_usd).unwrap_or(0.0),
            base_symbol: p
                .attributes
                .name
                .as_deref()
                .and_then(|n| n.split('/').next())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            created_at: p.attributes.pool_created_at,
        })
        .collect()
}

// ── Client ───────────────────────────────────────────────────────────

/// HTTP market-data client for DexScreener and GeckoTerminal.
pub struct MarketDataClient {
    client: reqwest::Client,
    dexscreener_url: String,
    geckoterminal_url: String,
    chains: HashMap<ChainId, ChainSettings>,
}

impl MarketDataClient {
    pub fn new<'a>(api: &ApiSettings, chains: impl IntoIterator<Item = &'a ChainSettings>) -> WatchResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(api.timeout_secs.max(1)))
            .user_agent(concat!("buywatch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            dexscreener_url: api.dexscreener_url.trim_end_matches('/').to_string(),
            geckoterminal_url: api.geckoterminal_url.trim_end_matches('/').to_string(),
            chains: chains.into_iter().map(|c| (c.id.clone(), c.clone())).collect(),
        })
    }

    fn chain(&self, chain: &ChainId) -> WatchResult<&ChainSettings> {
        self.chains
            .get(chain)
            .ok_or_else(|| WatchError::UnknownChain(chain.clone()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> WatchResult<T> {
        debug!("GET {}", url);
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(WatchError::TransientLookup(format!("{} returned {}", url, resp.status())));
        }
        Ok(resp.json::<T>().await?)
    }

    async fn dexscreener_token_pairs(&self, slug: &str, token: &str) -> WatchResult<Vec<DexPair>> {
        let url = format!("{}/token-pairs/v1/{}/{}", self.dexscreener_url, slug, normalize_addr(token));
        self.get_json(&url).await
    }
}

#[async_trait]
impl PoolDiscovery for MarketDataClient {
    async fn token_pools(&self, chain: &ChainId, token: &str) -> WatchResult<Vec<PoolCandidate>> {
        let slug = self.chain(chain)?.dexscreener_slug().to_string();
        let pairs = self.dexscreener_token_pairs(&slug, token).await?;
        Ok(candidates_on_chain(&pairs, chain, &slug))
    }

    async fn new_pools(&self, chain: &ChainId) -> WatchResult<Vec<PoolCandidate>> {
        let network = self.chain(chain)?.geckoterminal_slug().to_string();
        let url = format!("{}/networks/{}/new_pools", self.geckoterminal_url, network);
        let resp: GeckoResponse = self.get_json(&url).await?;
        Ok(gecko_candidates(resp, chain))
    }
}

#[async_trait]
impl PairDetailSource for MarketDataClient {
    async fn pair_detail(&self, chain: &ChainId, pool: Address) -> WatchResult<PairDetail> {
        let slug = self.chain(chain)?.dexscreener_slug().to_string();
        let url = format!("{}/latest/dex/pairs/{}/{}", self.dexscreener_url, slug, addr_key(&pool));
        let resp: DexPairsResponse = self.get_json(&url).await?;
        resp.pairs
            .unwrap_or_default()
            .first()
            .map(DexPair::to_detail)
            .ok_or_else(|| WatchError::TransientLookup(format!("no pair data for {} on {}", pool, chain)))
    }
}

#[async_trait]
impl NativePriceSource for MarketDataClient {
    async fn native_price_usd(&self, chain: &ChainId) -> WatchResult<f64> {
        let settings = self.chain(chain)?;
        let (slug, wrapped) = (settings.dexscreener_slug().to_string(), settings.wrapped_native);
        let pairs = self.dexscreener_token_pairs(&slug, &addr_key(&wrapped)).await?;
        native_price_from_pairs(&pairs, &wrapped)
            .ok_or_else(|| WatchError::TransientLookup(format!("no native price for {}", chain)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WETH: &str = "0x4200000000000000000000000000000000000006";

    fn pairs_json() -> &'static str {
        r#"[
          {
            "chainId": "base",
            "dexId": "uniswap",
            "pairAddress": "0xAAAA000000000000000000000000000000000001",
            "baseToken": {"address": "0x1111000000000000000000000000000000000001", "symbol": "MEME"},
            "quoteToken": {"address": "0x4200000000000000000000000000000000000006", "symbol": "WETH"},
            "priceNative": "0.0000004",
            "priceUsd": "0.001",
            "volume": {"h24": 12345.5},
            "liquidity": {"usd": 50000},
            "fdv": 1000000,
            "marketCap": 900000,
            "pairCreatedAt": 1700000000000
          },
          {
            "chainId": "ethereum",
            "dexId": "uniswap",
            "pairAddress": "0xBBBB000000000000000000000000000000000002",
            "baseToken": {"address": "0x1111000000000000000000000000000000000001", "symbol": "MEME"},
            "quoteToken": {"address": "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2", "symbol": "WETH"},
            "priceUsd": "0.0011",
            "liquidity": {"usd": 90000}
          },
          {
            "chainId": "base",
            "dexId": "aerodrome",
            "pairAddress": "0xCCCC000000000000000000000000000000000003",
            "baseToken": {"address": "0x4200000000000000000000000000000000000006", "symbol": "WETH"},
            "quoteToken": {"address": "0x8335000000000000000000000000000000000000", "symbol": "USDC"},
            "priceNative": "2500",
            "priceUsd": "2501.5",
            "liquidity": {"usd": "1500000.25"}
          }
        ]"#
    }

    fn pairs() -> Vec<DexPair> {
        serde_json::from_str(pairs_json()).unwrap()
    }

    #[test]
    fn test_candidates_filtered_to_chain() {
        let c = candidates_on_chain(&pairs(), &ChainId::new("base"), "base");
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].pool_address, "0xaaaa000000000000000000000000000000000001");
        assert_eq!(c[0].liquidity_usd, 50_000.0);
        assert_eq!(c[0].base_symbol.as_deref(), Some("MEME"));
        assert!(c[0].created_at.is_some());
        assert_eq!(c[1].liquidity_usd, 1_500_000.25);
    }

    #[test]
    fn test_pair_detail_prefers_fdv() {
        let detail = pairs()[0].to_detail();
        assert_eq!(detail.price_usd, Some(0.001));
        assert_eq!(detail.volume_24h, 12345.5);
        assert_eq!(detail.market_cap, 1_000_000.0);
        assert_eq!(detail.liquidity_usd, 50_000.0);
        assert_eq!(detail.quote_symbol, "WETH");

        let sparse = pairs()[1].to_detail();
        assert_eq!(sparse.volume_24h, 0.0);
        assert_eq!(sparse.market_cap, 0.0);
    }

    #[test]
    fn test_native_price_from_deepest_pair() {
        let weth = parse_address(WETH).unwrap();
        let price = native_price_from_pairs(&pairs(), &weth).unwrap();
        // Deepest pair has WETH as base: priceUsd directly
        assert_eq!(price, 2501.5);

        // Quote-side only: priceUsd / priceNative
        let quote_only: Vec<DexPair> = pairs().into_iter().take(1).collect();
        let derived = native_price_from_pairs(&quote_only, &weth).unwrap();
        assert!((derived - 2500.0).abs() < 1e-6);
    }

    #[test]
    fn test_gecko_new_pools() {
        let json = r#"{
          "data": [{
            "id": "base_0xdead",
            "type": "pool",
            "attributes": {
              "address": "0xDEAD000000000000000000000000000000000001",
              "name": "NEW / WETH",
              "reserve_in_usd": "7500.12",
              "pool_created_at": "2026-10-05T12:00:00Z"
            },
            "relationships": {"dex": {"data": {"id": "uniswap_v3", "type": "dex"}}}
          }]
        }"#;
        let resp: GeckoResponse = serde_json::from_str(json).unwrap();
        let c = gecko_candidates(resp, &ChainId::new("base"));
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].dex_id, "uniswap_v3");
        assert_eq!(c[0].base_symbol.as_deref(), Some("NEW"));
        assert_eq!(c[0].liquidity_usd, 7500.12);
        assert_eq!(c[0].pool_address, "0xdead000000000000000000000000000000000001");
    }

    #[test]
    fn test_unknown_chain_rejected() {
        let client = MarketDataClient::new(&ApiSettings::default(), std::iter::empty()).unwrap();
        assert!(matches!(client.chain(&ChainId::new("base")), Err(WatchError::UnknownChain(_))));
    }
}
