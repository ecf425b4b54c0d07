//! Swap Enrichment: prices, market facts and decimals for accepted buys
//!
//! Purpose:
//!     Turn a qualifying buy (raw legs) into USD terms with enough market
//!     context to render an alert. Every lookup has a safe fallback, so
//!     enrichment itself never fails a swap.
//!
//! Created: 2026-10-05
//!
//! Caches:
//!     - pair facts per (chain, pool), TTL 15s by default
//!     - native USD price per chain, TTL 30s, hardcoded per-chain fallback
//!     - token decimals per (chain, token), kept until clear_caches
//!
//! USD value:
//!     base leg x native price when the base asset is the wrapped native
//!     token; tracked leg x token price otherwise. A non-native base with no
//!     usable token price leaves the value unknown (None), and downstream
//!     bounds checks are skipped rather than fed a guessed number.

use alloy::primitives::utils::format_units;
use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::TtlCache;
use crate::chain::ChainReader;
use crate::config::ChainSettings;
use crate::market::{NativePriceSource, PairDetailSource};
use crate::types::{BuyLegs, ChainId, PairDetail, PoolMeta};

pub const DEFAULT_DECIMALS: u8 = 18;
pub const MAX_DECIMALS: u8 = 36;

/// Decimal-adjusted value of a raw token amount
pub fn to_units(amount: U256, decimals: u8) -> f64 {
    format_units(amount, decimals)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Reported decimals, or 18 when the value is outside 0..=36
pub fn sanitize_decimals(reported: u8) -> u8 {
    if reported <= MAX_DECIMALS {
        reported
    } else {
        DEFAULT_DECIMALS
    }
}

#[derive(Debug, Clone)]
struct NativeAsset {
    wrapped: Address,
    symbol: String,
    default_price_usd: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedSwap {
    pub detail: PairDetail,
    pub token_symbol: String,
    pub base_symbol: String,
    pub base_decimals: u8,
    pub tracked_decimals: u8,
    pub base_amount: f64,
    pub tracked_amount: f64,
    pub native_price_usd: f64,
    pub token_price_usd: f64,
    /// None when the swap cannot be priced
    pub usd_value: Option<f64>,
}

/// USD price of the tracked token implied by pair facts.
///
/// DexScreener prices the pair's base token; when the tracked token is the
/// quote side, convert through the swap's own exchange rate.
fn tracked_price(detail: &PairDetail, tracked: Address, base_amount: f64, tracked_amount: f64) -> Option<f64> {
    let price = detail.price_usd.filter(|p| *p > 0.0)?;
    match detail.base_address {
        None => Some(price),
        Some(addr) if addr == tracked => Some(price),
        Some(_) if tracked_amount > 0.0 => Some(price * base_amount / tracked_amount),
        Some(_) => None,
    }
}

/// (usd_value, token_price_usd)
fn usd_value(
    base_is_native: bool,
    base_amount: f64,
    tracked_amount: f64,
    native_price: f64,
    token_price: Option<f64>,
) -> (Option<f64>, f64) {
    if base_is_native {
        let value = base_amount * native_price;
        let implied = if tracked_amount > 0.0 { value / tracked_amount } else { 0.0 };
        return (Some(value), token_price.unwrap_or(implied));
    }
    match token_price {
        Some(price) => (Some(tracked_amount * price), price),
        // The base leg is not priced in native terms
        None => (None, 0.0),
    }
}

pub struct Enrichment {
    pairs: Arc<dyn PairDetailSource>,
    native: Arc<dyn NativePriceSource>,
    pair_cache: TtlCache<(ChainId, Address), PairDetail>,
    native_cache: TtlCache<ChainId, f64>,
    decimals: DashMap<(ChainId, Address), u8>,
    assets: HashMap<ChainId, NativeAsset>,
}

impl Enrichment {
    pub fn new<'a>(
        pairs: Arc<dyn PairDetailSource>,
        native: Arc<dyn NativePriceSource>,
        pair_ttl: Duration,
        native_ttl: Duration,
        chains: impl IntoIterator<Item = &'a ChainSettings>,
    ) -> Self {
        let assets = chains
            .into_iter()
            .map(|c| {
                (
                    c.id.clone(),
                    NativeAsset {
                        wrapped: c.wrapped_native,
                        symbol: c.native_symbol.clone(),
                        default_price_usd: c.default_native_price_usd,
                    },
                )
            })
            .collect();

        Self {
            pairs,
            native,
            pair_cache: TtlCache::new(pair_ttl),
            native_cache: TtlCache::new(native_ttl),
            decimals: DashMap::new(),
            assets,
        }
    }

    /// Pair facts, or zeros when no data can be had
    pub async fn pair_detail(&self, chain: &ChainId, pool: Address) -> PairDetail {
        self.pair_cache
            .get_or_refresh((chain.clone(), pool), || self.pairs.pair_detail(chain, pool))
            .await
            .unwrap_or_else(|e| {
                debug!("Pair detail {} on {} unavailable: {}", pool, chain, e);
                PairDetail::default()
            })
    }

    /// Native USD price, falling back to the chain's hardcoded default
    pub async fn native_price(&self, chain: &ChainId) -> f64 {
        let fetched = self
            .native_cache
            .get_or_refresh(chain.clone(), || self.native.native_price_usd(chain))
            .await;

        match fetched {
            Ok(price) if price > 0.0 => price,
            Ok(_) | Err(_) => {
                let fallback = self.assets.get(chain).map_or(0.0, |a| a.default_price_usd);
                debug!("Native price for {} unavailable, using default ${}", chain, fallback);
                fallback
            }
        }
    }

    /// Token decimals from chain; 18 on failure or implausible values.
    /// Only successful reads are cached.
    pub async fn decimals(&self, reader: &dyn ChainReader, chain: &ChainId, token: Address) -> u8 {
        let key = (chain.clone(), token);
        if let Some(d) = self.decimals.get(&key) {
            return *d;
        }

        match reader.decimals(token).await {
            Ok(reported) => {
                let d = sanitize_decimals(reported);
                if d != reported {
                    debug!("Token {} reported {} decimals, using {}", token, reported, d);
                }
                self.decimals.insert(key, d);
                d
            }
            Err(e) => {
                debug!("decimals() failed for {} on {}: {}", token, chain, e);
                DEFAULT_DECIMALS
            }
        }
    }

    pub fn is_wrapped_native(&self, chain: &ChainId, token: Address) -> bool {
        self.assets.get(chain).map_or(false, |a| a.wrapped == token)
    }

    pub async fn enrich(&self, reader: &dyn ChainReader, meta: &PoolMeta, legs: &BuyLegs) -> EnrichedSwap {
        let base = meta.base_token();
        let detail = self.pair_detail(&meta.chain, meta.pool).await;
        let base_decimals = self.decimals(reader, &meta.chain, base).await;
        let tracked_decimals = self.decimals(reader, &meta.chain, meta.tracked_token).await;
        let native_price_usd = self.native_price(&meta.chain).await;

        let base_amount = to_units(legs.base_in, base_decimals);
        let tracked_amount = to_units(legs.tracked_out, tracked_decimals);
        let base_is_native = self.is_wrapped_native(&meta.chain, base);

        let price = tracked_price(&detail, meta.tracked_token, base_amount, tracked_amount);
        let (usd_value, token_price_usd) =
            usd_value(base_is_native, base_amount, tracked_amount, native_price_usd, price);

        let tracked_is_pair_base = detail.base_address.map_or(true, |a| a == meta.tracked_token);
        let (token_symbol, other_symbol) = if tracked_is_pair_base {
            (detail.base_symbol.clone(), detail.quote_symbol.clone())
        } else {
            (detail.quote_symbol.clone(), detail.base_symbol.clone())
        };
        let base_symbol = match self.assets.get(&meta.chain) {
            Some(asset) if base_is_native => asset.symbol.clone(),
            _ => other_symbol,
        };

        EnrichedSwap {
            detail,
            token_symbol,
            base_symbol,
            base_decimals,
            tracked_decimals,
            base_amount,
            tracked_amount,
            native_price_usd,
            token_price_usd,
            usd_value,
        }
    }

    pub fn clear(&self) {
        self.pair_cache.clear();
        self.native_cache.clear();
        self.decimals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::testing::{pool_meta, units, FakeMarket, FakeReader};

    fn enrichment(market: Arc<FakeMarket>) -> Enrichment {
        let settings = Settings::default();
        Enrichment::new(
            market.clone(),
            market,
            Duration::from_secs(15),
            Duration::from_secs(30),
            &settings.chains,
        )
    }

    fn weth() -> Address {
        crate::types::parse_address("0x4200000000000000000000000000000000000006").unwrap()
    }

    #[test]
    fn test_to_units_and_decimals() {
        assert_eq!(to_units(U256::from(1_500_000u64), 6), 1.5);
        assert_eq!(to_units(U256::from(10u64).pow(U256::from(18u64)), 18), 1.0);
        assert_eq!(sanitize_decimals(6), 6);
        assert_eq!(sanitize_decimals(36), 36);
        assert_eq!(sanitize_decimals(77), 18);
    }

    #[test]
    fn test_usd_value_rules() {
        // Native base: base leg x native price
        assert_eq!(usd_value(true, 0.1, 1_000.0, 2_300.0, Some(5.0)), (Some(230.0), 5.0));
        // Non-native base with a token price: tracked leg x price
        assert_eq!(usd_value(false, 230.0, 1_000.0, 2_300.0, Some(0.25)), (Some(250.0), 0.25));
        // Native base without a token price: price implied by the swap
        let (v, p) = usd_value(true, 0.1, 1_000.0, 2_300.0, None);
        assert_eq!(v, Some(230.0));
        assert!((p - 0.23).abs() < 1e-12);
        // Non-native base without a token price: unknown, never base x native
        assert_eq!(usd_value(false, 100.0, 1_000.0, 2_300.0, None), (None, 0.0));
    }

    #[test]
    fn test_tracked_price_from_quote_side() {
        let tracked = Address::repeat_byte(0xAA);
        let detail = PairDetail {
            price_usd: Some(1.0),
            base_address: Some(Address::repeat_byte(0xBB)),
            ..Default::default()
        };
        // 200 base (at $1) bought 100 tracked: $2 each
        assert_eq!(tracked_price(&detail, tracked, 200.0, 100.0), Some(2.0));

        let direct = PairDetail {
            price_usd: Some(3.0),
            base_address: Some(tracked),
            ..Default::default()
        };
        assert_eq!(tracked_price(&direct, tracked, 1.0, 1.0), Some(3.0));
        assert_eq!(tracked_price(&PairDetail::default(), tracked, 1.0, 1.0), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_price_cached_then_fallback() {
        let market = Arc::new(FakeMarket::new());
        market.set_native_price("base", 2_000.0);
        let e = enrichment(market.clone());
        let base = ChainId::new("base");

        assert_eq!(e.native_price(&base).await, 2_000.0);
        assert_eq!(e.native_price(&base).await, 2_000.0);
        assert_eq!(market.native_calls(), 1);

        // Never fetched and the source fails: hardcoded default
        market.set_fail(true);
        assert_eq!(e.native_price(&ChainId::new("bsc")).await, 600.0);

        // Expired and failing: last known value
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(e.native_price(&base).await, 2_000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_detail_failure_yields_zeros() {
        let market = Arc::new(FakeMarket::new());
        market.set_fail(true);
        let e = enrichment(market);
        let d = e.pair_detail(&ChainId::new("base"), Address::repeat_byte(1)).await;
        assert_eq!(d.volume_24h, 0.0);
        assert_eq!(d.market_cap, 0.0);
    }

    #[tokio::test]
    async fn test_decimals_fallback() {
        let market = Arc::new(FakeMarket::new());
        let e = enrichment(market);
        let reader = FakeReader::default();
        let chain = ChainId::new("base");

        reader.set_decimals(Address::repeat_byte(1), 6);
        reader.set_decimals(Address::repeat_byte(2), 200);
        assert_eq!(e.decimals(&reader, &chain, Address::repeat_byte(1)).await, 6);
        assert_eq!(e.decimals(&reader, &chain, Address::repeat_byte(2)).await, 18);
        // Unknown token: query fails
        assert_eq!(e.decimals(&reader, &chain, Address::repeat_byte(3)).await, 18);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enrich_native_base() {
        let market = Arc::new(FakeMarket::new());
        market.set_native_price("base", 2_300.0);
        let e = enrichment(market);
        let reader = FakeReader::default();

        // token0 = WETH (base), token1 = tracked
        let mut meta = pool_meta("base", 0x01, 0xAA, 0xBB);
        meta.token0 = weth();
        reader.set_decimals(weth(), 18);
        reader.set_decimals(meta.tracked_token, 9);

        let legs = BuyLegs {
            base_in: U256::from(100_000_000_000_000_000u64), // 0.1 WETH
            tracked_out: U256::from(5_000_000_000_000u64),   // 5000 tokens
        };
        let out = e.enrich(&reader, &meta, &legs).await;
        assert_eq!(out.base_symbol, "ETH");
        assert!((out.usd_value.unwrap() - 230.0).abs() < 1e-9);
        assert_eq!(out.tracked_amount, 5_000.0);
        assert!((out.token_price_usd - 0.046).abs() < 1e-12);
    }

    /// USDC-like base (token0, 6 decimals) and an 18-decimal tracked token
    fn stable_pool(reader: &FakeReader) -> (PoolMeta, BuyLegs) {
        let meta = pool_meta("base", 0x01, 0xAA, 0xBB);
        reader.set_decimals(meta.token0, 6);
        reader.set_decimals(meta.tracked_token, 18);
        let legs = BuyLegs {
            base_in: units(100, 6),
            tracked_out: units(1_000, 18),
        };
        (meta, legs)
    }

    #[tokio::test(start_paused = true)]
    async fn test_enrich_unpriced_stable_base_is_unknown() {
        let market = Arc::new(FakeMarket::new());
        market.set_native_price("base", 2_500.0);
        market.set_fail(true);
        let e = enrichment(market);
        let reader = FakeReader::default();
        let (meta, legs) = stable_pool(&reader);

        let out = e.enrich(&reader, &meta, &legs).await;
        assert_eq!(out.base_amount, 100.0);
        assert_eq!(out.tracked_amount, 1_000.0);
        assert_eq!(out.usd_value, None);
        assert_eq!(out.token_price_usd, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enrich_prices_tracked_leg() {
        let market = Arc::new(FakeMarket::new());
        market.set_native_price("base", 2_500.0);
        let reader = FakeReader::default();
        let (meta, legs) = stable_pool(&reader);
        market.set_pair_detail(
            "base",
            meta.pool,
            PairDetail {
                price_usd: Some(0.1),
                market_cap: 1e6,
                base_symbol: "MEME".into(),
                base_address: Some(meta.tracked_token),
                quote_symbol: "USDC".into(),
                ..Default::default()
            },
        );
        let e = enrichment(market);

        let out = e.enrich(&reader, &meta, &legs).await;
        assert!((out.usd_value.unwrap() - 100.0).abs() < 1e-9);
        assert_eq!(out.token_price_usd, 0.1);
        assert_eq!(out.token_symbol, "MEME");
        assert_eq!(out.base_symbol, "USDC");
        assert_eq!(out.detail.market_cap, 1e6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enrich_converts_quote_side_price() {
        let market = Arc::new(FakeMarket::new());
        let reader = FakeReader::default();
        let (meta, legs) = stable_pool(&reader);
        // Pair is listed USDC/MEME: the listed price is the stable's
        market.set_pair_detail(
            "base",
            meta.pool,
            PairDetail {
                price_usd: Some(1.0),
                base_symbol: "USDC".into(),
                base_address: Some(meta.token0),
                quote_symbol: "MEME".into(),
                ..Default::default()
            },
        );
        let e = enrichment(market);

        let out = e.enrich(&reader, &meta, &legs).await;
        // 100 USDC for 1000 MEME: $0.10 each
        assert!((out.token_price_usd - 0.1).abs() < 1e-12);
        assert!((out.usd_value.unwrap() - 100.0).abs() < 1e-9);
        assert_eq!(out.token_symbol, "MEME");
        assert_eq!(out.base_symbol, "USDC");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_detail_cached_for_ttl() {
        let market = Arc::new(FakeMarket::new());
        let e = enrichment(market.clone());
        let reader = FakeReader::default();
        let (meta, legs) = stable_pool(&reader);

        e.enrich(&reader, &meta, &legs).await;
        e.enrich(&reader, &meta, &legs).await;
        assert_eq!(market.pair_calls(), 1);

        tokio::time::advance(Duration::from_secs(14)).await;
        e.enrich(&reader, &meta, &legs).await;
        assert_eq!(market.pair_calls(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        e.enrich(&reader, &meta, &legs).await;
        assert_eq!(market.pair_calls(), 2);
    }
}
