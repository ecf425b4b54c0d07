//! Buyer position tracking
//!
//! For buys above a USD floor, read the buyer's balance of the tracked token
//! one block before the trade and report how much this purchase grew it.
//!
//! Created: 2026-10-06

use alloy::primitives::{Address, U256};
use tracing::debug;

use crate::chain::ChainReader;
use crate::types::PositionChange;

/// round(purchased / pre * 100), or Unknown when pre is zero
pub fn increase_percent(pre: U256, purchased: U256) -> PositionChange {
    if pre.is_zero() {
        return PositionChange::Unknown;
    }

    // (purchased * 200 + pre) / (2 * pre) == round-half-up of purchased * 100 / pre
    let Some(numerator) = purchased
        .checked_mul(U256::from(200u64))
        .and_then(|n| n.checked_add(pre))
    else {
        return PositionChange::Increase(i64::MAX);
    };
    let Some(denominator) = pre.checked_mul(U256::from(2u64)) else {
        return PositionChange::Unknown;
    };

    let pct = numerator / denominator;
    if pct > U256::from(i64::MAX as u64) {
        PositionChange::Increase(i64::MAX)
    } else {
        PositionChange::Increase(pct.to::<u64>() as i64)
    }
}

pub struct PositionTracker {
    floor_usd: f64,
}

impl PositionTracker {
    pub fn new(floor_usd: f64) -> Self {
        Self { floor_usd }
    }

    /// Position change for `buyer` after receiving `purchased` of `token`
    /// in `block`. Any lookup failure degrades to Unknown.
    pub async fn position_change(
        &self,
        reader: &dyn ChainReader,
        token: Address,
        buyer: Address,
        block: u64,
        purchased: U256,
        usd_value: f64,
    ) -> PositionChange {
        if usd_value < self.floor_usd || block == 0 {
            return PositionChange::Unknown;
        }

        match reader.balance_at(token, buyer, block - 1).await {
            Ok(pre) => increase_percent(pre, purchased),
            Err(e) => {
                debug!("Balance of {} at block {} unavailable: {}", buyer, block - 1, e);
                PositionChange::Unknown
            }
        }
    }
}
