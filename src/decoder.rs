//! Swap Event Decoder
//!
//! Purpose:
//!     Decode raw pool logs into a tagged union of the three swap layouts we
//!     watch, and normalize every variant into one four-leg CanonicalSwap
//!     before any filtering logic looks at it.
//!
//! Created: 2026-10-02
//!
//! Event layouts:
//!     V2: Swap(address,uint256,uint256,uint256,uint256,address)
//!         four unsigned legs reported directly
//!     V3: Swap(address,address,int256,int256,uint160,uint128,int24)
//!         two signed net deltas, pool perspective
//!     V4: Swap(bytes32,address,int128,int128,uint160,uint128,int24,uint24)
//!         two signed net deltas, same sign convention as V3
//!
//! Sign convention (V3/V4): positive = asset entered the pool,
//! negative = asset left the pool.

use alloy::primitives::{Address, B256, I256, U256};
use alloy::primitives::LogData;
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use tracing::trace;

use crate::contracts::{IPoolManager, IUniswapV2Pair, IUniswapV3Pool};
use crate::types::{BuyLegs, CanonicalSwap, PoolMeta, PoolSide, ProtocolVersion};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V2Swap {
    pub sender: Address,
    pub to: Address,
    pub amount0_in: U256,
    pub amount1_in: U256,
    pub amount0_out: U256,
    pub amount1_out: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V3Swap {
    pub sender: Address,
    pub recipient: Address,
    pub amount0: I256,
    pub amount1: I256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V4Swap {
    pub id: B256,
    pub sender: Address,
    pub amount0: i128,
    pub amount1: i128,
}

/// One decoded swap, in its native shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapEvent {
    V2(V2Swap),
    V3(V3Swap),
    V4(V4Swap),
}

impl SwapEvent {
    pub fn version(&self) -> ProtocolVersion {
        match self {
            SwapEvent::V2(_) => ProtocolVersion::V2,
            SwapEvent::V3(_) => ProtocolVersion::V3,
            SwapEvent::V4(_) => ProtocolVersion::V4,
        }
    }
}

/// topic0 of the swap event for a protocol version
pub fn swap_topic(version: ProtocolVersion) -> B256 {
    match version {
        ProtocolVersion::V2 => IUniswapV2Pair::Swap::SIGNATURE_HASH,
        ProtocolVersion::V3 => IUniswapV3Pool::Swap::SIGNATURE_HASH,
        ProtocolVersion::V4 => IPoolManager::Swap::SIGNATURE_HASH,
    }
}

/// Decode an RPC log. Returns None for non-swap or malformed logs.
pub fn decode_log(log: &Log) -> Option<SwapEvent> {
    decode_log_data(&log.inner.data)
}

/// Decode raw log data by matching topic0 against the three swap signatures.
pub fn decode_log_data(data: &LogData) -> Option<SwapEvent> {
    let topic0 = *data.topics().first()?;

    if topic0 == IUniswapV2Pair::Swap::SIGNATURE_HASH {
        let ev = IUniswapV2Pair::Swap::decode_log_data(data).ok()?;
        return Some(SwapEvent::V2(V2Swap {
            sender: ev.sender,
            to: ev.to,
            amount0_in: ev.amount0In,
            amount1_in: ev.amount1In,
            amount0_out: ev.amount0Out,
            amount1_out: ev.amount1Out,
        }));
    }

    if topic0 == IUniswapV3Pool::Swap::SIGNATURE_HASH {
        let ev = IUniswapV3Pool::Swap::decode_log_data(data).ok()?;
        return Some(SwapEvent::V3(V3Swap {
            sender: ev.sender,
            recipient: ev.recipient,
            amount0: ev.amount0,
            amount1: ev.amount1,
        }));
    }

    if topic0 == IPoolManager::Swap::SIGNATURE_HASH {
        let ev = IPoolManager::Swap::decode_log_data(data).ok()?;
        return Some(SwapEvent::V4(V4Swap {
            id: ev.id,
            sender: ev.sender,
            amount0: ev.amount0,
            amount1: ev.amount1,
        }));
    }

    trace!("Unknown topic0: {:?}", topic0);
    None
}

/// Split a signed pool-perspective delta into (in, out) legs.
fn legs_from_i256(delta: I256) -> (U256, U256) {
    if delta.is_negative() {
        (U256::ZERO, delta.unsigned_abs())
    } else {
        (delta.unsigned_abs(), U256::ZERO)
    }
}

fn legs_from_i128(delta: i128) -> (U256, U256) {
    let abs = U256::from(delta.unsigned_abs());
    if delta < 0 {
        (U256::ZERO, abs)
    } else {
        (abs, U256::ZERO)
    }
}

/// Map any swap variant into the canonical four-leg record.
pub fn normalize(event: &SwapEvent, meta: &PoolMeta, tx_hash: B256, block_number: u64) -> CanonicalSwap {
    let (amount0_in, amount1_in, amount0_out, amount1_out, counterparty) = match event {
        SwapEvent::V2(s) => (s.amount0_in, s.amount1_in, s.amount0_out, s.amount1_out, s.to),
        SwapEvent::V3(s) => {
            let (a0_in, a0_out) = legs_from_i256(s.amount0);
            let (a1_in, a1_out) = legs_from_i256(s.amount1);
            (a0_in, a1_in, a0_out, a1_out, s.recipient)
        }
        SwapEvent::V4(s) => {
            let (a0_in, a0_out) = legs_from_i128(s.amount0);
            let (a1_in, a1_out) = legs_from_i128(s.amount1);
            (a0_in, a1_in, a0_out, a1_out, s.sender)
        }
    };

    CanonicalSwap {
        chain: meta.chain.clone(),
        pool: meta.pool,
        version: event.version(),
        amount0_in,
        amount1_in,
        amount0_out,
        amount1_out,
        tx_hash,
        block_number,
        counterparty,
    }
}

/// Extract the buy legs if this swap is a qualifying buy of the tracked token:
/// base asset strictly in, tracked token strictly out. None otherwise.
pub fn buy_legs(swap: &CanonicalSwap, meta: &PoolMeta) -> Option<BuyLegs> {
    let (base_in, tracked_out) = match meta.tracked_side()? {
        PoolSide::Token0 => (swap.amount1_in, swap.amount0_out),
        PoolSide::Token1 => (swap.amount0_in, swap.amount1_out),
    };

    if base_in.is_zero() || tracked_out.is_zero() {
        return None;
    }

    Some(BuyLegs { base_in, tracked_out })
}
