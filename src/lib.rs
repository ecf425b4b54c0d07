//! DEX Buy Alert Tracker Library
//!
//! Watches configured liquidity pools on several EVM chains, recognises buys
//! of tracked tokens across V2, V3 and V4 pool generations, values them in
//! USD and hands alerts to a per-destination delivery queue.
//!
//! Created: 2026-10-02

pub mod alert;
pub mod cache;
pub mod chain;
pub mod config;
pub mod connection;
pub mod contracts;
pub mod cooldown;
pub mod decoder;
pub mod dispatch;
pub mod enrichment;
pub mod error;
pub mod market;
pub mod position;
pub mod registry;
pub mod scanner;
pub mod store;
pub mod tracker;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use alert::{AlertPayload, AlertSink, LogSink, WebhookSink};
pub use chain::{AlloyConnector, ChainConnector, ChainHandle, ChainReader};
pub use config::Settings;
pub use dispatch::{DispatchQueue, SerialDispatcher};
pub use error::{WatchError, WatchResult};
pub use market::MarketDataClient;
pub use store::{ConfigStore, JsonConfigStore};
pub use tracker::{Tracker, TrackerDeps, TrackerStats};
pub use types::{AlertConfig, ChainId, DestinationId, PoolMeta, ProtocolVersion};
