//! Error taxonomy for the tracking core
//!
//! Every failure the core can observe falls into one of a few buckets:
//! - TransientLookup: an external API or chain query was unreachable.
//!   Callers log it and continue with a safe default.
//! - MalformedInput: a single unit (pool address, log, token metadata) is
//!   unusable. Callers skip that unit and continue.
//! - ConnectionLost: a chain handle died. Drives reconnection.
//!
//! Persistence is fire-and-forget (`ConfigStore::mark_dirty`) and has no
//! error variant here.
//!
//! Created: 2026-10-02

use thiserror::Error;

use crate::types::ChainId;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("lookup failed: {0}")]
    TransientLookup(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("connection lost on {chain}: {reason}")]
    ConnectionLost { chain: ChainId, reason: String },

    #[error("unknown chain: {0}")]
    UnknownChain(ChainId),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rpc error: {0}")]
    Rpc(String),
}

impl WatchError {
    pub fn rpc(e: impl std::fmt::Display) -> Self {
        WatchError::Rpc(e.to_string())
    }

    pub fn lookup(e: impl std::fmt::Display) -> Self {
        WatchError::TransientLookup(e.to_string())
    }

    /// True for failures that should be retried on a later cycle rather than
    /// treated as a permanent skip.
    pub fn is_transient(&self) -> bool {
        !matches!(self, WatchError::MalformedInput(_) | WatchError::UnknownChain(_))
    }
}

pub type WatchResult<T> = std::result::Result<T, WatchError>;
