//! Alert Cooldown Gate: USD bounds and per destination+pool throttle
//!
//! Purpose:
//!     Last check before an alert reaches the dispatch queue. Drops buys
//!     outside the destination's [min, max] USD window, then suppresses
//!     bursts on the same pool for the same destination.
//!
//! Created: 2026-10-03
//!
//! Design:
//!     - Key: (destination, lowercase pool address)
//!     - Window: config.cooldown_secs, else the gate default (3s)
//!     - Timestamp moves only on acceptance; rejected alerts never extend
//!       the window
//!     - Check-and-set happens under the DashMap entry lock, so two
//!       concurrent handlers for the same key cannot both be accepted

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::types::{normalize_addr, AlertConfig, DestinationId};

/// Unique identifier for a throttle slot: (destination, pool)
type CooldownKey = (DestinationId, String);

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Accepted,
    BelowMin { usd: f64, min: f64 },
    AboveMax { usd: f64, max: f64 },
    CoolingDown { remaining: Duration },
}

impl GateDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, GateDecision::Accepted)
    }
}

pub struct CooldownGate {
    last_accepted: DashMap<CooldownKey, Instant>,
    default_window: Duration,
}

impl CooldownGate {
    pub fn new(default_window: Duration) -> Self {
        Self {
            last_accepted: DashMap::new(),
            default_window,
        }
    }

    pub fn window_for(&self, config: &AlertConfig) -> Duration {
        config
            .cooldown_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_window)
    }

    /// Decide whether an alert for `pool` with `usd_value` may go to
    /// `config.destination` at `now`. Records `now` only when accepted.
    /// An unknown value (None) bypasses the USD bounds but not the cooldown.
    pub fn admit(&self, config: &AlertConfig, pool: &str, usd_value: Option<f64>, now: Instant) -> GateDecision {
        if let Some(usd) = usd_value {
            if usd < config.min_buy_usd {
                return GateDecision::BelowMin {
                    usd,
                    min: config.min_buy_usd,
                };
            }

            if let Some(max) = config.max_buy_usd.filter(|m| *m > 0.0) {
                if usd > max {
                    return GateDecision::AboveMax { usd, max };
                }
            }
        }

        let window = self.window_for(config);
        let key = (config.destination.clone(), normalize_addr(pool));

        match self.last_accepted.entry(key) {
            Entry::Occupied(mut slot) => {
                let elapsed = now.saturating_duration_since(*slot.get());
                if elapsed < window {
                    let remaining = window - elapsed;
                    debug!(
                        "Cooldown: {} on {} | {:.1}s remaining",
                        config.destination,
                        pool,
                        remaining.as_secs_f64()
                    );
                    return GateDecision::CoolingDown { remaining };
                }
                slot.insert(now);
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }

        GateDecision::Accepted
    }

    /// Remove entries older than `max_window` to bound memory.
    pub fn cleanup(&self, now: Instant, max_window: Duration) {
        let before = self.last_accepted.len();
        self.last_accepted
            .retain(|_, at| now.saturating_duration_since(*at) < max_window);
        let removed = before - self.last_accepted.len();
        if removed > 0 {
            debug!("Cooldown cleanup: removed {} expired entries", removed);
        }
    }

    pub fn clear(&self) {
        self.last_accepted.clear();
    }

    pub fn active_count(&self) -> usize {
        self.last_accepted.len()
    }
}
