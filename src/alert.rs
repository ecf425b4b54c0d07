//! Buy alert payload and delivery sinks
//!
//! Created: 2026-10-05

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::env;
use tracing::{info, warn};

use crate::error::{WatchError, WatchResult};
use crate::types::{ChainId, DestinationId, PositionChange, ProtocolVersion};

/// Everything a transport needs to render one buy alert.
#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    pub destination: DestinationId,
    pub chain: ChainId,
    pub pool: String,
    pub version: ProtocolVersion,
    pub token_symbol: String,
    pub base_symbol: String,
    pub tx_hash: String,
    pub block_number: u64,
    pub buyer: String,
    /// Base asset spent, decimal-adjusted
    pub spent: f64,
    /// Tracked token received, decimal-adjusted
    pub received: f64,
    /// None when the buy could not be priced
    pub usd_value: Option<f64>,
    pub price_usd: f64,
    pub market_cap: f64,
    pub liquidity_usd: f64,
    pub volume_24h: f64,
    pub position: PositionChange,
    pub emoji_bar: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AlertPayload {
    /// One-line summary used in logs
    pub fn headline(&self) -> String {
        let usd = self.usd_value.map_or_else(|| "$?".to_string(), |v| format!("${:.2}", v));
        format!(
            "buy {:.4} {} for {:.4} {} ({}) on {} | position {}",
            self.received, self.token_symbol, self.spent, self.base_symbol, usd, self.chain, self.position
        )
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, payload: &AlertPayload) -> WatchResult<()>;
}

/// POSTs the payload as JSON to a webhook.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Sink from ALERT_WEBHOOK_URL, if set
    pub fn from_env() -> Option<Self> {
        env::var("ALERT_WEBHOOK_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())
            .map(|u| Self::new(u.trim()))
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    async fn deliver(&self, payload: &AlertPayload) -> WatchResult<()> {
        let response = self.client.post(&self.url).json(payload).send().await?;
        if !response.status().is_success() {
            warn!("Alert webhook returned status: {}", response.status());
            return Err(WatchError::TransientLookup(format!("webhook status {}", response.status())));
        }
        info!("Alert sent to {}: {}", payload.destination, payload.headline());
        Ok(())
    }
}

/// Writes alerts to the log only.
#[derive(Default)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn deliver(&self, payload: &AlertPayload) -> WatchResult<()> {
        info!(
            destination = %payload.destination,
            tx = %payload.tx_hash,
            "{} {}",
            payload.emoji_bar,
            payload.headline()
        );
        Ok(())
    }
}
