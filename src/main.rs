//! Buy alert tracker daemon
//!
//! Loads chain settings (TOML) and alert configurations (JSON), connects to
//! every chain with an RPC endpoint and emits buy alerts until stopped.
//!
//! Signals:
//!   SIGHUP          clear caches and connections, resync shortly after
//!   SIGINT/SIGTERM  graceful shutdown (final config flush)
//!
//! Environment:
//!   RPC_URL_<CHAIN>    endpoint per chain (ws:// streams, http:// polls)
//!   ALERT_WEBHOOK_URL  deliver alerts as JSON POSTs (logged otherwise)
//!   LOG_FORMAT=json    structured log output
//!
//! Usage:
//!   buywatch --settings settings.toml --alerts alerts.json
//!   buywatch --once    (single sync, print the watched set, exit)
//!
//! Created: 2026-10-07

use anyhow::{Context, Result};
use buywatch_bot::{
    AlertSink, AlloyConnector, JsonConfigStore, LogSink, MarketDataClient, SerialDispatcher, Settings, Tracker,
    TrackerDeps, WebhookSink,
};
use clap::Parser;
use futures::StreamExt;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// DEX buy alert tracker - Multi-Chain
#[derive(Parser)]
#[command(name = "buywatch")]
struct Args {
    /// Chain settings (TOML); built-in defaults when missing
    #[arg(long, env = "BUYWATCH_SETTINGS", default_value = "settings.toml")]
    settings: PathBuf,

    /// Alert configurations (JSON)
    #[arg(long, env = "BUYWATCH_ALERTS", default_value = "alerts.json")]
    alerts: PathBuf,

    /// Run one sync cycle, report and exit
    #[arg(long)]
    once: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false);

    if json {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).with_target(false).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let settings = Settings::load_or_default(&args.settings)?;
    let connected: Vec<_> = settings.connected_chains().map(|c| c.id.to_string()).collect();
    if connected.is_empty() {
        warn!("No chain has an RPC endpoint; set RPC_URL_<CHAIN> to watch pools");
    }
    info!("Chains with endpoints: {:?}", connected);

    let store = Arc::new(
        JsonConfigStore::load(&args.alerts)
            .with_context(|| format!("Failed to load alerts from {}", args.alerts.display()))?,
    );
    let market = Arc::new(MarketDataClient::new(&settings.api, &settings.chains)?);

    let sink: Arc<dyn AlertSink> = match WebhookSink::from_env() {
        Some(webhook) => {
            info!("Alerts delivered via webhook");
            Arc::new(webhook)
        }
        None => {
            info!("ALERT_WEBHOOK_URL not set, alerts are logged only");
            Arc::new(LogSink)
        }
    };

    let tracker = Tracker::new(
        &settings,
        TrackerDeps {
            connector: Arc::new(AlloyConnector::new(&settings.chains)),
            store: store.clone(),
            discovery: market.clone(),
            pair_details: market.clone(),
            native_prices: market,
            dispatch: Arc::new(SerialDispatcher::new()),
            sink,
        },
    );

    if args.once {
        let report = tracker.sync_once().await;
        info!(
            "Sync: {} added, {} removed, {} discovered, {} skipped",
            report.added, report.removed, report.discovered, report.skipped
        );
        for chain in tracker.connections().chains() {
            for pool in tracker.connections().tracked_pools(&chain) {
                info!("  {} {:#x}", chain, pool);
            }
        }
        tracker.shutdown().await;
        store.flush()?;
        return Ok(());
    }

    tracker.start().await;

    // Persist discovered pool lists
    let flush_store = store.clone();
    let flush_every = settings.tracker.store_flush_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(flush_every);
        loop {
            ticker.tick().await;
            if let Err(e) = flush_store.flush() {
                error!("Config flush failed: {:#}", e);
            }
        }
    });

    let mut signals = Signals::new([SIGHUP, SIGINT, SIGTERM])?;
    while let Some(sig) = signals.next().await {
        match sig {
            SIGHUP => {
                info!("Received SIGHUP - clearing caches");
                tracker.clear_caches();
            }
            _ => {
                info!("Received signal {} - shutting down", sig);
                break;
            }
        }
    }

    tracker.shutdown().await;
    if store.flush()? {
        info!("Alert configurations saved to {}", args.alerts.display());
    }

    Ok(())
}
