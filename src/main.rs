// =============================================================================
// Meridian Portfolio Engine — Main Entry Point
// =============================================================================
//
// A tick-driven orchestrator simulating model trading portfolios across a
// live PRIMARY engine and a set of SHADOW engines. The scheduler fires every
// minute; the daily allocation pass promotes engine ownership per ticker.
// With no market-data gateway configured the engine runs against the
// scripted provider (demo mode).
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod admission;
mod allocation;
mod api;
mod app_state;
mod audit;
mod config;
mod indicators;
mod lane;
mod manager;
mod market;
mod portfolio;
mod position;
mod quick_profit;
mod scheduler;
mod signals_feed;
mod store;
mod types;
mod universe;

use std::sync::Arc;

use chrono::{Timelike, Utc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::EngineConfig;
use crate::market::http::HttpMarketData;
use crate::market::sim::ScriptedMarketData;
use crate::market::MarketData;
use crate::store::{HeartbeatLevel, MemoryStore};

/// Scheduler cadence: one tick per minute.
const TICK_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Portfolio Engine — Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = EngineConfig::from_env();
    info!(
        disable_daytrader = config.disable_daytrader,
        enable_allocation = config.enable_allocation,
        enable_crypto_shadow = config.enable_crypto_shadow,
        bar_grace_secs = config.bar_grace_secs,
        "configuration loaded"
    );

    // ── 2. Market-data provider ──────────────────────────────────────────
    let market: Arc<dyn MarketData> = match &config.data_base_url {
        Some(base_url) => {
            let provider = HttpMarketData::new(base_url.clone(), config.data_api_key.clone())?;
            info!(base_url = %base_url, "live market-data provider configured");
            Arc::new(provider)
        }
        None => {
            warn!("no MERIDIAN_DATA_BASE_URL — running the scripted provider (demo mode)");
            Arc::new(ScriptedMarketData::new())
        }
    };

    // ── 3. Shared state ──────────────────────────────────────────────────
    let store = Arc::new(MemoryStore::new());
    let state = Arc::new(AppState::new(config.clone(), store.clone(), market));
    info!(
        engines = state.engines.read().len(),
        "engine roster registered"
    );

    // ── 4. HTTP ingress ──────────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "failed to bind ingress");
                return;
            }
        };
        info!(addr = %bind_addr, "ingress listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "ingress server failed");
        }
    });

    // ── 5. Tick loop (~1 min cadence) ────────────────────────────────────
    let tick_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(TICK_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match tick_state.run_tick(false).await {
                Ok(report) => {
                    if report.engines_failed > 0 || report.engines_deferred > 0 {
                        warn!(
                            failed = report.engines_failed,
                            deferred = report.engines_deferred,
                            "tick finished with degradations"
                        );
                    }
                }
                Err(e) => {
                    error!(error = %e, "tick failed");
                    tick_state
                        .store
                        .push_heartbeat(HeartbeatLevel::Error, format!("tick failed: {e}"));
                }
            }
        }
    });

    // ── 6. Daily allocation pass ─────────────────────────────────────────
    let alloc_state = state.clone();
    tokio::spawn(async move {
        let mut last_run_date: Option<chrono::NaiveDate> = None;
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let now = Utc::now();
            let enabled = alloc_state.config.read().enable_allocation;
            let scheduled_hour = alloc_state.config.read().allocation_hour_utc;
            if !enabled || now.hour() != scheduled_hour {
                continue;
            }
            if last_run_date == Some(now.date_naive()) {
                continue;
            }
            last_run_date = Some(now.date_naive());
            let report = alloc_state.run_allocation();
            info!(
                score_rows = report.score_rows,
                promotions = report.promotions,
                proposals = report.proposals,
                "daily allocation pass complete"
            );
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");
    store.push_heartbeat(HeartbeatLevel::Warn, "engine shutting down");
    info!("Meridian Portfolio Engine shut down complete.");
    Ok(())
}
