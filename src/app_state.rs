// =============================================================================
// Central Application State — Meridian Portfolio Engine
// =============================================================================
//
// Ties the store, market-data provider, configuration, and engine registry
// together behind one Arc. The tick scheduler and the HTTP ingress both
// operate through this. A monotonically increasing version counter lets the
// platform UI cheaply detect fresh state.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::allocation::{self, AllocationReport};
use crate::audit::DecisionRow;
use crate::config::EngineConfig;
use crate::market::MarketData;
use crate::position::Position;
use crate::scheduler::{self, TickReport};
use crate::store::{HeartbeatRow, MemoryStore, PortfolioRow};
use crate::types::{EngineInstance, RunMode, TradingStyle};

/// Central application state shared across tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: RwLock<EngineConfig>,
    pub store: Arc<MemoryStore>,
    pub market: Arc<dyn MarketData>,
    pub engines: RwLock<Vec<EngineInstance>>,

    /// Incremented on every meaningful mutation; the UI polls it.
    pub state_version: AtomicU64,
    /// Serialises ticks: the cron task and the HTTP trigger must not overlap.
    tick_lock: Mutex<()>,
    pub last_tick: RwLock<Option<TickReport>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: EngineConfig, store: Arc<MemoryStore>, market: Arc<dyn MarketData>) -> Self {
        let engines = default_engines(&config);
        Self {
            config: RwLock::new(config),
            store,
            market,
            engines: RwLock::new(engines),
            state_version: AtomicU64::new(1),
            tick_lock: Mutex::new(()),
            last_tick: RwLock::new(None),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Run one tick now. Concurrent callers queue behind the tick lock.
    pub async fn run_tick(&self, crypto_only: bool) -> Result<TickReport> {
        let _guard = self.tick_lock.lock().await;
        let cfg = self.config.read().clone();
        let engines = self.engines.read().clone();
        let report = scheduler::run_tick(
            &self.store,
            self.market.as_ref(),
            &cfg,
            &engines,
            Utc::now(),
            crypto_only,
        )
        .await?;
        *self.last_tick.write() = Some(report.clone());
        self.increment_version();
        Ok(report)
    }

    /// Run the daily allocation scoring pass.
    pub fn run_allocation(&self) -> AllocationReport {
        let report = allocation::run_allocation_pass(&self.store, Utc::now());
        self.increment_version();
        report
    }

    /// Build the serialisable snapshot served to the platform UI.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let portfolios: Vec<PortfolioRow> = {
            let mut rows = Vec::new();
            // Snapshot rows for every registered instance.
            for inst in self.engines.read().iter() {
                let lane = crate::store::LaneStore::for_context(
                    self.store.clone(),
                    inst.context(Utc::now()),
                );
                if let Some(row) = lane.load_snapshot() {
                    rows.push(row);
                }
            }
            rows
        };

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            last_tick: self.last_tick.read().clone(),
            portfolios,
            open_positions: self.store.all_open_positions(),
            recent_decisions: self.store.recent_decisions(100),
            heartbeats: self.store.heartbeats().into_iter().rev().take(20).collect(),
        }
    }
}

/// The engine roster derived from configuration: the live SWING engine, its
/// v2 shadow, the day-trader shadow, the quick-profit shadow, and the crypto
/// shadow when enabled.
pub fn default_engines(config: &EngineConfig) -> Vec<EngineInstance> {
    let mut engines = vec![
        EngineInstance::new("swing", "v3", RunMode::Primary, TradingStyle::Swing),
        EngineInstance::new("swing", "v2", RunMode::Shadow, TradingStyle::Swing),
        EngineInstance::new(
            "quick-profit",
            "v1",
            RunMode::Shadow,
            TradingStyle::QuickProfit,
        ),
    ];
    if !config.disable_daytrader {
        engines.push(EngineInstance::new(
            "day-trader",
            "v1",
            RunMode::Shadow,
            TradingStyle::DayTrader,
        ));
    }
    if config.enable_crypto_shadow {
        engines.push(EngineInstance::new(
            "crypto",
            "v1",
            RunMode::Shadow,
            TradingStyle::Crypto,
        ));
    }
    engines
}

/// Full engine state snapshot for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tick: Option<TickReport>,
    pub portfolios: Vec<PortfolioRow>,
    pub open_positions: Vec<Position>,
    pub recent_decisions: Vec<DecisionRow>,
    pub heartbeats: Vec<HeartbeatRow>,
}
