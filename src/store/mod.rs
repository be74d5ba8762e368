// =============================================================================
// Persistence Seam — table records and the partitioned in-memory store
// =============================================================================
//
// Database driver specifics are out of scope; the engine talks to an
// abstract store exposing the tables below behind the run-mode write guard.
// `memory::MemoryStore` is the reference implementation.
// =============================================================================

pub mod guard;
pub mod memory;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ExitReason, RunMode, Side};

pub use memory::{LaneStore, MemoryStore};

/// Identity of one engine instance inside a partition.
pub type InstanceKey = (String, String); // (engine_key, engine_version)

// =============================================================================
// Trade rows
// =============================================================================

/// Immutable record written at each exit, full or partial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub engine_key: String,
    pub engine_version: String,
    pub run_mode: RunMode,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Quantity closed by this row (≤ the position's open quantity).
    pub qty: f64,
    pub exit_reason: ExitReason,
    pub realized_pnl: f64,
    /// Realized R for the closed quantity: pnl / (risk_per_share * qty).
    pub realized_r: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    #[serde(default)]
    pub signal_id: Option<String>,
    pub position_id: String,
}

// =============================================================================
// Portfolio snapshots
// =============================================================================

/// Persisted snapshot of one instance's portfolio at tick end. Continuity
/// and audit only — the loader always recomputes truth from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioRow {
    pub engine_key: String,
    pub engine_version: String,
    pub run_mode: RunMode,
    pub starting_equity: f64,
    pub equity: f64,
    pub allocated_notional: f64,
    pub cash: f64,
    pub unrealized_pnl: f64,
    pub open_positions: u32,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Ownership & universe
// =============================================================================

/// The sole source of truth for which engine may open trades on a ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnershipRow {
    pub symbol: String,
    pub active_engine_key: String,
    pub active_engine_version: String,
    pub last_score: f64,
    #[serde(default)]
    pub last_promotion_at: Option<DateTime<Utc>>,
    /// Sticky-ownership cooldown; promotions are refused until this passes.
    #[serde(default)]
    pub locked_until: Option<DateTime<Utc>>,
}

/// One row of today's focus snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusEntry {
    pub symbol: String,
    pub is_top8: bool,
    pub manual_priority: f64,
    pub confidence: f64,
    /// Pre-computed priority; when present it overrides the formula.
    #[serde(default)]
    pub trade_priority_score: Option<f64>,
    pub snapshot_date: NaiveDate,
}

/// One allowlist row. Allowlisted symbols join the universe and bypass the
/// signal confidence floor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistEntry {
    pub symbol: String,
    pub enabled: bool,
}

/// Persisted explore-lane rotation cursor. A row, not a cache: it survives
/// restarts so rotation stays fair across processes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExploreCursorRow {
    #[serde(default)]
    pub last_symbol: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Allocation scoring
// =============================================================================

/// Per-(symbol, engine, window) metrics persisted by the daily pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRow {
    pub symbol: String,
    pub engine_key: String,
    pub engine_version: String,
    pub window_days: u32,
    pub trade_count: u32,
    pub expectancy_r: f64,
    pub max_drawdown_r: f64,
    pub stability: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub score: f64,
    /// Exact dispersion formula used for `stability`, recorded verbatim.
    pub stability_formula: String,
    pub computed_at: DateTime<Utc>,
}

/// Outcome of one promotion proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionLogRow {
    pub symbol: String,
    pub candidate_key: String,
    pub candidate_version: String,
    #[serde(default)]
    pub owner_key: Option<String>,
    #[serde(default)]
    pub owner_version: Option<String>,
    /// PROMOTED, PENDING_OPEN_POSITION, or the rejection reason.
    pub outcome: String,
    #[serde(default)]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

// =============================================================================
// Heartbeat
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatLevel {
    Info,
    Warn,
    Error,
}

/// Broadcast row consumed by the external monitor. A missed tick surfaces as
/// a stale `at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRow {
    pub level: HeartbeatLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

// =============================================================================
// Context decision (read by context-aware shadow engines)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateVerdict {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "CLOSE")]
    Close,
}

/// Policy verdict published upstream; admission consults it when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextDecision {
    pub policy_version: String,
    pub as_of: DateTime<Utc>,
    pub trade_gate: GateVerdict,
    /// Multiplier applied to per-trade risk (1.0 = unchanged).
    pub risk_scale: f64,
    #[serde(default)]
    pub max_positions: Option<u32>,
}
