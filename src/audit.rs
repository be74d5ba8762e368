// =============================================================================
// Decision Audit — append-only record of every (signal, instance) evaluation
// =============================================================================
//
// Every signal that reaches admission produces exactly one decision row for
// the evaluating engine instance: OPEN, or a SKIP_* with the first failing
// check's reason code. Rows carry the portfolio snapshot at decision time,
// the trade-gate state, and the lane verdict so the audit is self-contained.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{EngineContext, RunMode};

// =============================================================================
// Reason codes (closed set, consumed by downstream analytics)
// =============================================================================

pub const DECISION_OPEN: &str = "OPEN";
pub const SKIP_TRADE_GATE: &str = "SKIP_TRADE_GATE";
pub const SKIP_WRONG_ENGINE_OWNER: &str = "SKIP_WRONG_ENGINE_OWNER";
pub const SKIP_OUTSIDE_PORTFOLIO_BUCKET: &str = "SKIP_OUTSIDE_PORTFOLIO_BUCKET";
pub const SKIP_CORE_SLOTS_FULL: &str = "SKIP_CORE_SLOTS_FULL";
pub const SKIP_EXPLORE_SLOTS_FULL: &str = "SKIP_EXPLORE_SLOTS_FULL";
pub const SKIP_EXISTING_POSITION: &str = "SKIP_EXISTING_POSITION";
pub const SKIP_MAX_POSITIONS: &str = "SKIP_MAX_POSITIONS";
pub const SKIP_RR_TOO_LOW: &str = "SKIP_RR_TOO_LOW";
pub const SKIP_DISTANCE_UNREALISTIC: &str = "SKIP_DISTANCE_UNREALISTIC";
pub const SKIP_STALE_ENTRY: &str = "SKIP_STALE_ENTRY";
pub const SKIP_QUOTE_UNAVAILABLE: &str = "SKIP_QUOTE_UNAVAILABLE";
pub const SKIP_INVALID_SL: &str = "SKIP_INVALID_SL";
pub const SKIP_INVALID_TP: &str = "SKIP_INVALID_TP";
pub const SKIP_CAPACITY: &str = "SKIP_CAPACITY";
pub const SKIP_NEUTRAL_SIGNAL: &str = "SKIP_NEUTRAL_SIGNAL";

// =============================================================================
// Portfolio snapshot embedded in each row
// =============================================================================

/// The portfolio figures admission saw when it made the call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PortfolioAtDecision {
    pub equity: f64,
    pub cash: f64,
    pub allocated_notional: f64,
    pub open_count: u32,
}

// =============================================================================
// Decision row
// =============================================================================

/// One appended audit row per (signal, instance) evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRow {
    pub id: String,
    #[serde(default)]
    pub signal_id: Option<String>,
    pub symbol: String,
    pub engine_key: String,
    pub engine_version: String,
    pub run_mode: RunMode,
    /// OPEN or the SKIP_* reason code.
    pub decision: String,
    /// Same as `decision` for skips; OPEN rows carry OPEN.
    pub reason_code: String,
    /// Free-form context, e.g. "rr=0.20 floor=0.50".
    #[serde(default)]
    pub reason_context: Option<String>,
    pub portfolio: PortfolioAtDecision,
    pub trade_gate_open: bool,
    /// CORE / EXPLORE lane assignment when the bucket guard ran.
    #[serde(default)]
    pub lane: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DecisionRow {
    /// Row for a successful open.
    pub fn open(
        ctx: &EngineContext,
        signal_id: Option<String>,
        symbol: impl Into<String>,
        portfolio: PortfolioAtDecision,
        lane: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            signal_id,
            symbol: symbol.into(),
            engine_key: ctx.engine_key.clone(),
            engine_version: ctx.engine_version.clone(),
            run_mode: ctx.run_mode,
            decision: DECISION_OPEN.to_string(),
            reason_code: DECISION_OPEN.to_string(),
            reason_context: None,
            portfolio,
            trade_gate_open: true,
            lane,
            created_at: ctx.now,
        }
    }

    /// Row for a skipped signal with the first failing check's reason.
    pub fn skip(
        ctx: &EngineContext,
        signal_id: Option<String>,
        symbol: impl Into<String>,
        reason_code: &str,
        context: impl Into<String>,
        portfolio: PortfolioAtDecision,
        trade_gate_open: bool,
        lane: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            signal_id,
            symbol: symbol.into(),
            engine_key: ctx.engine_key.clone(),
            engine_version: ctx.engine_version.clone(),
            run_mode: ctx.run_mode,
            decision: reason_code.to_string(),
            reason_code: reason_code.to_string(),
            reason_context: Some(context.into()),
            portfolio,
            trade_gate_open,
            lane,
            created_at: ctx.now,
        }
    }
}
