// =============================================================================
// Run-Mode Write Guard — partition isolation between PRIMARY and SHADOW
// =============================================================================
//
// The PRIMARY lane may write only the live_* tables (plus trade_logs); SHADOW
// lanes may write only the engine_* tables and the shared decision log. A
// write against the wrong partition is a programmer error: the guard returns
// a fatal error that aborts the tick after an error-level log. Writes are
// never silently rerouted.
//
// Lane handles (`LaneStore`) pick their table set once at construction from
// the engine context's run mode; this guard is the loud runtime backstop
// behind that capability split.
// =============================================================================

use anyhow::Result;
use tracing::error;

use crate::types::RunMode;

/// Typed error for a cross-partition write. The scheduler downcasts for it
/// and aborts the whole tick — never just the offending engine.
#[derive(Debug)]
pub struct GuardViolation {
    pub mode: RunMode,
    pub table: &'static str,
}

impl std::fmt::Display for GuardViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "run-mode guard violation: {} context attempted write to {}",
            self.mode, self.table
        )
    }
}

impl std::error::Error for GuardViolation {}

/// Every writable table, named as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    LivePositions,
    LiveTrades,
    LivePortfolioState,
    LiveSignalDecisionLog,
    TradeLogs,
    EnginePositions,
    EngineTrades,
    EnginePortfolios,
    SharedDecisionLog,
}

impl Table {
    /// The run mode allowed to write this table.
    pub fn owner(&self) -> RunMode {
        match self {
            Self::LivePositions
            | Self::LiveTrades
            | Self::LivePortfolioState
            | Self::LiveSignalDecisionLog
            | Self::TradeLogs => RunMode::Primary,
            Self::EnginePositions
            | Self::EngineTrades
            | Self::EnginePortfolios
            | Self::SharedDecisionLog => RunMode::Shadow,
        }
    }

    /// Persisted table name, used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LivePositions => "live_positions",
            Self::LiveTrades => "live_trades",
            Self::LivePortfolioState => "live_portfolio_state",
            Self::LiveSignalDecisionLog => "live_signal_decision_log",
            Self::TradeLogs => "trade_logs",
            Self::EnginePositions => "engine_positions",
            Self::EngineTrades => "engine_trades",
            Self::EnginePortfolios => "engine_portfolios",
            Self::SharedDecisionLog => "signal_decision_log",
        }
    }
}

/// Reject the write if `table` does not belong to `mode`'s partition.
///
/// The returned error is fatal for the tick; callers must not catch it and
/// retry against a different table.
pub fn check_write(mode: RunMode, table: Table) -> Result<()> {
    if table.owner() != mode {
        error!(
            run_mode = %mode,
            table = table.name(),
            "RUN-MODE GUARD VIOLATION — write to foreign partition refused"
        );
        return Err(anyhow::Error::new(GuardViolation {
            mode,
            table: table.name(),
        }));
    }
    Ok(())
}
