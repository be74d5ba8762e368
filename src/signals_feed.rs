// =============================================================================
// Signal Feed — consumed trade signals and the lookback query seam
// =============================================================================
//
// Signals are produced upstream (the AI signal producer is a collaborator,
// not part of this engine). The engine only reads them: a lookback query
// filtered by engine type, with a confidence-floor bypass for allowlisted
// tickers.
// =============================================================================

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{SignalSide, TradingStyle};

/// A trade signal as produced upstream. Read-only to this engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    /// Producer engine type ("swing", "day_trader", ...).
    pub engine_type: String,
    pub trading_style: TradingStyle,
    pub side: SignalSide,
    /// Producer confidence in [0, 1].
    pub confidence: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub engine_version: String,
    pub created_at: DateTime<Utc>,
}

/// Parameters of one lookback query.
#[derive(Debug, Clone)]
pub struct SignalQuery {
    pub style: TradingStyle,
    /// Only signals created at or after this instant are returned.
    pub since: DateTime<Utc>,
    /// Signals below this confidence are dropped unless the symbol is in
    /// `bypass_floor_symbols`.
    pub confidence_floor: f64,
    pub bypass_floor_symbols: HashSet<String>,
}

/// Read-only source of fresh signals.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Signals matching the query, ordered by creation time ascending.
    async fn fresh_signals(&self, query: &SignalQuery) -> anyhow::Result<Vec<Signal>>;
}

/// Shared filter applied by every source implementation.
pub fn matches_query(signal: &Signal, query: &SignalQuery) -> bool {
    if signal.trading_style != query.style {
        return false;
    }
    if signal.created_at < query.since {
        return false;
    }
    if signal.confidence < query.confidence_floor
        && !query.bypass_floor_symbols.contains(&signal.symbol)
    {
        return false;
    }
    true
}
