// =============================================================================
// Market Data — provider contracts and shared bar/quote types
// =============================================================================
//
// The engine consumes market data through one narrow interface with multiple
// implementations: an HTTP provider for live runs and a scripted provider
// for demo mode and tests. Fallback semantics (1m bars -> 5m bars -> bare
// quote) live behind `fetch_position_bars`; callers never close a position
// on missing data.
// =============================================================================

pub mod http;
pub mod sim;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Concurrency degree for bulk fetches — bounded to respect provider rate
/// limits.
pub const BULK_FETCH_CONCURRENCY: usize = 3;

/// A single OHLCV bar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Bar granularity returned by `fetch_position_bars`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarInterval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinute,
    /// No bars were available; only the current quote is usable.
    #[serde(rename = "quote")]
    QuoteOnly,
}

impl std::fmt::Display for BarInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OneMinute => write!(f, "1m"),
            Self::FiveMinute => write!(f, "5m"),
            Self::QuoteOnly => write!(f, "quote"),
        }
    }
}

/// Recent bars plus the freshest price for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionBars {
    pub bars: Vec<Bar>,
    pub interval: BarInterval,
    pub current_price: f64,
}

/// Current quote for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub change_pct: f64,
    pub volume: f64,
    pub day_high: f64,
    pub day_low: f64,
    pub updated_at: DateTime<Utc>,
}

/// The market-data seam. Implementations must apply a hard timeout to every
/// call (recommended 10 s); callers treat errors as transient.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Quotes for many symbols in one logical call.
    async fn fetch_bulk_quotes(&self, symbols: &[String])
        -> anyhow::Result<HashMap<String, Quote>>;

    /// Recent intrabar data for position management, with fallback:
    /// 1m bars, else 5m bars, else the bare current quote.
    async fn fetch_position_bars(&self, symbol: &str) -> anyhow::Result<PositionBars>;

    /// Intraday OHLC history for the ATR guard and the continuation score.
    async fn fetch_intraday_ohlc(
        &self,
        symbol: &str,
        interval: BarInterval,
        days_back: u32,
    ) -> anyhow::Result<Vec<Bar>>;
}

/// Fetch quotes for a symbol set with bounded per-symbol concurrency.
///
/// Transient per-symbol failures are logged and dropped from the result map;
/// the tick degrades rather than fails.
pub async fn bulk_quotes_bounded(
    provider: &dyn MarketData,
    symbols: &[String],
) -> HashMap<String, Quote> {
    let results: Vec<Option<(String, Quote)>> = stream::iter(symbols.iter().cloned())
        .map(|symbol| async move {
            match provider.fetch_bulk_quotes(std::slice::from_ref(&symbol)).await {
                Ok(mut map) => map.remove(&symbol).map(|q| (symbol, q)),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "quote fetch failed — degrading");
                    None
                }
            }
        })
        .buffer_unordered(BULK_FETCH_CONCURRENCY)
        .collect()
        .await;

    results.into_iter().flatten().collect()
}
