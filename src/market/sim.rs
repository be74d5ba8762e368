// =============================================================================
// Scripted Market-Data Provider — deterministic quotes/bars for demo & tests
// =============================================================================
//
// When no data gateway is configured the engine runs against this provider
// (demo mode). Tests script exact quote and bar sequences through it to
// drive the position manager and admission deterministically.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::market::{Bar, BarInterval, MarketData, PositionBars, Quote};

/// In-memory provider; all data is whatever the caller scripted.
#[derive(Default)]
pub struct ScriptedMarketData {
    quotes: RwLock<HashMap<String, Quote>>,
    position_bars: RwLock<HashMap<String, PositionBars>>,
    intraday: RwLock<HashMap<String, Vec<Bar>>>,
}

impl ScriptedMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a bare quote at `price` for `symbol`.
    pub fn set_quote(&self, symbol: &str, price: f64) {
        self.quotes.write().insert(
            symbol.to_string(),
            Quote {
                symbol: symbol.to_string(),
                price,
                change_pct: 0.0,
                volume: 0.0,
                day_high: price,
                day_low: price,
                updated_at: Utc::now(),
            },
        );
    }

    /// Script the full bar payload served by `fetch_position_bars`.
    pub fn set_position_bars(&self, symbol: &str, bars: Vec<Bar>, current_price: f64) {
        let interval = if bars.is_empty() {
            BarInterval::QuoteOnly
        } else {
            BarInterval::OneMinute
        };
        self.position_bars.write().insert(
            symbol.to_string(),
            PositionBars {
                bars,
                interval,
                current_price,
            },
        );
    }

    /// Script intraday OHLC history (ATR guard, continuation score).
    pub fn set_intraday(&self, symbol: &str, bars: Vec<Bar>) {
        self.intraday.write().insert(symbol.to_string(), bars);
    }

    /// Remove all scripted data for `symbol` (simulates provider outage).
    pub fn clear_symbol(&self, symbol: &str) {
        self.quotes.write().remove(symbol);
        self.position_bars.write().remove(symbol);
        self.intraday.write().remove(symbol);
    }
}

#[async_trait]
impl MarketData for ScriptedMarketData {
    async fn fetch_bulk_quotes(&self, symbols: &[String]) -> Result<HashMap<String, Quote>> {
        let quotes = self.quotes.read();
        Ok(symbols
            .iter()
            .filter_map(|s| quotes.get(s).cloned().map(|q| (s.clone(), q)))
            .collect())
    }

    async fn fetch_position_bars(&self, symbol: &str) -> Result<PositionBars> {
        if let Some(pb) = self.position_bars.read().get(symbol) {
            return Ok(pb.clone());
        }
        // Fall through to the quote path, like the live provider.
        let quote = self
            .quotes
            .read()
            .get(symbol)
            .cloned()
            .with_context(|| format!("no scripted data for {symbol}"))?;
        Ok(PositionBars {
            bars: Vec::new(),
            interval: BarInterval::QuoteOnly,
            current_price: quote.price,
        })
    }

    async fn fetch_intraday_ohlc(
        &self,
        symbol: &str,
        _interval: BarInterval,
        _days_back: u32,
    ) -> Result<Vec<Bar>> {
        Ok(self
            .intraday
            .read()
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }
}

// =============================================================================
// Test helpers (shared by the manager/admission/scheduler test suites)
// =============================================================================

/// Build a bar `minutes_ago` minutes in the past with the given OHLC.
#[cfg(test)]
pub fn bar_at(minutes_ago: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        ts: Utc::now() - chrono::Duration::minutes(minutes_ago),
        open,
        high,
        low,
        close,
        volume: 1_000.0,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn quote_path_when_no_bars_scripted() {
        let sim = ScriptedMarketData::new();
        sim.set_quote("AAPL", 190.0);
        let pb = sim.fetch_position_bars("AAPL").await.unwrap();
        assert_eq!(pb.interval, BarInterval::QuoteOnly);
        assert!(pb.bars.is_empty());
        assert!((pb.current_price - 190.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_symbol_is_an_error() {
        let sim = ScriptedMarketData::new();
        assert!(sim.fetch_position_bars("GHOST").await.is_err());
    }

    #[tokio::test]
    async fn scripted_bars_served_as_one_minute() {
        let sim = ScriptedMarketData::new();
        sim.set_position_bars("NVDA", vec![bar_at(2, 100.0, 101.0, 99.0, 100.5)], 100.5);
        let pb = sim.fetch_position_bars("NVDA").await.unwrap();
        assert_eq!(pb.interval, BarInterval::OneMinute);
        assert_eq!(pb.bars.len(), 1);
    }

    #[tokio::test]
    async fn outage_clears_all_data() {
        let sim = ScriptedMarketData::new();
        sim.set_quote("AAPL", 190.0);
        sim.clear_symbol("AAPL");
        let quotes = sim.fetch_bulk_quotes(&["AAPL".to_string()]).await.unwrap();
        assert!(quotes.is_empty());
    }
}
