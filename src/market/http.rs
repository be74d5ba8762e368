// =============================================================================
// HTTP Market-Data Provider — reqwest client with hard timeouts
// =============================================================================
//
// Talks to the market-data gateway over plain JSON. Every request carries a
// 10 s client-level timeout; a timed-out or failed call surfaces as an error
// and the tick degrades (quote path or skip) — data unavailability never
// closes a position.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::market::{Bar, BarInterval, MarketData, PositionBars, Quote};

/// Hard timeout applied to every provider call.
const FETCH_TIMEOUT_SECS: u64 = 10;

/// Bars requested for position management.
const POSITION_BARS_LIMIT: u32 = 30;

/// JSON market-data client.
#[derive(Clone)]
pub struct HttpMarketData {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMarketData {
    /// Build a client for `base_url`. `api_key`, when present, is sent as a
    /// bearer token on every request.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Some(key) = api_key {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {key}"))
                .context("market-data api key is not a valid header value")?;
            default_headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()
            .context("failed to build market-data http client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "market-data request");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("market-data request failed: {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("market-data request {url} returned {status}");
        }
        resp.json::<T>()
            .await
            .with_context(|| format!("market-data response decode failed: {url}"))
    }

    async fn fetch_bars(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Bar>> {
        let rows: Vec<WireBar> = self
            .get_json(&format!(
                "/v1/bars?symbol={symbol}&interval={interval}&limit={limit}"
            ))
            .await?;
        let mut bars: Vec<Bar> = rows.into_iter().filter_map(WireBar::into_bar).collect();
        bars.sort_by_key(|b| b.ts);
        Ok(bars)
    }
}

#[async_trait]
impl MarketData for HttpMarketData {
    async fn fetch_bulk_quotes(&self, symbols: &[String]) -> Result<HashMap<String, Quote>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let joined = symbols.join(",");
        let rows: Vec<WireQuote> = self.get_json(&format!("/v1/quotes?symbols={joined}")).await?;
        Ok(rows
            .into_iter()
            .map(|w| (w.symbol.clone(), w.into_quote()))
            .collect())
    }

    async fn fetch_position_bars(&self, symbol: &str) -> Result<PositionBars> {
        // Preferred: 1m bars.
        match self.fetch_bars(symbol, "1m", POSITION_BARS_LIMIT).await {
            Ok(bars) if !bars.is_empty() => {
                let current_price = bars.last().map(|b| b.close).unwrap_or_default();
                return Ok(PositionBars {
                    bars,
                    interval: BarInterval::OneMinute,
                    current_price,
                });
            }
            Ok(_) => debug!(symbol, "no 1m bars — falling back to 5m"),
            Err(e) => warn!(symbol, error = %e, "1m bar fetch failed — falling back to 5m"),
        }

        // Fallback: 5m bars.
        match self.fetch_bars(symbol, "5m", POSITION_BARS_LIMIT).await {
            Ok(bars) if !bars.is_empty() => {
                let current_price = bars.last().map(|b| b.close).unwrap_or_default();
                return Ok(PositionBars {
                    bars,
                    interval: BarInterval::FiveMinute,
                    current_price,
                });
            }
            Ok(_) => debug!(symbol, "no 5m bars — falling back to quote"),
            Err(e) => warn!(symbol, error = %e, "5m bar fetch failed — falling back to quote"),
        }

        // Last resort: the bare quote.
        let quotes = self.fetch_bulk_quotes(&[symbol.to_string()]).await?;
        let quote = quotes
            .get(symbol)
            .with_context(|| format!("no quote available for {symbol}"))?;
        Ok(PositionBars {
            bars: Vec::new(),
            interval: BarInterval::QuoteOnly,
            current_price: quote.price,
        })
    }

    async fn fetch_intraday_ohlc(
        &self,
        symbol: &str,
        interval: BarInterval,
        days_back: u32,
    ) -> Result<Vec<Bar>> {
        let interval_str = interval.to_string();
        let rows: Vec<WireBar> = self
            .get_json(&format!(
                "/v1/ohlc?symbol={symbol}&interval={interval_str}&daysBack={days_back}"
            ))
            .await?;
        let mut bars: Vec<Bar> = rows.into_iter().filter_map(WireBar::into_bar).collect();
        bars.sort_by_key(|b| b.ts);
        Ok(bars)
    }
}

// =============================================================================
// Wire shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct WireQuote {
    symbol: String,
    price: f64,
    #[serde(default, rename = "changePct")]
    change_pct: f64,
    #[serde(default)]
    volume: f64,
    #[serde(default, rename = "dayHigh")]
    day_high: f64,
    #[serde(default, rename = "dayLow")]
    day_low: f64,
    /// Epoch milliseconds.
    #[serde(default, rename = "updatedAt")]
    updated_at: i64,
}

impl WireQuote {
    fn into_quote(self) -> Quote {
        let updated_at = Utc
            .timestamp_millis_opt(self.updated_at)
            .single()
            .unwrap_or_else(Utc::now);
        Quote {
            symbol: self.symbol,
            price: self.price,
            change_pct: self.change_pct,
            volume: self.volume,
            day_high: self.day_high,
            day_low: self.day_low,
            updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireBar {
    /// Epoch seconds.
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    #[serde(default)]
    v: f64,
}

impl WireBar {
    fn into_bar(self) -> Option<Bar> {
        let ts: DateTime<Utc> = Utc.timestamp_opt(self.t, 0).single()?;
        Some(Bar {
            ts,
            open: self.o,
            high: self.h,
            low: self.l,
            close: self.c,
            volume: self.v,
        })
    }
}
