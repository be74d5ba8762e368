// =============================================================================
// Engine Configuration — process-env driven knobs with serde defaults
// =============================================================================
//
// Central configuration hub for the Meridian engine. Every tunable lives
// here: feature flags, per-strategy risk knobs, quick-profit overrides, and
// the operational settings for the tick scheduler.
//
// All fields carry serde defaults so a partially-specified JSON blob (or an
// empty environment) always yields a runnable config. `EngineConfig::
// from_env()` starts from defaults and applies `MERIDIAN_*` overrides.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_initial_equity() -> f64 {
    100_000.0
}

fn default_risk_pct() -> f64 {
    0.0075
}

fn default_max_notional_pct() -> f64 {
    0.25
}

fn default_max_concurrent() -> u32 {
    10
}

fn default_max_portfolio_alloc_pct() -> f64 {
    0.80
}

fn default_min_notional() -> f64 {
    1_000.0
}

fn default_trailing_activation_r() -> f64 {
    1.5
}

fn default_trail_distance_r() -> f64 {
    0.75
}

fn default_tp1_close_pct() -> f64 {
    0.5
}

fn default_tp2_r_multiple() -> f64 {
    3.0
}

fn default_recycle_min_r() -> f64 {
    0.5
}

fn default_recycle_min_minutes() -> i64 {
    90
}

fn default_recycle_fraction() -> f64 {
    0.33
}

fn default_time_exit_floor_r() -> f64 {
    0.5
}

fn default_signal_lookback_minutes() -> i64 {
    90
}

fn default_be_trigger_usd() -> f64 {
    150.0
}

fn default_be_buffer_usd() -> f64 {
    5.0
}

fn default_partial_trigger_usd() -> f64 {
    250.0
}

fn default_partial_fraction() -> f64 {
    0.5
}

fn default_trail_distance_usd() -> f64 {
    120.0
}

fn default_qp_lookback_hours() -> i64 {
    6
}

fn default_qp_risk_pct() -> f64 {
    0.005
}

fn default_qp_max_concurrent() -> u32 {
    5
}

fn default_gate_open_hour() -> u32 {
    13
}

fn default_gate_open_minute() -> u32 {
    30
}

fn default_gate_close_hour() -> u32 {
    20
}

fn default_bar_grace_secs() -> i64 {
    60
}

fn default_tick_soft_budget_ms() -> u64 {
    45_000
}

fn default_market_close_hour() -> u32 {
    20
}

fn default_allocation_hour() -> u32 {
    21
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Capital recycling mode
// =============================================================================

/// Capital recycling behavior. STRICT applies the same rule with no
/// discretionary overrides from management metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecycleMode {
    Off,
    On,
    Strict,
}

impl Default for RecycleMode {
    fn default() -> Self {
        Self::Off
    }
}

impl RecycleMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Off)
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "OFF" => Some(Self::Off),
            "ON" => Some(Self::On),
            "STRICT" => Some(Self::Strict),
            _ => None,
        }
    }
}

// =============================================================================
// Per-strategy knobs
// =============================================================================

/// Risk and exit knobs for one trading style.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyKnobs {
    /// Paper starting equity for a fresh portfolio.
    #[serde(default = "default_initial_equity")]
    pub initial_equity: f64,

    /// Fraction of equity risked per trade (0.0075 = 0.75 %).
    #[serde(default = "default_risk_pct")]
    pub risk_pct: f64,

    /// Max notional of a single position as a fraction of equity.
    #[serde(default = "default_max_notional_pct")]
    pub max_notional_pct: f64,

    /// Max concurrently open positions.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,

    /// Max total allocated notional as a fraction of equity.
    #[serde(default = "default_max_portfolio_alloc_pct")]
    pub max_portfolio_alloc_pct: f64,

    /// Smallest position worth opening, in dollars.
    #[serde(default = "default_min_notional")]
    pub min_notional: f64,

    /// Unrealized R at which the trailing stop activates.
    #[serde(default = "default_trailing_activation_r")]
    pub trailing_activation_r: f64,

    /// Trail distance behind the peak, in R.
    #[serde(default = "default_trail_distance_r")]
    pub trail_distance_r: f64,

    /// Whether the TP1-partial / TP2-runner flow is enabled.
    #[serde(default)]
    pub runner_enabled: bool,

    /// Fraction of quantity closed at TP1 when the runner is enabled.
    #[serde(default = "default_tp1_close_pct")]
    pub tp1_close_pct: f64,

    /// TP2 = entry ± this multiple of risk-per-share.
    #[serde(default = "default_tp2_r_multiple")]
    pub tp2_r_multiple: f64,

    /// Capital recycling mode.
    #[serde(default)]
    pub recycle_mode: RecycleMode,

    /// Minimum unrealized R before recycling is considered.
    #[serde(default = "default_recycle_min_r")]
    pub recycle_min_r: f64,

    /// Minimum time-in-trade (minutes) before recycling is considered.
    #[serde(default = "default_recycle_min_minutes")]
    pub recycle_min_minutes: i64,

    /// Fraction of quantity closed by a recycle.
    #[serde(default = "default_recycle_fraction")]
    pub recycle_fraction: f64,

    /// Minimum unrealized R for the pre-close time exit.
    #[serde(default = "default_time_exit_floor_r")]
    pub time_exit_floor_r: f64,

    /// Admission looks back this far for fresh signals.
    #[serde(default = "default_signal_lookback_minutes")]
    pub signal_lookback_minutes: i64,

    /// Forced intraday close, UTC. `None` disables EOD flatten.
    #[serde(default)]
    pub eod_flatten_hour_utc: Option<u32>,

    #[serde(default)]
    pub eod_flatten_minute_utc: u32,
}

impl Default for StrategyKnobs {
    fn default() -> Self {
        Self {
            initial_equity: default_initial_equity(),
            risk_pct: default_risk_pct(),
            max_notional_pct: default_max_notional_pct(),
            max_concurrent: default_max_concurrent(),
            max_portfolio_alloc_pct: default_max_portfolio_alloc_pct(),
            min_notional: default_min_notional(),
            trailing_activation_r: default_trailing_activation_r(),
            trail_distance_r: default_trail_distance_r(),
            runner_enabled: false,
            tp1_close_pct: default_tp1_close_pct(),
            tp2_r_multiple: default_tp2_r_multiple(),
            recycle_mode: RecycleMode::Off,
            recycle_min_r: default_recycle_min_r(),
            recycle_min_minutes: default_recycle_min_minutes(),
            recycle_fraction: default_recycle_fraction(),
            time_exit_floor_r: default_time_exit_floor_r(),
            signal_lookback_minutes: default_signal_lookback_minutes(),
            eod_flatten_hour_utc: None,
            eod_flatten_minute_utc: 0,
        }
    }
}

impl StrategyKnobs {
    /// Default knobs for the swing style: runner flow on, no EOD flatten.
    pub fn swing_defaults() -> Self {
        Self {
            runner_enabled: true,
            ..Self::default()
        }
    }

    /// Default knobs for the day-trader style: EOD flatten at 19:55 UTC,
    /// tighter concurrency.
    pub fn day_trader_defaults() -> Self {
        Self {
            max_concurrent: 5,
            eod_flatten_hour_utc: Some(19),
            eod_flatten_minute_utc: 55,
            ..Self::default()
        }
    }

    /// Default knobs for the 24/7 crypto shadow: no session windows.
    pub fn crypto_defaults() -> Self {
        Self {
            max_concurrent: 5,
            ..Self::default()
        }
    }
}

// =============================================================================
// Quick-profit overrides
// =============================================================================

/// Knobs for the dollar-P&L quick-profit shadow variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickProfitKnobs {
    /// Unrealized dollars at which the stop moves to breakeven.
    #[serde(default = "default_be_trigger_usd")]
    pub be_trigger_usd: f64,

    /// Total-P&L buffer locked in by the breakeven stop, in dollars.
    #[serde(default = "default_be_buffer_usd")]
    pub be_buffer_usd: f64,

    /// Unrealized dollars at which half the position is banked.
    #[serde(default = "default_partial_trigger_usd")]
    pub partial_trigger_usd: f64,

    /// Fraction closed at the partial trigger.
    #[serde(default = "default_partial_fraction")]
    pub partial_fraction: f64,

    /// Trail distance behind the peak, in total dollars on the remainder.
    #[serde(default = "default_trail_distance_usd")]
    pub trail_distance_usd: f64,

    /// Signal lookback window, hours.
    #[serde(default = "default_qp_lookback_hours")]
    pub lookback_hours: i64,

    #[serde(default = "default_qp_risk_pct")]
    pub risk_pct: f64,

    #[serde(default = "default_qp_max_concurrent")]
    pub max_concurrent: u32,
}

impl Default for QuickProfitKnobs {
    fn default() -> Self {
        Self {
            be_trigger_usd: default_be_trigger_usd(),
            be_buffer_usd: default_be_buffer_usd(),
            partial_trigger_usd: default_partial_trigger_usd(),
            partial_fraction: default_partial_fraction(),
            trail_distance_usd: default_trail_distance_usd(),
            lookback_hours: default_qp_lookback_hours(),
            risk_pct: default_qp_risk_pct(),
            max_concurrent: default_qp_max_concurrent(),
        }
    }
}

// =============================================================================
// Trade gate window
// =============================================================================

/// Clock window (UTC) inside which admission may open new positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateWindow {
    #[serde(default = "default_gate_open_hour")]
    pub open_hour_utc: u32,
    #[serde(default = "default_gate_open_minute")]
    pub open_minute_utc: u32,
    #[serde(default = "default_gate_close_hour")]
    pub close_hour_utc: u32,
    #[serde(default)]
    pub close_minute_utc: u32,
}

impl Default for GateWindow {
    fn default() -> Self {
        Self {
            open_hour_utc: default_gate_open_hour(),
            open_minute_utc: default_gate_open_minute(),
            close_hour_utc: default_gate_close_hour(),
            close_minute_utc: 0,
        }
    }
}

impl GateWindow {
    /// Whether `(hour, minute)` falls inside the window (open inclusive,
    /// close exclusive).
    pub fn contains(&self, hour: u32, minute: u32) -> bool {
        let t = hour * 60 + minute;
        let open = self.open_hour_utc * 60 + self.open_minute_utc;
        let close = self.close_hour_utc * 60 + self.close_minute_utc;
        t >= open && t < close
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Meridian engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Feature flags -------------------------------------------------------
    /// Skip the day-trader engine entirely.
    #[serde(default)]
    pub disable_daytrader: bool,

    /// Run the daily allocation scoring pass and allow promotions.
    #[serde(default = "default_true")]
    pub enable_allocation: bool,

    /// Run the 24/7 crypto shadow engine.
    #[serde(default)]
    pub enable_crypto_shadow: bool,

    /// Stamp origin signal ids onto trade rows for analytics joins.
    #[serde(default)]
    pub enable_signal_outcomes: bool,

    // --- Strategy knobs ------------------------------------------------------
    #[serde(default = "StrategyKnobs::swing_defaults")]
    pub swing: StrategyKnobs,

    #[serde(default = "StrategyKnobs::day_trader_defaults")]
    pub day_trader: StrategyKnobs,

    #[serde(default = "StrategyKnobs::crypto_defaults")]
    pub crypto: StrategyKnobs,

    #[serde(default)]
    pub quick_profit: QuickProfitKnobs,

    // --- Session clock -------------------------------------------------------
    #[serde(default)]
    pub gate: GateWindow,

    /// US cash close expressed in UTC; the pre-close exits key off this.
    #[serde(default = "default_market_close_hour")]
    pub market_close_hour_utc: u32,

    #[serde(default)]
    pub market_close_minute_utc: u32,

    // --- Operational ---------------------------------------------------------
    /// Intrabar exit bar filter accepts bars from `opened_at - grace`.
    #[serde(default = "default_bar_grace_secs")]
    pub bar_grace_secs: i64,

    /// Soft wall-clock budget for one tick; engines past it are deferred.
    #[serde(default = "default_tick_soft_budget_ms")]
    pub tick_soft_budget_ms: u64,

    /// UTC hour at which the daily allocation pass runs.
    #[serde(default = "default_allocation_hour")]
    pub allocation_hour_utc: u32,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Base URL of the market-data provider. When absent the scripted
    /// provider is used (demo mode).
    #[serde(default)]
    pub data_base_url: Option<String>,

    #[serde(default)]
    pub data_api_key: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            disable_daytrader: false,
            enable_allocation: true,
            enable_crypto_shadow: false,
            enable_signal_outcomes: false,
            swing: StrategyKnobs::swing_defaults(),
            day_trader: StrategyKnobs::day_trader_defaults(),
            crypto: StrategyKnobs::crypto_defaults(),
            quick_profit: QuickProfitKnobs::default(),
            gate: GateWindow::default(),
            market_close_hour_utc: default_market_close_hour(),
            market_close_minute_utc: 0,
            bar_grace_secs: default_bar_grace_secs(),
            tick_soft_budget_ms: default_tick_soft_budget_ms(),
            allocation_hour_utc: default_allocation_hour(),
            bind_addr: default_bind_addr(),
            data_base_url: None,
            data_api_key: None,
        }
    }
}

impl EngineConfig {
    /// Build a config from defaults plus `MERIDIAN_*` environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_bool("MERIDIAN_DISABLE_DAYTRADER") {
            cfg.disable_daytrader = v;
        }
        if let Some(v) = env_bool("MERIDIAN_ENABLE_ALLOCATION") {
            cfg.enable_allocation = v;
        }
        if let Some(v) = env_bool("MERIDIAN_ENABLE_CRYPTO_SHADOW") {
            cfg.enable_crypto_shadow = v;
        }
        if let Some(v) = env_bool("MERIDIAN_ENABLE_SIGNAL_OUTCOMES") {
            cfg.enable_signal_outcomes = v;
        }

        if let Some(v) = env_f64("MERIDIAN_SWING_INITIAL_EQUITY") {
            cfg.swing.initial_equity = v;
        }
        if let Some(v) = env_f64("MERIDIAN_SWING_RISK_PCT") {
            cfg.swing.risk_pct = v;
        }
        if let Some(v) = env_u32("MERIDIAN_SWING_MAX_CONCURRENT") {
            cfg.swing.max_concurrent = v;
        }
        if let Some(v) = env_f64("MERIDIAN_SWING_MAX_NOTIONAL_PCT") {
            cfg.swing.max_notional_pct = v;
        }
        if let Some(v) = env_f64("MERIDIAN_SWING_MAX_PORTFOLIO_ALLOC_PCT") {
            cfg.swing.max_portfolio_alloc_pct = v;
        }
        if let Some(v) = env_f64("MERIDIAN_SWING_MIN_NOTIONAL") {
            cfg.swing.min_notional = v;
        }
        if let Some(v) = env_f64("MERIDIAN_TRAILING_ACTIVATION_R") {
            cfg.swing.trailing_activation_r = v;
        }
        if let Some(v) = env_f64("MERIDIAN_TRAIL_DISTANCE_R") {
            cfg.swing.trail_distance_r = v;
        }
        if let Some(v) = env_u32("MERIDIAN_EOD_FLATTEN_HOUR") {
            cfg.day_trader.eod_flatten_hour_utc = Some(v);
        }
        if let Some(v) = env_u32("MERIDIAN_EOD_FLATTEN_MINUTE") {
            cfg.day_trader.eod_flatten_minute_utc = v;
        }
        if let Some(v) = env_u32("MERIDIAN_GATE_OPEN_HOUR") {
            cfg.gate.open_hour_utc = v;
        }
        if let Some(v) = env_u32("MERIDIAN_GATE_OPEN_MINUTE") {
            cfg.gate.open_minute_utc = v;
        }
        if let Some(v) = env_u32("MERIDIAN_GATE_CLOSE_HOUR") {
            cfg.gate.close_hour_utc = v;
        }
        if let Some(v) = env_u32("MERIDIAN_GATE_CLOSE_MINUTE") {
            cfg.gate.close_minute_utc = v;
        }
        if let Some(v) = env_u32("MERIDIAN_MARKET_CLOSE_HOUR") {
            cfg.market_close_hour_utc = v;
        }
        if let Some(v) = env_u32("MERIDIAN_MARKET_CLOSE_MINUTE") {
            cfg.market_close_minute_utc = v;
        }
        if let Some(v) = env_u32("MERIDIAN_ALLOCATION_HOUR") {
            cfg.allocation_hour_utc = v;
        }
        if let Some(v) = env_string("MERIDIAN_RECYCLE_MODE") {
            match RecycleMode::parse(&v) {
                Some(mode) => cfg.swing.recycle_mode = mode,
                None => warn!(value = %v, "unrecognised recycle mode — keeping default"),
            }
        }

        if let Some(v) = env_f64("MERIDIAN_QP_BE_TRIGGER_USD") {
            cfg.quick_profit.be_trigger_usd = v;
        }
        if let Some(v) = env_f64("MERIDIAN_QP_BE_BUFFER_USD") {
            cfg.quick_profit.be_buffer_usd = v;
        }
        if let Some(v) = env_f64("MERIDIAN_QP_PARTIAL_TRIGGER_USD") {
            cfg.quick_profit.partial_trigger_usd = v;
        }
        if let Some(v) = env_f64("MERIDIAN_QP_PARTIAL_FRACTION") {
            cfg.quick_profit.partial_fraction = v;
        }
        if let Some(v) = env_f64("MERIDIAN_QP_TRAIL_DISTANCE_USD") {
            cfg.quick_profit.trail_distance_usd = v;
        }

        if let Some(v) = env_i64("MERIDIAN_BAR_GRACE_SECS") {
            cfg.bar_grace_secs = v;
        }
        if let Some(v) = env_u64("MERIDIAN_TICK_SOFT_BUDGET_MS") {
            cfg.tick_soft_budget_ms = v;
        }
        if let Some(v) = env_string("MERIDIAN_BIND_ADDR") {
            cfg.bind_addr = v;
        }
        if let Some(v) = env_string("MERIDIAN_DATA_BASE_URL") {
            cfg.data_base_url = Some(v);
        }
        if let Some(v) = env_string("MERIDIAN_DATA_API_KEY") {
            cfg.data_api_key = Some(v);
        }

        cfg
    }

    /// Strategy knobs for a trading style. Quick-profit sizing rides on its
    /// own override block; the non-sizing exit knobs come from swing.
    pub fn knobs_for(&self, style: crate::types::TradingStyle) -> &StrategyKnobs {
        use crate::types::TradingStyle;
        match style {
            TradingStyle::Swing | TradingStyle::QuickProfit => &self.swing,
            TradingStyle::DayTrader => &self.day_trader,
            TradingStyle::Crypto => &self.crypto,
        }
    }
}

// =============================================================================
// Env parsing helpers
// =============================================================================

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| parse_bool(&v))
}

/// Accepts 1/0, true/false, yes/no (case-insensitive); anything else is false.
fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

fn env_f64(key: &str) -> Option<f64> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}
