// =============================================================================
// Shared types used across the Meridian portfolio engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Execution lane of an engine instance.
///
/// PRIMARY is the live lane backing the platform UI; SHADOW lanes paper-trade
/// alongside it. The two lanes write to disjoint table partitions (see
/// `store::guard`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunMode {
    #[serde(rename = "PRIMARY")]
    Primary,
    #[serde(rename = "SHADOW")]
    Shadow,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "PRIMARY"),
            Self::Shadow => write!(f, "SHADOW"),
        }
    }
}

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl Side {
    /// +1.0 for LONG, -1.0 for SHORT. Multiplied into price differences to
    /// get signed P&L.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Directional verdict carried by a consumed signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSide {
    Buy,
    Sell,
    Neutral,
}

impl SignalSide {
    /// Map the signal verdict onto a position side, if it is tradable.
    pub fn to_position_side(self) -> Option<Side> {
        match self {
            Self::Buy => Some(Side::Long),
            Self::Sell => Some(Side::Short),
            Self::Neutral => None,
        }
    }
}

/// Trading style of an engine instance. Drives which exit rules apply
/// (EOD flatten for day traders, pre-close time exits for swing, the
/// dollar-P&L machine for quick profit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradingStyle {
    #[serde(rename = "SWING")]
    Swing,
    #[serde(rename = "DAY_TRADER")]
    DayTrader,
    #[serde(rename = "QUICK_PROFIT")]
    QuickProfit,
    #[serde(rename = "CRYPTO")]
    Crypto,
}

impl std::fmt::Display for TradingStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Swing => write!(f, "SWING"),
            Self::DayTrader => write!(f, "DAY_TRADER"),
            Self::QuickProfit => write!(f, "QUICK_PROFIT"),
            Self::Crypto => write!(f, "CRYPTO"),
        }
    }
}

/// The closed set of exit reasons written to trade rows. Wire strings are
/// consumed by downstream analytics and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    #[serde(rename = "TP_HIT")]
    TpHit,
    #[serde(rename = "SL_HIT")]
    SlHit,
    #[serde(rename = "TRAILING_SL_HIT")]
    TrailingSlHit,
    #[serde(rename = "TP1_PARTIAL")]
    Tp1Partial,
    #[serde(rename = "TP2_HIT")]
    Tp2Hit,
    #[serde(rename = "RUNNER_TRAIL_EXIT")]
    RunnerTrailExit,
    #[serde(rename = "EOD_FLATTEN")]
    EodFlatten,
    #[serde(rename = "TIME_EXIT_PRE_CLOSE_SIDEWAYS")]
    TimeExitPreCloseSideways,
    #[serde(rename = "TIME_EXIT_PRE_CLOSE_V2")]
    TimeExitPreCloseV2,
    #[serde(rename = "CAPITAL_RECYCLE_LOW_MOMENTUM")]
    CapitalRecycleLowMomentum,
    #[serde(rename = "OVERNIGHT_PARTIAL_CLOSE")]
    OvernightPartialClose,
    #[serde(rename = "FORCE_CLOSED_ADMIN")]
    ForceClosedAdmin,
    #[serde(rename = "STOP_LOSS")]
    StopLoss,
    #[serde(rename = "TRAIL_STOP")]
    TrailStop,
    #[serde(rename = "PARTIAL_PROFIT")]
    PartialProfit,
    #[serde(rename = "manual")]
    Manual,
}

impl ExitReason {
    /// Whether this reason closes only part of the position (the position
    /// record survives with reduced quantity).
    pub fn is_partial(&self) -> bool {
        matches!(
            self,
            Self::Tp1Partial
                | Self::CapitalRecycleLowMomentum
                | Self::OvernightPartialClose
                | Self::PartialProfit
        )
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TpHit => "TP_HIT",
            Self::SlHit => "SL_HIT",
            Self::TrailingSlHit => "TRAILING_SL_HIT",
            Self::Tp1Partial => "TP1_PARTIAL",
            Self::Tp2Hit => "TP2_HIT",
            Self::RunnerTrailExit => "RUNNER_TRAIL_EXIT",
            Self::EodFlatten => "EOD_FLATTEN",
            Self::TimeExitPreCloseSideways => "TIME_EXIT_PRE_CLOSE_SIDEWAYS",
            Self::TimeExitPreCloseV2 => "TIME_EXIT_PRE_CLOSE_V2",
            Self::CapitalRecycleLowMomentum => "CAPITAL_RECYCLE_LOW_MOMENTUM",
            Self::OvernightPartialClose => "OVERNIGHT_PARTIAL_CLOSE",
            Self::ForceClosedAdmin => "FORCE_CLOSED_ADMIN",
            Self::StopLoss => "STOP_LOSS",
            Self::TrailStop => "TRAIL_STOP",
            Self::PartialProfit => "PARTIAL_PROFIT",
            Self::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

/// A configured strategy engine. One instance per (key, version, run mode);
/// the scheduler iterates enabled instances every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineInstance {
    pub engine_key: String,
    pub engine_version: String,
    pub run_mode: RunMode,
    pub style: TradingStyle,
    pub enabled: bool,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl EngineInstance {
    pub fn new(
        engine_key: impl Into<String>,
        engine_version: impl Into<String>,
        run_mode: RunMode,
        style: TradingStyle,
    ) -> Self {
        Self {
            engine_key: engine_key.into(),
            engine_version: engine_version.into(),
            run_mode,
            style,
            enabled: true,
            stopped_at: None,
        }
    }

    /// Build the per-tick execution context carrying this instance's identity.
    pub fn context(&self, now: DateTime<Utc>) -> EngineContext {
        EngineContext {
            engine_key: self.engine_key.clone(),
            engine_version: self.engine_version.clone(),
            run_mode: self.run_mode,
            style: self.style,
            now,
        }
    }
}

/// Per-tick execution context for one engine instance. Every store write and
/// audit row carries this identity.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub engine_key: String,
    pub engine_version: String,
    pub run_mode: RunMode,
    pub style: TradingStyle,
    pub now: DateTime<Utc>,
}

impl std::fmt::Display for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{} [{}]",
            self.engine_key, self.engine_version, self.run_mode
        )
    }
}
