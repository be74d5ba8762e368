// =============================================================================
// Position Model — open-position record with a tagged management state
// =============================================================================
//
// Life-cycle:
//   Running  ->  BreakevenArmed  ->  RunnerActive  ->  Closed
//   Running  ->  Closed (SL / TP / trailing / flatten / admin)
//
// The management phase is a tagged variant with an explicit transition
// function, not a pile of booleans: illegal transitions return an error and
// leave the position untouched. `risk_dollars` is fixed at open
// (|entry - SL| * initial qty) and never mutated afterwards; partial exits
// pro-rate against it in their trade rows.
// =============================================================================

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{RunMode, Side};

/// Current status of a position row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "CLOSED")]
    Closed,
}

/// Management phase of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase")]
pub enum ManagementState {
    /// Default phase after open: full quantity, original SL/TP.
    #[serde(rename = "RUNNING")]
    Running,
    /// Stop has been moved to entry (plus optional buffer).
    #[serde(rename = "BREAKEVEN_ARMED")]
    BreakevenArmed { armed_at: DateTime<Utc> },
    /// TP1 partial has been taken; the remainder runs to TP2 or a trail.
    #[serde(rename = "RUNNER_ACTIVE")]
    RunnerActive { activated_at: DateTime<Utc> },
}

/// A single tracked position. Created by signal admission, mutated only by
/// the position manager of the owning engine instance, deleted on full exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub engine_key: String,
    pub engine_version: String,
    pub run_mode: RunMode,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    /// Remaining open quantity (reduced on partial close).
    pub qty: f64,
    /// Quantity at open; the denominator for pro-rated partials.
    pub initial_qty: f64,
    /// Notional locked at open for the remaining quantity.
    pub notional_at_entry: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    #[serde(default)]
    pub take_profit_2: Option<f64>,
    /// |entry - initial SL| * initial qty. Never mutated after open.
    pub risk_dollars: f64,
    /// |entry - initial SL|. One "R" in price terms.
    pub risk_per_share: f64,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub state: ManagementState,
    /// Highest price seen since open (peak for longs).
    pub highest_price_reached: f64,
    /// Lowest price seen since open (peak for shorts).
    pub lowest_price_reached: f64,
    pub trailing_active: bool,
    #[serde(default)]
    pub trailing_stop_price: Option<f64>,
    pub tp1_hit: bool,
    #[serde(default)]
    pub partial_taken: bool,
    /// Best unrealized P&L seen, in dollars (quick-profit machine).
    #[serde(default)]
    pub trail_peak_pnl: f64,
    #[serde(default)]
    pub has_recycled_capital: bool,
    #[serde(default)]
    pub management_meta: Option<serde_json::Value>,
    /// Origin signal. Exactly one per position.
    #[serde(default)]
    pub signal_id: Option<String>,
}

/// Everything admission needs to hand over to open a position.
#[derive(Debug, Clone)]
pub struct OpenSpec {
    pub engine_key: String,
    pub engine_version: String,
    pub run_mode: RunMode,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub qty: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: Option<f64>,
    pub signal_id: Option<String>,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Open a new position. Risk bookkeeping is derived here and frozen.
    pub fn open(spec: OpenSpec) -> Self {
        let risk_per_share = (spec.entry_price - spec.stop_loss).abs();
        Self {
            id: Uuid::new_v4().to_string(),
            engine_key: spec.engine_key,
            engine_version: spec.engine_version,
            run_mode: spec.run_mode,
            symbol: spec.symbol,
            side: spec.side,
            entry_price: spec.entry_price,
            qty: spec.qty,
            initial_qty: spec.qty,
            notional_at_entry: spec.entry_price * spec.qty,
            stop_loss: spec.stop_loss,
            take_profit_1: spec.take_profit_1,
            take_profit_2: spec.take_profit_2,
            risk_dollars: risk_per_share * spec.qty,
            risk_per_share,
            opened_at: spec.opened_at,
            status: PositionStatus::Open,
            state: ManagementState::Running,
            highest_price_reached: spec.entry_price,
            lowest_price_reached: spec.entry_price,
            trailing_active: false,
            trailing_stop_price: None,
            tp1_hit: false,
            partial_taken: false,
            trail_peak_pnl: 0.0,
            has_recycled_capital: false,
            management_meta: None,
            signal_id: spec.signal_id,
        }
    }

    // -------------------------------------------------------------------------
    // Derived values
    // -------------------------------------------------------------------------

    /// Signed unrealized P&L at `price`, in dollars, for the remaining qty.
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) * self.qty
    }

    /// Unrealized R-multiple at `price`.
    pub fn unrealized_r(&self, price: f64) -> f64 {
        if self.risk_per_share <= 0.0 {
            return 0.0;
        }
        self.side.sign() * (price - self.entry_price) / self.risk_per_share
    }

    /// The stop actually in force: the tighter of SL and the trailing stop.
    pub fn effective_stop(&self) -> f64 {
        match (self.side, self.trailing_stop_price) {
            (Side::Long, Some(trail)) => self.stop_loss.max(trail),
            (Side::Short, Some(trail)) => self.stop_loss.min(trail),
            (_, None) => self.stop_loss,
        }
    }

    /// The favorable extreme seen so far (high for longs, low for shorts).
    pub fn peak_price(&self) -> f64 {
        match self.side {
            Side::Long => self.highest_price_reached,
            Side::Short => self.lowest_price_reached,
        }
    }

    /// Whether the runner phase is active.
    pub fn runner_active(&self) -> bool {
        matches!(self.state, ManagementState::RunnerActive { .. })
    }

    /// Whether the stop already sits at or beyond entry (no open risk left).
    pub fn stop_at_or_beyond_entry(&self) -> bool {
        match self.side {
            Side::Long => self.effective_stop() >= self.entry_price,
            Side::Short => self.effective_stop() <= self.entry_price,
        }
    }

    /// Minutes since the position was opened.
    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_minutes()
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Fold a new observed price range into the peak trackers.
    pub fn observe_range(&mut self, high: f64, low: f64) {
        if high > self.highest_price_reached {
            self.highest_price_reached = high;
        }
        if low < self.lowest_price_reached {
            self.lowest_price_reached = low;
        }
    }

    /// Propose a new trailing stop. The trail only ever tightens: candidates
    /// looser than the current stop are discarded.
    pub fn tighten_trailing(&mut self, candidate: f64) {
        let accepted = match (self.side, self.trailing_stop_price) {
            (Side::Long, Some(cur)) => candidate > cur,
            (Side::Short, Some(cur)) => candidate < cur,
            (_, None) => true,
        };
        if accepted {
            self.trailing_stop_price = Some(candidate);
            self.trailing_active = true;
        }
    }

    /// Move the stop to entry plus an optional per-share buffer in the
    /// favorable direction. Transition Running -> BreakevenArmed.
    pub fn arm_breakeven(&mut self, buffer_per_share: f64, now: DateTime<Utc>) -> Result<()> {
        match self.state {
            ManagementState::Running => {
                self.stop_loss = match self.side {
                    Side::Long => self.entry_price + buffer_per_share,
                    Side::Short => self.entry_price - buffer_per_share,
                };
                self.state = ManagementState::BreakevenArmed { armed_at: now };
                Ok(())
            }
            ManagementState::BreakevenArmed { .. } => Ok(()), // already armed
            ManagementState::RunnerActive { .. } => {
                bail!("cannot arm breakeven after the runner is active")
            }
        }
    }

    /// Enter the runner phase after a TP1 partial. Retargets the take profit
    /// to TP2 when one is set.
    pub fn activate_runner(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.runner_active() {
            bail!("runner already active");
        }
        self.tp1_hit = true;
        self.partial_taken = true;
        self.state = ManagementState::RunnerActive { activated_at: now };
        Ok(())
    }

    /// Reduce quantity after a partial close. `risk_dollars` is deliberately
    /// untouched; exit rows pro-rate against it.
    pub fn apply_partial_close(&mut self, closed_qty: f64) -> Result<()> {
        if closed_qty <= 0.0 || closed_qty >= self.qty {
            bail!(
                "partial close qty {} out of range (open {})",
                closed_qty,
                self.qty
            );
        }
        self.qty -= closed_qty;
        self.notional_at_entry = self.entry_price * self.qty;
        self.partial_taken = true;
        Ok(())
    }
}
