// =============================================================================
// Position Manager — the per-bar exit state machine
// =============================================================================
//
// For every open position, in priority order per bar:
//
//   1. Stop first, always: if a bar touches the effective stop (SL or the
//      trailing stop, whichever is tighter), the position closes there —
//      even when the take profit was touched in the same bar (conservative
//      intrabar sequencing).
//   2. TP1 partial -> runner to TP2 when the runner flow is enabled;
//      otherwise a plain TP full close.
//   3. After the exit checks, the bar's extremes feed the peak trackers and
//      the monotone trailing stop.
//
// After the bar loop, the current quote is checked the same way, then the
// management actions run in order: capital recycling, pre-close time exit,
// overnight hygiene, EOD flatten.
//
// Bars older than `opened_at - grace` are discarded so the opening bar can
// never trigger a look-ahead fill. Missing data never closes a position.
// =============================================================================

use anyhow::Result;
use chrono::{DateTime, Duration, Timelike, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, StrategyKnobs};
use crate::indicators::atr::atr_14;
use crate::indicators::continuation::continuation_score;
use crate::market::{Bar, BarInterval, MarketData, PositionBars};
use crate::position::{ManagementState, Position, PositionStatus};
use crate::store::{LaneStore, TradeRecord};
use crate::types::{ExitReason, RunMode, Side, TradingStyle};

// =============================================================================
// Thresholds
// =============================================================================

/// Continuation below this allows a capital recycle.
const RECYCLE_CONTINUATION_MAX: f64 = 0.25;
/// Continuation below this allows the pre-close time exit.
const TIME_EXIT_CONTINUATION_MAX: f64 = 0.3;
/// Continuation below this allows overnight hygiene.
const OVERNIGHT_CONTINUATION_MAX: f64 = 0.4;

/// Minimum time-in-trade for the pre-close time exit, minutes.
const TIME_EXIT_MIN_AGE_MIN: i64 = 120;
/// Minimum time-in-trade for overnight hygiene, minutes.
const OVERNIGHT_MIN_AGE_MIN: i64 = 360;
/// Minimum progress toward TP1 for overnight hygiene.
const OVERNIGHT_PROGRESS_MIN: f64 = 0.5;
/// Fraction closed by overnight hygiene.
const OVERNIGHT_CLOSE_FRACTION: f64 = 0.5;
/// ATR multiple for the hygiene trail seeded on the runner.
const OVERNIGHT_ATR_TRAIL_MULT: f64 = 1.0;

/// Both pre-close actions run in the last N minutes before the cash close.
const PRE_CLOSE_WINDOW_MIN: i64 = 15;

/// A position this close to its target is never recycled.
const NEAR_TP_PROGRESS: f64 = 0.8;

// =============================================================================
// Policy
// =============================================================================

/// Everything the state machine needs to know about the owning instance.
#[derive(Debug, Clone)]
pub struct ManagePolicy {
    pub knobs: StrategyKnobs,
    pub style: TradingStyle,
    pub run_mode: RunMode,
    /// Overnight hygiene applies to the v2 shadow variant only.
    pub v2_variant: bool,
    pub bar_grace_secs: i64,
    pub market_close_hour_utc: u32,
    pub market_close_minute_utc: u32,
}

impl ManagePolicy {
    pub fn from_config(
        cfg: &EngineConfig,
        style: TradingStyle,
        run_mode: RunMode,
        engine_version: &str,
    ) -> Self {
        Self {
            knobs: cfg.knobs_for(style).clone(),
            style,
            run_mode,
            v2_variant: engine_version.starts_with("v2"),
            bar_grace_secs: cfg.bar_grace_secs,
            market_close_hour_utc: cfg.market_close_hour_utc,
            market_close_minute_utc: cfg.market_close_minute_utc,
        }
    }

    /// Minutes until today's cash close; negative once past it.
    fn minutes_to_close(&self, now: DateTime<Utc>) -> i64 {
        let close = (self.market_close_hour_utc * 60 + self.market_close_minute_utc) as i64;
        let current = (now.hour() * 60 + now.minute()) as i64;
        close - current
    }

    fn in_pre_close_window(&self, now: DateTime<Utc>) -> bool {
        let mins = self.minutes_to_close(now);
        (0..=PRE_CLOSE_WINDOW_MIN).contains(&mins)
    }

    fn past_eod_flatten(&self, now: DateTime<Utc>) -> bool {
        match self.knobs.eod_flatten_hour_utc {
            Some(hour) => {
                let flatten = (hour * 60 + self.knobs.eod_flatten_minute_utc) as i64;
                let current = (now.hour() * 60 + now.minute()) as i64;
                current >= flatten
            }
            None => false,
        }
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// One exit emitted by the machine, full or partial.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub reason: ExitReason,
    pub price: f64,
    pub qty: f64,
}

/// Result of managing one position for one tick.
#[derive(Debug)]
pub struct ManageOutcome {
    pub exits: Vec<ExitEvent>,
    /// The surviving position state, or `None` when fully closed.
    pub position: Option<Position>,
}

// =============================================================================
// The machine
// =============================================================================

struct Machine<'a> {
    pos: Position,
    policy: &'a ManagePolicy,
    now: DateTime<Utc>,
    exits: Vec<ExitEvent>,
    closed: bool,
}

impl<'a> Machine<'a> {
    fn new(pos: Position, policy: &'a ManagePolicy, now: DateTime<Utc>) -> Self {
        Self {
            pos,
            policy,
            now,
            exits: Vec::new(),
            closed: false,
        }
    }

    fn full_close(&mut self, reason: ExitReason, price: f64) {
        self.exits.push(ExitEvent {
            reason,
            price,
            qty: self.pos.qty,
        });
        self.pos.qty = 0.0;
        self.pos.status = PositionStatus::Closed;
        self.closed = true;
        info!(
            id = %self.pos.id,
            symbol = %self.pos.symbol,
            reason = %reason,
            price,
            "position closed"
        );
    }

    fn partial_close(&mut self, reason: ExitReason, price: f64, fraction: f64) {
        let close_qty = self.pos.qty * fraction;
        if close_qty <= 0.0 {
            return;
        }
        if close_qty >= self.pos.qty {
            self.full_close(reason, price);
            return;
        }
        self.exits.push(ExitEvent {
            reason,
            price,
            qty: close_qty,
        });
        if let Err(e) = self.pos.apply_partial_close(close_qty) {
            warn!(id = %self.pos.id, error = %e, "partial close bookkeeping failed");
            return;
        }
        info!(
            id = %self.pos.id,
            symbol = %self.pos.symbol,
            reason = %reason,
            price,
            close_qty,
            remaining = self.pos.qty,
            "partial close"
        );
    }

    /// Whether the trailing stop, not the original SL, is the binding stop.
    fn trailing_is_binding(&self) -> bool {
        match (self.pos.side, self.pos.trailing_stop_price) {
            (Side::Long, Some(t)) => t >= self.pos.stop_loss,
            (Side::Short, Some(t)) => t <= self.pos.stop_loss,
            (_, None) => false,
        }
    }

    /// Exit checks for one observed price range. Stop first (P-conservative
    /// intrabar sequencing), then the take-profit side of the flow.
    fn check_exits_for_range(&mut self, low: f64, high: f64) {
        if self.closed {
            return;
        }

        // ── 1. Stop (SL or trailing, whichever binds) ───────────────────
        let eff_stop = self.pos.effective_stop();
        let stop_touched = match self.pos.side {
            Side::Long => low <= eff_stop,
            Side::Short => high >= eff_stop,
        };
        if stop_touched {
            let reason = if self.trailing_is_binding() {
                if self.pos.runner_active() {
                    ExitReason::RunnerTrailExit
                } else {
                    ExitReason::TrailingSlHit
                }
            } else {
                ExitReason::SlHit
            };
            self.full_close(reason, eff_stop);
            return;
        }

        // ── 2. Take profit ──────────────────────────────────────────────
        let side = self.pos.side;
        let touched = move |target: f64| match side {
            Side::Long => high >= target,
            Side::Short => low <= target,
        };

        if self.policy.knobs.runner_enabled && !self.pos.tp1_hit {
            if touched(self.pos.take_profit_1) {
                let tp1 = self.pos.take_profit_1;
                self.partial_close(
                    ExitReason::Tp1Partial,
                    tp1,
                    self.policy.knobs.tp1_close_pct,
                );
                if self.closed {
                    return;
                }
                // Retarget the remainder at TP2 and lock the entry.
                if self.pos.take_profit_2.is_none() {
                    let tp2 = self.pos.entry_price
                        + self.pos.side.sign()
                            * self.policy.knobs.tp2_r_multiple
                            * self.pos.risk_per_share;
                    self.pos.take_profit_2 = Some(tp2);
                }
                let _ = self.pos.arm_breakeven(0.0, self.now);
                if let Err(e) = self.pos.activate_runner(self.now) {
                    warn!(id = %self.pos.id, error = %e, "runner activation refused");
                }
            }
        } else if self.pos.runner_active() {
            if let Some(tp2) = self.pos.take_profit_2 {
                if touched(tp2) {
                    self.full_close(ExitReason::Tp2Hit, tp2);
                }
            }
        } else if touched(self.pos.take_profit_1) {
            self.full_close(ExitReason::TpHit, self.pos.take_profit_1);
        }
    }

    /// Trailing activation and monotone tightening from the current peaks.
    fn update_trailing(&mut self) {
        if self.closed {
            return;
        }
        let peak = self.pos.peak_price();
        if !self.pos.trailing_active {
            if self.pos.unrealized_r(peak) < self.policy.knobs.trailing_activation_r {
                return;
            }
            debug!(
                id = %self.pos.id,
                peak,
                "trailing stop activated"
            );
        }
        let candidate = peak
            - self.pos.side.sign() * self.policy.knobs.trail_distance_r * self.pos.risk_per_share;
        self.pos.tighten_trailing(candidate);
    }

    fn meta_flag(&self, key: &str) -> bool {
        self.pos
            .management_meta
            .as_ref()
            .and_then(|m| m.get(key))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn set_meta_flag(&mut self, key: &str) {
        let mut meta = self
            .pos
            .management_meta
            .take()
            .unwrap_or_else(|| serde_json::json!({}));
        if let Some(obj) = meta.as_object_mut() {
            obj.insert(key.to_string(), serde_json::Value::Bool(true));
        }
        self.pos.management_meta = Some(meta);
    }

    fn finish(self) -> ManageOutcome {
        ManageOutcome {
            exits: self.exits,
            position: if self.closed { None } else { Some(self.pos) },
        }
    }
}

/// Signed progress of `price` from entry toward TP1, 1.0 = at target.
fn progress_to_tp1(pos: &Position, price: f64) -> f64 {
    let span = pos.side.sign() * (pos.take_profit_1 - pos.entry_price);
    if span <= 0.0 {
        return 0.0;
    }
    pos.side.sign() * (price - pos.entry_price) / span
}

/// Progress toward the currently active target (TP2 once the runner is on).
fn progress_to_target(pos: &Position, price: f64) -> f64 {
    let target = if pos.runner_active() {
        pos.take_profit_2.unwrap_or(pos.take_profit_1)
    } else {
        pos.take_profit_1
    };
    let span = pos.side.sign() * (target - pos.entry_price);
    if span <= 0.0 {
        return 0.0;
    }
    pos.side.sign() * (price - pos.entry_price) / span
}

// =============================================================================
// The per-position pass (pure)
// =============================================================================

/// Advance one position's state machine over this tick's market data.
///
/// Deterministic: the same position, bars, policy, and clock always produce
/// the same exits in the same order.
pub fn manage_position(
    position: &Position,
    data: &PositionBars,
    intraday: &[Bar],
    policy: &ManagePolicy,
    now: DateTime<Utc>,
) -> ManageOutcome {
    let mut m = Machine::new(position.clone(), policy, now);

    // ── Bars: grace-filtered, ascending ─────────────────────────────────
    let grace = Duration::seconds(policy.bar_grace_secs);
    let mut bars: Vec<Bar> = data
        .bars
        .iter()
        .copied()
        .filter(|b| b.ts >= position.opened_at - grace)
        .collect();
    bars.sort_by_key(|b| b.ts);

    for bar in &bars {
        m.check_exits_for_range(bar.low, bar.high);
        if m.closed {
            break;
        }
        m.pos.observe_range(bar.high, bar.low);
        m.update_trailing();
    }

    // ── Quote fallback path ─────────────────────────────────────────────
    let price = if data.current_price > 0.0 {
        data.current_price
    } else {
        bars.last().map(|b| b.close).unwrap_or(0.0)
    };

    if !m.closed && price > 0.0 {
        m.check_exits_for_range(price, price);
        if !m.closed {
            m.pos.observe_range(price, price);
            m.update_trailing();
        }
    }

    if m.closed || price <= 0.0 {
        return m.finish();
    }

    // ── Management actions ──────────────────────────────────────────────
    let score_bars: &[Bar] = if bars.len() >= 10 { &bars } else { intraday };
    let cont = continuation_score(score_bars, m.pos.side);
    let r_now = m.pos.unrealized_r(price);
    let age_min = m.pos.age_minutes(now);

    // Capital recycling: bank part of a stalled winner with a safe stop.
    if policy.knobs.recycle_mode.is_enabled()
        && !m.meta_flag("trend_follower")
        && !m.pos.runner_active()
        && !m.pos.has_recycled_capital
        && m.pos.stop_at_or_beyond_entry()
        && r_now >= policy.knobs.recycle_min_r
        && age_min >= policy.knobs.recycle_min_minutes
        && cont < RECYCLE_CONTINUATION_MAX
        && progress_to_target(&m.pos, price) < NEAR_TP_PROGRESS
    {
        info!(
            id = %m.pos.id,
            symbol = %m.pos.symbol,
            r = format!("{r_now:.2}"),
            continuation = format!("{cont:.2}"),
            "capital recycle — low momentum"
        );
        m.partial_close(
            ExitReason::CapitalRecycleLowMomentum,
            price,
            policy.knobs.recycle_fraction,
        );
        m.pos.has_recycled_capital = true;
    }

    // Pre-close time exit: swing trades that went nowhere into the close.
    if !m.closed
        && policy.style == TradingStyle::Swing
        && policy.in_pre_close_window(now)
        && r_now >= policy.knobs.time_exit_floor_r
        && age_min >= TIME_EXIT_MIN_AGE_MIN
        && cont < TIME_EXIT_CONTINUATION_MAX
    {
        let reason = if policy.v2_variant {
            ExitReason::TimeExitPreCloseV2
        } else {
            ExitReason::TimeExitPreCloseSideways
        };
        m.full_close(reason, price);
    }

    // Overnight hygiene (shadow v2 only): lock half, move the stop to entry,
    // seed an ATR trail on the runner. Additive, once per position.
    if !m.closed
        && policy.run_mode == RunMode::Shadow
        && policy.v2_variant
        && policy.in_pre_close_window(now)
        && !m.meta_flag("overnight_hygiene")
        && progress_to_tp1(&m.pos, price) >= OVERNIGHT_PROGRESS_MIN
        && age_min >= OVERNIGHT_MIN_AGE_MIN
        && cont < OVERNIGHT_CONTINUATION_MAX
    {
        info!(
            id = %m.pos.id,
            symbol = %m.pos.symbol,
            continuation = format!("{cont:.2}"),
            "overnight hygiene — locking half, stop to entry, ATR trail"
        );
        m.partial_close(ExitReason::OvernightPartialClose, price, OVERNIGHT_CLOSE_FRACTION);
        if !m.closed {
            match m.pos.state {
                ManagementState::Running => {
                    let _ = m.pos.arm_breakeven(0.0, now);
                }
                _ => {
                    // Runner already active: move the stop, favorably only.
                    m.pos.stop_loss = match m.pos.side {
                        Side::Long => m.pos.stop_loss.max(m.pos.entry_price),
                        Side::Short => m.pos.stop_loss.min(m.pos.entry_price),
                    };
                }
            }
            if let Some(atr) = atr_14(intraday) {
                let candidate =
                    m.pos.peak_price() - m.pos.side.sign() * OVERNIGHT_ATR_TRAIL_MULT * atr;
                m.pos.tighten_trailing(candidate);
            }
            m.set_meta_flag("overnight_hygiene");
        }
    }

    // EOD flatten: intraday strategies go home flat.
    if !m.closed && policy.style == TradingStyle::DayTrader && policy.past_eod_flatten(now) {
        m.full_close(ExitReason::EodFlatten, price);
    }

    m.finish()
}

// =============================================================================
// The store/market driver
// =============================================================================

/// Counters from one instance's position pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassStats {
    pub managed: usize,
    pub exits: usize,
    pub errors: usize,
}

/// Manage every open position of the lane's instance, writing exits and
/// updated state. Per-position errors are logged and the position stays OPEN
/// for the next tick; only a run-mode guard violation propagates (it aborts
/// the tick).
pub async fn run_position_pass(
    lane: &LaneStore,
    market: &dyn MarketData,
    policy: &ManagePolicy,
    stamp_signal_outcomes: bool,
) -> Result<PassStats> {
    let mut stats = PassStats::default();

    for pos in lane.open_positions() {
        let data = match market.fetch_position_bars(&pos.symbol).await {
            Ok(d) => d,
            Err(e) => {
                warn!(
                    symbol = %pos.symbol,
                    error = %e,
                    "bar fetch failed — position left OPEN for next tick"
                );
                stats.errors += 1;
                continue;
            }
        };
        let intraday = market
            .fetch_intraday_ohlc(&pos.symbol, BarInterval::FiveMinute, 2)
            .await
            .unwrap_or_default();

        let outcome = manage_position(&pos, &data, &intraday, policy, lane.ctx.now);
        match apply_outcome(lane, &pos, outcome, stamp_signal_outcomes) {
            Ok(exit_count) => {
                stats.managed += 1;
                stats.exits += exit_count;
            }
            Err(e) => {
                if e.downcast_ref::<crate::store::guard::GuardViolation>().is_some() {
                    return Err(e);
                }
                warn!(
                    id = %pos.id,
                    symbol = %pos.symbol,
                    error = %e,
                    "position writeback failed — row re-evaluated next tick"
                );
                stats.errors += 1;
            }
        }
    }

    Ok(stats)
}

/// Persist one position's outcome: trade rows for every exit, then the
/// updated row or a status-checked delete.
pub(crate) fn apply_outcome(
    lane: &LaneStore,
    original: &Position,
    outcome: ManageOutcome,
    stamp_signal_outcomes: bool,
) -> Result<usize> {
    let exit_count = outcome.exits.len();

    for event in &outcome.exits {
        let trade = trade_from_exit(original, event, lane.ctx.now, stamp_signal_outcomes);
        lane.insert_trade(&trade)?;
    }

    match outcome.position {
        Some(updated) => lane.update_position(&updated)?,
        None => {
            lane.delete_position(&original.id)?;
        }
    }

    Ok(exit_count)
}

pub(crate) fn trade_from_exit(
    pos: &Position,
    event: &ExitEvent,
    now: DateTime<Utc>,
    stamp_signal_outcomes: bool,
) -> TradeRecord {
    let pnl = pos.side.sign() * (event.price - pos.entry_price) * event.qty;
    let realized_r = if pos.risk_per_share > 0.0 {
        pos.side.sign() * (event.price - pos.entry_price) / pos.risk_per_share
    } else {
        0.0
    };
    TradeRecord {
        id: Uuid::new_v4().to_string(),
        engine_key: pos.engine_key.clone(),
        engine_version: pos.engine_version.clone(),
        run_mode: pos.run_mode,
        symbol: pos.symbol.clone(),
        side: pos.side,
        entry_price: pos.entry_price,
        exit_price: event.price,
        qty: event.qty,
        exit_reason: event.reason,
        realized_pnl: pnl,
        realized_r,
        opened_at: pos.opened_at,
        closed_at: now,
        signal_id: if stamp_signal_outcomes {
            pos.signal_id.clone()
        } else {
            None
        },
        position_id: pos.id.clone(),
    }
}
