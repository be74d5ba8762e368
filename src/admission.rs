// =============================================================================
// Signal Admission — per-signal validation, sizing, and position open
// =============================================================================
//
// Per signal, in order, skipping with a specific reason on the first failing
// check:
//
//    1. trade gate (clock window + context decision) — closed gate aborts
//       the whole instance's admission
//    2. engine ownership
//    3. lane assignment against the bucket guard (CORE / EXPLORE slots)
//    4. duplicate ticker
//    5. concurrent-position cap
//    6. reward:risk floor
//    7. distance guard (absolute backstop, then ATR(14))
//    8. entry freshness (deviation + 5-bar touch rescue)
//    9. SL/TP side validity
//   10. risk-based sizing under notional caps and floors
//   11. insert + in-memory counter update (only after a successful insert)
//
// Every evaluation appends exactly one decision row. Deterministic: the same
// state, signals, quotes, bars, and config produce the identical sequence of
// decisions and reason codes.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};
use tracing::{info, warn};

use crate::audit::{self, DecisionRow};
use crate::config::{GateWindow, StrategyKnobs};
use crate::indicators::atr::atr_14;
use crate::lane::{BucketGuard, LaneAssignment};
use crate::market::{BarInterval, MarketData, Quote};
use crate::portfolio::PortfolioView;
use crate::position::{OpenSpec, Position};
use crate::signals_feed::Signal;
use crate::store::{ContextDecision, GateVerdict, LaneStore};
use crate::types::{RunMode, Side, TradingStyle};
use crate::universe::Universe;

// =============================================================================
// Validation constants
// =============================================================================

/// Minimum reward:risk to admit a signal.
const MIN_RR: f64 = 0.5;
/// Absolute backstop: SL further than this fraction of entry is unrealistic.
const MAX_SL_DISTANCE_PCT: f64 = 0.12;
/// Absolute backstop: TP further than this fraction of entry is unrealistic.
const MAX_TP_DISTANCE_PCT: f64 = 0.25;
/// ATR multiples beyond which SL / TP distances are unrealistic.
const MAX_SL_ATR_MULT: f64 = 3.0;
const MAX_TP_ATR_MULT: f64 = 6.0;
/// Entry deviation that triggers the staleness check.
const STALE_DEVIATION_PCT: f64 = 0.015;
/// Bars inspected by the freshness touch-check.
const TOUCH_CHECK_BARS: usize = 5;

// =============================================================================
// Trade gate
// =============================================================================

/// Resolved gate for one instance this tick.
#[derive(Debug, Clone)]
pub struct GateState {
    pub open: bool,
    pub reason: Option<String>,
    /// Risk multiplier from the context decision (1.0 = unchanged).
    pub risk_scale: f64,
    pub max_positions_override: Option<u32>,
}

impl GateState {
    /// Evaluate the clock window and, for shadow lanes, the context decision.
    /// Crypto engines trade around the clock and skip the session window.
    pub fn evaluate(
        window: &GateWindow,
        now: DateTime<Utc>,
        style: TradingStyle,
        run_mode: RunMode,
        context: Option<&ContextDecision>,
    ) -> Self {
        if style != TradingStyle::Crypto && !window.contains(now.hour(), now.minute()) {
            return Self {
                open: false,
                reason: Some(format!(
                    "outside session window {:02}:{:02}-{:02}:{:02} UTC",
                    window.open_hour_utc,
                    window.open_minute_utc,
                    window.close_hour_utc,
                    window.close_minute_utc
                )),
                risk_scale: 1.0,
                max_positions_override: None,
            };
        }

        if run_mode == RunMode::Shadow {
            if let Some(decision) = context {
                if decision.trade_gate == GateVerdict::Close {
                    return Self {
                        open: false,
                        reason: Some(format!(
                            "context decision {} closed the gate",
                            decision.policy_version
                        )),
                        risk_scale: decision.risk_scale,
                        max_positions_override: decision.max_positions,
                    };
                }
                return Self {
                    open: true,
                    reason: None,
                    risk_scale: decision.risk_scale,
                    max_positions_override: decision.max_positions,
                };
            }
        }

        Self {
            open: true,
            reason: None,
            risk_scale: 1.0,
            max_positions_override: None,
        }
    }
}

// =============================================================================
// Admission pass
// =============================================================================

/// Counters from one instance's admission pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdmissionStats {
    pub evaluated: usize,
    pub opened: usize,
    pub skipped: usize,
}

/// Everything admission needs from the surrounding tick.
pub struct AdmissionDeps<'a> {
    pub lane: &'a LaneStore,
    pub market: &'a dyn MarketData,
    pub universe: &'a Universe,
    /// Present only for the SWING PRIMARY instance.
    pub bucket: Option<&'a BucketGuard>,
    pub knobs: &'a StrategyKnobs,
    pub gate: GateState,
    pub quotes: &'a HashMap<String, Quote>,
}

/// Run admission for one instance over this tick's fresh signals.
///
/// `view` is mutated in place as positions open so later signals see the
/// updated cash/allocation/open-count.
pub async fn run_admission(
    deps: &AdmissionDeps<'_>,
    view: &mut PortfolioView,
    signals: &[Signal],
) -> AdmissionStats {
    let mut stats = AdmissionStats::default();
    let ctx = &deps.lane.ctx;

    // ── 1. Trade gate: a closed gate aborts the whole instance ──────────
    if !deps.gate.open {
        let reason = deps
            .gate
            .reason
            .clone()
            .unwrap_or_else(|| "gate closed".to_string());
        let row = DecisionRow::skip(
            ctx,
            None,
            "*",
            audit::SKIP_TRADE_GATE,
            reason,
            view.at_decision(),
            false,
            None,
        );
        if let Err(e) = deps.lane.log_decision(row) {
            warn!(error = %e, "failed to log gate decision");
        }
        return stats;
    }

    // Per-lane open counts for the bucket guard, updated as we admit.
    let open_positions = deps.lane.open_positions();
    let mut core_open = 0usize;
    let mut explore_open = 0usize;
    if let Some(bucket) = deps.bucket {
        for pos in &open_positions {
            match bucket.classify(&pos.symbol) {
                LaneAssignment::Core => core_open += 1,
                LaneAssignment::Explore => explore_open += 1,
                LaneAssignment::Outside => {}
            }
        }
    }
    let mut open_symbols: Vec<String> = open_positions.iter().map(|p| p.symbol.clone()).collect();

    let max_concurrent = deps
        .gate
        .max_positions_override
        .unwrap_or(deps.knobs.max_concurrent);

    for signal in signals {
        stats.evaluated += 1;

        let verdict =
            evaluate_signal(deps, view, signal, &open_symbols, core_open, explore_open, max_concurrent)
                .await;

        match verdict {
            SignalVerdict::Opened { lane_label } => {
                stats.opened += 1;
                open_symbols.push(signal.symbol.clone());
                match lane_label.as_deref() {
                    Some("CORE") => core_open += 1,
                    Some("EXPLORE") => explore_open += 1,
                    _ => {}
                }
            }
            SignalVerdict::Skipped => stats.skipped += 1,
        }
    }

    stats
}

enum SignalVerdict {
    Opened { lane_label: Option<String> },
    Skipped,
}

#[allow(clippy::too_many_arguments)]
async fn evaluate_signal(
    deps: &AdmissionDeps<'_>,
    view: &mut PortfolioView,
    signal: &Signal,
    open_symbols: &[String],
    core_open: usize,
    explore_open: usize,
    max_concurrent: u32,
) -> SignalVerdict {
    let ctx = &deps.lane.ctx;

    // Snapshot the book as this signal's evaluation starts; every audit row
    // for the signal carries it.
    let portfolio_at = view.at_decision();
    let skip = move |code: &str, context: String, lane: Option<String>| {
        DecisionRow::skip(
            ctx,
            Some(signal.id.clone()),
            signal.symbol.clone(),
            code,
            context,
            portfolio_at,
            true,
            lane,
        )
    };
    let log = |row: DecisionRow| {
        if let Err(e) = deps.lane.log_decision(row) {
            warn!(error = %e, "failed to log decision row");
        }
        SignalVerdict::Skipped
    };

    // Neutral signals carry no tradable side.
    let side = match signal.side.to_position_side() {
        Some(s) => s,
        None => {
            return log(skip(
                audit::SKIP_NEUTRAL_SIGNAL,
                "signal side is neutral".into(),
                None,
            ))
        }
    };

    // ── 2. Ownership ────────────────────────────────────────────────────
    if !deps
        .universe
        .version_owns(&signal.symbol, &signal.engine_version)
    {
        let owner = deps
            .universe
            .ownership
            .get(&signal.symbol)
            .map(|o| o.active_engine_version.clone())
            .unwrap_or_default();
        return log(skip(
            audit::SKIP_WRONG_ENGINE_OWNER,
            format!("owner={owner} signal={}", signal.engine_version),
            None,
        ));
    }

    // ── 3. Lane assignment ──────────────────────────────────────────────
    let mut lane_label: Option<String> = None;
    if let Some(bucket) = deps.bucket {
        let assignment = bucket.classify(&signal.symbol);
        let label = assignment.label().to_string();
        match assignment {
            LaneAssignment::Outside => {
                return log(skip(
                    audit::SKIP_OUTSIDE_PORTFOLIO_BUCKET,
                    "symbol outside CORE/EXPLORE buckets".into(),
                    Some(label),
                ));
            }
            LaneAssignment::Core => {
                if core_open >= bucket.core_slots {
                    return log(skip(
                        audit::SKIP_CORE_SLOTS_FULL,
                        format!("core {core_open}/{}", bucket.core_slots),
                        Some(label),
                    ));
                }
                lane_label = Some(label);
            }
            LaneAssignment::Explore => {
                if explore_open >= bucket.explore_slots {
                    return log(skip(
                        audit::SKIP_EXPLORE_SLOTS_FULL,
                        format!("explore {explore_open}/{}", bucket.explore_slots),
                        Some(label),
                    ));
                }
                lane_label = Some(label);
            }
        }
    }

    // ── 4. Duplicate ticker ─────────────────────────────────────────────
    if open_symbols.iter().any(|s| s == &signal.symbol) {
        return log(skip(
            audit::SKIP_EXISTING_POSITION,
            "ticker already has an open position".into(),
            lane_label,
        ));
    }

    // ── 5. Concurrent cap ───────────────────────────────────────────────
    if view.open_count >= max_concurrent {
        return log(skip(
            audit::SKIP_MAX_POSITIONS,
            format!("open {}/{max_concurrent}", view.open_count),
            lane_label,
        ));
    }

    // ── 6. Reward:risk ──────────────────────────────────────────────────
    let risk_dist = (signal.entry_price - signal.stop_loss).abs();
    let reward_dist = (signal.take_profit_1 - signal.entry_price).abs();
    let rr = if risk_dist > 0.0 {
        reward_dist / risk_dist
    } else {
        f64::INFINITY
    };
    if rr < MIN_RR {
        return log(skip(
            audit::SKIP_RR_TOO_LOW,
            format!("rr={rr:.2} floor={MIN_RR:.2}"),
            lane_label,
        ));
    }

    // ── 7. Distance guard ───────────────────────────────────────────────
    // Absolute backstop first, before any ATR fetch.
    if signal.entry_price > 0.0 {
        let sl_pct = risk_dist / signal.entry_price;
        let tp_pct = reward_dist / signal.entry_price;
        if sl_pct > MAX_SL_DISTANCE_PCT || tp_pct > MAX_TP_DISTANCE_PCT {
            return log(skip(
                audit::SKIP_DISTANCE_UNREALISTIC,
                format!("sl_pct={:.1}% tp_pct={:.1}%", sl_pct * 100.0, tp_pct * 100.0),
                lane_label,
            ));
        }
    }
    match deps
        .market
        .fetch_intraday_ohlc(&signal.symbol, BarInterval::FiveMinute, 5)
        .await
    {
        Ok(bars) => {
            if let Some(atr) = atr_14(&bars) {
                if atr > 0.0 && (risk_dist / atr > MAX_SL_ATR_MULT || reward_dist / atr > MAX_TP_ATR_MULT)
                {
                    return log(skip(
                        audit::SKIP_DISTANCE_UNREALISTIC,
                        format!(
                            "sl={:.1}xATR tp={:.1}xATR",
                            risk_dist / atr,
                            reward_dist / atr
                        ),
                        lane_label,
                    ));
                }
            }
        }
        Err(e) => {
            // Transient data failure: the absolute backstop already ran.
            warn!(symbol = %signal.symbol, error = %e, "ATR fetch failed — skipping ATR guard");
        }
    }

    // ── 8. Freshness ────────────────────────────────────────────────────
    let quote = match deps.quotes.get(&signal.symbol) {
        Some(q) if q.price > 0.0 => q.clone(),
        _ => {
            return log(skip(
                audit::SKIP_QUOTE_UNAVAILABLE,
                "no current quote".into(),
                lane_label,
            ));
        }
    };
    let deviation = (quote.price - signal.entry_price).abs() / signal.entry_price;
    let mut freshness_note = String::new();
    if deviation > STALE_DEVIATION_PCT {
        let touched = match deps
            .market
            .fetch_intraday_ohlc(&signal.symbol, BarInterval::OneMinute, 1)
            .await
        {
            Ok(bars) => bars
                .iter()
                .rev()
                .take(TOUCH_CHECK_BARS)
                .any(|b| b.low <= signal.entry_price && signal.entry_price <= b.high),
            Err(_) => false,
        };
        if !touched {
            return log(skip(
                audit::SKIP_STALE_ENTRY,
                format!("deviation={:.2}%", deviation * 100.0),
                lane_label,
            ));
        }
        freshness_note = " touched_entry_recently=true".to_string();
        info!(
            symbol = %signal.symbol,
            deviation = format!("{:.2}%", deviation * 100.0),
            "stale entry rescued by touch-check"
        );
    }

    // ── 9. Side validity (strict) ───────────────────────────────────────
    let (sl_ok, tp_ok) = match side {
        Side::Long => (
            signal.stop_loss < signal.entry_price,
            signal.take_profit_1 > signal.entry_price,
        ),
        Side::Short => (
            signal.stop_loss > signal.entry_price,
            signal.take_profit_1 < signal.entry_price,
        ),
    };
    if !sl_ok {
        return log(skip(
            audit::SKIP_INVALID_SL,
            format!("side={side} sl={} entry={}", signal.stop_loss, signal.entry_price),
            lane_label,
        ));
    }
    if !tp_ok {
        return log(skip(
            audit::SKIP_INVALID_TP,
            format!("side={side} tp={} entry={}", signal.take_profit_1, signal.entry_price),
            lane_label,
        ));
    }

    // ── 10. Sizing ──────────────────────────────────────────────────────
    let risk_per_share = risk_dist;
    let risk_per_trade = view.equity * deps.knobs.risk_pct * deps.gate.risk_scale;
    let mut shares = (risk_per_trade / risk_per_share).floor();

    // Cap 1: single-position notional.
    let max_notional = view.equity * deps.knobs.max_notional_pct;
    if shares * quote.price > max_notional {
        shares = (max_notional / quote.price).floor();
    }
    // Cap 2: total portfolio allocation.
    let remaining_alloc =
        (view.equity * deps.knobs.max_portfolio_alloc_pct - view.allocated_notional).max(0.0);
    if shares * quote.price > remaining_alloc {
        shares = (remaining_alloc / quote.price).floor();
    }

    let notional = shares * quote.price;
    if shares < 1.0 || notional < deps.knobs.min_notional {
        return log(skip(
            audit::SKIP_CAPACITY,
            format!("shares={shares} notional={notional:.0} floor={}", deps.knobs.min_notional),
            lane_label,
        ));
    }

    // ── 11. Open ────────────────────────────────────────────────────────
    let exec_rps = (quote.price - signal.stop_loss).abs();
    let take_profit_2 = deps.knobs.runner_enabled.then(|| {
        quote.price + side.sign() * deps.knobs.tp2_r_multiple * exec_rps
    });

    let position = Position::open(OpenSpec {
        engine_key: ctx.engine_key.clone(),
        engine_version: ctx.engine_version.clone(),
        run_mode: ctx.run_mode,
        symbol: signal.symbol.clone(),
        side,
        entry_price: quote.price,
        qty: shares,
        stop_loss: signal.stop_loss,
        take_profit_1: signal.take_profit_1,
        take_profit_2,
        signal_id: Some(signal.id.clone()),
        opened_at: ctx.now,
    });

    if let Err(e) = deps.lane.insert_position(&position) {
        // Atomicity: a failed insert must not touch the in-memory counters.
        warn!(
            symbol = %signal.symbol,
            error = %e,
            "position insert failed — counters untouched"
        );
        return log(skip(
            audit::SKIP_EXISTING_POSITION,
            format!("insert failed: {e}"),
            lane_label,
        ));
    }

    view.cash -= notional;
    view.allocated_notional += notional;
    view.open_count += 1;

    info!(
        symbol = %signal.symbol,
        side = %side,
        entry = quote.price,
        shares,
        notional = format!("{notional:.0}"),
        lane = lane_label.as_deref().unwrap_or("-"),
        "position opened"
    );

    let mut row = DecisionRow::open(
        ctx,
        Some(signal.id.clone()),
        signal.symbol.clone(),
        view.at_decision(),
        lane_label.clone(),
    );
    if !freshness_note.is_empty() {
        row.reason_context = Some(freshness_note.trim().to_string());
    }
    if let Err(e) = deps.lane.log_decision(row) {
        warn!(error = %e, "failed to log open decision");
    }

    SignalVerdict::Opened { lane_label }
}
