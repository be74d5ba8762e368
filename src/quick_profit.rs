// =============================================================================
// Quick-Profit Shadow Engine — dollar-P&L state machine
// =============================================================================
//
// Same shape as the generic engine but managed in unrealized dollars, not
// R-multiples:
//
//   * breakeven arms at +$150 unrealized; the stop moves to entry plus a $5
//     total-P&L buffer (buffer / shares in price terms, mirrored for SHORT);
//   * partial profit at +$250 closes 50% and seeds a trailing stop at
//     price ∓ $120 / remaining shares;
//   * the trail ratchets on new peaks and exits on touch (TRAIL_STOP);
//   * a plain stop-loss exit (STOP_LOSS) when price crosses the level.
//
// All writes go to the SHADOW partition. The portfolio's starting equity
// synchronises with the live SWING snapshot when one exists (see the
// scheduler).
// =============================================================================

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::QuickProfitKnobs;
use crate::manager::{apply_outcome, ExitEvent, ManageOutcome};
use crate::market::MarketData;
use crate::position::{ManagementState, Position, PositionStatus};
use crate::store::LaneStore;
use crate::types::{ExitReason, Side};

/// Advance one quick-profit position against the current price.
///
/// Pure and deterministic, like the generic manager: same position, price,
/// and knobs always produce the same outcome.
pub fn manage_quick_profit(
    position: &Position,
    current_price: f64,
    knobs: &QuickProfitKnobs,
    now: DateTime<Utc>,
) -> ManageOutcome {
    let mut pos = position.clone();
    let mut exits: Vec<ExitEvent> = Vec::new();

    if current_price <= 0.0 {
        return ManageOutcome {
            exits,
            position: Some(pos),
        };
    }

    let mut full_close = |pos: &mut Position, reason: ExitReason, price: f64| {
        exits.push(ExitEvent {
            reason,
            price,
            qty: pos.qty,
        });
        pos.qty = 0.0;
        pos.status = PositionStatus::Closed;
        info!(
            id = %pos.id,
            symbol = %pos.symbol,
            reason = %reason,
            price,
            "quick-profit position closed"
        );
    };

    // ── 1. Stop / trail exit from last tick's levels ────────────────────
    let eff_stop = pos.effective_stop();
    let stop_touched = match pos.side {
        Side::Long => current_price <= eff_stop,
        Side::Short => current_price >= eff_stop,
    };
    if stop_touched {
        let trailing_binding = match (pos.side, pos.trailing_stop_price) {
            (Side::Long, Some(t)) => t >= pos.stop_loss,
            (Side::Short, Some(t)) => t <= pos.stop_loss,
            (_, None) => false,
        };
        let reason = if trailing_binding {
            ExitReason::TrailStop
        } else {
            ExitReason::StopLoss
        };
        full_close(&mut pos, reason, eff_stop);
        return ManageOutcome {
            exits,
            position: None,
        };
    }

    // ── 2. Mark the price and the dollar peak ───────────────────────────
    pos.observe_range(current_price, current_price);
    let unrealized = pos.unrealized_pnl(current_price);
    if unrealized > pos.trail_peak_pnl {
        pos.trail_peak_pnl = unrealized;
    }

    // ── 3. Breakeven arm at +$150 ───────────────────────────────────────
    if matches!(pos.state, ManagementState::Running) && unrealized >= knobs.be_trigger_usd {
        let buffer_per_share = if pos.qty > 0.0 {
            knobs.be_buffer_usd / pos.qty
        } else {
            0.0
        };
        if pos.arm_breakeven(buffer_per_share, now).is_ok() {
            debug!(
                id = %pos.id,
                stop = pos.stop_loss,
                unrealized = format!("{unrealized:.0}"),
                "breakeven armed"
            );
        }
    }

    // ── 4. Partial profit at +$250, seeding the trail ───────────────────
    if !pos.partial_taken && unrealized >= knobs.partial_trigger_usd {
        let close_qty = pos.qty * knobs.partial_fraction;
        if close_qty > 0.0 && close_qty < pos.qty {
            exits.push(ExitEvent {
                reason: ExitReason::PartialProfit,
                price: current_price,
                qty: close_qty,
            });
            if let Err(e) = pos.apply_partial_close(close_qty) {
                warn!(id = %pos.id, error = %e, "quick-profit partial failed");
            } else {
                let trail = current_price
                    - pos.side.sign() * (knobs.trail_distance_usd / pos.qty);
                pos.tighten_trailing(trail);
                info!(
                    id = %pos.id,
                    close_qty,
                    remaining = pos.qty,
                    trail,
                    "partial profit banked, trail seeded"
                );
            }
        }
    }

    // ── 5. Trail ratchet on new peaks ───────────────────────────────────
    if pos.trailing_active && pos.qty > 0.0 {
        let candidate = pos.peak_price() - pos.side.sign() * (knobs.trail_distance_usd / pos.qty);
        pos.tighten_trailing(candidate);
    }

    ManageOutcome {
        exits,
        position: Some(pos),
    }
}

/// Counters from one quick-profit pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct QuickProfitPassStats {
    pub managed: usize,
    pub exits: usize,
    pub errors: usize,
}

/// Manage every open quick-profit position against fresh quotes. Only a
/// run-mode guard violation propagates; ordinary errors leave the position
/// OPEN for the next tick.
pub async fn run_quick_profit_pass(
    lane: &LaneStore,
    market: &dyn MarketData,
    knobs: &QuickProfitKnobs,
    stamp_signal_outcomes: bool,
) -> anyhow::Result<QuickProfitPassStats> {
    let mut stats = QuickProfitPassStats::default();

    for pos in lane.open_positions() {
        let quotes = match market.fetch_bulk_quotes(std::slice::from_ref(&pos.symbol)).await {
            Ok(q) => q,
            Err(e) => {
                warn!(
                    symbol = %pos.symbol,
                    error = %e,
                    "quote fetch failed — quick-profit position left OPEN"
                );
                stats.errors += 1;
                continue;
            }
        };
        let Some(quote) = quotes.get(&pos.symbol) else {
            warn!(symbol = %pos.symbol, "no quote — quick-profit position left OPEN");
            stats.errors += 1;
            continue;
        };

        let outcome = manage_quick_profit(&pos, quote.price, knobs, lane.ctx.now);
        match apply_outcome(lane, &pos, outcome, stamp_signal_outcomes) {
            Ok(exit_count) => {
                stats.managed += 1;
                stats.exits += exit_count;
            }
            Err(e) => {
                if e.downcast_ref::<crate::store::guard::GuardViolation>().is_some() {
                    return Err(e);
                }
                warn!(id = %pos.id, error = %e, "quick-profit writeback failed");
                stats.errors += 1;
            }
        }
    }

    Ok(stats)
}
