// =============================================================================
// Continuation Score — will the move keep going?
// =============================================================================
//
// A bounded [0, 1] blend of two reads over the recent bars:
//
//   * momentum  — rate of change of the closes, signed in the direction of
//                 the position (a fading long and a fading short both score
//                 low);
//   * expansion — Bollinger band width of the late window vs the early
//                 window; contracting volatility means the move is stalling.
//
// score = 0.6 * momentum + 0.4 * expansion
//
// Consumers act on LOW scores (recycle < 0.25, pre-close time exit < 0.3,
// overnight hygiene < 0.4), so scarce data returns the neutral 0.5 — the
// engine never exits a position because bars were missing.
// =============================================================================

use crate::indicators::bollinger::calculate_bollinger;
use crate::indicators::roc::current_roc;
use crate::market::Bar;
use crate::types::Side;

/// Minimum bars before the score leaves neutral.
const MIN_BARS: usize = 10;

/// ROC percent that maps to full momentum confidence.
const ROC_FULL_SCALE_PCT: f64 = 1.0;

/// Neutral verdict used when evidence is insufficient.
pub const NEUTRAL: f64 = 0.5;

/// Score the likelihood that the position's move continues, from the last N
/// bars. Symmetric for LONG and SHORT.
pub fn continuation_score(bars: &[Bar], side: Side) -> f64 {
    if bars.len() < MIN_BARS {
        return NEUTRAL;
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    // ── Momentum: directional ROC, clamped to [0, 1] ────────────────────
    let roc_period = (closes.len() - 1).min(10);
    let momentum = match current_roc(&closes, roc_period) {
        Some(roc_pct) => {
            let signed = side.sign() * roc_pct;
            (0.5 + signed / (2.0 * ROC_FULL_SCALE_PCT)).clamp(0.0, 1.0)
        }
        None => NEUTRAL,
    };

    // ── Expansion: late-window band width vs early-window band width ────
    let half = closes.len() / 2;
    let (early, late) = closes.split_at(half);
    let expansion = match (
        calculate_bollinger(early, early.len(), 2.0),
        calculate_bollinger(late, late.len(), 2.0),
    ) {
        (Some(e), Some(l)) if e.width > f64::EPSILON => (0.5 * l.width / e.width).clamp(0.0, 1.0),
        // Degenerate early window: no compression evidence either way.
        _ => NEUTRAL,
    };

    (0.6 * momentum + 0.4 * expansion).clamp(0.0, 1.0)
}
