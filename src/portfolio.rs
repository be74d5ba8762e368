// =============================================================================
// Portfolio Loader — first-principles reconciliation of one instance's book
// =============================================================================
//
// Truth is the ledger: closed trades plus open positions marked to current
// quotes. The persisted snapshot is continuity/audit only and is never
// trusted over the recomputation. Invariants enforced here:
//
//   equity = starting_equity + Σ realized + Σ unrealized
//   cash   = equity - allocated_notional - unrealized
//
// Snapshot drift beyond $1 is a hard alarm: error log plus a warn heartbeat
// row for the external monitor. The engine proceeds on recomputed truth.
// =============================================================================

use std::collections::HashMap;

use tracing::{error, warn};

use crate::audit::PortfolioAtDecision;
use crate::market::Quote;
use crate::store::{HeartbeatLevel, LaneStore, PortfolioRow};

/// Dollar drift between the stored snapshot and the recomputed equity that
/// triggers the alarm.
const DRIFT_ALARM_USD: f64 = 1.0;

/// Reconciled view of one instance's portfolio, rebuilt every tick.
#[derive(Debug, Clone)]
pub struct PortfolioView {
    pub starting_equity: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub equity: f64,
    pub cash: f64,
    pub allocated_notional: f64,
    pub open_count: u32,
    /// |snapshot equity - recomputed equity| when a snapshot existed.
    pub drift_from_snapshot: Option<f64>,
}

impl PortfolioView {
    /// The audit-row embedding of this view.
    pub fn at_decision(&self) -> PortfolioAtDecision {
        PortfolioAtDecision {
            equity: self.equity,
            cash: self.cash,
            allocated_notional: self.allocated_notional,
            open_count: self.open_count,
        }
    }

    /// Snapshot row for writeback at tick end.
    pub fn to_snapshot(&self, lane: &LaneStore) -> PortfolioRow {
        PortfolioRow {
            engine_key: lane.ctx.engine_key.clone(),
            engine_version: lane.ctx.engine_version.clone(),
            run_mode: lane.ctx.run_mode,
            starting_equity: self.starting_equity,
            equity: self.equity,
            allocated_notional: self.allocated_notional,
            cash: self.cash,
            unrealized_pnl: self.unrealized_pnl,
            open_positions: self.open_count,
            updated_at: lane.ctx.now,
        }
    }
}

/// Rebuild the portfolio for the lane's instance from the ledger.
///
/// Dead rows (qty ≤ 0 or CLOSED) left by a crashed tick are pruned first.
/// Positions whose symbol has no quote mark at entry (unrealized 0) with a
/// warning — missing data must never distort equity sharply downward or
/// close anything.
pub fn rebuild(
    lane: &LaneStore,
    starting_equity: f64,
    quotes: &HashMap<String, Quote>,
) -> PortfolioView {
    let pruned = lane.prune_dead_positions();
    if pruned > 0 {
        warn!(instance = %lane.ctx, pruned, "loader pruned dead position rows");
    }

    let positions = lane.open_positions();
    let trades = lane.trades();

    let realized_pnl: f64 = trades.iter().map(|t| t.realized_pnl).sum();

    let mut unrealized_pnl = 0.0;
    let mut allocated_notional = 0.0;
    for pos in &positions {
        allocated_notional += pos.notional_at_entry;
        match quotes.get(&pos.symbol) {
            Some(q) if q.price > 0.0 => unrealized_pnl += pos.unrealized_pnl(q.price),
            _ => {
                warn!(
                    instance = %lane.ctx,
                    symbol = %pos.symbol,
                    "no quote for open position — marking at entry this tick"
                );
            }
        }
    }

    let equity = starting_equity + realized_pnl + unrealized_pnl;
    let cash = equity - allocated_notional - unrealized_pnl;

    let drift_from_snapshot = lane.load_snapshot().map(|snap| (snap.equity - equity).abs());
    if let Some(drift) = drift_from_snapshot {
        if drift > DRIFT_ALARM_USD {
            error!(
                instance = %lane.ctx,
                drift = format!("{drift:.2}"),
                recomputed_equity = format!("{equity:.2}"),
                "snapshot drift exceeds $1 — ledger wins, snapshot discarded"
            );
            lane.store().push_heartbeat(
                HeartbeatLevel::Warn,
                format!("snapshot drift ${drift:.2} on {}", lane.ctx),
            );
        }
    }

    PortfolioView {
        starting_equity,
        realized_pnl,
        unrealized_pnl,
        equity,
        cash,
        allocated_notional,
        open_count: positions.len() as u32,
        drift_from_snapshot,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;

    use crate::position::{OpenSpec, Position};
    use crate::store::{MemoryStore, TradeRecord};
    use crate::types::{EngineContext, ExitReason, RunMode, Side, TradingStyle};

    fn lane(store: Arc<MemoryStore>) -> LaneStore {
        LaneStore::for_context(
            store,
            EngineContext {
                engine_key: "swing".into(),
                engine_version: "v3".into(),
                run_mode: RunMode::Primary,
                style: TradingStyle::Swing,
                now: Utc::now(),
            },
        )
    }

    fn quote(symbol: &str, price: f64) -> (String, Quote) {
        (
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
        )
    }

    fn open_position(lane: &LaneStore, symbol: &str, entry: f64, qty: f64, sl: f64) -> Position {
        let pos = Position::open(OpenSpec {
            engine_key: "swing".into(),
            engine_version: "v3".into(),
            run_mode: RunMode::Primary,
            symbol: symbol.into(),
            side: Side::Long,
            entry_price: entry,
            qty,
            stop_loss: sl,
            take_profit_1: entry + 2.0 * (entry - sl),
            take_profit_2: None,
            signal_id: None,
            opened_at: Utc::now(),
        });
        lane.insert_position(&pos).unwrap();
        pos
    }

    #[test]
    fn equity_and_cash_rebuilt_from_ledger() {
        let store = Arc::new(MemoryStore::new());
        let lane = lane(store);

        let pos = open_position(&lane, "NVDA", 100.0, 250.0, 98.0);
        lane.insert_trade(&TradeRecord {
            id: "t1".into(),
            engine_key: "swing".into(),
            engine_version: "v3".into(),
            run_mode: RunMode::Primary,
            symbol: "AAPL".into(),
            side: Side::Long,
            entry_price: 150.0,
            exit_price: 153.0,
            qty: 100.0,
            exit_reason: ExitReason::TpHit,
            realized_pnl: 300.0,
            realized_r: 1.5,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
            signal_id: None,
            position_id: "old".into(),
        })
        .unwrap();

        let quotes: HashMap<String, Quote> = [quote("NVDA", 102.0)].into_iter().collect();
        let view = rebuild(&lane, 100_000.0, &quotes);

        // unrealized = (102 - 100) * 250 = 500
        assert!((view.realized_pnl - 300.0).abs() < 1e-9);
        assert!((view.unrealized_pnl - 500.0).abs() < 1e-9);
        assert!((view.equity - 100_800.0).abs() < 1e-9);
        // cash = equity - allocated - unrealized = 100800 - 25000 - 500
        assert!((view.cash - 75_300.0).abs() < 1e-9);
        assert!((view.allocated_notional - pos.notional_at_entry).abs() < 1e-9);
        assert_eq!(view.open_count, 1);

        // The two invariants hold by construction.
        assert!(
            (view.equity - (view.starting_equity + view.realized_pnl + view.unrealized_pnl)).abs()
                < 0.01
        );
        assert!(
            (view.cash - (view.equity - view.allocated_notional - view.unrealized_pnl)).abs()
                < 0.01
        );
    }

    #[test]
    fn missing_quote_marks_at_entry() {
        let store = Arc::new(MemoryStore::new());
        let lane = lane(store);
        open_position(&lane, "NVDA", 100.0, 10.0, 98.0);

        let view = rebuild(&lane, 50_000.0, &HashMap::new());
        assert!((view.unrealized_pnl - 0.0).abs() < 1e-9);
        assert!((view.equity - 50_000.0).abs() < 1e-9);
        assert_eq!(view.open_count, 1);
    }

    #[test]
    fn drift_detected_against_stale_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let lane = lane(store.clone());
        open_position(&lane, "NVDA", 100.0, 10.0, 98.0);

        // Persist a snapshot claiming a different equity.
        let mut row = rebuild(&lane, 100_000.0, &HashMap::new()).to_snapshot(&lane);
        row.equity += 50.0;
        lane.save_snapshot(row).unwrap();

        let view = rebuild(&lane, 100_000.0, &HashMap::new());
        assert!(view.drift_from_snapshot.unwrap() > 1.0);
        // The alarm left a warn heartbeat for the monitor.
        assert!(store
            .heartbeats()
            .iter()
            .any(|h| h.level == HeartbeatLevel::Warn && h.message.contains("drift")));
    }

    #[test]
    fn loader_prunes_dead_rows_before_counting() {
        let store = Arc::new(MemoryStore::new());
        let lane = lane(store);
        let mut pos = open_position(&lane, "NVDA", 100.0, 10.0, 98.0);
        pos.qty = 0.0;
        lane.update_position(&pos).unwrap();

        let view = rebuild(&lane, 100_000.0, &HashMap::new());
        assert_eq!(view.open_count, 0);
        assert!((view.allocated_notional - 0.0).abs() < 1e-9);
    }
}
