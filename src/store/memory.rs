// =============================================================================
// In-Memory Store — reference implementation of the partitioned store
// =============================================================================
//
// Thread-safety: every table sits behind `parking_lot::RwLock`. The
// scheduler is single-instance and runs engines sequentially, so writers
// never race; the locks exist for the API surface reading concurrently.
//
// Partitioning: PRIMARY rows live in the live_* tables, SHADOW rows in the
// engine_* tables. Lane handles (`LaneStore`) are constructed per engine
// context and carry their table targets; every raw write re-checks the
// (run_mode, table) pairing through `guard::check_write`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::audit::DecisionRow;
use crate::position::{Position, PositionStatus};
use crate::signals_feed::{matches_query, Signal, SignalQuery, SignalSource};
use crate::store::guard::{check_write, Table};
use crate::store::{
    AllowlistEntry, ContextDecision, ExploreCursorRow, FocusEntry, HeartbeatLevel, HeartbeatRow,
    InstanceKey, OwnershipRow, PortfolioRow, PromotionLogRow, ScoreRow, TradeRecord,
};
use crate::types::{EngineContext, RunMode};

// =============================================================================
// MemoryStore
// =============================================================================

/// All engine tables, in memory.
#[derive(Default)]
pub struct MemoryStore {
    // ── PRIMARY partition ───────────────────────────────────────────────
    live_positions: RwLock<Vec<Position>>,
    live_trades: RwLock<Vec<TradeRecord>>,
    live_portfolios: RwLock<HashMap<InstanceKey, PortfolioRow>>,
    live_decisions: RwLock<Vec<DecisionRow>>,

    // ── SHADOW partition ────────────────────────────────────────────────
    engine_positions: RwLock<Vec<Position>>,
    engine_trades: RwLock<Vec<TradeRecord>>,
    engine_portfolios: RwLock<HashMap<InstanceKey, PortfolioRow>>,
    shared_decisions: RwLock<Vec<DecisionRow>>,

    // ── Collaborator-owned tables (read-mostly, unpartitioned) ──────────
    signals: RwLock<Vec<Signal>>,
    ownership: RwLock<HashMap<String, OwnershipRow>>,
    focus: RwLock<Vec<FocusEntry>>,
    allowlist: RwLock<Vec<AllowlistEntry>>,
    explore_cursor: RwLock<ExploreCursorRow>,
    context_decision: RwLock<Option<ContextDecision>>,

    // ── Analytics & ops ─────────────────────────────────────────────────
    score_history: RwLock<Vec<ScoreRow>>,
    promotion_log: RwLock<Vec<PromotionLogRow>>,
    heartbeats: RwLock<Vec<HeartbeatRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Raw partitioned access (guard-checked)
    // -------------------------------------------------------------------------

    fn positions_table(&self, table: Table) -> &RwLock<Vec<Position>> {
        match table {
            Table::LivePositions => &self.live_positions,
            Table::EnginePositions => &self.engine_positions,
            other => unreachable!("{} is not a positions table", other.name()),
        }
    }

    fn trades_table(&self, table: Table) -> &RwLock<Vec<TradeRecord>> {
        match table {
            Table::LiveTrades => &self.live_trades,
            Table::EngineTrades => &self.engine_trades,
            other => unreachable!("{} is not a trades table", other.name()),
        }
    }

    fn portfolios_table(&self, table: Table) -> &RwLock<HashMap<InstanceKey, PortfolioRow>> {
        match table {
            Table::LivePortfolioState => &self.live_portfolios,
            Table::EnginePortfolios => &self.engine_portfolios,
            other => unreachable!("{} is not a portfolios table", other.name()),
        }
    }

    fn decisions_table(&self, table: Table) -> &RwLock<Vec<DecisionRow>> {
        match table {
            Table::LiveSignalDecisionLog => &self.live_decisions,
            Table::SharedDecisionLog => &self.shared_decisions,
            other => unreachable!("{} is not a decision table", other.name()),
        }
    }

    // -------------------------------------------------------------------------
    // Collaborator tables
    // -------------------------------------------------------------------------

    pub fn seed_signals(&self, signals: Vec<Signal>) {
        self.signals.write().extend(signals);
    }

    pub fn set_ownership(&self, row: OwnershipRow) {
        self.ownership.write().insert(row.symbol.clone(), row);
    }

    pub fn ownership_map(&self) -> HashMap<String, OwnershipRow> {
        self.ownership.read().clone()
    }

    pub fn set_focus(&self, entries: Vec<FocusEntry>) {
        *self.focus.write() = entries;
    }

    pub fn focus_entries(&self) -> Vec<FocusEntry> {
        self.focus.read().clone()
    }

    pub fn set_allowlist(&self, entries: Vec<AllowlistEntry>) {
        *self.allowlist.write() = entries;
    }

    pub fn allowlist_entries(&self) -> Vec<AllowlistEntry> {
        self.allowlist.read().clone()
    }

    pub fn explore_cursor(&self) -> ExploreCursorRow {
        self.explore_cursor.read().clone()
    }

    pub fn save_explore_cursor(&self, last_symbol: Option<String>) {
        *self.explore_cursor.write() = ExploreCursorRow {
            last_symbol,
            updated_at: Some(Utc::now()),
        };
    }

    pub fn set_context_decision(&self, decision: Option<ContextDecision>) {
        *self.context_decision.write() = decision;
    }

    pub fn context_decision(&self) -> Option<ContextDecision> {
        self.context_decision.read().clone()
    }

    // -------------------------------------------------------------------------
    // Analytics & ops tables
    // -------------------------------------------------------------------------

    pub fn push_score_row(&self, row: ScoreRow) {
        self.score_history.write().push(row);
    }

    pub fn score_history(&self) -> Vec<ScoreRow> {
        self.score_history.read().clone()
    }

    pub fn push_promotion_log(&self, row: PromotionLogRow) {
        self.promotion_log.write().push(row);
    }

    pub fn promotion_log(&self) -> Vec<PromotionLogRow> {
        self.promotion_log.read().clone()
    }

    pub fn push_heartbeat(&self, level: HeartbeatLevel, message: impl Into<String>) {
        self.heartbeats.write().push(HeartbeatRow {
            level,
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn heartbeats(&self) -> Vec<HeartbeatRow> {
        self.heartbeats.read().clone()
    }

    // -------------------------------------------------------------------------
    // Cross-partition reads (analytics / allocation / UI — never writes)
    // -------------------------------------------------------------------------

    /// All SHADOW trades closed at or after `cutoff`.
    pub fn shadow_trades_since(&self, cutoff: chrono::DateTime<Utc>) -> Vec<TradeRecord> {
        self.engine_trades
            .read()
            .iter()
            .filter(|t| t.closed_at >= cutoff)
            .cloned()
            .collect()
    }

    /// Whether the live lane currently holds an open position on `symbol`.
    pub fn live_position_open_on(&self, symbol: &str) -> bool {
        self.live_positions
            .read()
            .iter()
            .any(|p| p.symbol == symbol && p.status == PositionStatus::Open)
    }

    /// Latest live snapshot, by `updated_at`. Used by the quick-profit shadow
    /// to synchronise its starting equity with the live SWING book.
    pub fn latest_live_snapshot(&self) -> Option<PortfolioRow> {
        self.live_portfolios
            .read()
            .values()
            .max_by_key(|row| row.updated_at)
            .cloned()
    }

    /// Open positions across both partitions (UI snapshot).
    pub fn all_open_positions(&self) -> Vec<Position> {
        let mut out: Vec<Position> = self
            .live_positions
            .read()
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .cloned()
            .collect();
        out.extend(
            self.engine_positions
                .read()
                .iter()
                .filter(|p| p.status == PositionStatus::Open)
                .cloned(),
        );
        out
    }

    /// Recent decision rows across both logs (UI snapshot), newest last.
    pub fn recent_decisions(&self, limit: usize) -> Vec<DecisionRow> {
        let mut rows: Vec<DecisionRow> = self.live_decisions.read().clone();
        rows.extend(self.shared_decisions.read().iter().cloned());
        rows.sort_by_key(|r| r.created_at);
        if rows.len() > limit {
            rows.split_off(rows.len() - limit)
        } else {
            rows
        }
    }
}

#[async_trait]
impl SignalSource for MemoryStore {
    async fn fresh_signals(&self, query: &SignalQuery) -> Result<Vec<Signal>> {
        let mut out: Vec<Signal> = self
            .signals
            .read()
            .iter()
            .filter(|s| matches_query(s, query))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.created_at);
        Ok(out)
    }
}

// =============================================================================
// LaneStore — run-mode scoped handle
// =============================================================================

/// Write handle for one engine context. The table targets are fixed at
/// construction from the context's run mode; the guard re-checks every write.
pub struct LaneStore {
    store: Arc<MemoryStore>,
    pub ctx: EngineContext,
    positions_t: Table,
    trades_t: Table,
    portfolios_t: Table,
    decisions_t: Table,
}

impl LaneStore {
    pub fn for_context(store: Arc<MemoryStore>, ctx: EngineContext) -> Self {
        let (positions_t, trades_t, portfolios_t, decisions_t) = match ctx.run_mode {
            RunMode::Primary => (
                Table::LivePositions,
                Table::LiveTrades,
                Table::LivePortfolioState,
                Table::LiveSignalDecisionLog,
            ),
            RunMode::Shadow => (
                Table::EnginePositions,
                Table::EngineTrades,
                Table::EnginePortfolios,
                Table::SharedDecisionLog,
            ),
        };
        Self {
            store,
            ctx,
            positions_t,
            trades_t,
            portfolios_t,
            decisions_t,
        }
    }

    /// Test-only: build a handle with deliberately wrong table targets so the
    /// guard's trip path can be exercised.
    #[cfg(test)]
    pub fn with_tables(
        store: Arc<MemoryStore>,
        ctx: EngineContext,
        positions_t: Table,
        trades_t: Table,
        portfolios_t: Table,
        decisions_t: Table,
    ) -> Self {
        Self {
            store,
            ctx,
            positions_t,
            trades_t,
            portfolios_t,
            decisions_t,
        }
    }

    fn instance_key(&self) -> InstanceKey {
        (self.ctx.engine_key.clone(), self.ctx.engine_version.clone())
    }

    fn owns(&self, p: &Position) -> bool {
        p.engine_key == self.ctx.engine_key
            && p.engine_version == self.ctx.engine_version
            && p.run_mode == self.ctx.run_mode
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// Open positions for this instance, ordered by id for stable iteration.
    pub fn open_positions(&self) -> Vec<Position> {
        let table = self.store.positions_table(self.positions_t);
        let mut out: Vec<Position> = table
            .read()
            .iter()
            .filter(|p| self.owns(p) && p.status == PositionStatus::Open)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn insert_position(&self, pos: &Position) -> Result<()> {
        check_write(self.ctx.run_mode, self.positions_t)?;
        if pos.run_mode != self.ctx.run_mode {
            bail!(
                "position {} carries {} but the writing context is {}",
                pos.id,
                pos.run_mode,
                self.ctx.run_mode
            );
        }
        let table = self.store.positions_table(self.positions_t);
        let mut rows = table.write();
        if rows
            .iter()
            .any(|p| self.owns(p) && p.symbol == pos.symbol && p.status == PositionStatus::Open)
        {
            bail!(
                "instance {} already holds an open position on {}",
                self.ctx,
                pos.symbol
            );
        }
        rows.push(pos.clone());
        Ok(())
    }

    /// Replace the stored row for `pos.id` with the given state.
    pub fn update_position(&self, pos: &Position) -> Result<()> {
        check_write(self.ctx.run_mode, self.positions_t)?;
        let table = self.store.positions_table(self.positions_t);
        let mut rows = table.write();
        match rows.iter_mut().find(|p| p.id == pos.id) {
            Some(slot) => {
                *slot = pos.clone();
                Ok(())
            }
            None => bail!("position {} not found for update", pos.id),
        }
    }

    /// Remove a fully-closed position. Status-checked so a crashed tick that
    /// already deleted the row is a no-op on re-run.
    pub fn delete_position(&self, id: &str) -> Result<bool> {
        check_write(self.ctx.run_mode, self.positions_t)?;
        let table = self.store.positions_table(self.positions_t);
        let mut rows = table.write();
        let before = rows.len();
        rows.retain(|p| p.id != id);
        Ok(rows.len() < before)
    }

    /// Drop rows a crash left behind: qty ≤ 0 or already CLOSED.
    pub fn prune_dead_positions(&self) -> usize {
        let table = self.store.positions_table(self.positions_t);
        let mut rows = table.write();
        let before = rows.len();
        rows.retain(|p| {
            let dead = self.owns(p) && (p.qty <= 0.0 || p.status == PositionStatus::Closed);
            if dead {
                info!(id = %p.id, symbol = %p.symbol, qty = p.qty, "pruning dead position row");
            }
            !dead
        });
        before - rows.len()
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    pub fn insert_trade(&self, trade: &TradeRecord) -> Result<()> {
        check_write(self.ctx.run_mode, self.trades_t)?;
        let table = self.store.trades_table(self.trades_t);
        let mut rows = table.write();
        // Idempotency: a re-run tick may retry an insert that already landed.
        if rows.iter().any(|t| {
            t.position_id == trade.position_id
                && t.closed_at == trade.closed_at
                && t.exit_reason == trade.exit_reason
        }) {
            warn!(
                position_id = %trade.position_id,
                reason = %trade.exit_reason,
                "duplicate trade insert skipped"
            );
            return Ok(());
        }
        rows.push(trade.clone());
        Ok(())
    }

    /// All closed trades for this instance since inception.
    pub fn trades(&self) -> Vec<TradeRecord> {
        let table = self.store.trades_table(self.trades_t);
        table
            .read()
            .iter()
            .filter(|t| {
                t.engine_key == self.ctx.engine_key
                    && t.engine_version == self.ctx.engine_version
                    && t.run_mode == self.ctx.run_mode
            })
            .cloned()
            .collect()
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub fn load_snapshot(&self) -> Option<PortfolioRow> {
        let table = self.store.portfolios_table(self.portfolios_t);
        table.read().get(&self.instance_key()).cloned()
    }

    pub fn save_snapshot(&self, row: PortfolioRow) -> Result<()> {
        check_write(self.ctx.run_mode, self.portfolios_t)?;
        if row.run_mode != self.ctx.run_mode {
            bail!(
                "snapshot for {} written from a {} context",
                row.run_mode,
                self.ctx.run_mode
            );
        }
        let table = self.store.portfolios_table(self.portfolios_t);
        table.write().insert(self.instance_key(), row);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Decisions
    // -------------------------------------------------------------------------

    pub fn log_decision(&self, row: DecisionRow) -> Result<()> {
        check_write(self.ctx.run_mode, self.decisions_t)?;
        debug!(
            symbol = %row.symbol,
            decision = %row.decision,
            context = row.reason_context.as_deref().unwrap_or(""),
            "decision logged"
        );
        let table = self.store.decisions_table(self.decisions_t);
        table.write().push(row);
        Ok(())
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}
