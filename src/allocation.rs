// =============================================================================
// Allocation Scoring — daily per-(symbol, engine) promotion pass
// =============================================================================
//
// Reads SHADOW closed trades over the last 60 days, computes 30- and 60-day
// metrics per (symbol, engine_key, engine_version), persists every score
// row, and proposes ownership promotions:
//
//   score = expectancy_r * 10 * stability - 0.5 * max_drawdown_r
//   stability = 1 / (1 + stddev(realized_r))        (recorded on every row)
//
// Eligibility: trades >= 20, max drawdown <= 5 R, expectancy >= -0.2 R.
// A promotion fires only when the symbol is allowlisted, the candidate beats
// the owner by 20% on score AND 0.1 R on expectancy, the owner's lock has
// expired, and no live position is open on the symbol. Successful promotions
// stamp a 45-day ownership lock. Everything else is logged as a proposal
// with its rejection reason; PENDING_OPEN_POSITION marks proposals whose
// only blocker is a live position.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::store::{MemoryStore, OwnershipRow, PromotionLogRow, ScoreRow, TradeRecord};

// =============================================================================
// Tunables
// =============================================================================

/// Trade history window read from the store.
const HISTORY_DAYS: i64 = 60;
/// Metric windows computed and persisted.
const WINDOWS_DAYS: [i64; 2] = [30, 60];
/// Window used for promotion scoring (the longer one: more evidence).
const SCORING_WINDOW_DAYS: u32 = 60;

/// Eligibility gates.
const MIN_TRADES: u32 = 20;
const MAX_DRAWDOWN_R: f64 = 5.0;
const MIN_EXPECTANCY_R: f64 = -0.2;

/// Promotion gates.
const SCORE_RATIO_MIN: f64 = 1.2;
const EXPECTANCY_MARGIN_MIN: f64 = 0.1;
/// Sticky-ownership cooldown stamped on every promotion.
const OWNERSHIP_LOCK_DAYS: i64 = 45;

/// Exact dispersion formula recorded on every score row.
const STABILITY_FORMULA: &str = "stability = 1 / (1 + stddev(realized_r))";

// =============================================================================
// Metrics
// =============================================================================

/// Per-(symbol, engine, window) performance metrics.
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    pub trade_count: u32,
    pub expectancy_r: f64,
    pub max_drawdown_r: f64,
    pub stability: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub score: f64,
}

/// Compute metrics over one window of trades (any order; sorted internally).
pub fn compute_metrics(trades: &[&TradeRecord]) -> EngineMetrics {
    let n = trades.len() as f64;
    if trades.is_empty() {
        return EngineMetrics {
            trade_count: 0,
            expectancy_r: 0.0,
            max_drawdown_r: 0.0,
            stability: 1.0,
            win_rate: 0.0,
            profit_factor: 0.0,
            score: 0.0,
        };
    }

    let mut ordered: Vec<&TradeRecord> = trades.to_vec();
    ordered.sort_by_key(|t| t.closed_at);

    let rs: Vec<f64> = ordered.iter().map(|t| t.realized_r).collect();
    let expectancy_r = rs.iter().sum::<f64>() / n;

    // Max drawdown of the cumulative R curve.
    let mut cum = 0.0;
    let mut peak = 0.0;
    let mut max_dd = 0.0;
    for r in &rs {
        cum += r;
        if cum > peak {
            peak = cum;
        }
        let dd = peak - cum;
        if dd > max_dd {
            max_dd = dd;
        }
    }

    // Population stddev of per-trade R.
    let variance = rs.iter().map(|r| (r - expectancy_r).powi(2)).sum::<f64>() / n;
    let stability = 1.0 / (1.0 + variance.sqrt());

    let wins = rs.iter().filter(|r| **r > 0.0).count() as f64;
    let win_rate = wins / n;

    let gross_win: f64 = rs.iter().filter(|r| **r > 0.0).sum();
    let gross_loss: f64 = rs.iter().filter(|r| **r < 0.0).map(|r| r.abs()).sum();
    let profit_factor = if gross_loss > 0.0 {
        gross_win / gross_loss
    } else if gross_win > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    // Monotone in expectancy and stability, penalised by drawdown.
    let score = expectancy_r * 10.0 * stability - 0.5 * max_dd;

    EngineMetrics {
        trade_count: rs.len() as u32,
        expectancy_r,
        max_drawdown_r: max_dd,
        stability,
        win_rate,
        profit_factor,
        score,
    }
}

fn eligible(m: &EngineMetrics) -> bool {
    m.trade_count >= MIN_TRADES
        && m.max_drawdown_r <= MAX_DRAWDOWN_R
        && m.expectancy_r >= MIN_EXPECTANCY_R
}

// =============================================================================
// The pass
// =============================================================================

/// Outcome summary of one allocation pass.
#[derive(Debug, Default)]
pub struct AllocationReport {
    pub score_rows: usize,
    pub promotions: usize,
    pub proposals: usize,
}

/// Run the daily allocation pass. Persists every score row and promotion
/// proposal; promotions mutate the ownership table.
pub fn run_allocation_pass(store: &MemoryStore, now: DateTime<Utc>) -> AllocationReport {
    let mut report = AllocationReport::default();

    let cutoff = now - Duration::days(HISTORY_DAYS);
    let trades = store.shadow_trades_since(cutoff);

    // Group by (symbol, engine_key, engine_version).
    let mut groups: HashMap<(String, String, String), Vec<&TradeRecord>> = HashMap::new();
    for t in &trades {
        groups
            .entry((t.symbol.clone(), t.engine_key.clone(), t.engine_version.clone()))
            .or_default()
            .push(t);
    }

    // Scoring-window metrics per group, persisted per window.
    let mut scoring: HashMap<(String, String, String), EngineMetrics> = HashMap::new();
    let mut keys: Vec<_> = groups.keys().cloned().collect();
    keys.sort(); // deterministic row order
    for key in &keys {
        let group = &groups[key];
        for window_days in WINDOWS_DAYS {
            let window_cutoff = now - Duration::days(window_days);
            let window_trades: Vec<&TradeRecord> = group
                .iter()
                .copied()
                .filter(|t| t.closed_at >= window_cutoff)
                .collect();
            let metrics = compute_metrics(&window_trades);
            store.push_score_row(ScoreRow {
                symbol: key.0.clone(),
                engine_key: key.1.clone(),
                engine_version: key.2.clone(),
                window_days: window_days as u32,
                trade_count: metrics.trade_count,
                expectancy_r: metrics.expectancy_r,
                max_drawdown_r: metrics.max_drawdown_r,
                stability: metrics.stability,
                win_rate: metrics.win_rate,
                profit_factor: metrics.profit_factor,
                score: metrics.score,
                stability_formula: STABILITY_FORMULA.to_string(),
                computed_at: now,
            });
            report.score_rows += 1;
            if window_days as u32 == SCORING_WINDOW_DAYS {
                scoring.insert(key.clone(), metrics);
            }
        }
    }

    // Per symbol: pick the best eligible non-owner candidate.
    let ownership = store.ownership_map();
    let allowlisted: std::collections::HashSet<String> = store
        .allowlist_entries()
        .into_iter()
        .filter(|a| a.enabled)
        .map(|a| a.symbol)
        .collect();

    let mut symbols: Vec<String> = scoring.keys().map(|k| k.0.clone()).collect();
    symbols.sort();
    symbols.dedup();

    for symbol in symbols {
        let owner = ownership.get(&symbol);
        let owner_metrics = owner.and_then(|o| {
            scoring.get(&(
                symbol.clone(),
                o.active_engine_key.clone(),
                o.active_engine_version.clone(),
            ))
        });

        let candidate = scoring
            .iter()
            .filter(|((s, k, v), m)| {
                s == &symbol
                    && eligible(m)
                    && owner.map_or(true, |o| {
                        !(o.active_engine_key == *k && o.active_engine_version == *v)
                    })
            })
            .max_by(|a, b| {
                a.1.score
                    .partial_cmp(&b.1.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.0.cmp(a.0))
            });

        let Some(((_, cand_key, cand_version), cand_metrics)) = candidate else {
            continue;
        };

        let log_proposal = |outcome: &str, detail: Option<String>| PromotionLogRow {
            symbol: symbol.clone(),
            candidate_key: cand_key.clone(),
            candidate_version: cand_version.clone(),
            owner_key: owner.map(|o| o.active_engine_key.clone()),
            owner_version: owner.map(|o| o.active_engine_version.clone()),
            outcome: outcome.to_string(),
            detail,
            at: now,
        };

        // ── Promotion gates, cheapest first ─────────────────────────────
        if !allowlisted.contains(&symbol) {
            store.push_promotion_log(log_proposal("NOT_ALLOWLISTED", None));
            report.proposals += 1;
            continue;
        }

        let owner_score = owner_metrics.map(|m| m.score).unwrap_or(0.0);
        let owner_expectancy = owner_metrics.map(|m| m.expectancy_r).unwrap_or(0.0);

        if cand_metrics.score < SCORE_RATIO_MIN * owner_score {
            store.push_promotion_log(log_proposal(
                "SCORE_BELOW_THRESHOLD",
                Some(format!(
                    "candidate={:.3} owner={:.3} ratio_min={SCORE_RATIO_MIN}",
                    cand_metrics.score, owner_score
                )),
            ));
            report.proposals += 1;
            continue;
        }
        if cand_metrics.expectancy_r - owner_expectancy < EXPECTANCY_MARGIN_MIN {
            store.push_promotion_log(log_proposal(
                "EXPECTANCY_MARGIN",
                Some(format!(
                    "candidate={:.3} owner={:.3} margin_min={EXPECTANCY_MARGIN_MIN}",
                    cand_metrics.expectancy_r, owner_expectancy
                )),
            ));
            report.proposals += 1;
            continue;
        }
        if let Some(o) = owner {
            if o.locked_until.map_or(false, |lock| lock >= now) {
                store.push_promotion_log(log_proposal(
                    "OWNER_LOCKED",
                    o.locked_until.map(|l| format!("locked_until={l}")),
                ));
                report.proposals += 1;
                continue;
            }
        }
        // Last gate: with everything else passing, a live position is the
        // only blocker — queue for retry.
        if store.live_position_open_on(&symbol) {
            store.push_promotion_log(log_proposal("PENDING_OPEN_POSITION", None));
            report.proposals += 1;
            continue;
        }

        // ── Promote ─────────────────────────────────────────────────────
        store.set_ownership(OwnershipRow {
            symbol: symbol.clone(),
            active_engine_key: cand_key.clone(),
            active_engine_version: cand_version.clone(),
            last_score: cand_metrics.score,
            last_promotion_at: Some(now),
            locked_until: Some(now + Duration::days(OWNERSHIP_LOCK_DAYS)),
        });
        store.push_promotion_log(log_proposal(
            "PROMOTED",
            Some(format!("score={:.3}", cand_metrics.score)),
        ));
        report.promotions += 1;
        info!(
            symbol = %symbol,
            engine = %format!("{cand_key}@{cand_version}"),
            score = format!("{:.3}", cand_metrics.score),
            "ownership promoted"
        );
    }

    debug!(
        score_rows = report.score_rows,
        promotions = report.promotions,
        proposals = report.proposals,
        "allocation pass complete"
    );
    report
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    use crate::store::AllowlistEntry;
    use crate::types::{ExitReason, RunMode, Side};

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 21, 0, 0).unwrap()
    }

    fn trade(
        symbol: &str,
        key: &str,
        version: &str,
        realized_r: f64,
        days_ago: i64,
        now: DateTime<Utc>,
    ) -> TradeRecord {
        TradeRecord {
            id: Uuid::new_v4().to_string(),
            engine_key: key.into(),
            engine_version: version.into(),
            run_mode: RunMode::Shadow,
            symbol: symbol.into(),
            side: Side::Long,
            entry_price: 100.0,
            exit_price: 100.0 + realized_r * 2.0,
            qty: 10.0,
            exit_reason: ExitReason::TpHit,
            realized_pnl: realized_r * 20.0,
            realized_r,
            opened_at: now - Duration::days(days_ago) - Duration::hours(2),
            closed_at: now - Duration::days(days_ago),
            signal_id: None,
            position_id: Uuid::new_v4().to_string(),
        }
    }

    fn shadow_lane(
        store: &std::sync::Arc<MemoryStore>,
        key: &str,
        version: &str,
        now: DateTime<Utc>,
    ) -> crate::store::LaneStore {
        use crate::types::{EngineContext, TradingStyle};
        crate::store::LaneStore::for_context(
            store.clone(),
            EngineContext {
                engine_key: key.into(),
                engine_version: version.into(),
                run_mode: RunMode::Shadow,
                style: TradingStyle::Swing,
                now,
            },
        )
    }

    /// Seed `n` shadow trades cycling over the given R values, spread inside
    /// the last ~25 days so both windows include them.
    fn seed_trades(
        store: &std::sync::Arc<MemoryStore>,
        symbol: &str,
        key: &str,
        version: &str,
        rs: &[f64],
        n: usize,
        now: DateTime<Utc>,
    ) {
        let lane = shadow_lane(store, key, version, now);
        for i in 0..n {
            let r = rs[i % rs.len()];
            let t = trade(symbol, key, version, r, (i % 25) as i64 + 1, now);
            lane.insert_trade(&t).unwrap();
        }
    }

    fn allow(store: &MemoryStore, symbol: &str) {
        store.set_allowlist(vec![AllowlistEntry {
            symbol: symbol.into(),
            enabled: true,
        }]);
    }

    fn owner_row(symbol: &str, key: &str, version: &str) -> OwnershipRow {
        OwnershipRow {
            symbol: symbol.into(),
            active_engine_key: key.into(),
            active_engine_version: version.into(),
            last_score: 0.0,
            last_promotion_at: None,
            locked_until: None,
        }
    }

    #[test]
    fn metrics_computed_from_trades() {
        let now = fixed_now();
        let trades: Vec<TradeRecord> = vec![
            trade("NVDA", "swing", "v2", 1.0, 5, now),
            trade("NVDA", "swing", "v2", -1.0, 4, now),
            trade("NVDA", "swing", "v2", 2.0, 3, now),
            trade("NVDA", "swing", "v2", -0.5, 2, now),
        ];
        let refs: Vec<&TradeRecord> = trades.iter().collect();
        let m = compute_metrics(&refs);

        assert_eq!(m.trade_count, 4);
        assert!((m.expectancy_r - 0.375).abs() < 1e-9);
        assert!((m.win_rate - 0.5).abs() < 1e-9);
        // gross win 3.0, gross loss 1.5
        assert!((m.profit_factor - 2.0).abs() < 1e-9);
        // cum curve (time order): 1.0, 0.0, 2.0, 1.5 → max dd = 1.0
        assert!((m.max_drawdown_r - 1.0).abs() < 1e-9);
        assert!(m.stability > 0.0 && m.stability < 1.0);
    }

    #[test]
    fn score_is_monotone_in_expectancy() {
        let strong = EngineMetrics {
            trade_count: 30,
            expectancy_r: 0.5,
            max_drawdown_r: 2.0,
            stability: 0.5,
            win_rate: 0.6,
            profit_factor: 2.0,
            score: 0.5 * 10.0 * 0.5 - 0.5 * 2.0,
        };
        let weak_score = 0.2 * 10.0 * 0.5 - 0.5 * 2.0;
        assert!(strong.score > weak_score);
    }

    #[test]
    fn empty_group_is_inert() {
        let m = compute_metrics(&[]);
        assert_eq!(m.trade_count, 0);
        assert_eq!(m.score, 0.0);
    }

    #[test]
    fn score_rows_persist_both_windows_with_formula() {
        let now = fixed_now();
        let store = std::sync::Arc::new(MemoryStore::new());
        seed_trades(&store, "NVDA", "swing", "v2", &[0.5], 24, now);

        let report = run_allocation_pass(&store, now);
        assert_eq!(report.score_rows, 2); // 30d + 60d

        let rows = store.score_history();
        assert_eq!(rows.len(), 2);
        let windows: Vec<u32> = rows.iter().map(|r| r.window_days).collect();
        assert!(windows.contains(&30) && windows.contains(&60));
        for row in rows {
            assert_eq!(row.stability_formula, STABILITY_FORMULA);
            assert_eq!(row.trade_count, 24);
        }
    }

    #[test]
    fn promotes_better_candidate_and_locks_ownership() {
        let now = fixed_now();
        let store = std::sync::Arc::new(MemoryStore::new());
        allow(&store, "NVDA");
        store.set_ownership(owner_row("NVDA", "swing", "v1"));

        // Owner: steady but modest (expectancy 0.1, score 1.0).
        seed_trades(&store, "NVDA", "swing", "v1", &[0.1], 24, now);
        // Candidate: clearly stronger (expectancy 0.5, score 5.0).
        seed_trades(&store, "NVDA", "swing", "v2", &[0.5], 24, now);

        let report = run_allocation_pass(&store, now);
        assert_eq!(report.promotions, 1);

        let owner = store.ownership_map().get("NVDA").cloned().unwrap();
        assert_eq!(owner.active_engine_version, "v2");
        assert_eq!(owner.last_promotion_at, Some(now));
        assert_eq!(owner.locked_until, Some(now + Duration::days(45)));

        let log = store.promotion_log();
        assert!(log.iter().any(|p| p.outcome == "PROMOTED"));
    }

    #[test]
    fn lock_blocks_promotion() {
        let now = fixed_now();
        let store = std::sync::Arc::new(MemoryStore::new());
        allow(&store, "NVDA");
        let mut row = owner_row("NVDA", "swing", "v1");
        row.locked_until = Some(now + Duration::days(10));
        store.set_ownership(row);

        seed_trades(&store, "NVDA", "swing", "v1", &[0.1], 24, now);
        seed_trades(&store, "NVDA", "swing", "v2", &[0.5], 24, now);

        let report = run_allocation_pass(&store, now);
        assert_eq!(report.promotions, 0);
        assert!(store
            .promotion_log()
            .iter()
            .any(|p| p.outcome == "OWNER_LOCKED"));
        // Ownership unchanged.
        assert_eq!(
            store.ownership_map().get("NVDA").unwrap().active_engine_version,
            "v1"
        );
    }

    #[test]
    fn live_position_is_the_pending_blocker() {
        use crate::position::{OpenSpec, Position};
        use crate::store::LaneStore;
        use crate::types::{EngineContext, TradingStyle};

        let now = fixed_now();
        let store = std::sync::Arc::new(MemoryStore::new());
        allow(&store, "NVDA");
        store.set_ownership(owner_row("NVDA", "swing", "v1"));
        seed_trades(&store, "NVDA", "swing", "v1", &[0.1], 24, now);
        seed_trades(&store, "NVDA", "swing", "v2", &[0.5], 24, now);

        // A live open position on the symbol.
        let live = LaneStore::for_context(
            store.clone(),
            EngineContext {
                engine_key: "swing".into(),
                engine_version: "v1".into(),
                run_mode: RunMode::Primary,
                style: TradingStyle::Swing,
                now,
            },
        );
        live.insert_position(&Position::open(OpenSpec {
            engine_key: "swing".into(),
            engine_version: "v1".into(),
            run_mode: RunMode::Primary,
            symbol: "NVDA".into(),
            side: Side::Long,
            entry_price: 100.0,
            qty: 10.0,
            stop_loss: 98.0,
            take_profit_1: 104.0,
            take_profit_2: None,
            signal_id: None,
            opened_at: now,
        }))
        .unwrap();

        let report = run_allocation_pass(&store, now);
        assert_eq!(report.promotions, 0);
        assert!(store
            .promotion_log()
            .iter()
            .any(|p| p.outcome == "PENDING_OPEN_POSITION"));
    }

    #[test]
    fn expectancy_margin_gate() {
        let now = fixed_now();
        let store = std::sync::Arc::new(MemoryStore::new());
        allow(&store, "NVDA");
        store.set_ownership(owner_row("NVDA", "swing", "v1"));
        // Candidate beats the score ratio but not the 0.1 R margin.
        seed_trades(&store, "NVDA", "swing", "v1", &[0.1], 24, now);
        seed_trades(&store, "NVDA", "swing", "v2", &[0.15], 24, now);

        let report = run_allocation_pass(&store, now);
        assert_eq!(report.promotions, 0);
        assert!(store
            .promotion_log()
            .iter()
            .any(|p| p.outcome == "EXPECTANCY_MARGIN"));
    }

    #[test]
    fn not_allowlisted_rejected() {
        let now = fixed_now();
        let store = std::sync::Arc::new(MemoryStore::new());
        store.set_ownership(owner_row("NVDA", "swing", "v1"));
        seed_trades(&store, "NVDA", "swing", "v1", &[0.1], 24, now);
        seed_trades(&store, "NVDA", "swing", "v2", &[0.5], 24, now);

        let report = run_allocation_pass(&store, now);
        assert_eq!(report.promotions, 0);
        assert!(store
            .promotion_log()
            .iter()
            .any(|p| p.outcome == "NOT_ALLOWLISTED"));
    }

    #[test]
    fn thin_history_never_proposes() {
        let now = fixed_now();
        let store = std::sync::Arc::new(MemoryStore::new());
        allow(&store, "NVDA");
        store.set_ownership(owner_row("NVDA", "swing", "v1"));
        // Only 10 trades — below the 20-trade eligibility floor.
        seed_trades(&store, "NVDA", "swing", "v2", &[0.8], 10, now);

        let report = run_allocation_pass(&store, now);
        assert_eq!(report.promotions, 0);
        assert_eq!(report.proposals, 0);
    }
}
