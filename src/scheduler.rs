// =============================================================================
// Tick Scheduler — one invocation, engines in sequence, strict lane isolation
// =============================================================================
//
// A tick runs, in order:
//
//   1. Universe load (focus ∪ allowlist, ownership map).
//   2. Bucket guard build (SWING PRIMARY only).
//   3. For each enabled engine instance, sequentially:
//        loader → position manager → signal admission → snapshot writer.
//
// Isolation trumps parallelism: one store, many small writes, no two
// instances in flight at once. An error in one instance is logged and the
// scheduler moves to the next; an error on one position leaves it OPEN. The
// tick carries a soft wall-clock budget — engines past it are deferred to
// the next tick. Every tick ends with a heartbeat row.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::admission::{self, AdmissionDeps, GateState};
use crate::config::{EngineConfig, StrategyKnobs};
use crate::lane::BucketGuard;
use crate::manager::{self, ManagePolicy};
use crate::market::{bulk_quotes_bounded, MarketData, Quote};
use crate::portfolio;
use crate::quick_profit;
use crate::signals_feed::{SignalQuery, SignalSource};
use crate::store::{HeartbeatLevel, LaneStore, MemoryStore};
use crate::types::{EngineInstance, RunMode, TradingStyle};
use crate::universe::Universe;

/// Signals below this confidence are dropped unless the ticker is
/// allowlisted.
const CONFIDENCE_FLOOR: f64 = 0.6;

/// Summary of one tick, returned to the ingress and kept for the UI.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub crypto_only: bool,
    pub engines_run: usize,
    pub engines_failed: usize,
    pub engines_deferred: usize,
    pub positions_managed: usize,
    pub exits: usize,
    pub signals_evaluated: usize,
    pub positions_opened: usize,
    pub duration_ms: u64,
}

/// Run one tick over the given engine instances.
pub async fn run_tick(
    store: &Arc<MemoryStore>,
    market: &dyn MarketData,
    cfg: &EngineConfig,
    engines: &[EngineInstance],
    now: DateTime<Utc>,
    crypto_only: bool,
) -> Result<TickReport> {
    let started = Instant::now();
    let mut report = TickReport {
        crypto_only,
        ..TickReport::default()
    };

    // ── 1. Universe ─────────────────────────────────────────────────────
    let universe = Universe::load(store);

    // ── 2. Engine selection ─────────────────────────────────────────────
    let selected: Vec<&EngineInstance> = engines
        .iter()
        .filter(|e| e.enabled && e.stopped_at.is_none())
        .filter(|e| match e.style {
            TradingStyle::DayTrader => !cfg.disable_daytrader,
            TradingStyle::Crypto => cfg.enable_crypto_shadow,
            _ => true,
        })
        .filter(|e| {
            if crypto_only {
                e.style == TradingStyle::Crypto
            } else {
                true
            }
        })
        .collect();

    // ── 3. Bucket guard (SWING PRIMARY only) ────────────────────────────
    let needs_bucket = selected
        .iter()
        .any(|e| e.style == TradingStyle::Swing && e.run_mode == RunMode::Primary);
    let bucket = needs_bucket.then(|| {
        BucketGuard::build(store, cfg.swing.max_concurrent as usize, now.date_naive())
    });

    // ── 4. Engines, sequentially, under the soft budget ─────────────────
    for (idx, instance) in selected.iter().enumerate() {
        if started.elapsed().as_millis() as u64 > cfg.tick_soft_budget_ms {
            report.engines_deferred = selected.len() - idx;
            warn!(
                deferred = report.engines_deferred,
                budget_ms = cfg.tick_soft_budget_ms,
                "tick soft budget exceeded — deferring remaining engines"
            );
            break;
        }

        match process_instance(store, market, cfg, &universe, bucket.as_ref(), instance, now).await
        {
            Ok(stats) => {
                report.engines_run += 1;
                report.positions_managed += stats.positions_managed;
                report.exits += stats.exits;
                report.signals_evaluated += stats.signals_evaluated;
                report.positions_opened += stats.positions_opened;
            }
            Err(e) => {
                // A cross-partition write is a programmer error: abort the
                // tick instead of moving on.
                if e.downcast_ref::<crate::store::guard::GuardViolation>().is_some() {
                    store.push_heartbeat(
                        HeartbeatLevel::Error,
                        format!("tick aborted by run-mode guard: {e}"),
                    );
                    return Err(e.context("run-mode guard violation — tick aborted"));
                }
                report.engines_failed += 1;
                error!(
                    engine = %format!("{}@{} [{}]", instance.engine_key, instance.engine_version, instance.run_mode),
                    error = %e,
                    "engine instance failed — continuing with next"
                );
                store.push_heartbeat(
                    HeartbeatLevel::Error,
                    format!(
                        "engine {}@{} failed: {e}",
                        instance.engine_key, instance.engine_version
                    ),
                );
            }
        }
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    store.push_heartbeat(
        HeartbeatLevel::Info,
        format!(
            "tick ok: engines={} exits={} opened={} deferred={} {}ms",
            report.engines_run,
            report.exits,
            report.positions_opened,
            report.engines_deferred,
            report.duration_ms
        ),
    );
    info!(
        engines = report.engines_run,
        failed = report.engines_failed,
        deferred = report.engines_deferred,
        exits = report.exits,
        opened = report.positions_opened,
        duration_ms = report.duration_ms,
        "tick complete"
    );

    Ok(report)
}

#[derive(Debug, Default)]
struct InstanceStats {
    positions_managed: usize,
    exits: usize,
    signals_evaluated: usize,
    positions_opened: usize,
}

/// Loader → position manager → admission → snapshot for one instance.
async fn process_instance(
    store: &Arc<MemoryStore>,
    market: &dyn MarketData,
    cfg: &EngineConfig,
    universe: &Universe,
    bucket: Option<&BucketGuard>,
    instance: &EngineInstance,
    now: DateTime<Utc>,
) -> Result<InstanceStats> {
    let ctx = instance.context(now);
    let lane = LaneStore::for_context(store.clone(), ctx);
    let mut stats = InstanceStats::default();

    // ── Quotes for open tickers plus the tradable universe ──────────────
    let mut symbols: Vec<String> = lane
        .open_positions()
        .iter()
        .map(|p| p.symbol.clone())
        .collect();
    symbols.extend(universe.symbols.iter().cloned());
    symbols.sort();
    symbols.dedup();
    let quotes: HashMap<String, Quote> = bulk_quotes_bounded(market, &symbols).await;

    // ── Portfolio loader ────────────────────────────────────────────────
    let starting_equity = starting_equity_for(&lane, cfg, instance, store);
    let loader_view = portfolio::rebuild(&lane, starting_equity, &quotes);
    tracing::debug!(
        instance = %lane.ctx,
        equity = format!("{:.2}", loader_view.equity),
        open = loader_view.open_count,
        "portfolio loaded"
    );

    // ── Position manager ────────────────────────────────────────────────
    if instance.style == TradingStyle::QuickProfit {
        let qp_stats = quick_profit::run_quick_profit_pass(
            &lane,
            market,
            &cfg.quick_profit,
            cfg.enable_signal_outcomes,
        )
        .await?;
        stats.positions_managed = qp_stats.managed;
        stats.exits = qp_stats.exits;
    } else {
        let policy = ManagePolicy::from_config(
            cfg,
            instance.style,
            instance.run_mode,
            &instance.engine_version,
        );
        let pass = manager::run_position_pass(&lane, market, &policy, cfg.enable_signal_outcomes)
            .await?;
        stats.positions_managed = pass.managed;
        stats.exits = pass.exits;
    }

    // Exits changed the book — recompute before sizing.
    let mut view = portfolio::rebuild(&lane, starting_equity, &quotes);

    // ── Signal admission ────────────────────────────────────────────────
    let knobs = effective_knobs(cfg, instance.style);
    let lookback = if instance.style == TradingStyle::QuickProfit {
        Duration::hours(cfg.quick_profit.lookback_hours)
    } else {
        Duration::minutes(knobs.signal_lookback_minutes)
    };
    let query = SignalQuery {
        style: instance.style,
        since: now - lookback,
        confidence_floor: CONFIDENCE_FLOOR,
        bypass_floor_symbols: universe.allowlisted.clone(),
    };
    let signals = store
        .fresh_signals(&query)
        .await
        .context("signal lookback query failed")?;
    // Universe filter: admission only sees tradable tickers.
    let signals: Vec<_> = signals
        .into_iter()
        .filter(|s| universe.contains(&s.symbol))
        .collect();

    let gate = GateState::evaluate(
        &cfg.gate,
        now,
        instance.style,
        instance.run_mode,
        store.context_decision().as_ref(),
    );
    let use_bucket =
        (instance.style == TradingStyle::Swing && instance.run_mode == RunMode::Primary)
            .then_some(bucket)
            .flatten();
    let deps = AdmissionDeps {
        lane: &lane,
        market,
        universe,
        bucket: use_bucket,
        knobs: &knobs,
        gate,
        quotes: &quotes,
    };
    let adm = admission::run_admission(&deps, &mut view, &signals).await;
    stats.signals_evaluated = adm.evaluated;
    stats.positions_opened = adm.opened;

    // ── Snapshot writer ─────────────────────────────────────────────────
    lane.save_snapshot(view.to_snapshot(&lane))
        .context("snapshot writeback failed")?;

    Ok(stats)
}

/// First-ever snapshots define starting equity; afterwards it is sticky.
/// The quick-profit shadow synchronises a fresh book with the live SWING
/// equity when one exists.
fn starting_equity_for(
    lane: &LaneStore,
    cfg: &EngineConfig,
    instance: &EngineInstance,
    store: &MemoryStore,
) -> f64 {
    if let Some(snapshot) = lane.load_snapshot() {
        return snapshot.starting_equity;
    }
    if instance.style == TradingStyle::QuickProfit {
        if let Some(live) = store.latest_live_snapshot() {
            return live.equity;
        }
    }
    cfg.knobs_for(instance.style).initial_equity
}

/// Admission knobs per style. Quick-profit rides on the swing exit knobs
/// with its own risk and concurrency overrides, runner off.
fn effective_knobs(cfg: &EngineConfig, style: TradingStyle) -> StrategyKnobs {
    let mut knobs = cfg.knobs_for(style).clone();
    if style == TradingStyle::QuickProfit {
        knobs.risk_pct = cfg.quick_profit.risk_pct;
        knobs.max_concurrent = cfg.quick_profit.max_concurrent;
        knobs.runner_enabled = false;
    }
    knobs
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::market::sim::ScriptedMarketData;
    use crate::market::Bar;
    use crate::signals_feed::Signal;
    use crate::store::FocusEntry;
    use crate::types::SignalSide;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 15, 0, 0).unwrap()
    }

    fn swing_primary() -> EngineInstance {
        EngineInstance::new("swing", "v3", RunMode::Primary, TradingStyle::Swing)
    }

    fn swing_shadow() -> EngineInstance {
        EngineInstance::new("swing", "v2", RunMode::Shadow, TradingStyle::Swing)
    }

    fn focus_top8(symbol: &str, now: DateTime<Utc>) -> FocusEntry {
        FocusEntry {
            symbol: symbol.into(),
            is_top8: true,
            manual_priority: 5.0,
            confidence: 0.9,
            trade_priority_score: None,
            snapshot_date: now.date_naive(),
        }
    }

    fn signal(symbol: &str, version: &str, now: DateTime<Utc>) -> Signal {
        Signal {
            id: format!("sig-{symbol}-{version}"),
            symbol: symbol.into(),
            engine_type: "swing".into(),
            trading_style: TradingStyle::Swing,
            side: SignalSide::Buy,
            confidence: 0.8,
            entry_price: 100.0,
            stop_loss: 98.0,
            take_profit_1: 104.0,
            engine_version: version.into(),
            created_at: now - Duration::minutes(5),
        }
    }

    fn lane_for(store: &Arc<MemoryStore>, inst: &EngineInstance, now: DateTime<Utc>) -> LaneStore {
        LaneStore::for_context(store.clone(), inst.context(now))
    }

    /// Assert P1/P2 from the persisted snapshot against the ledger.
    fn assert_portfolio_invariants(
        store: &Arc<MemoryStore>,
        inst: &EngineInstance,
        quotes: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) {
        let lane = lane_for(store, inst, now);
        let snap = lane.load_snapshot().expect("snapshot must exist after tick");

        let realized: f64 = lane.trades().iter().map(|t| t.realized_pnl).sum();
        let positions = lane.open_positions();
        let unrealized: f64 = positions
            .iter()
            .map(|p| quotes.get(&p.symbol).map(|q| p.unrealized_pnl(*q)).unwrap_or(0.0))
            .sum();
        let allocated: f64 = positions.iter().map(|p| p.notional_at_entry).sum();

        let equity = snap.starting_equity + realized + unrealized;
        assert!(
            (snap.equity - equity).abs() < 0.01,
            "P1 violated: snapshot {} vs ledger {}",
            snap.equity,
            equity
        );
        let cash = snap.equity - allocated - unrealized;
        assert!(
            (snap.cash - cash).abs() < 0.01,
            "P2 violated: snapshot {} vs ledger {}",
            snap.cash,
            cash
        );

        // P4: one open position per ticker per instance.
        let mut seen = std::collections::HashSet::new();
        for p in &positions {
            assert!(seen.insert(p.symbol.clone()), "P4 violated on {}", p.symbol);
        }

        // P3: risk bookkeeping immutable.
        for p in &positions {
            let expected = p.risk_per_share * p.initial_qty;
            assert!(
                (p.risk_dollars - expected).abs() < 1e-6,
                "P3 violated on {}",
                p.symbol
            );
        }
    }

    #[tokio::test]
    async fn open_then_take_profit_across_ticks() {
        let now = fixed_now();
        let store = Arc::new(MemoryStore::new());
        let sim = ScriptedMarketData::new();
        let mut cfg = EngineConfig::default();
        cfg.swing.runner_enabled = false;
        let engines = vec![swing_primary()];

        store.set_focus(vec![focus_top8("NVDA", now)]);
        store.seed_signals(vec![signal("NVDA", "v3", now)]);
        sim.set_quote("NVDA", 100.0);

        // Tick 1: the signal is admitted and sized 250 @ 100.
        let report = run_tick(&store, &sim, &cfg, &engines, now, false)
            .await
            .unwrap();
        assert_eq!(report.engines_run, 1);
        assert_eq!(report.positions_opened, 1);

        let lane = lane_for(&store, &engines[0], now);
        let open = lane.open_positions();
        assert_eq!(open.len(), 1);
        assert!((open[0].qty - 250.0).abs() < 1e-9);

        let quotes: HashMap<String, f64> = [("NVDA".to_string(), 100.0)].into();
        assert_portfolio_invariants(&store, &engines[0], &quotes, now);

        // Tick 2: a bar tags the take profit.
        let later = now + Duration::minutes(1);
        sim.set_position_bars(
            "NVDA",
            vec![Bar {
                ts: later - Duration::seconds(30),
                open: 100.0,
                high: 104.2,
                low: 99.5,
                close: 104.0,
            volume: 1_000.0,
            }],
            104.0,
        );
        sim.set_quote("NVDA", 104.0);

        let report2 = run_tick(&store, &sim, &cfg, &engines, later, false)
            .await
            .unwrap();
        assert_eq!(report2.exits, 1);

        let lane = lane_for(&store, &engines[0], later);
        assert!(lane.open_positions().is_empty());
        let trades = lane.trades();
        assert_eq!(trades.len(), 1);
        assert!((trades[0].realized_pnl - 1_000.0).abs() < 1e-9);

        // Equity landed at 101 000.
        let snap = lane.load_snapshot().unwrap();
        assert!((snap.equity - 101_000.0).abs() < 0.01);
        let quotes: HashMap<String, f64> = [("NVDA".to_string(), 104.0)].into();
        assert_portfolio_invariants(&store, &engines[0], &quotes, later);
    }

    #[tokio::test]
    async fn shadow_and_primary_stay_partitioned() {
        let now = fixed_now();
        let store = Arc::new(MemoryStore::new());
        let sim = ScriptedMarketData::new();
        let mut cfg = EngineConfig::default();
        cfg.swing.runner_enabled = false;
        let engines = vec![swing_primary(), swing_shadow()];

        store.set_focus(vec![focus_top8("NVDA", now)]);
        // One signal per engine version.
        store.seed_signals(vec![signal("NVDA", "v3", now), signal("NVDA", "v2", now)]);
        sim.set_quote("NVDA", 100.0);

        let report = run_tick(&store, &sim, &cfg, &engines, now, false)
            .await
            .unwrap();
        assert_eq!(report.engines_run, 2);
        assert_eq!(report.positions_opened, 2);

        // P6: each lane holds exactly its own position.
        let primary = lane_for(&store, &engines[0], now);
        let shadow = lane_for(&store, &engines[1], now);
        assert_eq!(primary.open_positions().len(), 1);
        assert_eq!(shadow.open_positions().len(), 1);
        assert_eq!(primary.open_positions()[0].run_mode, RunMode::Primary);
        assert_eq!(shadow.open_positions()[0].run_mode, RunMode::Shadow);
    }

    #[tokio::test]
    async fn crypto_only_path_skips_equity_engines() {
        let now = fixed_now();
        let store = Arc::new(MemoryStore::new());
        let sim = ScriptedMarketData::new();
        let mut cfg = EngineConfig::default();
        cfg.enable_crypto_shadow = true;
        let engines = vec![
            swing_primary(),
            EngineInstance::new("crypto", "v1", RunMode::Shadow, TradingStyle::Crypto),
        ];

        let report = run_tick(&store, &sim, &cfg, &engines, now, true)
            .await
            .unwrap();
        assert_eq!(report.engines_run, 1);
        assert!(report.crypto_only);
    }

    #[tokio::test]
    async fn disabled_flags_prune_engines() {
        let now = fixed_now();
        let store = Arc::new(MemoryStore::new());
        let sim = ScriptedMarketData::new();
        let mut cfg = EngineConfig::default();
        cfg.disable_daytrader = true;
        cfg.enable_crypto_shadow = false;
        let engines = vec![
            swing_primary(),
            EngineInstance::new("day", "v1", RunMode::Shadow, TradingStyle::DayTrader),
            EngineInstance::new("crypto", "v1", RunMode::Shadow, TradingStyle::Crypto),
        ];

        let report = run_tick(&store, &sim, &cfg, &engines, now, false)
            .await
            .unwrap();
        assert_eq!(report.engines_run, 1);
    }

    #[tokio::test]
    async fn quick_profit_starts_from_live_equity() {
        let now = fixed_now();
        let store = Arc::new(MemoryStore::new());
        let sim = ScriptedMarketData::new();
        let cfg = EngineConfig::default();

        // A live swing snapshot at 123 456.
        let primary = swing_primary();
        let lane = lane_for(&store, &primary, now);
        let view = portfolio::rebuild(&lane, 123_456.0, &HashMap::new());
        lane.save_snapshot(view.to_snapshot(&lane)).unwrap();

        let qp = EngineInstance::new(
            "quick-profit",
            "v1",
            RunMode::Shadow,
            TradingStyle::QuickProfit,
        );
        let engines = vec![qp.clone()];
        run_tick(&store, &sim, &cfg, &engines, now, false)
            .await
            .unwrap();

        let qp_lane = lane_for(&store, &qp, now);
        let snap = qp_lane.load_snapshot().unwrap();
        assert!((snap.starting_equity - 123_456.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn context_decision_closes_shadow_gate() {
        use crate::store::{ContextDecision, GateVerdict};

        let now = fixed_now();
        let store = Arc::new(MemoryStore::new());
        let sim = ScriptedMarketData::new();
        let mut cfg = EngineConfig::default();
        cfg.swing.runner_enabled = false;
        let engines = vec![swing_shadow()];

        store.set_focus(vec![focus_top8("NVDA", now)]);
        store.seed_signals(vec![signal("NVDA", "v2", now)]);
        sim.set_quote("NVDA", 100.0);
        store.set_context_decision(Some(ContextDecision {
            policy_version: "policy-1".into(),
            as_of: now,
            trade_gate: GateVerdict::Close,
            risk_scale: 1.0,
            max_positions: None,
        }));

        let report = run_tick(&store, &sim, &cfg, &engines, now, false)
            .await
            .unwrap();
        assert_eq!(report.positions_opened, 0);
        let lane = lane_for(&store, &engines[0], now);
        assert!(lane.open_positions().is_empty());
        // The abort is audited in the shared decision log.
        assert!(store
            .recent_decisions(10)
            .iter()
            .any(|r| r.reason_code == crate::audit::SKIP_TRADE_GATE));
    }

    #[tokio::test]
    async fn heartbeat_written_every_tick() {
        let now = fixed_now();
        let store = Arc::new(MemoryStore::new());
        let sim = ScriptedMarketData::new();
        let cfg = EngineConfig::default();
        run_tick(&store, &sim, &cfg, &[swing_primary()], now, false)
            .await
            .unwrap();
        let beats = store.heartbeats();
        assert!(!beats.is_empty());
        assert_eq!(beats.last().unwrap().level, HeartbeatLevel::Info);
    }

    // -------------------------------------------------------------------------
    // Random bar streams: invariants across flags and ticks
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn invariants_hold_over_random_bar_streams() {
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha8Rng;

        use crate::config::RecycleMode;

        let flag_combos = [
            (false, RecycleMode::Off, 1.5),
            (true, RecycleMode::Off, 1.5),
            (false, RecycleMode::On, 1.5),
            (true, RecycleMode::Strict, 1.5),
            (true, RecycleMode::On, 1_000.0), // trailing effectively off
        ];

        for (combo_idx, (runner, recycle, activation)) in flag_combos.into_iter().enumerate() {
            let mut rng = ChaCha8Rng::seed_from_u64(42 + combo_idx as u64);
            let base_now = fixed_now();
            let store = Arc::new(MemoryStore::new());
            let sim = ScriptedMarketData::new();
            let mut cfg = EngineConfig::default();
            cfg.swing.runner_enabled = runner;
            cfg.swing.recycle_mode = recycle;
            cfg.swing.trailing_activation_r = activation;
            let engines = vec![swing_primary()];

            let symbols = ["NVDA", "TSLA", "AAPL"];
            store.set_focus(symbols.iter().map(|s| focus_top8(s, base_now)).collect());

            // Bounded price walk per symbol.
            let mut prices: HashMap<String, f64> =
                symbols.iter().map(|s| (s.to_string(), 100.0)).collect();

            // Track trailing stops across ticks for P7.
            let mut last_trails: HashMap<String, f64> = HashMap::new();

            for tick in 0..12 {
                let now = base_now + Duration::minutes(tick);

                // Fresh signal occasionally.
                if tick % 4 == 0 {
                    let sym = symbols[(tick as usize / 4) % symbols.len()];
                    let px = prices[sym];
                    store.seed_signals(vec![Signal {
                        id: format!("sig-{combo_idx}-{tick}"),
                        symbol: sym.into(),
                        engine_type: "swing".into(),
                        trading_style: TradingStyle::Swing,
                        side: SignalSide::Buy,
                        confidence: 0.9,
                        entry_price: px,
                        stop_loss: px * 0.98,
                        take_profit_1: px * 1.04,
                        engine_version: "v3".into(),
                        created_at: now,
                    }]);
                }

                // Advance the walk, bounded to ±1% per tick.
                for sym in &symbols {
                    let p = prices.get_mut(*sym).unwrap();
                    let step: f64 = rng.gen_range(-0.01..0.01);
                    *p *= 1.0 + step;
                    let open = *p / (1.0 + step * 0.5);
                    let high = p.max(open) * 1.002;
                    let low = p.min(open) * 0.998;
                    sim.set_quote(sym, *p);
                    sim.set_position_bars(
                        sym,
                        vec![Bar {
                            ts: now - Duration::seconds(20),
                            open,
                            high,
                            low,
                            close: *p,
                            volume: 1_000.0,
                        }],
                        *p,
                    );
                }

                run_tick(&store, &sim, &cfg, &engines, now, false)
                    .await
                    .unwrap();

                // ── P1/P2/P3/P4 from the persisted state ────────────
                let quotes: HashMap<String, f64> =
                    prices.iter().map(|(k, v)| (k.clone(), *v)).collect();
                assert_portfolio_invariants(&store, &engines[0], &quotes, now);

                // ── P7: trailing stops never loosen ──────────────────
                let lane = lane_for(&store, &engines[0], now);
                for pos in lane.open_positions() {
                    if let Some(trail) = pos.trailing_stop_price {
                        if let Some(prev) = last_trails.get(&pos.id) {
                            assert!(
                                trail >= *prev - 1e-9,
                                "P7 violated on {}: {} -> {}",
                                pos.symbol,
                                prev,
                                trail
                            );
                        }
                        last_trails.insert(pos.id.clone(), trail);
                    }
                }

                // ── P5: every trade row maps back to a known position ─
                for trade in lane.trades() {
                    assert!(!trade.position_id.is_empty());
                    assert!((trade.qty) > 0.0);
                }
            }
        }
    }
}
