// =============================================================================
// Portfolio Bucket Guard — CORE / EXPLORE lane split with fair rotation
// =============================================================================
//
// Built once per tick, for the SWING PRIMARY instance only. Per-symbol
// priority:
//
//   priority = 30 * is_top8 + 0.4 * manual_priority + 0.1 * confidence
//
// (or the stored trade_priority_score when present). The top
// max(1, ceil(0.8 * max_slots)) symbols are CORE; the remaining slots are
// EXPLORE, filled round-robin from non-Top8 candidates using a rotation
// cursor persisted in the store (a row, not a cache — rotation survives
// restarts). Symbols in neither set are rejected by admission.
// =============================================================================

use std::collections::HashSet;

use chrono::NaiveDate;
use tracing::debug;

use crate::store::MemoryStore;

/// Lane verdict for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneAssignment {
    Core,
    Explore,
    Outside,
}

impl LaneAssignment {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Core => "CORE",
            Self::Explore => "EXPLORE",
            Self::Outside => "OUTSIDE",
        }
    }
}

/// The per-tick bucket guard.
#[derive(Debug, Clone)]
pub struct BucketGuard {
    pub core: HashSet<String>,
    pub explore: HashSet<String>,
    pub core_slots: usize,
    pub explore_slots: usize,
    pub snapshot_date: NaiveDate,
}

impl BucketGuard {
    /// Build the guard from the focus snapshot and allowlist, advancing the
    /// persisted explore rotation cursor.
    pub fn build(store: &MemoryStore, max_slots: usize, today: NaiveDate) -> Self {
        let focus = store.focus_entries();
        let allowlist: HashSet<String> = store
            .allowlist_entries()
            .into_iter()
            .filter(|a| a.enabled)
            .map(|a| a.symbol)
            .collect();

        // Score every candidate. Allowlist-only symbols carry zero priority
        // but stay eligible for explore rotation.
        let mut scored: Vec<(String, f64, bool)> = focus
            .iter()
            .map(|f| {
                let top8_term = if f.is_top8 { 30.0 } else { 0.0 };
                let priority = f
                    .trade_priority_score
                    .unwrap_or(top8_term + 0.4 * f.manual_priority + 0.1 * f.confidence);
                (f.symbol.clone(), priority, f.is_top8)
            })
            .collect();
        for symbol in &allowlist {
            if !focus.iter().any(|f| &f.symbol == symbol) {
                scored.push((symbol.clone(), 0.0, false));
            }
        }

        // Descending priority; alphabetical tiebreak keeps the sort stable
        // across ticks.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let core_slots = ((0.8 * max_slots as f64).ceil() as usize).max(1);
        let explore_slots = max_slots.saturating_sub(core_slots);

        let core: HashSet<String> = scored
            .iter()
            .take(core_slots)
            .map(|(s, _, _)| s.clone())
            .collect();

        // Explore pool: non-Top8 candidates not already CORE, in stable order.
        let pool: Vec<String> = scored
            .iter()
            .filter(|(s, _, top8)| !top8 && !core.contains(s))
            .map(|(s, _, _)| s.clone())
            .collect();
        // Leftovers (Top8 that missed CORE) backfill when the pool runs dry.
        let leftovers: Vec<String> = scored
            .iter()
            .filter(|(s, _, _)| !core.contains(s) && !pool.contains(s))
            .map(|(s, _, _)| s.clone())
            .collect();

        let cursor = store.explore_cursor();
        let start = match cursor.last_symbol.as_deref() {
            Some(last) => pool
                .iter()
                .position(|s| s.as_str() == last)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };

        let mut explore: HashSet<String> = HashSet::new();
        let mut picked_last: Option<String> = None;
        for offset in 0..pool.len() {
            if explore.len() >= explore_slots {
                break;
            }
            let symbol = &pool[(start + offset) % pool.len()];
            explore.insert(symbol.clone());
            picked_last = Some(symbol.clone());
        }
        for symbol in leftovers {
            if explore.len() >= explore_slots {
                break;
            }
            explore.insert(symbol);
        }

        if let Some(last) = picked_last {
            store.save_explore_cursor(Some(last));
        }

        debug!(
            core = core.len(),
            explore = explore.len(),
            core_slots,
            explore_slots,
            "bucket guard built"
        );

        Self {
            core,
            explore,
            core_slots,
            explore_slots,
            snapshot_date: today,
        }
    }

    pub fn classify(&self, symbol: &str) -> LaneAssignment {
        if self.core.contains(symbol) {
            LaneAssignment::Core
        } else if self.explore.contains(symbol) {
            LaneAssignment::Explore
        } else {
            LaneAssignment::Outside
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::store::{AllowlistEntry, FocusEntry};

    fn focus(symbol: &str, top8: bool, manual: f64, confidence: f64) -> FocusEntry {
        FocusEntry {
            symbol: symbol.into(),
            is_top8: top8,
            manual_priority: manual,
            confidence,
            trade_priority_score: None,
            snapshot_date: Utc::now().date_naive(),
        }
    }

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.set_focus(vec![
            focus("NVDA", true, 5.0, 0.9),
            focus("TSLA", true, 4.0, 0.8),
            focus("AAPL", true, 3.0, 0.8),
            focus("MSFT", true, 2.0, 0.7),
            focus("AMD", false, 1.0, 0.6),
            focus("PLTR", false, 0.5, 0.5),
            focus("SHOP", false, 0.2, 0.4),
        ]);
        store
    }

    #[test]
    fn slot_split_matches_ratio() {
        let store = seeded_store();
        let guard = BucketGuard::build(&store, 5, Utc::now().date_naive());
        // core = ceil(0.8 * 5) = 4, explore = 1
        assert_eq!(guard.core_slots, 4);
        assert_eq!(guard.explore_slots, 1);
        assert_eq!(guard.core.len(), 4);
        assert_eq!(guard.explore.len(), 1);
    }

    #[test]
    fn top8_dominate_core() {
        let store = seeded_store();
        let guard = BucketGuard::build(&store, 5, Utc::now().date_naive());
        for sym in ["NVDA", "TSLA", "AAPL", "MSFT"] {
            assert_eq!(guard.classify(sym), LaneAssignment::Core, "{sym}");
        }
    }

    #[test]
    fn explore_comes_from_non_top8() {
        let store = seeded_store();
        let guard = BucketGuard::build(&store, 5, Utc::now().date_naive());
        let explore: Vec<&String> = guard.explore.iter().collect();
        assert_eq!(explore.len(), 1);
        assert!(["AMD", "PLTR", "SHOP"].contains(&explore[0].as_str()));
    }

    #[test]
    fn rotation_cursor_advances_across_builds() {
        let store = seeded_store();
        let today = Utc::now().date_naive();

        let g1 = BucketGuard::build(&store, 5, today);
        let first: String = g1.explore.iter().next().unwrap().clone();

        let g2 = BucketGuard::build(&store, 5, today);
        let second: String = g2.explore.iter().next().unwrap().clone();

        assert_ne!(first, second, "rotation must move to the next candidate");

        // Three candidates → after three builds the rotation wraps.
        let g3 = BucketGuard::build(&store, 5, today);
        let third: String = g3.explore.iter().next().unwrap().clone();
        let g4 = BucketGuard::build(&store, 5, today);
        let fourth: String = g4.explore.iter().next().unwrap().clone();
        assert_ne!(second, third);
        assert_eq!(first, fourth, "cursor should wrap around the pool");
    }

    #[test]
    fn stored_priority_score_overrides_formula() {
        let store = MemoryStore::new();
        let mut low = focus("LOW", false, 0.0, 0.0);
        low.trade_priority_score = Some(99.0);
        store.set_focus(vec![low, focus("NVDA", true, 5.0, 0.9)]);

        let guard = BucketGuard::build(&store, 2, Utc::now().date_naive());
        // core = ceil(1.6) = 2 → both CORE, but LOW must rank first.
        assert_eq!(guard.classify("LOW"), LaneAssignment::Core);
    }

    #[test]
    fn outside_symbols_rejected() {
        let store = seeded_store();
        let guard = BucketGuard::build(&store, 5, Utc::now().date_naive());
        assert_eq!(guard.classify("GME"), LaneAssignment::Outside);
    }

    #[test]
    fn allowlist_only_symbols_join_explore_pool() {
        let store = MemoryStore::new();
        store.set_focus(vec![focus("NVDA", true, 5.0, 0.9)]);
        store.set_allowlist(vec![AllowlistEntry {
            symbol: "COIN".into(),
            enabled: true,
        }]);

        let guard = BucketGuard::build(&store, 2, Utc::now().date_naive());
        // core = 2 slots but only one focus symbol outranks COIN; both land
        // somewhere inside the buckets.
        assert_ne!(guard.classify("COIN"), LaneAssignment::Outside);
    }

    #[test]
    fn core_slots_floor_at_one() {
        let store = seeded_store();
        let guard = BucketGuard::build(&store, 1, Utc::now().date_naive());
        assert_eq!(guard.core_slots, 1);
        assert_eq!(guard.explore_slots, 0);
    }
}
