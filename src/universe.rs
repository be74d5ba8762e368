// =============================================================================
// Universe Loader — tradable tickers and per-ticker engine ownership
// =============================================================================
//
// The tradable set for a tick is the union of today's focus snapshot and the
// enabled allowlist. The ownership map gates which engine version may open
// new trades on a ticker; positions already open are unaffected.
// =============================================================================

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::store::{MemoryStore, OwnershipRow};

/// Resolved universe for one tick.
#[derive(Debug, Clone, Default)]
pub struct Universe {
    /// focus ∪ enabled allowlist.
    pub symbols: HashSet<String>,
    /// Enabled allowlist symbols (these bypass the signal confidence floor).
    pub allowlisted: HashSet<String>,
    pub ownership: HashMap<String, OwnershipRow>,
}

impl Universe {
    /// Resolve the universe from the store's focus/allowlist/ownership tables.
    pub fn load(store: &MemoryStore) -> Self {
        let mut symbols: HashSet<String> = store
            .focus_entries()
            .into_iter()
            .map(|f| f.symbol)
            .collect();

        let allowlisted: HashSet<String> = store
            .allowlist_entries()
            .into_iter()
            .filter(|a| a.enabled)
            .map(|a| a.symbol)
            .collect();
        symbols.extend(allowlisted.iter().cloned());

        let ownership = store.ownership_map();

        debug!(
            symbols = symbols.len(),
            allowlisted = allowlisted.len(),
            owned = ownership.len(),
            "universe resolved"
        );

        Self {
            symbols,
            allowlisted,
            ownership,
        }
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    /// Ownership check for admission: when a ticker has an owner row, only
    /// signals from that engine version may open trades. Tickers without a
    /// row are unowned and open to every engine.
    pub fn version_owns(&self, symbol: &str, engine_version: &str) -> bool {
        match self.ownership.get(symbol) {
            Some(row) => row.active_engine_version == engine_version,
            None => true,
        }
    }
}
