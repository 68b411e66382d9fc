// =============================================================================
// Symbol Universe — top-N USDT pairs by 24h quote volume
// =============================================================================
//
// The active set is the top `symbol_count` USDT-quoted symbols whose 24h quote
// volume clears `min_volume`, refreshed on the screening interval. The refresh
// also retains the latest ticker snapshot per symbol, which becomes
// `MarketData.ticker` for evaluations.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::binance::client::BinanceClient;

/// Latest 24h ticker stats for one symbol.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickerInfo {
    pub last_price: f64,
    pub price_change_pct: f64,
    pub quote_volume: f64,
}

/// Thread-safe view of the active symbol set plus per-symbol ticker stats.
pub struct SymbolUniverse {
    symbols: RwLock<Vec<String>>,
    tickers: RwLock<HashMap<String, TickerInfo>>,
    /// Bumped whenever the *membership* of the set changes (not on every
    /// ticker refresh); stream supervision keys off this.
    generation: AtomicU64,
}

impl SymbolUniverse {
    pub fn new() -> Self {
        Self {
            symbols: RwLock::new(Vec::new()),
            tickers: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Current membership, ranked by quote volume (highest first).
    pub fn symbols(&self) -> Vec<String> {
        self.symbols.read().clone()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.read().iter().any(|s| s == symbol)
    }

    pub fn ticker(&self, symbol: &str) -> TickerInfo {
        self.tickers.read().get(symbol).cloned().unwrap_or_default()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Apply a fresh ticker sweep: rank by quote volume, apply the floor,
    /// keep the top `symbol_count` USDT pairs.
    pub fn apply(&self, tickers: Vec<(String, TickerInfo)>, symbol_count: usize, min_volume: f64) {
        let mut eligible: Vec<(String, TickerInfo)> = tickers
            .into_iter()
            .filter(|(sym, t)| sym.ends_with("USDT") && t.quote_volume >= min_volume)
            .collect();
        eligible.sort_by(|a, b| {
            b.1.quote_volume
                .partial_cmp(&a.1.quote_volume)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        eligible.truncate(symbol_count);

        let new_symbols: Vec<String> = eligible.iter().map(|(s, _)| s.clone()).collect();

        {
            let mut map = self.tickers.write();
            map.clear();
            for (sym, ticker) in eligible {
                map.insert(sym, ticker);
            }
        }

        let changed = {
            let mut current = self.symbols.write();
            let mut sorted_old = current.clone();
            let mut sorted_new = new_symbols.clone();
            sorted_old.sort();
            sorted_new.sort();
            *current = new_symbols;
            sorted_old != sorted_new
        };

        if changed {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            info!(
                count = self.symbols.read().len(),
                generation, "symbol universe membership changed"
            );
        }
    }
}

impl Default for SymbolUniverse {
    fn default() -> Self {
        Self::new()
    }
}

/// Long-lived refresh loop: sweep 24h tickers on the screening interval.
pub async fn run_universe_refresh(
    universe: Arc<SymbolUniverse>,
    client: Arc<BinanceClient>,
    symbol_count: usize,
    min_volume: f64,
    interval_ms: u64,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(1000)));
    loop {
        ticker.tick().await;
        match client.get_24h_tickers().await {
            Ok(tickers) => {
                universe.apply(tickers, symbol_count, min_volume);
            }
            Err(e) => {
                warn!(error = %e, "24h ticker sweep failed -- keeping previous universe");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
