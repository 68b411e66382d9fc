pub mod kline_cache;
pub mod stream;
pub mod universe;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Kline`).
pub use kline_cache::{BarClose, Kline, KlineCache, KlineKey};
pub use universe::{SymbolUniverse, TickerInfo};

use std::collections::HashMap;
use std::sync::Arc;

use crate::types::Timeframe;

/// The read-only bundle handed to the sandbox for one evaluation.
///
/// `klines` holds only closed bars, oldest first, one series per timeframe the
/// trader's filter declared.
#[derive(Debug, Clone)]
pub struct MarketData {
    pub symbol: String,
    pub ticker: TickerInfo,
    pub klines: HashMap<Timeframe, Arc<Vec<Kline>>>,
}

impl MarketData {
    /// Series for a timeframe; an empty slice when the filter asks for one it
    /// never declared (indicators then yield no-value).
    pub fn series(&self, tf: Timeframe) -> Arc<Vec<Kline>> {
        self.klines.get(&tf).cloned().unwrap_or_default()
    }
}
