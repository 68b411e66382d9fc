use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::types::Timeframe;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single closed OHLCV candlestick.
///
/// `close_time` is the exclusive end of the bar: `open_time + duration`. This
/// makes series contiguity exactly `series[i+1].open_time == series[i].close_time`.
/// Binance reports an inclusive close (`open + duration - 1 ms`); ingestion
/// normalizes by adding one millisecond.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
    pub quote_volume: f64,
    pub trades: u64,
    pub taker_buy_base: f64,
    pub taker_buy_quote: f64,
}

/// Composite key that identifies a unique kline series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct KlineKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl KlineKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl std::fmt::Display for KlineKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// Event published when a live bar closes for some (symbol, timeframe).
/// Seeding and backfill never publish; only the exchange feed does.
#[derive(Debug, Clone)]
pub struct BarClose {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: i64,
    pub close_time: i64,
}

// ---------------------------------------------------------------------------
// Per-series storage
// ---------------------------------------------------------------------------

struct SeriesBuf {
    bars: VecDeque<Kline>,
    /// Set when a feed gap forced a reset; the seeder clears it after refill.
    needs_backfill: bool,
}

impl SeriesBuf {
    fn new(capacity: usize) -> Self {
        Self {
            bars: VecDeque::with_capacity(capacity + 1),
            needs_backfill: true,
        }
    }
}

// ---------------------------------------------------------------------------
// KlineCache
// ---------------------------------------------------------------------------

/// In-memory kline store: one independently lock-guarded ring buffer per
/// (symbol, timeframe). The outer map lock is held only long enough to fetch
/// the entry handle; readers of one series never contend with writers of
/// another. Only closed bars are stored.
pub struct KlineCache {
    series: RwLock<HashMap<KlineKey, Arc<RwLock<SeriesBuf>>>>,
    max_bars: usize,
    closes: broadcast::Sender<BarClose>,
}

impl KlineCache {
    /// Create a cache that retains at most `max_bars` closed bars per key.
    pub fn new(max_bars: usize) -> Self {
        let (closes, _) = broadcast::channel(4096);
        Self {
            series: RwLock::new(HashMap::new()),
            max_bars,
            closes,
        }
    }

    /// Subscribe to live bar-close events.
    pub fn subscribe_closes(&self) -> broadcast::Receiver<BarClose> {
        self.closes.subscribe()
    }

    fn entry(&self, key: &KlineKey) -> Arc<RwLock<SeriesBuf>> {
        if let Some(buf) = self.series.read().get(key) {
            return buf.clone();
        }
        let mut map = self.series.write();
        map.entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(SeriesBuf::new(self.max_bars))))
            .clone()
    }

    /// Append a closed bar arriving from the live exchange feed.
    ///
    /// Contiguity is enforced: a bar that does not continue the series
    /// (`open_time != last.close_time`) resets the ring and flags it for
    /// backfill. Emits a [`BarClose`] event on successful append.
    pub fn push_closed(&self, key: &KlineKey, kline: Kline) {
        if kline.open_time >= kline.close_time {
            warn!(key = %key, open_time = kline.open_time, "rejecting kline with inverted time range");
            return;
        }

        let entry = self.entry(key);
        let mut buf = entry.write();

        let last_times = buf.bars.back().map(|b| (b.open_time, b.close_time));
        match last_times {
            None => buf.bars.push_back(kline.clone()),
            Some((last_open, _)) if kline.open_time == last_open => {
                // Finalized correction of the most recent bar.
                if let Some(slot) = buf.bars.back_mut() {
                    *slot = kline.clone();
                }
            }
            Some((_, last_close)) if kline.open_time == last_close => {
                buf.bars.push_back(kline.clone());
            }
            Some((_, last_close)) if kline.open_time > last_close => {
                warn!(
                    key = %key,
                    expected = last_close,
                    got = kline.open_time,
                    "feed gap detected -- resetting series for backfill"
                );
                buf.bars.clear();
                buf.bars.push_back(kline.clone());
                buf.needs_backfill = true;
            }
            Some(_) => {
                // Out-of-order stale bar; the seeder owns historical writes.
                debug!(key = %key, open_time = kline.open_time, "ignoring stale kline");
                return;
            }
        }

        while buf.bars.len() > self.max_bars {
            buf.bars.pop_front();
        }
        drop(buf);

        let _ = self.closes.send(BarClose {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
            open_time: kline.open_time,
            close_time: kline.close_time,
        });
    }

    /// Replace a series wholesale with freshly fetched history (oldest first).
    /// Never emits bar-close events.
    pub fn seed(&self, key: &KlineKey, klines: Vec<Kline>) {
        let entry = self.entry(key);
        let mut buf = entry.write();
        buf.bars.clear();
        for k in klines {
            if let Some(last) = buf.bars.back() {
                if k.open_time != last.close_time {
                    continue; // REST payloads are contiguous; drop any stragglers.
                }
            }
            buf.bars.push_back(k);
        }
        while buf.bars.len() > self.max_bars {
            buf.bars.pop_front();
        }
        buf.needs_backfill = false;
    }

    /// Return the most recent `count` bars (oldest-first) as a shared snapshot.
    pub fn snapshot(&self, key: &KlineKey, count: usize) -> Arc<Vec<Kline>> {
        let maybe = self.series.read().get(key).cloned();
        match maybe {
            Some(entry) => {
                let buf = entry.read();
                let start = buf.bars.len().saturating_sub(count);
                Arc::new(buf.bars.iter().skip(start).cloned().collect())
            }
            None => Arc::new(Vec::new()),
        }
    }

    /// Number of bars stored for a key.
    pub fn len(&self, key: &KlineKey) -> usize {
        self.series
            .read()
            .get(key)
            .map_or(0, |entry| entry.read().bars.len())
    }

    /// The most recent bar, if any.
    pub fn latest(&self, key: &KlineKey) -> Option<Kline> {
        self.series
            .read()
            .get(key)
            .and_then(|entry| entry.read().bars.back().cloned())
    }

    /// Keys whose series were reset by a feed gap (or never seeded) and need
    /// a REST refill.
    pub fn backfill_queue(&self) -> Vec<KlineKey> {
        self.series
            .read()
            .iter()
            .filter(|(_, entry)| entry.read().needs_backfill)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Pre-register a series so the backfill sweep will seed it.
    pub fn track(&self, key: &KlineKey) {
        self.entry(key);
    }

    /// Drop series for symbols that left the active universe.
    pub fn retain_symbols(&self, symbols: &[String]) {
        let mut map = self.series.write();
        map.retain(|key, _| symbols.iter().any(|s| s == &key.symbol));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
