// =============================================================================
// Binance kline WebSocket ingestion
// =============================================================================
//
// One combined-stream connection carries up to STREAMS_PER_CONNECTION
// (symbol, timeframe) pairs; the supervisor chunks the active universe across
// as many connections as needed and rebuilds them whenever the universe
// changes. Only closed bars reach the cache -- the screener never evaluates a
// still-open bar, and ticker prices come from the universe refresher.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::market_data::{Kline, KlineCache, KlineKey, SymbolUniverse};
use crate::types::Timeframe;

const WS_BASE: &str = "wss://stream.binance.com:9443";

/// Binance caps combined streams at 1024 per connection; we stay well under.
const STREAMS_PER_CONNECTION: usize = 200;

/// How often the supervisor checks for a universe change.
const SUPERVISE_INTERVAL_SECS: u64 = 30;

/// Delay before reconnecting a dropped socket.
const RECONNECT_DELAY_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// URL + message parsing
// ---------------------------------------------------------------------------

/// Build the combined-stream URL for a chunk of (symbol, timeframe) pairs.
pub fn build_stream_url(chunk: &[(String, Timeframe)]) -> String {
    let streams: Vec<String> = chunk
        .iter()
        .map(|(sym, tf)| format!("{}@kline_{}", sym.to_lowercase(), tf.as_str()))
        .collect();
    format!("{WS_BASE}/stream?streams={}", streams.join("/"))
}

/// Helper: Binance sends numeric values as JSON strings inside kline objects.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Parse one kline event from the combined-stream envelope:
///
/// ```json
/// { "stream": "btcusdt@kline_1m", "data": { "s": "BTCUSDT", "k": { ... } } }
/// ```
///
/// Returns the key, the normalized bar, and whether the bar is closed.
/// Binance's inclusive close timestamp is normalized to an exclusive end
/// (`+1 ms`) so that series contiguity is `next.open_time == prev.close_time`.
pub fn parse_kline_event(text: &str) -> Result<(KlineKey, Kline, bool)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    // Support both combined-stream envelope and direct single-stream payload.
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let k = &data["k"];

    let interval = k["i"].as_str().context("missing field k.i")?;
    let timeframe = Timeframe::parse(interval)
        .with_context(|| format!("unknown interval in feed: {interval}"))?;

    let open_time = k["t"].as_i64().context("missing field k.t")?;
    let close_time = k["T"].as_i64().context("missing field k.T")? + 1;

    let kline = Kline {
        open_time,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
        close_time,
        quote_volume: parse_string_f64(&k["q"], "k.q")?,
        trades: k["n"].as_u64().context("missing field k.n")?,
        taker_buy_base: parse_string_f64(&k["V"], "k.V")?,
        taker_buy_quote: parse_string_f64(&k["Q"], "k.Q")?,
    };

    let is_closed = k["x"].as_bool().context("missing field k.x")?;
    let key = KlineKey { symbol, timeframe };
    Ok((key, kline, is_closed))
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// Run one combined-stream connection until it drops, feeding closed bars
/// into `cache`. The caller owns reconnection.
pub async fn run_stream_chunk(
    chunk: &[(String, Timeframe)],
    cache: &Arc<KlineCache>,
) -> Result<()> {
    let url = build_stream_url(chunk);
    info!(streams = chunk.len(), "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to kline WebSocket")?;

    info!(streams = chunk.len(), "kline WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_kline_event(&text) {
                        Ok((key, kline, true)) => {
                            debug!(key = %key, close = kline.close, "bar closed");
                            cache.push_closed(&key, kline);
                        }
                        Ok((_, _, false)) => {
                            // Open-bar tick; the screener only evaluates
                            // closed bars.
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse kline message");
                        }
                    }
                }
                // Ping/Pong/Binary/Close frames are handled by tungstenite.
            }
            Some(Err(e)) => {
                error!(error = %e, "kline WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!("kline WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Split the current universe into connection-sized chunks of
/// (symbol, timeframe) pairs.
fn plan_chunks(symbols: &[String]) -> Vec<Vec<(String, Timeframe)>> {
    let mut pairs = Vec::with_capacity(symbols.len() * Timeframe::ALL.len());
    for sym in symbols {
        for tf in Timeframe::ALL {
            pairs.push((sym.clone(), tf));
        }
    }
    pairs
        .chunks(STREAMS_PER_CONNECTION)
        .map(|c| c.to_vec())
        .collect()
}

/// Long-lived supervisor: keeps one reconnecting task per chunk alive and
/// rebuilds the whole set whenever the symbol universe changes.
pub async fn run_stream_supervisor(cache: Arc<KlineCache>, universe: Arc<SymbolUniverse>) {
    let mut handles: Vec<tokio::task::JoinHandle<()>> = Vec::new();
    let mut seen_generation = 0u64;
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(SUPERVISE_INTERVAL_SECS));

    loop {
        ticker.tick().await;

        let generation = universe.generation();
        if generation == seen_generation {
            continue;
        }
        seen_generation = generation;

        for handle in handles.drain(..) {
            handle.abort();
        }

        let symbols = universe.symbols();
        if symbols.is_empty() {
            warn!("symbol universe is empty -- no kline streams started");
            continue;
        }

        // Pre-register every series so the backfill sweep seeds history
        // before the first live close arrives, and drop series for symbols
        // that left the universe.
        cache.retain_symbols(&symbols);
        for sym in &symbols {
            for tf in Timeframe::ALL {
                cache.track(&KlineKey::new(sym.clone(), tf));
            }
        }

        let chunks = plan_chunks(&symbols);
        info!(
            symbols = symbols.len(),
            connections = chunks.len(),
            generation,
            "rebuilding kline stream connections"
        );

        for chunk in chunks {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    if let Err(e) = run_stream_chunk(&chunk, &cache).await {
                        error!(error = %e, "kline stream error -- reconnecting in 5s");
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS))
                        .await;
                }
            }));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_contains_all_pairs() {
        let chunk = vec![
            ("BTCUSDT".to_string(), Timeframe::M1),
            ("ETHUSDT".to_string(), Timeframe::H4),
        ];
        let url = build_stream_url(&chunk);
        assert!(url.starts_with("wss://stream.binance.com:9443/stream?streams="));
        assert!(url.contains("btcusdt@kline_1m"));
        assert!(url.contains("ethusdt@kline_4h"));
    }

    #[test]
    fn chunking_splits_large_universes() {
        let symbols: Vec<String> = (0..100).map(|i| format!("SYM{i}USDT")).collect();
        let chunks = plan_chunks(&symbols);
        // 100 symbols x 7 timeframes = 700 pairs => 4 connections of <= 200.
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() <= STREAMS_PER_CONNECTION));
        let total: usize = chunks.iter().map(Vec::len).sum();
        assert_eq!(total, 700);
    }

    #[test]
    fn parse_closed_kline_event() {
        let json = r#"{
            "stream": "btcusdt@kline_15m",
            "data": {
                "e": "kline",
                "s": "BTCUSDT",
                "k": {
                    "t": 1700000000000,
                    "T": 1700000899999,
                    "i": "15m",
                    "o": "37000.00",
                    "h": "37050.00",
                    "l": "36990.00",
                    "c": "37020.00",
                    "v": "123.456",
                    "q": "4567890.12",
                    "n": 1500,
                    "V": "60.123",
                    "Q": "2224455.66",
                    "x": true
                }
            }
        }"#;
        let (key, kline, closed) = parse_kline_event(json).expect("should parse");
        assert_eq!(key.symbol, "BTCUSDT");
        assert_eq!(key.timeframe, Timeframe::M15);
        assert!(closed);
        assert!((kline.close - 37020.0).abs() < f64::EPSILON);
        // Inclusive exchange close is normalized to an exclusive end.
        assert_eq!(kline.close_time, 1700000900000);
        assert_eq!(kline.close_time - kline.open_time, Timeframe::M15.duration_ms());
    }

    #[test]
    fn parse_rejects_unknown_interval() {
        let json = r#"{ "s": "BTCUSDT", "k": { "i": "2m", "t": 0, "T": 1,
            "o": "1", "h": "1", "l": "1", "c": "1", "v": "1", "q": "1",
            "n": 1, "V": "1", "Q": "1", "x": true } }"#;
        assert!(parse_kline_event(json).is_err());
    }

    #[test]
    fn parse_rejects_missing_fields() {
        assert!(parse_kline_event("{}").is_err());
        assert!(parse_kline_event("not json").is_err());
    }
}
