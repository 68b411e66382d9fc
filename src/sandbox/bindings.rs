// =============================================================================
// Sandbox Bindings — what a filter snippet can see
// =============================================================================
//
// Two boot-time module tables are exposed to every evaluation:
//
//   * a global module carrying the `MarketData` surface (`data.symbol`,
//     `data.price`, `data.klines("15m")`, series helpers), and
//   * the static `indicators` module -- the only function namespace snippets
//     may call (`indicators::rsi(series, 14)`).
//
// Indicator results use `()` as the no-value sentinel: scripts test
// `rsi != ()` before comparing. Numbers are never NaN.
// =============================================================================

use std::sync::Arc;

use rhai::{Dynamic, Module};

use crate::indicators;
use crate::market_data::{Kline, MarketData};
use crate::types::Timeframe;

// ---------------------------------------------------------------------------
// Script-visible types
// ---------------------------------------------------------------------------

/// The `data` constant in a snippet's scope.
#[derive(Debug, Clone)]
pub struct ScriptMarketData(pub Arc<MarketData>);

/// A shared, read-only slice of closed bars for one timeframe.
#[derive(Debug, Clone, Default)]
pub struct KlineSeries(pub Arc<Vec<Kline>>);

impl KlineSeries {
    fn bars(&self) -> &[Kline] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Dynamic conversion helpers
// ---------------------------------------------------------------------------

/// `Some(v)` becomes a float, `None` becomes unit (the no-value sentinel).
fn opt_value(v: Option<f64>) -> Dynamic {
    match v {
        Some(x) => Dynamic::from_float(x),
        None => Dynamic::UNIT,
    }
}

fn float_series(series: Vec<f64>) -> Dynamic {
    let array: rhai::Array = series.into_iter().map(Dynamic::from_float).collect();
    Dynamic::from_array(array)
}

/// A period argument from a script: integers only, and non-positive values
/// mean "no sensible answer", not an error.
fn period(n: i64) -> Option<usize> {
    (n > 0).then_some(n as usize)
}

/// Numeric argument that may arrive as either int or float from the script.
fn numeric(d: &Dynamic) -> Option<f64> {
    d.as_float()
        .ok()
        .or_else(|| d.as_int().ok().map(|i| i as f64))
}

// ---------------------------------------------------------------------------
// Global bindings module (MarketData surface)
// ---------------------------------------------------------------------------

/// Build the global module holding the `MarketData` and series surface.
/// Called once at boot; the result is shared by every evaluation engine.
pub fn bindings_module() -> Module {
    let mut m = Module::new();

    m.set_getter_fn("symbol", |md: &mut ScriptMarketData| Ok(md.0.symbol.clone()));
    m.set_getter_fn("price", |md: &mut ScriptMarketData| {
        Ok(md.0.ticker.last_price)
    });
    m.set_getter_fn("change_pct", |md: &mut ScriptMarketData| {
        Ok(md.0.ticker.price_change_pct)
    });
    m.set_getter_fn("quote_volume", |md: &mut ScriptMarketData| {
        Ok(md.0.ticker.quote_volume)
    });

    // data.klines("15m") -- unknown timeframes yield an empty series, which
    // every indicator then maps to no-value.
    m.set_native_fn("klines", |md: &mut ScriptMarketData, tf: &str| {
        let series = match Timeframe::parse(tf) {
            Some(tf) => md.0.series(tf),
            None => Arc::new(Vec::new()),
        };
        Ok(KlineSeries(series))
    });

    m.set_native_fn("len", |s: &mut KlineSeries| Ok(s.0.len() as i64));
    m.set_native_fn("is_empty", |s: &mut KlineSeries| Ok(s.0.is_empty()));

    // Shadows the standard package's `timestamp`: filters are deterministic
    // over their input and get no clock.
    m.set_native_fn("timestamp", || -> Result<Dynamic, Box<rhai::EvalAltResult>> {
        Err("time functions are not available in filters".into())
    });

    m
}

// ---------------------------------------------------------------------------
// Indicators module
// ---------------------------------------------------------------------------

/// Build the static `indicators` module. This is the complete, fixed set of
/// functions a snippet may call; nothing else is reachable.
pub fn indicators_module() -> Module {
    let mut m = Module::new();

    // ── Selectors ───────────────────────────────────────────────────────
    m.set_native_fn("latest_close", |s: KlineSeries| {
        Ok(opt_value(indicators::latest_close(s.bars())))
    });
    m.set_native_fn("latest_high", |s: KlineSeries| {
        Ok(opt_value(indicators::latest_high(s.bars())))
    });
    m.set_native_fn("latest_low", |s: KlineSeries| {
        Ok(opt_value(indicators::latest_low(s.bars())))
    });
    m.set_native_fn("latest_volume", |s: KlineSeries| {
        Ok(opt_value(indicators::latest_volume(s.bars())))
    });

    // ── Moving averages ─────────────────────────────────────────────────
    m.set_native_fn("sma", |s: KlineSeries, n: i64| {
        Ok(opt_value(period(n).and_then(|p| {
            indicators::ma::current_sma(&indicators::closes(s.bars()), p)
        })))
    });
    m.set_native_fn("ema", |s: KlineSeries, n: i64| {
        Ok(opt_value(period(n).and_then(|p| {
            indicators::ma::current_ema(&indicators::closes(s.bars()), p)
        })))
    });
    m.set_native_fn("sma_series", |s: KlineSeries, n: i64| {
        let series = period(n)
            .map(|p| indicators::ma::calculate_sma(&indicators::closes(s.bars()), p))
            .unwrap_or_default();
        Ok(float_series(series))
    });
    m.set_native_fn("ema_series", |s: KlineSeries, n: i64| {
        let series = period(n)
            .map(|p| indicators::ma::calculate_ema(&indicators::closes(s.bars()), p))
            .unwrap_or_default();
        Ok(float_series(series))
    });

    // ── RSI ─────────────────────────────────────────────────────────────
    m.set_native_fn("rsi", |s: KlineSeries, n: i64| {
        Ok(opt_value(period(n).and_then(|p| {
            indicators::rsi::current_rsi(&indicators::closes(s.bars()), p)
        })))
    });
    m.set_native_fn("rsi_series", |s: KlineSeries, n: i64| {
        let series = period(n)
            .map(|p| indicators::rsi::calculate_rsi(&indicators::closes(s.bars()), p))
            .unwrap_or_default();
        Ok(float_series(series))
    });

    // ── MACD ────────────────────────────────────────────────────────────
    m.set_native_fn(
        "macd",
        |s: KlineSeries, fast: i64, slow: i64, signal: i64| {
            let point = match (period(fast), period(slow), period(signal)) {
                (Some(f), Some(sl), Some(sig)) => {
                    indicators::macd::current_macd(&indicators::closes(s.bars()), f, sl, sig)
                }
                _ => None,
            };
            Ok(match point {
                Some(p) => {
                    let mut map = rhai::Map::new();
                    map.insert("macd".into(), Dynamic::from_float(p.macd));
                    map.insert("signal".into(), Dynamic::from_float(p.signal));
                    map.insert("histogram".into(), Dynamic::from_float(p.histogram));
                    Dynamic::from_map(map)
                }
                None => Dynamic::UNIT,
            })
        },
    );

    // ── Stochastic ──────────────────────────────────────────────────────
    m.set_native_fn("stochastic", |s: KlineSeries, k: i64, d: i64| {
        let result = match (period(k), period(d)) {
            (Some(kp), Some(dp)) => indicators::stochastic::current_stochastic(s.bars(), kp, dp),
            _ => None,
        };
        Ok(match result {
            Some((k_val, d_val)) => {
                let mut map = rhai::Map::new();
                map.insert("k".into(), Dynamic::from_float(k_val));
                map.insert("d".into(), Dynamic::from_float(d_val));
                Dynamic::from_map(map)
            }
            None => Dynamic::UNIT,
        })
    });

    // ── Bollinger ───────────────────────────────────────────────────────
    m.set_native_fn("bollinger", |s: KlineSeries, n: i64, num_std: Dynamic| {
        let bands = match (period(n), numeric(&num_std)) {
            (Some(p), Some(k)) => {
                indicators::bollinger::current_bollinger(&indicators::closes(s.bars()), p, k)
            }
            _ => None,
        };
        Ok(match bands {
            Some(b) => {
                let mut map = rhai::Map::new();
                map.insert("upper".into(), Dynamic::from_float(b.upper));
                map.insert("middle".into(), Dynamic::from_float(b.middle));
                map.insert("lower".into(), Dynamic::from_float(b.lower));
                map.insert("width".into(), Dynamic::from_float(b.width));
                Dynamic::from_map(map)
            }
            None => Dynamic::UNIT,
        })
    });

    // ── ATR ─────────────────────────────────────────────────────────────
    m.set_native_fn("atr", |s: KlineSeries, n: i64| {
        Ok(opt_value(period(n).and_then(|p| {
            indicators::atr::current_atr(s.bars(), p)
        })))
    });

    // ── SuperTrend ──────────────────────────────────────────────────────
    m.set_native_fn("supertrend", |s: KlineSeries, n: i64, mult: Dynamic| {
        let st = match (period(n), numeric(&mult)) {
            (Some(p), Some(k)) => indicators::supertrend::current_supertrend(s.bars(), p, k),
            _ => None,
        };
        Ok(match st {
            Some(st) => {
                let mut map = rhai::Map::new();
                map.insert("value".into(), Dynamic::from_float(st.value));
                map.insert("direction".into(), Dynamic::from_int(st.direction as i64));
                Dynamic::from_map(map)
            }
            None => Dynamic::UNIT,
        })
    });

    // ── Volume ──────────────────────────────────────────────────────────
    m.set_native_fn("obv", |s: KlineSeries| {
        Ok(opt_value(indicators::volume::current_obv(s.bars())))
    });
    m.set_native_fn("vwap", |s: KlineSeries| {
        Ok(opt_value(indicators::volume::current_vwap(s.bars())))
    });
    m.set_native_fn("average_volume", |s: KlineSeries, n: i64| {
        Ok(opt_value(period(n).and_then(|p| {
            indicators::average_volume(s.bars(), p)
        })))
    });

    // ── Patterns / extrema / utilities ──────────────────────────────────
    m.set_native_fn("engulfing", |s: KlineSeries| {
        Ok(indicators::patterns::current_engulfing(s.bars()).to_string())
    });
    m.set_native_fn("highest_high", |s: KlineSeries, n: i64| {
        Ok(opt_value(period(n).and_then(|p| {
            indicators::highest_high(s.bars(), p)
        })))
    });
    m.set_native_fn("lowest_low", |s: KlineSeries, n: i64| {
        Ok(opt_value(period(n).and_then(|p| {
            indicators::lowest_low(s.bars(), p)
        })))
    });
    m.set_native_fn("percent_change", |from: Dynamic, to: Dynamic| {
        Ok(opt_value(match (numeric(&from), numeric(&to)) {
            (Some(f), Some(t)) => indicators::percent_change(f, t),
            _ => None,
        }))
    });

    m
}
