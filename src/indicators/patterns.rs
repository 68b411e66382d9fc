// =============================================================================
// Candlestick Patterns — Engulfing Detector
// =============================================================================
//
// A bullish engulfing pair is a down candle followed by an up candle whose
// body completely contains the previous body; bearish is the mirror image.
// Only the body (open/close) matters, wicks are ignored.
// =============================================================================

use crate::market_data::Kline;

pub const BULLISH: &str = "bullish";
pub const BEARISH: &str = "bearish";

/// Classify the latest two bars.
///
/// Returns `"bullish"`, `"bearish"`, or `""` when no engulfing pattern is
/// present (including short or degenerate input).
pub fn current_engulfing(klines: &[Kline]) -> &'static str {
    let n = klines.len();
    if n < 2 {
        return "";
    }

    let prev = &klines[n - 2];
    let last = &klines[n - 1];

    if !prev.open.is_finite()
        || !prev.close.is_finite()
        || !last.open.is_finite()
        || !last.close.is_finite()
    {
        return "";
    }

    let prev_bearish = prev.close < prev.open;
    let prev_bullish = prev.close > prev.open;
    let last_bullish = last.close > last.open;
    let last_bearish = last.close < last.open;

    // Bullish: down candle engulfed by an up candle.
    if prev_bearish && last_bullish && last.open <= prev.close && last.close >= prev.open {
        return BULLISH;
    }

    // Bearish: up candle engulfed by a down candle.
    if prev_bullish && last_bearish && last.open >= prev.close && last.close <= prev.open {
        return BEARISH;
    }

    ""
}
