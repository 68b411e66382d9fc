// =============================================================================
// Volume Indicators — OBV and VWAP
// =============================================================================
//
// OBV (On-Balance Volume) accumulates volume signed by the close-to-close
// direction. VWAP is the volume-weighted average of the typical price
// (H + L + C) / 3, anchored at the start of the supplied slice.
// =============================================================================

use crate::market_data::Kline;

/// Latest On-Balance Volume value, accumulated over the whole slice.
///
/// Needs at least two bars (one close-to-close comparison). Returns `None`
/// on insufficient or non-finite input.
pub fn current_obv(klines: &[Kline]) -> Option<f64> {
    if klines.len() < 2 {
        return None;
    }

    let mut obv = 0.0_f64;
    for pair in klines.windows(2) {
        let prev = &pair[0];
        let bar = &pair[1];
        if !bar.close.is_finite() || !prev.close.is_finite() || !bar.volume.is_finite() {
            return None;
        }
        if bar.close > prev.close {
            obv += bar.volume;
        } else if bar.close < prev.close {
            obv -= bar.volume;
        }
    }

    obv.is_finite().then_some(obv)
}

/// Volume-weighted average price over the slice (session anchor = slice start).
///
/// Returns `None` on empty input, zero cumulative volume, or non-finite data.
pub fn current_vwap(klines: &[Kline]) -> Option<f64> {
    if klines.is_empty() {
        return None;
    }

    let mut pv_sum = 0.0_f64;
    let mut vol_sum = 0.0_f64;
    for bar in klines {
        if !bar.high.is_finite()
            || !bar.low.is_finite()
            || !bar.close.is_finite()
            || !bar.volume.is_finite()
        {
            return None;
        }
        let typical = (bar.high + bar.low + bar.close) / 3.0;
        pv_sum += typical * bar.volume;
        vol_sum += bar.volume;
    }

    if vol_sum == 0.0 {
        return None;
    }
    let vwap = pv_sum / vol_sum;
    vwap.is_finite().then_some(vwap)
}
