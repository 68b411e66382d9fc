// =============================================================================
// SuperTrend
// =============================================================================
//
// Bands are anchored at the bar midpoint and offset by a multiple of ATR:
//   basicUpper = (H + L) / 2 + multiplier * ATR
//   basicLower = (H + L) / 2 - multiplier * ATR
//
// Final bands ratchet (an upper band may only fall while price stays below
// it, a lower band may only rise while price stays above it). Direction is
// +1 while price rides the lower band, -1 while it rides the upper band; the
// indicator value is the active band.
// =============================================================================

use crate::market_data::Kline;

/// Latest SuperTrend reading.
#[derive(Debug, Clone, PartialEq)]
pub struct SuperTrend {
    pub value: f64,
    /// +1 for an up-trend (price above the band), -1 for a down-trend.
    pub direction: i8,
}

/// Wilder-smoothed ATR series, one value per bar starting at index `period`.
fn wilder_atr_series(klines: &[Kline], period: usize) -> Vec<f64> {
    if period == 0 || klines.len() < period + 1 {
        return Vec::new();
    }

    let mut tr = Vec::with_capacity(klines.len() - 1);
    for i in 1..klines.len() {
        if !klines[i].high.is_finite()
            || !klines[i].low.is_finite()
            || !klines[i - 1].close.is_finite()
        {
            return Vec::new();
        }
        let hl = klines[i].high - klines[i].low;
        let hc = (klines[i].high - klines[i - 1].close).abs();
        let lc = (klines[i].low - klines[i - 1].close).abs();
        tr.push(hl.max(hc).max(lc));
    }

    let period_f = period as f64;
    let mut atr = tr[..period].iter().sum::<f64>() / period_f;
    if !atr.is_finite() {
        return Vec::new();
    }

    let mut series = Vec::with_capacity(tr.len() - period + 1);
    series.push(atr);
    for &t in &tr[period..] {
        atr = (atr * (period_f - 1.0) + t) / period_f;
        if !atr.is_finite() {
            return series;
        }
        series.push(atr);
    }
    series
}

/// Latest SuperTrend value and direction.
///
/// Returns `None` when there are fewer than `period + 1` bars, the multiplier
/// is non-finite, or the calculation degenerates.
pub fn current_supertrend(
    klines: &[Kline],
    period: usize,
    multiplier: f64,
) -> Option<SuperTrend> {
    if !multiplier.is_finite() || multiplier < 0.0 {
        return None;
    }
    let atr_series = wilder_atr_series(klines, period);
    if atr_series.is_empty() {
        return None;
    }

    // ATR at series[j] corresponds to bar index period + j.
    let start = period;
    let mut final_upper = f64::NAN;
    let mut final_lower = f64::NAN;
    let mut direction: i8 = 1;
    let mut value = f64::NAN;

    for (j, &atr) in atr_series.iter().enumerate() {
        let i = start + j;
        let bar = &klines[i];
        let mid = (bar.high + bar.low) / 2.0;
        let basic_upper = mid + multiplier * atr;
        let basic_lower = mid - multiplier * atr;

        if !basic_upper.is_finite() || !basic_lower.is_finite() {
            return None;
        }

        let prev_close = klines[i - 1].close;

        final_upper = if final_upper.is_nan() || basic_upper < final_upper || prev_close > final_upper
        {
            basic_upper
        } else {
            final_upper
        };
        final_lower = if final_lower.is_nan() || basic_lower > final_lower || prev_close < final_lower
        {
            basic_lower
        } else {
            final_lower
        };

        direction = if direction >= 0 {
            if bar.close < final_lower {
                -1
            } else {
                1
            }
        } else if bar.close > final_upper {
            1
        } else {
            -1
        };

        value = if direction == 1 { final_lower } else { final_upper };
    }

    value.is_finite().then_some(SuperTrend { value, direction })
}
