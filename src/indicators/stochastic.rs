// =============================================================================
// Stochastic Oscillator
// =============================================================================
//
// %K = 100 * (close - lowestLow(kPeriod)) / (highestHigh(kPeriod) - lowestLow(kPeriod))
// %D = SMA(dPeriod) of %K
//
// A zero-width high/low range yields no-value (the ratio is undefined), never
// NaN.
// =============================================================================

use crate::market_data::Kline;

/// Latest `(K, D)` pair, or `None` when fewer than
/// `k_period + d_period - 1` bars are available or the range degenerates.
pub fn current_stochastic(
    klines: &[Kline],
    k_period: usize,
    d_period: usize,
) -> Option<(f64, f64)> {
    let series = percent_k_series(klines, k_period)?;
    if d_period == 0 || series.len() < d_period {
        return None;
    }

    let k = *series.last()?;
    let window = &series[series.len() - d_period..];
    let d = window.iter().sum::<f64>() / d_period as f64;

    (k.is_finite() && d.is_finite()).then_some((k, d))
}

/// Full %K series, one value per bar starting at index `k_period - 1`.
fn percent_k_series(klines: &[Kline], k_period: usize) -> Option<Vec<f64>> {
    if k_period == 0 || klines.len() < k_period {
        return None;
    }

    let mut series = Vec::with_capacity(klines.len() - k_period + 1);
    for end in k_period..=klines.len() {
        let window = &klines[end - k_period..end];
        let highest = window.iter().map(|k| k.high).fold(f64::NEG_INFINITY, f64::max);
        let lowest = window.iter().map(|k| k.low).fold(f64::INFINITY, f64::min);
        let close = window[window.len() - 1].close;

        let range = highest - lowest;
        if range == 0.0 || !range.is_finite() {
            return None;
        }
        let k = 100.0 * (close - lowest) / range;
        if !k.is_finite() {
            return None;
        }
        series.push(k);
    }
    Some(series)
}
