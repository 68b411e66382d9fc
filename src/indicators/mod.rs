// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators exposed to filter
// snippets. Every public function returns `Option<T>` (or an empty series) so
// callers are forced to handle insufficient-data and numerical-edge-case
// scenarios; none of them panic or produce NaN.

pub mod atr;
pub mod bollinger;
pub mod ma;
pub mod macd;
pub mod patterns;
pub mod rsi;
pub mod stochastic;
pub mod supertrend;
pub mod volume;

use crate::market_data::Kline;

/// Series shorter than this are not worth evaluating at all; the scheduler
/// skips the symbol instead of running the filter.
pub const MIN_SERIES_LEN: usize = 2;

// ---------------------------------------------------------------------------
// Price / volume selectors
// ---------------------------------------------------------------------------

pub fn latest_close(klines: &[Kline]) -> Option<f64> {
    klines.last().map(|k| k.close).filter(|v| v.is_finite())
}

pub fn latest_high(klines: &[Kline]) -> Option<f64> {
    klines.last().map(|k| k.high).filter(|v| v.is_finite())
}

pub fn latest_low(klines: &[Kline]) -> Option<f64> {
    klines.last().map(|k| k.low).filter(|v| v.is_finite())
}

pub fn latest_volume(klines: &[Kline]) -> Option<f64> {
    klines.last().map(|k| k.volume).filter(|v| v.is_finite())
}

/// Extract the close series, oldest first.
pub fn closes(klines: &[Kline]) -> Vec<f64> {
    klines.iter().map(|k| k.close).collect()
}

// ---------------------------------------------------------------------------
// Window extrema / averages
// ---------------------------------------------------------------------------

/// Highest high over the last `n` bars.
pub fn highest_high(klines: &[Kline], n: usize) -> Option<f64> {
    if n == 0 || klines.is_empty() {
        return None;
    }
    let start = klines.len().saturating_sub(n);
    klines[start..]
        .iter()
        .map(|k| k.high)
        .fold(None, |acc: Option<f64>, h| {
            if !h.is_finite() {
                acc
            } else {
                Some(acc.map_or(h, |a| a.max(h)))
            }
        })
}

/// Lowest low over the last `n` bars.
pub fn lowest_low(klines: &[Kline], n: usize) -> Option<f64> {
    if n == 0 || klines.is_empty() {
        return None;
    }
    let start = klines.len().saturating_sub(n);
    klines[start..]
        .iter()
        .map(|k| k.low)
        .fold(None, |acc: Option<f64>, l| {
            if !l.is_finite() {
                acc
            } else {
                Some(acc.map_or(l, |a| a.min(l)))
            }
        })
}

/// Mean base-asset volume over the last `n` bars. Requires at least `n` bars.
pub fn average_volume(klines: &[Kline], n: usize) -> Option<f64> {
    if n == 0 || klines.len() < n {
        return None;
    }
    let window = &klines[klines.len() - n..];
    let sum: f64 = window.iter().map(|k| k.volume).sum();
    let avg = sum / n as f64;
    avg.is_finite().then_some(avg)
}

/// Percentage change from `from` to `to`. No-value when `from` is zero or
/// either input is non-finite.
pub fn percent_change(from: f64, to: f64) -> Option<f64> {
    if from == 0.0 || !from.is_finite() || !to.is_finite() {
        return None;
    }
    let pct = (to - from) / from * 100.0;
    pct.is_finite().then_some(pct)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod test_util {
    use crate::market_data::Kline;

    /// Build a closed test bar with the given OHLCV values.
    pub fn kline(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Kline {
        Kline {
            open_time,
            open,
            high,
            low,
            close,
            volume,
            close_time: open_time + 60_000,
            quote_volume: volume * close,
            trades: 10,
            taker_buy_base: volume / 2.0,
            taker_buy_quote: volume * close / 2.0,
        }
    }

    /// A flat series of `n` bars around `price`.
    pub fn flat_series(n: usize, price: f64) -> Vec<Kline> {
        (0..n)
            .map(|i| kline(i as i64 * 60_000, price, price + 1.0, price - 1.0, price, 100.0))
            .collect()
    }

    /// Bars whose closes walk through `closes`, with a small range each.
    pub fn series_from_closes(closes: &[f64]) -> Vec<Kline> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| kline(i as i64 * 60_000, c, c + 1.0, c - 1.0, c, 100.0))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn selectors_on_empty_input() {
        assert_eq!(latest_close(&[]), None);
        assert_eq!(latest_high(&[]), None);
        assert_eq!(latest_low(&[]), None);
        assert_eq!(latest_volume(&[]), None);
    }

    #[test]
    fn selectors_return_last_bar() {
        let series = series_from_closes(&[1.0, 2.0, 3.0]);
        assert_eq!(latest_close(&series), Some(3.0));
        assert_eq!(latest_high(&series), Some(4.0));
        assert_eq!(latest_low(&series), Some(2.0));
        assert_eq!(latest_volume(&series), Some(100.0));
    }

    #[test]
    fn extrema_over_window() {
        let series = series_from_closes(&[5.0, 9.0, 3.0, 7.0]);
        // Last 2 bars: closes 3.0, 7.0 => highs 4.0/8.0, lows 2.0/6.0.
        assert_eq!(highest_high(&series, 2), Some(8.0));
        assert_eq!(lowest_low(&series, 2), Some(2.0));
        // Window larger than series falls back to the whole slice.
        assert_eq!(highest_high(&series, 100), Some(10.0));
    }

    #[test]
    fn extrema_zero_window_is_no_value() {
        let series = flat_series(5, 100.0);
        assert_eq!(highest_high(&series, 0), None);
        assert_eq!(lowest_low(&series, 0), None);
    }

    #[test]
    fn average_volume_requires_full_window() {
        let series = flat_series(5, 100.0);
        assert_eq!(average_volume(&series, 5), Some(100.0));
        assert_eq!(average_volume(&series, 6), None);
        assert_eq!(average_volume(&series, 0), None);
    }

    #[test]
    fn percent_change_edges() {
        assert_eq!(percent_change(100.0, 110.0), Some(10.0));
        assert_eq!(percent_change(100.0, 90.0), Some(-10.0));
        assert_eq!(percent_change(0.0, 50.0), None);
        assert_eq!(percent_change(f64::NAN, 50.0), None);
        assert_eq!(percent_change(100.0, f64::INFINITY), None);
    }

    #[test]
    fn extrema_skip_nan_bars() {
        let mut series = series_from_closes(&[5.0, 6.0, 7.0]);
        series[1].high = f64::NAN;
        series[1].low = f64::NAN;
        assert_eq!(highest_high(&series, 3), Some(8.0));
        assert_eq!(lowest_low(&series, 3), Some(4.0));
    }
}
