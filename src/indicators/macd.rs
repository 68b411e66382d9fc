// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line  = EMA(fast) - EMA(slow)
// Signal     = EMA(signal) of the MACD line
// Histogram  = MACD - Signal
//
// Standard parameters are (12, 26, 9); the caller supplies all three.
// =============================================================================

use crate::indicators::ma::calculate_ema;

/// One point of the MACD triple.
#[derive(Debug, Clone, PartialEq)]
pub struct MacdPoint {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the aligned MACD series. One point per close once both the slow
/// EMA and the signal EMA have enough history; empty when the input is too
/// short or any period is zero.
pub fn calculate_macd(
    closes: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Vec<MacdPoint> {
    if fast_period == 0 || slow_period == 0 || signal_period == 0 {
        return Vec::new();
    }
    if fast_period >= slow_period || closes.len() < slow_period + signal_period {
        return Vec::new();
    }

    let fast = calculate_ema(closes, fast_period);
    let slow = calculate_ema(closes, slow_period);
    if slow.is_empty() {
        return Vec::new();
    }

    // Align: the slow series starts (slow_period - fast_period) elements later.
    let offset = slow_period - fast_period;
    if fast.len() <= offset {
        return Vec::new();
    }
    let macd_line: Vec<f64> = fast[offset..]
        .iter()
        .zip(slow.iter())
        .map(|(f, s)| f - s)
        .collect();

    let signal_line = calculate_ema(&macd_line, signal_period);
    if signal_line.is_empty() {
        return Vec::new();
    }

    // Signal starts (signal_period - 1) elements into the MACD line.
    let macd_offset = macd_line.len() - signal_line.len();
    macd_line[macd_offset..]
        .iter()
        .zip(signal_line.iter())
        .filter(|(m, s)| m.is_finite() && s.is_finite())
        .map(|(&macd, &signal)| MacdPoint {
            macd,
            signal,
            histogram: macd - signal,
        })
        .collect()
}

/// Most recent MACD triple.
pub fn current_macd(
    closes: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Option<MacdPoint> {
    calculate_macd(closes, fast_period, slow_period, signal_period)
        .last()
        .cloned()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 12, 26, 9).is_empty());
        assert!(current_macd(&closes, 12, 26, 9).is_none());
    }

    #[test]
    fn macd_zero_period_rejected() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 0, 26, 9).is_empty());
        assert!(calculate_macd(&closes, 12, 0, 9).is_empty());
        assert!(calculate_macd(&closes, 12, 26, 0).is_empty());
    }

    #[test]
    fn macd_fast_must_be_faster() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 26, 12, 9).is_empty());
        assert!(calculate_macd(&closes, 12, 12, 9).is_empty());
    }

    #[test]
    fn macd_uptrend_is_positive() {
        let closes: Vec<f64> = (1..=120).map(|x| x as f64).collect();
        let point = current_macd(&closes, 12, 26, 9).unwrap();
        // In a steady uptrend the fast EMA sits above the slow EMA.
        assert!(point.macd > 0.0, "MACD should be positive, got {}", point.macd);
    }

    #[test]
    fn macd_flat_market_is_zero() {
        let closes = vec![100.0; 120];
        let point = current_macd(&closes, 12, 26, 9).unwrap();
        assert!(point.macd.abs() < 1e-9);
        assert!(point.signal.abs() < 1e-9);
        assert!(point.histogram.abs() < 1e-9);
    }

    #[test]
    fn histogram_is_macd_minus_signal() {
        let closes: Vec<f64> = (0..150)
            .map(|i| 100.0 + (i as f64 * 0.3).sin() * 10.0)
            .collect();
        for point in calculate_macd(&closes, 12, 26, 9) {
            assert!((point.histogram - (point.macd - point.signal)).abs() < 1e-12);
        }
    }

    #[test]
    fn macd_series_alignment() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let series = calculate_macd(&closes, 12, 26, 9);
        // 100 closes => slow EMA has 75 points => MACD line 75 => signal 67.
        assert_eq!(series.len(), 67);
    }
}
