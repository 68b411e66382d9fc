// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA(period), upper/lower = middle ± k * σ where σ is the
// population standard deviation over the window.
// =============================================================================

/// Result of a Bollinger Band calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
}

/// Latest Bollinger Bands for the given closes.
///
/// Returns `None` when:
/// - `period` is zero or there are fewer than `period` closes.
/// - The middle band is zero (degenerate input, width undefined).
/// - Any component is non-finite.
///
/// A flat window produces a zero-width band (upper == middle == lower),
/// never NaN.
pub fn current_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerBands> {
    if period == 0 || closes.len() < period || !num_std.is_finite() {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 || !middle.is_finite() {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width = (upper - lower) / middle * 100.0;

    (upper.is_finite() && lower.is_finite() && width.is_finite()).then_some(BollingerBands {
        upper,
        middle,
        lower,
        width,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_basic() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = current_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
        assert!(bb.width > 0.0);
        assert!((bb.middle - 10.5).abs() < 1e-10);
    }

    #[test]
    fn bollinger_insufficient_data() {
        assert!(current_bollinger(&[1.0, 2.0, 3.0], 20, 2.0).is_none());
        assert!(current_bollinger(&[], 20, 2.0).is_none());
    }

    #[test]
    fn bollinger_period_zero() {
        assert!(current_bollinger(&[1.0, 2.0, 3.0], 0, 2.0).is_none());
    }

    #[test]
    fn bollinger_flat_window_is_zero_width() {
        let closes = vec![100.0; 20];
        let bb = current_bollinger(&closes, 20, 2.0).unwrap();
        assert!((bb.width - 0.0).abs() < 1e-10);
        assert!((bb.upper - bb.lower).abs() < 1e-10);
        assert!((bb.upper - 100.0).abs() < 1e-10);
    }

    #[test]
    fn bollinger_nan_is_no_value() {
        let mut closes = vec![100.0; 20];
        closes[10] = f64::NAN;
        assert!(current_bollinger(&closes, 20, 2.0).is_none());
        assert!(current_bollinger(&vec![1.0; 20], 20, f64::NAN).is_none());
    }

    #[test]
    fn bollinger_uses_only_last_window() {
        let mut closes = vec![1_000_000.0; 10];
        closes.extend(vec![100.0; 20]);
        let bb = current_bollinger(&closes, 20, 2.0).unwrap();
        assert!((bb.middle - 100.0).abs() < 1e-10);
    }
}
