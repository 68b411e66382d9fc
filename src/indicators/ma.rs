// =============================================================================
// Moving Averages — Simple and Exponential
// =============================================================================
//
// SMA is the unweighted mean over the window. EMA weights recent prices more:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
// The first EMA value is seeded with the SMA of the first `period` closes.
// =============================================================================

/// Compute the SMA series for `closes` and `period`. One output per close
/// starting at index `period - 1`; empty when input is too short.
pub fn calculate_sma(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    let mut sum: f64 = closes[..period].iter().sum();
    if !sum.is_finite() {
        return Vec::new();
    }
    result.push(sum / period as f64);

    for i in period..closes.len() {
        sum += closes[i] - closes[i - period];
        let sma = sum / period as f64;
        if !sma.is_finite() {
            break;
        }
        result.push(sma);
    }
    result
}

/// Most recent SMA value.
pub fn current_sma(closes: &[f64], period: usize) -> Option<f64> {
    calculate_sma(closes, period).last().copied()
}

/// Compute the EMA series for `closes` and `period`.
///
/// # Edge cases
/// - `period == 0` => empty vec
/// - `closes.len() < period` => empty vec
/// - Non-finite intermediate values truncate the series.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    // Seed: SMA of the first `period` values.
    let sma: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev_ema = sma;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev_ema * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev_ema = ema;
    }

    result
}

/// Most recent EMA value.
pub fn current_ema(closes: &[f64], period: usize) -> Option<f64> {
    calculate_ema(closes, period).last().copied()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_known_values() {
        let closes = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let sma = calculate_sma(&closes, 3);
        assert_eq!(sma, vec![2.0, 3.0, 4.0]);
        assert_eq!(current_sma(&closes, 3), Some(4.0));
    }

    #[test]
    fn sma_insufficient_data() {
        assert!(calculate_sma(&[1.0, 2.0], 3).is_empty());
        assert!(calculate_sma(&[], 3).is_empty());
        assert_eq!(current_sma(&[1.0], 3), None);
    }

    #[test]
    fn sma_period_zero() {
        assert!(calculate_sma(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn ema_seeded_with_sma() {
        let closes = vec![2.0, 4.0, 6.0];
        let ema = calculate_ema(&closes, 3);
        assert_eq!(ema.len(), 1);
        assert!((ema[0] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn ema_converges_toward_constant() {
        let mut closes = vec![10.0; 5];
        closes.extend(std::iter::repeat(20.0).take(60));
        let ema = current_ema(&closes, 5).unwrap();
        assert!((ema - 20.0).abs() < 0.01, "EMA should converge to 20, got {ema}");
    }

    #[test]
    fn ema_tracks_faster_than_sma() {
        // After a step change, EMA should be closer to the new level.
        let mut closes = vec![10.0; 20];
        closes.extend(std::iter::repeat(20.0).take(5));
        let ema = current_ema(&closes, 10).unwrap();
        let sma = current_sma(&closes, 10).unwrap();
        assert!(ema > sma, "EMA {ema} should exceed SMA {sma} after an up-step");
    }

    #[test]
    fn ema_nan_truncates() {
        let closes = vec![1.0, 2.0, 3.0, f64::NAN, 5.0, 6.0];
        let ema = calculate_ema(&closes, 3);
        // The series stops before the poisoned value propagates.
        assert_eq!(ema.len(), 1);
    }

    #[test]
    fn sma_nan_in_seed_is_empty() {
        let closes = vec![f64::NAN, 2.0, 3.0, 4.0];
        assert!(calculate_sma(&closes, 3).is_empty());
    }
}
