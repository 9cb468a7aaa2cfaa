// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA(period), upper/lower = SMA ± k*σ.  The Band Width
// (upper - lower) / middle * 100 is a normalised volatility metric.

/// Result of a Bollinger Band calculation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerResult {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
}

/// Calculate Bollinger Bands over the trailing `period` closes.
///
/// Returns `None` when:
/// - Fewer than `period` data points or `period == 0`.
/// - The middle band is zero (degenerate input).
/// - Any result is non-finite.
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerResult> {
    if period == 0 || closes.len() < period {
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

    width.is_finite().then_some(BollingerResult {
        upper,
        middle,
        lower,
        width,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_basic_ordering() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
        assert!(bb.width > 0.0);
    }

    #[test]
    fn bollinger_insufficient_data() {
        assert!(calculate_bollinger(&[1.0, 2.0, 3.0], 20, 2.0).is_none());
        assert!(calculate_bollinger(&[1.0, 2.0, 3.0], 0, 2.0).is_none());
    }

    #[test]
    fn bollinger_flat_series_has_zero_width() {
        let closes = vec![100.0; 20];
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.width.abs() < 1e-10);
        assert!((bb.upper - bb.lower).abs() < 1e-10);
    }

    #[test]
    fn bollinger_uses_trailing_window() {
        // First half wild, second half flat at 50: bands computed over the
        // trailing 10 must be tight around 50.
        let mut closes: Vec<f64> = (1..=10).map(|x| x as f64 * 17.0).collect();
        closes.extend(std::iter::repeat(50.0).take(10));
        let bb = calculate_bollinger(&closes, 10, 2.0).unwrap();
        assert!((bb.middle - 50.0).abs() < 1e-10);
        assert!(bb.width.abs() < 1e-10);
    }
}
