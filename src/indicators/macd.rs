// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   MACD line  = EMA(fast) - EMA(slow)
//   Signal     = EMA(signal_period) of the MACD line
//   Histogram  = MACD line - Signal
//
// Standard parameters are (12, 26, 9).
// =============================================================================

use crate::indicators::ema::calculate_ema;

/// Latest MACD reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the most recent MACD / signal / histogram values.
///
/// Returns `None` when there is not enough data for the slow EMA plus the
/// signal EMA, or when `fast >= slow`.
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Option<MacdResult> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return None;
    }
    if closes.len() < slow + signal_period {
        return None;
    }

    let fast_series = calculate_ema(closes, fast);
    let slow_series = calculate_ema(closes, slow);
    if slow_series.is_empty() {
        return None;
    }

    // Align: the slow series starts (slow - fast) elements later than the
    // fast series.
    let offset = slow - fast;
    if fast_series.len() < slow_series.len() + offset {
        return None;
    }

    let macd_line: Vec<f64> = slow_series
        .iter()
        .enumerate()
        .map(|(i, &s)| fast_series[i + offset] - s)
        .collect();

    let signal_series = calculate_ema(&macd_line, signal_period);
    let signal = *signal_series.last()?;
    let macd = *macd_line.last()?;
    let histogram = macd - signal;

    if macd.is_finite() && signal.is_finite() {
        Some(MacdResult {
            macd,
            signal,
            histogram,
        })
    } else {
        None
    }
}

/// Convenience: MACD with the standard (12, 26, 9) parameters.
pub fn calculate(closes: &[f64]) -> Option<MacdResult> {
    calculate_macd(closes, 12, 26, 9)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 12, 26, 9).is_none());
    }

    #[test]
    fn macd_rejects_bad_periods() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 26, 12, 9).is_none());
        assert!(calculate_macd(&closes, 0, 26, 9).is_none());
    }

    #[test]
    fn macd_positive_in_uptrend() {
        // Steady uptrend: fast EMA above slow EMA, MACD > 0.
        let closes: Vec<f64> = (1..=120).map(|x| 100.0 + x as f64).collect();
        let result = calculate(&closes).unwrap();
        assert!(result.macd > 0.0, "MACD should be positive, got {}", result.macd);
    }

    #[test]
    fn macd_negative_in_downtrend() {
        let closes: Vec<f64> = (1..=120).map(|x| 300.0 - x as f64).collect();
        let result = calculate(&closes).unwrap();
        assert!(result.macd < 0.0);
    }

    #[test]
    fn macd_flat_market_near_zero() {
        let closes = vec![100.0; 120];
        let result = calculate(&closes).unwrap();
        assert!(result.macd.abs() < 1e-9);
        assert!(result.signal.abs() < 1e-9);
        assert!(result.histogram.abs() < 1e-9);
    }

    #[test]
    fn macd_histogram_is_macd_minus_signal() {
        let closes: Vec<f64> = (0..150)
            .map(|i| 100.0 + (i as f64 * 0.2).sin() * 5.0)
            .collect();
        let r = calculate(&closes).unwrap();
        assert!((r.histogram - (r.macd - r.signal)).abs() < 1e-12);
    }
}
