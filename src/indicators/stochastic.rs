// =============================================================================
// Stochastic Oscillator (%K / %D)
// =============================================================================
//
//   %K = (close - lowest_low(period)) / (highest_high(period) - lowest_low(period)) * 100
//   %D = SMA(smooth) of %K
// =============================================================================

use crate::types::Candle;

/// Latest stochastic reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StochasticResult {
    pub k: f64,
    pub d: f64,
}

/// Compute the most recent %K and %D.
///
/// Returns `None` when there are fewer than `period + smooth - 1` candles,
/// either parameter is zero, or the range over any window is zero-width in a
/// way that produces a non-finite value (a flat window yields %K = 50).
pub fn calculate_stochastic(
    candles: &[Candle],
    period: usize,
    smooth: usize,
) -> Option<StochasticResult> {
    if period == 0 || smooth == 0 || candles.len() < period + smooth - 1 {
        return None;
    }

    // %K for the last `smooth` windows.
    let mut k_values = Vec::with_capacity(smooth);
    for offset in 0..smooth {
        let end = candles.len() - offset;
        let window = &candles[end - period..end];

        let highest = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let lowest = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let close = window.last()?.close;

        let k = if (highest - lowest).abs() < f64::EPSILON {
            50.0
        } else {
            (close - lowest) / (highest - lowest) * 100.0
        };
        if !k.is_finite() {
            return None;
        }
        k_values.push(k);
    }

    let d = k_values.iter().sum::<f64>() / smooth as f64;
    let k = k_values[0]; // offset 0 is the most recent window

    Some(StochasticResult { k, d })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            ts: 0,
            open: (high + low) / 2.0,
            high,
            low,
            close,
            volume: 1_000.0,
        }
    }

    #[test]
    fn stochastic_insufficient_data() {
        let candles = vec![candle(101.0, 99.0, 100.0); 5];
        assert!(calculate_stochastic(&candles, 14, 3).is_none());
    }

    #[test]
    fn stochastic_close_at_high_reads_100() {
        let candles: Vec<Candle> = (0..20)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(base + 1.0, base - 1.0, base + 1.0)
            })
            .collect();
        let s = calculate_stochastic(&candles, 14, 3).unwrap();
        assert!(s.k > 95.0, "close at window high should read ~100, got {}", s.k);
    }

    #[test]
    fn stochastic_close_at_low_reads_0() {
        let candles: Vec<Candle> = (0..20)
            .map(|i| {
                let base = 200.0 - i as f64;
                candle(base + 1.0, base - 1.0, base - 1.0)
            })
            .collect();
        let s = calculate_stochastic(&candles, 14, 3).unwrap();
        assert!(s.k < 5.0, "close at window low should read ~0, got {}", s.k);
    }

    #[test]
    fn stochastic_flat_window_is_neutral() {
        let candles = vec![candle(100.0, 100.0, 100.0); 20];
        let s = calculate_stochastic(&candles, 14, 3).unwrap();
        assert!((s.k - 50.0).abs() < 1e-10);
        assert!((s.d - 50.0).abs() < 1e-10);
    }

    #[test]
    fn stochastic_in_range() {
        let candles: Vec<Candle> = (0..40)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.8).sin() * 6.0;
                candle(base + 1.0, base - 1.0, base + 0.4)
            })
            .collect();
        let s = calculate_stochastic(&candles, 14, 3).unwrap();
        assert!((0.0..=100.0).contains(&s.k));
        assert!((0.0..=100.0).contains(&s.d));
    }
}
