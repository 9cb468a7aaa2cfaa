// =============================================================================
// Average True Range (ATR)
// =============================================================================
//
// True Range per bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is Wilder's smoothed average of TR:
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// seeded with the SMA of the first `period` true ranges.
// =============================================================================

use crate::types::Candle;

/// Compute the most recent ATR from a candle slice.
///
/// Returns `None` when:
/// - `period` is zero.
/// - Fewer than `period + 1` candles (TR needs a previous close).
/// - Any candle or intermediate value is non-finite.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(candles.len() - 1);
    for pair in candles.windows(2) {
        let prev_close = pair[0].close;
        let c = &pair[1];
        let tr = (c.high - c.low)
            .max((c.high - prev_close).abs())
            .max((c.low - prev_close).abs());
        if !tr.is_finite() {
            return None;
        }
        tr_values.push(tr);
    }

    let period_f = period as f64;
    let mut atr: f64 = tr_values[..period].iter().sum::<f64>() / period_f;

    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
    }

    atr.is_finite().then_some(atr)
}

/// ATR expressed as a percentage of the latest close.
///
/// Useful for comparing volatility across symbols with different price
/// scales.
pub fn calculate_atr_pct(candles: &[Candle], period: usize) -> Option<f64> {
    let atr = calculate_atr(candles, period)?;
    let last_close = candles.last()?.close;
    if last_close == 0.0 {
        return None;
    }
    Some((atr / last_close) * 100.0)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            ts: 0,
            open,
            high,
            low,
            close,
            volume: 1_000.0,
        }
    }

    #[test]
    fn atr_insufficient_data() {
        let candles = vec![candle(100.0, 101.0, 99.0, 100.0); 5];
        assert!(calculate_atr(&candles, 14).is_none());
        assert!(calculate_atr(&candles, 0).is_none());
    }

    #[test]
    fn atr_constant_range_converges() {
        // All candles have the same range (H-L=10), close at midpoint.
        let mut candles = Vec::new();
        for i in 0..30 {
            let base = 100.0 + i as f64 * 0.1;
            candles.push(candle(base, base + 5.0, base - 5.0, base));
        }
        let atr = calculate_atr(&candles, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10.0, got {atr}");
    }

    #[test]
    fn atr_true_range_uses_prev_close() {
        // Gap up: |115 - 95| = 20 dominates H-L = 7.
        let candles = vec![
            candle(100.0, 105.0, 95.0, 95.0),
            candle(110.0, 115.0, 108.0, 112.0),
            candle(112.0, 118.0, 110.0, 115.0),
            candle(115.0, 120.0, 113.0, 118.0),
        ];
        let atr = calculate_atr(&candles, 3).unwrap();
        assert!(atr > 7.0, "ATR should reflect the gap, got {atr}");
    }

    #[test]
    fn atr_is_positive() {
        let candles: Vec<Candle> = (0..50)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.5).sin() * 10.0;
                candle(base - 0.5, base + 2.0, base - 2.0, base + 0.5)
            })
            .collect();
        let atr = calculate_atr(&candles, 14).unwrap();
        assert!(atr > 0.0);
    }

    #[test]
    fn atr_nan_returns_none() {
        let mut candles = vec![candle(100.0, 105.0, 95.0, 100.0); 5];
        candles[2].high = f64::NAN;
        assert!(calculate_atr(&candles, 3).is_none());
    }

    #[test]
    fn atr_pct_normalises_by_close() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(base, base + 3.0, base - 3.0, base + 1.0)
            })
            .collect();
        let pct = calculate_atr_pct(&candles, 14).unwrap();
        assert!(pct > 0.0 && pct.is_finite());
    }

    #[test]
    fn atr_determinism() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 200.0 + (i as f64 * 0.9).cos() * 4.0;
                candle(base, base + 1.5, base - 1.5, base + 0.3)
            })
            .collect();
        assert_eq!(calculate_atr(&candles, 14), calculate_atr(&candles, 14));
    }
}
