// =============================================================================
// Average Directional Index (ADX)
// =============================================================================
//
// ADX quantifies trend strength regardless of direction.
//
//   1. +DM / -DM per bar from consecutive highs and lows.
//   2. True Range per bar.
//   3. Wilder's smoothing of +DM, -DM, TR over `period`.
//   4. +DI = smoothed(+DM) / smoothed(TR) * 100, -DI mirrored.
//   5. DX  = |+DI - -DI| / (+DI + -DI) * 100
//   6. ADX = Wilder's smoothed average of DX over `period` bars.
// =============================================================================

use crate::types::Candle;

/// Compute the most recent ADX value from a slice of OHLCV candles.
///
/// Returns `None` when:
/// - `period` is zero.
/// - Fewer than `2 * period + 1` candles (initial smoothing needs `period`
///   bars, the ADX seed needs another `period` DX values, and the first
///   candle has no predecessor).
/// - Any intermediate calculation produces a non-finite result.
pub fn calculate_adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;
    let bar_count = candles.len() - 1;

    let mut plus_dm = Vec::with_capacity(bar_count);
    let mut minus_dm = Vec::with_capacity(bar_count);
    let mut tr_vals = Vec::with_capacity(bar_count);

    for pair in candles.windows(2) {
        let prev = &pair[0];
        let cur = &pair[1];

        let tr = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());

        let up_move = cur.high - prev.high;
        let down_move = prev.low - cur.low;

        let pdm = if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        };
        let mdm = if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        };

        plus_dm.push(pdm);
        minus_dm.push(mdm);
        tr_vals.push(tr);
    }

    let mut smooth_plus: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values: Vec<f64> = Vec::with_capacity(bar_count - period + 1);
    dx_values.push(compute_dx(smooth_plus, smooth_minus, smooth_tr)?);

    for i in period..bar_count {
        smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[i];

        dx_values.push(compute_dx(smooth_plus, smooth_minus, smooth_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }

    // ADX = Wilder's smoothed DX.
    let mut adx: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
    }

    adx.is_finite().then_some(adx)
}

/// DX from smoothed directional movement and true range.
///
/// Returns `Some(0.0)` when both DIs are zero (no directional movement).
fn compute_dx(smooth_plus_dm: f64, smooth_minus_dm: f64, smooth_tr: f64) -> Option<f64> {
    if smooth_tr == 0.0 {
        return Some(0.0);
    }
    let plus_di = smooth_plus_dm / smooth_tr * 100.0;
    let minus_di = smooth_minus_dm / smooth_tr * 100.0;
    let di_sum = plus_di + minus_di;
    if di_sum == 0.0 {
        return Some(0.0);
    }
    let dx = (plus_di - minus_di).abs() / di_sum * 100.0;
    dx.is_finite().then_some(dx)
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
    fn adx_insufficient_data() {
        let candles = vec![candle(101.0, 99.0, 100.0); 10];
        assert!(calculate_adx(&candles, 14).is_none());
        assert!(calculate_adx(&candles, 0).is_none());
    }

    #[test]
    fn adx_strong_trend_reads_high() {
        // Relentless one-directional climb: ADX should approach 100.
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(base + 1.0, base - 1.0, base + 0.8)
            })
            .collect();
        let adx = calculate_adx(&candles, 14).unwrap();
        assert!(adx > 60.0, "expected high ADX for strong trend, got {adx}");
    }

    #[test]
    fn adx_flat_market_reads_low() {
        let candles = vec![candle(100.5, 99.5, 100.0); 60];
        let adx = calculate_adx(&candles, 14).unwrap();
        assert!(adx < 20.0, "expected low ADX for flat market, got {adx}");
    }

    #[test]
    fn adx_in_valid_range() {
        let candles: Vec<Candle> = (0..80)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.7).sin() * 8.0;
                candle(base + 1.2, base - 1.2, base)
            })
            .collect();
        let adx = calculate_adx(&candles, 14).unwrap();
        assert!((0.0..=100.0).contains(&adx));
    }
}
