// =============================================================================
// Volume indicators — On-Balance Volume and session VWAP
// =============================================================================

use crate::types::Candle;

/// On-Balance Volume over the candle sequence.
///
/// OBV starts at zero; each bar adds its volume when the close rises,
/// subtracts it when the close falls, and is unchanged on an equal close.
///
/// Returns `None` on fewer than two candles or any non-finite input.
pub fn calculate_obv(candles: &[Candle]) -> Option<f64> {
    if candles.len() < 2 {
        return None;
    }

    let mut obv = 0.0_f64;
    for pair in candles.windows(2) {
        let prev = &pair[0];
        let cur = &pair[1];
        if !cur.is_finite() || !prev.is_finite() {
            return None;
        }
        if cur.close > prev.close {
            obv += cur.volume;
        } else if cur.close < prev.close {
            obv -= cur.volume;
        }
    }

    obv.is_finite().then_some(obv)
}

/// Volume-weighted average price over the candle sequence (typically one
/// session's intraday candles).
///
///   VWAP = Σ(typical_price * volume) / Σ(volume)
///
/// Returns `None` on empty input, zero total volume, or non-finite values.
pub fn calculate_vwap(candles: &[Candle]) -> Option<f64> {
    if candles.is_empty() {
        return None;
    }

    let mut pv_sum = 0.0_f64;
    let mut vol_sum = 0.0_f64;
    for c in candles {
        if !c.is_finite() {
            return None;
        }
        pv_sum += c.typical_price() * c.volume;
        vol_sum += c.volume;
    }

    if vol_sum == 0.0 {
        return None;
    }
    let vwap = pv_sum / vol_sum;
    vwap.is_finite().then_some(vwap)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, volume: f64) -> Candle {
        Candle {
            ts: 0,
            open: close,
            high: close,
            low: close,
            close,
            volume,
        }
    }

    #[test]
    fn obv_accumulates_with_direction() {
        let candles = vec![
            candle(100.0, 10.0),
            candle(101.0, 20.0), // up: +20
            candle(100.5, 30.0), // down: -30
            candle(100.5, 40.0), // flat: 0
            candle(102.0, 50.0), // up: +50
        ];
        assert_eq!(calculate_obv(&candles), Some(40.0));
    }

    #[test]
    fn obv_needs_two_candles() {
        assert!(calculate_obv(&[candle(100.0, 10.0)]).is_none());
        assert!(calculate_obv(&[]).is_none());
    }

    #[test]
    fn vwap_weighted_by_volume() {
        // Heavy volume at 100, light at 200: VWAP must sit near 100.
        let candles = vec![candle(100.0, 900.0), candle(200.0, 100.0)];
        let vwap = calculate_vwap(&candles).unwrap();
        assert!((vwap - 110.0).abs() < 1e-9);
    }

    #[test]
    fn vwap_zero_volume_is_none() {
        let candles = vec![candle(100.0, 0.0), candle(101.0, 0.0)];
        assert!(calculate_vwap(&candles).is_none());
    }

    #[test]
    fn vwap_single_candle_is_typical_price() {
        let c = Candle {
            ts: 0,
            open: 99.0,
            high: 102.0,
            low: 98.0,
            close: 101.0,
            volume: 500.0,
        };
        let vwap = calculate_vwap(&[c]).unwrap();
        assert!((vwap - c.typical_price()).abs() < 1e-12);
    }
}
