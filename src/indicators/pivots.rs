// =============================================================================
// Pivot Points (classic) and support/resistance bands
// =============================================================================
//
// Classic floor-trader pivots from the prior session's OHLC:
//
//   P  = (H + L + C) / 3
//   R1 = 2P - L        S1 = 2P - H
//   R2 = P + (H - L)   S2 = P - (H - L)
//   R3 = H + 2(P - L)  S3 = L - 2(H - P)
// =============================================================================

use crate::types::Candle;

/// Classic pivot levels computed from one reference candle (usually the
/// prior day).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PivotLevels {
    pub pivot: f64,
    pub r1: f64,
    pub r2: f64,
    pub r3: f64,
    pub s1: f64,
    pub s2: f64,
    pub s3: f64,
}

/// Compute classic pivot points from the prior session's candle.
///
/// Returns `None` on non-finite input or an inverted high/low.
pub fn calculate_pivots(prior: &Candle) -> Option<PivotLevels> {
    if !prior.is_finite() || prior.high < prior.low {
        return None;
    }

    let p = (prior.high + prior.low + prior.close) / 3.0;
    let range = prior.high - prior.low;

    Some(PivotLevels {
        pivot: p,
        r1: 2.0 * p - prior.low,
        r2: p + range,
        r3: prior.high + 2.0 * (p - prior.low),
        s1: 2.0 * p - prior.high,
        s2: p - range,
        s3: prior.low - 2.0 * (prior.high - p),
    })
}

/// Support and resistance bands from local swing extremes.
///
/// A swing high is a high greater than its `lookaround` neighbours on both
/// sides; swing lows are mirrored.  The returned levels are sorted ascending
/// and deduplicated within `tolerance_pct` of each other (the mean of the
/// cluster is kept).
pub fn support_resistance_bands(
    candles: &[Candle],
    lookaround: usize,
    tolerance_pct: f64,
) -> (Vec<f64>, Vec<f64>) {
    if lookaround == 0 || candles.len() < 2 * lookaround + 1 {
        return (Vec::new(), Vec::new());
    }

    let mut supports = Vec::new();
    let mut resistances = Vec::new();

    for i in lookaround..candles.len() - lookaround {
        let window = &candles[i - lookaround..=i + lookaround];
        let c = &candles[i];
        if !c.is_finite() {
            continue;
        }

        let is_swing_high = window.iter().all(|w| w.high <= c.high);
        let is_swing_low = window.iter().all(|w| w.low >= c.low);

        if is_swing_high {
            resistances.push(c.high);
        }
        if is_swing_low {
            supports.push(c.low);
        }
    }

    (
        cluster_levels(supports, tolerance_pct),
        cluster_levels(resistances, tolerance_pct),
    )
}

/// Merge levels within `tolerance_pct` of each other into their mean.
fn cluster_levels(mut levels: Vec<f64>, tolerance_pct: f64) -> Vec<f64> {
    levels.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut clustered: Vec<f64> = Vec::new();
    let mut cluster: Vec<f64> = Vec::new();

    for level in levels {
        match cluster.last() {
            Some(&last) if (level - last).abs() / last * 100.0 <= tolerance_pct => {
                cluster.push(level);
            }
            _ => {
                if !cluster.is_empty() {
                    clustered.push(cluster.iter().sum::<f64>() / cluster.len() as f64);
                }
                cluster = vec![level];
            }
        }
    }
    if !cluster.is_empty() {
        clustered.push(cluster.iter().sum::<f64>() / cluster.len() as f64);
    }

    clustered
}
