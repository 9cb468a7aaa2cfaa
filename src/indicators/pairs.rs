// =============================================================================
// Pairs analytics — correlation, beta, spread z-score, half-life
// =============================================================================
//
// All functions operate on aligned return/price series of equal length.

/// Pearson correlation coefficient between two equal-length series.
///
/// Returns `None` on mismatched lengths, fewer than two points, zero
/// variance in either series, or non-finite input.
pub fn pearson_correlation(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }

    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut cov = 0.0_f64;
    let mut var_x = 0.0_f64;
    let mut var_y = 0.0_f64;
    for (&x, &y) in xs.iter().zip(ys) {
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }

    let r = cov / (var_x.sqrt() * var_y.sqrt());
    r.is_finite().then_some(r.clamp(-1.0, 1.0))
}

/// OLS beta of `asset` returns against `benchmark` returns:
///   beta = cov(asset, benchmark) / var(benchmark)
///
/// Returns `None` on mismatched lengths, fewer than two points, or zero
/// benchmark variance.
pub fn ols_beta(asset: &[f64], benchmark: &[f64]) -> Option<f64> {
    if asset.len() != benchmark.len() || asset.len() < 2 {
        return None;
    }

    let n = asset.len() as f64;
    let mean_a = asset.iter().sum::<f64>() / n;
    let mean_b = benchmark.iter().sum::<f64>() / n;

    let mut cov = 0.0_f64;
    let mut var_b = 0.0_f64;
    for (&a, &b) in asset.iter().zip(benchmark) {
        if !a.is_finite() || !b.is_finite() {
            return None;
        }
        cov += (a - mean_a) * (b - mean_b);
        var_b += (b - mean_b).powi(2);
    }

    if var_b == 0.0 {
        return None;
    }

    let beta = cov / var_b;
    beta.is_finite().then_some(beta)
}

/// Z-score of the latest spread value against a rolling window.
///
/// `spread` is the raw spread series; the z-score is computed over the
/// trailing `window` values:
///   z = (last - mean(window)) / std(window)
///
/// Returns `None` when the series is shorter than `window`, `window < 2`,
/// or the window standard deviation is zero.
pub fn spread_zscore(spread: &[f64], window: usize) -> Option<f64> {
    if window < 2 || spread.len() < window {
        return None;
    }

    let tail = &spread[spread.len() - window..];
    let n = window as f64;
    let mean = tail.iter().sum::<f64>() / n;
    let var = tail.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let std = var.sqrt();
    if std == 0.0 {
        return None;
    }

    let z = (tail.last()? - mean) / std;
    z.is_finite().then_some(z)
}

/// Half-life of mean reversion via the regression of Δspread on the lagged
/// spread level:
///   Δs_t = a + b * s_{t-1} + ε,   half_life = -ln(2) / b
///
/// Returns `None` when the series is too short, the slope `b` is
/// non-negative (no mean reversion), or the result is non-finite.
pub fn half_life(spread: &[f64]) -> Option<f64> {
    if spread.len() < 3 {
        return None;
    }

    let lagged: Vec<f64> = spread[..spread.len() - 1].to_vec();
    let deltas: Vec<f64> = spread.windows(2).map(|w| w[1] - w[0]).collect();

    let b = ols_beta(&deltas, &lagged)?;
    if b >= 0.0 {
        return None;
    }

    let hl = -(2.0_f64.ln()) / b;
    (hl.is_finite() && hl > 0.0).then_some(hl)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_perfect_positive_and_negative() {
        let xs: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 * x + 1.0).collect();
        let r = pearson_correlation(&xs, &ys).unwrap();
        assert!((r - 1.0).abs() < 1e-10);

        let neg: Vec<f64> = xs.iter().map(|x| -x).collect();
        let r = pearson_correlation(&xs, &neg).unwrap();
        assert!((r + 1.0).abs() < 1e-10);
    }

    #[test]
    fn correlation_degenerate_inputs() {
        assert!(pearson_correlation(&[1.0], &[2.0]).is_none());
        assert!(pearson_correlation(&[1.0, 2.0], &[3.0]).is_none());
        assert!(pearson_correlation(&[5.0; 10], &(1..=10).map(|x| x as f64).collect::<Vec<_>>()).is_none());
    }

    #[test]
    fn beta_of_scaled_series() {
        let bench: Vec<f64> = vec![0.01, -0.02, 0.015, 0.005, -0.01, 0.02];
        let asset: Vec<f64> = bench.iter().map(|r| r * 1.5).collect();
        let beta = ols_beta(&asset, &bench).unwrap();
        assert!((beta - 1.5).abs() < 1e-10);
    }

    #[test]
    fn beta_zero_variance_benchmark() {
        assert!(ols_beta(&[0.01, 0.02, 0.03], &[0.01; 3]).is_none());
    }

    #[test]
    fn zscore_of_outlier() {
        let mut spread = vec![0.0; 19];
        spread.push(10.0);
        let z = spread_zscore(&spread, 20).unwrap();
        assert!(z > 3.0, "outlier should read high z, got {z}");
    }

    #[test]
    fn zscore_flat_window_is_none() {
        assert!(spread_zscore(&[1.0; 30], 20).is_none());
    }

    #[test]
    fn half_life_of_ou_like_series() {
        // s_t = 0.5 * s_{t-1}: strongly mean-reverting, b = -0.5,
        // half-life = ln2 / 0.5 ≈ 1.386.
        let mut spread = vec![8.0_f64];
        for _ in 0..30 {
            let next = spread.last().unwrap() * 0.5;
            spread.push(next);
        }
        let hl = half_life(&spread).unwrap();
        assert!((hl - 1.386).abs() < 0.05, "expected ~1.386, got {hl}");
    }

    #[test]
    fn half_life_none_for_trending_series() {
        let spread: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        assert!(half_life(&spread).is_none());
    }
}
