// =============================================================================
// Options analytics — put-call ratio, max pain, IV rank
// =============================================================================

/// Open interest and implied volatility at one strike.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrikeRow {
    pub strike: f64,
    pub call_oi: f64,
    pub put_oi: f64,
    pub call_iv: f64,
    pub put_iv: f64,
}

/// Put-call ratio by open interest across the chain.
///
/// Returns `None` on an empty chain or zero call OI.
pub fn put_call_ratio(chain: &[StrikeRow]) -> Option<f64> {
    if chain.is_empty() {
        return None;
    }
    let call_oi: f64 = chain.iter().map(|r| r.call_oi).sum();
    let put_oi: f64 = chain.iter().map(|r| r.put_oi).sum();
    if call_oi == 0.0 {
        return None;
    }
    let pcr = put_oi / call_oi;
    pcr.is_finite().then_some(pcr)
}

/// Max-pain strike: the expiry price that minimises the total intrinsic
/// value paid out across all open calls and puts.
///
/// For candidate expiry price `s`:
///   pain(s) = Σ call_oi_k * max(0, s - k) + Σ put_oi_k * max(0, k - s)
///
/// Returns the strike with minimal pain, or `None` on an empty chain or
/// non-finite inputs.  Ties resolve to the lowest strike (stable for a
/// sorted chain).
pub fn max_pain(chain: &[StrikeRow]) -> Option<f64> {
    if chain.is_empty() {
        return None;
    }

    let mut best: Option<(f64, f64)> = None; // (strike, pain)

    for candidate in chain {
        let s = candidate.strike;
        let mut pain = 0.0_f64;
        for row in chain {
            pain += row.call_oi * (s - row.strike).max(0.0);
            pain += row.put_oi * (row.strike - s).max(0.0);
        }
        if !pain.is_finite() {
            return None;
        }
        match best {
            Some((_, best_pain)) if pain >= best_pain => {}
            _ => best = Some((s, pain)),
        }
    }

    best.map(|(strike, _)| strike)
}

/// IV rank: where the current implied volatility sits within its trailing
/// history, as a percentage of the observed range.
///
///   rank = (current - min) / (max - min) * 100
///
/// Returns `None` on fewer than two history points or a zero-width range.
pub fn iv_rank(current_iv: f64, iv_history: &[f64]) -> Option<f64> {
    if iv_history.len() < 2 || !current_iv.is_finite() {
        return None;
    }

    let mut min = f64::MAX;
    let mut max = f64::MIN;
    for &iv in iv_history {
        if !iv.is_finite() {
            return None;
        }
        min = min.min(iv);
        max = max.max(iv);
    }

    let span = max - min;
    if span == 0.0 {
        return None;
    }

    let rank = ((current_iv - min) / span * 100.0).clamp(0.0, 100.0);
    Some(rank)
}
