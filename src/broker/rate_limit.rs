// =============================================================================
// Rate-Limit Tracker — sliding windows with a safety margin
// =============================================================================
//
// The broker enforces per-second, per-minute, and per-day request budgets.
// The tracker keeps a sliding window of recent request timestamps and
// refuses a call *before* it is sent once any window (scaled by the safety
// margin) would overflow.  On refusal the caller receives the earliest time
// at which the request would fit; nothing is ever queued silently.
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Budget for one sliding window.
#[derive(Debug, Clone, Copy)]
struct WindowBudget {
    span: Duration,
    limit: usize,
}

/// Per-second / per-minute / per-day request budgets.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub per_second: usize,
    pub per_minute: usize,
    pub per_day: usize,
}

impl Default for RateLimits {
    fn default() -> Self {
        // Broker-published caps of 10/s, 200/min, 100k/day.
        Self {
            per_second: 10,
            per_minute: 200,
            per_day: 100_000,
        }
    }
}

/// Sliding-window rate limiter shared by all operations of one adapter.
pub struct RateLimitTracker {
    windows: Vec<WindowBudget>,
    history: Mutex<VecDeque<Instant>>,
}

/// Fraction of the published limit we allow ourselves to consume.
const SAFETY_MARGIN: f64 = 0.9;

impl RateLimitTracker {
    /// Build a tracker from the broker's published limits, applying the
    /// safety margin to each window.
    pub fn new(limits: RateLimits) -> Self {
        let scaled = |limit: usize| ((limit as f64 * SAFETY_MARGIN) as usize).max(1);
        Self {
            windows: vec![
                WindowBudget {
                    span: Duration::from_secs(1),
                    limit: scaled(limits.per_second),
                },
                WindowBudget {
                    span: Duration::from_secs(60),
                    limit: scaled(limits.per_minute),
                },
                WindowBudget {
                    span: Duration::from_secs(86_400),
                    limit: scaled(limits.per_day),
                },
            ],
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Try to reserve one request slot at `now`.
    ///
    /// Returns `Ok(())` and records the request, or `Err(retry_after)` with
    /// the wait until the tightest violated window frees a slot.
    pub fn try_acquire_at(&self, now: Instant) -> Result<(), Duration> {
        let mut history = self.history.lock();

        // Drop timestamps older than the widest window.
        let widest = self.windows.iter().map(|w| w.span).max().unwrap_or_default();
        while let Some(&front) = history.front() {
            if now.duration_since(front) > widest {
                history.pop_front();
            } else {
                break;
            }
        }

        let mut worst_wait: Option<Duration> = None;
        for window in &self.windows {
            let in_window = history
                .iter()
                .rev()
                .take_while(|&&t| now.duration_since(t) <= window.span)
                .count();
            if in_window >= window.limit {
                // The slot frees when the oldest request in this window ages out.
                let oldest_in_window = history
                    .iter()
                    .rev()
                    .take(in_window)
                    .last()
                    .copied()
                    .unwrap_or(now);
                let wait = window
                    .span
                    .saturating_sub(now.duration_since(oldest_in_window));
                worst_wait = Some(worst_wait.map_or(wait, |w: Duration| w.max(wait)));
            }
        }

        if let Some(wait) = worst_wait {
            warn!(retry_after_ms = wait.as_millis() as u64, "rate limit window full");
            return Err(wait);
        }

        history.push_back(now);
        debug!(in_flight_window = history.len(), "rate limit slot acquired");
        Ok(())
    }

    /// Reserve a slot now, or learn how long to wait.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.try_acquire_at(Instant::now())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(per_second: usize, per_minute: usize) -> RateLimitTracker {
        RateLimitTracker::new(RateLimits {
            per_second,
            per_minute,
            per_day: 1_000_000,
        })
    }

    #[test]
    fn allows_up_to_margin_then_blocks() {
        // 10/s scaled by 0.9 => 9 allowed in one second.
        let t = tracker(10, 10_000);
        let now = Instant::now();
        for _ in 0..9 {
            assert!(t.try_acquire_at(now).is_ok());
        }
        assert!(t.try_acquire_at(now).is_err());
    }

    #[test]
    fn retry_after_is_bounded_by_window() {
        let t = tracker(2, 10_000); // margin => 1 per second
        let now = Instant::now();
        assert!(t.try_acquire_at(now).is_ok());
        let wait = t.try_acquire_at(now).unwrap_err();
        assert!(wait <= Duration::from_secs(1));
    }

    #[test]
    fn window_slides() {
        let t = tracker(2, 10_000); // 1 per second after margin
        let now = Instant::now();
        assert!(t.try_acquire_at(now).is_ok());
        assert!(t.try_acquire_at(now).is_err());
        // One second later the window has slid past the first request.
        assert!(t.try_acquire_at(now + Duration::from_millis(1_100)).is_ok());
    }

    #[test]
    fn minute_window_enforced_independently() {
        // Generous per-second, tight per-minute (2 => margin 1).
        let t = tracker(1_000, 2);
        let now = Instant::now();
        assert!(t.try_acquire_at(now).is_ok());
        let wait = t
            .try_acquire_at(now + Duration::from_secs(5))
            .unwrap_err();
        // Must wait for the minute window, not the second window.
        assert!(wait > Duration::from_secs(30));
    }
}
