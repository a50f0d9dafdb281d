//! Fixed-window admission control.
//!
//! At most `capacity` requests are admitted per window of `duration`.  The
//! window resets wholesale the first time a request arrives after it has
//! elapsed, so two bursts straddling a boundary can briefly admit up to
//! `2 * capacity` requests.  That imprecision is accepted here; swap in a
//! token bucket if smoother pacing is ever needed.
//!
//! Time comes from [`tokio::time::Instant`] so tests can drive the window
//! with a paused clock.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Current state of the rate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    /// Requests admitted in the current window.
    pub count: u32,
    /// When the current window started.
    pub window_start: Instant,
    /// Maximum admissions per window.
    pub capacity: u32,
    /// Window length.
    pub duration: Duration,
}

impl RateWindow {
    fn new(capacity: u32, duration: Duration, now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            capacity,
            duration,
        }
    }

    fn is_elapsed(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) > self.duration
    }
}

/// Thread-safe fixed-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    window: Mutex<RateWindow>,
}

impl RateLimiter {
    /// Create a limiter admitting `capacity` requests per `duration`.
    pub fn new(capacity: u32, duration: Duration) -> Self {
        Self {
            window: Mutex::new(RateWindow::new(capacity, duration, Instant::now())),
        }
    }

    /// Returns `true` when the request must be queued, `false` when it is
    /// admitted (and counted against the current window).
    pub fn should_queue(&self) -> bool {
        self.should_queue_at(Instant::now())
    }

    /// [`should_queue`](Self::should_queue) evaluated at an explicit instant.
    pub fn should_queue_at(&self, now: Instant) -> bool {
        let mut window = self.lock();

        if window.is_elapsed(now) {
            window.count = 1;
            window.window_start = now;
            tracing::debug!(capacity = window.capacity, "rate window reset");
            return false;
        }

        if window.count < window.capacity {
            window.count += 1;
            return false;
        }

        tracing::debug!(
            count = window.count,
            capacity = window.capacity,
            "rate window exhausted"
        );
        true
    }

    /// How long until the current window can be reset.  Zero if it already
    /// can.
    pub fn time_until_reset(&self) -> Duration {
        self.time_until_reset_at(Instant::now())
    }

    fn time_until_reset_at(&self, now: Instant) -> Duration {
        let window = self.lock();
        // A reset happens strictly after `duration`; add a millisecond so a
        // sleeper woken at the deadline lands past it.
        let deadline = window.window_start + window.duration + Duration::from_millis(1);
        deadline.saturating_duration_since(now)
    }

    /// Snapshot of the current window.
    pub fn window(&self) -> RateWindow {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RateWindow> {
        // The window holds plain counters, so a poisoned guard is still usable.
        self.window
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_exactly_capacity_per_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(10));
        let start = Instant::now();

        for _ in 0..3 {
            assert!(!limiter.should_queue_at(start));
        }
        for _ in 0..5 {
            assert!(limiter.should_queue_at(start + Duration::from_secs(5)));
        }
        assert_eq!(limiter.window().count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn resets_only_after_duration_has_passed() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();

        assert!(!limiter.should_queue_at(start));
        // Exactly at the boundary is still the same window.
        assert!(limiter.should_queue_at(start + Duration::from_secs(10)));

        let later = start + Duration::from_secs(10) + Duration::from_millis(1);
        assert!(!limiter.should_queue_at(later));
        let window = limiter.window();
        assert_eq!(window.count, 1);
        assert_eq!(window.window_start, later);
        assert!(limiter.should_queue_at(later));
    }

    #[tokio::test(start_paused = true)]
    async fn time_until_reset_counts_down() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();
        assert!(!limiter.should_queue_at(start));

        let remaining = limiter.time_until_reset_at(start + Duration::from_secs(4));
        assert_eq!(remaining, Duration::from_millis(6_001));

        let remaining = limiter.time_until_reset_at(start + Duration::from_secs(20));
        assert_eq!(remaining, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_across_boundary_is_tolerated() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let start = Instant::now();

        // Two at the very end of the first window...
        let end_of_first = start + Duration::from_millis(999);
        assert!(!limiter.should_queue_at(end_of_first));
        assert!(!limiter.should_queue_at(end_of_first));

        // ...and two right after it: four admissions within ~1s.
        let after = start + Duration::from_millis(1_001);
        assert!(!limiter.should_queue_at(after));
        assert!(!limiter.should_queue_at(after));
        assert!(limiter.should_queue_at(after));
    }
}
