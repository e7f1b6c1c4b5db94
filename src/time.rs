//! Bounded busy-wait helpers
//!
//! Every polling loop in the crate goes through this module. Budgets are
//! expressed in iterations rather than wall-clock time because the transport
//! runs on platforms without a reliable timer; the platform tunes the caps
//! through [`crate::config::HostConfig`].

/// An iteration budget for a single busy-wait
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    remaining: u32,
    cap: u32,
}

impl Timeout {
    /// Create a budget of `iterations` polls
    pub const fn from_iterations(iterations: u32) -> Self {
        Self {
            remaining: iterations,
            cap: iterations,
        }
    }

    /// Consume one iteration; returns `true` once the budget is exhausted
    #[inline]
    pub fn tick(&mut self) -> bool {
        if self.remaining == 0 {
            return true;
        }
        self.remaining -= 1;
        false
    }

    /// Check whether the budget is exhausted without consuming it
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.remaining == 0
    }

    /// Number of iterations consumed so far
    pub fn elapsed(&self) -> u32 {
        self.cap - self.remaining
    }

    /// The configured cap
    pub fn cap(&self) -> u32 {
        self.cap
    }
}

/// Poll `f` until it yields a value or `iterations` polls have been made.
///
/// `f` is called at most `iterations` times. A zero budget never calls `f`.
pub fn poll_for<T>(iterations: u32, mut f: impl FnMut() -> Option<T>) -> Option<T> {
    let mut timeout = Timeout::from_iterations(iterations);
    while !timeout.tick() {
        if let Some(value) = f() {
            return Some(value);
        }
        core::hint::spin_loop();
    }
    None
}

/// Poll `cond` until it holds or `iterations` polls have been made
pub fn wait_for(iterations: u32, mut cond: impl FnMut() -> bool) -> bool {
    poll_for(iterations, || cond().then_some(())).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_for_stops_at_cap() {
        let mut calls = 0;
        assert!(!wait_for(25, || {
            calls += 1;
            false
        }));
        assert_eq!(calls, 25);
    }

    #[test]
    fn wait_for_returns_early() {
        let mut calls = 0;
        assert!(wait_for(100, || {
            calls += 1;
            calls == 3
        }));
        assert_eq!(calls, 3);
    }

    #[test]
    fn zero_budget_never_polls() {
        let mut called = false;
        assert_eq!(
            poll_for(0, || {
                called = true;
                Some(1)
            }),
            None
        );
        assert!(!called);
    }

    #[test]
    fn timeout_counts_elapsed() {
        let mut t = Timeout::from_iterations(3);
        assert!(!t.tick());
        assert!(!t.tick());
        assert_eq!(t.elapsed(), 2);
        assert!(!t.tick());
        assert!(t.tick());
        assert!(t.is_expired());
        assert_eq!(t.cap(), 3);
    }
}
