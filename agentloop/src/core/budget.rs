//! Shared time budget helpers for deadline-bounded waits.

use std::time::{Duration, Instant};

/// Longest wait a deadline can express; longer budgets are clamped to it.
pub const MAX_BUDGET: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + budget` without overflow. Budgets past [`MAX_BUDGET`] mean "no deadline".
pub fn deadline_after(now: Instant, budget: Duration) -> Instant {
    now.checked_add(budget.min(MAX_BUDGET))
        .or_else(|| now.checked_add(Duration::from_secs(u64::from(u32::MAX))))
        .unwrap_or(now)
}

/// Time left until `deadline`, zero once it has passed.
pub fn remaining_budget(deadline: Instant) -> Duration {
    deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::ZERO)
}

/// Wait slice for polling loops: the remaining budget capped at `tick`.
pub fn next_tick(deadline: Instant, tick: Duration) -> Duration {
    remaining_budget(deadline).min(tick)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn past_deadline_has_no_budget() {
        let deadline = Instant::now() - Duration::from_millis(5);
        assert_eq!(remaining_budget(deadline), Duration::ZERO);
    }

    #[test]
    fn huge_budgets_do_not_overflow() {
        let now = Instant::now();
        let deadline = deadline_after(now, Duration::MAX);
        assert!(deadline > now + Duration::from_secs(365 * 24 * 60 * 60));
        assert_eq!(deadline_after(now, Duration::from_secs(3)), now + Duration::from_secs(3));
    }

    #[test]
    fn tick_caps_the_wait() {
        let deadline = Instant::now() + Duration::from_secs(60);
        assert_eq!(next_tick(deadline, Duration::from_millis(50)), Duration::from_millis(50));
    }
}
