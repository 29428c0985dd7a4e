//! Restart pacing for crashed tool-server subprocesses.

use std::time::Duration;

/// A doubling delay schedule with a cap and a bounded attempt budget.
///
/// `next_delay` yields the pause to take before each restart attempt and
/// `None` once the budget is spent, so the consuming loop cannot retry
/// forever by accident.
pub struct RestartBackoff {
    next: Duration,
    max_delay: Duration,
    remaining: u32,
    made: u32,
}

impl RestartBackoff {
    pub fn new(initial: Duration, max_delay: Duration, attempts: u32) -> Self {
        Self {
            next: initial,
            max_delay,
            remaining: attempts,
            made: 0,
        }
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.made += 1;
        let delay = self.next;
        self.next = (delay * 2).min(self.max_delay);
        Some(delay)
    }

    /// Attempts handed out so far, for log context.
    pub fn attempts_made(&self) -> u32 {
        self.made
    }
}
