use std::time::Duration;

/// Exponential reconnect delay: `base`, `2·base`, … capped at `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            next: base.min(cap),
        }
    }

    /// Delay to wait before the next attempt; doubles the one after it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.cap);
        delay
    }

    /// Back to `base` after a successful read.
    pub fn reset(&mut self) {
        self.next = self.base.min(self.cap);
    }
}
