//! Sliding-window rate limiter for connection attempts, keyed by remote IP.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    /// Per-IP attempt timestamps inside the window.
    entries: HashMap<IpAddr, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Record an attempt from `ip` if it is allowed.
    ///
    /// Returns `false` when the IP already used up its window.
    pub fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let window = self.window;
        let attempts = self.entries.entry(ip).or_default();
        attempts.retain(|t| now.duration_since(*t) < window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }
        attempts.push(now);
        true
    }

    /// Drop expired entries to bound memory.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    #[test]
    fn limits_per_ip() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check_and_record(A));
        assert!(limiter.check_and_record(A));
        assert!(!limiter.check_and_record(A));
        assert!(limiter.check_and_record(B));
    }

    #[test]
    fn window_expiry_frees_slots() {
        let mut limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.check_and_record(A));
        assert!(!limiter.check_and_record(A));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check_and_record(A));
    }

    #[test]
    fn gc_removes_idle_ips() {
        let mut limiter = RateLimiter::new(5, Duration::from_millis(10));
        limiter.check_and_record(A);
        limiter.check_and_record(B);
        assert_eq!(limiter.tracked(), 2);
        std::thread::sleep(Duration::from_millis(20));
        limiter.gc();
        assert_eq!(limiter.tracked(), 0);
    }
}
