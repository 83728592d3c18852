//! Duplicate suppression for platform retries.
//!
//! The platform re-delivers a callback when it does not see a timely 200.
//! Keys seen within the TTL are reported as duplicates.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct DedupCache {
    ttl: Duration,
    seen: HashMap<String, Instant>,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: HashMap::new(),
        }
    }

    /// `true` the first time `key` is offered within the TTL.
    pub fn first_seen(&mut self, key: &str) -> bool {
        let now = Instant::now();
        match self.seen.get(key) {
            Some(at) if now.duration_since(*at) < self.ttl => false,
            _ => {
                self.seen.insert(key.to_string(), now);
                true
            }
        }
    }

    pub fn gc(&mut self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.seen.retain(|_, at| now.duration_since(*at) < ttl);
    }

    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.seen.len()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
