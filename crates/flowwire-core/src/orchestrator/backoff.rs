// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Poll backoff for workers that find the queue empty.

use std::time::Duration;

/// Consecutive misses counted before the delay stops growing.
pub const MAX_MISSES: u32 = 20;

/// Upper bound on the delay after a miss.
pub const MAX_POLL_DELAY: Duration = Duration::from_secs(1);

/// Delay after a store fault.
pub const FAULT_DELAY: Duration = Duration::from_secs(1);

/// Linear backoff: `min(misses * poll_interval, 1s)`, reset by a hit.
#[derive(Debug, Clone)]
pub struct PollingBackoff {
    poll_interval: Duration,
    misses: u32,
}

impl PollingBackoff {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            misses: 0,
        }
    }

    /// Record an empty poll and return how long to wait.
    pub fn miss(&mut self) -> Duration {
        self.misses = (self.misses + 1).min(MAX_MISSES);
        self.poll_interval
            .saturating_mul(self.misses)
            .min(MAX_POLL_DELAY)
    }

    pub fn hit(&mut self) {
        self.misses = 0;
    }

    /// Wait after a store fault. Leaves the miss count alone.
    pub fn fault(&self) -> Duration {
        FAULT_DELAY
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_linearly() {
        let mut backoff = PollingBackoff::new(Duration::from_millis(10));
        assert_eq!(backoff.miss(), Duration::from_millis(10));
        assert_eq!(backoff.miss(), Duration::from_millis(20));
        assert_eq!(backoff.miss(), Duration::from_millis(30));
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = PollingBackoff::new(Duration::from_millis(200));
        let delays: Vec<_> = (0..30).map(|_| backoff.miss()).collect();
        assert_eq!(delays[4], MAX_POLL_DELAY);
        assert_eq!(delays[29], MAX_POLL_DELAY);
        assert_eq!(backoff.misses(), MAX_MISSES);

        let mut slow = PollingBackoff::new(Duration::from_millis(20));
        for _ in 0..100 {
            slow.miss();
        }
        // 20 misses * 20ms stays below the cap
        assert_eq!(slow.miss(), Duration::from_millis(400));
    }

    #[test]
    fn test_hit_resets() {
        let mut backoff = PollingBackoff::new(Duration::from_millis(50));
        backoff.miss();
        backoff.miss();
        backoff.hit();
        assert_eq!(backoff.misses(), 0);
        assert_eq!(backoff.miss(), Duration::from_millis(50));
    }

    #[test]
    fn test_fault_delay() {
        let mut backoff = PollingBackoff::new(Duration::from_millis(50));
        backoff.miss();
        assert_eq!(backoff.fault(), FAULT_DELAY);
        assert_eq!(backoff.misses(), 1);
    }
}
