//! Sliding-window limiter shared by every poll issued by the engine.
//!
//! Timestamps of permitted calls are kept in arrival order and pruned lazily
//! on each check. The bound is global: all tickets being polled draw from the
//! same window.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            calls: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    fn prune(&self, calls: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = calls.front() {
            if now.duration_since(*oldest) >= self.window {
                calls.pop_front();
            } else {
                break;
            }
        }
    }

    fn wait_locked(&self, calls: &VecDeque<Instant>, now: Instant) -> Duration {
        if calls.len() < self.max_requests {
            return Duration::ZERO;
        }
        match calls.front() {
            Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
            // Zero capacity: nothing will ever free up before a full window.
            None => self.window,
        }
    }

    /// Whether a call would be permitted right now.
    pub fn can_proceed(&self) -> bool {
        let now = Instant::now();
        let mut calls = self.calls.lock();
        self.prune(&mut calls, now);
        calls.len() < self.max_requests
    }

    /// Record a call made now, whether or not it was checked first.
    pub fn record(&self) {
        let now = Instant::now();
        let mut calls = self.calls.lock();
        self.prune(&mut calls, now);
        calls.push_back(now);
    }

    /// Time until the next call would be permitted; zero if allowed now.
    pub fn wait_time(&self) -> Duration {
        let now = Instant::now();
        let mut calls = self.calls.lock();
        self.prune(&mut calls, now);
        self.wait_locked(&calls, now)
    }

    /// Check and record under a single lock. On refusal returns how long to
    /// wait before the window has room again.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut calls = self.calls.lock();
        self.prune(&mut calls, now);
        if calls.len() < self.max_requests {
            calls.push_back(now);
            Ok(())
        } else {
            Err(self.wait_locked(&calls, now))
        }
    }

    /// Wait until a slot is free, then take it.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => {
                    debug!("poll limiter full, waiting {:?}", wait);
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Calls currently counted against the window.
    pub fn in_window(&self) -> usize {
        let now = Instant::now();
        let mut calls = self.calls.lock();
        self.prune(&mut calls, now);
        calls.len()
    }
}
