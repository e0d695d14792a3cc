use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Sliding-window limiter shared by every node call.
///
/// Each caller reserves the earliest instant at which one more request fits in the window,
/// then sleeps until that instant outside the lock. Reservations are handed out in lock order, so
/// admission is first come, first served. It never rejects.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    /// Start instants of issued or reserved requests, non-decreasing.
    slots: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn per_second(limit: usize) -> Self {
        Self::with_window(limit, Duration::from_secs(1))
    }

    pub fn with_window(limit: usize, window: Duration) -> Self {
        let limit = limit.max(1);
        RateLimiter {
            limit,
            window,
            slots: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    /// Waits until one more request fits in the current window.
    ///
    /// Dropping the future while it sleeps gives up the wait but not the slot, which simply
    /// expires with its window.
    pub async fn acquire(&self) {
        let slot = self.reserve().await;
        sleep_until(slot).await;
    }

    async fn reserve(&self) -> Instant {
        let mut slots = self.slots.lock().await;
        let now = Instant::now();
        while slots
            .front()
            .is_some_and(|&oldest| now.duration_since(oldest) >= self.window)
        {
            slots.pop_front();
        }
        let slot = if slots.len() < self.limit {
            now
        } else {
            // The request `limit` places back must have left the window first.
            (slots[slots.len() - self.limit] + self.window).max(now)
        };
        slots.push_back(slot);
        slot
    }
}
