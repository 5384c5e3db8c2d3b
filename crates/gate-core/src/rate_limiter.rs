// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Rate Limiter (C9, spec §4.9): a process-wide gate in front of every
//! upstream call, combining a FIFO-waiter concurrency cap, a minimum
//! inter-request interval, and a 429-triggered backoff window. Grounded on
//! the upstream's `GlobalRateLimiter`, reworked as an explicit struct
//! instead of a module-level singleton so callers construct and share one
//! instance through their own wiring.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

#[derive(Debug, Default, Clone, Copy)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_429s: u64,
    pub total_wait: Duration,
    pub max_queue_len: usize,
}

struct Inner {
    active: usize,
    waiters: VecDeque<Arc<Notify>>,
    last_release: Option<Instant>,
    pause_until: Option<Instant>,
    stats: RateLimiterStats,
}

/// A permit that must be released exactly once. Dropping without releasing
/// leaks the slot; callers should hold it across the upstream call and
/// release in a `finally`-equivalent path.
pub struct Permit<'a> {
    limiter: &'a GlobalRateLimiter,
    released: bool,
}

impl<'a> Permit<'a> {
    pub async fn release(mut self) {
        self.limiter.release().await;
        self.released = true;
    }
}

impl<'a> Drop for Permit<'a> {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!("rate limiter permit dropped without explicit release");
        }
    }
}

pub struct GlobalRateLimiter {
    max_concurrent: usize,
    min_interval: Duration,
    backoff_429: Duration,
    inner: Mutex<Inner>,
}

impl GlobalRateLimiter {
    pub fn new(max_concurrent: usize, min_interval: Duration, backoff_429: Duration) -> Self {
        Self {
            max_concurrent,
            min_interval,
            backoff_429,
            inner: Mutex::new(Inner {
                active: 0,
                waiters: VecDeque::new(),
                last_release: None,
                pause_until: None,
                stats: RateLimiterStats::default(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_concurrent > 0 || !self.min_interval.is_zero() || !self.backoff_429.is_zero()
    }

    /// Acquires a slot, honoring the concurrency cap, minimum interval, and
    /// any active 429 backoff window, in that order.
    pub async fn acquire(&self) -> Permit<'_> {
        let started = Instant::now();

        if self.max_concurrent > 0 {
            self.acquire_slot().await;
        }

        let (interval_wait, pause_wait) = {
            let mut guard = self.inner.lock().await;
            let now = Instant::now();
            let mut interval_wait = Duration::ZERO;
            if !self.min_interval.is_zero() {
                if let Some(last) = guard.last_release {
                    let elapsed = now.duration_since(last);
                    if elapsed < self.min_interval {
                        interval_wait = self.min_interval - elapsed;
                    }
                }
            }
            let pause_wait = guard.pause_until.map(|until| until.saturating_duration_since(now)).unwrap_or(Duration::ZERO);
            guard.stats.total_requests += 1;
            (interval_wait, pause_wait)
        };

        let wait = interval_wait.max(pause_wait);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let mut guard = self.inner.lock().await;
        guard.stats.total_wait += started.elapsed();

        Permit { limiter: self, released: false }
    }

    /// Blocks until either under the concurrency cap or signaled as the next
    /// waiter in FIFO order.
    async fn acquire_slot(&self) {
        let notify = {
            let mut guard = self.inner.lock().await;
            if guard.active < self.max_concurrent {
                guard.active += 1;
                return;
            }
            let notify = Arc::new(Notify::new());
            guard.waiters.push_back(notify.clone());
            guard.stats.max_queue_len = guard.stats.max_queue_len.max(guard.waiters.len());
            notify
        };
        notify.notified().await;
    }

    /// Releases a slot. If a waiter is queued, the slot is handed directly
    /// to it (the active counter is not decremented) rather than letting a
    /// fresh `acquire` race it for the newly freed capacity.
    async fn release(&self) {
        let mut guard = self.inner.lock().await;
        guard.last_release = Some(Instant::now());
        if self.max_concurrent == 0 {
            return;
        }
        if let Some(next) = guard.waiters.pop_front() {
            next.notify_one();
        } else {
            guard.active = guard.active.saturating_sub(1);
        }
    }

    /// Called when the upstream returns a 429. Extends (never shortens) the
    /// backoff window every subsequent `acquire` must wait out.
    pub async fn on_429_received(&self) {
        if self.backoff_429.is_zero() {
            return;
        }
        let mut guard = self.inner.lock().await;
        guard.stats.total_429s += 1;
        let candidate = Instant::now() + self.backoff_429;
        guard.pause_until = Some(match guard.pause_until {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        });
    }

    pub async fn stats(&self) -> RateLimiterStats {
        self.inner.lock().await.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_limiter_never_waits() {
        let limiter = GlobalRateLimiter::new(0, Duration::ZERO, Duration::ZERO);
        assert!(!limiter.is_enabled());
        let permit = limiter.acquire().await;
        permit.release().await;
    }

    #[tokio::test]
    async fn concurrency_cap_queues_and_passes_the_slot() {
        let limiter = Arc::new(GlobalRateLimiter::new(1, Duration::ZERO, Duration::ZERO));
        let first = limiter.acquire().await;

        let limiter2 = limiter.clone();
        let handle = tokio::spawn(async move {
            let permit = limiter2.acquire().await;
            permit.release().await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        first.release().await;
        handle.await.unwrap();

        let stats = limiter.stats().await;
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.max_queue_len, 1);
    }

    #[tokio::test]
    async fn on_429_extends_but_never_shortens_pause_window() {
        let limiter = GlobalRateLimiter::new(0, Duration::ZERO, Duration::from_millis(50));
        limiter.on_429_received().await;
        let first_pause = limiter.inner.lock().await.pause_until.unwrap();
        limiter.on_429_received().await;
        let second_pause = limiter.inner.lock().await.pause_until.unwrap();
        assert!(second_pause >= first_pause);
    }
}
