//! Token bucket gating submissions to the cloud pool.
//!
//! The bucket is owned by a single conductor and never persisted. Time comes
//! from an injected [`Clock`] so tests can advance it by hand.

use std::time::{Duration, Instant};

/// Source of monotonic time.
pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug)]
pub struct RateBudget<C: Clock = SystemClock> {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    clock: C,
}

impl RateBudget<SystemClock> {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self::with_clock(capacity, refill_per_sec, SystemClock)
    }
}

impl<C: Clock> RateBudget<C> {
    /// A full bucket reading time from `clock`.
    pub fn with_clock(capacity: f64, refill_per_sec: f64, clock: C) -> Self {
        let last_refill = clock.now();
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill,
            clock,
        }
    }

    /// Accrues tokens for the time elapsed since the previous refill, capped at capacity.
    pub fn refill(&mut self) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let accrued = elapsed * self.refill_per_sec;
        if accrued > 0.0 {
            self.tokens = (self.tokens + accrued).min(self.capacity);
            self.last_refill = now;
        }
    }

    pub fn has_token(&self) -> bool {
        self.tokens >= 1.0
    }

    /// Spends one token. Callers check [`has_token`](Self::has_token) first.
    pub fn consume(&mut self) {
        self.tokens = (self.tokens - 1.0).max(0.0);
    }

    /// Time until a whole token is available, measured from the last refill.
    /// A bucket that never refills waits forever.
    pub fn wait_time(&self) -> Duration {
        if self.has_token() {
            return Duration::ZERO;
        }
        if !(self.refill_per_sec > 0.0) {
            return Duration::MAX;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}
