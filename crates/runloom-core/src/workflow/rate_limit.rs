//! Fixed-window rate limiter for step `rateLimit` specs.
//!
//! Windows are keyed by the spec's `key`, so steps sharing a key (across
//! runs and workflows) share a budget. A window opens on first use and
//! resets once `perSeconds` has elapsed; counts are not sliding. State is
//! process-local.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use runloom_types::workflow::RateLimitSpec;

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Executions counted in the current window, this one included.
    pub current: u32,
    /// Time until the current window resets.
    pub retry_after: Duration,
}

struct Window {
    opened_at: Instant,
    count: u32,
}

/// Process-local fixed-window limiter.
#[derive(Default)]
pub struct RateLimiter {
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter::default()
    }

    /// Count one execution against the spec's window and decide.
    pub fn check(&self, spec: &RateLimitSpec) -> RateLimitDecision {
        self.check_at(spec, Instant::now())
    }

    fn check_at(&self, spec: &RateLimitSpec, now: Instant) -> RateLimitDecision {
        let window_len = Duration::from_secs(spec.per_seconds);
        let mut entry = self
            .windows
            .entry(spec.key.clone())
            .or_insert_with(|| Window {
                opened_at: now,
                count: 0,
            });

        if now.duration_since(entry.opened_at) >= window_len {
            entry.opened_at = now;
            entry.count = 0;
        }
        entry.count += 1;

        let elapsed = now.duration_since(entry.opened_at);
        RateLimitDecision {
            allowed: entry.count <= spec.max,
            current: entry.count,
            retry_after: window_len.saturating_sub(elapsed),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
