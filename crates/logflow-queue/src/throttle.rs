//! Simple token-bucket throttle, used by destination workers to cap the
//! rate at which items are pulled off a queue (§4.4 throttle timer).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Refills at `limit` tokens per second, capped at `limit` tokens
/// banked. `try_take` returns how many of the requested tokens were
/// actually available, so callers can take a partial batch rather than
/// being turned away entirely.
pub struct Throttle {
    limit_per_sec: u64,
    tokens: AtomicI64,
    last_refill_nanos: AtomicU64,
    start: Instant,
}

impl Throttle {
    pub fn new(limit_per_sec: u64) -> Self {
        Self {
            limit_per_sec,
            tokens: AtomicI64::new(limit_per_sec as i64),
            last_refill_nanos: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    fn refill(&self) {
        if self.limit_per_sec == 0 {
            return;
        }
        let now_nanos = self.start.elapsed().as_nanos() as u64;
        let last = self.last_refill_nanos.load(Ordering::Acquire);
        let elapsed_nanos = now_nanos.saturating_sub(last);
        if elapsed_nanos == 0 {
            return;
        }
        let new_tokens = (elapsed_nanos as u128 * self.limit_per_sec as u128 / 1_000_000_000u128) as i64;
        if new_tokens == 0 {
            return;
        }
        if self
            .last_refill_nanos
            .compare_exchange(last, now_nanos, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let cap = self.limit_per_sec as i64;
            self.tokens
                .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |t| {
                    Some((t + new_tokens).min(cap))
                })
                .ok();
        }
    }

    /// Request up to `want` tokens; returns how many were granted (may be
    /// 0 if the bucket is empty, and less than `want` under partial
    /// availability).
    pub fn try_take(&self, want: u32) -> u32 {
        if self.limit_per_sec == 0 {
            return want;
        }
        self.refill();
        let want = want as i64;
        let granted = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |t| {
                Some(t - t.min(want).max(0))
            })
            .map(|prev| prev.min(want).max(0))
            .unwrap_or(0);
        granted as u32
    }

    /// Time until at least one token will be available, for scheduling a
    /// throttle-timeout retry.
    pub fn time_until_token(&self) -> Duration {
        if self.limit_per_sec == 0 || self.tokens.load(Ordering::Acquire) > 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(1_000_000_000 / self.limit_per_sec.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unthrottled_grants_everything() {
        let t = Throttle::new(0);
        assert_eq!(t.try_take(1_000_000), 1_000_000);
    }

    #[test]
    fn bucket_starts_full_then_drains() {
        let t = Throttle::new(10);
        assert_eq!(t.try_take(10), 10);
        assert_eq!(t.try_take(1), 0);
    }
}
