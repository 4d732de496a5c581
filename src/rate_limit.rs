//! Fixed-window rate limiting keyed by client identity
//!
//! Each identity gets a counter that lives for one window. The first request
//! in a window (or the first after the window has lapsed) starts a fresh
//! bucket; once the counter reaches the limit, further requests are refused
//! without consuming anything. Buckets are disposable: losing them on restart
//! only refreshes everyone's allowance.
use bon::Builder;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One identity's counter for the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBucket {
    pub count: u32,
    /// Epoch milliseconds at which this bucket's window lapses.
    pub window_reset_at: u64,
}

/// The verdict for one request, carrying everything the response headers need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch milliseconds at which the client's window resets.
    pub reset_at: u64,
}

/// Shared bucket storage, injectable so callers can share or pre-seed it.
pub type BucketStore = Arc<DashMap<String, RateBucket>>;

/// A fixed-window limiter over a shared [`BucketStore`].
#[derive(Debug, Clone, Builder)]
pub struct RateLimiter {
    /// Requests permitted per identity per window.
    pub limit: u32,
    /// Window length.
    pub window: Duration,
    #[builder(default)]
    pub buckets: BucketStore,
}

impl RateLimiter {
    /// Account one request against `identity` and decide whether it may proceed.
    pub fn check(&self, identity: &str) -> RateDecision {
        self.check_at(identity, now_millis())
    }

    fn check_at(&self, identity: &str, now: u64) -> RateDecision {
        let window_ms = self.window.as_millis() as u64;
        // The entry guard pins the map shard, so the read-modify-write is
        // atomic per identity.
        match self.buckets.entry(identity.to_string()) {
            Entry::Vacant(slot) => {
                let reset_at = now + window_ms;
                slot.insert(RateBucket {
                    count: 1,
                    window_reset_at: reset_at,
                });
                self.decision(true, self.limit.saturating_sub(1), reset_at)
            }
            Entry::Occupied(mut slot) => {
                let bucket = slot.get_mut();
                if now > bucket.window_reset_at {
                    *bucket = RateBucket {
                        count: 1,
                        window_reset_at: now + window_ms,
                    };
                    self.decision(true, self.limit.saturating_sub(1), bucket.window_reset_at)
                } else if bucket.count >= self.limit {
                    self.decision(false, 0, bucket.window_reset_at)
                } else {
                    bucket.count += 1;
                    self.decision(
                        true,
                        self.limit.saturating_sub(bucket.count),
                        bucket.window_reset_at,
                    )
                }
            }
        }
    }

    fn decision(&self, allowed: bool, remaining: u32, reset_at: u64) -> RateDecision {
        RateDecision {
            allowed,
            limit: self.limit,
            remaining,
            reset_at,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
