//! # Per-Connection Sliding-Window Rate Limiting
//!
//! Admission control protecting each world from message flooding. Every
//! connection owns an ordered window of the timestamps of its admitted
//! messages; a new message is admitted only while fewer than the configured
//! maximum fall inside the trailing window.
//!
//! ## Algorithm
//!
//! On each admission check the window is pruned lazily: timestamps that have
//! aged past the window duration are left-trimmed (the remainder stays
//! chronologically ordered because insertion order is chronological). If the
//! surviving count has reached the maximum, the message is rejected WITHOUT
//! recording the attempt, so a client spamming past the limit cannot push
//! its own history out of the window; only admitted messages occupy slots.
//!
//! ## Lifetime
//!
//! Windows are created lazily on a connection's first message and must be
//! released exactly once on disconnect, bounding memory to currently-live
//! connections. The table itself carries a secondary LRU bound so a release
//! bug cannot grow it without limit.
//!
//! ## Concurrency
//!
//! Not safe for uncoordinated concurrent use on one connection id. The relay
//! actor owns the limiter and mutates it from a single task, which enforces
//! this structurally.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::identity::ConnId;

/// Default trailing window duration.
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_millis(10_000);

/// Default maximum admitted messages per window.
pub const DEFAULT_RATE_MAX_IN_WINDOW: usize = 5;

/// Maximum connections tracked by the limiter table.
/// SECURITY: Bounds the rate limiter itself; explicit release on disconnect
/// is the primary bound, this is the backstop.
pub const MAX_RATE_ENTRIES: usize = 10_000;

/// Sliding-window admission control, keyed by connection id.
pub struct RateLimiter {
    windows: LruCache<ConnId, VecDeque<Instant>>,
    window: Duration,
    max_in_window: usize,
}

impl RateLimiter {
    pub fn new(window: Duration, max_in_window: usize) -> Self {
        let cap = NonZeroUsize::new(MAX_RATE_ENTRIES)
            .expect("MAX_RATE_ENTRIES must be non-zero");
        Self {
            windows: LruCache::new(cap),
            window,
            max_in_window,
        }
    }

    /// Decide whether a message arriving at `now` may be forwarded.
    ///
    /// Prunes the connection's window, then either records `now` and admits,
    /// or rejects without recording. `now` is a parameter rather than read
    /// internally so tests can drive the clock.
    pub fn admit(&mut self, conn: ConnId, now: Instant) -> bool {
        let window = self.window;
        let times = self.windows.get_or_insert_mut(conn, VecDeque::new);

        while let Some(front) = times.front() {
            if now.duration_since(*front) >= window {
                times.pop_front();
            } else {
                break;
            }
        }

        if times.len() >= self.max_in_window {
            return false;
        }

        times.push_back(now);
        true
    }

    /// Discard a connection's window. Called exactly once, on disconnect.
    pub fn release(&mut self, conn: ConnId) {
        self.windows.pop(&conn);
    }

    /// Number of connections currently tracked. Telemetry only.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}
