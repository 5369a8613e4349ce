//! Consumer-side deduplication of redelivered messages.
//!
//! Remembers correlation tokens for a fixed TTL. Eviction is amortized: every
//! `sweep_every`-th call sweeps expired records before the check. The store is
//! a sharded concurrent map, so the check-and-insert is a single atomic entry
//! operation and the sweep only ever locks one shard at a time.
//!
//! Single-process and in-memory: a restart, or a second consumer process,
//! starts with an empty record.

use crate::model::{CorrelationToken, DedupRecord};
use crate::telemetry::metrics;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Default time a token is remembered.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Default sweep stride, in calls.
pub const DEFAULT_SWEEP_EVERY: u64 = 100;

/// Millisecond clock used to timestamp records.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Bounded-memory record of recently seen correlation tokens.
pub struct Deduplicator {
    seen: DashMap<CorrelationToken, i64>,
    ttl_millis: i64,
    sweep_every: u64,
    calls: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl Deduplicator {
    pub fn new(ttl: Duration, sweep_every: u64) -> Self {
        Self::with_clock(ttl, sweep_every, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, sweep_every: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            seen: DashMap::new(),
            ttl_millis: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            sweep_every: sweep_every.max(1),
            calls: AtomicU64::new(0),
            clock,
        }
    }

    /// `true` exactly once per token until its record expires and is swept.
    ///
    /// A duplicate sighting leaves the original timestamp in place, so
    /// redeliveries never extend a token's TTL.
    pub fn first_time_seen(&self, token: CorrelationToken) -> bool {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        if call % self.sweep_every == 0 {
            self.sweep();
        }

        match self.seen.entry(token) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(self.clock.now_millis());
                true
            }
        }
    }

    /// Remove every record older than the TTL. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let cutoff = self.clock.now_millis().saturating_sub(self.ttl_millis);
        let before = self.seen.len();
        self.seen.retain(|_, first_seen| *first_seen >= cutoff);
        let evicted = before.saturating_sub(self.seen.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.seen.len(), "dedup sweep");
            metrics::dedup_evictions().add(evicted as u64, &[]);
        }
        evicted
    }

    pub fn record(&self, token: CorrelationToken) -> Option<DedupRecord> {
        self.seen.get(&token).map(|entry| DedupRecord {
            token,
            first_seen_at_millis: *entry.value(),
        })
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_SWEEP_EVERY)
    }
}
