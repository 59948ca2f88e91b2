//! The `rdt` timestamp: a 62-bit monotonic counter shared across shards,
//! with its two high bits used as the LOCKED and NEW-INDEX flags carried
//! inside a primary index entry.
//!
//! The bits are packed directly into the on-disk/in-memory `rdt` word
//! (rather than widening `IndexEntry` with separate bool fields) because
//! the flags and the timestamp really do share one comparison/ordering
//! domain — a locked entry's raw `rdt` must still sort the same way
//! relative to other `rdt`s once masked.

use std::sync::atomic::{AtomicU64, Ordering};

const LOCKED_BIT: u64 = 1 << 63;
const NEW_INDEX_BIT: u64 = 1 << 62;
const VALUE_MASK: u64 = !(LOCKED_BIT | NEW_INDEX_BIT);

/// A process-wide or per-worker monotonic source of `rdt` values. Globally
/// unique and monotonic across shards; every write obtains a fresh `rdt` by
/// calling `fetch_and_add` on the clock.
#[derive(Debug, Default)]
pub struct Clock(AtomicU64);

impl Clock {
    pub fn new(initial: u64) -> Self {
        Clock(AtomicU64::new(initial & VALUE_MASK))
    }

    /// Allocates the next timestamp.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) & VALUE_MASK
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst) & VALUE_MASK
    }

    /// Bumps the clock forward to at least `value`, used by workers to
    /// refresh their local view to the global max and by recovery to seed
    /// the initial value from the highest observed on-disk `rdt`.
    pub fn advance_to_at_least(&self, value: u64) {
        let value = value & VALUE_MASK;
        let mut current = self.0.load(Ordering::SeqCst);
        while current < value {
            match self.0.compare_exchange_weak(
                current,
                value,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Strips the flag bits, returning the bare timestamp value used for
/// ordering and visibility comparisons.
pub fn rdt_value(raw: u64) -> u64 {
    raw & VALUE_MASK
}

pub fn is_locked(raw: u64) -> bool {
    raw & LOCKED_BIT != 0
}

pub fn is_new_index(raw: u64) -> bool {
    raw & NEW_INDEX_BIT != 0
}

pub fn with_locked(raw: u64, locked: bool) -> u64 {
    if locked {
        raw | LOCKED_BIT
    } else {
        raw & !LOCKED_BIT
    }
}

pub fn with_new_index(raw: u64, new_index: bool) -> u64 {
    if new_index {
        raw | NEW_INDEX_BIT
    } else {
        raw & !NEW_INDEX_BIT
    }
}
