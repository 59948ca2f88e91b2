//! Deferred reclamation of obsoleted primary-index locations and MVCC
//! versions: a per-worker bounded ring, drained from the head whenever an
//! entry's "next version" timestamp falls below the minimum active
//! snapshot.
//!
//! `ObsoleteEntry` splits on `TransactionType`: a `Long`-mode entry carries
//! a direct `(slab, idx)` location, while any other mode carries a key
//! prefix resolved back through the in-memory index's MVCC cleanup.

use std::collections::VecDeque;

use crate::error::{CResult, Error};

#[derive(Debug, Clone)]
pub enum ObsoleteEntry {
    /// `TRANSACTION_TYPE == LONG`: a direct slab location whose slot can be
    /// reclaimed once `rdt` is no longer observable.
    Location { slab_idx: usize, slot: u64, rdt: u64 },
    /// `FAST`/`SNAPSHOT`: a key whose MVCC chain should be reaped up to
    /// `rdt` once no active snapshot needs it.
    Key { key: Vec<u8>, rdt: u64 },
}

impl ObsoleteEntry {
    pub fn rdt(&self) -> u64 {
        match self {
            ObsoleteEntry::Location { rdt, .. } => *rdt,
            ObsoleteEntry::Key { rdt, .. } => *rdt,
        }
    }
}

/// A fixed-capacity ring of entries awaiting safe reclamation. Once full,
/// registering a new entry is a fatal condition (`Error::GcRingFull`)
/// rather than throttling producers or spilling to disk.
pub struct GcRing {
    entries: VecDeque<ObsoleteEntry>,
    capacity: usize,
}

impl GcRing {
    pub fn new(capacity: usize) -> Self {
        GcRing { entries: VecDeque::new(), capacity }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends to the tail. The ring is monotonically appended: entries
    /// are non-decreasing in `rdt` since timestamps only grow, so a drain
    /// can stop its scan at the first entry still visible.
    pub fn push(&mut self, entry: ObsoleteEntry) -> CResult<()> {
        if self.entries.len() >= self.capacity {
            return Err(Error::GcRingFull);
        }
        self.entries.push_back(entry);
        Ok(())
    }

    /// `do_deletions`: drains entries from the head whose `rdt` is strictly
    /// below `min_active_snapshot`, invoking `apply` for each, up to
    /// `max_per_round` entries.
    /// Stops at the first entry still visible to some active snapshot,
    /// since the ring is ordered by non-decreasing `rdt`.
    pub fn drain_ready(
        &mut self,
        min_active_snapshot: u64,
        max_per_round: usize,
        mut apply: impl FnMut(ObsoleteEntry),
    ) -> usize {
        let mut drained = 0;
        while drained < max_per_round {
            match self.entries.front() {
                Some(entry) if entry.rdt() < min_active_snapshot => {
                    let entry = self.entries.pop_front().unwrap();
                    apply(entry);
                    drained += 1;
                }
                _ => break,
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_only_entries_below_the_min_snapshot() {
        let mut ring = GcRing::new(16);
        ring.push(ObsoleteEntry::Key { key: b"a".to_vec(), rdt: 1 }).unwrap();
        ring.push(ObsoleteEntry::Key { key: b"b".to_vec(), rdt: 5 }).unwrap();
        ring.push(ObsoleteEntry::Key { key: b"c".to_vec(), rdt: 10 }).unwrap();

        let mut freed = Vec::new();
        let drained = ring.drain_ready(6, 100, |e| freed.push(e));
        assert_eq!(drained, 2);
        assert_eq!(ring.len(), 1);
        assert!(matches!(freed[0], ObsoleteEntry::Key { rdt: 1, .. }));
        assert!(matches!(freed[1], ObsoleteEntry::Key { rdt: 5, .. }));
    }

    #[test]
    fn max_per_round_caps_a_single_drain() {
        let mut ring = GcRing::new(16);
        for i in 0..10 {
            ring.push(ObsoleteEntry::Key { key: vec![i], rdt: i as u64 }).unwrap();
        }
        let drained = ring.drain_ready(100, 3, |_| {});
        assert_eq!(drained, 3);
        assert_eq!(ring.len(), 7);
    }

    #[test]
    fn overflow_is_fatal() {
        let mut ring = GcRing::new(1);
        ring.push(ObsoleteEntry::Key { key: b"a".to_vec(), rdt: 1 }).unwrap();
        assert!(matches!(ring.push(ObsoleteEntry::Key { key: b"b".to_vec(), rdt: 2 }), Err(Error::GcRingFull)));
    }
}
