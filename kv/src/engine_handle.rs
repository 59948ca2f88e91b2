//! Process-wide mutable state, grouped into a single handle threaded
//! explicitly through workers and transactions rather than left as module
//! statics: the global clock, the active-transaction ring, the in-commit
//! priority structure, and the recovery ignored-rdts set.

use std::collections::{BTreeSet, HashSet, VecDeque};

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::{CResult, Error};

/// `running_transactions`: active transactions ordered by insertion,
/// tracking each one's snapshot so the GC can compute the minimum still
/// observable timestamp.
struct ActiveTransactions {
    entries: VecDeque<(u64, u64)>, // (transaction_id, snapshot)
    capacity: usize,
}

/// `in_commit`: a min-priority structure of commit timestamps for
/// transactions that have started (but not finished) their commit, so a
/// freshly begun transaction never reads a value whose write is in flight.
struct InCommit {
    ids: BTreeSet<u64>,
}

pub struct EngineHandle {
    pub clock: Clock,
    active: Mutex<ActiveTransactions>,
    in_commit: Mutex<InCommit>,
    /// Recovery anomaly handling: commit log records found
    /// without a matching end marker. Populated once, before the slab
    /// rescan phase, and read-only afterwards.
    ignored_rdts: Mutex<HashSet<u64>>,
}

impl EngineHandle {
    pub fn new(initial_clock: u64, max_concurrent_transactions: usize) -> Self {
        EngineHandle {
            clock: Clock::new(initial_clock),
            active: Mutex::new(ActiveTransactions {
                entries: VecDeque::new(),
                capacity: max_concurrent_transactions,
            }),
            in_commit: Mutex::new(InCommit { ids: BTreeSet::new() }),
            ignored_rdts: Mutex::new(HashSet::new()),
        }
    }

    /// `register_new_transaction`: assigns `(transaction_id, snapshot)`
    /// where `snapshot = min(global_clock, min_in_commit)`, freezing out
    /// writes that started committing but are not yet fully applied.
    pub fn register_new_transaction(&self) -> CResult<(u64, u64)> {
        let mut active = self.active.lock();
        let transaction_id = self.clock.current();
        let snapshot = self.in_commit.lock().min().unwrap_or(transaction_id).min(transaction_id);
        if active.entries.len() >= active.capacity {
            return Err(Error::Fatal("maximum number of parallel transactions exceeded".to_string()));
        }
        active.entries.push_back((transaction_id, snapshot));
        Ok((transaction_id, snapshot))
    }

    pub fn register_start_commit(&self) -> u64 {
        let rdt = self.clock.next();
        self.in_commit.lock().ids.insert(rdt);
        rdt
    }

    /// `register_end_transaction`: removes `transaction_id` from the active
    /// ring, and `id_on_disk` (if the commit actually registered) from the
    /// in-commit set.
    pub fn register_end_transaction(&self, transaction_id: u64, id_on_disk: Option<u64>) {
        if let Some(id) = id_on_disk {
            self.in_commit.lock().ids.remove(&id);
        }
        let mut active = self.active.lock();
        if let Some(pos) = active.entries.iter().position(|&(id, _)| id == transaction_id) {
            active.entries.remove(pos);
        }
    }

    /// `get_min_snapshot_id`: the oldest still-active transaction's
    /// snapshot, or the current clock value if none are active.
    pub fn min_active_snapshot(&self) -> u64 {
        let active = self.active.lock();
        active.entries.front().map(|&(_, snapshot)| snapshot).unwrap_or_else(|| self.clock.current())
    }

    pub fn nb_active_transactions(&self) -> usize {
        self.active.lock().entries.len()
    }

    pub fn mark_ignored(&self, rdt: u64) {
        self.ignored_rdts.lock().insert(rdt);
    }

    pub fn is_ignored(&self, rdt: u64) -> bool {
        self.ignored_rdts.lock().contains(&rdt)
    }

    pub fn ignored_rdts_snapshot(&self) -> HashSet<u64> {
        self.ignored_rdts.lock().clone()
    }
}

impl InCommit {
    fn min(&self) -> Option<u64> {
        self.ids.iter().next().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_freezes_out_in_flight_commits() {
        let handle = EngineHandle::new(0, 16);
        handle.clock.next(); // rdt = 0
        handle.clock.next(); // rdt = 1
        let in_commit_rdt = handle.register_start_commit(); // rdt = 2, registered
        handle.clock.next(); // rdt = 3, clock now ahead of the in-commit write

        let (_, snapshot) = handle.register_new_transaction().unwrap();
        assert_eq!(snapshot, in_commit_rdt);
    }

    #[test]
    fn ending_a_transaction_frees_its_active_slot() {
        let handle = EngineHandle::new(0, 1);
        let (id, _) = handle.register_new_transaction().unwrap();
        assert!(handle.register_new_transaction().is_err()); // capacity 1, still occupied
        handle.register_end_transaction(id, None);
        assert!(handle.register_new_transaction().is_ok());
    }
}
