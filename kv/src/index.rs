//! Per-worker in-memory index: an ordered map from 64-bit key prefix to a
//! primary locator, and a parallel ordered map of MVCC chains.
//!
//! Keys are collapsed to an 8-byte prefix for ordering, but each entry
//! also stores the full key so a prefix collision can be detected directly
//! by comparing full stored keys at write time, rather than needing a side
//! channel. A collision is still treated as fatal, aborting the process.

use std::collections::BTreeMap;

use crate::clock::{is_locked, rdt_value, with_locked};
use crate::error::{CResult, Error};
use crate::item::key_prefix;

/// A primary locator: `(slab index, slot)` for a present item, or
/// `slab = None` for a reservation (`rdt` then carries the owning
/// transaction id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub slab_idx: Option<usize>,
    pub slot: u64,
    /// Raw `rdt` word, flag bits included; use `crate::clock` helpers to
    /// read/write the LOCKED and NEW-INDEX bits and the bare timestamp.
    pub rdt: u64,
}

impl IndexEntry {
    pub fn present(key: Vec<u8>, slab_idx: usize, slot: u64, rdt: u64) -> Self {
        IndexEntry { key, slab_idx: Some(slab_idx), slot, rdt }
    }

    pub fn reservation(key: Vec<u8>, txn_id: u64) -> Self {
        IndexEntry { key, slab_idx: None, slot: 0, rdt: txn_id }
    }

    pub fn is_present(&self) -> bool {
        self.slab_idx.is_some()
    }

    pub fn locked(&self) -> bool {
        is_locked(self.rdt)
    }

    pub fn rdt_value(&self) -> u64 {
        rdt_value(self.rdt)
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.rdt = with_locked(self.rdt, locked);
    }
}

/// A phantom ("fake") version or a real superseded entry retained so a
/// reader with an older snapshot does not accidentally see a newer
/// neighbor once the primary slot is reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MvccVersion {
    pub entry: Option<IndexEntry>, // None => fake/phantom version
    pub rdt: u64,
}

#[derive(Debug, Default)]
pub struct MvccChain {
    pub versions: Vec<MvccVersion>,
    pub current_rdt: u64,
}

/// What the caller is trying to do to an entry; used by `action_allowed`
/// to apply the permission matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    ReadNext,
    ReadNextBatch,
    Write,
    StartTransactionCommit,
    EndTransactionCommit,
}

/// Result of resolving a key against the index for a given caller context.
pub struct LookupResult {
    pub entry: Option<IndexEntry>,
    pub allowed: bool,
    /// Set when a primary entry exists for this key but the action was not
    /// permitted against it (too new, locked, or reused past the reader's
    /// snapshot) and no older MVCC version could stand in for it either.
    /// Distinct from "this key has no entry at all" (`denied == false`),
    /// which callers must not treat as a transaction-failing condition.
    pub denied: bool,
}

/// `None` when not inside a transaction.
pub struct ReadContext {
    pub snapshot: Option<u64>,
    pub txn_id_on_disk: Option<u64>,
}

impl ReadContext {
    pub fn outside_transaction() -> Self {
        ReadContext { snapshot: None, txn_id_on_disk: None }
    }

    pub fn within_transaction(snapshot: u64) -> Self {
        ReadContext { snapshot: Some(snapshot), txn_id_on_disk: None }
    }
}

/// Applies the action-permission matrix to an existing entry.
pub fn action_allowed(entry: Option<&IndexEntry>, action: Action, ctx: &ReadContext) -> bool {
    let Some(entry) = entry else { return true };

    match ctx.snapshot {
        None => match action {
            Action::Read | Action::ReadNext | Action::ReadNextBatch => entry.is_present(),
            Action::Write => !entry.locked(),
            Action::StartTransactionCommit => true,
            Action::EndTransactionCommit => {
                ctx.txn_id_on_disk.map(|id| entry.rdt_value() == id).unwrap_or(false)
            }
        },
        Some(snapshot) => match action {
            Action::StartTransactionCommit => true,
            Action::EndTransactionCommit => {
                ctx.txn_id_on_disk.map(|id| entry.rdt_value() == id).unwrap_or(false)
            }
            Action::Read | Action::ReadNext | Action::ReadNextBatch => {
                entry.rdt_value() <= snapshot && entry.is_present()
            }
            Action::Write => !entry.locked() && entry.rdt_value() <= snapshot,
        },
    }
}

pub struct PrimaryIndex {
    entries: BTreeMap<u64, IndexEntry>,
    chains: BTreeMap<u64, MvccChain>,
}

impl Default for PrimaryIndex {
    fn default() -> Self {
        PrimaryIndex { entries: BTreeMap::new(), chains: BTreeMap::new() }
    }
}

impl PrimaryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_collision(&self, prefix: u64, key: &[u8]) -> CResult<()> {
        if let Some(existing) = self.entries.get(&prefix) {
            if existing.key != key {
                return Err(Error::PrefixCollision {
                    existing_key: existing.key.clone(),
                    incoming_key: key.to_vec(),
                });
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<&IndexEntry> {
        self.entries.get(&key_prefix(key))
    }

    /// `lookup(key, snapshot) -> (entry?, allowed)`: resolves the primary
    /// entry, falling back to the MVCC chain for the highest version still
    /// visible at `snapshot` if the primary is not directly readable.
    pub fn lookup(&self, key: &[u8], ctx: &ReadContext, action: Action) -> LookupResult {
        let prefix = key_prefix(key);
        let primary = self.entries.get(&prefix);

        if action_allowed(primary, action, ctx) {
            return LookupResult { entry: primary.cloned(), allowed: true, denied: false };
        }

        let mut result = self.lookup_old_version_for_read(prefix, ctx);
        if !result.allowed {
            // A primary entry exists but this action can't see it (and no
            // older MVCC version could stand in) versus the key simply
            // having no entry at all — callers need to tell these apart.
            result.denied = primary.is_some();
        }
        result
    }

    /// Consults the MVCC chain for the highest version still visible at
    /// `ctx.snapshot`, for callers whose primary-entry check already came
    /// back denied. Shared by `lookup` (point reads) and `lookup_next`/
    /// `lookup_next_batch` (successor walks), which must fall back here
    /// too before skipping a denied key outright.
    fn lookup_old_version_for_read(&self, prefix: u64, ctx: &ReadContext) -> LookupResult {
        if let Some(snapshot) = ctx.snapshot {
            if let Some(chain) = self.chains.get(&prefix) {
                if snapshot >= chain.current_rdt {
                    // The primary has already moved past this reader's
                    // snapshot and the slot may have been reused, so such
                    // a reader must see nothing.
                    return LookupResult { entry: None, allowed: false, denied: false };
                }
                for version in chain.versions.iter().rev() {
                    if version.rdt <= snapshot {
                        if let Some(entry) = &version.entry {
                            return LookupResult { entry: Some(entry.clone()), allowed: true, denied: false };
                        }
                        break; // fake version: nothing readable here
                    }
                }
            }
        }
        LookupResult { entry: None, allowed: false, denied: false }
    }

    /// Strictly-greater-than successor walk, skipping entries the caller
    /// may not observe and retrying with the skipped key as the new lower
    /// bound.
    pub fn lookup_next(
        &self,
        key: &[u8],
        ctx: &ReadContext,
        max_key_prefix: Option<u64>,
    ) -> Option<(u64, LookupResult)> {
        let mut from = key_prefix(key);
        loop {
            let mut range = self.entries.range((
                std::ops::Bound::Excluded(from),
                std::ops::Bound::Unbounded,
            ));
            let (prefix, entry) = range.next()?;
            if let Some(limit) = max_key_prefix {
                if *prefix >= limit {
                    return None;
                }
            }
            if action_allowed(Some(entry), Action::ReadNext, ctx) {
                return Some((*prefix, LookupResult { entry: Some(entry.clone()), allowed: true, denied: false }));
            }
            let fallback = self.lookup_old_version_for_read(*prefix, ctx);
            if fallback.allowed {
                return Some((*prefix, fallback));
            }
            from = *prefix;
        }
    }

    /// Collects up to `n` successors in one walk (used by scans).
    pub fn lookup_next_batch(
        &self,
        key: &[u8],
        ctx: &ReadContext,
        n: usize,
        max_key_prefix: Option<u64>,
    ) -> Vec<(u64, IndexEntry)> {
        let mut out = Vec::with_capacity(n);
        let mut from = key_prefix(key);
        while out.len() < n {
            match self.lookup_next(&from.to_be_bytes(), ctx, max_key_prefix) {
                Some((prefix, result)) => {
                    if let Some(entry) = result.entry {
                        out.push((prefix, entry));
                    }
                    from = prefix;
                }
                None => break,
            }
        }
        out
    }

    /// Inserts or updates a present entry for `key`, checking for prefix
    /// collisions first.
    pub fn put_present(&mut self, key: Vec<u8>, slab_idx: usize, slot: u64, rdt: u64) -> CResult<()> {
        let prefix = key_prefix(&key);
        self.check_collision(prefix, &key)?;
        self.entries.insert(prefix, IndexEntry::present(key, slab_idx, slot, rdt));
        Ok(())
    }

    /// `reserve(key, txn)`: inserts a locked entry with no backing slab, a
    /// promise that a transaction will materialize this key.
    pub fn reserve(&mut self, key: Vec<u8>, txn_id: u64) -> CResult<()> {
        let prefix = key_prefix(&key);
        self.check_collision(prefix, &key)?;
        let mut entry = IndexEntry::reservation(key, txn_id);
        entry.set_locked(true);
        self.entries.insert(prefix, entry);
        Ok(())
    }

    /// `lookup_and_lock(key, txn) -> (entry?, present, allowed)`: sets the
    /// LOCKED bit if the write is allowed.
    pub fn lookup_and_lock(&mut self, key: &[u8], ctx: &ReadContext) -> LookupResult {
        let prefix = key_prefix(key);
        let primary_exists = self.entries.contains_key(&prefix);
        let allowed = action_allowed(self.entries.get(&prefix), Action::Write, ctx);
        if allowed {
            if let Some(entry) = self.entries.get_mut(&prefix) {
                entry.set_locked(true);
                return LookupResult { entry: Some(entry.clone()), allowed: true, denied: false };
            }
        }
        LookupResult { entry: self.entries.get(&prefix).cloned(), allowed, denied: !allowed && primary_exists }
    }

    /// `revert(key, txn)`: on abort, removes a pure reservation or simply
    /// unlocks an existing entry.
    pub fn revert(&mut self, key: &[u8]) -> CResult<()> {
        let prefix = key_prefix(key);
        match self.entries.get(&prefix) {
            None => Err(Error::Fatal("revert called on an entry that does not exist".to_string())),
            Some(entry) if !entry.is_present() => {
                self.entries.remove(&prefix);
                Ok(())
            }
            Some(_) => {
                let entry = self.entries.get_mut(&prefix).unwrap();
                if !entry.locked() {
                    return Err(Error::Fatal("unlocking a never-locked entry".to_string()));
                }
                entry.set_locked(false);
                Ok(())
            }
        }
    }

    /// Pushes the current primary entry into its MVCC chain before
    /// overwriting it, inserting a fake version first if the chain's last
    /// known `current_rdt` has drifted from the entry's `rdt`.
    pub fn snapshot_version(&mut self, key: &[u8], txn_id: u64) {
        let prefix = key_prefix(key);
        let Some(current) = self.entries.get(&prefix).cloned() else { return };

        let chain = self.chains.entry(prefix).or_default();
        if chain.current_rdt != 0 && chain.current_rdt != current.rdt_value() {
            chain.versions.push(MvccVersion { entry: None, rdt: chain.current_rdt });
        }
        let current_rdt = current.rdt_value();
        chain.versions.push(MvccVersion { entry: Some(current), rdt: current_rdt });
        chain.current_rdt = txn_id;
    }

    /// Reaps MVCC versions matching an exact `rdt`, used when a snapshot transaction's GC entry
    /// fires.
    pub fn clean_specific(&mut self, key: &[u8], rdt: u64) {
        let prefix = key_prefix(key);
        if let Some(chain) = self.chains.get_mut(&prefix) {
            chain.versions.retain(|v| v.rdt != rdt);
        }
    }

    /// Reaps MVCC versions whose `rdt` is strictly below `snapshot`,
    /// returning the freed entries so the caller can release their slab
    /// slots.
    pub fn clean_up_to(&mut self, key: &[u8], snapshot: u64) -> Vec<IndexEntry> {
        let prefix = key_prefix(key);
        let mut freed = Vec::new();
        if let Some(chain) = self.chains.get_mut(&prefix) {
            let mut retained = Vec::with_capacity(chain.versions.len());
            for version in chain.versions.drain(..) {
                if version.rdt < snapshot {
                    if let Some(entry) = version.entry {
                        freed.push(entry);
                    }
                } else {
                    retained.push(version);
                }
            }
            chain.versions = retained;
        }
        freed
    }

    /// Removes the primary entry outright (a DELETE
    /// tombstones the on-disk slot and the key no longer has a live
    /// primary entry; readers of an older snapshot still resolve it
    /// through the MVCC chain via `snapshot_version`, called first).
    pub fn delete_present(&mut self, key: &[u8]) {
        self.entries.remove(&key_prefix(key));
    }

    /// Overwrites a present entry's location/slot in place, used by
    /// `UPDATE_IN_PLACE`: no new slot is allocated and no
    /// MVCC version is retained, so this is only valid for
    /// `TransactionType::Fast` callers.
    pub fn update_in_place(&mut self, key: &[u8], rdt: u64) -> CResult<()> {
        let prefix = key_prefix(key);
        let entry = self
            .entries
            .get_mut(&prefix)
            .ok_or_else(|| Error::Fatal("update_in_place on a key with no primary entry".to_string()))?;
        entry.rdt = rdt;
        Ok(())
    }

    pub fn chain(&self, key: &[u8]) -> Option<&MvccChain> {
        self.chains.get(&key_prefix(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_no_txn_requires_present_and_unlocked() {
        let mut idx = PrimaryIndex::new();
        idx.put_present(b"k".to_vec(), 0, 0, 1).unwrap();
        let ctx = ReadContext::outside_transaction();
        let result = idx.lookup(b"k", &ctx, Action::Read);
        assert!(result.allowed);
        assert!(result.entry.is_some());
    }

    #[test]
    fn snapshot_read_denies_entries_too_recent() {
        let mut idx = PrimaryIndex::new();
        idx.put_present(b"k".to_vec(), 0, 0, 10).unwrap();
        let ctx = ReadContext::within_transaction(5);
        let result = idx.lookup(b"k", &ctx, Action::Read);
        assert!(!result.allowed);
    }

    #[test]
    fn prefix_collision_is_fatal() {
        let mut idx = PrimaryIndex::new();
        idx.put_present(b"\x00\x00\x00\x00\x00\x00\x00\x01abc".to_vec(), 0, 0, 1).unwrap();
        let err = idx.put_present(b"\x00\x00\x00\x00\x00\x00\x00\x01xyz".to_vec(), 0, 1, 2);
        assert!(matches!(err, Err(Error::PrefixCollision { .. })));
    }

    #[test]
    fn revert_of_reservation_removes_entry() {
        let mut idx = PrimaryIndex::new();
        idx.reserve(b"k".to_vec(), 99).unwrap();
        idx.revert(b"k").unwrap();
        assert!(idx.get(b"k").is_none());
    }

    #[test]
    fn revert_of_locked_present_entry_unlocks() {
        let mut idx = PrimaryIndex::new();
        idx.put_present(b"k".to_vec(), 0, 0, 1).unwrap();
        let ctx = ReadContext::outside_transaction();
        idx.lookup_and_lock(b"k", &ctx);
        assert!(idx.get(b"k").unwrap().locked());
        idx.revert(b"k").unwrap();
        assert!(!idx.get(b"k").unwrap().locked());
    }

    #[test]
    fn snapshot_isolation_reads_the_version_visible_at_snapshot() {
        let mut idx = PrimaryIndex::new();
        idx.put_present(b"k".to_vec(), 0, 0, 1).unwrap(); // v1 at rdt=1
        idx.snapshot_version(b"k", 5); // superseded at commit rdt=5
        idx.put_present(b"k".to_vec(), 0, 1, 5).unwrap(); // v2 now primary

        let old_reader = ReadContext::within_transaction(2);
        let result = idx.lookup(b"k", &old_reader, Action::Read);
        assert!(result.allowed);
        assert_eq!(result.entry.unwrap().rdt_value(), 1);

        let new_reader = ReadContext::within_transaction(10);
        let result = idx.lookup(b"k", &new_reader, Action::Read);
        assert!(result.allowed);
        assert_eq!(result.entry.unwrap().rdt_value(), 5);
    }

    #[test]
    fn clean_up_to_reaps_versions_older_than_snapshot() {
        let mut idx = PrimaryIndex::new();
        idx.put_present(b"k".to_vec(), 0, 0, 1).unwrap();
        idx.snapshot_version(b"k", 5);
        let freed = idx.clean_up_to(b"k", 5);
        assert_eq!(freed.len(), 1);
        assert_eq!(idx.chain(b"k").unwrap().versions.len(), 0);
    }
}
