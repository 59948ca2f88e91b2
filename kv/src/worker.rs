//! The per-shard thread: owns one page cache, one slab store, one
//! in-memory index, one GC ring, and one I/O engine exclusively; no other
//! thread ever touches them.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::callback::{Action, Callback, CallbackOutcome};
use crate::clock::rdt_value;
use crate::config::{EngineConfig, TransactionType};
use crate::error::{CResult, Error};
use crate::gc::{GcRing, ObsoleteEntry};
use crate::index::{Action as IndexAction, PrimaryIndex, ReadContext};
use crate::io_engine::IoTransport;
use crate::item::{Item, SlotContent};
use crate::olcp::{LongScan, LongScanRegistry};
use crate::paged_store::PagedStore;
use crate::slab::SlabStore;

/// Builds the worker's `IoTransport`: the `io_uring`-backed transport on a
/// Linux build with the feature enabled, falling back to
/// `BufferedIoTransport` if the ring can't be set up (e.g. no
/// `CAP_SYS_ADMIN` in a container) or the feature is off.
#[cfg(feature = "io_uring")]
fn make_transport(queue_depth: usize) -> Box<dyn IoTransport> {
    match crate::io_engine::uring::UringIoTransport::new(queue_depth.max(1) as u32) {
        Ok(transport) => Box::new(transport),
        Err(err) => {
            log::warn!("io_uring setup failed ({err}), falling back to buffered I/O");
            Box::new(crate::io_engine::BufferedIoTransport::new())
        }
    }
}

#[cfg(not(feature = "io_uring"))]
fn make_transport(_queue_depth: usize) -> Box<dyn IoTransport> {
    Box::new(crate::io_engine::BufferedIoTransport::new())
}

/// Shards a key to its owning worker: every callback is visited by exactly
/// one worker, determined by `prefix(key) mod nb_workers`.
pub fn shard_for_key(key: &[u8], nb_workers: usize) -> usize {
    (crate::item::key_prefix(key) % nb_workers as u64) as usize
}

struct RequestQueue {
    items: Mutex<VecDeque<Callback>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl RequestQueue {
    fn new(capacity: usize) -> Self {
        RequestQueue {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Blocks the injector if the queue is at
    /// `MAX_NB_PENDING_CALLBACKS_PER_WORKER`.
    fn push(&self, callback: Callback) {
        let mut items = self.items.lock();
        while items.len() >= self.capacity {
            self.not_full.wait(&mut items);
        }
        items.push_back(callback);
        self.not_empty.notify_one();
    }

    fn pop_blocking(&self) -> Callback {
        let mut items = self.items.lock();
        while items.is_empty() {
            self.not_empty.wait(&mut items);
        }
        let cb = items.pop_front().unwrap();
        self.not_full.notify_one();
        cb
    }

    fn pop(&self) -> Option<Callback> {
        let mut items = self.items.lock();
        let cb = items.pop_front();
        if cb.is_some() {
            self.not_full.notify_one();
        }
        cb
    }

    fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// A cheaply-cloneable submission handle to a worker's request queue,
/// independent of the `Worker` itself (which a single dedicated thread owns
/// exclusively once running). `crate::engine::Engine` holds one of these per
/// shard to submit callbacks without ever touching the worker's mutable
/// state directly.
#[derive(Clone)]
pub struct QueueHandle(Arc<RequestQueue>);

impl QueueHandle {
    pub fn push(&self, callback: Callback) {
        self.0.push(callback);
    }
}

/// Tracks where a transaction's commit-log record lives in the
/// transactions slab, so `END_TRANSACTION_COMMIT` can find it again.
struct TxnLogSlot {
    slot: u64,
}

pub struct Worker {
    pub id: usize,
    nb_workers: usize,
    paged: PagedStore,
    slabs: SlabStore,
    txn_log: crate::slab::Slab,
    txn_log_slots: HashMap<u64, TxnLogSlot>,
    index: PrimaryIndex,
    gc: GcRing,
    queue: Arc<RequestQueue>,
    transaction_type: TransactionType,
    max_cleaning_op_per_round: usize,
    pub long_scans: LongScanRegistry,
}

impl Worker {
    pub fn open(id: usize, nb_workers: usize, config: &EngineConfig) -> CResult<Self> {
        let data_dir = Path::new(&config.data_dir);
        let slabs = SlabStore::open(
            data_dir,
            id,
            &crate::item::SIZE_CLASSES,
            config.freelist_in_memory_items,
        )?;
        let txn_log_path = data_dir.join(format!("trans-{id}-{}", config.transaction_object_size));
        let txn_log = crate::slab::Slab::open(
            txn_log_path,
            ((id as u64) << 32) | 0xFFFF,
            config.transaction_object_size,
            config.freelist_in_memory_items,
        )?;

        let mut paged = PagedStore::new(config.page_cache_bytes_per_worker(), make_transport(config.queue_depth));
        slabs.register_with_store(&mut paged)?;

        Ok(Worker {
            id,
            nb_workers,
            paged,
            slabs,
            txn_log,
            txn_log_slots: HashMap::new(),
            index: PrimaryIndex::new(),
            gc: GcRing::new(config.maximum_gc_elements),
            queue: Arc::new(RequestQueue::new(config.max_pending_callbacks_per_worker)),
            transaction_type: config.transaction_type,
            max_cleaning_op_per_round: config.max_cleaning_op_per_round,
            long_scans: LongScanRegistry::default(),
        })
    }

    pub fn enqueue(&self, callback: Callback) {
        self.queue.push(callback);
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// A cloneable submission handle, given to `crate::engine::Engine` so it
    /// can enqueue callbacks for this worker after the worker itself has
    /// been moved into its own dedicated thread.
    pub fn queue_handle(&self) -> QueueHandle {
        QueueHandle(Arc::clone(&self.queue))
    }

    /// One iteration of the main loop: harvest one request (if
    /// any), run a GC round, and return whether it did anything. Since this
    /// build's `IoTransport` resolves synchronously (see `crate::io_engine`),
    /// there is no separate "submit pending I/O, reap completions" phase to
    /// interleave — every request completes by the time `step` returns.
    pub fn step(&mut self, handle: &crate::engine_handle::EngineHandle, block: bool) -> CResult<bool> {
        let callback = if block { Some(self.queue.pop_blocking()) } else { self.queue.pop() };
        let did_work = callback.is_some();
        if let Some(callback) = callback {
            self.dispatch_locally(callback, handle)?;
        }
        self.run_gc_round(handle);
        Ok(did_work)
    }

    fn dispatch_locally(
        &mut self,
        mut callback: Callback,
        handle: &crate::engine_handle::EngineHandle,
    ) -> CResult<()> {
        let result = self.handle(&mut callback, handle);
        if let Some(reply) = callback.reply.take() {
            let _ = reply.send(result);
        }
        Ok(())
    }

    /// `worker_dequeue_requests`'s action `switch`.
    pub fn handle(
        &mut self,
        cb: &mut Callback,
        handle: &crate::engine_handle::EngineHandle,
    ) -> CResult<CallbackOutcome> {
        match cb.action {
            Action::Read | Action::ReadForWrite | Action::ReadNoLookup => self.handle_read(cb),
            Action::ReadNext => self.handle_read_next(cb),
            Action::ReadNextBatch => self.handle_read_next_batch(cb),
            Action::Lock => self.handle_lock(cb),
            Action::Revert => self.handle_revert(cb),
            Action::Add => self.handle_add(cb, handle),
            Action::Update => self.handle_update(cb, handle),
            Action::UpdateInPlace => self.handle_update_in_place(cb, handle),
            Action::AddOrUpdateInPlace => {
                if self.index.get(&cb.key).is_some() {
                    self.handle_update_in_place(cb, handle)
                } else {
                    self.handle_add(cb, handle)
                }
            }
            Action::Delete => self.handle_delete(cb, handle),
            Action::StartTransactionCommit => self.handle_start_commit(cb),
            Action::EndTransactionCommit => self.handle_end_commit(cb),
            Action::BeginLongScan => self.handle_begin_long_scan(cb, handle),
            Action::DrainLongScan => self.handle_drain_long_scan(cb),
            Action::EndLongScan => self.handle_end_long_scan(cb, handle),
            Action::IoStats => Ok(CallbackOutcome::IoStats(self.paged.reads_from_disk())),
            Action::Map => Err(Error::Internal("MAP is not dispatched through the worker queue".to_string())),
        }
    }

    fn read_context(&self, cb: &Callback) -> ReadContext {
        match cb.transaction {
            Some(snapshot) => ReadContext::within_transaction(snapshot),
            None => ReadContext::outside_transaction(),
        }
    }

    fn handle_read(&mut self, cb: &mut Callback) -> CResult<CallbackOutcome> {
        let ctx = self.read_context(cb);
        let result = self.index.lookup(&cb.key, &ctx, IndexAction::Read);
        if !result.allowed {
            return Ok(if result.denied { CallbackOutcome::ReadDenied } else { CallbackOutcome::Item(None) });
        }
        match result.entry.and_then(|e| e.slab_idx.map(|idx| (idx, e.slot))) {
            Some((slab_idx, slot)) => {
                let item = self.read_item_at(slab_idx, slot)?;
                Ok(CallbackOutcome::Item(Some(item)))
            }
            None => Ok(CallbackOutcome::Item(None)),
        }
    }

    fn read_item_at(&mut self, slab_idx: usize, slot: u64) -> CResult<Item> {
        match self.slabs.slab(slab_idx).read_item_cached(&mut self.paged, slot)? {
            SlotContent::Item(item) => Ok(item),
            other => Err(Error::Internal(format!("expected a live item at slot {slot}, found {other:?}"))),
        }
    }

    fn handle_read_next(&mut self, cb: &mut Callback) -> CResult<CallbackOutcome> {
        let ctx = self.read_context(cb);
        let max_key_prefix = cb.max_next_key.as_deref().map(crate::item::key_prefix);
        match self.index.lookup_next(&cb.key, &ctx, max_key_prefix) {
            None => Ok(CallbackOutcome::ScanEnd),
            Some((_, result)) => match result.entry.and_then(|e| e.slab_idx.map(|idx| (idx, e.slot, e.key))) {
                Some((slab_idx, slot, key)) => {
                    let item = self.read_item_at(slab_idx, slot)?;
                    cb.next_key = Some(key);
                    Ok(CallbackOutcome::Item(Some(item)))
                }
                None => Ok(CallbackOutcome::ScanEnd),
            },
        }
    }

    fn handle_read_next_batch(&mut self, cb: &mut Callback) -> CResult<CallbackOutcome> {
        let ctx = self.read_context(cb);
        let max_key_prefix = cb.max_next_key.as_deref().map(crate::item::key_prefix);
        let n = cb.value.as_ref().map(|v| v[0] as usize).unwrap_or(1).max(1);
        let located = self.index.lookup_next_batch(&cb.key, &ctx, n, max_key_prefix);
        let mut items = Vec::with_capacity(located.len());
        for (_, entry) in located {
            if let Some(slab_idx) = entry.slab_idx {
                items.push(self.read_item_at(slab_idx, entry.slot)?);
            }
        }
        if items.is_empty() {
            Ok(CallbackOutcome::ScanEnd)
        } else {
            cb.next_key = items.last().map(|item| item.key.clone());
            Ok(CallbackOutcome::Items(items))
        }
    }

    fn handle_lock(&mut self, cb: &mut Callback) -> CResult<CallbackOutcome> {
        let ctx = self.read_context(cb);
        let result = self.index.lookup_and_lock(&cb.key, &ctx);
        if result.allowed {
            Ok(CallbackOutcome::Ack)
        } else {
            Err(Error::Denied(format!("key {:?} is locked or too recent", cb.key)))
        }
    }

    fn handle_revert(&mut self, cb: &mut Callback) -> CResult<CallbackOutcome> {
        self.index.revert(&cb.key)?;
        Ok(CallbackOutcome::Ack)
    }

    fn allocate_rdt(&self, cb: &Callback, handle: &crate::engine_handle::EngineHandle) -> u64 {
        cb.transaction.map(rdt_value).unwrap_or_else(|| handle.clock.next())
    }

    fn handle_add(&mut self, cb: &mut Callback, handle: &crate::engine_handle::EngineHandle) -> CResult<CallbackOutcome> {
        if self.index.get(&cb.key).is_some() {
            return Err(Error::Fatal(format!("duplicate ADD for key {:?}", cb.key)));
        }
        let rdt = self.allocate_rdt(cb, handle);
        let value = cb.value.clone().unwrap_or_default();
        let item = Item::new(rdt, cb.key.clone(), value);
        let slab_idx = self.slabs.slab_index_for_size(item.encoded_len())?;
        let slot = self.slabs.slab_mut(slab_idx).allocate_slot()?;
        self.slabs.slab_mut(slab_idx).write_item_cached(&mut self.paged, slot, &item)?;
        self.index.put_present(cb.key.clone(), slab_idx, slot, rdt)?;
        Ok(CallbackOutcome::Ack)
    }

    /// `UPDATE`: allocates a fresh slot for the new version, preserves the
    /// superseded entry in the MVCC chain if `TransactionType` requires it,
    /// then schedules the old location for GC once no snapshot can read it
    /// any longer.
    fn handle_update(&mut self, cb: &mut Callback, handle: &crate::engine_handle::EngineHandle) -> CResult<CallbackOutcome> {
        let existing = self
            .index
            .get(&cb.key)
            .cloned()
            .ok_or_else(|| Error::Fatal(format!("UPDATE on a key with no primary entry: {:?}", cb.key)))?;
        let (old_slab_idx, old_slot) = existing
            .slab_idx
            .map(|idx| (idx, existing.slot))
            .ok_or_else(|| Error::Fatal("UPDATE on a reservation with no backing slab".to_string()))?;

        let rdt = self.allocate_rdt(cb, handle);
        let value = cb.value.clone().unwrap_or_default();
        let item = Item::new(rdt, cb.key.clone(), value);
        let new_slab_idx = self.slabs.slab_index_for_size(item.encoded_len())?;
        let new_slot = self.slabs.slab_mut(new_slab_idx).allocate_slot()?;
        self.slabs.slab_mut(new_slab_idx).write_item_cached(&mut self.paged, new_slot, &item)?;

        self.push_pre_image_to_long_scans(old_slab_idx, old_slot, rdt)?;

        if self.transaction_type != TransactionType::Fast && handle.nb_active_transactions() > 0 {
            self.index.snapshot_version(&cb.key, rdt);
            self.push_gc(
                ObsoleteEntry::Location { slab_idx: old_slab_idx, slot: old_slot, rdt },
                handle,
            )?;
            self.push_gc(ObsoleteEntry::Key { key: cb.key.clone(), rdt }, handle)?;
        } else {
            self.slabs.slab_mut(old_slab_idx).tombstone_slot_cached(&mut self.paged, old_slot, rdt)?;
        }

        self.index.put_present(cb.key.clone(), new_slab_idx, new_slot, rdt)?;
        cb.old_slab_idx = Some(old_slab_idx);
        cb.old_slot = Some(old_slot);
        Ok(CallbackOutcome::Ack)
    }

    fn handle_update_in_place(&mut self, cb: &mut Callback, handle: &crate::engine_handle::EngineHandle) -> CResult<CallbackOutcome> {
        let existing = self
            .index
            .get(&cb.key)
            .cloned()
            .ok_or_else(|| Error::Fatal(format!("UPDATE_IN_PLACE on a key with no primary entry: {:?}", cb.key)))?;
        let (slab_idx, slot) = existing
            .slab_idx
            .map(|idx| (idx, existing.slot))
            .ok_or_else(|| Error::Fatal("UPDATE_IN_PLACE on a reservation with no backing slab".to_string()))?;
        let rdt = self.allocate_rdt(cb, handle);

        self.push_pre_image_to_long_scans(slab_idx, slot, rdt)?;

        let value = cb.value.clone().unwrap_or_default();
        let item = Item::new(rdt, cb.key.clone(), value);
        self.slabs.slab_mut(slab_idx).write_item_cached(&mut self.paged, slot, &item)?;
        self.index.update_in_place(&cb.key, rdt)?;
        Ok(CallbackOutcome::Ack)
    }

    /// `DELETE`: tombstones the slot on disk, preserving the pre-delete
    /// version in the MVCC chain if needed, and removes the primary entry
    /// so the key reads as absent going forward.
    fn handle_delete(&mut self, cb: &mut Callback, handle: &crate::engine_handle::EngineHandle) -> CResult<CallbackOutcome> {
        let existing = self
            .index
            .get(&cb.key)
            .cloned()
            .ok_or_else(|| Error::Fatal(format!("DELETE on a key with no primary entry: {:?}", cb.key)))?;
        let (slab_idx, slot) = existing
            .slab_idx
            .map(|idx| (idx, existing.slot))
            .ok_or_else(|| Error::Fatal("DELETE on a reservation with no backing slab".to_string()))?;
        let rdt = self.allocate_rdt(cb, handle);

        self.push_pre_image_to_long_scans(slab_idx, slot, rdt)?;

        if self.transaction_type != TransactionType::Fast && handle.nb_active_transactions() > 0 {
            self.index.snapshot_version(&cb.key, rdt);
            self.push_gc(ObsoleteEntry::Location { slab_idx, slot, rdt }, handle)?;
            self.push_gc(ObsoleteEntry::Key { key: cb.key.clone(), rdt }, handle)?;
        } else {
            self.slabs.slab_mut(slab_idx).tombstone_slot_cached(&mut self.paged, slot, rdt)?;
        }
        self.index.delete_present(&cb.key);
        Ok(CallbackOutcome::Ack)
    }

    /// Before a write supersedes `(slab_idx, slot)`, offers its pre-image to
    /// every registered long scan whose open window `(scan.snapshot, rdt]`
    /// still covers the key, so a scan never misses a value it should have
    /// observed just because a concurrent writer raced past its cursor.
    /// A no-op when no long scans are registered, so the common case pays
    /// no extra slab read.
    fn push_pre_image_to_long_scans(&mut self, slab_idx: usize, slot: u64, writer_rdt: u64) -> CResult<()> {
        if self.long_scans.is_empty() {
            return Ok(());
        }
        let pre_image = self.read_item_at(slab_idx, slot)?;
        self.long_scans.push_pre_image(writer_rdt, &pre_image);
        Ok(())
    }

    fn push_gc(&mut self, entry: ObsoleteEntry, handle: &crate::engine_handle::EngineHandle) -> CResult<()> {
        match self.gc.push(entry.clone()) {
            Ok(()) => Ok(()),
            Err(Error::GcRingFull) => {
                // Make room immediately rather than dying outright: run an
                // extra round before giving up, matching the spirit of
                // No throttle/spill policy exists for this case, so we
                // still fail loudly if this doesn't help.
                self.run_gc_round(handle);
                self.gc.push(entry)
            }
            Err(err) => Err(err),
        }
    }

    /// One round of GC: drains obsoleted entries
    /// whose `rdt` has fallen below the minimum active snapshot, tombstoning
    /// reclaimed slab slots and reaping MVCC chain versions.
    fn run_gc_round(&mut self, handle: &crate::engine_handle::EngineHandle) {
        let min_snapshot = handle.min_active_snapshot();
        let slabs = &mut self.slabs;
        let paged = &mut self.paged;
        let index = &mut self.index;
        let keys_to_reap: std::cell::RefCell<Vec<(Vec<u8>, u64)>> = std::cell::RefCell::new(Vec::new());
        self.gc.drain_ready(min_snapshot, self.max_cleaning_op_per_round, |entry| match entry {
            ObsoleteEntry::Location { slab_idx, slot, rdt } => {
                let _ = slabs.slab_mut(slab_idx).tombstone_slot_cached(paged, slot, rdt);
            }
            ObsoleteEntry::Key { key, rdt } => {
                keys_to_reap.borrow_mut().push((key, rdt));
            }
        });
        for (key, rdt) in keys_to_reap.into_inner() {
            index.clean_up_to(&key, rdt);
        }
    }

    fn handle_start_commit(&mut self, cb: &mut Callback) -> CResult<CallbackOutcome> {
        let id_on_disk = crate::transaction::transaction_log_key_to_id(&cb.key);
        let nb_items = cb.value.as_ref().map(|v| u64::from_le_bytes(v[0..8].try_into().unwrap())).unwrap_or(0);
        let item = crate::transaction::item_for_log(cb.key.clone(), id_on_disk, nb_items);
        let slot = self.txn_log.allocate_slot()?;
        self.txn_log.write_item(slot, &item)?;
        self.txn_log_slots.insert(id_on_disk, TxnLogSlot { slot });
        Ok(CallbackOutcome::Ack)
    }

    fn handle_end_commit(&mut self, cb: &mut Callback) -> CResult<CallbackOutcome> {
        let id_on_disk = crate::transaction::transaction_log_key_to_id(&cb.key);
        if let Some(slot) = self.txn_log_slots.remove(&id_on_disk) {
            self.txn_log.tombstone_slot(slot.slot, id_on_disk)?;
        }
        Ok(CallbackOutcome::Ack)
    }

    /// `kv_long_scan`: registers a long-running scan over `[cb.key,
    /// cb.max_next_key)`, pinning its snapshot in `EngineHandle` just like a
    /// transaction so the GC never reclaims a version it could still need.
    /// The transaction id doubles as the scan id.
    fn handle_begin_long_scan(&mut self, cb: &mut Callback, handle: &crate::engine_handle::EngineHandle) -> CResult<CallbackOutcome> {
        let (scan_id, snapshot) = handle.register_new_transaction()?;
        self.long_scans.register(LongScan::new(scan_id, snapshot, cb.key.clone(), cb.max_next_key.clone()));
        Ok(CallbackOutcome::ScanId(scan_id))
    }

    fn handle_drain_long_scan(&mut self, cb: &mut Callback) -> CResult<CallbackOutcome> {
        let scan_id = cb.scan_id.ok_or_else(|| Error::Internal("DRAIN_LONG_SCAN without a scan_id".to_string()))?;
        let items = self.long_scans.drain_pending(scan_id);
        Ok(CallbackOutcome::Items(items))
    }

    fn handle_end_long_scan(&mut self, cb: &mut Callback, handle: &crate::engine_handle::EngineHandle) -> CResult<CallbackOutcome> {
        let scan_id = cb.scan_id.ok_or_else(|| Error::Internal("END_LONG_SCAN without a scan_id".to_string()))?;
        self.long_scans.unregister(scan_id);
        handle.register_end_transaction(scan_id, None);
        Ok(CallbackOutcome::Ack)
    }

    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    /// Used by recovery to rebuild this worker's index and GC-eligible
    /// free lists from its on-disk slabs.
    pub fn recover(&mut self, ignored_rdts: &std::collections::HashSet<u64>) -> CResult<u64> {
        let mut max_rdt = 0u64;
        for slab_idx in 0..self.slabs.slabs().len() {
            let index = &mut self.index;
            let observed = self.slabs.slab_mut(slab_idx).recover(
                |slot, item| {
                    if ignored_rdts.contains(&item.rdt) {
                        return Ok(());
                    }
                    match index.get(&item.key) {
                        Some(existing) if existing.rdt_value() >= item.rdt => {}
                        _ => index.put_present(item.key.clone(), slab_idx, slot, item.rdt)?,
                    }
                    Ok(())
                },
                |_slot, _rdt| {},
            )?;
            max_rdt = max_rdt.max(observed);
        }
        Ok(max_rdt)
    }

    /// Scans the transactions log for commit records without a matching
    /// end marker; every such `rdt` is added to the recovery ignored set.
    pub fn recover_transaction_log(&mut self) -> CResult<std::collections::HashSet<u64>> {
        let mut ignored = std::collections::HashSet::new();
        self.txn_log.recover(
            |_slot, item| {
                ignored.insert(item.rdt);
                Ok(())
            },
            |_slot, _rdt| {},
        )?;
        Ok(ignored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.data_dir = dir.to_string_lossy().to_string();
        cfg.nb_workers = 1;
        cfg
    }

    #[test]
    fn scenario_s1_basic_read_write() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut worker = Worker::open(0, 1, &cfg).unwrap();
        let handle = crate::engine_handle::EngineHandle::new(0, 16);

        let mut add = Callback::new(Action::Add, b"42".to_vec()).with_value(b"hello".to_vec());
        worker.handle(&mut add, &handle).unwrap();

        let mut read = Callback::new(Action::Read, b"42".to_vec());
        match worker.handle(&mut read, &handle).unwrap() {
            CallbackOutcome::Item(Some(item)) => assert_eq!(item.value, b"hello"),
            other => panic!("unexpected {other:?}"),
        }

        let mut update = Callback::new(Action::Update, b"42".to_vec()).with_value(b"world".to_vec());
        worker.handle(&mut update, &handle).unwrap();

        let mut read2 = Callback::new(Action::Read, b"42".to_vec());
        match worker.handle(&mut read2, &handle).unwrap() {
            CallbackOutcome::Item(Some(item)) => assert_eq!(item.value, b"world"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_add_is_fatal() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut worker = Worker::open(0, 1, &cfg).unwrap();
        let handle = crate::engine_handle::EngineHandle::new(0, 16);
        let mut add = Callback::new(Action::Add, b"k".to_vec()).with_value(b"v".to_vec());
        worker.handle(&mut add, &handle).unwrap();
        let mut add2 = Callback::new(Action::Add, b"k".to_vec()).with_value(b"v2".to_vec());
        assert!(matches!(worker.handle(&mut add2, &handle), Err(Error::Fatal(_))));
    }

    #[test]
    fn delete_then_read_returns_nothing() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut worker = Worker::open(0, 1, &cfg).unwrap();
        let handle = crate::engine_handle::EngineHandle::new(0, 16);
        let mut add = Callback::new(Action::Add, b"k".to_vec()).with_value(b"v".to_vec());
        worker.handle(&mut add, &handle).unwrap();
        let mut del = Callback::new(Action::Delete, b"k".to_vec());
        worker.handle(&mut del, &handle).unwrap();
        let mut read = Callback::new(Action::Read, b"k".to_vec());
        match worker.handle(&mut read, &handle).unwrap() {
            CallbackOutcome::Item(None) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn long_scan_push_delivers_the_pre_image_of_a_concurrent_update() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut worker = Worker::open(0, 1, &cfg).unwrap();
        let handle = crate::engine_handle::EngineHandle::new(0, 16);

        let mut add = Callback::new(Action::Add, b"k".to_vec()).with_value(b"before".to_vec());
        worker.handle(&mut add, &handle).unwrap();

        let (scan_id, snapshot) = handle.register_new_transaction().unwrap();
        let mut begin = Callback::new(Action::BeginLongScan, Vec::new())
            .with_value(snapshot.to_le_bytes().to_vec())
            .with_transaction(scan_id);
        worker.handle(&mut begin, &handle).unwrap();

        let mut update = Callback::new(Action::UpdateInPlace, b"k".to_vec()).with_value(b"after".to_vec());
        worker.handle(&mut update, &handle).unwrap();

        let mut drain = Callback::new(Action::DrainLongScan, Vec::new()).with_scan_id(scan_id);
        match worker.handle(&mut drain, &handle).unwrap() {
            CallbackOutcome::Items(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].value, b"before");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn commit_log_round_trips_through_start_and_end() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut worker = Worker::open(0, 1, &cfg).unwrap();
        let handle = crate::engine_handle::EngineHandle::new(0, 16);
        let log_key = crate::transaction::transaction_log_key(7);
        let mut start = Callback::new(Action::StartTransactionCommit, log_key.clone())
            .with_value(3u64.to_le_bytes().to_vec());
        worker.handle(&mut start, &handle).unwrap();
        assert_eq!(worker.txn_log_slots.len(), 1);
        let mut end = Callback::new(Action::EndTransactionCommit, log_key);
        worker.handle(&mut end, &handle).unwrap();
        assert!(worker.txn_log_slots.is_empty());
    }
}
