//! Tagged request/continuation records.
//!
//! A `Callback` is the unit of work a client ("injector") submits to a
//! worker's request queue: an `Action`, the key/value it targets, and
//! whatever transaction/location bookkeeping the worker needs while
//! resolving it. The continuation is a typed channel rather than a raw
//! function pointer: the worker sends the outcome back on `reply` once the
//! operation (and any I/O it required) completes.

use crossbeam_channel::Sender;

use crate::error::CResult;
use crate::item::Item;

/// `ReadNoLookup` and `AddOrUpdateInPlace` are carried even though the
/// engine's public API (`crate::engine::Engine`) does not expose every one
/// of them directly, since `Transaction`/`olcp` construct them internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Update,
    UpdateInPlace,
    AddOrUpdateInPlace,
    Delete,
    Read,
    ReadNoLookup,
    ReadForWrite,
    ReadNext,
    ReadNextBatch,
    Lock,
    Revert,
    StartTransactionCommit,
    EndTransactionCommit,
    Map,
    /// Registers a new long-running scan over `[key, max_next_key)` against
    /// this shard's index, snapshotted at the rdt in `value`.
    BeginLongScan,
    /// Drains pre-images concurrent writers have pushed to `scan_id` since
    /// the last drain.
    DrainLongScan,
    EndLongScan,
    /// Reports this shard's cumulative count of page-cache misses that
    /// required an actual disk fetch, for observability/tests.
    IoStats,
}

impl Action {
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Action::Add
                | Action::Update
                | Action::UpdateInPlace
                | Action::AddOrUpdateInPlace
                | Action::Delete
        )
    }
}

/// What a worker does with a callback's continuation once its operation
/// completes: run it inline on the worker thread, or hand it to
/// an injector queue so it can safely issue further KV operations (workers
/// themselves must never block or recurse into their own request queue).
#[derive(Clone)]
pub enum Dispatch {
    Here,
    Enqueue(InjectorQueue),
}

/// A per-context queue that lets a continuation safely issue further KV
/// operations. Backed by `crossbeam-channel`, matching the engine's other
/// MPSC plumbing.
#[derive(Clone)]
pub struct InjectorQueue {
    sender: Sender<Callback>,
}

impl InjectorQueue {
    pub fn new(sender: Sender<Callback>) -> Self {
        InjectorQueue { sender }
    }

    pub fn push(&self, callback: Callback) -> CResult<()> {
        self.sender
            .send(callback)
            .map_err(|_| crate::error::Error::Fatal("injector queue receiver dropped".to_string()))
    }
}

/// What a completed callback hands back to its continuation.
#[derive(Debug, Clone)]
pub enum CallbackOutcome {
    /// `READ`/`READ_FOR_WRITE`/single-key results. `Item(None)` means the
    /// key simply has no entry; it is not a denial.
    Item(Option<Item>),
    /// `READ_NEXT`/`READ_NEXT_BATCH` results, in ascending key order.
    Items(Vec<Item>),
    /// Acknowledgement with no payload (`ADD`, `UPDATE`, `DELETE`,
    /// `LOCK`/`REVERT`, commit markers).
    Ack,
    /// A scan has reached `max_next_key`; no more batches follow.
    ScanEnd,
    /// `BEGIN_LONG_SCAN`: the id the caller must use for subsequent
    /// `READ_NEXT_BATCH`/`DRAIN_LONG_SCAN`/`END_LONG_SCAN` calls.
    ScanId(u64),
    /// `READ`: a primary entry exists for this key but the snapshot
    /// couldn't see it (too new, locked, or reused past the reader's
    /// snapshot) and no older MVCC version could stand in for it either.
    /// Distinct from `Item(None)`, which is an ordinary missing key.
    ReadDenied,
    /// `IO_STATS`: this shard's cumulative page-cache-miss count.
    IoStats(u64),
}

/// The unit of work enqueued on a worker's request queue.
pub struct Callback {
    pub action: Action,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub transaction: Option<u64>,

    /// Set by the worker once `lookup`/`lookup_and_lock` resolves a
    /// location; read back by the caller to drive a subsequent I/O step.
    pub slab_idx: Option<usize>,
    pub slot: Option<u64>,

    /// When an UPDATE supersedes a value still visible to some snapshot,
    /// the old location is recorded here so the GC can reclaim it once no
    /// transaction can observe it any longer.
    pub old_slab_idx: Option<usize>,
    pub old_slot: Option<u64>,
    pub needs_cleanup: bool,

    /// `READ_NEXT`/`READ_NEXT_BATCH`: the key actually observed, used by
    /// the caller to detect a race against a concurrently recycled slot.
    pub next_key: Option<Vec<u8>>,
    /// End-exclusive bound for a scan.
    pub max_next_key: Option<Vec<u8>>,
    pub raced: bool,
    pub failed: bool,

    /// `BEGIN_LONG_SCAN`/`DRAIN_LONG_SCAN`/`END_LONG_SCAN`: the scan this
    /// callback addresses.
    pub scan_id: Option<u64>,

    pub dispatch: Dispatch,
    pub reply: Option<Sender<CResult<CallbackOutcome>>>,
}

impl Callback {
    pub fn new(action: Action, key: Vec<u8>) -> Self {
        Callback {
            action,
            key,
            value: None,
            transaction: None,
            slab_idx: None,
            slot: None,
            old_slab_idx: None,
            old_slot: None,
            needs_cleanup: false,
            next_key: None,
            max_next_key: None,
            raced: false,
            failed: false,
            scan_id: None,
            dispatch: Dispatch::Here,
            reply: None,
        }
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_transaction(mut self, txn_id: u64) -> Self {
        self.transaction = Some(txn_id);
        self
    }

    pub fn with_reply(mut self, reply: Sender<CResult<CallbackOutcome>>) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn with_scan_id(mut self, scan_id: u64) -> Self {
        self.scan_id = Some(scan_id);
        self
    }
}
