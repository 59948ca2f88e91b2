//! Transaction lifecycle: the write buffer, the `trans_read`/`trans_write`
//! entry points, and the commit fast/full paths.
//!
//! Worker threads may never block or re-enter their own request queue, so
//! every step here goes through `Dispatcher::dispatch`: the caller is
//! itself the injector, blocking on a reply channel rather than spinning a
//! callback chain, which gets the same non-reentrancy guarantee without a
//! literal callback-chaining state machine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::callback::{Action, Callback, CallbackOutcome};
use crate::error::{CResult, Error};
use crate::item::Item;

/// One row per state in a transaction's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    CommittingLog,
    CommittingApply,
    CommittingEnd,
    Committed,
    Aborted,
}

#[derive(Debug, Clone)]
struct BufferedWrite {
    value: Vec<u8>,
    is_write: bool,
}

/// Anything that can resolve a single `Callback` against the sharded
/// engine: picks the owning worker by `prefix(key) mod W`, enqueues it, and
/// blocks for the reply. `crate::engine::Engine` is the concrete
/// implementation; `Transaction` is generic over it so this module has no
/// dependency on the worker/engine wiring.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, callback: Callback) -> CResult<CallbackOutcome>;
}

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

pub struct Transaction {
    /// Process-unique identifier distinct from any `rdt`. Keeping a
    /// separate local counter avoids conflating "when this transaction
    /// began" with "the rdt it was assigned", which can differ once the
    /// in-commit minimum is taken into account.
    pub id: u64,
    pub id_on_disk: Option<u64>,
    pub snapshot: u64,
    pub state: TransactionState,
    pub failed: bool,
    pub has_write: bool,
    pub rdt_start: u64,
    write_buffer: HashMap<Vec<u8>, BufferedWrite>,
    dispatcher: Arc<dyn Dispatcher>,
    handle: Arc<crate::engine_handle::EngineHandle>,
}

impl Transaction {
    /// `create_generic_transaction` / `register_new_transaction`: assigns a
    /// snapshot of `min(global_clock, min_in_commit)`.
    pub fn begin(
        dispatcher: Arc<dyn Dispatcher>,
        handle: Arc<crate::engine_handle::EngineHandle>,
    ) -> CResult<Self> {
        let (rdt_start, snapshot) = handle.register_new_transaction()?;
        Ok(Transaction {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::SeqCst),
            id_on_disk: None,
            snapshot,
            state: TransactionState::Active,
            failed: false,
            has_write: false,
            rdt_start,
            write_buffer: HashMap::new(),
            dispatcher,
            handle,
        })
    }

    /// `kv_trans_read`: consult the write buffer first; on miss, issue a
    /// READ against the primary shard. A denied read sets `failed` and
    /// returns `None` to the caller rather than an error.
    pub fn read(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        if self.failed {
            return Ok(None);
        }
        if let Some(buffered) = self.write_buffer.get(key) {
            return Ok(Some(buffered.value.clone()));
        }

        let mut callback = Callback::new(Action::Read, key.to_vec()).with_transaction(self.snapshot);
        callback.transaction = Some(self.snapshot);
        match self.dispatcher.dispatch(callback) {
            Ok(CallbackOutcome::Item(Some(item))) => Ok(Some(item.value)),
            // The key simply has no entry; an ordinary miss, not a reason
            // to fail the transaction (e.g. reading before an insert).
            Ok(CallbackOutcome::Item(None)) => Ok(None),
            // A primary entry exists but this snapshot isn't allowed to
            // see it — a genuine denial.
            Ok(CallbackOutcome::ReadDenied) => {
                self.failed = true;
                Ok(None)
            }
            Ok(_) => Err(Error::Internal("unexpected outcome for READ".to_string())),
            Err(err) => Err(err),
        }
    }

    /// `kv_trans_write`: consult the write buffer; on a second write to an
    /// already-buffered key, update in place (no need to re-lock). On a
    /// true miss, lock the key against the primary shard.
    pub fn write(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        if self.failed {
            return Ok(());
        }
        self.has_write = true;

        if let Some(buffered) = self.write_buffer.get_mut(key) {
            if buffered.is_write {
                buffered.value = value;
                return Ok(());
            }
        }

        let callback = Callback::new(Action::Lock, key.to_vec()).with_transaction(self.snapshot);
        match self.dispatcher.dispatch(callback) {
            Ok(CallbackOutcome::Ack) => {
                self.write_buffer.insert(key.to_vec(), BufferedWrite { value, is_write: true });
                Ok(())
            }
            Ok(_) => Err(Error::Internal("unexpected outcome for LOCK".to_string())),
            Err(Error::Denied(_)) => {
                self.failed = true;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn keys_with_flag(&self, write: bool) -> Vec<Vec<u8>> {
        self.write_buffer
            .iter()
            .filter(|(_, v)| v.is_write == write)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// `kv_commit`: the fast path (revert every lock, no log record) if the
    /// transaction failed or never wrote anything; otherwise the full path
    /// (commit log record, then per-key UPDATE, then an end marker).
    pub fn commit(&mut self) -> CResult<()> {
        self.handle.register_start_commit();
        if self.failed || !self.has_write {
            return self.commit_fast_path();
        }
        self.commit_full_path()
    }

    pub fn abort(&mut self) -> CResult<()> {
        self.failed = true;
        self.commit()
    }

    /// REVERT every locked write key; no log record is ever written, so an
    /// abort or a read-only commit cannot crash mid-way in any observable
    /// state.
    fn commit_fast_path(&mut self) -> CResult<()> {
        for key in self.keys_with_flag(true) {
            let callback = Callback::new(Action::Revert, key).with_transaction(self.id);
            self.dispatcher.dispatch(callback)?;
        }
        self.state = if self.failed { TransactionState::Aborted } else { TransactionState::Committed };
        self.handle.register_end_transaction(self.rdt_start, None);
        Ok(())
    }

    /// Allocate a commit timestamp, persist the log record, apply every
    /// write, then delete the log record. Only a transaction whose end
    /// marker becomes durable is visible after a crash.
    fn commit_full_path(&mut self) -> CResult<()> {
        self.state = TransactionState::CommittingLog;
        let id_on_disk = self.handle.clock.next();
        self.id_on_disk = Some(id_on_disk);

        let log_key = transaction_log_key(id_on_disk);
        let log_value = (self.write_buffer.len() as u64).to_le_bytes().to_vec();
        self.dispatcher.dispatch(
            Callback::new(Action::StartTransactionCommit, log_key.clone()).with_value(log_value),
        )?;

        self.state = TransactionState::CommittingApply;
        for key in self.keys_with_flag(true) {
            let value = self.write_buffer[&key].value.clone();
            let callback = Callback::new(Action::Update, key)
                .with_value(value)
                .with_transaction(id_on_disk);
            self.dispatcher.dispatch(callback)?;
        }

        self.state = TransactionState::CommittingEnd;
        self.dispatcher
            .dispatch(Callback::new(Action::EndTransactionCommit, log_key).with_transaction(id_on_disk))?;

        self.state = TransactionState::Committed;
        self.handle.register_end_transaction(self.rdt_start, Some(id_on_disk));
        Ok(())
    }
}

/// The commit log has its own slab/shard (see `crate::worker`), so this
/// key only has to be unique within the transactions log, not within the
/// shared application key space.
pub fn transaction_log_key(id_on_disk: u64) -> Vec<u8> {
    id_on_disk.to_be_bytes().to_vec()
}

/// Inverse of `transaction_log_key`, used by `crate::worker` to recover the
/// commit id a `StartTransactionCommit`/`EndTransactionCommit` callback's
/// key refers to.
pub fn transaction_log_key_to_id(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = key.len().min(8);
    buf[..n].copy_from_slice(&key[..n]);
    u64::from_be_bytes(buf)
}

pub fn item_for_log(key: Vec<u8>, rdt: u64, nb_items: u64) -> Item {
    Item::new(rdt, key, nb_items.to_le_bytes().to_vec())
}
