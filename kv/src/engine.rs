//! The public storage engine: spins up one dedicated OS thread per shard
//! worker, routes every operation to its owning shard by key hash, and
//! implements `crate::transaction::Dispatcher` so `Transaction` can issue
//! its READ/LOCK/UPDATE/commit-marker callbacks without knowing anything
//! about threads or queues.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;

use crate::callback::{Action, Callback, CallbackOutcome};
use crate::config::EngineConfig;
use crate::error::{CResult, Error};
use crate::engine_handle::EngineHandle;
use crate::transaction::{Dispatcher, Transaction};
use crate::worker::{shard_for_key, QueueHandle, Worker};

/// Upper bound on transactions that may be simultaneously active before
/// `Transaction::begin` fails.
const MAX_CONCURRENT_TRANSACTIONS: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct EngineStatus {
    pub nb_workers: usize,
    pub active_transactions: usize,
    pub current_rdt: u64,
}

pub struct Engine {
    nb_workers: usize,
    queues: Vec<QueueHandle>,
    handle: Arc<EngineHandle>,
}

impl Engine {
    /// Opens (or creates) the engine's data directory, recovers every
    /// worker's index from its slabs and transactions log, then spawns one
    /// thread per worker to start serving requests.
    pub fn open(config: EngineConfig) -> CResult<Self> {
        let handle = Arc::new(EngineHandle::new(0, MAX_CONCURRENT_TRANSACTIONS));

        let mut workers: Vec<Worker> = (0..config.nb_workers)
            .map(|id| Worker::open(id, config.nb_workers, &config))
            .collect::<CResult<Vec<_>>>()?;

        let max_rdt = crate::recovery::recover(&mut workers, &handle)?;
        log::info!("recovered {} workers up to rdt {max_rdt}", workers.len());

        let queues: Vec<QueueHandle> = workers.iter().map(Worker::queue_handle).collect();

        for worker in workers {
            let worker_handle = Arc::clone(&handle);
            let worker_id = worker.id;
            thread::Builder::new()
                .name(format!("kv-worker-{worker_id}"))
                .spawn(move || run_worker_loop(worker, worker_handle))
                .map_err(|err| Error::Fatal(format!("failed to spawn worker {worker_id}: {err}")))?;
        }

        Ok(Engine { nb_workers: config.nb_workers, queues, handle })
    }

    fn shard_for(&self, key: &[u8]) -> usize {
        shard_for_key(key, self.nb_workers)
    }

    fn dispatch_to(&self, shard: usize, mut callback: Callback) -> CResult<CallbackOutcome> {
        let (reply_tx, reply_rx) = bounded(1);
        callback.reply = Some(reply_tx);
        self.queues[shard].push(callback);
        reply_rx.recv().map_err(|_| Error::Internal("worker reply channel closed".to_string()))?
    }

    /// Routes by the key's owning shard.
    fn dispatch(&self, callback: Callback) -> CResult<CallbackOutcome> {
        let shard = self.shard_for(&callback.key);
        self.dispatch_to(shard, callback)
    }

    pub fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        match self.dispatch(Callback::new(Action::Read, key.to_vec()))? {
            CallbackOutcome::Item(item) => Ok(item.map(|i| i.value)),
            // Outside a transaction there is no `failed` flag to set; a
            // denied read (e.g. the key is locked by an in-flight writer)
            // just looks like a miss to a plain, non-transactional caller.
            CallbackOutcome::ReadDenied => Ok(None),
            other => Err(Error::Internal(format!("unexpected outcome for READ: {other:?}"))),
        }
    }

    /// Non-transactional upsert. Routes through `AddOrUpdateInPlace`, i.e.
    /// `TransactionType::Fast` semantics (no MVCC chain entry is retained
    /// for the overwritten value) regardless of the engine's configured
    /// default, since a caller outside any transaction has no snapshot to
    /// preserve for. Transactional writers get full MVCC preservation via
    /// `Transaction::write` + `commit`.
    pub fn put(&self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        let callback = Callback::new(Action::AddOrUpdateInPlace, key.to_vec()).with_value(value);
        match self.dispatch(callback)? {
            CallbackOutcome::Ack => Ok(()),
            other => Err(Error::Internal(format!("unexpected outcome for PUT: {other:?}"))),
        }
    }

    pub fn delete(&self, key: &[u8]) -> CResult<()> {
        match self.dispatch(Callback::new(Action::Delete, key.to_vec()))? {
            CallbackOutcome::Ack => Ok(()),
            other => Err(Error::Internal(format!("unexpected outcome for DELETE: {other:?}"))),
        }
    }

    /// Gathers up to `limit` keys at or after `start_key` (and, if given,
    /// strictly before `end_key`) in ascending order. Since the primary
    /// index is sharded by key hash rather than range, this issues a
    /// `READ_NEXT_BATCH` to every shard and merges the results, rather than
    /// a single ordered walk.
    pub fn scan(
        &self,
        start_key: Vec<u8>,
        end_key: Option<Vec<u8>>,
        limit: usize,
    ) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged = Vec::new();
        for shard in 0..self.nb_workers {
            let mut cursor = start_key.clone();
            let mut collected_from_shard = 0usize;
            // The worker's READ_NEXT_BATCH encodes the batch width into a
            // single byte, so a per-shard `limit` over 255 has to be served
            // as several rounds per shard rather than one capped round.
            loop {
                let remaining = limit.saturating_sub(collected_from_shard);
                if remaining == 0 {
                    break;
                }
                let requested = remaining.min(u8::MAX as usize);
                let mut callback = Callback::new(Action::ReadNextBatch, cursor.clone())
                    .with_value(vec![requested as u8]);
                callback.max_next_key = end_key.clone();
                match self.dispatch_to(shard, callback)? {
                    CallbackOutcome::Items(items) => {
                        let exhausted = items.len() < requested;
                        if let Some(last) = items.last() {
                            cursor = bump_key(&last.key);
                        }
                        collected_from_shard += items.len();
                        merged.extend(items.into_iter().map(|item| (item.key, item.value)));
                        if exhausted {
                            break;
                        }
                    }
                    CallbackOutcome::ScanEnd => break,
                    other => return Err(Error::Internal(format!("unexpected outcome for READ_NEXT_BATCH: {other:?}"))),
                }
            }
        }
        merged.sort_by(|a, b| a.0.cmp(&b.0));
        merged.truncate(limit);
        Ok(merged)
    }

    /// `kv_begin_transaction`: starts a new MVCC transaction bound to this
    /// engine. Requires `Arc<Engine>` since the transaction outlives any
    /// single call and must keep the dispatcher alive.
    pub fn begin(self: &Arc<Self>) -> CResult<Transaction> {
        Transaction::begin(self.clone() as Arc<dyn Dispatcher>, Arc::clone(&self.handle))
    }

    /// `kv_long_scan`: starts a scan over `[start_key, end_key)` that stays
    /// open across multiple `next_batch` calls, snapshotted at the moment of
    /// this call. Registers with every shard so each one knows to push the
    /// pre-image of any key it is about to overwrite while the scan's
    /// cursor has not yet passed it.
    pub fn begin_long_scan(
        self: &Arc<Self>,
        start_key: Vec<u8>,
        end_key: Option<Vec<u8>>,
    ) -> CResult<LongScanHandle> {
        let (id, snapshot) = self.handle.register_new_transaction()?;
        for shard in 0..self.nb_workers {
            let mut callback = Callback::new(Action::BeginLongScan, start_key.clone())
                .with_value(snapshot.to_le_bytes().to_vec())
                .with_transaction(id);
            callback.max_next_key = end_key.clone();
            match self.dispatch_to(shard, callback)? {
                CallbackOutcome::Ack => {}
                other => return Err(Error::Internal(format!("unexpected outcome for BEGIN_LONG_SCAN: {other:?}"))),
            }
        }
        Ok(LongScanHandle { id, snapshot, cursor: start_key, end_key, engine: Arc::clone(self), done: false })
    }

    /// Cumulative count of page-cache misses that required an actual disk
    /// fetch on `shard`'s worker, since the engine opened.
    pub fn io_reads_from_disk(&self, shard: usize) -> CResult<u64> {
        match self.dispatch_to(shard, Callback::new(Action::IoStats, Vec::new()))? {
            CallbackOutcome::IoStats(count) => Ok(count),
            other => Err(Error::Internal(format!("unexpected outcome for IO_STATS: {other:?}"))),
        }
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            nb_workers: self.nb_workers,
            active_transactions: self.handle.nb_active_transactions(),
            current_rdt: self.handle.clock.current(),
        }
    }
}

impl Dispatcher for Engine {
    fn dispatch(&self, callback: Callback) -> CResult<CallbackOutcome> {
        Engine::dispatch(self, callback)
    }
}

/// A cursor over an open long scan: each `next_batch` call pulls
/// the next ordered slice of keys and delivers any pre-images concurrent
/// writers pushed to it since the previous call. Must be closed with `end`
/// once the caller is done, so the scan's pinned snapshot stops holding
/// back GC.
pub struct LongScanHandle {
    id: u64,
    snapshot: u64,
    cursor: Vec<u8>,
    end_key: Option<Vec<u8>>,
    engine: Arc<Engine>,
    done: bool,
}

impl LongScanHandle {
    /// Returns up to `limit` items: first, any pre-images pushed to this
    /// scan since the last call, then the next ordered slice from each
    /// shard's index bounded by the scan's own snapshot. An empty result
    /// means the scan has drained every shard and has nothing pending;
    /// the caller should stop calling.
    pub fn next_batch(&mut self, limit: usize) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        if self.done {
            return Ok(Vec::new());
        }
        let mut merged = Vec::new();
        let mut any_more = false;

        for shard in 0..self.engine.nb_workers {
            let drain_cb = Callback::new(Action::DrainLongScan, Vec::new()).with_scan_id(self.id);
            if let CallbackOutcome::Items(items) = self.engine.dispatch_to(shard, drain_cb)? {
                merged.extend(items.into_iter().map(|item| (item.key, item.value)));
            }

            let mut pull_cb = Callback::new(Action::ReadNextBatch, self.cursor.clone())
                .with_value(vec![limit.min(u8::MAX as usize) as u8])
                .with_transaction(self.snapshot);
            pull_cb.max_next_key = self.end_key.clone();
            match self.engine.dispatch_to(shard, pull_cb)? {
                CallbackOutcome::Items(items) => {
                    any_more = true;
                    merged.extend(items.into_iter().map(|item| (item.key, item.value)));
                }
                CallbackOutcome::ScanEnd => {}
                other => {
                    return Err(Error::Internal(format!("unexpected outcome for READ_NEXT_BATCH: {other:?}")))
                }
            }
        }

        merged.sort_by(|a, b| a.0.cmp(&b.0));
        merged.dedup_by(|a, b| a.0 == b.0);
        merged.truncate(limit);

        if let Some((last_key, _)) = merged.last() {
            self.cursor = bump_key(last_key);
        }
        if !any_more && merged.is_empty() {
            self.done = true;
        }
        Ok(merged)
    }

    /// `kv_end_long_scan`: unpins the scan's snapshot and drops its
    /// registration from every shard.
    pub fn end(self) -> CResult<()> {
        for shard in 0..self.engine.nb_workers {
            let callback = Callback::new(Action::EndLongScan, Vec::new()).with_scan_id(self.id);
            self.engine.dispatch_to(shard, callback)?;
        }
        Ok(())
    }
}

/// The smallest key strictly greater than `key` under byte-lexicographic
/// order, used to advance a long scan's pull cursor past the last key it
/// already delivered.
fn bump_key(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}

/// `worker_slab_init`'s main loop: block for the next callback, dispatch
/// it, run a GC round, repeat. Runs for the lifetime of the process; there
/// is no graceful per-worker shutdown since `Engine`'s lifetime is the
/// program's lifetime in every caller this crate supports.
fn run_worker_loop(mut worker: Worker, handle: Arc<EngineHandle>) {
    loop {
        if let Err(err) = worker.step(&handle, true) {
            log::error!("worker {} encountered a fatal error: {err}", worker.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.data_dir = dir.to_string_lossy().to_string();
        cfg.nb_workers = 2;
        cfg
    }

    #[test]
    fn put_get_delete_round_trip() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        engine.put(b"a", b"1".to_vec()).unwrap();
        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
        engine.put(b"a", b"2".to_vec()).unwrap();
        assert_eq!(engine.get(b"a").unwrap(), Some(b"2".to_vec()));
        engine.delete(b"a").unwrap();
        assert_eq!(engine.get(b"a").unwrap(), None);
    }

    #[test]
    fn scan_merges_results_across_shards() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        for key in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()] {
            engine.put(&key, key.clone()).unwrap();
        }
        let results = engine.scan(b"".to_vec(), None, 10).unwrap();
        let keys: Vec<_> = results.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn scan_serves_a_limit_above_255_in_a_single_shard() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.nb_workers = 1;
        let engine = Engine::open(cfg).unwrap();
        for i in 0..300u32 {
            let key = format!("{i:05}").into_bytes();
            engine.put(&key, key.clone()).unwrap();
        }
        let results = engine.scan(Vec::new(), None, 300).unwrap();
        assert_eq!(results.len(), 300);
        let keys: Vec<_> = results.into_iter().map(|(k, _)| k).collect();
        let mut expected: Vec<_> = (0..300u32).map(|i| format!("{i:05}").into_bytes()).collect();
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[test]
    fn transactional_write_is_visible_after_commit() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(Engine::open(test_config(dir.path())).unwrap());
        let mut txn = engine.begin().unwrap();
        txn.write(b"k", b"v".to_vec()).unwrap();
        txn.commit().unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn status_reports_worker_count_and_clock() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        let status = engine.status();
        assert_eq!(status.nb_workers, 2);
        assert_eq!(status.active_transactions, 0);
    }

    #[test]
    fn long_scan_pulls_existing_keys_and_ends_without_leaking_the_active_slot() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(Engine::open(test_config(dir.path())).unwrap());
        for key in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()] {
            engine.put(&key, key.clone()).unwrap();
        }

        let mut scan = engine.begin_long_scan(Vec::new(), None).unwrap();
        assert_eq!(engine.status().active_transactions, 1);

        let mut seen = Vec::new();
        loop {
            let batch = scan.next_batch(10).unwrap();
            if batch.is_empty() {
                break;
            }
            seen.extend(batch.into_iter().map(|(k, _)| k));
        }
        seen.sort();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        scan.end().unwrap();
        assert_eq!(engine.status().active_transactions, 0);
    }

    #[test]
    fn long_scan_observes_a_pre_delete_value_pushed_by_a_concurrent_write() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(Engine::open(test_config(dir.path())).unwrap());
        engine.put(b"k", b"before".to_vec()).unwrap();

        let mut scan = engine.begin_long_scan(Vec::new(), None).unwrap();
        engine.put(b"k", b"after".to_vec()).unwrap();

        let mut delivered = Vec::new();
        for _ in 0..4 {
            let batch = scan.next_batch(10).unwrap();
            if batch.is_empty() {
                break;
            }
            delivered.extend(batch);
        }
        assert!(delivered.iter().any(|(k, v)| k == b"k" && v == b"before"));
        scan.end().unwrap();
    }
}
