//! Two-phase, barrier-synchronized startup recovery: every worker thread
//! rescans its own transactions log to find commit ids that never reached
//! their end marker, merges its findings into a shared ignored-rdts set,
//! then waits on a `std::sync::Barrier` before rescanning its own slabs to
//! rebuild the in-memory index. The barrier is required because a late
//! end-marker recorded by one worker must be visible to every other
//! worker's slab rescan before that rescan begins.

use std::collections::HashSet;
use std::sync::{Barrier, Mutex};
use std::thread;

use crate::engine_handle::EngineHandle;
use crate::error::CResult;
use crate::worker::Worker;

/// Runs both recovery phases across `workers`, returning the maximum
/// observed `rdt` so the caller can seed the global clock past it.
pub fn recover(workers: &mut [Worker], handle: &EngineHandle) -> CResult<u64> {
    let nb_workers = workers.len();
    let barrier = Barrier::new(nb_workers);
    let ignored_rdts: Mutex<HashSet<u64>> = Mutex::new(HashSet::new());

    let results: Vec<CResult<u64>> = thread::scope(|scope| {
        let handles: Vec<_> = workers
            .iter_mut()
            .map(|worker| {
                let barrier = &barrier;
                let ignored_rdts = &ignored_rdts;
                scope.spawn(move || -> CResult<u64> {
                    let mine = worker.recover_transaction_log()?;
                    ignored_rdts.lock().unwrap().extend(mine);
                    barrier.wait();

                    let merged = ignored_rdts.lock().unwrap().clone();
                    worker.recover(&merged)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("recovery worker thread panicked")).collect()
    });

    for &rdt in ignored_rdts.lock().unwrap().iter() {
        handle.mark_ignored(rdt);
    }

    let mut max_rdt = 0u64;
    for result in results {
        max_rdt = max_rdt.max(result?);
    }
    handle.clock.advance_to_at_least(max_rdt + 1);
    Ok(max_rdt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{Action, Callback, CallbackOutcome};
    use crate::config::EngineConfig;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path, nb_workers: usize) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.data_dir = dir.to_string_lossy().to_string();
        cfg.nb_workers = nb_workers;
        cfg
    }

    #[test]
    fn recovery_rebuilds_the_index_from_the_slabs_on_disk() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), 1);
        {
            let mut worker = Worker::open(0, 1, &cfg).unwrap();
            let handle = EngineHandle::new(0, 16);
            let mut add = Callback::new(Action::Add, b"k".to_vec()).with_value(b"v".to_vec());
            match worker.handle(&mut add, &handle).unwrap() {
                CallbackOutcome::Ack => {}
                other => panic!("unexpected {other:?}"),
            }
        }

        let mut workers = vec![Worker::open(0, 1, &cfg).unwrap()];
        let handle = EngineHandle::new(0, 16);
        recover(&mut workers, &handle).unwrap();
        assert_eq!(workers[0].index_len(), 1);
    }

    #[test]
    fn an_unfinished_commit_record_is_ignored_on_replay() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), 1);
        {
            let mut worker = Worker::open(0, 1, &cfg).unwrap();
            let handle = EngineHandle::new(0, 16);
            let log_key = crate::transaction::transaction_log_key(7);
            let mut start = Callback::new(Action::StartTransactionCommit, log_key)
                .with_value(1u64.to_le_bytes().to_vec());
            worker.handle(&mut start, &handle).unwrap();
            // No EndTransactionCommit: this worker "crashed" mid-commit.
        }

        let mut workers = vec![Worker::open(0, 1, &cfg).unwrap()];
        let handle = EngineHandle::new(0, 16);
        recover(&mut workers, &handle).unwrap();
        assert!(handle.is_ignored(7));
    }
}
