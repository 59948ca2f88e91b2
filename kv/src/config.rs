//! Engine configuration: the enumerated knobs of the data-flow section,
//! layered the way `kv-cli`'s own `ConfigLoad` is loaded, but via `confy`
//! instead of being hand-parsed.

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;

/// One of the three MVCC behaviors a transaction can opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    /// No MVCC; a write overwrites immediately and readers see only the
    /// latest version.
    Fast,
    /// Key-level MVCC; readers see the version visible at their snapshot.
    Snapshot,
    /// Adds OLCP push propagation for long-running scans.
    Long,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory under which `slab-{worker}-{size_class}` and
    /// `trans-{worker}-{txn_object_size}` files are created.
    pub data_dir: String,

    /// Number of shard workers. Each worker owns its own slabs, index, page
    /// cache, and I/O ring.
    pub nb_workers: usize,

    /// Total page-cache bytes, divided equally among workers.
    pub page_cache_size: usize,

    /// Max simultaneously in-flight I/O ops per worker.
    pub queue_depth: usize,

    /// Request queue capacity per worker.
    pub max_pending_callbacks_per_worker: usize,

    /// If true, a worker's dequeue loop never lets in-flight + newly
    /// dispatched I/O exceed `queue_depth`.
    pub never_exceed_queue_depth: bool,

    /// Soft cap on partially-freed-list entries kept resident per slab.
    pub freelist_in_memory_items: usize,

    /// Scan batch width for `READ_NEXT_BATCH`.
    pub max_batch_size: usize,

    /// Default MVCC behavior for new transactions.
    pub transaction_type: TransactionType,

    /// Size class (bytes) used for commit log records.
    pub transaction_object_size: usize,

    /// Pin each worker thread to a core.
    pub pinning: bool,

    /// Busy-wait instead of blocking on the request-queue condition
    /// variable when idle.
    pub spinning: bool,

    /// Max GC entries drained per worker iteration.
    pub max_cleaning_op_per_round: usize,

    /// Fixed capacity of each worker's GC ring; exceeding it is fatal
    /// (`Error::GcRingFull`) rather than throttling producers or spilling
    /// to disk.
    pub maximum_gc_elements: usize,

    /// Log level for the `log` facade (the engine never configures a
    /// subscriber itself; this is read by the binary that does).
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            data_dir: "./kvell-data".to_string(),
            nb_workers: 4,
            // Development-friendly scale; a multi-gigabyte default would
            // make the engine unusable out of the box in a test/dev
            // environment.
            page_cache_size: 64 * 1024 * 1024,
            queue_depth: 64,
            max_pending_callbacks_per_worker: 4 * 64,
            never_exceed_queue_depth: true,
            freelist_in_memory_items: 256,
            max_batch_size: 256,
            transaction_type: TransactionType::Snapshot,
            transaction_object_size: 128,
            pinning: false,
            spinning: false,
            max_cleaning_op_per_round: 1024,
            maximum_gc_elements: 100_000_000,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &str) -> CResult<Self> {
        Ok(confy::load_path(path)?)
    }

    pub fn store(&self, path: &str) -> CResult<()> {
        Ok(confy::store_path(path, self)?)
    }

    pub fn page_cache_bytes_per_worker(&self) -> usize {
        self.page_cache_size / self.nb_workers.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_bounds() {
        let cfg = EngineConfig::default();
        assert!(cfg.nb_workers > 0);
        assert_eq!(
            cfg.page_cache_bytes_per_worker(),
            cfg.page_cache_size / cfg.nb_workers
        );
        assert_eq!(cfg.transaction_type, TransactionType::Snapshot);
    }
}
