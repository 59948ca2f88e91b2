//! A sharded, transactional, slab-based key-value storage engine.
//!
//! Each worker owns its page cache, slab store, in-memory index, GC ring,
//! and I/O engine exclusively; keys are routed to their owning worker by
//! hashing the key's 8-byte prefix (`crate::worker::shard_for_key`).
//! Snapshot-isolated transactions are layered on top via per-key write
//! locks and per-worker MVCC chains (`crate::transaction`).
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kv::config::EngineConfig;
//! use kv::engine::Engine;
//!
//! fn main() -> Result<(), kv::error::Error> {
//!     let engine = Arc::new(Engine::open(EngineConfig::default())?);
//!     engine.put(b"a", vec![0x01])?;
//!
//!     let mut txn = engine.begin()?;
//!     txn.write(b"a", vec![0x02])?;
//!     txn.commit()?;
//!
//!     assert_eq!(engine.get(b"a")?, Some(vec![0x02]));
//!     Ok(())
//! }
//! ```

pub mod error;

pub mod clock;
pub mod item;
pub mod page_cache;
pub mod io_engine;
pub mod paged_store;
pub mod slab;
pub mod index;
pub mod config;

pub mod callback;
pub mod gc;
pub mod engine_handle;
pub mod transaction;
pub mod olcp;
pub mod worker;
pub mod recovery;
pub mod engine;
