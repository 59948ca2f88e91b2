//! The administrative subcommands `kvcli` exposes against a `kv::Engine`:
//! `put`/`get`/`delete`/`scan`/`status`, dispatched through a single `run`
//! function matching on a `clap::Subcommand` enum.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use kv::engine::Engine;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write a key/value pair (non-transactional upsert).
    Put {
        key: String,
        value: String,
    },

    /// Read a key; prints nothing and exits non-zero if absent.
    Get {
        key: String,
    },

    /// Tombstone a key.
    Delete {
        key: String,
    },

    /// List up to `--limit` keys in `[start, end)` order.
    Scan {
        #[clap(long, default_value = "")]
        start: String,

        #[clap(long)]
        end: Option<String>,

        #[clap(long, default_value_t = 100)]
        limit: usize,
    },

    /// Print worker count, active transaction count, and the current
    /// clock value.
    Status,
}

pub fn run(command: Command, engine: Arc<Engine>) -> Result<()> {
    match command {
        Command::Put { key, value } => {
            engine.put(key.as_bytes(), value.into_bytes()).context("put failed")?;
            println!("OK");
        }
        Command::Get { key } => match engine.get(key.as_bytes()).context("get failed")? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => bail!("key not found: {key}"),
        },
        Command::Delete { key } => {
            engine.delete(key.as_bytes()).context("delete failed")?;
            println!("OK");
        }
        Command::Scan { start, end, limit } => {
            let end = end.map(String::into_bytes);
            let results = engine.scan(start.into_bytes(), end, limit).context("scan failed")?;
            for (key, value) in results {
                println!("{}\t{}", String::from_utf8_lossy(&key), String::from_utf8_lossy(&value));
            }
        }
        Command::Status => {
            let status = engine.status();
            println!("workers: {}", status.nb_workers);
            println!("active transactions: {}", status.active_transactions);
            println!("clock: {}", status.current_rdt);
        }
    }
    Ok(())
}
