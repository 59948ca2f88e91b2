//! Error taxonomy for the storage engine.
//!
//! Mirrors the three escalation classes a caller must distinguish: conditions
//! that propagate as `Err` (fatal engine bugs, recovery anomalies, plain I/O
//! failures), and transaction-local failures, which never surface as `Err`
//! from the transaction API — they set `Transaction::failed` instead (see
//! `crate::transaction`).

use std::fmt;

pub type CResult<T> = Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Wraps `std::io::Error` for plain filesystem/O_DIRECT failures.
    Io(std::io::Error),

    /// An unrecoverable condition: I/O submission short-count, completion
    /// mismatch, writing an item larger than its slab class, unlocking a
    /// never-locked entry, exceeding a fixed-capacity ring
    /// (active-transactions, GC, request queue), and the like. The caller
    /// (worker loop, CLI) decides whether to abort the process.
    Fatal(String),

    /// A commit log record or slab header could not be reconciled during
    /// recovery (see `crate::recovery`).
    Recovery(String),

    /// An ADD was issued for a key whose prefix is already present in the
    /// index and the full stored key differs from the caller's key.
    PrefixCollision { existing_key: Vec<u8>, incoming_key: Vec<u8> },

    /// The GC ring is at `MAXIMUM_GC_ELEMENTS` capacity.
    GcRingFull,

    /// A transaction-local denial: a LOCK refused because the
    /// entry is already locked or too new, or a READ refused by the
    /// snapshot-visibility filter. Never propagates past
    /// `crate::transaction::Transaction` — it only sets `failed`.
    Denied(String),

    /// Malformed on-disk or wire data.
    Parse(String),

    /// Everything else.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Fatal(msg) => write!(f, "fatal engine error: {msg}"),
            Error::Recovery(msg) => write!(f, "recovery anomaly: {msg}"),
            Error::PrefixCollision { existing_key, incoming_key } => write!(
                f,
                "prefix collision: existing key {existing_key:?} does not match incoming key {incoming_key:?}"
            ),
            Error::GcRingFull => write!(f, "garbage collector ring is full"),
            Error::Denied(msg) => write!(f, "denied: {msg}"),
            Error::Parse(msg) => write!(f, "parse error: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<confy::ConfyError> for Error {
    fn from(err: confy::ConfyError) -> Self {
        Error::Internal(format!("configuration error: {err}"))
    }
}
