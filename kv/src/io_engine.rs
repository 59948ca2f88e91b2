//! Async I/O engine: submission/completion queue semantics modeled on the
//! `io_setup`/`io_submit`/`io_getevents` triple, plus linked-callback
//! coalescing for concurrent readers of a not-yet-resident page.
//!
//! The transport itself is behind the `IoTransport` trait so the engine's
//! algorithms (page cache, slab store, index, worker loop) can be exercised
//! against a plain `BufferedIoTransport` in tests without requiring
//! O_DIRECT/io_uring or root privileges, while a production build can opt
//! into the `io_uring`-backed transport, gated behind a default-on
//! `io_uring` Cargo feature with a portable fallback.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use crate::error::{CResult, Error};
use crate::item::PAGE_SIZE;

/// A single pending or in-flight page operation.
#[derive(Debug, Clone, Copy)]
pub struct PageOp {
    pub file_handle: u64,
    pub page_number: u64,
    pub write: bool,
}

/// Completion of a previously submitted `PageOp`.
#[derive(Debug)]
pub struct PageCompletion {
    pub file_handle: u64,
    pub page_number: u64,
    pub data: Vec<u8>,
    pub write: bool,
}

/// Abstracts the kernel async-I/O interface. Implementors submit batches of
/// page-aligned reads/writes and later report completions; a submission
/// short-count or completion mismatch is fatal, so `submit`
/// returning `Ok` guarantees every op was accepted.
pub trait IoTransport: Send {
    fn register_file(&mut self, file_handle: u64, file: File);

    /// Submits up to `ops.len()` operations; returns the number accepted.
    /// A short count relative to what the caller expected is
    /// a caller-level fatal condition, not a transport-level error: this
    /// trait always accepts the whole batch or returns `Err`.
    fn submit(&mut self, ops: &[(PageOp, Option<Vec<u8>>)]) -> CResult<()>;

    /// Drains and returns all completions produced since the last call.
    fn reap_completions(&mut self) -> CResult<Vec<PageCompletion>>;

    /// Number of operations submitted but not yet completed.
    fn pending(&self) -> usize;
}

/// Default transport: synchronous positioned reads/writes against a
/// regular `std::fs::File`, executed eagerly inside `submit` and queued as
/// immediately-ready completions. Matches the engine's async contract
/// (callers still go through `submit`/`reap_completions`) without requiring
/// O_DIRECT or a kernel AIO ring, so it is also what the test suite and
/// non-Linux builds use.
#[derive(Default)]
pub struct BufferedIoTransport {
    files: HashMap<u64, File>,
    ready: Vec<PageCompletion>,
    in_flight: usize,
}

impl BufferedIoTransport {
    pub fn new() -> Self {
        BufferedIoTransport::default()
    }
}

impl IoTransport for BufferedIoTransport {
    fn register_file(&mut self, file_handle: u64, file: File) {
        self.files.insert(file_handle, file);
    }

    fn submit(&mut self, ops: &[(PageOp, Option<Vec<u8>>)]) -> CResult<()> {
        for (op, payload) in ops {
            let file = self.files.get(&op.file_handle).ok_or_else(|| {
                Error::Fatal(format!("no registered file handle {}", op.file_handle))
            })?;
            let offset = op.page_number * PAGE_SIZE as u64;
            if op.write {
                let data = payload
                    .as_ref()
                    .ok_or_else(|| Error::Fatal("write op submitted without a payload".to_string()))?;
                if data.len() != PAGE_SIZE {
                    return Err(Error::Fatal(format!(
                        "write of {} bytes is not page-aligned",
                        data.len()
                    )));
                }
                write_all_at(file, data, offset)?;
                self.ready.push(PageCompletion {
                    file_handle: op.file_handle,
                    page_number: op.page_number,
                    data: data.clone(),
                    write: true,
                });
            } else {
                let mut buf = vec![0u8; PAGE_SIZE];
                let n = read_at_best_effort(file, &mut buf, offset)?;
                if n != PAGE_SIZE && n != 0 {
                    return Err(Error::Fatal(format!(
                        "short read: expected {PAGE_SIZE} bytes, got {n}"
                    )));
                }
                self.ready.push(PageCompletion {
                    file_handle: op.file_handle,
                    page_number: op.page_number,
                    data: buf,
                    write: false,
                });
            }
        }
        Ok(())
    }

    fn reap_completions(&mut self) -> CResult<Vec<PageCompletion>> {
        Ok(std::mem::take(&mut self.ready))
    }

    fn pending(&self) -> usize {
        self.in_flight
    }
}

fn write_all_at(file: &File, data: &[u8], offset: u64) -> CResult<()> {
    file.write_all_at(data, offset).map_err(Error::from)
}

/// A short/past-EOF read (e.g. a page never written yet) zero-fills instead
/// of failing, matching a freshly preallocated slab file.
fn read_at_best_effort(file: &File, buf: &mut [u8], offset: u64) -> CResult<usize> {
    match file.read_at(buf, offset) {
        Ok(n) => Ok(n),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
        Err(err) => Err(Error::from(err)),
    }
}

/// A read or write request waiting on a page that is already being fetched
/// by another in-flight operation.
pub struct LinkedCallback<C> {
    pub page_key: u64,
    pub callback: C,
}

/// Coalesces callbacks waiting on not-yet-resident pages, draining them
/// once the owning fetch completes.
pub struct LinkedCallbacks<C> {
    waiting: HashMap<u64, Vec<C>>,
}

impl<C> Default for LinkedCallbacks<C> {
    fn default() -> Self {
        LinkedCallbacks { waiting: HashMap::new() }
    }
}

impl<C> LinkedCallbacks<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&mut self, page_key: u64, callback: C) {
        self.waiting.entry(page_key).or_default().push(callback);
    }

    /// Removes and returns every callback waiting on `page_key` (its page
    /// just became resident).
    pub fn drain(&mut self, page_key: u64) -> Vec<C> {
        self.waiting.remove(&page_key).unwrap_or_default()
    }

    pub fn is_waiting(&self, page_key: u64) -> bool {
        self.waiting.contains_key(&page_key)
    }
}

#[cfg(feature = "io_uring")]
pub mod uring {
    //! Production transport backed by the raw `io-uring` crate (not an
    //! async-task runtime like `tokio-uring`): submission/completion queues
    //! are drained by explicit step functions, matching the worker's
    //! non-blocking main-loop contract. Kept minimal and
    //! behind the default `io_uring` feature so a portable build (and the
    //! test suite) can fall back to `BufferedIoTransport`.
    //!
    //! Every in-flight buffer is kept alive in `pending` (keyed by a
    //! `user_data` correlation id) until its completion is reaped: the
    //! kernel holds the pointer handed to `opcode::Read`/`Write` for the
    //! lifetime of the operation, so dropping the `Vec<u8>` at the end of
    //! the submitting loop iteration (as a naive translation of the
    //! synchronous `BufferedIoTransport` would) is a use-after-free.

    use super::*;
    use io_uring::{cqueue, opcode, types, IoUring};
    use std::os::unix::io::AsRawFd;

    struct PendingOp {
        op: PageOp,
        buf: Vec<u8>,
    }

    pub struct UringIoTransport {
        ring: IoUring,
        files: HashMap<u64, File>,
        pending: HashMap<u64, PendingOp>,
        next_user_data: u64,
    }

    impl UringIoTransport {
        pub fn new(queue_depth: u32) -> CResult<Self> {
            let ring = IoUring::new(queue_depth)
                .map_err(|e| Error::Fatal(format!("io_uring setup failed: {e}")))?;
            Ok(UringIoTransport { ring, files: HashMap::new(), pending: HashMap::new(), next_user_data: 0 })
        }
    }

    impl IoTransport for UringIoTransport {
        fn register_file(&mut self, file_handle: u64, file: File) {
            self.files.insert(file_handle, file);
        }

        fn submit(&mut self, ops: &[(PageOp, Option<Vec<u8>>)]) -> CResult<()> {
            for (op, payload) in ops {
                let fd = {
                    let file = self.files.get(&op.file_handle).ok_or_else(|| {
                        Error::Fatal(format!("no registered file handle {}", op.file_handle))
                    })?;
                    types::Fd(file.as_raw_fd())
                };
                let offset = op.page_number * PAGE_SIZE as u64;
                let user_data = self.next_user_data;
                self.next_user_data += 1;

                let mut buf = if op.write {
                    payload.clone().ok_or_else(|| Error::Fatal("write op submitted without a payload".to_string()))?
                } else {
                    vec![0u8; PAGE_SIZE]
                };
                let entry = if op.write {
                    opcode::Write::new(fd, buf.as_mut_ptr(), buf.len() as u32).offset(offset).build()
                } else {
                    opcode::Read::new(fd, buf.as_mut_ptr(), buf.len() as u32).offset(offset).build()
                }
                .user_data(user_data);

                // `buf` now lives in `self.pending` for the duration of the
                // kernel operation; the pointer submitted above stays valid
                // until we remove and return this entry in
                // `reap_completions`.
                self.pending.insert(user_data, PendingOp { op: *op, buf });

                unsafe {
                    self.ring
                        .submission()
                        .push(&entry)
                        .map_err(|_| Error::Fatal("io_uring submission queue full".to_string()))?;
                }
            }
            self.ring.submit().map_err(|e| Error::Fatal(format!("io_uring submit failed: {e}")))?;
            Ok(())
        }

        fn reap_completions(&mut self) -> CResult<Vec<PageCompletion>> {
            let mut completions = Vec::new();
            let cq = self.ring.completion();
            let entries: Vec<cqueue::Entry> = cq.collect();
            for entry in entries {
                let user_data = entry.user_data();
                let pending = self.pending.remove(&user_data).ok_or_else(|| {
                    Error::Fatal(format!("io_uring completion for unknown user_data {user_data}"))
                })?;
                let result = entry.result();
                if result < 0 {
                    return Err(Error::Fatal(format!(
                        "io_uring op on file {} page {} failed: {}",
                        pending.op.file_handle,
                        pending.op.page_number,
                        io::Error::from_raw_os_error(-result)
                    )));
                }
                if result as usize != PAGE_SIZE {
                    return Err(Error::Fatal(format!(
                        "io_uring short {}: expected {PAGE_SIZE} bytes, got {result}",
                        if pending.op.write { "write" } else { "read" }
                    )));
                }
                completions.push(PageCompletion {
                    file_handle: pending.op.file_handle,
                    page_number: pending.op.page_number,
                    data: pending.buf,
                    write: pending.op.write,
                });
            }
            Ok(completions)
        }

        fn pending(&self) -> usize {
            self.pending.len()
        }
    }
}
