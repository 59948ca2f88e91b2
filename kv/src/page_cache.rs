//! Fixed-capacity page cache with strict LRU eviction, expressed as indices
//! into a fixed frame pool rather than an intrusive cyclic doubly linked
//! list.
//!
//! Each worker owns one `PageCache` exclusively; there is no cross-worker
//! locking.

use std::collections::HashMap;

pub const NONE: u32 = u32::MAX;

/// Identifies a page by the file it belongs to and its page number within
/// that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub file_handle: u64,
    pub page_number: u64,
}

impl PageKey {
    pub fn new(file_handle: u64, page_number: u64) -> Self {
        PageKey { file_handle, page_number }
    }

    /// `(fd << 40) + page_num`.
    pub fn hash(&self) -> u64 {
        (self.file_handle << 40) + self.page_number
    }
}

#[derive(Debug)]
pub struct Frame {
    pub key: Option<PageKey>,
    pub data: Vec<u8>,
    pub dirty: bool,
    pub resident: bool,
    prev: u32,
    next: u32,
}

impl Frame {
    fn empty(page_size: usize) -> Self {
        Frame {
            key: None,
            data: vec![0u8; page_size],
            dirty: false,
            resident: false,
            prev: NONE,
            next: NONE,
        }
    }
}

pub struct PageCache {
    page_size: usize,
    frames: Vec<Frame>,
    by_key: HashMap<PageKey, u32>,
    lru_oldest: u32,
    lru_newest: u32,
}

/// Result of `get_page`: the frame slot, and whether it already held the
/// requested page's resident content.
pub struct GetPageResult {
    pub slot: u32,
    pub was_present: bool,
}

impl PageCache {
    pub fn new(capacity_bytes: usize, page_size: usize) -> Self {
        let capacity = (capacity_bytes / page_size).max(1);
        let frames = (0..capacity).map(|_| Frame::empty(page_size)).collect();
        PageCache {
            page_size,
            frames,
            by_key: HashMap::new(),
            lru_oldest: NONE,
            lru_newest: NONE,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn frame(&self, slot: u32) -> &Frame {
        &self.frames[slot as usize]
    }

    pub fn frame_mut(&mut self, slot: u32) -> &mut Frame {
        &mut self.frames[slot as usize]
    }

    /// Resolves `key` to a frame slot. If not cached and the pool is not
    /// full, allocates a fresh slot; otherwise steals the LRU slot, clears
    /// its old mapping, and marks it non-resident so the I/O engine
    /// re-fetches it.
    pub fn get_page(&mut self, key: PageKey) -> GetPageResult {
        if let Some(&slot) = self.by_key.get(&key) {
            self.bump(slot);
            return GetPageResult { slot, was_present: true };
        }

        let slot = self.evict_or_allocate(key);
        GetPageResult { slot, was_present: false }
    }

    fn evict_or_allocate(&mut self, key: PageKey) -> u32 {
        let unused = self.frames.iter().position(|f| f.key.is_none());
        let slot = if let Some(idx) = unused {
            idx as u32
        } else {
            let oldest = self.lru_oldest;
            debug_assert_ne!(oldest, NONE, "page cache has zero capacity");
            self.unlink(oldest);
            if let Some(old_key) = self.frames[oldest as usize].key.take() {
                self.by_key.remove(&old_key);
            }
            oldest
        };

        {
            let frame = &mut self.frames[slot as usize];
            frame.key = Some(key);
            frame.resident = false;
            frame.dirty = false;
        }
        self.by_key.insert(key, slot);
        self.push_newest(slot);
        slot
    }

    /// Moves `slot` to the newest end of the LRU list: a newly touched
    /// frame moves to the newest end.
    pub fn bump(&mut self, slot: u32) {
        if self.lru_newest == slot {
            return;
        }
        self.unlink(slot);
        self.push_newest(slot);
    }

    fn push_newest(&mut self, slot: u32) {
        self.frames[slot as usize].prev = self.lru_newest;
        self.frames[slot as usize].next = NONE;
        if self.lru_newest != NONE {
            self.frames[self.lru_newest as usize].next = slot;
        }
        self.lru_newest = slot;
        if self.lru_oldest == NONE {
            self.lru_oldest = slot;
        }
    }

    fn unlink(&mut self, slot: u32) {
        let (prev, next) = {
            let frame = &self.frames[slot as usize];
            (frame.prev, frame.next)
        };
        if prev != NONE {
            self.frames[prev as usize].next = next;
        } else if self.lru_oldest == slot {
            self.lru_oldest = next;
        }
        if next != NONE {
            self.frames[next as usize].prev = prev;
        } else if self.lru_newest == slot {
            self.lru_newest = prev;
        }
        self.frames[slot as usize].prev = NONE;
        self.frames[slot as usize].next = NONE;
    }

    pub fn oldest_key(&self) -> Option<PageKey> {
        if self.lru_oldest == NONE {
            return None;
        }
        self.frames[self.lru_oldest as usize].key
    }
}
