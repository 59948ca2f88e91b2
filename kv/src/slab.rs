//! Slab store: one file per size class per worker, a dense append-structured
//! array of fixed-size slots, a partially-freed list of tombstoned slots,
//! and the recovery scan that rebuilds the in-memory index on startup.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::error::{CResult, Error};
use crate::item::{Item, SlotContent, HEADER_SIZE, PAGE_SIZE};
use crate::paged_store::PagedStore;

/// Past this size a slab grows by a flat increment rather than doubling.
const DOUBLING_THRESHOLD_BYTES: u64 = 10 * 1_000_000_000;
/// Growth increment once past the doubling threshold.
const GROWTH_INCREMENT_BYTES: u64 = 1_000_000_000;
const INITIAL_SIZE_BYTES: u64 = 2 * PAGE_SIZE as u64;

/// A freed slot awaiting reuse, carrying the `rdt` of the write that freed
/// it (propagated to long-running transactions per the OLCP protocol).
#[derive(Debug, Clone, Copy)]
pub struct FreeSlot {
    pub slot: u64,
    pub freed_at_rdt: u64,
}

pub struct Slab {
    pub size_class: usize,
    pub file_handle: u64,
    path: PathBuf,
    file: File,
    pub size_on_disk: u64,
    pub last_slot: u64,
    pub live_count: u64,
    /// In-memory partially-freed list, soft-capped at
    /// `EngineConfig::freelist_in_memory_items`. A plain ring rather than a
    /// disk-chained structure; entries beyond the cap are simply dropped
    /// rather than recorded for later rebuild.
    free_list: VecDeque<FreeSlot>,
    free_list_cap: usize,
}

impl Slab {
    pub fn open(path: PathBuf, file_handle: u64, size_class: usize, free_list_cap: usize) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut open_options = OpenOptions::new();
        open_options.read(true).write(true).create(true).mode(0o644);
        #[cfg(target_os = "linux")]
        {
            open_options.custom_flags(libc::O_DIRECT);
        }
        // O_DIRECT requires page-aligned buffers/offsets that this
        // portable implementation does not guarantee on every filesystem;
        // fall back to a buffered open if it is rejected, so the engine
        // still runs correctly (if not with direct I/O) in a container or
        // on a filesystem that does not support it.
        let file = open_options.open(&path).or_else(|_| {
            OpenOptions::new().read(true).write(true).create(true).mode(0o644).open(&path)
        })?;
        let size_on_disk = file.metadata()?.len();

        let mut slab = Slab {
            size_class,
            file_handle,
            path,
            file,
            size_on_disk,
            last_slot: 0,
            live_count: 0,
            free_list: VecDeque::new(),
            free_list_cap,
        };
        if size_on_disk == 0 {
            slab.grow_to(INITIAL_SIZE_BYTES)?;
        } else {
            slab.last_slot = size_on_disk / size_class as u64;
        }
        Ok(slab)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn items_per_slab_page(&self) -> u64 {
        (PAGE_SIZE / self.size_class) as u64
    }

    /// Doubles while under `DOUBLING_THRESHOLD_BYTES`, then grows by
    /// `GROWTH_INCREMENT_BYTES`.
    fn next_size_on_disk(&self, need_at_least: u64) -> u64 {
        let mut size = self.size_on_disk.max(INITIAL_SIZE_BYTES);
        while size < need_at_least {
            size = if size < DOUBLING_THRESHOLD_BYTES {
                size * 2
            } else {
                size + GROWTH_INCREMENT_BYTES
            };
        }
        size
    }

    fn grow_to(&mut self, new_size: u64) -> CResult<()> {
        self.file.set_len(new_size).map_err(Error::from)?;
        self.size_on_disk = new_size;
        Ok(())
    }

    fn ensure_capacity_for_slot(&mut self, slot: u64) -> CResult<()> {
        let need = (slot + 1) * self.size_class as u64;
        if need > self.size_on_disk {
            let new_size = self.next_size_on_disk(need);
            self.grow_to(new_size)?;
        }
        Ok(())
    }

    fn slot_offset(&self, slot: u64) -> u64 {
        slot * self.size_class as u64
    }

    /// Pops the head of the partially-freed list, if any.
    pub fn pop_free_slot(&mut self) -> Option<FreeSlot> {
        self.free_list.pop_front()
    }

    /// Prepends a freed slot to the list, evicting the tail to keep the
    /// in-memory list within its soft cap.
    pub fn push_free_slot(&mut self, slot: FreeSlot) {
        self.free_list.push_front(slot);
        while self.free_list.len() > self.free_list_cap {
            self.free_list.pop_back();
        }
    }

    pub fn free_list_len(&self) -> usize {
        self.free_list.len()
    }

    /// Reads a single slot's raw bytes.
    pub fn read_slot_raw(&self, slot: u64) -> CResult<Vec<u8>> {
        let mut buf = vec![0u8; self.size_class];
        let offset = self.slot_offset(slot);
        match self.file.read_exact_at(&mut buf, offset) {
            Ok(()) => Ok(buf),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(buf),
            Err(err) => Err(Error::from(err)),
        }
    }

    pub fn read_item(&self, slot: u64) -> CResult<SlotContent> {
        let buf = self.read_slot_raw(slot)?;
        Item::decode(&buf)
    }

    fn write_slot_raw(&mut self, slot: u64, buf: &[u8]) -> CResult<()> {
        self.ensure_capacity_for_slot(slot)?;
        let offset = self.slot_offset(slot);
        self.file.write_all_at(buf, offset).map_err(Error::from)
    }

    /// Writes `item` at `slot`, zero-padding to the slab's size class, and
    /// grows the file first if needed. `slot = last_slot` (i.e. appending)
    /// advances `last_slot`.
    pub fn write_item(&mut self, slot: u64, item: &Item) -> CResult<()> {
        if item.encoded_len() > self.size_class {
            return Err(Error::Fatal(format!(
                "item of {} bytes does not fit slab class {}",
                item.encoded_len(),
                self.size_class
            )));
        }
        let mut buf = vec![0u8; self.size_class];
        item.encode_into(&mut buf)?;
        self.write_slot_raw(slot, &buf)?;
        self.live_count += 1;
        if slot >= self.last_slot {
            self.last_slot = slot + 1;
        }
        Ok(())
    }

    /// Appends at `last_slot`, consuming a free slot first if one is
    /// available.
    pub fn allocate_slot(&mut self) -> CResult<u64> {
        if let Some(free) = self.pop_free_slot() {
            return Ok(free.slot);
        }
        let slot = self.last_slot;
        self.ensure_capacity_for_slot(slot)?;
        Ok(slot)
    }

    /// Tombstones `slot`, decrements `live_count`, and pushes it onto the
    /// free list with `freed_at_rdt` as the overwrite's timestamp.
    pub fn tombstone_slot(&mut self, slot: u64, freed_at_rdt: u64) -> CResult<()> {
        let next_free = self.free_list.front().map(|f| f.slot).unwrap_or(u64::MAX);
        let mut buf = vec![0u8; self.size_class];
        Item::encode_tombstone(&mut buf, freed_at_rdt, next_free);
        self.write_slot_raw(slot, &buf)?;
        self.live_count = self.live_count.saturating_sub(1);
        self.push_free_slot(FreeSlot { slot, freed_at_rdt });
        Ok(())
    }

    /// Clones the underlying file handle so a `PagedStore` can register it
    /// with its own `IoTransport` without borrowing this `Slab`.
    pub fn try_clone_file(&self) -> CResult<File> {
        self.file.try_clone().map_err(Error::from)
    }

    /// Cache-mediated counterpart to `read_item`, routed through `paged`
    /// rather than reading the file directly.
    pub fn read_item_cached(&self, paged: &mut PagedStore, slot: u64) -> CResult<SlotContent> {
        let (page, offset) = crate::item::slot_location(slot, self.size_class);
        let buf = paged.read(self.file_handle, page, offset, self.size_class)?;
        Item::decode(&buf)
    }

    /// Cache-mediated counterpart to `write_item`.
    pub fn write_item_cached(&mut self, paged: &mut PagedStore, slot: u64, item: &Item) -> CResult<()> {
        if item.encoded_len() > self.size_class {
            return Err(Error::Fatal(format!(
                "item of {} bytes does not fit slab class {}",
                item.encoded_len(),
                self.size_class
            )));
        }
        self.ensure_capacity_for_slot(slot)?;
        let mut buf = vec![0u8; self.size_class];
        item.encode_into(&mut buf)?;
        let (page, offset) = crate::item::slot_location(slot, self.size_class);
        paged.write(self.file_handle, page, offset, &buf)?;
        self.live_count += 1;
        if slot >= self.last_slot {
            self.last_slot = slot + 1;
        }
        Ok(())
    }

    /// Cache-mediated counterpart to `tombstone_slot`.
    pub fn tombstone_slot_cached(&mut self, paged: &mut PagedStore, slot: u64, freed_at_rdt: u64) -> CResult<()> {
        let next_free = self.free_list.front().map(|f| f.slot).unwrap_or(u64::MAX);
        self.ensure_capacity_for_slot(slot)?;
        let mut buf = vec![0u8; self.size_class];
        Item::encode_tombstone(&mut buf, freed_at_rdt, next_free);
        let (page, offset) = crate::item::slot_location(slot, self.size_class);
        paged.write(self.file_handle, page, offset, &buf)?;
        self.live_count = self.live_count.saturating_sub(1);
        self.push_free_slot(FreeSlot { slot, freed_at_rdt });
        Ok(())
    }

    /// Scans the file in 2 MiB chunks, slot by slot, invoking `on_item` for
    /// every live item and `on_tombstone` for every tombstoned slot found,
    /// rebuilding the free list and the `last_slot`/`live_count` counters.
    /// Returns the maximum observed `rdt`.
    pub fn recover(
        &mut self,
        mut on_item: impl FnMut(u64, Item) -> CResult<()>,
        mut on_tombstone: impl FnMut(u64, u64),
    ) -> CResult<u64> {
        const CHUNK_BYTES: u64 = 2 * 1024 * 1024;
        let mut max_rdt = 0u64;
        let mut slot = 0u64;
        let mut live_count = 0u64;
        self.free_list.clear();

        while slot * self.size_class as u64 < self.size_on_disk {
            let chunk_slots = (CHUNK_BYTES / self.size_class as u64).max(1);
            let end_slot = (slot + chunk_slots).min(self.size_on_disk / self.size_class as u64);
            for s in slot..end_slot {
                match self.read_item(s)? {
                    SlotContent::Unused => {}
                    SlotContent::Tombstone { rdt, .. } => {
                        max_rdt = max_rdt.max(rdt);
                        on_tombstone(s, rdt);
                        self.push_free_slot(FreeSlot { slot: s, freed_at_rdt: rdt });
                    }
                    SlotContent::Item(item) => {
                        max_rdt = max_rdt.max(item.rdt);
                        live_count += 1;
                        on_item(s, item)?;
                    }
                }
            }
            slot = end_slot;
        }
        self.last_slot = slot;
        self.live_count = live_count;
        Ok(max_rdt)
    }
}

/// One `Slab` per size class, owned exclusively by a single worker.
pub struct SlabStore {
    slabs: Vec<Slab>,
}

impl SlabStore {
    pub fn open(
        data_dir: &Path,
        worker_id: usize,
        size_classes: &[usize],
        free_list_cap: usize,
    ) -> CResult<Self> {
        let mut slabs = Vec::with_capacity(size_classes.len());
        for (idx, &size_class) in size_classes.iter().enumerate() {
            let path = data_dir.join(format!("slab-{worker_id}-{size_class}"));
            let file_handle = ((worker_id as u64) << 16) | idx as u64;
            slabs.push(Slab::open(path, file_handle, size_class, free_list_cap)?);
        }
        Ok(SlabStore { slabs })
    }

    pub fn slab_for_size(&mut self, item_size: usize) -> CResult<&mut Slab> {
        let idx = self.slab_index_for_size(item_size)?;
        Ok(&mut self.slabs[idx])
    }

    /// Position of the smallest size class able to hold `item_size`,
    /// recorded by callers (e.g. `crate::worker`) alongside the slot so the
    /// location can be resolved back to a `Slab` later.
    pub fn slab_index_for_size(&self, item_size: usize) -> CResult<usize> {
        self.slabs
            .iter()
            .position(|s| item_size <= s.size_class)
            .ok_or_else(|| Error::Fatal(format!("item of {item_size} bytes is too big")))
    }

    pub fn slab(&self, idx: usize) -> &Slab {
        &self.slabs[idx]
    }

    pub fn slab_mut(&mut self, idx: usize) -> &mut Slab {
        &mut self.slabs[idx]
    }

    pub fn slabs(&self) -> &[Slab] {
        &self.slabs
    }

    pub fn slabs_mut(&mut self) -> &mut [Slab] {
        &mut self.slabs
    }

    /// Registers every slab's file with `paged`'s transport, so cached
    /// reads/writes against any of this store's slabs resolve through it.
    pub fn register_with_store(&self, paged: &mut PagedStore) -> CResult<()> {
        for slab in &self.slabs {
            paged.register_file(slab.file_handle, slab.try_clone_file()?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_read_round_trip() {
        let dir = tempdir().unwrap();
        let mut slab = Slab::open(dir.path().join("slab-0-128"), 0, 128, 256).unwrap();
        let item = Item::new(1, b"k".to_vec(), b"v".to_vec());
        let slot = slab.allocate_slot().unwrap();
        slab.write_item(slot, &item).unwrap();
        match slab.read_item(slot).unwrap() {
            SlotContent::Item(decoded) => assert_eq!(decoded, item),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn tombstoning_reuses_the_slot() {
        let dir = tempdir().unwrap();
        let mut slab = Slab::open(dir.path().join("slab-0-128"), 0, 128, 256).unwrap();
        let slot = slab.allocate_slot().unwrap();
        slab.write_item(slot, &Item::new(1, b"k".to_vec(), b"v".to_vec())).unwrap();
        slab.tombstone_slot(slot, 2).unwrap();
        assert_eq!(slab.live_count, 0);
        let reused = slab.allocate_slot().unwrap();
        assert_eq!(reused, slot);
    }

    #[test]
    fn free_list_respects_soft_cap() {
        let dir = tempdir().unwrap();
        let mut slab = Slab::open(dir.path().join("slab-0-128"), 0, 128, 2).unwrap();
        for i in 0..5u64 {
            slab.push_free_slot(FreeSlot { slot: i, freed_at_rdt: i });
        }
        assert_eq!(slab.free_list_len(), 2);
    }

    #[test]
    fn growth_doubles_then_increments() {
        let dir = tempdir().unwrap();
        let mut slab = Slab::open(dir.path().join("slab-0-4096"), 0, 4096, 256).unwrap();
        assert_eq!(slab.next_size_on_disk(1), slab.size_on_disk.max(INITIAL_SIZE_BYTES));
        assert_eq!(
            slab.next_size_on_disk(DOUBLING_THRESHOLD_BYTES + 1),
            DOUBLING_THRESHOLD_BYTES + GROWTH_INCREMENT_BYTES
        );
        let _ = &mut slab;
    }

    #[test]
    fn recovery_rebuilds_counters_and_free_list() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slab-0-128");
        {
            let mut slab = Slab::open(path.clone(), 0, 128, 256).unwrap();
            let s0 = slab.allocate_slot().unwrap();
            slab.write_item(s0, &Item::new(1, b"a".to_vec(), b"1".to_vec())).unwrap();
            let s1 = slab.allocate_slot().unwrap();
            slab.write_item(s1, &Item::new(2, b"b".to_vec(), b"2".to_vec())).unwrap();
            slab.tombstone_slot(s1, 3).unwrap();
        }
        let mut slab = Slab::open(path, 0, 128, 256).unwrap();
        let mut items = Vec::new();
        let max_rdt = slab
            .recover(
                |slot, item| {
                    items.push((slot, item));
                    Ok(())
                },
                |_slot, _rdt| {},
            )
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(max_rdt, 3);
        assert_eq!(slab.live_count, 1);
        assert_eq!(slab.free_list_len(), 1);
    }
}
