//! Long-running scans (`TransactionType::Long`): a pull side that walks the
//! index in `READ_NEXT_BATCH` chunks, and a push side that propagates every
//! intervening write's pre-image to a scan's callback while the scan's
//! cursor has not yet passed that key. A `LongScanRegistry` owned by
//! `crate::worker::Worker` holds the live scans a write must consult
//! before overwriting a key.

use std::collections::HashMap;

use crate::item::Item;

/// What `map_item` decides to do with one pulled or pushed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapDecision {
    /// Hand the item to the scan's consumer.
    Deliver,
    /// The item falls outside `(scan.snapshot, writer.rdt]` or past the
    /// scan's cursor; skip it.
    Skip,
}

/// One long-running scan's state: the snapshot it began at, the highest key
/// its pull side has consumed so far, and the keys it has already delivered
/// this batch (so a push arriving for a key already pulled is not
/// double-delivered).
pub struct LongScan {
    pub id: u64,
    pub snapshot: u64,
    pub cursor: Vec<u8>,
    pub end_key: Option<Vec<u8>>,
    seen_this_batch: std::collections::HashSet<Vec<u8>>,
    /// Pre-images pushed by concurrent writers, awaiting delivery to this
    /// scan's consumer via `LongScanRegistry::drain_pending`.
    pending: Vec<Item>,
}

impl LongScan {
    pub fn new(id: u64, snapshot: u64, start_key: Vec<u8>, end_key: Option<Vec<u8>>) -> Self {
        LongScan {
            id,
            snapshot,
            cursor: start_key,
            end_key,
            seen_this_batch: Default::default(),
            pending: Vec::new(),
        }
    }

    /// `is_processable`: a key is within scope for this scan if it falls at
    /// or after the cursor and (when bounded) before `end_key`.
    pub fn in_scope(&self, key: &[u8]) -> bool {
        key >= self.cursor.as_slice() && self.end_key.as_deref().map(|end| key < end).unwrap_or(true)
    }

    pub fn advance_cursor(&mut self, key: &[u8]) {
        if key.as_ref() > self.cursor.as_slice() {
            self.cursor = key.to_vec();
        }
    }

    pub fn start_new_batch(&mut self) {
        self.seen_this_batch.clear();
    }

    fn mark_seen(&mut self, key: &[u8]) -> bool {
        self.seen_this_batch.insert(key.to_vec())
    }
}

/// `map_item(scan, writer_rdt, item)`: decides whether a write's pre-image
/// falls inside the open interval `(scan.snapshot, writer_rdt]` and the
/// scan has not already pulled past it.
pub fn map_decision(scan: &mut LongScan, writer_rdt: u64, item: &Item) -> MapDecision {
    if item.rdt <= scan.snapshot || item.rdt > writer_rdt {
        return MapDecision::Skip;
    }
    if !scan.in_scope(&item.key) {
        return MapDecision::Skip;
    }
    if !scan.mark_seen(&item.key) {
        return MapDecision::Skip;
    }
    MapDecision::Deliver
}

/// The set of long scans a worker is currently driving, keyed by scan id.
/// A write consults every entry here before applying, pushing the
/// pre-image of any key a scan could still observe.
#[derive(Default)]
pub struct LongScanRegistry {
    scans: HashMap<u64, LongScan>,
}

impl LongScanRegistry {
    pub fn register(&mut self, scan: LongScan) {
        self.scans.insert(scan.id, scan);
    }

    pub fn unregister(&mut self, id: u64) {
        self.scans.remove(&id);
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut LongScan> {
        self.scans.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.scans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }

    /// Pushes `pre_image` (the version a write is about to supersede) into
    /// every registered scan whose window still covers it, queuing it for
    /// that scan's next `drain_pending` call.
    pub fn push_pre_image(&mut self, writer_rdt: u64, pre_image: &Item) {
        for scan in self.scans.values_mut() {
            if map_decision(scan, writer_rdt, pre_image) == MapDecision::Deliver {
                scan.pending.push(pre_image.clone());
            }
        }
    }

    /// Drains and returns every pre-image queued for `id` since the last
    /// drain. Empty if the scan has nothing pending or does not exist.
    pub fn drain_pending(&mut self, id: u64) -> Vec<Item> {
        self.scans.get_mut(&id).map(|scan| std::mem::take(&mut scan.pending)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_decision_skips_items_outside_the_snapshot_window() {
        let mut scan = LongScan::new(1, 10, b"a".to_vec(), None);
        let too_old = Item::new(5, b"k".to_vec(), b"v".to_vec());
        assert_eq!(map_decision(&mut scan, 20, &too_old), MapDecision::Skip);

        let too_new = Item::new(25, b"k".to_vec(), b"v".to_vec());
        assert_eq!(map_decision(&mut scan, 20, &too_new), MapDecision::Skip);
    }

    #[test]
    fn map_decision_delivers_once_then_suppresses_duplicates() {
        let mut scan = LongScan::new(1, 10, b"a".to_vec(), None);
        let item = Item::new(15, b"k".to_vec(), b"v".to_vec());
        assert_eq!(map_decision(&mut scan, 20, &item), MapDecision::Deliver);
        assert_eq!(map_decision(&mut scan, 20, &item), MapDecision::Skip);
    }

    #[test]
    fn out_of_scope_keys_are_skipped() {
        let mut scan = LongScan::new(1, 10, b"m".to_vec(), Some(b"z".to_vec()));
        let before_cursor = Item::new(15, b"a".to_vec(), b"v".to_vec());
        assert_eq!(map_decision(&mut scan, 20, &before_cursor), MapDecision::Skip);
        let past_end = Item::new(15, b"zz".to_vec(), b"v".to_vec());
        assert_eq!(map_decision(&mut scan, 20, &past_end), MapDecision::Skip);
    }
}
