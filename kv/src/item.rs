//! On-disk item layout: a fixed `{rdt, key_size, value_size}` header
//! followed by raw key then value bytes.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{CResult, Error};

pub const HEADER_SIZE: usize = 24; // 3 * u64
pub const PAGE_SIZE: usize = 4096;

/// Ascending size classes; the smallest class able to hold an item is
/// selected.
pub const SIZE_CLASSES: [usize; 9] = [100, 128, 256, 400, 512, 1024, 1365, 2048, 4096];

const TOMBSTONE_KEY_SIZE: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub rdt: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Item {
    pub fn new(rdt: u64, key: Vec<u8>, value: Vec<u8>) -> Self {
        Item { rdt, key, value }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.key.len() + self.value.len()
    }

    /// Selects the smallest size class that fits this item, or an error if
    /// it exceeds the largest class (writing an item larger than its
    /// slab class is fatal).
    pub fn size_class(&self) -> CResult<usize> {
        size_class_for(self.encoded_len())
    }

    /// First 8 bytes of the key, zero-padded on the right if shorter,
    /// interpreted big-endian so prefix order matches key byte order.
    pub fn key_prefix(&self) -> u64 {
        key_prefix(&self.key)
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> CResult<()> {
        let len = self.encoded_len();
        if buf.len() < len {
            return Err(Error::Internal(format!(
                "buffer too small for item: need {len}, have {}",
                buf.len()
            )));
        }
        LittleEndian::write_u64(&mut buf[0..8], self.rdt);
        LittleEndian::write_u64(&mut buf[8..16], self.key.len() as u64);
        LittleEndian::write_u64(&mut buf[16..24], self.value.len() as u64);
        buf[HEADER_SIZE..HEADER_SIZE + self.key.len()].copy_from_slice(&self.key);
        buf[HEADER_SIZE + self.key.len()..len].copy_from_slice(&self.value);
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> CResult<SlotContent> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Parse("slot shorter than header".to_string()));
        }
        let rdt = LittleEndian::read_u64(&buf[0..8]);
        let key_size = LittleEndian::read_u64(&buf[8..16]);
        let value_size = LittleEndian::read_u64(&buf[16..24]);

        if key_size == 0 {
            return Ok(SlotContent::Unused);
        }
        if key_size == TOMBSTONE_KEY_SIZE {
            // value_size doubles as the next-free-slot pointer.
            return Ok(SlotContent::Tombstone { rdt, next_free_slot: value_size });
        }
        let key_size = key_size as usize;
        let value_size = value_size as usize;
        if HEADER_SIZE + key_size + value_size > buf.len() {
            return Err(Error::Parse(
                "item key/value size exceeds slot capacity".to_string(),
            ));
        }
        let key = buf[HEADER_SIZE..HEADER_SIZE + key_size].to_vec();
        let value = buf[HEADER_SIZE + key_size..HEADER_SIZE + key_size + value_size].to_vec();
        Ok(SlotContent::Item(Item { rdt, key, value }))
    }

    /// Encodes a tombstone header whose `value_size` field carries the
    /// next-free-slot pointer of the partially-freed chain.
    pub fn encode_tombstone(buf: &mut [u8], rdt: u64, next_free_slot: u64) {
        LittleEndian::write_u64(&mut buf[0..8], rdt);
        LittleEndian::write_u64(&mut buf[8..16], TOMBSTONE_KEY_SIZE);
        LittleEndian::write_u64(&mut buf[16..24], next_free_slot);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotContent {
    Unused,
    Tombstone { rdt: u64, next_free_slot: u64 },
    Item(Item),
}

pub fn key_prefix(key: &[u8]) -> u64 {
    let mut padded = [0u8; 8];
    let n = key.len().min(8);
    padded[..n].copy_from_slice(&key[..n]);
    u64::from_be_bytes(padded)
}

pub fn size_class_for(encoded_len: usize) -> CResult<usize> {
    SIZE_CLASSES
        .iter()
        .copied()
        .find(|&class| encoded_len <= class)
        .ok_or_else(|| Error::Fatal(format!("item of {encoded_len} bytes exceeds largest slab class")))
}

/// `slot / (PAGE_SIZE / size_class)` is the page; `(slot mod (PAGE_SIZE /
/// size_class)) * size_class` is the byte offset.
pub fn slot_location(slot: u64, size_class: usize) -> (u64, usize) {
    let items_per_page = (PAGE_SIZE / size_class) as u64;
    let page = slot / items_per_page;
    let offset = ((slot % items_per_page) as usize) * size_class;
    (page, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_prefix_zero_pads_short_keys() {
        assert_eq!(key_prefix(b""), 0);
        assert_eq!(key_prefix(&[0, 0, 0, 0, 0, 0, 0, 1]), 1);
    }

    #[test]
    fn size_class_picks_smallest_fit() {
        assert_eq!(size_class_for(HEADER_SIZE + 1).unwrap(), 100);
        assert_eq!(size_class_for(100).unwrap(), 100);
        assert_eq!(size_class_for(101).unwrap(), 128);
        assert!(size_class_for(100_000).is_err());
    }

    #[test]
    fn item_round_trips_through_encode_decode() {
        let item = Item::new(7, b"hello".to_vec(), b"world".to_vec());
        let mut buf = vec![0u8; 128];
        item.encode_into(&mut buf).unwrap();
        match Item::decode(&buf).unwrap() {
            SlotContent::Item(decoded) => assert_eq!(decoded, item),
            other => panic!("expected item, got {other:?}"),
        }
    }

    #[test]
    fn unused_slot_decodes_as_unused() {
        let buf = vec![0u8; 128];
        assert_eq!(Item::decode(&buf).unwrap(), SlotContent::Unused);
    }

    #[test]
    fn tombstone_round_trips() {
        let mut buf = vec![0u8; 128];
        Item::encode_tombstone(&mut buf, 9, 3);
        match Item::decode(&buf).unwrap() {
            SlotContent::Tombstone { rdt, next_free_slot } => {
                assert_eq!(rdt, 9);
                assert_eq!(next_free_slot, 3);
            }
            other => panic!("expected tombstone, got {other:?}"),
        }
    }

    #[test]
    fn slot_location_matches_page_arithmetic() {
        let size_class = 128;
        let items_per_page = PAGE_SIZE / size_class;
        let (page, offset) = slot_location(items_per_page as u64, size_class);
        assert_eq!(page, 1);
        assert_eq!(offset, 0);
    }
}
