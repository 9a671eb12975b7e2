//! Block Buffer Cache
//!
//! In-memory copies of 4 KiB disk blocks, keyed by absolute block
//! number, held in an open-addressed hash table and a doubly-linked LRU
//! list. Dirty blocks are written back before eviction (best effort).
//!
//! # Invariants
//!
//! - an entry is in the hash table iff it is on the LRU list
//! - a pinned entry (refcount > 0) is never evicted
//! - eviction takes the least recently used unpinned entry

use core::ptr::NonNull;

use alloc::vec::Vec;

/// Bytes per cached block.
pub const BLOCK_SIZE: usize = 4096;

/// Cached blocks held at once.
pub const CAPACITY: usize = 64;

/// Hash slots; kept above capacity so probing terminates early.
const HASH_SLOTS: usize = 128;

/// Sentinel for LRU links.
const NIL: usize = usize::MAX;

/// Reads and writes whole blocks on the backing device.
pub trait BlockIo {
    /// Fill `buf` (one block) from `block`. False on failure.
    fn read_block(&mut self, block: u64, buf: &mut [u8]) -> bool;
    /// Write `buf` (one block) to `block`. False on failure.
    fn write_block(&mut self, block: u64, buf: &[u8]) -> bool;
}

/// Provides the 4 KiB-aligned storage for cached block data.
pub trait BlockStorage {
    /// Allocate one zeroed, block-aligned buffer.
    fn alloc_block(&mut self) -> Option<NonNull<u8>>;
}

mod entry_flags {
    /// Contents reflect the device.
    pub const UPTODATE: u8 = 1 << 0;
    /// Contents modified since read.
    pub const DIRTY: u8 = 1 << 1;
}

/// Hash-slot states for open addressing.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    /// Previously occupied; probing continues past it.
    Tombstone,
    /// Index into `entries`.
    Occupied(usize),
}

struct Entry {
    block: u64,
    data: NonNull<u8>,
    flags: u8,
    refcount: u32,
    /// LRU neighbours (indices into `entries`), NIL-terminated.
    prev: usize,
    next: usize,
}

/// The cache, generic over its device and data-buffer source.
pub struct BlockCache<D: BlockIo, S: BlockStorage> {
    io: D,
    storage: S,
    table: [Slot; HASH_SLOTS],
    entries: Vec<Entry>,
    /// Most recently used.
    lru_head: usize,
    /// Least recently used; eviction candidate.
    lru_tail: usize,
}

// SAFETY: data pointers reference buffers owned by this cache; access is
// serialised by the surrounding lock.
unsafe impl<D: BlockIo + Send, S: BlockStorage + Send> Send for BlockCache<D, S> {}

impl<D: BlockIo, S: BlockStorage> BlockCache<D, S> {
    /// Create an empty cache over the given device.
    pub fn new(io: D, storage: S) -> Self {
        Self {
            io,
            storage,
            table: [Slot::Empty; HASH_SLOTS],
            entries: Vec::new(),
            lru_head: NIL,
            lru_tail: NIL,
        }
    }

    fn hash(block: u64) -> usize {
        (block as usize) % HASH_SLOTS
    }

    /// Find the hash slot holding `block`, if cached.
    fn lookup_slot(&self, block: u64) -> Option<usize> {
        let start = Self::hash(block);
        for probe in 0..HASH_SLOTS {
            let slot = (start + probe) % HASH_SLOTS;
            match self.table[slot] {
                Slot::Empty => return None,
                Slot::Tombstone => continue,
                Slot::Occupied(idx) => {
                    if self.entries[idx].block == block {
                        return Some(slot);
                    }
                }
            }
        }
        None
    }

    /// Find a free (empty or tombstone) slot for `block`.
    fn insert_slot(&self, block: u64) -> usize {
        let start = Self::hash(block);
        for probe in 0..HASH_SLOTS {
            let slot = (start + probe) % HASH_SLOTS;
            match self.table[slot] {
                Slot::Empty | Slot::Tombstone => return slot,
                Slot::Occupied(_) => continue,
            }
        }
        unreachable!("hash table larger than capacity");
    }

    // -- LRU list maintenance

    fn lru_unlink(&mut self, idx: usize) {
        let (prev, next) = (self.entries[idx].prev, self.entries[idx].next);
        if prev != NIL {
            self.entries[prev].next = next;
        } else {
            self.lru_head = next;
        }
        if next != NIL {
            self.entries[next].prev = prev;
        } else {
            self.lru_tail = prev;
        }
        self.entries[idx].prev = NIL;
        self.entries[idx].next = NIL;
    }

    fn lru_push_front(&mut self, idx: usize) {
        self.entries[idx].prev = NIL;
        self.entries[idx].next = self.lru_head;
        if self.lru_head != NIL {
            self.entries[self.lru_head].prev = idx;
        }
        self.lru_head = idx;
        if self.lru_tail == NIL {
            self.lru_tail = idx;
        }
    }

    fn data_slice(&self, idx: usize) -> &[u8] {
        // SAFETY: data buffers are BLOCK_SIZE and live as long as self
        unsafe { core::slice::from_raw_parts(self.entries[idx].data.as_ptr(), BLOCK_SIZE) }
    }

    fn data_slice_mut(&mut self, idx: usize) -> &mut [u8] {
        // SAFETY: data buffers are BLOCK_SIZE and live as long as self
        unsafe { core::slice::from_raw_parts_mut(self.entries[idx].data.as_ptr(), BLOCK_SIZE) }
    }

    /// Evict the least recently used unpinned entry; returns its index
    /// for reuse. Dirty contents are written back first (best effort).
    fn evict(&mut self) -> Option<usize> {
        let mut idx = self.lru_tail;
        while idx != NIL && self.entries[idx].refcount > 0 {
            idx = self.entries[idx].prev;
        }
        if idx == NIL {
            return None;
        }

        let block = self.entries[idx].block;
        if self.entries[idx].flags & entry_flags::DIRTY != 0 {
            let ok = {
                let data = self.data_slice(idx).as_ptr();
                // SAFETY: reborrow for the io call; buffer outlives it
                let buf = unsafe { core::slice::from_raw_parts(data, BLOCK_SIZE) };
                self.io.write_block(block, buf)
            };
            if !ok {
                log::warn!("bcache: write-back of block {} failed", block);
            }
        }

        let slot = self.lookup_slot(block).expect("entry on LRU but not hashed");
        self.table[slot] = Slot::Tombstone;
        self.lru_unlink(idx);
        Some(idx)
    }

    /// Get a block's contents, reading it from the device on a miss.
    /// The entry is pinned until [`Self::put`].
    pub fn get(&mut self, block: u64) -> Option<&[u8]> {
        if let Some(slot) = self.lookup_slot(block) {
            let Slot::Occupied(idx) = self.table[slot] else {
                unreachable!()
            };
            self.lru_unlink(idx);
            self.lru_push_front(idx);
            self.entries[idx].refcount += 1;
            return Some(self.data_slice(idx));
        }

        // Miss: reuse an evicted entry or grow up to capacity.
        let idx = if self.entries.len() < CAPACITY {
            let data = self.storage.alloc_block()?;
            self.entries.push(Entry {
                block,
                data,
                flags: 0,
                refcount: 0,
                prev: NIL,
                next: NIL,
            });
            self.entries.len() - 1
        } else {
            let idx = self.evict()?;
            self.entries[idx].block = block;
            self.entries[idx].flags = 0;
            idx
        };

        let ok = {
            let data = self.entries[idx].data.as_ptr();
            // SAFETY: buffer is BLOCK_SIZE and exclusively ours
            let buf = unsafe { core::slice::from_raw_parts_mut(data, BLOCK_SIZE) };
            self.io.read_block(block, buf)
        };
        if !ok {
            log::warn!("bcache: read of block {} failed", block);
            // The entry stays unhashed and off the LRU for reuse.
            self.entries[idx].block = u64::MAX;
            return None;
        }

        self.entries[idx].flags = entry_flags::UPTODATE;
        self.entries[idx].refcount = 1;
        let slot = self.insert_slot(block);
        self.table[slot] = Slot::Occupied(idx);
        self.lru_push_front(idx);
        Some(self.data_slice(idx))
    }

    /// Unpin a block previously returned by [`Self::get`].
    pub fn put(&mut self, block: u64) {
        if let Some(slot) = self.lookup_slot(block) {
            let Slot::Occupied(idx) = self.table[slot] else {
                unreachable!()
            };
            if self.entries[idx].refcount > 0 {
                self.entries[idx].refcount -= 1;
            }
        }
    }

    /// Mutable view of a cached block, marking it dirty. The block must
    /// currently be pinned.
    pub fn get_mut_dirty(&mut self, block: u64) -> Option<&mut [u8]> {
        let slot = self.lookup_slot(block)?;
        let Slot::Occupied(idx) = self.table[slot] else {
            unreachable!()
        };
        self.entries[idx].flags |= entry_flags::DIRTY;
        Some(self.data_slice_mut(idx))
    }

    /// Write every dirty block back to the device (best effort).
    pub fn sync(&mut self) {
        for idx in 0..self.entries.len() {
            if self.entries[idx].flags & entry_flags::DIRTY == 0 {
                continue;
            }
            let block = self.entries[idx].block;
            let ok = {
                let data = self.entries[idx].data.as_ptr();
                // SAFETY: buffer is BLOCK_SIZE and lives as long as self
                let buf = unsafe { core::slice::from_raw_parts(data, BLOCK_SIZE) };
                self.io.write_block(block, buf)
            };
            if ok {
                self.entries[idx].flags &= !entry_flags::DIRTY;
            } else {
                log::warn!("bcache: sync of block {} failed", block);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::boxed::Box;
    use std::collections::BTreeMap;
    use std::vec::Vec;

    #[repr(align(4096))]
    struct AlignedBlock([u8; BLOCK_SIZE]);

    struct HostStorage;

    impl BlockStorage for HostStorage {
        fn alloc_block(&mut self) -> Option<NonNull<u8>> {
            let block = Box::leak(Box::new(AlignedBlock([0; BLOCK_SIZE])));
            NonNull::new(block.0.as_mut_ptr())
        }
    }

    /// Device where block N is filled with byte N; records writes.
    struct FakeDisk {
        reads: usize,
        written: BTreeMap<u64, Vec<u8>>,
    }

    impl FakeDisk {
        fn new() -> Self {
            Self {
                reads: 0,
                written: BTreeMap::new(),
            }
        }
    }

    impl BlockIo for FakeDisk {
        fn read_block(&mut self, block: u64, buf: &mut [u8]) -> bool {
            self.reads += 1;
            buf.fill(block as u8);
            true
        }

        fn write_block(&mut self, block: u64, buf: &[u8]) -> bool {
            self.written.insert(block, buf.to_vec());
            true
        }
    }

    fn cache() -> BlockCache<FakeDisk, HostStorage> {
        BlockCache::new(FakeDisk::new(), HostStorage)
    }

    #[test]
    fn test_hit_avoids_device_read() {
        let mut c = cache();
        assert_eq!(c.get(7).unwrap()[0], 7);
        c.put(7);
        assert_eq!(c.get(7).unwrap()[0], 7);
        c.put(7);
        assert_eq!(c.io.reads, 1);
    }

    #[test]
    fn test_hash_and_lru_membership_match() {
        let mut c = cache();
        for b in 0..10u64 {
            c.get(b).unwrap();
            c.put(b);
        }
        // Every cached block is findable and on the LRU chain.
        let mut on_lru = 0;
        let mut idx = c.lru_head;
        while idx != NIL {
            assert!(c.lookup_slot(c.entries[idx].block).is_some());
            on_lru += 1;
            idx = c.entries[idx].next;
        }
        assert_eq!(on_lru, 10);
    }

    #[test]
    fn test_eviction_takes_least_recent() {
        let mut c = cache();
        for b in 0..CAPACITY as u64 {
            c.get(b).unwrap();
            c.put(b);
        }
        // Touch block 0 so block 1 becomes the eviction candidate.
        c.get(0).unwrap();
        c.put(0);

        c.get(1000).unwrap();
        c.put(1000);

        assert!(c.lookup_slot(1).is_none(), "LRU block should be evicted");
        assert!(c.lookup_slot(0).is_some());
        assert!(c.lookup_slot(1000).is_some());
    }

    #[test]
    fn test_pinned_blocks_survive_eviction() {
        let mut c = cache();
        c.get(42).unwrap(); // pinned: no put
        for b in 0..CAPACITY as u64 {
            if b != 42 {
                c.get(b).unwrap();
                c.put(b);
            }
        }
        for b in 100..110u64 {
            c.get(b).unwrap();
            c.put(b);
        }
        assert!(c.lookup_slot(42).is_some(), "pinned block was evicted");
    }

    #[test]
    fn test_dirty_blocks_written_before_eviction() {
        let mut c = cache();
        c.get(5).unwrap();
        c.get_mut_dirty(5).unwrap()[0] = 0xEE;
        c.put(5);

        // Force 5 out.
        for b in 0..CAPACITY as u64 + 4 {
            if b != 5 {
                c.get(b).unwrap();
                c.put(b);
            }
        }
        let written = c.io.written.get(&5).expect("dirty block not written back");
        assert_eq!(written[0], 0xEE);
    }

    #[test]
    fn test_sync_clears_dirty() {
        let mut c = cache();
        c.get(9).unwrap();
        c.get_mut_dirty(9).unwrap()[10] = 0x77;
        c.put(9);
        c.sync();
        assert_eq!(c.io.written.get(&9).unwrap()[10], 0x77);
        // Second sync writes nothing new.
        c.io.written.clear();
        c.sync();
        assert!(c.io.written.is_empty());
    }
}
