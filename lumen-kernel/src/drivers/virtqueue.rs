//! Split Virtqueue
//!
//! The legacy split-ring layout over physically contiguous guest
//! memory: descriptor table at offset 0, available ring immediately
//! after, used ring at the next page boundary (4096).
//!
//! Submission hands back a [`SubmittedChain`] token; the descriptors of
//! a chain stay posted and immutable until the token is surrendered to
//! [`Virtqueue::wait`] (or reclaimed via [`Virtqueue::complete`]), which
//! requires the device to have advanced the used ring past them.

use core::ptr::{read_volatile, write_volatile};

use lumen_common::PhysAddr;
use lumen_mmio::barrier;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Descriptor flags.
pub mod desc_flags {
    /// Chain continues at `next`.
    pub const NEXT: u16 = 1;
    /// Device writes this buffer.
    pub const WRITE: u16 = 2;
}

/// One descriptor: physical address, length, flags, next index.
#[repr(C)]
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VirtqDesc {
    /// Physical address of the buffer.
    pub addr: u64,
    /// Buffer length in bytes.
    pub len: u32,
    /// NEXT / WRITE flags.
    pub flags: u16,
    /// Next descriptor index when NEXT is set.
    pub next: u16,
}

/// Used-ring element: consumed head index plus bytes written.
#[repr(C)]
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VirtqUsedElem {
    /// Head descriptor index of the consumed chain.
    pub id: u32,
    /// Total bytes the device wrote into the chain.
    pub len: u32,
}

/// Byte offsets of the three ring sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    /// Descriptor table (always 0).
    pub desc: usize,
    /// Available ring: flags u16, idx u16, ring[size] u16, used_event.
    pub avail: usize,
    /// Used ring, on the next page boundary.
    pub used: usize,
    /// Total bytes of guest memory.
    pub total: usize,
}

impl QueueLayout {
    /// Layout for a queue of `size` entries.
    #[must_use]
    pub const fn for_size(size: u16) -> Self {
        let desc_bytes = size as usize * core::mem::size_of::<VirtqDesc>();
        let avail_bytes = 4 + size as usize * 2 + 2;
        // Legacy devices expect the used ring on its own page.
        assert!(desc_bytes + avail_bytes <= 4096);
        Self {
            desc: 0,
            avail: desc_bytes,
            used: 4096,
            total: 8192,
        }
    }
}

/// Token for an in-flight descriptor chain. Holding it is the proof the
/// chain may not be rebuilt; give it back to reclaim the descriptors.
#[must_use]
pub struct SubmittedChain {
    head: u16,
}

impl SubmittedChain {
    /// Head descriptor index, for matching against used-ring entries.
    #[must_use]
    pub fn head(&self) -> u16 {
        self.head
    }
}

/// A split virtqueue over caller-provided contiguous memory.
pub struct Virtqueue {
    size: u16,
    base: *mut u8,
    phys: PhysAddr,
    layout: QueueLayout,
    free_head: u16,
    num_free: u16,
    last_used_idx: u16,
}

// SAFETY: The queue memory is exclusively owned; access is serialised
// by the owning driver.
unsafe impl Send for Virtqueue {}

impl Virtqueue {
    /// Build a queue over zeroed guest memory.
    ///
    /// # Safety
    ///
    /// `base` must point to at least `QueueLayout::for_size(size).total`
    /// bytes of zeroed, physically contiguous memory at physical address
    /// `phys`, page-aligned, owned by this queue for its lifetime.
    pub unsafe fn new(base: *mut u8, phys: PhysAddr, size: u16) -> Self {
        let layout = QueueLayout::for_size(size);
        let mut vq = Self {
            size,
            base,
            phys,
            layout,
            free_head: 0,
            num_free: size,
            last_used_idx: 0,
        };
        // Chain the descriptor free list.
        for i in 0..size - 1 {
            vq.write_desc(
                i,
                VirtqDesc {
                    addr: 0,
                    len: 0,
                    flags: 0,
                    next: i + 1,
                },
            );
        }
        vq
    }

    /// Queue size in descriptors.
    #[must_use]
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Physical addresses of (descriptor table, available ring, used
    /// ring) for device programming.
    #[must_use]
    pub fn ring_addresses(&self) -> (u64, u64, u64) {
        let base = self.phys.as_u64();
        (
            base + self.layout.desc as u64,
            base + self.layout.avail as u64,
            base + self.layout.used as u64,
        )
    }

    /// Physical page frame number of the queue, for legacy devices.
    #[must_use]
    pub fn pfn(&self) -> u32 {
        (self.phys.as_u64() >> 12) as u32
    }

    fn desc_ptr(&self, index: u16) -> *mut VirtqDesc {
        debug_assert!(index < self.size);
        // SAFETY: index checked; desc table starts at base
        unsafe { self.base.add(self.layout.desc).cast::<VirtqDesc>().add(index as usize) }
    }

    /// Write one descriptor.
    pub fn write_desc(&mut self, index: u16, desc: VirtqDesc) {
        // SAFETY: desc_ptr bounds-checks; volatile because the device
        // reads this memory
        unsafe { write_volatile(self.desc_ptr(index), desc) };
    }

    fn avail_idx_ptr(&self) -> *mut u16 {
        // SAFETY: avail ring starts at layout.avail; idx at +2
        unsafe { self.base.add(self.layout.avail + 2).cast::<u16>() }
    }

    fn avail_ring_ptr(&self, slot: u16) -> *mut u16 {
        // SAFETY: ring entries start at avail + 4
        unsafe {
            self.base
                .add(self.layout.avail + 4)
                .cast::<u16>()
                .add((slot % self.size) as usize)
        }
    }

    fn used_idx(&self) -> u16 {
        // SAFETY: used ring starts at layout.used; idx at +2; the device
        // writes it, so the read is volatile
        unsafe { read_volatile(self.base.add(self.layout.used + 2).cast::<u16>()) }
    }

    fn used_elem(&self, slot: u16) -> VirtqUsedElem {
        // SAFETY: used elements start at used + 4, device-written
        unsafe {
            read_volatile(
                self.base
                    .add(self.layout.used + 4)
                    .cast::<VirtqUsedElem>()
                    .add((slot % self.size) as usize),
            )
        }
    }

    /// Place `head` in the available ring and publish it: ring write,
    /// barrier, index increment, barrier. The device may consume the
    /// chain any time after this.
    pub fn publish(&mut self, head: u16) {
        // SAFETY: avail ring pointers are in our queue memory
        unsafe {
            let idx = read_volatile(self.avail_idx_ptr());
            write_volatile(self.avail_ring_ptr(idx), head);
            barrier::dmb_sy();
            write_volatile(self.avail_idx_ptr(), idx.wrapping_add(1));
            barrier::dmb_sy();
        }
    }

    fn alloc_desc(&mut self) -> Option<u16> {
        if self.num_free == 0 {
            return None;
        }
        let index = self.free_head;
        // SAFETY: index is a valid free descriptor
        let next = unsafe { read_volatile(self.desc_ptr(index)) }.next;
        self.free_head = next;
        self.num_free -= 1;
        Some(index)
    }

    fn free_desc(&mut self, index: u16) {
        self.write_desc(
            index,
            VirtqDesc {
                addr: 0,
                len: 0,
                flags: 0,
                next: self.free_head,
            },
        );
        self.free_head = index;
        self.num_free += 1;
    }

    /// Build and publish a descriptor chain. Each element is
    /// `(physical address, length, device_writes)`.
    ///
    /// Returns the in-flight token, or `None` if descriptors are
    /// exhausted.
    pub fn submit(&mut self, bufs: &[(u64, u32, bool)]) -> Option<SubmittedChain> {
        if bufs.is_empty() || (self.num_free as usize) < bufs.len() {
            return None;
        }

        let mut indices = [0u16; 8];
        debug_assert!(bufs.len() <= indices.len());
        for i in 0..bufs.len() {
            indices[i] = self.alloc_desc().expect("free count verified");
        }

        for (i, &(addr, len, device_writes)) in bufs.iter().enumerate() {
            let last = i == bufs.len() - 1;
            let mut flags = 0;
            if !last {
                flags |= desc_flags::NEXT;
            }
            if device_writes {
                flags |= desc_flags::WRITE;
            }
            self.write_desc(
                indices[i],
                VirtqDesc {
                    addr,
                    len,
                    flags,
                    next: if last { 0 } else { indices[i + 1] },
                },
            );
        }

        let head = indices[0];
        self.publish(head);
        Some(SubmittedChain { head })
    }

    /// Whether the device has advanced the used ring past our cursor.
    #[must_use]
    pub fn has_used(&self) -> bool {
        self.used_idx() != self.last_used_idx
    }

    /// Take the next completion, if any: `(head index, bytes written)`.
    pub fn pop_used(&mut self) -> Option<(u16, u32)> {
        if !self.has_used() {
            return None;
        }
        barrier::read_barrier();
        let elem = self.used_elem(self.last_used_idx);
        self.last_used_idx = self.last_used_idx.wrapping_add(1);
        Some((elem.id as u16, elem.len))
    }

    /// Reclaim a completed chain's descriptors. The token proves the
    /// caller matched this chain against a used-ring entry.
    pub fn complete(&mut self, chain: SubmittedChain) {
        let mut index = chain.head;
        loop {
            // SAFETY: chain indices are valid descriptors we posted
            let desc = unsafe { read_volatile(self.desc_ptr(index)) };
            let flags = desc.flags;
            let next = desc.next;
            self.free_desc(index);
            if flags & desc_flags::NEXT == 0 {
                break;
            }
            index = next;
        }
    }

    /// Busy-wait until the chain completes, then reclaim it. Returns the
    /// bytes the device wrote. Spins with interrupts in whatever state
    /// the caller left them.
    pub fn wait(&mut self, chain: SubmittedChain) -> u32 {
        loop {
            if let Some((head, len)) = self.pop_used() {
                debug_assert_eq!(head, chain.head, "out-of-order completion");
                self.complete(chain);
                return len;
            }
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::boxed::Box;
    use std::vec;

    fn queue_memory() -> (*mut u8, PhysAddr) {
        let buf = vec![0u128; 8192 / 16].into_boxed_slice();
        let base = Box::leak(buf).as_mut_ptr().cast::<u8>();
        (base, PhysAddr::new(base as u64))
    }

    fn read_desc(vq: &Virtqueue, index: u16) -> VirtqDesc {
        // SAFETY: test queue memory is live
        unsafe { read_volatile(vq.desc_ptr(index)) }
    }

    fn avail_idx(vq: &Virtqueue) -> u16 {
        // SAFETY: test queue memory is live
        unsafe { read_volatile(vq.avail_idx_ptr()) }
    }

    /// Simulate the device consuming a chain.
    fn device_complete(vq: &Virtqueue, head: u16, len: u32) {
        // SAFETY: test queue memory is live
        unsafe {
            let used_idx_ptr = vq.base.add(vq.layout.used + 2).cast::<u16>();
            let idx = read_volatile(used_idx_ptr);
            let elem_ptr = vq
                .base
                .add(vq.layout.used + 4)
                .cast::<VirtqUsedElem>()
                .add((idx % vq.size) as usize);
            write_volatile(
                elem_ptr,
                VirtqUsedElem {
                    id: head as u32,
                    len,
                },
            );
            write_volatile(used_idx_ptr, idx.wrapping_add(1));
        }
    }

    #[test]
    fn test_layout_for_16() {
        let l = QueueLayout::for_size(16);
        assert_eq!(l.desc, 0);
        assert_eq!(l.avail, 256);
        assert_eq!(l.used, 4096);
        assert_eq!(l.total, 8192);
    }

    #[test]
    fn test_submit_builds_chain() {
        let (base, phys) = queue_memory();
        // SAFETY: leaked zeroed buffer
        let mut vq = unsafe { Virtqueue::new(base, phys, 16) };

        let chain = vq
            .submit(&[(0x1000, 16, false), (0x2000, 512, true), (0x3000, 1, true)])
            .unwrap();
        assert_eq!(chain.head(), 0);

        let d0 = read_desc(&vq, 0);
        assert_eq!(d0.addr, 0x1000);
        assert_eq!(d0.len, 16);
        assert_eq!(d0.flags, desc_flags::NEXT);
        assert_eq!(d0.next, 1);

        let d1 = read_desc(&vq, 1);
        assert_eq!(d1.flags, desc_flags::NEXT | desc_flags::WRITE);
        assert_eq!(d1.next, 2);

        let d2 = read_desc(&vq, 2);
        assert_eq!(d2.flags, desc_flags::WRITE);

        // The head landed in the available ring and the index advanced.
        assert_eq!(avail_idx(&vq), 1);
    }

    #[test]
    fn test_used_advances_once_per_chain() {
        let (base, phys) = queue_memory();
        // SAFETY: leaked zeroed buffer
        let mut vq = unsafe { Virtqueue::new(base, phys, 16) };

        let a = vq.submit(&[(0x1000, 16, false)]).unwrap();
        let b = vq.submit(&[(0x2000, 16, false)]).unwrap();

        assert!(!vq.has_used());
        device_complete(&vq, a.head(), 0);
        device_complete(&vq, b.head(), 0);

        let (head_a, _) = vq.pop_used().unwrap();
        let (head_b, _) = vq.pop_used().unwrap();
        assert_eq!(head_a, a.head());
        assert_eq!(head_b, b.head());
        assert!(vq.pop_used().is_none());

        vq.complete(a);
        vq.complete(b);
    }

    #[test]
    fn test_descriptors_recycle_after_complete() {
        let (base, phys) = queue_memory();
        // SAFETY: leaked zeroed buffer
        let mut vq = unsafe { Virtqueue::new(base, phys, 4) };

        // Saturate the table.
        let a = vq.submit(&[(1, 1, false), (2, 1, false)]).unwrap();
        let b = vq.submit(&[(3, 1, false), (4, 1, false)]).unwrap();
        assert!(vq.submit(&[(5, 1, false)]).is_none());

        device_complete(&vq, a.head(), 0);
        let (head, _) = vq.pop_used().unwrap();
        assert_eq!(head, a.head());
        vq.complete(a);

        // Two descriptors are free again.
        assert!(vq.submit(&[(6, 1, false), (7, 1, false)]).is_some());
        vq.complete(b);
    }

    #[test]
    fn test_wait_returns_written_length() {
        let (base, phys) = queue_memory();
        // SAFETY: leaked zeroed buffer
        let mut vq = unsafe { Virtqueue::new(base, phys, 16) };

        let chain = vq.submit(&[(0x1000, 512, true)]).unwrap();
        device_complete(&vq, chain.head(), 512);
        assert_eq!(vq.wait(chain), 512);
    }
}
