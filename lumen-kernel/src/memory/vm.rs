//! Virtual Memory Manager
//!
//! Builds the kernel identity map, enables the MMU, and constructs
//! per-process address spaces.
//!
//! Every process root starts as a copy of the kernel's 512 top-level
//! entries, so the kernel mappings are uniform across address-space
//! switches. User mappings may share a top-level entry with the kernel
//! identity map (both live in the low canonical range), so the walk
//! clones any table still shared with the kernel path before writing
//! through it; kernel-reachable tables are never mutated on behalf of a
//! process.

use core::sync::atomic::{AtomicU64, Ordering};

use lumen_arch::mmu::{self, ENTRIES_PER_TABLE, PHYS_ADDR_MASK, PageTable, VirtAddrParts, flags};
use lumen_common::layout::mem;
use lumen_common::{PhysAddr, VirtAddr};

use super::zones;

/// Errors from mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No frame available for an intermediate table.
    OutOfMemory,
    /// Unmap of an address that was not mapped.
    NotMapped,
}

/// Source of zeroed frames for intermediate tables. The kernel feeds the
/// frame allocator in; tests feed leaked host allocations.
pub trait FrameSource {
    /// Allocate one zeroed, page-aligned frame and return its address.
    fn alloc_table(&mut self) -> Option<PhysAddr>;
}

/// The kernel's frame source.
pub struct KernelFrames;

impl FrameSource for KernelFrames {
    fn alloc_table(&mut self) -> Option<PhysAddr> {
        zones::alloc_frame()
    }
}

/// Access a translation table through the identity map.
///
/// # Safety
///
/// `pa` must be the address of a live `PageTable` frame and the caller
/// must hold whatever exclusion the table needs.
unsafe fn table_mut<'a>(pa: PhysAddr) -> &'a mut PageTable {
    // SAFETY: Caller contract
    unsafe { &mut *(pa.as_u64() as *mut PageTable) }
}

/// A page-table walker rooted at one top-level table.
///
/// `kernel_root` carries the root whose tables must be treated as
/// shared-immutable; pass `None` when building the kernel map itself.
pub struct Mapper<'a, F: FrameSource> {
    root: PhysAddr,
    kernel_root: Option<PhysAddr>,
    frames: &'a mut F,
}

impl<'a, F: FrameSource> Mapper<'a, F> {
    /// Create a walker over `root`.
    pub fn new(root: PhysAddr, kernel_root: Option<PhysAddr>, frames: &'a mut F) -> Self {
        Self {
            root,
            kernel_root,
            frames,
        }
    }

    /// Map one page. Intermediate tables are allocated (and cloned off
    /// the kernel path where shared) on demand; the leaf is written with
    /// exactly `leaf_flags | pa`.
    pub fn map(&mut self, va: VirtAddr, pa: PhysAddr, leaf_flags: u64) -> Result<(), MapError> {
        let parts = VirtAddrParts::from_vaddr(va.as_u64());
        let indices = [parts.l0, parts.l1, parts.l2];

        let mut table_pa = self.root;
        let mut kernel_pa = match self.kernel_root {
            Some(k) if k != self.root => Some(k),
            _ => None,
        };

        for idx in indices {
            // SAFETY: table_pa always refers to a live table frame
            let table = unsafe { table_mut(table_pa) };
            let kernel_entry = kernel_pa.map(|k| {
                // SAFETY: kernel root tables are live for the kernel's lifetime
                unsafe { table_mut(k) }.get(idx)
            });
            let entry = table.get(idx);

            if entry & flags::VALID == 0 {
                let new = self.frames.alloc_table().ok_or(MapError::OutOfMemory)?;
                table.set(idx, new.as_u64() | flags::TABLE_DESC);
                table_pa = new;
            } else {
                let next = PhysAddr::new(entry & PHYS_ADDR_MASK);
                let shared_with_kernel = kernel_entry
                    .is_some_and(|k| k & flags::VALID != 0 && (k & PHYS_ADDR_MASK) == next.as_u64());
                if shared_with_kernel {
                    // Clone before first write: the kernel still owns
                    // this table.
                    let new = self.frames.alloc_table().ok_or(MapError::OutOfMemory)?;
                    // SAFETY: both frames are live tables
                    let (src, dst) = unsafe { (table_mut(next), table_mut(new)) };
                    dst.entries_mut().copy_from_slice(src.entries());
                    table.set(idx, new.as_u64() | flags::TABLE_DESC);
                    table_pa = new;
                } else {
                    table_pa = next;
                }
            }

            kernel_pa = kernel_entry.and_then(|k| {
                if k & flags::VALID != 0 && k & flags::TABLE != 0 {
                    Some(PhysAddr::new(k & PHYS_ADDR_MASK))
                } else {
                    None
                }
            });
        }

        // SAFETY: table_pa is the live level-3 table for this range
        let leaf = unsafe { table_mut(table_pa) };
        leaf.set(parts.l3, pa.as_u64() | leaf_flags);
        Ok(())
    }

    /// Unmap one page: zero the leaf and invalidate the TLB entry.
    pub fn unmap(&mut self, va: VirtAddr) -> Result<(), MapError> {
        let parts = VirtAddrParts::from_vaddr(va.as_u64());
        let mut table_pa = self.root;

        for idx in [parts.l0, parts.l1, parts.l2] {
            // SAFETY: table_pa always refers to a live table frame
            let table = unsafe { table_mut(table_pa) };
            let entry = table.get(idx);
            if entry & flags::VALID == 0 {
                return Err(MapError::NotMapped);
            }
            table_pa = PhysAddr::new(entry & PHYS_ADDR_MASK);
        }

        // SAFETY: table_pa is the live level-3 table for this range
        let leaf = unsafe { table_mut(table_pa) };
        if !leaf.is_valid(parts.l3) {
            return Err(MapError::NotMapped);
        }
        leaf.set(parts.l3, 0);
        mmu::invalidate_tlb_vaddr(va.as_u64());
        Ok(())
    }

    /// Software translation of `va`, for diagnostics and tests.
    #[must_use]
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        translate(self.root, va)
    }
}

/// Walk `root` in software and translate `va`, or `None` if unmapped.
#[must_use]
pub fn translate(root: PhysAddr, va: VirtAddr) -> Option<PhysAddr> {
    let parts = VirtAddrParts::from_vaddr(va.as_u64());
    let mut table_pa = root;

    for idx in [parts.l0, parts.l1, parts.l2] {
        // SAFETY: root and every table it references are live frames
        let table = unsafe { table_mut(table_pa) };
        let entry = table.get(idx);
        if entry & flags::VALID == 0 {
            return None;
        }
        table_pa = PhysAddr::new(entry & PHYS_ADDR_MASK);
    }

    // SAFETY: table_pa is the live level-3 table for this range
    let leaf = unsafe { table_mut(table_pa) };
    if !leaf.is_valid(parts.l3) {
        return None;
    }
    Some(PhysAddr::new(
        leaf.table_address(parts.l3) | parts.offset as u64,
    ))
}

// -- Kernel map

static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

/// Physical address of the kernel's top-level table.
#[must_use]
pub fn kernel_root() -> PhysAddr {
    PhysAddr::new(KERNEL_ROOT.load(Ordering::Acquire))
}

/// Build the kernel identity map and enable the MMU.
///
/// - DRAM (1 GiB at its physical address) as normal write-back,
///   kernel RW, user execute-never
/// - the MMIO aperture as device nGnRE with both execute-never bits
///
/// # Safety
///
/// Must run exactly once, with the MMU off, on the boot hart.
pub unsafe fn init() {
    let root = zones::alloc_frame().expect("vmm: no frame for kernel root");
    let mut frames = KernelFrames;
    let mut mapper = Mapper::new(root, None, &mut frames);

    let mut addr = mem::RAM_BASE;
    while addr < mem::RAM_BASE + mem::RAM_SIZE {
        mapper
            .map(VirtAddr::new(addr), PhysAddr::new(addr), flags::KERNEL)
            .expect("vmm: kernel RAM map failed");
        addr += lumen_common::PAGE_SIZE as u64;
    }

    let mut addr = mem::MMIO_BASE;
    while addr < mem::MMIO_END {
        mapper
            .map(VirtAddr::new(addr), PhysAddr::new(addr), flags::DEVICE)
            .expect("vmm: MMIO map failed");
        addr += lumen_common::PAGE_SIZE as u64;
    }

    KERNEL_ROOT.store(root.as_u64(), Ordering::Release);

    // SAFETY: The map above identity-covers the executing kernel image.
    unsafe { mmu::enable(root.as_u64()) };

    log::info!("vmm: MMU enabled, kernel root at {:#x}", root.as_u64());
}

// -- Process address spaces

/// A per-process translation tree.
pub struct AddressSpace {
    root: PhysAddr,
}

impl AddressSpace {
    /// Create a new address space whose top-level table is a copy of the
    /// kernel's, so the kernel stays mapped when TTBR0 switches.
    #[must_use]
    pub fn new() -> Option<Self> {
        let root = zones::alloc_frame()?;
        let kernel = kernel_root();
        // SAFETY: both are live table frames
        let (src, dst) = unsafe { (table_mut(kernel), table_mut(root)) };
        dst.entries_mut().copy_from_slice(src.entries());
        Some(Self { root })
    }

    /// Physical address of the top-level table (the TTBR0 value).
    #[must_use]
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Map one user page.
    pub fn map(&mut self, va: VirtAddr, pa: PhysAddr, leaf_flags: u64) -> Result<(), MapError> {
        let mut frames = KernelFrames;
        Mapper::new(self.root, Some(kernel_root()), &mut frames).map(va, pa, leaf_flags)
    }

    /// Unmap one user page.
    pub fn unmap(&mut self, va: VirtAddr) -> Result<(), MapError> {
        let mut frames = KernelFrames;
        Mapper::new(self.root, Some(kernel_root()), &mut frames).unmap(va)
    }

    /// Software translation through this space.
    #[must_use]
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        translate(self.root, va)
    }

    /// Release the top-level frame.
    ///
    /// Lower-level tables and mapped frames are not walked; process
    /// teardown is out of scope for the current kernel.
    pub fn destroy(self) {
        zones::free_frame(self.root);
    }
}

const _: () = assert!(ENTRIES_PER_TABLE == 512);

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::boxed::Box;

    /// Hands out leaked, zeroed host allocations as "frames"; their
    /// addresses play the role of physical addresses in the walk.
    struct TestFrames;

    impl TestFrames {
        fn new() -> Self {
            Self
        }
    }

    impl FrameSource for TestFrames {
        fn alloc_table(&mut self) -> Option<PhysAddr> {
            let table: &'static mut PageTable = Box::leak(Box::new(PageTable::empty()));
            Some(PhysAddr::new(table as *mut PageTable as u64))
        }
    }

    fn new_root(frames: &mut TestFrames) -> PhysAddr {
        frames.alloc_table().unwrap()
    }

    #[test]
    fn test_map_then_translate() {
        let mut frames = TestFrames::new();
        let root = new_root(&mut frames);
        let mut m = Mapper::new(root, None, &mut frames);

        let va = VirtAddr::new(0x0040_0000);
        let pa = PhysAddr::new(0x8000_0000);
        m.map(va, pa, flags::USER_DATA).unwrap();

        assert_eq!(m.translate(va), Some(pa));
        assert_eq!(m.translate(VirtAddr::new(0x0040_0123)), Some(PhysAddr::new(0x8000_0123)));
        assert_eq!(m.translate(VirtAddr::new(0x0040_1000)), None);
    }

    #[test]
    fn test_unmap_then_translate_is_none() {
        let mut frames = TestFrames::new();
        let root = new_root(&mut frames);
        let mut m = Mapper::new(root, None, &mut frames);

        let va = VirtAddr::new(0xC000_0000);
        m.map(va, PhysAddr::new(0x9000_0000), flags::USER_DATA).unwrap();
        assert!(m.translate(va).is_some());

        m.unmap(va).unwrap();
        assert_eq!(m.translate(va), None);
        assert_eq!(m.unmap(va), Err(MapError::NotMapped));
    }

    #[test]
    fn test_remap_returns_latest_target() {
        let mut frames = TestFrames::new();
        let root = new_root(&mut frames);
        let mut m = Mapper::new(root, None, &mut frames);

        let va = VirtAddr::new(0x0010_0000);
        m.map(va, PhysAddr::new(0x7000_0000), flags::USER_DATA).unwrap();
        m.map(va, PhysAddr::new(0x7100_0000), flags::USER_DATA).unwrap();
        assert_eq!(m.translate(va), Some(PhysAddr::new(0x7100_0000)));
    }

    #[test]
    fn test_shared_kernel_tables_are_cloned_not_mutated() {
        let mut frames = TestFrames::new();

        // Kernel root with one mapping in the low range.
        let kernel = new_root(&mut frames);
        let kva = VirtAddr::new(0x0800_0000);
        Mapper::new(kernel, None, &mut frames)
            .map(kva, PhysAddr::new(0x0800_0000), flags::KERNEL)
            .unwrap();

        // Process root: copy of the kernel top level.
        let proc = frames.alloc_table().unwrap();
        // SAFETY: both are live test tables
        unsafe {
            table_mut(proc)
                .entries_mut()
                .copy_from_slice(table_mut(kernel).entries());
        }

        // Map a user page whose path shares L0[0] with the kernel map.
        let uva = VirtAddr::new(0x0040_0000);
        Mapper::new(proc, Some(kernel), &mut frames)
            .map(uva, PhysAddr::new(0xA000_0000), flags::USER_DATA)
            .unwrap();

        // The process sees both; the kernel never sees the user page.
        assert_eq!(translate(proc, uva), Some(PhysAddr::new(0xA000_0000)));
        assert_eq!(translate(proc, kva), Some(PhysAddr::new(0x0800_0000)));
        assert_eq!(translate(kernel, uva), None);
    }

    #[test]
    fn test_two_spaces_do_not_alias() {
        let mut frames = TestFrames::new();
        let kernel = new_root(&mut frames);

        let mk_space = |frames: &mut TestFrames| {
            let root = frames.alloc_table().unwrap();
            // SAFETY: live test tables
            unsafe {
                table_mut(root)
                    .entries_mut()
                    .copy_from_slice(table_mut(kernel).entries());
            }
            root
        };

        let a = mk_space(&mut frames);
        let b = mk_space(&mut frames);
        let va = VirtAddr::new(0x0040_0000);

        Mapper::new(a, Some(kernel), &mut frames)
            .map(va, PhysAddr::new(0x1111_1000), flags::USER_DATA)
            .unwrap();
        Mapper::new(b, Some(kernel), &mut frames)
            .map(va, PhysAddr::new(0x2222_2000), flags::USER_DATA)
            .unwrap();

        assert_eq!(translate(a, va), Some(PhysAddr::new(0x1111_1000)));
        assert_eq!(translate(b, va), Some(PhysAddr::new(0x2222_2000)));
    }
}
