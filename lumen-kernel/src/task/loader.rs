//! ELF Loader
//!
//! Populates a process skeleton from a statically linked ELF64 image on
//! the filesystem: maps and fills every PT_LOAD segment, builds the user
//! stack, and initializes the saved register frame so the scheduler (or
//! the first-entry path) can drop straight into user mode.

use alloc::vec;
use alloc::vec::Vec;
use elf_rs::{Elf, ElfFile, ProgramHeaderFlags, ProgramType};

use lumen_arch::cache;
use lumen_arch::mmu::flags;
use lumen_common::layout::user;
use lumen_common::{PAGE_SIZE, PhysAddr, VirtAddr};

use crate::fs::ext4;
use crate::memory::zones::{self, frame_flags};
use crate::task;

/// AArch64 machine type in the ELF header (e_machine at offset 18).
const EM_AARCH64: u16 = 183;

/// Errors from loading a user image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfLoadError {
    /// Path did not resolve to an inode.
    NotFound,
    /// The filesystem read failed or came up short.
    Io,
    /// The ELF header failed to parse.
    ParseError,
    /// Not a 64-bit ELF image.
    Not64Bit,
    /// Not an AArch64 image.
    WrongMachine,
    /// No PT_LOAD segments.
    NoLoadableSegments,
    /// Out of physical memory.
    OutOfMemory,
    /// Page-table construction failed.
    MappingFailed,
    /// Unknown pid.
    NoSuchProcess,
}

/// Portion of one page covered by a segment's file extent.
///
/// Returns `(offset_in_page, offset_in_file, len)` for the bytes of the
/// file that land in the page at `page_va`, or `None` when the page is
/// entirely BSS.
#[must_use]
fn page_file_span(
    page_va: u64,
    seg_vaddr: u64,
    seg_offset: u64,
    seg_filesz: u64,
) -> Option<(usize, u64, usize)> {
    let page_end = page_va + PAGE_SIZE as u64;
    let file_end = seg_vaddr + seg_filesz;
    let copy_start = page_va.max(seg_vaddr);
    let copy_end = page_end.min(file_end);
    if copy_start >= copy_end {
        return None;
    }
    Some((
        (copy_start - page_va) as usize,
        seg_offset + (copy_start - seg_vaddr),
        (copy_end - copy_start) as usize,
    ))
}

/// Leaf flags for a segment's permission bits. Writable segments are
/// user-RW; anything non-executable carries user-execute-never.
#[must_use]
fn segment_flags(flags_field: ProgramHeaderFlags) -> u64 {
    if flags_field.contains(ProgramHeaderFlags::EXECUTE) {
        flags::USER_CODE
    } else if flags_field.contains(ProgramHeaderFlags::WRITE) {
        flags::USER_DATA
    } else {
        flags::USER_RODATA
    }
}

/// Load `path` into the process identified by `pid`.
pub fn load(pid: u32, path: &str) -> Result<(), ElfLoadError> {
    let ino = ext4::find_inode(path).ok_or(ElfLoadError::NotFound)?;
    let size = ext4::file_size(ino).ok_or(ElfLoadError::Io)?;

    let mut data: Vec<u8> = vec![0; size as usize];
    let read = ext4::read_inode(ino, 0, &mut data).map_err(|_| ElfLoadError::Io)?;
    if read != size as usize {
        return Err(ElfLoadError::Io);
    }

    // Machine check straight off the little-endian header bytes.
    if data.len() < 20 {
        return Err(ElfLoadError::ParseError);
    }
    if u16::from_le_bytes([data[18], data[19]]) != EM_AARCH64 {
        return Err(ElfLoadError::WrongMachine);
    }

    let elf = Elf::from_bytes(&data).map_err(|_| ElfLoadError::ParseError)?;
    let elf64 = match elf {
        Elf::Elf64(e) => e,
        Elf::Elf32(_) => return Err(ElfLoadError::Not64Bit),
    };
    let entry = elf64.elf_header().entry_point();

    let mut loaded_any = false;

    for phdr in elf64.program_header_iter() {
        if phdr.ph_type() != ProgramType::LOAD || phdr.memsz() == 0 {
            continue;
        }
        loaded_any = true;

        let vaddr = phdr.vaddr();
        let memsz = phdr.memsz();
        let filesz = phdr.filesz();
        let offset = phdr.offset();
        let leaf = segment_flags(phdr.flags());
        let executable = phdr.flags().contains(ProgramHeaderFlags::EXECUTE);

        log::info!(
            "elf: segment {:#x} memsz {:#x} filesz {:#x}",
            vaddr,
            memsz,
            filesz
        );

        let start = vaddr & !(PAGE_SIZE as u64 - 1);
        let end = (vaddr + memsz + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);

        let mut page_va = start;
        while page_va < end {
            let frame = zones::alloc_frame().ok_or(ElfLoadError::OutOfMemory)?;
            if let Some(desc) = zones::phys_to_descriptor(frame) {
                desc.set_flag(frame_flags::USER);
            }

            map_user_page(pid, VirtAddr::new(page_va), frame, leaf)?;

            // The frame is zeroed on allocation, so BSS needs no work;
            // copy only the intersection with the file extent.
            if let Some((page_off, file_off, len)) =
                page_file_span(page_va, vaddr, offset, filesz)
            {
                let src = &data[file_off as usize..file_off as usize + len];
                // SAFETY: The frame is identity-mapped, exclusively
                // ours, and len is bounded by the page size.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        src.as_ptr(),
                        (frame.as_u64() + page_off as u64) as *mut u8,
                        len,
                    );
                }
            }

            if executable {
                cache::clean_dcache_range_pou(frame.as_u64(), PAGE_SIZE);
            }

            page_va += PAGE_SIZE as u64;
        }
    }

    if !loaded_any {
        return Err(ElfLoadError::NoLoadableSegments);
    }

    // User stack: fixed 1 MiB region below STACK_TOP.
    let mut page_va = user::STACK_BASE;
    while page_va < user::STACK_TOP {
        let frame = zones::alloc_frame().ok_or(ElfLoadError::OutOfMemory)?;
        if let Some(desc) = zones::phys_to_descriptor(frame) {
            desc.set_flag(frame_flags::USER);
        }
        map_user_page(pid, VirtAddr::new(page_va), frame, flags::USER_DATA)?;
        page_va += PAGE_SIZE as u64;
    }

    task::with_process(pid, |proc| {
        proc.finish_load(VirtAddr::new(entry), VirtAddr::new(user::STACK_TOP));
    })
    .ok_or(ElfLoadError::NoSuchProcess)?;

    cache::invalidate_icache_all();

    log::info!("elf: {} loaded, entry {:#x}", path, entry);
    Ok(())
}

fn map_user_page(
    pid: u32,
    va: VirtAddr,
    pa: PhysAddr,
    leaf: u64,
) -> Result<(), ElfLoadError> {
    task::with_process(pid, |proc| proc.space_mut().map(va, pa, leaf))
        .ok_or(ElfLoadError::NoSuchProcess)?
        .map_err(|_| ElfLoadError::MappingFailed)
}

/// Convenience: create a process and load its image in one step.
#[must_use]
pub fn spawn(name: &str, path: &str) -> Option<u32> {
    let pid = task::create(name)?;
    match load(pid, path) {
        Ok(()) => Some(pid),
        Err(err) => {
            log::error!("elf: loading {} failed: {:?}", path, err);
            let _ = task::with_process(pid, |proc| proc.abandon());
            None
        }
    }
}

const _: () = assert!(user::STACK_SIZE % PAGE_SIZE as u64 == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_file_span_full_page() {
        // Segment starts page-aligned with more than a page of file data.
        let span = page_file_span(0x40_0000, 0x40_0000, 0x1000, 0x3000);
        assert_eq!(span, Some((0, 0x1000, PAGE_SIZE)));
    }

    #[test]
    fn test_page_file_span_unaligned_start() {
        // Segment starts mid-page: copy lands at the segment's offset
        // within the page.
        let span = page_file_span(0x40_0000, 0x40_0800, 0x200, 0x100);
        assert_eq!(span, Some((0x800, 0x200, 0x100)));
    }

    #[test]
    fn test_page_file_span_bss_page() {
        // Page past the file extent: pure BSS, nothing to copy.
        let span = page_file_span(0x40_2000, 0x40_0000, 0, 0x1800);
        assert_eq!(span, None);
    }

    #[test]
    fn test_page_file_span_partial_tail() {
        // File extent ends mid-page.
        let span = page_file_span(0x40_1000, 0x40_0000, 0, 0x1800);
        assert_eq!(span, Some((0, 0x1000, 0x800)));
    }

    #[test]
    fn test_segment_flags() {
        assert_eq!(
            segment_flags(ProgramHeaderFlags::READ | ProgramHeaderFlags::EXECUTE),
            flags::USER_CODE
        );
        assert_eq!(
            segment_flags(ProgramHeaderFlags::READ | ProgramHeaderFlags::WRITE),
            flags::USER_DATA
        );
        assert_eq!(segment_flags(ProgramHeaderFlags::READ), flags::USER_RODATA);
    }
}
