//! GPT Partition Table
//!
//! Reads the header at LBA 1, validates the signature, and records the
//! used partition entries. On-disk records are explicit little-endian
//! schemas decoded with `zerocopy`; nothing aliases the sector buffer.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::drivers::blk;

/// "EFI PART", little-endian.
pub const SIGNATURE: u64 = 0x5452_4150_2049_4645;

/// Most partition entries we record.
pub const MAX_PARTITIONS: usize = 32;

/// GPT header, the first 92 bytes of LBA 1 (decode only; the trailing
/// alignment padding never reaches the disk).
#[repr(C)]
#[derive(Clone, Copy, FromBytes, Immutable, KnownLayout)]
struct GptHeader {
    signature: u64,
    revision: u32,
    header_size: u32,
    header_crc32: u32,
    reserved: u32,
    current_lba: u64,
    backup_lba: u64,
    first_usable_lba: u64,
    last_usable_lba: u64,
    disk_guid: [u8; 16],
    partition_entry_lba: u64,
    num_partition_entries: u32,
    partition_entry_size: u32,
    partition_entry_crc32: u32,
}

/// One 128-byte partition entry.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct GptEntry {
    type_guid: [u8; 16],
    unique_guid: [u8; 16],
    start_lba: u64,
    end_lba: u64,
    attributes: u64,
    name_utf16: [u8; 72],
}

/// A recorded partition.
#[derive(Debug, Clone, Copy)]
pub struct Partition {
    /// Index within the recorded table.
    pub index: usize,
    /// First sector.
    pub start_lba: u64,
    /// Last sector, inclusive.
    pub end_lba: u64,
    /// Length in sectors.
    pub size_sectors: u64,
    /// Partition type GUID, raw.
    pub type_guid: [u8; 16],
}

static PARTITIONS: Mutex<Vec<Partition>> = Mutex::new(Vec::new());

/// Parse the entry array bytes into partitions. Unused entries (all-zero
/// type GUID) are skipped.
fn parse_entries(bytes: &[u8], entry_size: usize, num_entries: usize) -> Vec<Partition> {
    let mut found = Vec::new();
    for i in 0..num_entries.min(MAX_PARTITIONS) {
        let offset = i * entry_size;
        if offset + core::mem::size_of::<GptEntry>() > bytes.len() {
            break;
        }
        let Ok((entry, _)) = GptEntry::read_from_prefix(&bytes[offset..]) else {
            break;
        };
        if entry.type_guid.iter().all(|&b| b == 0) {
            continue;
        }
        found.push(Partition {
            index: found.len(),
            start_lba: entry.start_lba,
            end_lba: entry.end_lba,
            size_sectors: entry.end_lba - entry.start_lba + 1,
            type_guid: entry.type_guid,
        });
    }
    found
}

/// Read and parse the partition table. Failures leave the table empty
/// and the affected functionality absent.
pub fn init() {
    let mut sector = vec![0u8; blk::SECTOR_SIZE];
    if blk::read(1, &mut sector).is_err() {
        log::error!("gpt: cannot read header sector");
        return;
    }

    let Ok((header, _)) = GptHeader::read_from_prefix(&sector) else {
        log::error!("gpt: short header");
        return;
    };
    if header.signature != SIGNATURE {
        log::error!("gpt: bad signature {:#018x}", header.signature);
        return;
    }

    log::info!(
        "gpt: {} entries of {} bytes at LBA {}",
        header.num_partition_entries,
        header.partition_entry_size,
        header.partition_entry_lba
    );

    // One 4 KiB read covers 32 entries of 128 bytes.
    let mut entries = vec![0u8; 8 * blk::SECTOR_SIZE];
    if blk::read(header.partition_entry_lba, &mut entries).is_err() {
        log::error!("gpt: cannot read entry array");
        return;
    }

    let found = parse_entries(
        &entries,
        header.partition_entry_size as usize,
        header.num_partition_entries as usize,
    );
    for p in &found {
        log::info!(
            "gpt: partition {}: sectors {}..{} ({} MiB)",
            p.index,
            p.start_lba,
            p.end_lba,
            p.size_sectors * blk::SECTOR_SIZE as u64 / (1024 * 1024)
        );
    }
    *PARTITIONS.lock() = found;
}

/// Look up a recorded partition by index.
#[must_use]
pub fn partition(index: usize) -> Option<Partition> {
    PARTITIONS.lock().get(index).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(core::mem::offset_of!(GptHeader, partition_entry_lba), 72);
        assert_eq!(core::mem::offset_of!(GptHeader, num_partition_entries), 80);
        assert_eq!(core::mem::offset_of!(GptHeader, partition_entry_size), 84);
        assert_eq!(core::mem::size_of::<GptEntry>(), 128);
    }

    #[test]
    fn test_signature_is_efi_part() {
        assert_eq!(&SIGNATURE.to_le_bytes(), b"EFI PART");
    }

    #[test]
    fn test_parse_skips_unused_entries() {
        let mut bytes = vec![0u8; 3 * 128];
        // Entry 1 is used: nonzero type GUID, sectors 2048..4095.
        bytes[128] = 0xAB;
        bytes[128 + 32..128 + 40].copy_from_slice(&2048u64.to_le_bytes());
        bytes[128 + 40..128 + 48].copy_from_slice(&4095u64.to_le_bytes());

        let parts = parse_entries(&bytes, 128, 3);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].index, 0);
        assert_eq!(parts[0].start_lba, 2048);
        assert_eq!(parts[0].size_sectors, 2048);
        assert_eq!(parts[0].type_guid[0], 0xAB);
    }

    #[test]
    fn test_parse_respects_entry_size() {
        // Larger vendor entry size: second entry starts at 256.
        let mut bytes = vec![0u8; 512];
        bytes[256] = 0x01;
        bytes[256 + 32..256 + 40].copy_from_slice(&100u64.to_le_bytes());
        bytes[256 + 40..256 + 48].copy_from_slice(&199u64.to_le_bytes());

        let parts = parse_entries(&bytes, 256, 2);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].size_sectors, 100);
    }
}
