//! Read-Only Ext4
//!
//! A deliberately small driver for the userland partition: 4 KiB
//! blocks, block group 0 only, direct blocks plus one level of
//! indirection, and root-directory path lookup. This is the whole
//! interface the ELF loader consumes: `find_inode` and `read_inode`.
//!
//! All reads go through the block buffer cache; on-disk records are
//! little-endian schemas decoded with `zerocopy`.

use core::ptr::NonNull;

use alloc::vec;
use lumen_arch::IrqSpinMutex;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::cache::{BLOCK_SIZE, BlockCache, BlockIo, BlockStorage};
use super::gpt;
use crate::drivers::blk;
use crate::memory::zones;

/// Superblock magic.
pub const EXT4_MAGIC: u16 = 0xEF53;

/// On-disk inode record size used by the image builder.
const INODE_SIZE: usize = 256;

/// Disk sectors per filesystem block.
const SECTORS_PER_BLOCK: u64 = (BLOCK_SIZE / blk::SECTOR_SIZE) as u64;

/// Direct block pointers per inode.
const DIRECT_BLOCKS: u32 = 12;

/// Block pointers in one indirect block.
const PTRS_PER_BLOCK: u32 = (BLOCK_SIZE / 4) as u32;

/// The root directory inode.
const ROOT_INO: u32 = 2;

/// Filesystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Filesystem not mounted.
    NotMounted,
    /// Device or cache read failed.
    Io,
    /// Double-indirect and beyond are not supported.
    Unsupported,
}

/// Superblock prefix (through the volume name); lives at byte offset
/// 1024 of the partition.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct Superblock {
    s_inodes_count: u32,
    s_blocks_count_lo: u32,
    s_r_blocks_count_lo: u32,
    s_free_blocks_count_lo: u32,
    s_free_inodes_count: u32,
    s_first_data_block: u32,
    s_log_block_size: u32,
    s_log_cluster_size: u32,
    s_blocks_per_group: u32,
    s_clusters_per_group: u32,
    s_inodes_per_group: u32,
    s_mtime: u32,
    s_wtime: u32,
    s_mnt_count: u16,
    s_max_mnt_count: u16,
    s_magic: u16,
    s_state: u16,
    s_errors: u16,
    s_minor_rev_level: u16,
    s_lastcheck: u32,
    s_checkinterval: u32,
    s_creator_os: u32,
    s_rev_level: u32,
    s_def_resuid: u16,
    s_def_resgid: u16,
    s_first_ino: u32,
    s_inode_size: u16,
    s_block_group_nr: u16,
    s_feature_compat: u32,
    s_feature_incompat: u32,
    s_feature_ro_compat: u32,
    s_uuid: [u8; 16],
    s_volume_name: [u8; 16],
}

/// Legacy 32-byte block group descriptor prefix.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct GroupDesc {
    bg_block_bitmap_lo: u32,
    bg_inode_bitmap_lo: u32,
    bg_inode_table_lo: u32,
    bg_free_blocks_count_lo: u16,
    bg_free_inodes_count_lo: u16,
    bg_used_dirs_count_lo: u16,
    bg_flags: u16,
    bg_exclude_bitmap_lo: u32,
    bg_block_bitmap_csum_lo: u16,
    bg_inode_bitmap_csum_lo: u16,
    bg_itable_unused_lo: u16,
    bg_checksum: u16,
}

/// The 128-byte classic inode prefix.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct Inode {
    i_mode: u16,
    i_uid: u16,
    i_size_lo: u32,
    i_atime: u32,
    i_ctime: u32,
    i_mtime: u32,
    i_dtime: u32,
    i_gid: u16,
    i_links_count: u16,
    i_blocks_lo: u32,
    i_flags: u32,
    i_osd1: u32,
    i_block: [u32; 15],
    i_generation: u32,
    i_file_acl_lo: u32,
    i_size_high: u32,
    i_obso_faddr: u32,
    i_osd2: [u8; 12],
}

/// Directory entry header; the name follows.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct DirEntryHead {
    inode: u32,
    rec_len: u16,
    name_len: u8,
    file_type: u8,
}

// -- Cache plumbing

/// Whole-block I/O over the VirtIO block device.
struct DiskIo;

impl BlockIo for DiskIo {
    fn read_block(&mut self, block: u64, buf: &mut [u8]) -> bool {
        blk::read(block * SECTORS_PER_BLOCK, buf).is_ok()
    }

    fn write_block(&mut self, block: u64, buf: &[u8]) -> bool {
        blk::write(block * SECTORS_PER_BLOCK, buf).is_ok()
    }
}

/// Block-aligned cache data buffers straight from the frame allocator.
struct FrameStorage;

impl BlockStorage for FrameStorage {
    fn alloc_block(&mut self) -> Option<NonNull<u8>> {
        zones::alloc_frame().and_then(|pa| NonNull::new(pa.as_u64() as *mut u8))
    }
}

struct Ext4State {
    /// First sector of the userland partition.
    part_start_lba: u64,
    /// First block of the inode table (group 0).
    inode_table_block: u32,
    cache: BlockCache<DiskIo, FrameStorage>,
}

impl Ext4State {
    /// Absolute disk block number of a filesystem block. The partition
    /// start is block-aligned (GPT aligns to 2048 sectors).
    fn disk_block(&self, fs_block: u32) -> u64 {
        self.part_start_lba / SECTORS_PER_BLOCK + fs_block as u64
    }

    /// Run `f` over the cached contents of a filesystem block.
    fn with_block<R>(&mut self, fs_block: u32, f: impl FnOnce(&[u8]) -> R) -> Result<R, FsError> {
        let block = self.disk_block(fs_block);
        let result = {
            let data = self.cache.get(block).ok_or(FsError::Io)?;
            f(data)
        };
        self.cache.put(block);
        Ok(result)
    }

    /// Fetch an inode record from the table.
    fn inode(&mut self, ino: u32) -> Result<Inode, FsError> {
        let byte_offset = (ino as u64 - 1) * INODE_SIZE as u64;
        let fs_block = self.inode_table_block + (byte_offset / BLOCK_SIZE as u64) as u32;
        let in_block = (byte_offset % BLOCK_SIZE as u64) as usize;

        self.with_block(fs_block, |data| {
            Inode::read_from_prefix(&data[in_block..])
                .map(|(inode, _)| inode)
                .map_err(|_| FsError::Io)
        })?
    }

    /// Physical filesystem block for file-relative `block_idx`, or
    /// `None` for a sparse hole.
    fn block_of(&mut self, inode: &Inode, block_idx: u32) -> Result<Option<u32>, FsError> {
        if block_idx < DIRECT_BLOCKS {
            let b = inode.i_block[block_idx as usize];
            return Ok((b != 0).then_some(b));
        }

        let indirect_idx = block_idx - DIRECT_BLOCKS;
        if indirect_idx >= PTRS_PER_BLOCK {
            log::error!("ext4: double-indirect block {} requested", block_idx);
            return Err(FsError::Unsupported);
        }

        let indirect_block = inode.i_block[DIRECT_BLOCKS as usize];
        if indirect_block == 0 {
            return Ok(None);
        }

        // The pointer block goes through the cache (heap/frame backed),
        // never a stack buffer.
        let b = self.with_block(indirect_block, |data| {
            let off = indirect_idx as usize * 4;
            u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
        })?;
        Ok((b != 0).then_some(b))
    }
}

static STATE: IrqSpinMutex<Option<Ext4State>> = IrqSpinMutex::new(None);

/// Mount the userland partition (GPT index 2).
pub fn init() {
    let Some(part) = gpt::partition(2) else {
        log::error!("ext4: userland partition (index 2) not found");
        return;
    };

    // Superblock sits at byte offset 1024: sector 2 of the partition.
    let mut buf = vec![0u8; 2 * blk::SECTOR_SIZE];
    if blk::read(part.start_lba + 2, &mut buf).is_err() {
        log::error!("ext4: cannot read superblock");
        return;
    }
    let Ok((sb, _)) = Superblock::read_from_prefix(&buf) else {
        log::error!("ext4: short superblock");
        return;
    };
    if sb.s_magic != EXT4_MAGIC {
        log::error!("ext4: bad magic {:#06x}", sb.s_magic);
        return;
    }

    let volume = core::str::from_utf8(&sb.s_volume_name)
        .unwrap_or("")
        .trim_end_matches('\0');
    log::info!(
        "ext4: mounted '{}', {} inodes, {} blocks",
        volume,
        sb.s_inodes_count,
        sb.s_blocks_count_lo
    );

    // Group descriptor table lives in the block after the superblock.
    if blk::read(part.start_lba + 8, &mut buf).is_err() {
        log::error!("ext4: cannot read group descriptors");
        return;
    }
    let Ok((gd, _)) = GroupDesc::read_from_prefix(&buf) else {
        log::error!("ext4: short group descriptor");
        return;
    };
    log::info!("ext4: group 0 inode table at block {}", gd.bg_inode_table_lo);

    *STATE.lock() = Some(Ext4State {
        part_start_lba: part.start_lba,
        inode_table_block: gd.bg_inode_table_lo,
        cache: BlockCache::new(DiskIo, FrameStorage),
    });
}

/// Resolve a `/`-prefixed single-component path in the root directory.
#[must_use]
pub fn find_inode(path: &str) -> Option<u32> {
    let target = path.strip_prefix('/').unwrap_or(path);

    let mut guard = STATE.lock();
    let state = guard.as_mut()?;

    let root = state.inode(ROOT_INO).ok()?;
    let first_block = root.i_block[0];
    if first_block == 0 {
        return None;
    }

    state
        .with_block(first_block, |data| {
            let mut offset = 0;
            while offset + core::mem::size_of::<DirEntryHead>() <= data.len() {
                let Ok((head, _)) = DirEntryHead::read_from_prefix(&data[offset..]) else {
                    return None;
                };
                if head.inode == 0 || head.rec_len == 0 {
                    return None;
                }
                let name_start = offset + core::mem::size_of::<DirEntryHead>();
                let name_end = name_start + head.name_len as usize;
                if name_end <= data.len()
                    && &data[name_start..name_end] == target.as_bytes()
                {
                    return Some(head.inode);
                }
                offset += head.rec_len as usize;
            }
            None
        })
        .ok()
        .flatten()
}

/// Size in bytes of the file behind `ino`.
#[must_use]
pub fn file_size(ino: u32) -> Option<u64> {
    let mut guard = STATE.lock();
    let state = guard.as_mut()?;
    state.inode(ino).ok().map(|i| i.i_size_lo as u64)
}

/// Random-access read: copy up to `buf.len()` bytes of the file starting
/// at `offset` into `buf`. Sparse holes read as zeroes. Returns the
/// byte count actually read (short at end of file).
pub fn read_inode(ino: u32, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
    let mut guard = STATE.lock();
    let state = guard.as_mut().ok_or(FsError::NotMounted)?;

    let inode = state.inode(ino)?;
    let file_size = inode.i_size_lo as u64;
    if offset >= file_size {
        return Ok(0);
    }
    let len = buf.len().min((file_size - offset) as usize);

    let mut done = 0;
    let mut pos = offset;
    while done < len {
        let block_idx = (pos / BLOCK_SIZE as u64) as u32;
        let in_block = (pos % BLOCK_SIZE as u64) as usize;
        let chunk = (BLOCK_SIZE - in_block).min(len - done);

        match state.block_of(&inode, block_idx)? {
            Some(fs_block) => {
                state.with_block(fs_block, |data| {
                    buf[done..done + chunk].copy_from_slice(&data[in_block..in_block + chunk]);
                })?;
            }
            None => {
                // Sparse hole.
                buf[done..done + chunk].fill(0);
            }
        }

        done += chunk;
        pos += chunk as u64;
    }

    Ok(done)
}

/// Flush dirty cached blocks (best effort; the driver itself never
/// dirties anything on the read-only mount).
pub fn sync() {
    if let Some(state) = STATE.lock().as_mut() {
        state.cache.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layouts() {
        assert_eq!(core::mem::size_of::<GroupDesc>(), 32);
        assert_eq!(core::mem::size_of::<Inode>(), 128);
        assert_eq!(core::mem::size_of::<DirEntryHead>(), 8);
        assert_eq!(core::mem::offset_of!(Superblock, s_magic), 56);
        assert_eq!(core::mem::offset_of!(Superblock, s_inode_size), 88);
        assert_eq!(core::mem::offset_of!(Superblock, s_volume_name), 120);
        assert_eq!(core::mem::offset_of!(Inode, i_block), 40);
    }

    #[test]
    fn test_superblock_magic_decodes() {
        let mut raw = [0u8; 136];
        raw[56] = 0x53;
        raw[57] = 0xEF;
        raw[0..4].copy_from_slice(&128u32.to_le_bytes());
        let (sb, _) = Superblock::read_from_prefix(&raw[..]).unwrap();
        assert_eq!(sb.s_magic, EXT4_MAGIC);
        assert_eq!(sb.s_inodes_count, 128);
    }

    #[test]
    fn test_dir_entry_decodes() {
        let mut raw = [0u8; 16];
        raw[0..4].copy_from_slice(&12u32.to_le_bytes()); // inode
        raw[4..6].copy_from_slice(&16u16.to_le_bytes()); // rec_len
        raw[6] = 4; // name_len
        raw[7] = 1; // file_type
        raw[8..12].copy_from_slice(b"init");
        let (head, _) = DirEntryHead::read_from_prefix(&raw[..]).unwrap();
        assert_eq!(head.inode, 12);
        assert_eq!(head.rec_len, 16);
        assert_eq!(&raw[8..8 + head.name_len as usize], b"init");
    }
}
