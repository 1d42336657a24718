//! Fixed image geometry.
//!
//! # Layout
//! =====================================================
//! | Link Table | Node Table | Block Bitmap | Block Pool |
//! =====================================================
//!
//! Every region starts right after the previous one, nothing is block aligned
//! and all integers are stored little endian.

/// Width of the zero padded filename field of a link slot.
pub const FILENAME_SIZE: usize = 256;
/// Number of slots in the link table.
pub const MAX_LINKS: usize = 2048;
/// Number of records in the node table.
pub const MAX_NODES: usize = 1024;
/// Size in bytes of a single node record.
pub const NODE_RECORD_SIZE: usize = 1024;
/// 4k is a common block size for file systems.
pub const BLOCK_SIZE: usize = 4096;
/// Number of blocks in the data pool, one bitmap bit each.
pub const MAX_BLOCKS: usize = 8192;

/// Node ids are stored as 16-bit words.
const ID_BYTES: usize = 2;

pub const LINK_SLOT_SIZE: usize = FILENAME_SIZE + ID_BYTES;
/// Two header words (active links, block count) precede the block list.
pub const MAX_BLOCKS_PER_NODE: usize = (NODE_RECORD_SIZE - 2 * ID_BYTES) / ID_BYTES;

pub const LINK_TABLE_SIZE: usize = MAX_LINKS * LINK_SLOT_SIZE;
pub const NODE_TABLE_SIZE: usize = MAX_NODES * NODE_RECORD_SIZE;
pub const BITMAP_SIZE: usize = MAX_BLOCKS / 8;
pub const BLOCK_POOL_SIZE: usize = MAX_BLOCKS * BLOCK_SIZE;

/// Known locations.
pub const LINK_TABLE_OFFSET: u64 = 0;
pub const NODE_TABLE_OFFSET: u64 = LINK_TABLE_SIZE as u64;
pub const BITMAP_OFFSET: u64 = NODE_TABLE_OFFSET + NODE_TABLE_SIZE as u64;
pub const BLOCK_POOL_OFFSET: u64 = BITMAP_OFFSET + BITMAP_SIZE as u64;

/// Total length of a formatted image. Never changes after `mkfs`.
pub const IMAGE_SIZE: u64 = BLOCK_POOL_OFFSET + BLOCK_POOL_SIZE as u64;

const _: () = assert!(MAX_BLOCKS % 8 == 0);
const _: () = assert!(MAX_BLOCKS <= u16::MAX as usize + 1);
const _: () = assert!(MAX_NODES <= u16::MAX as usize + 1);
const _: () = assert!(MAX_BLOCKS_PER_NODE <= u16::MAX as usize);

/// Byte offset of node record `id`.
pub fn node_offset(id: u16) -> u64 {
    NODE_TABLE_OFFSET + id as u64 * NODE_RECORD_SIZE as u64
}

/// Byte offset of `within` bytes into data block `block`.
pub fn block_offset(block: u16, within: usize) -> u64 {
    debug_assert!(within < BLOCK_SIZE);
    BLOCK_POOL_OFFSET + block as u64 * BLOCK_SIZE as u64 + within as u64
}
