use crate::fs::{FsError, Result};
use crate::layout::{BITMAP_SIZE, MAX_BLOCKS};
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Debug, PartialEq)]
pub struct Bitmap {
    /// Stores one bit per data block in the pool. Bit `id & 7` of byte `id >> 3`
    /// is set while block `id` is owned by a node.
    bitmap: [u8; BITMAP_SIZE],
}

impl Bitmap {
    pub fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_SIZE],
        }
    }

    /// Reads a bitmap from a buffer of exactly `BITMAP_SIZE` bytes.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        LayoutVerified::<_, Bitmap>::new(buf)
            .map(|map| *map)
            .ok_or_else(|| {
                FsError::PreconditionViolation(format!(
                    "bitmap buffer must be {} bytes, got {}",
                    BITMAP_SIZE,
                    buf.len()
                ))
            })
    }

    pub fn serialize(&self) -> &[u8] {
        self.as_bytes()
    }

    pub fn get(&self, blocknr: u16) -> State {
        let (byte, mask) = Self::locate(blocknr);
        if self.bitmap[byte] & mask == 0 {
            State::Free
        } else {
            State::Used
        }
    }

    pub fn is_free(&self, blocknr: u16) -> bool {
        self.get(blocknr) == State::Free
    }

    pub fn set_reserved(&mut self, blocknr: u16) {
        let (byte, mask) = Self::locate(blocknr);
        self.bitmap[byte] |= mask;
    }

    pub fn set_free(&mut self, blocknr: u16) {
        let (byte, mask) = Self::locate(blocknr);
        self.bitmap[byte] &= !mask;
    }

    /// Reserves the lowest numbered free block.
    ///
    /// Scans the whole map from block 0 on every call so allocation order only
    /// depends on the bitmap contents. The map is not flushed here, callers
    /// persist it once they are done with a batch of changes.
    pub fn allocate(&mut self) -> Result<u16> {
        let blocknr = (0..MAX_BLOCKS as u16)
            .find(|&id| self.is_free(id))
            .ok_or(FsError::OutOfSpace)?;
        self.set_reserved(blocknr);
        Ok(blocknr)
    }

    pub fn free_count(&self) -> usize {
        self.bitmap
            .iter()
            .map(|byte| byte.count_zeros() as usize)
            .sum()
    }

    fn locate(blocknr: u16) -> (usize, u8) {
        assert!(
            (blocknr as usize) < MAX_BLOCKS,
            "block {} out of range",
            blocknr
        );
        ((blocknr >> 3) as usize, 1 << (blocknr & 7))
    }
}

impl Default for Bitmap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_read_and_write_values_to_bitmap() {
        let mut bmp = Bitmap::new();

        bmp.set_reserved(2);

        assert_eq!(bmp.get(0), State::Free);
        assert_eq!(bmp.get(2), State::Used);
        assert_eq!(bmp.serialize()[0], 0b100);
    }

    #[test]
    fn can_set_values_at_ends_of_bitmap() {
        let mut bmp = Bitmap::new();

        bmp.set_reserved(0);
        bmp.set_reserved(MAX_BLOCKS as u16 - 1);

        assert_eq!(bmp.get(0), State::Used);
        assert_eq!(bmp.get(MAX_BLOCKS as u16 - 1), State::Used);
        assert_eq!(bmp.serialize()[BITMAP_SIZE - 1], 0b1000_0000);
    }

    #[test]
    fn can_toggle_block_between_free_and_used() {
        let mut bmp = Bitmap::new();
        bmp.set_reserved(10);
        bmp.set_reserved(11);
        assert_eq!(bmp.get(10), State::Used);

        bmp.set_free(10);
        assert_eq!(bmp.get(10), State::Free);
        // Neighbouring bits in the same byte are untouched.
        assert_eq!(bmp.get(11), State::Used);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn addressing_block_beyond_pool_panics() {
        Bitmap::new().get(MAX_BLOCKS as u16);
    }

    #[test]
    fn can_serialize_and_deserialize_state() {
        let mut bmp = Bitmap::new();
        bmp.set_reserved(10);
        bmp.set_reserved(11);
        bmp.set_reserved(12);

        let read_bmp = Bitmap::parse(bmp.serialize()).unwrap();
        assert_eq!(read_bmp, bmp);
    }

    #[test]
    fn parsing_buffer_with_invalid_size_returns_error() {
        let result = Bitmap::parse(&[0; 16]);
        match result.unwrap_err() {
            FsError::PreconditionViolation(_) => (),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn allocation_returns_lowest_free_block() {
        let mut bmp = Bitmap::new();
        bmp.set_reserved(0);
        bmp.set_reserved(2);

        assert_eq!(bmp.allocate().unwrap(), 1);
        assert_eq!(bmp.allocate().unwrap(), 3);
        assert_eq!(bmp.allocate().unwrap(), 4);

        bmp.set_free(1);
        assert_eq!(bmp.allocate().unwrap(), 1);
    }

    #[test]
    fn allocation_on_full_bitmap_returns_out_of_space() {
        let mut bmp = Bitmap::new();
        for _ in 0..MAX_BLOCKS {
            bmp.allocate().unwrap();
        }
        assert_eq!(bmp.free_count(), 0);

        match bmp.allocate().unwrap_err() {
            FsError::OutOfSpace => (),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
