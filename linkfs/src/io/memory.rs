use super::image::{check_range, ImageStorage};
use crate::layout::IMAGE_SIZE;

/// A blank image living entirely in memory. Nothing survives the value.
pub struct MemoryImage {
    bytes: Vec<u8>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self {
            bytes: vec![0; IMAGE_SIZE as usize],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Default for MemoryImage {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageStorage for MemoryImage {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        check_range(offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        check_range(offset, buf.len())?;
        let start = offset as usize;
        self.bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
