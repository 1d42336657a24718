//! Open file descriptors layered on top of a mounted [`Session`].
//!
//! A descriptor only remembers which node it reads from and where its cursor
//! is. Content lives in the node's blocks: byte `pos` of a file sits at offset
//! `pos % BLOCK_SIZE` of block `blocks[pos / BLOCK_SIZE]`.

use std::collections::BTreeMap;

use crate::fs::{FsError, Result, Session};
use crate::io::ImageStorage;
use crate::layout::BLOCK_SIZE;

use log::debug;

/// Numeric handle returned by [`Descriptors::open`].
pub type Fd = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFile {
    pub node: u16,
    pub cursor: u64,
}

/// Table of open files. Handles are reused lowest first once closed.
#[derive(Debug, Default)]
pub struct Descriptors {
    open: BTreeMap<Fd, OpenFile>,
}

impl Descriptors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the file `name` with the cursor at the start.
    pub fn open<T: ImageStorage>(&mut self, fs: &mut Session<T>, name: &str) -> Result<Fd> {
        let node = *fs
            .ls()?
            .get(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;

        let fd = (0..)
            .find(|fd| !self.open.contains_key(fd))
            .ok_or_else(|| FsError::PreconditionViolation("descriptor table full".to_string()))?;
        self.open.insert(fd, OpenFile { node, cursor: 0 });
        debug!("opened {:?} (node {}) as fd {}", name, node, fd);
        Ok(fd)
    }

    pub fn close(&mut self, fd: Fd) -> Result<()> {
        self.open
            .remove(&fd)
            .map(|_| ())
            .ok_or(FsError::BadDescriptor(fd))
    }

    /// Drops every open descriptor, used when the image goes away.
    pub fn clear(&mut self) {
        self.open.clear();
    }

    pub fn get(&self, fd: Fd) -> Result<OpenFile> {
        self.open.get(&fd).copied().ok_or(FsError::BadDescriptor(fd))
    }

    /// Moves the cursor of `fd` to the absolute byte position `pos`.
    pub fn seek(&mut self, fd: Fd, pos: u64) -> Result<()> {
        let file = self.open.get_mut(&fd).ok_or(FsError::BadDescriptor(fd))?;
        file.cursor = pos;
        Ok(())
    }

    /// Reads up to `len` bytes at the cursor and advances it.
    ///
    /// Nodes don't record a byte length, so the readable extent is every byte of
    /// every block the node owns. Reading at or past it returns fewer bytes.
    pub fn read<T: ImageStorage>(
        &mut self,
        fs: &mut Session<T>,
        fd: Fd,
        len: usize,
    ) -> Result<Vec<u8>> {
        let file = self.get(fd)?;
        let blocks = fs.filestat(file.node)?.blocks;
        let extent = blocks.len() as u64 * BLOCK_SIZE as u64;

        let end = extent.min(file.cursor.saturating_add(len as u64));
        let mut data = Vec::with_capacity(end.saturating_sub(file.cursor) as usize);
        let mut pos = file.cursor;
        while pos < end {
            let (index, within) = split(pos);
            let chunk = (BLOCK_SIZE - within).min((end - pos) as usize);
            let start = data.len();
            data.resize(start + chunk, 0);
            fs.read_block(blocks[index], within, &mut data[start..])?;
            pos += chunk as u64;
        }

        self.seek(fd, pos.max(file.cursor))?;
        Ok(data)
    }

    /// Writes `data` at the cursor, growing the node first when the write runs
    /// past its last block, and advances the cursor.
    pub fn write<T: ImageStorage>(
        &mut self,
        fs: &mut Session<T>,
        fd: Fd,
        data: &[u8],
    ) -> Result<usize> {
        let file = self.get(fd)?;
        if data.is_empty() {
            return Ok(0);
        }
        let end = file.cursor.saturating_add(data.len() as u64);

        let mut blocks = fs.filestat(file.node)?.blocks;
        if end > blocks.len() as u64 * BLOCK_SIZE as u64 {
            fs.resize_node(file.node, end)?;
            blocks = fs.filestat(file.node)?.blocks;
        }

        let mut pos = file.cursor;
        let mut written = 0;
        while written < data.len() {
            let (index, within) = split(pos);
            let chunk = (BLOCK_SIZE - within).min(data.len() - written);
            fs.write_block(blocks[index], within, &data[written..written + chunk])?;
            written += chunk;
            pos += chunk as u64;
        }

        self.seek(fd, pos)?;
        debug!("wrote {} bytes to fd {}", written, fd);
        Ok(written)
    }
}

fn split(pos: u64) -> (usize, usize) {
    (
        (pos / BLOCK_SIZE as u64) as usize,
        (pos % BLOCK_SIZE as u64) as usize,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryImage;

    fn fixture() -> (Session<MemoryImage>, Descriptors) {
        let mut fs = Session::open(MemoryImage::new()).unwrap();
        fs.create("notes").unwrap();
        (fs, Descriptors::new())
    }

    #[test]
    fn handles_start_at_zero_and_are_reused() {
        let (mut fs, mut fds) = fixture();
        assert_eq!(fds.open(&mut fs, "notes").unwrap(), 0);
        assert_eq!(fds.open(&mut fs, "notes").unwrap(), 1);

        fds.close(0).unwrap();
        assert_eq!(fds.open(&mut fs, "notes").unwrap(), 0);
    }

    #[test]
    fn opening_missing_file_returns_error() {
        let (mut fs, mut fds) = fixture();
        match fds.open(&mut fs, "ghost") {
            Err(FsError::NotFound(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn unknown_descriptor_returns_error() {
        let (mut fs, mut fds) = fixture();
        match fds.close(3) {
            Err(FsError::BadDescriptor(3)) => (),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(fds.read(&mut fs, 3, 1).is_err());
    }

    #[test]
    fn write_grows_the_node_and_read_returns_the_bytes() {
        let (mut fs, mut fds) = fixture();
        let fd = fds.open(&mut fs, "notes").unwrap();

        assert_eq!(fds.write(&mut fs, fd, b"hello").unwrap(), 5);
        assert_eq!(fs.filestat(0).unwrap().blocks.len(), 1);
        assert_eq!(fds.get(fd).unwrap().cursor, 5);

        fds.seek(fd, 0).unwrap();
        assert_eq!(fds.read(&mut fs, fd, 5).unwrap(), b"hello");
        fs.check().unwrap();
    }

    #[test]
    fn writes_spanning_blocks_land_in_both() {
        let (mut fs, mut fds) = fixture();
        let fd = fds.open(&mut fs, "notes").unwrap();
        let data: Vec<u8> = (0..BLOCK_SIZE + 100).map(|i| (i % 251) as u8).collect();

        fds.seek(fd, 50).unwrap();
        fds.write(&mut fs, fd, &data).unwrap();
        assert_eq!(fs.filestat(0).unwrap().blocks.len(), 2);

        fds.seek(fd, 50).unwrap();
        assert_eq!(fds.read(&mut fs, fd, data.len()).unwrap(), data);
    }

    #[test]
    fn read_stops_at_the_last_block() {
        let (mut fs, mut fds) = fixture();
        fs.truncate("notes", 10).unwrap();
        let fd = fds.open(&mut fs, "notes").unwrap();

        fds.seek(fd, BLOCK_SIZE as u64 - 4).unwrap();
        assert_eq!(fds.read(&mut fs, fd, 100).unwrap().len(), 4);
        assert!(fds.read(&mut fs, fd, 100).unwrap().is_empty());
    }

    #[test]
    fn descriptors_of_linked_names_share_content() {
        let (mut fs, mut fds) = fixture();
        fs.link("notes", "alias").unwrap();
        let a = fds.open(&mut fs, "notes").unwrap();
        let b = fds.open(&mut fs, "alias").unwrap();

        fds.write(&mut fs, a, b"shared").unwrap();
        assert_eq!(fds.read(&mut fs, b, 6).unwrap(), b"shared");
    }
}
