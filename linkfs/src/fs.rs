use std::fs::OpenOptions;
use std::path::Path;

use crate::alloc::{Bitmap, State};
use crate::io::{FileImage, FileImageBuilder, ImageStorage};
use crate::layout::{
    block_offset, BITMAP_OFFSET, BITMAP_SIZE, BLOCK_SIZE, MAX_BLOCKS, MAX_BLOCKS_PER_NODE,
    MAX_LINKS, MAX_NODES,
};
use crate::links::{self, Links};
use crate::node::{self, NodeStat};

use log::{debug, info, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("file already exists: {0}")]
    AlreadyExists(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("filesystem limit exceeded: no free node")]
    NodeTableFull,
    #[error("filesystem limit exceeded: no free link slot")]
    LinkTableFull,
    #[error("no free blocks left on device")]
    OutOfSpace,
    #[error("image io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid argument: {0}")]
    PreconditionViolation(String),
    #[error("inconsistent image: {0}")]
    Corrupted(String),
    #[error("bad file descriptor: {0}")]
    BadDescriptor(u32),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Formats a blank image at `path`, destroying whatever the file held before.
pub fn mkfs<P: AsRef<Path>>(path: P) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path.as_ref())?;
    FileImageBuilder::from(file).build()?;
    info!("formatted image at {}", path.as_ref().display());
    Ok(())
}

/// A mounted image.
///
/// Holds the storage handle and the in-memory mirror of the block bitmap for
/// the lifetime of the mount. Link and node state is re-read from the image by
/// every operation; the bitmap mirror is persisted by every operation that
/// changes block ownership.
///
/// Two sessions over the same backing file are not detected and will corrupt
/// each other's view of the bitmap.
pub struct Session<T: ImageStorage> {
    dev: T,
    data_map: Bitmap,
}

impl Session<FileImage> {
    /// Opens the image file at `path` read/write and loads the bitmap.
    pub fn mount<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let dev = FileImageBuilder::from(file)
            // Don't reset the formatted image.
            .clear_medium(false)
            .build()?;
        let session = Session::open(dev)?;
        info!("mounted {}", path.as_ref().display());
        Ok(session)
    }
}

impl<T: ImageStorage> Session<T> {
    /// Attaches to an already formatted image.
    pub fn open(mut dev: T) -> Result<Self> {
        let mut buf = [0; BITMAP_SIZE];
        dev.read_at(BITMAP_OFFSET, &mut buf)?;
        let data_map = Bitmap::parse(&buf)?;
        debug!("loaded bitmap, {} blocks free", data_map.free_count());
        Ok(Session { dev, data_map })
    }

    /// Closes the image. Every mutation has already been written through, so
    /// this only flushes the handle and drops the bitmap mirror.
    pub fn umount(self) -> Result<T> {
        let mut dev = self.dev;
        dev.sync()?;
        info!("unmounted image");
        Ok(dev)
    }

    pub fn ls(&mut self) -> Result<Links> {
        links::list_links(&mut self.dev)
    }

    /// Decodes node record `id`. A free node reports no links and no blocks.
    pub fn filestat(&mut self, id: u16) -> Result<NodeStat> {
        node::read_node(&mut self.dev, id)
    }

    /// Creates a new file `name` backed by the lowest free node.
    pub fn create(&mut self, name: &str) -> Result<u16> {
        links::validate_name(name)?;
        let mut files = self.ls()?;
        if files.contains_key(name) {
            return Err(FsError::AlreadyExists(name.to_string()));
        }
        if files.len() >= MAX_LINKS {
            return Err(FsError::LinkTableFull);
        }

        let id = self.find_free_node()?;
        node::write_node(&mut self.dev, id, &NodeStat::linked_once())?;

        files.insert(name.to_string(), id);
        links::write_links(&mut self.dev, &files)?;
        debug!("created {:?} as node {}", name, id);
        Ok(id)
    }

    fn find_free_node(&mut self) -> Result<u16> {
        for id in 0..MAX_NODES as u16 {
            if self.filestat(id)?.is_free() {
                return Ok(id);
            }
        }
        Err(FsError::NodeTableFull)
    }

    /// Adds `new_name` as another link to the node behind `old_name`.
    ///
    /// An existing `new_name` is never replaced, the call fails with
    /// `AlreadyExists` and leaves the image untouched.
    pub fn link(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        links::validate_name(new_name)?;
        let mut files = self.ls()?;
        let id = *files
            .get(old_name)
            .ok_or_else(|| FsError::NotFound(old_name.to_string()))?;
        if files.contains_key(new_name) {
            return Err(FsError::AlreadyExists(new_name.to_string()));
        }
        if files.len() >= MAX_LINKS {
            return Err(FsError::LinkTableFull);
        }

        let mut node = self.filestat(id)?;
        node.active_links = node.active_links.checked_add(1).ok_or_else(|| {
            FsError::PreconditionViolation(format!("node {} has too many links", id))
        })?;

        files.insert(new_name.to_string(), id);
        links::write_links(&mut self.dev, &files)?;
        node::write_node(&mut self.dev, id, &node)?;
        debug!(
            "linked {:?} to node {} ({} links)",
            new_name, id, node.active_links
        );
        Ok(())
    }

    /// Removes the link `name`. Dropping the last link frees the node and
    /// returns its blocks to the allocator.
    pub fn unlink(&mut self, name: &str) -> Result<()> {
        let mut files = self.ls()?;
        let id = files
            .remove(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        let mut node = self.filestat(id)?;
        if node.is_free() {
            return Err(FsError::Corrupted(format!(
                "link {:?} refers to free node {}",
                name, id
            )));
        }

        links::write_links(&mut self.dev, &files)?;

        node.active_links -= 1;
        if node.is_free() {
            for &block in node.blocks.iter() {
                self.data_map.set_free(block);
            }
            self.save_bitmap()?;
            debug!("node {} released {} blocks", id, node.blocks.len());
            node.blocks.clear();
        }
        node::write_node(&mut self.dev, id, &node)?;
        debug!("unlinked {:?} from node {}", name, id);
        Ok(())
    }

    /// Resizes the file `name` to hold `size` bytes, in whole blocks.
    pub fn truncate(&mut self, name: &str, size: u64) -> Result<()> {
        let id = *self
            .ls()?
            .get(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        self.resize_node(id, size)
    }

    /// Grows or shrinks the block list of node `id` to `ceil(size / BLOCK_SIZE)`
    /// blocks.
    ///
    /// Shrinking frees blocks from the tail of the list. Growing appends the
    /// lowest free blocks. When the pool runs dry midway the blocks appended so
    /// far are kept and persisted before `OutOfSpace` is returned.
    pub fn resize_node(&mut self, id: u16, size: u64) -> Result<()> {
        let target = blocks_for(size)?;
        let mut node = self.filestat(id)?;
        if node.is_free() {
            return Err(FsError::PreconditionViolation(format!(
                "node {} is not in use",
                id
            )));
        }
        if target == node.blocks.len() {
            return Ok(());
        }

        let before = node.blocks.len();
        while target < node.blocks.len() {
            if let Some(block) = node.blocks.pop() {
                self.data_map.set_free(block);
            }
        }

        let mut outcome = Ok(());
        while target > node.blocks.len() {
            match self.data_map.allocate() {
                Ok(block) => node.blocks.push(block),
                Err(err) => {
                    warn!(
                        "node {} grew to {} of {} blocks before running out of space",
                        id,
                        node.blocks.len(),
                        target
                    );
                    outcome = Err(err);
                    break;
                }
            }
        }

        self.save_bitmap()?;
        node::write_node(&mut self.dev, id, &node)?;
        debug!(
            "node {} resized from {} to {} blocks",
            id,
            before,
            node.blocks.len()
        );
        outcome
    }

    /// Reads bytes of data block `block`, starting `within` bytes into it.
    pub fn read_block(&mut self, block: u16, within: usize, buf: &mut [u8]) -> Result<()> {
        check_block_access(block, within, buf.len())?;
        self.dev.read_at(block_offset(block, within), buf)?;
        Ok(())
    }

    /// Overwrites bytes of data block `block`, starting `within` bytes into it.
    pub fn write_block(&mut self, block: u16, within: usize, buf: &[u8]) -> Result<()> {
        check_block_access(block, within, buf.len())?;
        self.dev.write_at(block_offset(block, within), buf)?;
        Ok(())
    }

    /// Verifies that the link table, the node table and the bitmap agree.
    ///
    /// Every link must point at an active node, each node's link count must
    /// equal the number of links naming it, and a block is busy iff exactly
    /// one active node lists it.
    pub fn check(&mut self) -> Result<()> {
        let files = self.ls()?;
        let mut expected_links = vec![0_u32; MAX_NODES];
        for &id in files.values() {
            expected_links[id as usize] += 1;
        }

        let mut owner: Vec<Option<u16>> = vec![None; MAX_BLOCKS];
        for id in 0..MAX_NODES as u16 {
            let node = self.filestat(id)?;
            if node.active_links as u32 != expected_links[id as usize] {
                return Err(FsError::Corrupted(format!(
                    "node {} counts {} links, link table names it {} times",
                    id, node.active_links, expected_links[id as usize]
                )));
            }
            for &block in node.blocks.iter() {
                let slot = owner.get_mut(block as usize).ok_or_else(|| {
                    FsError::Corrupted(format!("node {} lists block {} out of range", id, block))
                })?;
                if let Some(other) = slot.replace(id) {
                    return Err(FsError::Corrupted(format!(
                        "block {} is listed by nodes {} and {}",
                        block, other, id
                    )));
                }
            }
        }

        for (block, owned_by) in owner.iter().enumerate() {
            let busy = self.data_map.get(block as u16) == State::Used;
            if busy != owned_by.is_some() {
                return Err(FsError::Corrupted(format!(
                    "block {} is {} in the bitmap but {}",
                    block,
                    if busy { "busy" } else { "free" },
                    if owned_by.is_some() { "owned" } else { "unowned" }
                )));
            }
        }
        Ok(())
    }

    /// Number of data blocks not owned by any node.
    pub fn free_blocks(&self) -> usize {
        self.data_map.free_count()
    }

    fn save_bitmap(&mut self) -> Result<()> {
        self.dev
            .write_at(BITMAP_OFFSET, self.data_map.serialize())?;
        Ok(())
    }
}

fn blocks_for(size: u64) -> Result<usize> {
    let block_size = BLOCK_SIZE as u64;
    let count = size / block_size + u64::from(size % block_size != 0);
    if count > MAX_BLOCKS_PER_NODE as u64 {
        return Err(FsError::PreconditionViolation(format!(
            "{} bytes need {} blocks, a node holds at most {}",
            size, count, MAX_BLOCKS_PER_NODE
        )));
    }
    Ok(count as usize)
}

fn check_block_access(block: u16, within: usize, len: usize) -> Result<()> {
    if block as usize >= MAX_BLOCKS || within > BLOCK_SIZE || len > BLOCK_SIZE - within {
        return Err(FsError::PreconditionViolation(format!(
            "access of {} bytes at {} in block {} leaves the block",
            len, within, block
        )));
    }
    Ok(())
}
