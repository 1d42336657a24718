use crate::fs::{FsError, Result};
use crate::io::ImageStorage;
use crate::layout::{node_offset, MAX_BLOCKS, MAX_BLOCKS_PER_NODE, MAX_NODES, NODE_RECORD_SIZE};

use log::trace;
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

type Word = U16<LittleEndian>;

/// On-disk node record: a sequence of little endian 16-bit words.
///
/// This structure __must be exactly `NODE_RECORD_SIZE` bytes.__
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
struct RawNode {
    /// The number of links to this node. Zero means the slot is free.
    active_links: Word,
    /// How many entries of `blocks` are meaningful.
    block_count: Word,
    /// Ids of the data blocks backing the node, in content order. Entries past
    /// `block_count` are zeroed on write and ignored on read.
    blocks: [Word; MAX_BLOCKS_PER_NODE],
}

const _: () = assert!(std::mem::size_of::<RawNode>() == NODE_RECORD_SIZE);

/// Decoded node record as handed out by `filestat`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStat {
    pub active_links: u16,
    pub blocks: Vec<u16>,
}

impl NodeStat {
    /// A freshly allocated node with a single link and no content.
    pub fn linked_once() -> Self {
        Self {
            active_links: 1,
            blocks: Vec::new(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.active_links == 0
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let raw = LayoutVerified::<_, RawNode>::new(buf).ok_or_else(|| {
            FsError::PreconditionViolation(format!(
                "node record must be {} bytes, got {}",
                NODE_RECORD_SIZE,
                buf.len()
            ))
        })?;

        let active_links = raw.active_links.get();
        if active_links == 0 {
            // Whatever a free record still lists is not owned by anyone.
            return Ok(Self::default());
        }

        let count = raw.block_count.get() as usize;
        if count > MAX_BLOCKS_PER_NODE {
            return Err(FsError::Corrupted(format!(
                "node lists {} blocks, record holds at most {}",
                count, MAX_BLOCKS_PER_NODE
            )));
        }

        let blocks: Vec<u16> = raw.blocks[..count].iter().map(|block| block.get()).collect();
        if let Some(&block) = blocks.iter().find(|&&block| block as usize >= MAX_BLOCKS) {
            return Err(FsError::Corrupted(format!(
                "node lists block {} outside the pool of {}",
                block, MAX_BLOCKS
            )));
        }

        Ok(Self {
            active_links,
            blocks,
        })
    }

    fn encode(&self) -> Result<RawNode> {
        if self.blocks.len() > MAX_BLOCKS_PER_NODE {
            return Err(FsError::PreconditionViolation(format!(
                "node can hold at most {} blocks, got {}",
                MAX_BLOCKS_PER_NODE,
                self.blocks.len()
            )));
        }

        let mut raw = RawNode::new_zeroed();
        raw.active_links.set(self.active_links);
        raw.block_count.set(self.blocks.len() as u16);
        for (slot, &block) in raw.blocks.iter_mut().zip(self.blocks.iter()) {
            slot.set(block);
        }
        Ok(raw)
    }
}

fn check_id(id: u16) -> Result<()> {
    if id as usize >= MAX_NODES {
        return Err(FsError::PreconditionViolation(format!(
            "node id {} out of range 0..{}",
            id, MAX_NODES
        )));
    }
    Ok(())
}

/// Reads and decodes node record `id`.
pub fn read_node<T: ImageStorage>(dev: &mut T, id: u16) -> Result<NodeStat> {
    check_id(id)?;
    let mut buf = [0; NODE_RECORD_SIZE];
    dev.read_at(node_offset(id), &mut buf)?;
    trace!("read node {}", id);
    NodeStat::decode(&buf)
}

/// Encodes and writes node record `id`, zeroing the unused tail of the record.
pub fn write_node<T: ImageStorage>(dev: &mut T, id: u16, node: &NodeStat) -> Result<()> {
    check_id(id)?;
    let raw = node.encode()?;
    dev.write_at(node_offset(id), raw.as_bytes())?;
    trace!(
        "wrote node {} (links: {}, blocks: {})",
        id,
        node.active_links,
        node.blocks.len()
    );
    Ok(())
}
