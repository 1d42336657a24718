use crate::fs::{FsError, Result};
use crate::io::ImageStorage;
use crate::layout::{
    FILENAME_SIZE, LINK_SLOT_SIZE, LINK_TABLE_OFFSET, LINK_TABLE_SIZE, MAX_LINKS, MAX_NODES,
};

use log::trace;
use std::collections::BTreeMap;
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

/// Name to node id mapping as stored in the link table.
pub type Links = BTreeMap<String, u16>;

#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
struct RawLink {
    /// Zero padded filename. A zero first byte marks the slot as unused.
    name: [u8; FILENAME_SIZE],
    node: U16<LittleEndian>,
}

const _: () = assert!(std::mem::size_of::<RawLink>() == LINK_SLOT_SIZE);

/// Checks that `name` can be stored in a link slot without truncation and
/// without being mistaken for an empty slot.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FsError::PreconditionViolation(
            "filename must not be empty".to_string(),
        ));
    }
    if name.len() > FILENAME_SIZE {
        return Err(FsError::PreconditionViolation(format!(
            "filename is {} bytes, at most {} allowed",
            name.len(),
            FILENAME_SIZE
        )));
    }
    if name.as_bytes().contains(&0) {
        return Err(FsError::PreconditionViolation(
            "filename must not contain NUL bytes".to_string(),
        ));
    }
    Ok(())
}

fn decode_slot(slot: &RawLink) -> Result<Option<(String, u16)>> {
    if slot.name[0] == 0 {
        return Ok(None);
    }

    let len = slot
        .name
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(FILENAME_SIZE);
    let name = String::from_utf8(slot.name[..len].to_vec())
        .map_err(|_| FsError::Corrupted("filename is not valid UTF-8".to_string()))?;

    let node = slot.node.get();
    if node as usize >= MAX_NODES {
        return Err(FsError::Corrupted(format!(
            "link {:?} refers to node {} out of range",
            name, node
        )));
    }
    Ok(Some((name, node)))
}

/// Reads the whole link table and decodes every slot in use.
pub fn list_links<T: ImageStorage>(dev: &mut T) -> Result<Links> {
    let mut buf = vec![0; LINK_TABLE_SIZE];
    dev.read_at(LINK_TABLE_OFFSET, &mut buf)?;

    let mut links = Links::new();
    for chunk in buf.chunks_exact(LINK_SLOT_SIZE) {
        // Chunks are exactly one slot wide and the slot has no alignment needs.
        let slot = match LayoutVerified::<_, RawLink>::new(chunk) {
            Some(slot) => slot,
            None => continue,
        };
        if let Some((name, node)) = decode_slot(&slot)? {
            if links.insert(name.clone(), node).is_some() {
                return Err(FsError::Corrupted(format!(
                    "filename {:?} appears twice in the link table",
                    name
                )));
            }
        }
    }
    trace!("read {} links", links.len());
    Ok(links)
}

/// Rewrites the entire link table from `links`.
///
/// Entries land in successive slots from slot 0 in name order, every slot
/// after the last entry is zeroed.
pub fn write_links<T: ImageStorage>(dev: &mut T, links: &Links) -> Result<()> {
    if links.len() > MAX_LINKS {
        return Err(FsError::LinkTableFull);
    }
    for name in links.keys() {
        validate_name(name)?;
    }

    let mut buf = vec![0; LINK_TABLE_SIZE];
    for ((name, &node), chunk) in links.iter().zip(buf.chunks_exact_mut(LINK_SLOT_SIZE)) {
        let mut slot = RawLink::new_zeroed();
        slot.name[..name.len()].copy_from_slice(name.as_bytes());
        slot.node.set(node);
        chunk.copy_from_slice(slot.as_bytes());
    }

    dev.write_at(LINK_TABLE_OFFSET, &buf)?;
    trace!("wrote {} links", links.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryImage;

    fn links(entries: &[(&str, u16)]) -> Links {
        entries
            .iter()
            .map(|&(name, node)| (name.to_string(), node))
            .collect()
    }

    #[test]
    fn blank_table_has_no_links() {
        let mut dev = MemoryImage::new();
        assert!(list_links(&mut dev).unwrap().is_empty());
    }

    #[test]
    fn can_write_and_list_links() {
        let mut dev = MemoryImage::new();
        let table = links(&[("b", 1), ("a", 0), ("passwords.txt", 1023)]);

        write_links(&mut dev, &table).unwrap();

        assert_eq!(list_links(&mut dev).unwrap(), table);
    }

    #[test]
    fn slots_are_packed_from_the_start_in_name_order() {
        let mut dev = MemoryImage::new();
        write_links(&mut dev, &links(&[("zed", 2), ("abc", 0x0102)])).unwrap();

        let bytes = dev.as_bytes();
        assert_eq!(&bytes[0..4], b"abc\0");
        assert_eq!(&bytes[FILENAME_SIZE..LINK_SLOT_SIZE], &[0x02, 0x01]);
        assert_eq!(&bytes[LINK_SLOT_SIZE..LINK_SLOT_SIZE + 3], b"zed");
        assert!(bytes[2 * LINK_SLOT_SIZE..LINK_TABLE_SIZE]
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn rewriting_a_smaller_table_clears_old_slots() {
        let mut dev = MemoryImage::new();
        write_links(&mut dev, &links(&[("a", 0), ("b", 1), ("c", 2)])).unwrap();
        write_links(&mut dev, &links(&[("c", 2)])).unwrap();

        assert_eq!(list_links(&mut dev).unwrap(), links(&[("c", 2)]));
    }

    #[test]
    fn name_filling_the_whole_field_round_trips() {
        let mut dev = MemoryImage::new();
        let long = "x".repeat(FILENAME_SIZE);
        write_links(&mut dev, &links(&[(long.as_str(), 4)])).unwrap();

        assert_eq!(list_links(&mut dev).unwrap().get(&long), Some(&4));
    }

    #[test]
    fn invalid_names_are_rejected() {
        let too_long = "x".repeat(FILENAME_SIZE + 1);
        for name in &["", "a\0b", too_long.as_str()] {
            match validate_name(name) {
                Err(FsError::PreconditionViolation(_)) => (),
                other => panic!("unexpected result {:?} for {:?}", other, name),
            }
        }
        assert!(validate_name("ok").is_ok());
    }

    #[test]
    fn table_with_more_entries_than_slots_is_rejected() {
        let mut dev = MemoryImage::new();
        let table: Links = (0..=MAX_LINKS).map(|i| (format!("f{}", i), 0)).collect();

        match write_links(&mut dev, &table) {
            Err(FsError::LinkTableFull) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn link_to_node_out_of_range_is_reported_as_corruption() {
        let mut dev = MemoryImage::new();
        let mut slot = [0u8; LINK_SLOT_SIZE];
        slot[0] = b'a';
        slot[FILENAME_SIZE..].copy_from_slice(&(MAX_NODES as u16).to_le_bytes());
        dev.write_at(0, &slot).unwrap();

        match list_links(&mut dev) {
            Err(FsError::Corrupted(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
