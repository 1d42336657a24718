//! A tiny filesystem kept in a single image file.
//!
//! The image holds a flat link table mapping filenames to nodes, a fixed table
//! of nodes (link count plus the list of data blocks backing the file), a block
//! bitmap and the block pool itself. See [`layout`] for the exact geometry.
//!
//! ```no_run
//! use linkfs::{mkfs, Session};
//!
//! mkfs("disk.img")?;
//! let mut fs = Session::mount("disk.img")?;
//! fs.create("hello")?;
//! fs.truncate("hello", 5000)?;
//! fs.umount()?;
//! # Ok::<(), linkfs::FsError>(())
//! ```
mod alloc;
mod fs;
pub mod handle;
pub mod io;
pub mod layout;
mod links;
mod node;

pub use crate::alloc::{Bitmap, State};
pub use crate::fs::{mkfs, FsError, Result, Session};
pub use crate::handle::{Descriptors, Fd, OpenFile};
pub use crate::links::Links;
pub use crate::node::NodeStat;
