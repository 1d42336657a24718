use crate::fs::{FsError, Result};
use crate::layout::{BLOCK_SIZE, IMAGE_SIZE};

use log::trace;
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};

/// Byte addressed access to a formatted image.
///
/// Modeled after a block device interface, but regions of the image are not
/// block aligned, so every access carries an absolute byte offset instead of a
/// block number.
pub trait ImageStorage {
    /// Fills `buf` with the bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Reading past the end of the image returns an error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()>;
    /// Writes all of `buf` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Writing past the end of the image returns an error, the image never grows.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()>;
    /// Flush any buffered IO from memory. This is useful if it must guaranteed
    /// the writes actually occurred, for instance, if being re-read from disk.
    fn sync(&mut self) -> std::io::Result<()>;
}

pub(crate) fn check_range(offset: u64, len: usize) -> std::io::Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= IMAGE_SIZE => Ok(()),
        _ => Err(std::io::Error::new(
            ErrorKind::InvalidInput,
            format!("access of {} bytes at {} is outside the image", len, offset),
        )),
    }
}

/// Image kept in a regular file of exactly `IMAGE_SIZE` bytes.
pub struct FileImage {
    fd: File,
}

impl FileImage {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }
}

impl ImageStorage for FileImage {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        check_range(offset, buf.len())?;
        trace!("read {} bytes at {}", buf.len(), offset);
        self.fd.seek(SeekFrom::Start(offset))?;
        self.fd.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        check_range(offset, buf.len())?;
        trace!("write {} bytes at {}", buf.len(), offset);
        self.fd.seek(SeekFrom::Start(offset))?;
        self.fd.write_all(buf)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()
    }
}

pub struct FileImageBuilder {
    fd: File,
    clear_medium: bool,
}

impl From<File> for FileImageBuilder {
    fn from(fd: File) -> Self {
        FileImageBuilder {
            fd,
            clear_medium: true,
        }
    }
}

impl FileImageBuilder {
    /// Whether to wipe the file into a blank image. Defaults to true; turn it
    /// off to attach to an image that was already formatted.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear_medium = clear;
        self
    }

    /// This builder assumes ownership of the file descriptor and, unless told
    /// otherwise, does destructive things to prepare the file for use.
    ///
    /// # Errors
    ///
    /// When attaching to an existing image, a file whose length differs from
    /// `IMAGE_SIZE` is rejected as corrupted.
    pub fn build(mut self) -> Result<FileImage> {
        if self.clear_medium {
            self.zero_image()?;
        } else {
            let len = self.fd.metadata()?.len();
            if len != IMAGE_SIZE {
                return Err(FsError::Corrupted(format!(
                    "image is {} bytes, expected {}",
                    len, IMAGE_SIZE
                )));
            }
        }
        Ok(FileImage { fd: self.fd })
    }

    fn zero_image(&mut self) -> std::io::Result<()> {
        self.fd.set_len(0)?;
        self.fd.seek(SeekFrom::Start(0))?;
        let zeros = [0x00; BLOCK_SIZE];
        let mut remaining = IMAGE_SIZE;
        {
            // Buffer each write to prevent excessive syscalls.
            let mut bfd = BufWriter::new(&self.fd);
            while remaining > 0 {
                let chunk = remaining.min(BLOCK_SIZE as u64) as usize;
                bfd.write_all(&zeros[..chunk])?;
                remaining -= chunk as u64;
            }
            bfd.flush()?;
        }
        self.fd.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BLOCK_POOL_OFFSET;

    fn blank_image() -> FileImage {
        let tf = tempfile::tempfile().unwrap();
        FileImageBuilder::from(tf)
            .build()
            .expect("failed to prepare image")
    }

    #[test]
    fn builder_allocates_exact_image_size() {
        let image = blank_image();
        assert_eq!(image.into_file().metadata().unwrap().len(), IMAGE_SIZE);
    }

    #[test]
    fn can_read_and_write_at_offsets() {
        let mut image = blank_image();

        image.write_at(BLOCK_POOL_OFFSET + 3, &[0x55; 10]).unwrap();
        image.sync().unwrap();

        let mut buf = [0x00; 12];
        image.read_at(BLOCK_POOL_OFFSET + 2, &mut buf).unwrap();
        assert_eq!(buf[0], 0);
        assert_eq!(&buf[1..11], &[0x55; 10]);
        assert_eq!(buf[11], 0);
    }

    #[test]
    fn can_read_and_write_last_byte() {
        let mut image = blank_image();
        image.write_at(IMAGE_SIZE - 1, &[0xaa]).unwrap();

        let mut buf = [0; 1];
        image.read_at(IMAGE_SIZE - 1, &mut buf).unwrap();
        assert_eq!(buf, [0xaa]);
    }

    #[test]
    fn access_beyond_image_returns_error() {
        let mut image = blank_image();

        assert!(image.write_at(IMAGE_SIZE - 1, &[0x55; 2]).is_err());
        assert!(image.read_at(IMAGE_SIZE, &mut [0; 1]).is_err());
        assert_eq!(image.into_file().metadata().unwrap().len(), IMAGE_SIZE);
    }

    #[test]
    fn attaching_to_unformatted_file_returns_error() {
        let tf = tempfile::tempfile().unwrap();
        let result = FileImageBuilder::from(tf).clear_medium(false).build();
        match result {
            Err(FsError::Corrupted(_)) => (),
            _ => panic!("expected an error for an empty file"),
        }
    }

    #[test]
    fn clearing_wipes_previous_content() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let mut image = FileImageBuilder::from(disk.reopen().unwrap()).build().unwrap();
        image.write_at(0, &[0x55; 4]).unwrap();
        image.sync().unwrap();

        let mut image = FileImageBuilder::from(disk.reopen().unwrap()).build().unwrap();
        let mut buf = [0xff; 4];
        image.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
    }
}
