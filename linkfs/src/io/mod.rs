mod image;
mod memory;

pub use image::{FileImage, FileImageBuilder, ImageStorage};
pub use memory::MemoryImage;
