use indexmap::IndexMap;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use object::pe::{IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_I386};

use error::LinkError;

mod builder;
mod configured;
pub mod error;

pub use self::configured::*;
pub use builder::*;

pub trait LinkImpl {
    fn link(&mut self) -> Result<LinkedImage, LinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum LinkerTargetArch {
    Amd64 = IMAGE_FILE_MACHINE_AMD64,
    I386 = IMAGE_FILE_MACHINE_I386,
}

/// A finalized output section, for collaborators that build the image
/// headers around the linked buffer.
#[derive(Debug, Clone)]
pub struct ImageSection {
    pub name: String,
    pub characteristics: u32,
    pub virtual_address: u64,
    pub virtual_size: u64,
    pub file_offset: u64,
    pub file_size: u64,

    /// 1-based output section index.
    pub index: usize,
}

/// The result of a successful link.
pub struct LinkedImage {
    /// The raw section contents, laid out at their file offsets.
    pub image: Vec<u8>,

    /// The finalized output section table.
    pub sections: Vec<ImageSection>,

    /// Resolved external symbol name to virtual address map.
    pub symbols: IndexMap<String, u64>,
}
