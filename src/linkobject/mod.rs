pub mod archive;
pub mod coff;
