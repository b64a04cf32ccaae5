pub mod baserel;
pub mod comdat;
pub mod commons;
pub mod diagnostics;
pub mod gc;
pub mod image;
pub mod layout;
pub mod libsearch;
pub mod linker;
pub mod linkobject;
pub mod patch;
pub mod pathed_item;
pub mod resolve;
pub mod sectab;
pub mod symtab;
