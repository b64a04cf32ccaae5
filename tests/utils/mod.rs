pub mod searcher;

use pelink::{
    linker::{LinkImpl, LinkedImage, LinkerBuilder, LinkerTargetArch, error::LinkError},
    pathed_item::PathedItem,
};

use self::searcher::MemoryArchiveSearcher;

/// Configures a linker over in-memory objects and libraries.
pub struct LinkFixture {
    builder: Option<LinkerBuilder<MemoryArchiveSearcher>>,
    searcher: MemoryArchiveSearcher,
    input_count: usize,
}

impl LinkFixture {
    pub fn new(arch: LinkerTargetArch) -> LinkFixture {
        Self {
            builder: Some(LinkerBuilder::new().architecture(arch)),
            searcher: MemoryArchiveSearcher::new(),
            input_count: 0,
        }
    }

    pub fn object(mut self, data: Vec<u8>) -> LinkFixture {
        self.input_count += 1;
        let name = format!("file{}.obj", self.input_count);
        self.with(|builder| builder.add_input(PathedItem::new(name.into(), data)))
    }

    pub fn library(mut self, name: &str, data: Vec<u8>) -> LinkFixture {
        self.searcher.add_library(name, data);
        self.with(|builder| builder.add_library(name))
    }

    pub fn configure(
        self,
        f: impl FnOnce(LinkerBuilder<MemoryArchiveSearcher>) -> LinkerBuilder<MemoryArchiveSearcher>,
    ) -> LinkFixture {
        self.with(f)
    }

    fn with(
        mut self,
        f: impl FnOnce(LinkerBuilder<MemoryArchiveSearcher>) -> LinkerBuilder<MemoryArchiveSearcher>,
    ) -> LinkFixture {
        self.builder = self.builder.take().map(f);
        self
    }

    pub fn link(self) -> Result<LinkedImage, LinkError> {
        let builder = self
            .builder
            .expect("builder taken")
            .library_searcher(self.searcher);
        builder.build().link()
    }

    pub fn link_ok(self) -> LinkedImage {
        self.link().expect("link failed")
    }

    pub fn link_err(self) -> LinkError {
        match self.link() {
            Ok(_) => panic!("link unexpectedly succeeded"),
            Err(e) => e,
        }
    }
}

/// Returns the virtual address of a linked symbol.
pub fn symbol_va(image: &LinkedImage, name: &str) -> u64 {
    *image
        .symbols
        .get(name)
        .unwrap_or_else(|| panic!("symbol {name} missing from link output"))
}

/// Returns the bytes of a named output section, without the trailing
/// file alignment padding.
pub fn section_bytes<'a>(image: &'a LinkedImage, name: &str) -> &'a [u8] {
    let section = image
        .sections
        .iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("section {name} missing from link output"));

    let len = section.virtual_size.min(section.file_size);
    &image.image[section.file_offset as usize..(section.file_offset + len) as usize]
}
