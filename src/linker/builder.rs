use std::path::PathBuf;

use indexmap::IndexSet;

use crate::{
    diagnostics::{DEFAULT_MAX_REFS_PER_SYMBOL, DEFAULT_MAX_UNRESOLVED_REPORTS},
    layout::LayoutParams,
    libsearch::{LibraryFind, LibrarySearcher},
    pathed_item::PathedItem,
};

use super::{ConfiguredLinker, LinkImpl, LinkerTargetArch};

/// Sets up inputs and configures a [`ConfiguredLinker`].
pub struct LinkerBuilder<L: LibraryFind + 'static> {
    /// The target architecture.
    pub(super) target_arch: Option<LinkerTargetArch>,

    /// The input files to link.
    pub(super) inputs: Vec<PathedItem<PathBuf, Vec<u8>>>,

    /// Link libraries.
    pub(super) libraries: IndexSet<String>,

    /// The name of the entrypoint symbol.
    pub(super) entrypoint: Option<String>,

    /// Symbols kept live regardless of reachability.
    pub(super) include_symbols: IndexSet<String>,

    /// Alternate name substitutions, `from` falling back to `to`.
    pub(super) alternate_names: Vec<(String, String)>,

    /// Output section merges, `from` into `to`.
    pub(super) merges: Vec<(String, String)>,

    /// Whether unreferenced COMDAT sections are discarded.
    pub(super) dead_strip: bool,

    /// Virtual and file layout parameters.
    pub(super) layout: LayoutParams,

    /// Cap on reported unresolved symbols.
    pub(super) max_unresolved_reports: usize,

    /// Cap on reported references per unresolved symbol.
    pub(super) max_refs_per_symbol: usize,

    /// Searcher for finding link libraries.
    pub(super) library_searcher: Option<L>,
}

impl<L: LibraryFind + 'static> Default for LinkerBuilder<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: LibraryFind + 'static> LinkerBuilder<L> {
    /// Creates a new [`LinkerBuilder`] with the defaults.
    pub fn new() -> Self {
        Self {
            target_arch: None,
            inputs: Vec::new(),
            libraries: IndexSet::new(),
            entrypoint: None,
            include_symbols: IndexSet::new(),
            alternate_names: Vec::new(),
            merges: Vec::new(),
            dead_strip: true,
            layout: LayoutParams::default(),
            max_unresolved_reports: DEFAULT_MAX_UNRESOLVED_REPORTS,
            max_refs_per_symbol: DEFAULT_MAX_REFS_PER_SYMBOL,
            library_searcher: None,
        }
    }

    /// Sets the target architecture for the linker.
    ///
    /// This is not needed if the linker can parse the target architecture
    /// from the input files.
    pub fn architecture(mut self, arch: LinkerTargetArch) -> Self {
        self.target_arch = Some(arch);
        self
    }

    /// Sets the entrypoint symbol name.
    pub fn entrypoint(mut self, name: impl Into<String>) -> Self {
        self.entrypoint = Some(name.into());
        self
    }

    /// Keeps a symbol's section live regardless of reachability.
    pub fn include_symbol(mut self, name: impl Into<String>) -> Self {
        self.include_symbols.insert(name.into());
        self
    }

    /// Registers an alternate name: an unresolved `from` falls back to
    /// `to` after library resolution settles.
    pub fn alternate_name(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.alternate_names.push((from.into(), to.into()));
        self
    }

    /// Merges the output section `from` into `to`.
    pub fn merge_section(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.merges.push((from.into(), to.into()));
        self
    }

    /// Enables or disables discarding unreferenced COMDAT sections.
    pub fn dead_strip(mut self, val: bool) -> Self {
        self.dead_strip = val;
        self
    }

    /// Sets the image base address.
    pub fn image_base(mut self, base: u64) -> Self {
        self.layout.image_base = base;
        self
    }

    /// Sets the section and file alignment.
    pub fn alignment(mut self, section_align: u32, file_align: u32) -> Self {
        self.layout.section_align = section_align;
        self.layout.file_align = file_align;
        self
    }

    /// Sets the caps on unresolved symbol reporting.
    pub fn unresolved_report_limits(mut self, symbols: usize, refs_per_symbol: usize) -> Self {
        self.max_unresolved_reports = symbols;
        self.max_refs_per_symbol = refs_per_symbol;
        self
    }

    /// Set the library searcher to use for finding link libraries.
    pub fn library_searcher(mut self, searcher: L) -> Self {
        self.library_searcher = Some(searcher);
        self
    }

    /// Add an input file to the linker.
    pub fn add_input(mut self, input: PathedItem<PathBuf, Vec<u8>>) -> Self {
        self.inputs.push(input);
        self
    }

    /// Add a set of input files to the linker.
    pub fn add_inputs(
        mut self,
        inputs: impl IntoIterator<Item = PathedItem<PathBuf, Vec<u8>>>,
    ) -> Self {
        self.inputs.extend(inputs);
        self
    }

    /// Add a link library to the linker.
    pub fn add_library(mut self, name: impl Into<String>) -> Self {
        self.libraries.insert(name.into());
        self
    }

    /// Add a set of link libraries to the linker.
    pub fn add_libraries<S: Into<String>, I: IntoIterator<Item = S>>(mut self, names: I) -> Self {
        self.libraries.extend(names.into_iter().map(Into::into));
        self
    }

    /// Finishes configuring the linker.
    pub fn build(mut self) -> Box<dyn LinkImpl> {
        if let Some(library_searcher) = self.library_searcher.take() {
            Box::new(ConfiguredLinker::with_opts(self, library_searcher))
        } else {
            Box::new(ConfiguredLinker::with_opts(self, LibrarySearcher::new()))
        }
    }
}
