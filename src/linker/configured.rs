use std::path::PathBuf;

use indexmap::IndexSet;
use log::debug;
use typed_arena::Arena;

use crate::{
    baserel,
    comdat::fold_comdats,
    commons::pack_commons,
    diagnostics::{Diagnostics, LinkDiagnostic},
    gc::{Liveness, run_sweep},
    image::{apply_relocs, build_image},
    layout::{Layout, LayoutParams},
    libsearch::{FoundLibrary, LibraryFind},
    linkobject::{archive::LinkArchive, coff::LinkObject},
    patch::{PatchContext, exported_symbols, patch_symbols},
    pathed_item::PathedItem,
    resolve::{check_machine, report_unresolved, resolve_libraries},
    sectab::SectionTable,
    symtab::{InputObject, Resolution, SymbolId, SymbolTable},
};

use super::{
    ImageSection, LinkImpl, LinkedImage, LinkerBuilder, LinkerTargetArch,
    error::{LinkError, LinkerSetupError, LinkerSetupErrors, LinkerSetupPathError},
};

/// A configured linker.
pub struct ConfiguredLinker<L: LibraryFind> {
    /// The target architecture.
    target_arch: Option<LinkerTargetArch>,

    /// The unparsed linker inputs.
    inputs: Vec<PathedItem<PathBuf, Vec<u8>>>,

    /// The names of the link libraries.
    library_names: IndexSet<String>,

    /// The link library searcher.
    library_searcher: L,

    /// The name of the entrypoint symbol.
    entrypoint: Option<String>,

    /// Symbols kept live regardless of reachability.
    include_symbols: IndexSet<String>,

    /// Alternate name substitutions.
    alternate_names: Vec<(String, String)>,

    /// Output section merges.
    merges: Vec<(String, String)>,

    /// Whether unreferenced COMDAT sections are discarded.
    dead_strip: bool,

    /// Virtual and file layout parameters.
    layout: LayoutParams,

    max_unresolved_reports: usize,
    max_refs_per_symbol: usize,
}

impl<L: LibraryFind> ConfiguredLinker<L> {
    /// Returns a [`LinkerBuilder`] for configuring a linker.
    pub fn builder() -> LinkerBuilder<L> {
        LinkerBuilder::new()
    }

    pub(super) fn with_opts<T: LibraryFind>(
        builder: LinkerBuilder<T>,
        library_searcher: L,
    ) -> ConfiguredLinker<L> {
        Self {
            target_arch: builder.target_arch,
            inputs: builder.inputs,
            library_names: builder.libraries,
            library_searcher,
            entrypoint: builder.entrypoint,
            include_symbols: builder.include_symbols,
            alternate_names: builder.alternate_names,
            merges: builder.merges,
            dead_strip: builder.dead_strip,
            layout: builder.layout,
            max_unresolved_reports: builder.max_unresolved_reports,
            max_refs_per_symbol: builder.max_refs_per_symbol,
        }
    }
}

impl<L: LibraryFind> LinkImpl for ConfiguredLinker<L> {
    fn link(&mut self) -> Result<LinkedImage, LinkError> {
        if self.inputs.is_empty() {
            return Err(LinkError::NoInput);
        }

        let mut setup_errors = Vec::new();

        // Holds libraries opened through the searcher so parsed views
        // can borrow for the rest of the link.
        let library_arena: Arena<FoundLibrary> = Arena::with_capacity(self.library_names.len());

        let mut archives: Vec<PathedItem<PathBuf, LinkArchive<'_>>> = Vec::new();
        let mut objects: Vec<InputObject<'_>> = Vec::new();

        // Parse the command line input files.
        for input in &self.inputs {
            let is_archive = input
                .get(..object::archive::MAGIC.len())
                .is_some_and(|magic| magic == object::archive::MAGIC);

            if is_archive {
                match LinkArchive::parse(input.as_slice()) {
                    Ok(parsed) => {
                        archives.push(PathedItem::new(input.path().clone(), parsed));
                    }
                    Err(e) => {
                        setup_errors.push(LinkerSetupError::Path(LinkerSetupPathError::new(
                            input.path(),
                            e,
                        )));
                    }
                }
            } else {
                match LinkObject::parse(input.as_slice()) {
                    Ok(parsed) => {
                        objects.push(InputObject::new(
                            input.path().display().to_string(),
                            false,
                            parsed,
                        ));
                    }
                    Err(e) => {
                        setup_errors.push(LinkerSetupError::Path(LinkerSetupPathError::new(
                            input.path(),
                            e,
                        )));
                    }
                }
            }
        }

        // Open link libraries.
        for link_library in &self.library_names {
            let found = match self.library_searcher.find_library(link_library) {
                Ok(found) => {
                    if archives
                        .iter()
                        .any(|archive| archive.path() == found.path())
                    {
                        continue;
                    }

                    library_arena.alloc(found)
                }
                Err(e) => {
                    setup_errors.push(LinkerSetupError::Library(e));
                    continue;
                }
            };

            match LinkArchive::parse(found.as_slice()) {
                Ok(parsed) => {
                    archives.push(PathedItem::new(found.path().clone(), parsed));
                }
                Err(e) => {
                    setup_errors.push(LinkerSetupError::Path(LinkerSetupPathError::new(
                        found.path(),
                        e,
                    )));
                }
            }
        }

        if !setup_errors.is_empty() {
            return Err(LinkError::Setup(LinkerSetupErrors(setup_errors)));
        }

        let target_arch = self.target_arch.or_else(|| {
            objects
                .iter()
                .find_map(|input| LinkerTargetArch::try_from(input.object.machine()).ok())
        });

        let target_arch = target_arch.ok_or(LinkError::MachineDetect)?;
        let machine: u16 = target_arch.into();
        debug!("linking for {:?}", target_arch);

        let mut diagnostics =
            Diagnostics::new(self.max_unresolved_reports, self.max_refs_per_symbol);

        objects
            .retain(|input| check_machine(input.object.machine(), machine, &input.name, &mut diagnostics));

        // I386 externals carry the cdecl underscore prefix.
        let entry_name: Option<String> = self.entrypoint.as_ref().map(|entry| {
            if target_arch == LinkerTargetArch::I386 {
                format!("_{entry}")
            } else {
                entry.clone()
            }
        });

        let mut table = SymbolTable::new();
        table.define_image_base("__ImageBase");

        // Intern the roots up front so library resolution pulls their
        // definitions in.
        if let Some(entry) = entry_name.as_deref() {
            table.intern_undefined(entry);
        }
        for include in &self.include_symbols {
            table.intern_undefined(include);
        }

        if !objects.is_empty() {
            let range = 0..objects.len();
            table.push_objects(&objects, range, &mut diagnostics);
        }

        let alternates: Vec<(&str, &str)> = self
            .alternate_names
            .iter()
            .map(|(from, to)| (from.as_str(), to.as_str()))
            .collect();

        resolve_libraries(
            &mut objects,
            &mut table,
            &archives,
            machine,
            &alternates,
            &mut diagnostics,
        )?;

        let mut sectab = SectionTable::gather(&objects);
        sectab.apply_merges(&self.merges);

        let liveness = Liveness::new(&objects);
        let redirects = fold_comdats(&objects, &mut table, &liveness, &mut diagnostics);

        let mut roots: Vec<SymbolId> = Vec::new();

        if let Some(entry) = entry_name.as_deref() {
            let resolved = table
                .search(entry)
                .filter(|&id| !matches!(table.resolve(id), Resolution::Unresolved));

            match resolved {
                Some(id) => roots.push(id),
                None => {
                    diagnostics.push(LinkDiagnostic::EntryPointNotFound(entry.to_string()));
                }
            }
        }

        for include in &self.include_symbols {
            if let Some(id) = table.search(include) {
                roots.push(id);
            }
        }

        // The TLS directory is always live when present.
        for tls_used in ["_tls_used", "__tls_used"] {
            if let Some(id) = table.search(tls_used) {
                roots.push(id);
            }
        }

        run_sweep(&objects, &table, &liveness, &roots, self.dead_strip);
        report_unresolved(&objects, &table, &liveness, &mut diagnostics);

        sectab.finalize(&objects, &liveness);
        let commons = pack_commons(&table, &mut sectab);

        let mut layout = Layout::new(self.layout);
        layout.assign(&mut sectab, &liveness);

        let pages = baserel::collect_pages(&objects, &sectab, &liveness, machine);
        let reloc_bytes = baserel::serialize_pages(&pages);
        if let Some(reloc_idx) = baserel::append_reloc_section(&mut sectab, reloc_bytes) {
            layout.place(&mut sectab, &liveness, reloc_idx);
        }

        // Fail late: everything above accumulates so all resolution
        // problems surface in one run, but nothing is emitted for a
        // failed link.
        diagnostics.finish().map_err(LinkError::Diagnostics)?;

        let ctx = PatchContext {
            table: &table,
            sectab: &sectab,
            redirects: &redirects,
            commons: &commons,
            liveness: &liveness,
            image_base: self.layout.image_base,
        };

        let patches = patch_symbols(&objects, &ctx);

        let mut image = build_image(&objects, &sectab, &liveness, &layout);
        let reloc_errors = apply_relocs(
            &mut image,
            &objects,
            &sectab,
            &liveness,
            &patches,
            machine,
            self.layout.image_base,
        );

        if !reloc_errors.is_empty() {
            let mut diagnostics =
                Diagnostics::new(self.max_unresolved_reports, self.max_refs_per_symbol);
            diagnostics.extend(reloc_errors);
            diagnostics.finish().map_err(LinkError::Diagnostics)?;
        }

        let symbols = exported_symbols(&ctx);

        let sections = sectab
            .indexed()
            .map(|(_, section)| ImageSection {
                name: section.name.clone(),
                characteristics: section.flags.bits(),
                virtual_address: section.voff,
                virtual_size: section.vsize,
                file_offset: section.foff,
                file_size: section.fsize,
                index: section.index,
            })
            .collect();

        Ok(LinkedImage {
            image,
            sections,
            symbols,
        })
    }
}
