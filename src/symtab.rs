//! The global symbol table.
//!
//! External symbols from every input object are merged into one table
//! keyed by name. Definition precedence follows the platform rules:
//! section definitions beat weak externals, weak externals beat commons,
//! commons beat absolutes, and everything beats an undefined reference.
//! COMDAT definitions are chained for later leader selection instead of
//! being treated as duplicates.

use indexmap::IndexMap;
use rayon::prelude::*;

use crate::{
    diagnostics::{Diagnostics, DuplicateSymbolError, LinkDiagnostic},
    linkobject::coff::{ComdatSelection, InputSymbolKind, LinkObject, WeakSearch},
};

/// Weak fallback chains longer than this are treated as unresolved.
const MAX_WEAK_CHAIN: usize = 8;

/// An input object staged for linking.
pub struct InputObject<'data> {
    /// Display name; the file path with the member name appended for
    /// archive members.
    pub name: String,

    /// Set when the object was pulled out of a link library.
    pub from_lib: bool,

    pub object: LinkObject<'data>,
}

impl<'data> InputObject<'data> {
    pub fn new(name: String, from_lib: bool, object: LinkObject<'data>) -> InputObject<'data> {
        Self {
            name,
            from_lib,
            object,
        }
    }
}

/// Handle to a symbol in the [`SymbolTable`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SymbolId(pub u32);

impl SymbolId {
    #[inline]
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// A COMDAT candidate definition chained on a symbol.
#[derive(Debug, Copy, Clone)]
pub struct ComdatDef {
    pub obj: usize,
    pub section: usize,
    pub offset: u32,
    pub selection: ComdatSelection,
    pub size: usize,
    pub checksum: u32,
}

/// The classified definition state of a symbol.
#[derive(Debug, Copy, Clone)]
pub enum SymbolKind<'data> {
    /// Defined at an offset inside an input section.
    Regular {
        obj: usize,
        section: usize,
        offset: u32,
    },

    /// A weak external deferring to a fallback definition.
    Weak {
        fallback: &'data str,

        /// Local default definition inside the defining object.
        default_local: Option<(usize, usize, u32)>,

        search: WeakSearch,
    },

    /// A common block request of the given size.
    Common { obj: usize, size: u32 },

    /// An absolute value.
    Absolute { value: u32 },

    /// A debug symbol.
    Debug,

    /// An unresolved external reference.
    Undefined,

    /// The linker-provided image base symbol.
    ImageBase,
}

impl SymbolKind<'_> {
    fn rank(&self) -> u8 {
        match self {
            Self::Regular { .. } | Self::ImageBase => 5,
            Self::Weak { .. } => 4,
            Self::Common { .. } => 3,
            Self::Absolute { .. } => 2,
            Self::Debug => 1,
            Self::Undefined => 0,
        }
    }
}

/// The final resolution of a symbol through weak fallback chains.
#[derive(Debug, Copy, Clone)]
pub enum Resolution {
    Section {
        obj: usize,
        section: usize,
        offset: u32,
    },
    Common {
        obj: usize,
        size: u32,
    },
    Absolute {
        value: u32,
    },
    Debug,
    ImageBase,
    Unresolved,
}

pub struct Symbol<'data> {
    name: &'data str,
    kind: SymbolKind<'data>,

    /// All COMDAT candidate definitions for this name.
    comdat: Vec<ComdatDef>,

    /// Set once a library search pass has considered this symbol.
    searched: bool,
}

impl<'data> Symbol<'data> {
    pub fn name(&self) -> &'data str {
        self.name
    }

    pub fn kind(&self) -> SymbolKind<'data> {
        self.kind
    }

    pub fn set_kind(&mut self, kind: SymbolKind<'data>) {
        self.kind = kind;
    }

    pub fn comdat_defs(&self) -> &[ComdatDef] {
        &self.comdat
    }

    pub fn is_comdat(&self) -> bool {
        !self.comdat.is_empty()
    }

    pub fn searched(&self) -> bool {
        self.searched
    }

    pub fn mark_searched(&mut self) {
        self.searched = true;
    }
}

/// A symbol merge candidate extracted from one object.
struct Candidate<'data> {
    name: &'data str,
    kind: SymbolKind<'data>,
    comdat: Option<ComdatDef>,
}

#[derive(Default)]
pub struct SymbolTable<'data> {
    symbols: Vec<Symbol<'data>>,
    map: IndexMap<&'data str, SymbolId>,
}

impl<'data> SymbolTable<'data> {
    pub fn new() -> SymbolTable<'data> {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn search(&self, name: &str) -> Option<SymbolId> {
        self.map.get(name).copied()
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol<'data> {
        &self.symbols[id.idx()]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol<'data> {
        &mut self.symbols[id.idx()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol<'data>)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(idx, symbol)| (SymbolId(idx as u32), symbol))
    }

    /// Defines the linker-provided `__ImageBase` pseudo-symbol.
    pub fn define_image_base(&mut self, name: &'data str) -> SymbolId {
        self.intern(name, SymbolKind::ImageBase)
    }

    /// Interns a name as an undefined reference if it is not present.
    pub fn intern_undefined(&mut self, name: &'data str) -> SymbolId {
        self.intern(name, SymbolKind::Undefined)
    }

    fn intern(&mut self, name: &'data str, kind: SymbolKind<'data>) -> SymbolId {
        match self.map.entry(name) {
            indexmap::map::Entry::Occupied(entry) => *entry.get(),
            indexmap::map::Entry::Vacant(entry) => {
                let id = SymbolId(self.symbols.len() as u32);
                self.symbols.push(Symbol {
                    name,
                    kind,
                    comdat: Vec::new(),
                    searched: false,
                });
                entry.insert(id);
                id
            }
        }
    }

    /// Merges the external symbols of `objects[range]` into the table.
    ///
    /// Candidate extraction fans out across worker threads; the merge
    /// itself runs single threaded in input order so the table contents
    /// never depend on scheduling.
    pub fn push_objects(
        &mut self,
        objects: &[InputObject<'data>],
        range: std::ops::Range<usize>,
        diagnostics: &mut Diagnostics,
    ) {
        let candidate_lists: Vec<Vec<Candidate<'data>>> = objects[range.clone()]
            .par_iter()
            .enumerate()
            .map(|(rel_idx, input)| extract_candidates(range.start + rel_idx, &input.object))
            .collect();

        for candidates in candidate_lists {
            for candidate in candidates {
                self.merge_candidate(objects, candidate, diagnostics);
            }
        }
    }

    fn merge_candidate(
        &mut self,
        objects: &[InputObject<'data>],
        candidate: Candidate<'data>,
        diagnostics: &mut Diagnostics,
    ) {
        let id = self.intern(candidate.name, SymbolKind::Undefined);
        let existing = &mut self.symbols[id.idx()];

        let new_rank = candidate.kind.rank();
        let old_rank = existing.kind.rank();

        if new_rank > old_rank {
            existing.kind = candidate.kind;
            existing.comdat = candidate.comdat.into_iter().collect();
            return;
        }

        if new_rank < old_rank {
            return;
        }

        match (existing.kind, candidate.kind) {
            (SymbolKind::Undefined, SymbolKind::Undefined) | (SymbolKind::Debug, SymbolKind::Debug) => {}

            (SymbolKind::Regular { .. }, SymbolKind::Regular { obj, .. }) => {
                match (existing.is_comdat(), candidate.comdat) {
                    (true, Some(def)) => existing.comdat.push(def),
                    _ => {
                        let name = existing.name.to_string();
                        let locations = vec![
                            self.kind_location(id, objects),
                            objects[obj].name.clone(),
                        ];
                        diagnostics.push(LinkDiagnostic::Duplicate(DuplicateSymbolError {
                            name,
                            locations,
                        }));
                    }
                }
            }

            (
                SymbolKind::Weak { fallback: a, .. },
                SymbolKind::Weak { fallback: b, .. },
            ) => {
                // Matching weak externals collapse; conflicting fallbacks
                // are a definition conflict.
                if a != b {
                    diagnostics.push(LinkDiagnostic::Duplicate(DuplicateSymbolError {
                        name: existing.name.to_string(),
                        locations: vec![format!("weak fallback {a}"), format!("weak fallback {b}")],
                    }));
                }
            }

            (SymbolKind::Common { size: a, .. }, SymbolKind::Common { obj, size: b }) => {
                // The largest common request wins.
                if b > a {
                    existing.kind = SymbolKind::Common { obj, size: b };
                }
            }

            (SymbolKind::Absolute { value: a }, SymbolKind::Absolute { value: b }) => {
                if a != b {
                    diagnostics.push(LinkDiagnostic::Duplicate(DuplicateSymbolError {
                        name: existing.name.to_string(),
                        locations: vec![
                            format!("absolute value {a:#x}"),
                            format!("absolute value {b:#x}"),
                        ],
                    }));
                }
            }

            (_, candidate_kind) => {
                // Same rank with different classes; only Regular vs the
                // linker image base symbol lands here.
                let name = existing.name.to_string();
                let first = self.kind_location(id, objects);
                let second = match candidate_kind {
                    SymbolKind::Regular { obj, .. } => objects[obj].name.clone(),
                    _ => String::from("<linker-defined>"),
                };
                diagnostics.push(LinkDiagnostic::Duplicate(DuplicateSymbolError {
                    name,
                    locations: vec![first, second],
                }));
            }
        }
    }

    fn kind_location(&self, id: SymbolId, objects: &[InputObject<'data>]) -> String {
        match self.symbols[id.idx()].kind {
            SymbolKind::Regular { obj, .. } | SymbolKind::Common { obj, .. } => {
                objects[obj].name.clone()
            }
            SymbolKind::Weak { fallback, .. } => format!("weak fallback {fallback}"),
            SymbolKind::Absolute { value } => format!("absolute value {value:#x}"),
            SymbolKind::ImageBase => String::from("<linker-defined>"),
            SymbolKind::Debug | SymbolKind::Undefined => String::from("<undefined>"),
        }
    }

    /// Resolves a symbol through weak fallback chains.
    pub fn resolve(&self, id: SymbolId) -> Resolution {
        self.resolve_depth(id, 0)
    }

    fn resolve_depth(&self, id: SymbolId, depth: usize) -> Resolution {
        if depth > MAX_WEAK_CHAIN {
            return Resolution::Unresolved;
        }

        match self.symbols[id.idx()].kind {
            SymbolKind::Regular {
                obj,
                section,
                offset,
            } => Resolution::Section {
                obj,
                section,
                offset,
            },
            SymbolKind::Common { obj, size } => Resolution::Common { obj, size },
            SymbolKind::Absolute { value } => Resolution::Absolute { value },
            SymbolKind::Debug => Resolution::Debug,
            SymbolKind::ImageBase => Resolution::ImageBase,
            SymbolKind::Undefined => Resolution::Unresolved,
            SymbolKind::Weak {
                fallback,
                default_local,
                ..
            } => {
                if let Some(&next) = self.map.get(fallback) {
                    let resolution = self.resolve_depth(next, depth + 1);
                    if !matches!(resolution, Resolution::Unresolved) {
                        return resolution;
                    }
                }

                match default_local {
                    Some((obj, section, offset)) => Resolution::Section {
                        obj,
                        section,
                        offset,
                    },
                    None => Resolution::Unresolved,
                }
            }
        }
    }

    /// Rewrites still-undefined `from` symbols as weak aliases of `to`,
    /// interning `to` so a final library pass can pull it in.
    pub fn apply_alternate_names(&mut self, alternates: &[(&'data str, &'data str)]) {
        for &(from, to) in alternates {
            let Some(&id) = self.map.get(from) else {
                continue;
            };

            if matches!(self.symbols[id.idx()].kind, SymbolKind::Undefined) {
                self.intern_undefined(to);
                self.symbols[id.idx()].kind = SymbolKind::Weak {
                    fallback: to,
                    default_local: None,
                    search: WeakSearch::Library,
                };
            }
        }
    }
}

fn extract_candidates<'data>(obj: usize, object: &LinkObject<'data>) -> Vec<Candidate<'data>> {
    let mut candidates = Vec::new();

    for (_, symbol) in object.symbols() {
        if !symbol.external {
            continue;
        }

        let (kind, comdat) = match symbol.kind {
            InputSymbolKind::Section { section, offset } => {
                let kind = SymbolKind::Regular {
                    obj,
                    section,
                    offset,
                };

                let comdat = object.section(section).and_then(|input_section| {
                    input_section.is_comdat().then(|| ComdatDef {
                        obj,
                        section,
                        offset,
                        selection: input_section.selection().unwrap_or(ComdatSelection::Any),
                        size: input_section.len(),
                        checksum: input_section.checksum(),
                    })
                });

                (kind, comdat)
            }
            InputSymbolKind::Common { size } => (SymbolKind::Common { obj, size }, None),
            InputSymbolKind::Absolute { value } => (SymbolKind::Absolute { value }, None),
            InputSymbolKind::Debug => (SymbolKind::Debug, None),
            InputSymbolKind::Undefined => (SymbolKind::Undefined, None),
            InputSymbolKind::Weak {
                default_name,
                default_local,
                search,
            } => (
                SymbolKind::Weak {
                    fallback: default_name,
                    default_local: default_local.map(|(section, offset)| (obj, section, offset)),
                    search,
                },
                None,
            ),
        };

        candidates.push(Candidate {
            name: symbol.name,
            kind,
            comdat,
        });
    }

    candidates
}
