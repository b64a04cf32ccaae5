//! Final symbol address assignment.
//!
//! After layout every input symbol gets its final virtual address,
//! output section index and section-relative offset. The pass is one
//! task per object; each object owns its slot vector so no slot is ever
//! written twice.

use indexmap::IndexMap;
use rayon::prelude::*;

use crate::{
    comdat::RedirectMap,
    commons::CommonLayout,
    gc::Liveness,
    linkobject::coff::InputSymbolKind,
    sectab::SectionTable,
    symtab::{InputObject, Resolution, SymbolId, SymbolTable},
};

/// A symbol with its final placement in the image.
#[derive(Debug, Copy, Clone)]
pub struct PatchedSymbol {
    /// Final virtual address.
    pub va: u64,

    /// 1-based output section index; zero for absolute values and the
    /// image base.
    pub out_section: usize,

    /// Offset from the start of the output section.
    pub section_offset: u64,
}

/// Patched addresses for every input symbol slot.
pub struct SymbolPatches {
    slots: Vec<Vec<Option<PatchedSymbol>>>,
}

impl SymbolPatches {
    pub fn get(&self, obj: usize, symbol: usize) -> Option<PatchedSymbol> {
        self.slots
            .get(obj)
            .and_then(|slots| slots.get(symbol))
            .copied()
            .flatten()
    }
}

/// Shared context for address resolution.
pub struct PatchContext<'a, 'data> {
    pub table: &'a SymbolTable<'data>,
    pub sectab: &'a SectionTable<'data>,
    pub redirects: &'a RedirectMap,
    pub commons: &'a CommonLayout,
    pub liveness: &'a Liveness,
    pub image_base: u64,
}

impl PatchContext<'_, '_> {
    /// Returns the final placement of a section-relative location,
    /// following COMDAT redirects.
    pub fn section_location(
        &self,
        obj: usize,
        section: usize,
        offset: u32,
    ) -> Option<PatchedSymbol> {
        let (obj, section) = self
            .redirects
            .get(&(obj, section))
            .copied()
            .unwrap_or((obj, section));

        if self.liveness.is_removed(obj, section) {
            return None;
        }

        let contrib_ref = self.sectab.lookup_contrib(obj, section)?;
        let out_section = self.sectab.section(contrib_ref.section);
        let contrib = &out_section.contribs[contrib_ref.contrib];

        let section_offset = contrib.offset + u64::from(offset);
        Some(PatchedSymbol {
            va: self.image_base + out_section.voff + section_offset,
            out_section: out_section.index,
            section_offset,
        })
    }

    /// Returns the final placement of a table symbol.
    pub fn locate(&self, id: SymbolId) -> Option<PatchedSymbol> {
        match self.table.resolve(id) {
            Resolution::Section {
                obj,
                section,
                offset,
            } => self.section_location(obj, section, offset),

            Resolution::Common { .. } => {
                let (section_idx, contrib_idx) = self.commons.placement?;
                let block_offset = self.commons.offset_of(id)?;

                let out_section = self.sectab.section(section_idx);
                let contrib = &out_section.contribs[contrib_idx];

                let section_offset = contrib.offset + block_offset;
                Some(PatchedSymbol {
                    va: self.image_base + out_section.voff + section_offset,
                    out_section: out_section.index,
                    section_offset,
                })
            }

            Resolution::Absolute { value } => Some(PatchedSymbol {
                va: u64::from(value),
                out_section: 0,
                section_offset: u64::from(value),
            }),

            Resolution::ImageBase => Some(PatchedSymbol {
                va: self.image_base,
                out_section: 0,
                section_offset: 0,
            }),

            Resolution::Debug | Resolution::Unresolved => None,
        }
    }
}

/// Computes the final address of every input symbol, one task per
/// object.
pub fn patch_symbols<'data>(
    objects: &[InputObject<'data>],
    ctx: &PatchContext<'_, 'data>,
) -> SymbolPatches {
    let slots = objects
        .par_iter()
        .enumerate()
        .map(|(obj_idx, input)| {
            let mut slots: Vec<Option<PatchedSymbol>> =
                vec![None; input.object.symbol_slots()];

            for (slot_idx, symbol) in input.object.symbols() {
                let patched = if symbol.external {
                    ctx.table.search(symbol.name).and_then(|id| ctx.locate(id))
                } else {
                    match symbol.kind {
                        InputSymbolKind::Section { section, offset } => {
                            ctx.section_location(obj_idx, section, offset)
                        }
                        InputSymbolKind::Absolute { value } => Some(PatchedSymbol {
                            va: u64::from(value),
                            out_section: 0,
                            section_offset: u64::from(value),
                        }),
                        _ => None,
                    }
                };

                slots[slot_idx] = patched;
            }

            slots
        })
        .collect();

    SymbolPatches { slots }
}

/// Builds the exported name to virtual address map for the resolved
/// external symbols.
pub fn exported_symbols<'data>(ctx: &PatchContext<'_, 'data>) -> IndexMap<String, u64> {
    let mut exports = IndexMap::with_capacity(ctx.table.len());

    for (id, symbol) in ctx.table.iter() {
        if let Some(patched) = ctx.locate(id) {
            exports.insert(symbol.name().to_string(), patched.va);
        }
    }

    exports
}
