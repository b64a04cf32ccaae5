//! Base relocation collection and serialization.
//!
//! Every live absolute fixup lands in a 4 KiB page bucket. Collection
//! fans out per object into local page maps; the merged pages are
//! sorted and deduplicated before serialization so the emitted section
//! is identical run to run.

use std::collections::HashMap;

use object::pe::{
    IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_I386, IMAGE_REL_AMD64_ADDR32,
    IMAGE_REL_AMD64_ADDR64, IMAGE_REL_BASED_DIR64, IMAGE_REL_BASED_HIGHLOW,
    IMAGE_REL_I386_DIR32,
};
use rayon::prelude::*;

use crate::{
    gc::Liveness,
    linkobject::coff::SectionFlags,
    sectab::{Contrib, ContribData, SYNTHETIC_OBJ, SectionTable},
    symtab::InputObject,
};

const PAGE_MASK: u32 = 0xfff;

/// One 4 KiB page of base relocation entries.
#[derive(Debug, PartialEq, Eq)]
pub struct BaseRelocPage {
    pub page_voff: u32,

    /// Encoded entries: `kind << 12 | page_offset`, sorted and
    /// deduplicated.
    pub entries: Vec<u16>,
}

/// Returns the base relocation kind for an absolute fixup type, or
/// `None` if the relocation is position-relative.
fn based_kind(machine: u16, typ: u16) -> Option<u16> {
    match machine {
        IMAGE_FILE_MACHINE_AMD64 => match typ {
            IMAGE_REL_AMD64_ADDR64 => Some(u16::from(IMAGE_REL_BASED_DIR64)),
            IMAGE_REL_AMD64_ADDR32 => Some(u16::from(IMAGE_REL_BASED_HIGHLOW)),
            _ => None,
        },
        IMAGE_FILE_MACHINE_I386 => match typ {
            IMAGE_REL_I386_DIR32 => Some(u16::from(IMAGE_REL_BASED_HIGHLOW)),
            _ => None,
        },
        _ => None,
    }
}

/// Collects the base relocation pages for every live absolute fixup.
pub fn collect_pages(
    objects: &[InputObject<'_>],
    sectab: &SectionTable<'_>,
    liveness: &Liveness,
    machine: u16,
) -> Vec<BaseRelocPage> {
    let worker_maps: Vec<HashMap<u32, Vec<u16>>> = objects
        .par_iter()
        .enumerate()
        .map(|(obj_idx, input)| {
            let mut pages: HashMap<u32, Vec<u16>> = HashMap::new();

            for (sect_idx, section) in input.object.sections().iter().enumerate() {
                if liveness.is_removed(obj_idx, sect_idx) {
                    continue;
                }

                let Some(contrib_ref) = sectab.lookup_contrib(obj_idx, sect_idx) else {
                    continue;
                };

                let out_section = sectab.section(contrib_ref.section);
                let base_voff =
                    out_section.voff + out_section.contribs[contrib_ref.contrib].offset;

                for reloc in section.relocs() {
                    let Some(kind) = based_kind(machine, reloc.typ) else {
                        continue;
                    };

                    let voff = (base_voff + u64::from(reloc.address)) as u32;
                    pages
                        .entry(voff & !PAGE_MASK)
                        .or_default()
                        .push((kind << 12) | (voff & PAGE_MASK) as u16);
                }
            }

            pages
        })
        .collect();

    let mut merged: HashMap<u32, Vec<u16>> = HashMap::new();
    for map in worker_maps {
        for (page, entries) in map {
            merged.entry(page).or_default().extend(entries);
        }
    }

    let mut pages: Vec<BaseRelocPage> = merged
        .into_iter()
        .map(|(page_voff, mut entries)| {
            entries.sort_unstable();
            entries.dedup();
            BaseRelocPage { page_voff, entries }
        })
        .collect();

    pages.sort_by_key(|page| page.page_voff);
    pages
}

/// Serializes the pages into `.reloc` section contents.
///
/// Each block is `(page_voff: u32, block_size: u32, entries: [u16])`,
/// padded with an `IMAGE_REL_BASED_ABSOLUTE` entry to a 4 byte
/// multiple.
pub fn serialize_pages(pages: &[BaseRelocPage]) -> Vec<u8> {
    let mut out = Vec::new();

    for page in pages {
        let padded = page.entries.len() + (page.entries.len() & 1);
        let block_size = 8 + padded * 2;

        out.extend_from_slice(&page.page_voff.to_le_bytes());
        out.extend_from_slice(&(block_size as u32).to_le_bytes());

        for entry in &page.entries {
            out.extend_from_slice(&entry.to_le_bytes());
        }

        if page.entries.len() & 1 == 1 {
            out.extend_from_slice(&0u16.to_le_bytes());
        }
    }

    out
}

/// Appends the serialized base relocations as the `.reloc` section.
///
/// Returns `None` when there is nothing to emit.
pub fn append_reloc_section<'data>(
    sectab: &mut SectionTable<'data>,
    bytes: Vec<u8>,
) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }

    let size = bytes.len();
    Some(sectab.append_synthetic(
        ".reloc",
        SectionFlags::CntInitializedData | SectionFlags::MemRead | SectionFlags::MemDiscardable,
        Contrib {
            data: ContribData::Bytes(bytes),
            size,
            align: 4,
            sort_suffix: None,
            obj_idx: SYNTHETIC_OBJ,
            sect_idx: 0,
            offset: 0,
        },
    ))
}
