//! Image buffer assembly and relocation application.
//!
//! The buffer is filled serially from the laid-out section table. The
//! relocation pass then splits it into one disjoint mutable span per
//! live contribution and patches the spans in parallel; every worker
//! collects its diagnostics locally and the per-span lists are merged
//! back in input order.

use object::pe::{
    IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_I386, IMAGE_REL_AMD64_ABSOLUTE,
    IMAGE_REL_AMD64_ADDR32, IMAGE_REL_AMD64_ADDR32NB, IMAGE_REL_AMD64_ADDR64,
    IMAGE_REL_AMD64_REL32, IMAGE_REL_AMD64_REL32_5, IMAGE_REL_AMD64_SECREL,
    IMAGE_REL_AMD64_SECTION, IMAGE_REL_I386_ABSOLUTE, IMAGE_REL_I386_DIR32,
    IMAGE_REL_I386_DIR32NB, IMAGE_REL_I386_REL32, IMAGE_REL_I386_SECREL, IMAGE_REL_I386_SECTION,
};
use rayon::prelude::*;

use crate::{
    diagnostics::LinkDiagnostic,
    gc::Liveness,
    layout::Layout,
    linkobject::coff::{InputReloc, SectionData, SectionFlags},
    patch::SymbolPatches,
    sectab::{ContribData, SectionTable},
    symtab::InputObject,
};

/// Pad byte for gaps inside executable sections.
const CODE_FILL: u8 = 0xcc;

/// Allocates the image buffer and copies in every live contribution.
pub fn build_image(
    objects: &[InputObject<'_>],
    sectab: &SectionTable<'_>,
    liveness: &Liveness,
    layout: &Layout,
) -> Vec<u8> {
    let mut image = vec![0u8; layout.file_size() as usize];

    for (_, section) in sectab.indexed() {
        if section.fsize == 0 {
            continue;
        }

        let foff = section.foff as usize;
        let fsize = section.fsize as usize;

        if section.flags.contains(SectionFlags::CntCode) {
            image[foff..foff + fsize].fill(CODE_FILL);
        }

        for contrib in &section.contribs {
            if contrib.is_removed(liveness) {
                continue;
            }

            let start = foff + contrib.offset as usize;
            match &contrib.data {
                ContribData::Object { obj, section } => {
                    if let Some(input_section) = objects[*obj].object.section(*section) {
                        if let SectionData::Initialized(data) = input_section.data() {
                            image[start..start + data.len()].copy_from_slice(data);
                        }
                    }
                }
                ContribData::Bytes(bytes) => {
                    image[start..start + bytes.len()].copy_from_slice(bytes);
                }
                ContribData::Uninit(_) => {}
            }
        }
    }

    image
}

/// One mutable window over an input section's bytes in the image.
struct RelocSpan<'buf> {
    obj: usize,
    section: usize,
    data: &'buf mut [u8],

    /// Virtual address of the first byte of the span.
    va: u64,
}

/// Splits the image buffer into disjoint spans for every live object
/// contribution, ordered by file offset.
fn reloc_spans<'buf>(
    image: &'buf mut [u8],
    sectab: &SectionTable<'_>,
    liveness: &Liveness,
    image_base: u64,
) -> Vec<RelocSpan<'buf>> {
    let mut bounds = Vec::new();

    for (_, section) in sectab.indexed() {
        if section.fsize == 0 {
            continue;
        }

        for contrib in &section.contribs {
            let (obj, sect) = match contrib.data {
                ContribData::Object { obj, section } => (obj, section),
                _ => continue,
            };

            if contrib.is_removed(liveness) || contrib.size == 0 {
                continue;
            }

            bounds.push((
                (section.foff + contrib.offset) as usize,
                contrib.size,
                obj,
                sect,
                image_base + section.voff + contrib.offset,
            ));
        }
    }

    bounds.sort_unstable_by_key(|&(start, ..)| start);

    let mut spans = Vec::with_capacity(bounds.len());
    let mut rest: &'buf mut [u8] = image;
    let mut cursor = 0usize;

    for (start, size, obj, section, va) in bounds {
        let tail = std::mem::take(&mut rest);
        let (_, tail) = tail.split_at_mut(start - cursor);
        let (data, tail) = tail.split_at_mut(size);
        rest = tail;
        cursor = start + size;

        spans.push(RelocSpan {
            obj,
            section,
            data,
            va,
        });
    }

    spans
}

fn read32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|bytes| u32::from_le_bytes(bytes.try_into().unwrap_or_default()))
}

fn add16(data: &mut [u8], offset: usize, value: u16) -> bool {
    let Some(bytes) = data.get_mut(offset..offset + 2) else {
        return false;
    };

    let existing = u16::from_le_bytes([bytes[0], bytes[1]]);
    bytes.copy_from_slice(&existing.wrapping_add(value).to_le_bytes());
    true
}

fn add32(data: &mut [u8], offset: usize, value: u32) -> bool {
    let Some(existing) = read32(data, offset) else {
        return false;
    };

    data[offset..offset + 4].copy_from_slice(&existing.wrapping_add(value).to_le_bytes());
    true
}

fn add64(data: &mut [u8], offset: usize, value: u64) -> bool {
    let Some(bytes) = data.get_mut(offset..offset + 8) else {
        return false;
    };

    let mut current = [0u8; 8];
    current.copy_from_slice(bytes);
    let existing = u64::from_le_bytes(current);
    bytes.copy_from_slice(&existing.wrapping_add(value).to_le_bytes());
    true
}

/// Converts a virtual address to a 32 bit image relative offset.
/// Targets below the image base (absolute symbols) have no image
/// relative form.
fn image_relative(target_va: u64, image_base: u64) -> Option<u32> {
    target_va
        .checked_sub(image_base)
        .and_then(|rva| u32::try_from(rva).ok())
}

/// Outcome of a single fixup.
enum FixupStatus {
    Applied,
    OutOfBounds,
    Overflow(u64),
    Unsupported,
}

fn apply_amd64(
    data: &mut [u8],
    reloc: &InputReloc,
    fixup_va: u64,
    target_va: u64,
    out_section: usize,
    section_offset: u64,
    image_base: u64,
) -> FixupStatus {
    let offset = reloc.address as usize;

    let done = match reloc.typ {
        IMAGE_REL_AMD64_ABSOLUTE => true,
        IMAGE_REL_AMD64_ADDR64 => add64(data, offset, target_va),
        IMAGE_REL_AMD64_ADDR32 => {
            let Ok(value) = u32::try_from(target_va) else {
                return FixupStatus::Overflow(target_va);
            };
            add32(data, offset, value)
        }
        IMAGE_REL_AMD64_ADDR32NB => {
            let Some(rva) = image_relative(target_va, image_base) else {
                return FixupStatus::Overflow(target_va);
            };
            add32(data, offset, rva)
        }
        IMAGE_REL_AMD64_REL32..=IMAGE_REL_AMD64_REL32_5 => {
            // The type constant doubles as the addend: REL32 is 4 and
            // the displacement base is fixup + 4, REL32_1 is 5 for
            // fixup + 5, and so on.
            let addend = u64::from(reloc.typ);
            add32(
                data,
                offset,
                target_va.wrapping_sub(fixup_va).wrapping_sub(addend) as u32,
            )
        }
        IMAGE_REL_AMD64_SECTION => add16(data, offset, out_section as u16),
        IMAGE_REL_AMD64_SECREL => add32(data, offset, section_offset as u32),
        _ => return FixupStatus::Unsupported,
    };

    if done {
        FixupStatus::Applied
    } else {
        FixupStatus::OutOfBounds
    }
}

fn apply_i386(
    data: &mut [u8],
    reloc: &InputReloc,
    fixup_va: u64,
    target_va: u64,
    out_section: usize,
    section_offset: u64,
    image_base: u64,
) -> FixupStatus {
    let offset = reloc.address as usize;

    let done = match reloc.typ {
        IMAGE_REL_I386_ABSOLUTE => true,
        IMAGE_REL_I386_DIR32 => {
            let Ok(value) = u32::try_from(target_va) else {
                return FixupStatus::Overflow(target_va);
            };
            add32(data, offset, value)
        }
        IMAGE_REL_I386_DIR32NB => {
            let Some(rva) = image_relative(target_va, image_base) else {
                return FixupStatus::Overflow(target_va);
            };
            add32(data, offset, rva)
        }
        IMAGE_REL_I386_REL32 => add32(
            data,
            offset,
            target_va.wrapping_sub(fixup_va).wrapping_sub(4) as u32,
        ),
        IMAGE_REL_I386_SECTION => add16(data, offset, out_section as u16),
        IMAGE_REL_I386_SECREL => add32(data, offset, section_offset as u32),
        _ => return FixupStatus::Unsupported,
    };

    if done {
        FixupStatus::Applied
    } else {
        FixupStatus::OutOfBounds
    }
}

/// Applies every live relocation to the image buffer.
pub fn apply_relocs(
    image: &mut [u8],
    objects: &[InputObject<'_>],
    sectab: &SectionTable<'_>,
    liveness: &Liveness,
    patches: &SymbolPatches,
    machine: u16,
    image_base: u64,
) -> Vec<LinkDiagnostic> {
    let spans = reloc_spans(image, sectab, liveness, image_base);

    let per_span: Vec<Vec<LinkDiagnostic>> = spans
        .into_par_iter()
        .map(|span| {
            let input = &objects[span.obj];
            let Some(input_section) = input.object.section(span.section) else {
                return Vec::new();
            };

            let mut errors = Vec::new();

            for reloc in input_section.relocs() {
                let absolute = match machine {
                    IMAGE_FILE_MACHINE_I386 => reloc.typ == IMAGE_REL_I386_ABSOLUTE,
                    _ => reloc.typ == IMAGE_REL_AMD64_ABSOLUTE,
                };
                if absolute {
                    continue;
                }

                let Some(target) = patches.get(span.obj, reloc.symbol) else {
                    let target_name = input
                        .object
                        .symbol(reloc.symbol)
                        .map(|symbol| symbol.name.to_string())
                        .unwrap_or_else(|| format!("symbol {}", reloc.symbol));

                    errors.push(LinkDiagnostic::RemovedReloc {
                        object: input.name.clone(),
                        section: input_section.name().to_string(),
                        address: reloc.address,
                        target: target_name,
                    });
                    continue;
                };

                let fixup_va = span.va + u64::from(reloc.address);
                let status = match machine {
                    IMAGE_FILE_MACHINE_AMD64 => apply_amd64(
                        span.data,
                        reloc,
                        fixup_va,
                        target.va,
                        target.out_section,
                        target.section_offset,
                        image_base,
                    ),
                    _ => apply_i386(
                        span.data,
                        reloc,
                        fixup_va,
                        target.va,
                        target.out_section,
                        target.section_offset,
                        image_base,
                    ),
                };

                match status {
                    FixupStatus::Applied => {}
                    FixupStatus::OutOfBounds => errors.push(LinkDiagnostic::RelocBounds {
                        object: input.name.clone(),
                        section: input_section.name().to_string(),
                        address: reloc.address,
                    }),
                    FixupStatus::Overflow(value) => errors.push(LinkDiagnostic::RelocOverflow {
                        object: input.name.clone(),
                        section: input_section.name().to_string(),
                        address: reloc.address,
                        value,
                    }),
                    FixupStatus::Unsupported => errors.push(LinkDiagnostic::UnsupportedReloc {
                        object: input.name.clone(),
                        section: input_section.name().to_string(),
                        address: reloc.address,
                        typ: reloc.typ,
                    }),
                }
            }

            errors
        })
        .collect();

    per_span.into_iter().flatten().collect()
}
