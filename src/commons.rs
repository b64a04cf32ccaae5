//! Common block packing.
//!
//! Resolved common symbols are packed into a single uninitialized
//! contribution appended to `.bss`. Packing order is size descending so
//! large blocks set the alignment once, with the symbol name breaking
//! ties to keep the layout stable across runs.

use std::collections::HashMap;

use crate::{
    linkobject::coff::SectionFlags,
    sectab::{Contrib, ContribData, SYNTHETIC_OBJ, SectionTable},
    symtab::{SymbolId, SymbolKind, SymbolTable},
};

/// Alignment cap for packed common symbols.
const MAX_COMMON_ALIGN: u32 = 32;

/// The packed location of every common symbol.
#[derive(Default)]
pub struct CommonLayout {
    /// Output section and contribution holding the block.
    pub placement: Option<(usize, usize)>,

    /// Offset of each common symbol inside the contribution.
    offsets: HashMap<SymbolId, u64>,
}

impl CommonLayout {
    pub fn offset_of(&self, id: SymbolId) -> Option<u64> {
        self.offsets.get(&id).copied()
    }
}

fn common_align(size: u32) -> u32 {
    size.next_power_of_two().clamp(1, MAX_COMMON_ALIGN)
}

/// Packs all common symbols into one `.bss` contribution.
pub fn pack_commons<'data>(
    table: &SymbolTable<'data>,
    sectab: &mut SectionTable<'data>,
) -> CommonLayout {
    let mut commons: Vec<(SymbolId, &'data str, u32)> = table
        .iter()
        .filter_map(|(id, symbol)| match symbol.kind() {
            SymbolKind::Common { size, .. } => Some((id, symbol.name(), size)),
            _ => None,
        })
        .collect();

    if commons.is_empty() {
        return CommonLayout::default();
    }

    commons.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.1.cmp(b.1)));

    let mut offsets = HashMap::with_capacity(commons.len());
    let mut cursor = 0u64;
    let mut block_align = 1u32;

    for (id, _, size) in &commons {
        let align = common_align(*size);
        block_align = block_align.max(align);

        cursor = cursor.next_multiple_of(u64::from(align));
        offsets.insert(*id, cursor);
        cursor += u64::from(*size);
    }

    let section_idx = sectab.append_synthetic(
        ".bss",
        SectionFlags::CntUninitializedData | SectionFlags::MemRead | SectionFlags::MemWrite,
        Contrib {
            data: ContribData::Uninit(cursor as u32),
            size: cursor as usize,
            align: block_align,
            sort_suffix: None,
            obj_idx: SYNTHETIC_OBJ,
            sect_idx: 0,
            offset: 0,
        },
    );

    let contrib_idx = sectab.section(section_idx).contribs.len() - 1;

    CommonLayout {
        placement: Some((section_idx, contrib_idx)),
        offsets,
    }
}
