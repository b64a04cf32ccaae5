//! Output section gathering.
//!
//! Input sections are grouped into output sections keyed by their base
//! name (the `$` sort suffix stripped) and normalized characteristics.
//! Output sections appear in first-seen input order; contributions
//! inside a section are ordered by `(sort suffix, object index, section
//! index)` so grouped sections like `.text$mn` land where the platform
//! expects them.

use std::collections::HashMap;

use indexmap::IndexMap;
use log::{debug, warn};
use rayon::prelude::*;

use crate::{
    gc::Liveness,
    linkobject::coff::{InputSection, SectionFlags},
    symtab::InputObject,
};

/// Characteristic bits that participate in section identity.
const IDENTITY_MASK: u32 = (SectionFlags::CntCode.bits())
    | (SectionFlags::CntInitializedData.bits())
    | (SectionFlags::CntUninitializedData.bits())
    | (SectionFlags::MemDiscardable.bits())
    | (SectionFlags::MemNotCached.bits())
    | (SectionFlags::MemNotPaged.bits())
    | (SectionFlags::MemShared.bits())
    | (SectionFlags::MemExecute.bits())
    | (SectionFlags::MemRead.bits())
    | (SectionFlags::MemWrite.bits());

/// Returns `true` if an input section is eligible for output gathering.
///
/// Informational and link-removed sections never reach the image, and
/// debug sections are excluded from this core.
pub fn output_eligible(section: &InputSection<'_>) -> bool {
    !section
        .characteristics()
        .intersects(SectionFlags::LnkRemove | SectionFlags::LnkInfo)
        && !section.is_debug()
}

/// Object index used for linker-synthesized contributions.
pub const SYNTHETIC_OBJ: usize = usize::MAX;

/// The source of a contribution's bytes.
#[derive(Debug)]
pub enum ContribData {
    /// An input object section.
    Object { obj: usize, section: usize },

    /// Linker-synthesized initialized bytes.
    Bytes(Vec<u8>),

    /// Linker-synthesized uninitialized space.
    Uninit(u32),
}

/// One contribution to an output section.
#[derive(Debug)]
pub struct Contrib<'data> {
    pub data: ContribData,
    pub size: usize,
    pub align: u32,
    pub sort_suffix: Option<&'data str>,

    /// Input order tiebreakers. Synthetic contributions use
    /// [`SYNTHETIC_OBJ`].
    pub obj_idx: usize,
    pub sect_idx: usize,

    /// Offset from the start of the output section, assigned at layout.
    pub offset: u64,
}

impl Contrib<'_> {
    /// Returns `true` if this contribution was dropped by COMDAT
    /// folding or the dead-strip sweep.
    pub fn is_removed(&self, liveness: &Liveness) -> bool {
        match self.data {
            ContribData::Object { obj, section } => liveness.is_removed(obj, section),
            _ => false,
        }
    }
}

/// A gathered output section.
#[derive(Debug)]
pub struct OutputSection<'data> {
    pub name: String,
    pub flags: SectionFlags,
    pub contribs: Vec<Contrib<'data>>,

    /// Assigned at layout.
    pub voff: u64,
    pub foff: u64,
    pub vsize: u64,
    pub fsize: u64,

    /// Final 1-based section index; zero until assigned.
    pub index: usize,
}

impl OutputSection<'_> {
    fn new(name: String, flags: SectionFlags) -> Self {
        Self {
            name,
            flags,
            contribs: Vec::new(),
            voff: 0,
            foff: 0,
            vsize: 0,
            fsize: 0,
            index: 0,
        }
    }

    /// Returns `true` if the section occupies no file space.
    pub fn is_uninitialized(&self) -> bool {
        self.flags.contains(SectionFlags::CntUninitializedData)
            && !self
                .flags
                .intersects(SectionFlags::CntCode | SectionFlags::CntInitializedData)
    }
}

/// Reference from an input section to its output contribution.
#[derive(Debug, Copy, Clone)]
pub struct ContribRef {
    pub section: usize,
    pub contrib: usize,
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct SectionKey {
    name: String,
    flags: u32,
}

/// A gathered contribution before merging, tagged with its identity.
struct GatheredContrib<'data> {
    key: SectionKey,
    contrib: Contrib<'data>,
}

#[derive(Default)]
pub struct SectionTable<'data> {
    sections: Vec<OutputSection<'data>>,
    map: IndexMap<SectionKey, usize>,

    /// `(object, input section)` to output contribution, built at
    /// finalize.
    contrib_map: HashMap<(usize, usize), ContribRef>,

    /// Next 1-based output section index.
    next_index: usize,
}

impl<'data> SectionTable<'data> {
    /// Gathers the eligible sections of every input object.
    ///
    /// Per-object extraction fans out across workers; sections and
    /// contributions are merged in input order.
    pub fn gather(objects: &[InputObject<'data>]) -> SectionTable<'data> {
        let gathered: Vec<Vec<GatheredContrib<'data>>> = objects
            .par_iter()
            .enumerate()
            .map(|(obj_idx, input)| {
                let mut list = Vec::new();

                for (sect_idx, section) in input.object.sections().iter().enumerate() {
                    if !output_eligible(section) {
                        continue;
                    }

                    list.push(GatheredContrib {
                        key: SectionKey {
                            name: section.group_name().to_string(),
                            flags: section.characteristics().bits() & IDENTITY_MASK,
                        },
                        contrib: Contrib {
                            data: ContribData::Object {
                                obj: obj_idx,
                                section: sect_idx,
                            },
                            size: section.len(),
                            align: section.alignment(),
                            sort_suffix: section.sort_suffix(),
                            obj_idx,
                            sect_idx,
                            offset: 0,
                        },
                    });
                }

                list
            })
            .collect();

        let mut table = SectionTable::default();

        for object_contribs in gathered {
            for gathered_contrib in object_contribs {
                let section_idx = table.section_for_key(gathered_contrib.key);
                table.sections[section_idx]
                    .contribs
                    .push(gathered_contrib.contrib);
            }
        }

        for section in &mut table.sections {
            sort_contribs(&mut section.contribs);
        }

        table
    }

    fn section_for_key(&mut self, key: SectionKey) -> usize {
        match self.map.entry(key) {
            indexmap::map::Entry::Occupied(entry) => *entry.get(),
            indexmap::map::Entry::Vacant(entry) => {
                let idx = self.sections.len();
                self.sections.push(OutputSection::new(
                    entry.key().name.clone(),
                    SectionFlags::from_bits_retain(entry.key().flags),
                ));
                entry.insert(idx);
                idx
            }
        }
    }

    /// Applies user section merges (`from` folded into `to`).
    ///
    /// When no destination section exists the source is renamed in
    /// place. Merging a section into itself is ignored with a warning.
    pub fn apply_merges(&mut self, merges: &[(String, String)]) {
        for (from, to) in merges {
            if from == to {
                warn!("ignoring self-referencing merge of {from}");
                continue;
            }

            let source_keys: Vec<SectionKey> = self
                .map
                .keys()
                .filter(|key| key.name == *from)
                .cloned()
                .collect();

            for source_key in source_keys {
                let source_idx = self.map.shift_remove(&source_key)
                    .unwrap_or_else(|| unreachable!());
                let dest_key = SectionKey {
                    name: to.clone(),
                    flags: source_key.flags,
                };

                match self.map.get(&dest_key).copied() {
                    Some(dest_idx) => {
                        debug!("merging section {from} into {to}");
                        let contribs = std::mem::take(&mut self.sections[source_idx].contribs);
                        self.sections[dest_idx].contribs.extend(contribs);
                        sort_contribs(&mut self.sections[dest_idx].contribs);
                    }
                    None => {
                        debug!("renaming section {from} to {to}");
                        self.sections[source_idx].name = to.clone();
                        self.map.insert(dest_key, source_idx);
                    }
                }
            }
        }
    }

    /// Drops sections left empty after folding and stripping, assigns
    /// final 1-based indices, recomputes characteristics from the live
    /// contributions and builds the input-to-contribution map.
    pub fn finalize(&mut self, objects: &[InputObject<'data>], liveness: &Liveness) {
        for section in &mut self.sections {
            if section.index != 0 {
                continue;
            }

            let mut flags = SectionFlags::from_bits_retain(0);
            let mut live_size = 0usize;

            for contrib in &section.contribs {
                if contrib.is_removed(liveness) {
                    continue;
                }

                live_size += contrib.size;
                match contrib.data {
                    ContribData::Object { obj, section } => {
                        flags |= objects[obj].object.sections()[section]
                            .characteristics()
                            .zero_align();
                    }
                    ContribData::Bytes(_) => flags |= SectionFlags::CntInitializedData,
                    ContribData::Uninit(_) => flags |= SectionFlags::CntUninitializedData,
                }
            }

            if live_size == 0 {
                continue;
            }

            // A mix of initialized and uninitialized contributions
            // occupies file space; the uninitialized parts become fill.
            if flags.contains(SectionFlags::CntUninitializedData)
                && flags.intersects(SectionFlags::CntCode | SectionFlags::CntInitializedData)
            {
                flags &= !SectionFlags::CntUninitializedData;
            }

            flags &= !(SectionFlags::LnkComdat | SectionFlags::TypeNoPad);

            section.flags = flags;
            self.next_index += 1;
            section.index = self.next_index;
        }

        self.contrib_map.clear();
        for (section_idx, section) in self.sections.iter().enumerate() {
            if section.index == 0 {
                continue;
            }

            for (contrib_idx, contrib) in section.contribs.iter().enumerate() {
                if let ContribData::Object { obj, section: sect } = contrib.data {
                    self.contrib_map.insert(
                        (obj, sect),
                        ContribRef {
                            section: section_idx,
                            contrib: contrib_idx,
                        },
                    );
                }
            }
        }
    }

    /// Appends a linker-synthesized section after finalize, assigning it
    /// the next section index.
    pub fn append_synthetic(
        &mut self,
        name: &str,
        flags: SectionFlags,
        contrib: Contrib<'data>,
    ) -> usize {
        let key = SectionKey {
            name: name.to_string(),
            flags: flags.bits() & IDENTITY_MASK,
        };

        let section_idx = match self.map.get(&key).copied() {
            Some(idx) => idx,
            None => self.section_for_key(key),
        };

        // Synthesized contributions always land at the tail.
        self.sections[section_idx].contribs.push(contrib);
        if self.sections[section_idx].index == 0 {
            self.next_index += 1;
            self.sections[section_idx].index = self.next_index;
            self.sections[section_idx].flags = flags;
        }

        section_idx
    }

    pub fn lookup_contrib(&self, obj: usize, section: usize) -> Option<ContribRef> {
        self.contrib_map.get(&(obj, section)).copied()
    }

    pub fn sections(&self) -> &[OutputSection<'data>] {
        &self.sections
    }

    pub fn sections_mut(&mut self) -> &mut [OutputSection<'data>] {
        &mut self.sections
    }

    pub fn section(&self, idx: usize) -> &OutputSection<'data> {
        &self.sections[idx]
    }

    /// Looks up an output section by name among the indexed sections.
    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.sections
            .iter()
            .position(|section| section.index != 0 && section.name == name)
    }

    /// Iterates the finalized output sections in index order.
    pub fn indexed(&self) -> impl Iterator<Item = (usize, &OutputSection<'data>)> {
        let mut order: Vec<usize> = (0..self.sections.len())
            .filter(|&idx| self.sections[idx].index != 0)
            .collect();
        order.sort_by_key(|&idx| self.sections[idx].index);
        order.into_iter().map(|idx| (idx, &self.sections[idx]))
    }
}

fn sort_contribs(contribs: &mut [Contrib<'_>]) {
    contribs.sort_by(|a, b| {
        (a.sort_suffix, a.obj_idx, a.sect_idx).cmp(&(b.sort_suffix, b.obj_idx, b.sect_idx))
    });
}
