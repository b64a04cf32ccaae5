//! Virtual and file layout assignment.

use log::debug;

use crate::{gc::Liveness, sectab::SectionTable};

/// Layout configuration for the output image.
#[derive(Debug, Copy, Clone)]
pub struct LayoutParams {
    pub image_base: u64,

    /// Virtual offset of the first section.
    pub section_virt_off: u64,

    pub section_align: u32,
    pub file_align: u32,
}

impl Default for LayoutParams {
    fn default() -> Self {
        Self {
            image_base: 0x140000000,
            section_virt_off: 0x1000,
            section_align: 0x1000,
            file_align: 0x200,
        }
    }
}

/// Running layout cursors.
///
/// Kept by the linker so sections synthesized after the first pass (the
/// base relocation section) can be placed without disturbing assigned
/// offsets.
pub struct Layout {
    params: LayoutParams,
    vcursor: u64,
    fcursor: u64,
}

impl Layout {
    pub fn new(params: LayoutParams) -> Layout {
        Self {
            vcursor: params.section_virt_off,
            fcursor: 0,
            params,
        }
    }

    pub fn params(&self) -> LayoutParams {
        self.params
    }

    /// Assigns offsets for every finalized section in index order.
    pub fn assign(&mut self, sectab: &mut SectionTable<'_>, liveness: &Liveness) {
        let order: Vec<usize> = sectab
            .indexed()
            .filter(|(_, section)| section.voff == 0)
            .map(|(idx, _)| idx)
            .collect();

        for idx in order {
            self.place(sectab, liveness, idx);
        }
    }

    /// Places a single output section at the current cursors.
    pub fn place(&mut self, sectab: &mut SectionTable<'_>, liveness: &Liveness, idx: usize) {
        let section = &mut sectab.sections_mut()[idx];

        let mut cursor = 0u64;
        for contrib in &mut section.contribs {
            if contrib.is_removed(liveness) {
                continue;
            }

            cursor = cursor.next_multiple_of(u64::from(contrib.align.max(1)));
            contrib.offset = cursor;
            cursor += contrib.size as u64;
        }

        section.vsize = cursor;
        section.voff = self
            .vcursor
            .next_multiple_of(u64::from(self.params.section_align));
        self.vcursor = section.voff + section.vsize.max(1);

        if section.is_uninitialized() || section.vsize == 0 {
            section.foff = 0;
            section.fsize = 0;
        } else {
            section.foff = self
                .fcursor
                .next_multiple_of(u64::from(self.params.file_align));
            section.fsize = section
                .vsize
                .next_multiple_of(u64::from(self.params.file_align));
            self.fcursor = section.foff + section.fsize;
        }

        debug!(
            "section {} voff={:#x} vsize={:#x} foff={:#x} fsize={:#x}",
            section.name, section.voff, section.vsize, section.foff, section.fsize
        );
    }

    /// Total file size of the laid-out image.
    pub fn file_size(&self) -> u64 {
        self.fcursor
    }
}
