//! Section liveness and the dead-strip sweep.
//!
//! Liveness is a monotonic per-section state machine: sections start
//! unknown and move to live or removed exactly once, so marking from
//! multiple worker threads is idempotent and needs no locks.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::{
    sectab,
    symtab::{InputObject, Resolution, SymbolId, SymbolTable},
};

const STATE_UNKNOWN: u8 = 0;
const STATE_LIVE: u8 = 1;
const STATE_REMOVED: u8 = 2;

/// Relocation chunk size for sweep fan-out.
const SWEEP_CHUNK: usize = 512;

/// Per-section liveness states for every input object.
pub struct Liveness {
    states: Vec<Vec<AtomicU8>>,
}

impl Liveness {
    pub fn new(objects: &[InputObject<'_>]) -> Liveness {
        Self {
            states: objects
                .iter()
                .map(|input| {
                    let mut states = Vec::new();
                    states.resize_with(input.object.sections().len(), || {
                        AtomicU8::new(STATE_UNKNOWN)
                    });
                    states
                })
                .collect(),
        }
    }

    /// Marks a section live. Returns `true` on the first transition;
    /// removed sections stay removed.
    pub fn mark_live(&self, obj: usize, section: usize) -> bool {
        self.states[obj][section]
            .compare_exchange(
                STATE_UNKNOWN,
                STATE_LIVE,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Marks a section removed. Live sections are never demoted.
    pub fn mark_removed(&self, obj: usize, section: usize) {
        let _ = self.states[obj][section].compare_exchange(
            STATE_UNKNOWN,
            STATE_REMOVED,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    pub fn is_live(&self, obj: usize, section: usize) -> bool {
        self.states[obj][section].load(Ordering::Relaxed) == STATE_LIVE
    }

    pub fn is_removed(&self, obj: usize, section: usize) -> bool {
        self.states[obj][section].load(Ordering::Relaxed) == STATE_REMOVED
    }
}

/// Builds the associative child lists per object section from the
/// COMDAT `Associative` parent links.
pub fn associative_children(objects: &[InputObject<'_>]) -> Vec<Vec<Vec<usize>>> {
    objects
        .iter()
        .map(|input| {
            let sections = input.object.sections();
            let mut children: Vec<Vec<usize>> = vec![Vec::new(); sections.len()];

            for (idx, section) in sections.iter().enumerate() {
                if let Some(parent) = section.associative() {
                    if parent < children.len() {
                        children[parent].push(idx);
                    }
                }
            }

            children
        })
        .collect()
}

struct SweepContext<'a, 'data> {
    objects: &'a [InputObject<'data>],
    table: &'a SymbolTable<'data>,
    liveness: &'a Liveness,
    children: &'a [Vec<Vec<usize>>],
}

/// Runs the reachability sweep.
///
/// Roots are the resolved root symbols plus every output-eligible
/// non-COMDAT section. With dead stripping disabled everything not
/// already removed becomes live.
pub fn run_sweep<'data>(
    objects: &[InputObject<'data>],
    table: &SymbolTable<'data>,
    liveness: &Liveness,
    roots: &[SymbolId],
    dead_strip: bool,
) {
    let children = associative_children(objects);

    if !dead_strip {
        for (obj, input) in objects.iter().enumerate() {
            for section in 0..input.object.sections().len() {
                liveness.mark_live(obj, section);
            }
        }
        return;
    }

    let ctx = SweepContext {
        objects,
        table,
        liveness,
        children: &children,
    };

    rayon::scope(|scope| {
        // Symbol roots: entry point, include roots, the TLS directory.
        for &root in roots {
            if let Resolution::Section { obj, section, .. } = ctx.table.resolve(root) {
                if ctx.liveness.mark_live(obj, section) {
                    visit(scope, &ctx, obj, section);
                }
            }
        }

        // Every retained non-COMDAT section is a root.
        for (obj, input) in ctx.objects.iter().enumerate() {
            for (section_idx, section) in input.object.sections().iter().enumerate() {
                if sectab::output_eligible(section)
                    && !section.is_comdat()
                    && ctx.liveness.mark_live(obj, section_idx)
                {
                    visit(scope, &ctx, obj, section_idx);
                }
            }
        }
    });

    // Unreached COMDATs are swept. Associates of a removed parent are
    // unreached themselves so the cascade falls out of the traversal.
    for (obj, input) in objects.iter().enumerate() {
        for (section_idx, section) in input.object.sections().iter().enumerate() {
            if section.is_comdat() && !liveness.is_live(obj, section_idx) {
                liveness.mark_removed(obj, section_idx);
            }
        }
    }
}

/// Visits a newly live section: associative children become live and the
/// relocation targets are followed, fanning chunks out onto the pool.
fn visit<'s, 'data: 's>(
    scope: &rayon::Scope<'s>,
    ctx: &'s SweepContext<'s, 'data>,
    obj: usize,
    section: usize,
) {
    for &child in &ctx.children[obj][section] {
        if ctx.liveness.mark_live(obj, child) {
            visit(scope, ctx, obj, child);
        }
    }

    let relocs = ctx.objects[obj].object.section(section).map(|s| s.relocs());
    let Some(relocs) = relocs else {
        return;
    };

    for chunk in relocs.chunks(SWEEP_CHUNK) {
        scope.spawn(move |scope| {
            for reloc in chunk {
                let Some((target_obj, target_section)) = reloc_target(ctx, obj, reloc.symbol)
                else {
                    continue;
                };

                if sectab::output_eligible(
                    &ctx.objects[target_obj].object.sections()[target_section],
                ) && ctx.liveness.mark_live(target_obj, target_section)
                {
                    visit(scope, ctx, target_obj, target_section);
                }
            }
        });
    }
}

/// Resolves a relocation target to its defining object section.
fn reloc_target(ctx: &SweepContext<'_, '_>, obj: usize, symbol_idx: usize) -> Option<(usize, usize)> {
    let symbol = ctx.objects[obj].object.symbol(symbol_idx)?;

    if symbol.external {
        match ctx.table.search(symbol.name).map(|id| ctx.table.resolve(id))? {
            Resolution::Section { obj, section, .. } => Some((obj, section)),
            _ => None,
        }
    } else {
        match symbol.kind {
            crate::linkobject::coff::InputSymbolKind::Section { section, .. } => {
                Some((obj, section))
            }
            _ => None,
        }
    }
}
