//! COMDAT leader selection and folding.
//!
//! Every symbol with chained COMDAT definitions keeps exactly one
//! definition (the leader) and the losing sections are removed. Symbols
//! and relocations that land in a losing section are redirected to the
//! leader through the returned redirect map.

use std::collections::{HashMap, VecDeque};

use log::debug;

use crate::{
    diagnostics::{Diagnostics, DuplicateSymbolError, LinkDiagnostic},
    gc::{self, Liveness},
    linkobject::coff::{ComdatSelection, SectionData},
    symtab::{ComdatDef, InputObject, SymbolId, SymbolKind, SymbolTable},
};

/// Map from a folded `(object, section)` to its leader.
pub type RedirectMap = HashMap<(usize, usize), (usize, usize)>;

struct FoldDecision {
    id: SymbolId,
    leader: ComdatDef,
    losers: Vec<ComdatDef>,
}

/// Folds all COMDAT symbol chains.
pub fn fold_comdats<'data>(
    objects: &[InputObject<'data>],
    table: &mut SymbolTable<'data>,
    liveness: &Liveness,
    diagnostics: &mut Diagnostics,
) -> RedirectMap {
    let children = gc::associative_children(objects);
    let mut redirects = RedirectMap::new();

    let mut decisions = Vec::new();
    let mut associative_chains = Vec::new();

    for (id, symbol) in table.iter() {
        let defs = symbol.comdat_defs();
        if defs.is_empty() {
            continue;
        }

        if defs
            .iter()
            .all(|def| def.selection == ComdatSelection::Associative)
        {
            associative_chains.push(id);
            continue;
        }

        decisions.push(select_leader(objects, id, symbol.name(), defs, diagnostics));
    }

    for decision in &decisions {
        apply_decision(table, liveness, &mut redirects, decision);
    }

    cascade_removals(objects, liveness, &children);

    // Symbols defined inside associative sections follow their parent:
    // the surviving definition is the one whose section outlived the
    // parent selection above.
    for id in associative_chains {
        let defs = table.symbol(id).comdat_defs().to_vec();
        let leader = defs
            .iter()
            .find(|def| !liveness.is_removed(def.obj, def.section))
            .or_else(|| defs.first())
            .copied()
            .unwrap_or_else(|| unreachable!());

        let losers = defs
            .iter()
            .filter(|def| (def.obj, def.section) != (leader.obj, leader.section))
            .copied()
            .collect();

        apply_decision(
            table,
            liveness,
            &mut redirects,
            &FoldDecision { id, leader, losers },
        );
    }

    cascade_removals(objects, liveness, &children);

    redirects
}

fn apply_decision<'data>(
    table: &mut SymbolTable<'data>,
    liveness: &Liveness,
    redirects: &mut RedirectMap,
    decision: &FoldDecision,
) {
    table.symbol_mut(decision.id).set_kind(SymbolKind::Regular {
        obj: decision.leader.obj,
        section: decision.leader.section,
        offset: decision.leader.offset,
    });

    for loser in &decision.losers {
        liveness.mark_removed(loser.obj, loser.section);
        redirects.insert(
            (loser.obj, loser.section),
            (decision.leader.obj, decision.leader.section),
        );
    }
}

/// Removes the associative children of every removed section.
fn cascade_removals(
    objects: &[InputObject<'_>],
    liveness: &Liveness,
    children: &[Vec<Vec<usize>>],
) {
    let mut queue = VecDeque::new();

    for (obj, input) in objects.iter().enumerate() {
        for section in 0..input.object.sections().len() {
            if liveness.is_removed(obj, section) {
                queue.push_back((obj, section));
            }
        }
    }

    while let Some((obj, section)) = queue.pop_front() {
        for &child in &children[obj][section] {
            if !liveness.is_removed(obj, child) {
                liveness.mark_removed(obj, child);
                queue.push_back((obj, child));
            }
        }
    }
}

fn select_leader(
    objects: &[InputObject<'_>],
    id: SymbolId,
    name: &str,
    defs: &[ComdatDef],
    diagnostics: &mut Diagnostics,
) -> FoldDecision {
    let first = defs[0];
    let mut selection = first.selection;

    // Mixed Any and Largest upgrade to Largest; any other mismatch is a
    // definition conflict and the first kind wins.
    for def in &defs[1..] {
        if def.selection == selection || def.selection == ComdatSelection::Associative {
            continue;
        }

        if matches!(
            (selection, def.selection),
            (ComdatSelection::Any, ComdatSelection::Largest)
                | (ComdatSelection::Largest, ComdatSelection::Any)
        ) {
            selection = ComdatSelection::Largest;
        } else {
            diagnostics.push(duplicate_diagnostic(objects, name, defs));
            break;
        }
    }

    let leader_idx = match selection {
        ComdatSelection::Any => defs
            .iter()
            .enumerate()
            .min_by_key(|(idx, def)| (def.size, *idx))
            .map(|(idx, _)| idx)
            .unwrap_or(0),

        ComdatSelection::Largest => defs
            .iter()
            .enumerate()
            .max_by_key(|(idx, def)| (def.size, usize::MAX - *idx))
            .map(|(idx, _)| idx)
            .unwrap_or(0),

        ComdatSelection::NoDuplicates => {
            if defs.len() > 1 {
                diagnostics.push(duplicate_diagnostic(objects, name, defs));
            }
            0
        }

        ComdatSelection::SameSize => {
            if defs.iter().any(|def| def.size != first.size) {
                diagnostics.push(duplicate_diagnostic(objects, name, defs));
            }
            0
        }

        ComdatSelection::ExactMatch => {
            if defs.iter().any(|def| !defs_match(objects, &first, def)) {
                diagnostics.push(duplicate_diagnostic(objects, name, defs));
            }
            0
        }

        // All-associative chains are handled by the caller.
        ComdatSelection::Associative => 0,
    };

    let leader = defs[leader_idx];
    debug!(
        "{}: folding COMDAT {name} ({selection:?}), {} definitions",
        objects[leader.obj].name,
        defs.len()
    );

    FoldDecision {
        id,
        leader,
        losers: defs
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != leader_idx)
            .map(|(_, def)| *def)
            .collect(),
    }
}

/// Compares two `ExactMatch` definitions, by checksum when both carry
/// one and by raw section bytes otherwise.
fn defs_match(objects: &[InputObject<'_>], a: &ComdatDef, b: &ComdatDef) -> bool {
    if a.checksum != 0 || b.checksum != 0 {
        return a.checksum == b.checksum;
    }

    section_bytes(objects, a) == section_bytes(objects, b)
}

fn section_bytes<'data>(objects: &[InputObject<'data>], def: &ComdatDef) -> Option<&'data [u8]> {
    match objects[def.obj].object.sections()[def.section].data() {
        SectionData::Initialized(data) => Some(data),
        SectionData::Uninitialized(_) => None,
    }
}

fn duplicate_diagnostic(
    objects: &[InputObject<'_>],
    name: &str,
    defs: &[ComdatDef],
) -> LinkDiagnostic {
    LinkDiagnostic::Duplicate(DuplicateSymbolError {
        name: name.to_string(),
        locations: defs.iter().map(|def| objects[def.obj].name.clone()).collect(),
    })
}
