//! Library member resolution.
//!
//! Undefined symbols are run against the loaded archive symbol indexes
//! until a pass stops claiming members. Lookup fans out across worker
//! threads but members are claimed serially in symbol table order, so
//! the set and order of loaded members never depend on scheduling.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use log::debug;
use rayon::prelude::*;

use crate::{
    diagnostics::{Diagnostics, LinkDiagnostic},
    gc::Liveness,
    linkobject::{
        archive::{ExtractMemberError, LinkArchive},
        coff::{LinkObject, LinkObjectParseError, WeakSearch},
    },
    pathed_item::PathedItem,
    symtab::{InputObject, SymbolId, SymbolKind, SymbolTable},
};

#[derive(Debug, thiserror::Error)]
#[error(
    "{}{}: {kind}",
    .archive.display(),
    .member.as_ref().map(|m| format!("({m})")).unwrap_or_default()
)]
pub struct LibraryResolveError {
    pub archive: PathBuf,
    pub member: Option<String>,
    pub kind: LibraryResolveErrorKind,
}

#[derive(Debug, thiserror::Error)]
pub enum LibraryResolveErrorKind {
    #[error("{0}")]
    Extract(#[from] ExtractMemberError),

    #[error("{0}")]
    Parse(#[from] LinkObjectParseError),
}

/// Checks an input object's machine against the link target.
///
/// A zero machine is wildcard and always accepted.
pub fn check_machine(
    found: u16,
    expected: u16,
    name: &str,
    diagnostics: &mut Diagnostics,
) -> bool {
    if found == object::pe::IMAGE_FILE_MACHINE_UNKNOWN || found == expected {
        true
    } else {
        diagnostics.push(LinkDiagnostic::IncompatibleMachine {
            object: name.to_string(),
            expected,
            found,
        });
        false
    }
}

/// A member claim produced by one resolution pass.
struct MemberClaim<'data> {
    archive: usize,
    offset: object::read::archive::ArchiveOffset,
    data: &'data [u8],
    name: String,
}

/// Runs library resolution to a fixed point.
///
/// `alternates` are applied once, after the first pass that claims
/// nothing, and resolution continues so the aliased names can still pull
/// members.
pub fn resolve_libraries<'data>(
    objects: &mut Vec<InputObject<'data>>,
    table: &mut SymbolTable<'data>,
    archives: &[PathedItem<PathBuf, LinkArchive<'data>>],
    machine: u16,
    alternates: &[(&'data str, &'data str)],
    diagnostics: &mut Diagnostics,
) -> Result<(), LibraryResolveError> {
    let mut claimed: Vec<HashSet<u64>> = archives.iter().map(|_| HashSet::new()).collect();
    let mut alternates_applied = alternates.is_empty();

    loop {
        let pending = pending_symbols(table);

        // Read-only index lookups can fan out; each pending slot keeps
        // its position so the claim pass below stays in symbol order.
        let hits: Vec<Option<(usize, object::read::archive::ArchiveOffset)>> = pending
            .par_iter()
            .map(|(_, name, fallback)| {
                lookup_archives(archives, name).or_else(|| {
                    fallback.and_then(|fallback| lookup_archives(archives, fallback))
                })
            })
            .collect();

        let mut claims: Vec<MemberClaim<'data>> = Vec::new();
        for ((id, _, _), hit) in pending.iter().zip(hits) {
            table.symbol_mut(*id).mark_searched();

            let Some((archive_idx, offset)) = hit else {
                continue;
            };

            if !claimed[archive_idx].insert(offset.0) {
                continue;
            }

            let archive = &archives[archive_idx];
            let member = archive.extract_member(offset).map_err(|e| {
                LibraryResolveError {
                    archive: archive.path().clone(),
                    member: None,
                    kind: e.into(),
                }
            })?;

            debug!(
                "{}({}): claimed for symbol {}",
                archive.path().display(),
                member.name,
                table.symbol(*id).name()
            );

            claims.push(MemberClaim {
                archive: archive_idx,
                offset,
                data: member.data,
                name: member.name.to_string(),
            });
        }

        if claims.is_empty() {
            if !alternates_applied {
                table.apply_alternate_names(alternates);
                alternates_applied = true;
                continue;
            }
            break;
        }

        let parsed: Vec<Result<LinkObject<'data>, LinkObjectParseError>> =
            claims.par_iter().map(|claim| LinkObject::parse(claim.data)).collect();

        let first_new = objects.len();
        for (claim, parse_result) in claims.iter().zip(parsed) {
            let archive_path = archives[claim.archive].path();
            let object = parse_result.map_err(|e| LibraryResolveError {
                archive: archive_path.clone(),
                member: Some(claim.name.clone()),
                kind: e.into(),
            })?;

            let display_name = member_display_name(archive_path, &claim.name);
            if !check_machine(object.machine(), machine, &display_name, diagnostics) {
                // Unclaim so a correct-machine archive can still win.
                claimed[claim.archive].remove(&claim.offset.0);
                continue;
            }

            objects.push(InputObject::new(display_name, true, object));
        }

        let new_range = first_new..objects.len();
        if !new_range.is_empty() {
            table.push_objects(objects, new_range, diagnostics);
        }
    }

    Ok(())
}

fn member_display_name(archive: &Path, member: &str) -> String {
    format!("{}({member})", archive.display())
}

fn lookup_archives<'data>(
    archives: &[PathedItem<PathBuf, LinkArchive<'data>>],
    name: &str,
) -> Option<(usize, object::read::archive::ArchiveOffset)> {
    archives
        .iter()
        .enumerate()
        .find_map(|(idx, archive)| archive.lookup(name).map(|offset| (idx, offset)))
}

/// Collects the symbols eligible for a library pass, in table order.
///
/// Each entry is `(id, lookup name, alias fallback name)`.
fn pending_symbols<'data>(
    table: &SymbolTable<'data>,
) -> Vec<(SymbolId, &'data str, Option<&'data str>)> {
    let mut pending = Vec::new();

    for (id, symbol) in table.iter() {
        if symbol.searched() {
            continue;
        }

        match symbol.kind() {
            SymbolKind::Undefined => pending.push((id, symbol.name(), None)),
            SymbolKind::Weak {
                fallback, search, ..
            } => {
                if matches!(
                    table.resolve(id),
                    crate::symtab::Resolution::Unresolved
                ) {
                    match search {
                        WeakSearch::NoLibrary => {}
                        WeakSearch::Library => pending.push((id, symbol.name(), None)),
                        WeakSearch::Alias => pending.push((id, symbol.name(), Some(fallback))),
                    }
                }
            }
            _ => {}
        }
    }

    pending
}

/// Reports symbols that are still unresolved after the fixed point.
///
/// References are gathered in one scan over the live relocations so the
/// per-symbol cap does not cost a pass per symbol. Relocations inside
/// removed sections do not count as references.
pub fn report_unresolved<'data>(
    objects: &[InputObject<'data>],
    table: &SymbolTable<'data>,
    liveness: &Liveness,
    diagnostics: &mut Diagnostics,
) {
    let max_refs = diagnostics.max_refs_per_symbol();
    let mut references: IndexMap<SymbolId, (Vec<String>, usize)> = IndexMap::new();

    for (obj_idx, input) in objects.iter().enumerate() {
        for (sect_idx, section) in input.object.sections().iter().enumerate() {
            if liveness.is_removed(obj_idx, sect_idx) {
                continue;
            }

            for reloc in section.relocs() {
                let Some(target) = input.object.symbol(reloc.symbol) else {
                    continue;
                };

                if !target.external {
                    continue;
                }

                let Some(id) = table.search(target.name) else {
                    continue;
                };

                if !matches!(table.resolve(id), crate::symtab::Resolution::Unresolved) {
                    continue;
                }

                let entry = references.entry(id).or_default();
                entry.1 += 1;
                if entry.0.len() < max_refs {
                    entry.0.push(format!(
                        "{}:({}+{:#x})",
                        input.name,
                        section.name(),
                        reloc.address
                    ));
                }
            }
        }
    }

    for (id, (refs, total)) in references {
        diagnostics.push_unresolved(table.symbol(id).name().to_string(), refs, total);
    }
}
