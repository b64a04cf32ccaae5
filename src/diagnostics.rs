//! Accumulated link diagnostics.
//!
//! The pipeline collects recoverable input errors into a [`Diagnostics`]
//! value threaded through every pass and fails after the full link has
//! run, so one bad input reports everything wrong with it at once.

/// Default cap for the number of undefined symbols reported.
pub const DEFAULT_MAX_UNRESOLVED_REPORTS: usize = 10;

/// Default cap for the number of references listed per undefined symbol.
pub const DEFAULT_MAX_REFS_PER_SYMBOL: usize = 5;

/// Returns a printable name for a COFF machine value.
pub fn machine_name(machine: u16) -> &'static str {
    match machine {
        object::pe::IMAGE_FILE_MACHINE_AMD64 => "x86-64",
        object::pe::IMAGE_FILE_MACHINE_I386 => "i386",
        object::pe::IMAGE_FILE_MACHINE_UNKNOWN => "unknown",
        _ => "unsupported",
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkDiagnostic {
    #[error("{0}")]
    Duplicate(DuplicateSymbolError),

    #[error("{0}")]
    Unresolved(UnresolvedSymbolError),

    #[error(
        "{object}: machine type {} is incompatible with target machine {}",
        machine_name(*.found),
        machine_name(*.expected)
    )]
    IncompatibleMachine {
        object: String,
        expected: u16,
        found: u16,
    },

    #[error("{object}: relocation in {section}+{address:#x} targets discarded section {target}")]
    RemovedReloc {
        object: String,
        section: String,
        address: u32,
        target: String,
    },

    #[error("entry point symbol {0} is not defined")]
    EntryPointNotFound(String),

    #[error("{object}: relocation in {section}+{address:#x} is outside of the section data")]
    RelocBounds {
        object: String,
        section: String,
        address: u32,
    },

    #[error("{object}: unsupported relocation type {typ:#x} in {section}+{address:#x}")]
    UnsupportedReloc {
        object: String,
        section: String,
        address: u32,
        typ: u16,
    },

    #[error("{object}: relocation in {section}+{address:#x} overflows 32 bits ({value:#x})")]
    RelocOverflow {
        object: String,
        section: String,
        address: u32,
        value: u64,
    },
}

#[derive(Debug, thiserror::Error)]
pub struct DuplicateSymbolError {
    pub name: String,
    pub locations: Vec<String>,
}

impl std::fmt::Display for DuplicateSymbolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "duplicate symbol: {}", self.name)?;

        let mut location_iter = self.locations.iter();

        for location in location_iter.by_ref().take(5) {
            write!(f, "\n>>> defined at {location}")?;
        }

        let remaining = location_iter.count();
        if remaining > 0 {
            write!(f, "\n>>> defined {remaining} more times")?;
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub struct UnresolvedSymbolError {
    pub name: String,
    pub references: Vec<String>,
    pub remaining: usize,
}

impl std::fmt::Display for UnresolvedSymbolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "undefined symbol: {}", self.name)?;

        for reference in &self.references {
            write!(f, "\n>>> referenced by {reference}")?;
        }

        if self.remaining > 0 {
            write!(f, "\n>>> referenced {} more times", self.remaining)?;
        }

        Ok(())
    }
}

/// Accumulated diagnostics for a link run.
pub struct Diagnostics {
    errors: Vec<LinkDiagnostic>,

    /// Cap on reported undefined symbols.
    max_unresolved_reports: usize,

    /// Cap on the reference list length per undefined symbol.
    max_refs_per_symbol: usize,

    /// Undefined symbols seen past the report cap.
    unresolved_suppressed: usize,
}

impl Diagnostics {
    pub fn new(max_unresolved_reports: usize, max_refs_per_symbol: usize) -> Diagnostics {
        Self {
            errors: Vec::new(),
            max_unresolved_reports,
            max_refs_per_symbol,
            unresolved_suppressed: 0,
        }
    }

    pub fn max_refs_per_symbol(&self) -> usize {
        self.max_refs_per_symbol
    }

    pub fn push(&mut self, diagnostic: LinkDiagnostic) {
        self.errors.push(diagnostic);
    }

    pub fn extend(&mut self, diagnostics: impl IntoIterator<Item = LinkDiagnostic>) {
        self.errors.extend(diagnostics);
    }

    /// Records an undefined symbol, honoring the report caps. The
    /// reference list should already be deduplicated; `total_refs` is the
    /// full reference count before capping.
    pub fn push_unresolved(&mut self, name: String, references: Vec<String>, total_refs: usize) {
        let unresolved_count = self
            .errors
            .iter()
            .filter(|e| matches!(e, LinkDiagnostic::Unresolved(_)))
            .count();

        if unresolved_count >= self.max_unresolved_reports {
            self.unresolved_suppressed += 1;
            return;
        }

        let mut references = references;
        references.truncate(self.max_refs_per_symbol);
        let remaining = total_refs.saturating_sub(references.len());

        self.errors
            .push(LinkDiagnostic::Unresolved(UnresolvedSymbolError {
                name,
                references,
                remaining,
            }));
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[LinkDiagnostic] {
        &self.errors
    }

    pub fn finish(self) -> Result<(), LinkDiagnostics> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(LinkDiagnostics {
                errors: self.errors,
                unresolved_suppressed: self.unresolved_suppressed,
            })
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UNRESOLVED_REPORTS, DEFAULT_MAX_REFS_PER_SYMBOL)
    }
}

/// The full error set from a failed link.
#[derive(Debug, thiserror::Error)]
pub struct LinkDiagnostics {
    errors: Vec<LinkDiagnostic>,
    unresolved_suppressed: usize,
}

impl LinkDiagnostics {
    pub fn errors(&self) -> &[LinkDiagnostic] {
        &self.errors
    }
}

impl std::fmt::Display for LinkDiagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut error_iter = self.errors.iter();

        let Some(first_error) = error_iter.next() else {
            return Ok(());
        };

        first_error.fmt(f)?;

        for error in error_iter {
            write!(f, "\n{error}")?;
        }

        if self.unresolved_suppressed > 0 {
            write!(
                f,
                "\n{} undefined symbols were not reported",
                self.unresolved_suppressed
            )?;
        }

        Ok(())
    }
}
