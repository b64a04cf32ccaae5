use std::path::PathBuf;

use crate::{
    diagnostics::LinkDiagnostics,
    libsearch::LibsearchError,
    linkobject::{archive::LinkArchiveParseError, coff::LinkObjectParseError},
    resolve::LibraryResolveError,
};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("{0}")]
    Setup(LinkerSetupErrors),

    #[error("{0}")]
    Diagnostics(LinkDiagnostics),

    #[error("{0}")]
    Resolve(#[from] LibraryResolveError),

    #[error("no input files")]
    NoInput,

    #[error("could not detect target machine")]
    MachineDetect,
}

#[derive(Debug, thiserror::Error)]
#[error("{}", display_vec(.0))]
pub struct LinkerSetupErrors(pub(super) Vec<LinkerSetupError>);

impl LinkerSetupErrors {
    pub fn errors(&self) -> &[LinkerSetupError] {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkerSetupError {
    #[error("{0}")]
    Path(LinkerSetupPathError),

    #[error("{0}")]
    Library(LibsearchError),
}

#[derive(Debug, thiserror::Error)]
#[error("{}: {error}", .path.display())]
pub struct LinkerSetupPathError {
    pub path: PathBuf,
    pub error: LinkerPathErrorKind,
}

impl LinkerSetupPathError {
    pub fn new(
        path: impl Into<PathBuf>,
        error: impl Into<LinkerPathErrorKind>,
    ) -> LinkerSetupPathError {
        Self {
            path: path.into(),
            error: error.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkerPathErrorKind {
    #[error("{0}")]
    ArchiveParse(#[from] LinkArchiveParseError),

    #[error("{0}")]
    ObjectParse(#[from] LinkObjectParseError),
}

struct DisplayVec<'a, T: std::fmt::Display>(&'a Vec<T>);

impl<'a, T: std::fmt::Display> std::fmt::Display for DisplayVec<'a, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut value_iter = self.0.iter();

        let first_value = match value_iter.next() {
            Some(v) => v,
            None => return Ok(()),
        };

        first_value.fmt(f)?;

        for val in value_iter {
            write!(f, "\n{val}")?;
        }

        Ok(())
    }
}

fn display_vec<T: std::fmt::Display>(errors: &Vec<T>) -> DisplayVec<'_, T> {
    DisplayVec(errors)
}
