use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use indexmap::IndexSet;
use log::debug;

use crate::pathed_item::PathedItem;

/// A link library read into memory.
pub type FoundLibrary = PathedItem<PathBuf, Vec<u8>>;

/// Locates link libraries by name.
pub trait LibraryFind {
    fn find_library(&self, name: impl AsRef<str>) -> Result<FoundLibrary, LibsearchError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LibsearchError {
    #[error("unable to find library {0}")]
    NotFound(String),

    #[error("could not open link library {}: {error}", .path.display())]
    Io {
        path: PathBuf,
        error: std::io::Error,
    },
}

/// Candidate file names for a library name. A name that already carries
/// an extension is looked up verbatim, a bare name gets the usual
/// import and static library decorations.
fn candidate_filenames(name: &str) -> Vec<String> {
    if Path::new(name).extension().is_some() {
        return vec![name.to_string()];
    }

    vec![
        format!("{name}.lib"),
        format!("lib{name}.lib"),
        format!("lib{name}.a"),
        format!("{name}.a"),
    ]
}

/// Filesystem library searcher over an ordered set of directories.
#[derive(Default)]
pub struct LibrarySearcher {
    search_paths: IndexSet<PathBuf>,
}

impl LibrarySearcher {
    pub fn new() -> LibrarySearcher {
        Default::default()
    }

    /// Appends directories to the search order.
    pub fn extend_search_paths<I, P>(&mut self, search_paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.search_paths
            .extend(search_paths.into_iter().map(Into::into));
    }

    fn try_open(&self, path: PathBuf) -> Option<Result<FoundLibrary, LibsearchError>> {
        match std::fs::read(&path) {
            Ok(data) => Some(Ok(FoundLibrary::new(path, data))),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!("attempt to open {} failed ({error})", path.display());
                None
            }
            Err(error) => Some(Err(LibsearchError::Io { path, error })),
        }
    }
}

impl LibraryFind for LibrarySearcher {
    fn find_library(&self, name: impl AsRef<str>) -> Result<FoundLibrary, LibsearchError> {
        let name = name.as_ref();
        let filenames = candidate_filenames(name);

        for search_path in &self.search_paths {
            for filename in &filenames {
                if let Some(result) = self.try_open(search_path.join(filename)) {
                    return result;
                }
            }
        }

        Err(LibsearchError::NotFound(name.to_string()))
    }
}
