use std::{collections::HashMap, path::PathBuf};

use pelink::libsearch::{FoundLibrary, LibraryFind, LibsearchError};

/// Serves archives from memory instead of the filesystem.
pub struct MemoryArchiveSearcher {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryArchiveSearcher {
    pub fn new() -> MemoryArchiveSearcher {
        Self {
            files: HashMap::new(),
        }
    }

    pub fn add_library(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.files.insert(name.into(), data);
    }
}

impl LibraryFind for MemoryArchiveSearcher {
    fn find_library(&self, name: impl AsRef<str>) -> Result<FoundLibrary, LibsearchError> {
        self.files
            .get(name.as_ref())
            .map(|data| FoundLibrary::new(PathBuf::from(name.as_ref()), data.clone()))
            .ok_or(LibsearchError::NotFound(name.as_ref().to_string()))
    }
}
