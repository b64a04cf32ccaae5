use indexmap::IndexMap;
use object::read::archive::{ArchiveFile, ArchiveOffset};

#[derive(Debug, thiserror::Error)]
pub enum LinkArchiveParseError {
    #[error("thin archives are not supported")]
    ThinArchive,

    #[error("archive is missing a symbol table")]
    NoSymbolMap,

    #[error("{0}")]
    Object(#[from] object::read::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractMemberError {
    #[error("archive member name is invalid: {0}")]
    MemberName(std::str::Utf8Error),

    #[error("{0}")]
    Object(#[from] object::read::Error),
}

/// A member extracted from a [`LinkArchive`].
pub struct ExtractedMember<'data> {
    /// The member name from the archive header.
    pub name: &'data str,

    /// The raw member file data.
    pub data: &'data [u8],
}

/// A parsed archive file for linking.
///
/// The symbol map is materialized up front so lookups can run from
/// multiple worker threads without interior mutability.
pub struct LinkArchive<'data> {
    /// The parsed archive file.
    archive_file: ArchiveFile<'data>,

    /// Symbol map from the archive symbol index. The first entry for a
    /// name wins, matching the linker search order of the index.
    symbol_map: IndexMap<&'data str, ArchiveOffset>,

    /// The archive file data.
    archive_data: &'data [u8],
}

impl<'data> LinkArchive<'data> {
    /// Parses the data.
    pub fn parse(data: &'data [u8]) -> Result<LinkArchive<'data>, LinkArchiveParseError> {
        let archive_file = ArchiveFile::parse(data)?;

        if archive_file.is_thin() {
            return Err(LinkArchiveParseError::ThinArchive);
        }

        let symbols = archive_file
            .symbols()?
            .ok_or(LinkArchiveParseError::NoSymbolMap)?;

        let mut symbol_map = IndexMap::with_capacity(symbols.size_hint().1.unwrap_or(0));
        for archive_symbol in symbols.flatten() {
            let Ok(name) = std::str::from_utf8(archive_symbol.name()) else {
                continue;
            };

            symbol_map.entry(name).or_insert(archive_symbol.offset());
        }

        Ok(Self {
            archive_file,
            symbol_map,
            archive_data: data,
        })
    }

    /// Looks up a symbol in the archive symbol index.
    pub fn lookup(&self, symbol: &str) -> Option<ArchiveOffset> {
        self.symbol_map.get(symbol).copied()
    }

    /// Extracts the member at the specified offset.
    pub fn extract_member(
        &self,
        offset: ArchiveOffset,
    ) -> Result<ExtractedMember<'data>, ExtractMemberError> {
        let member = self.archive_file.member(offset)?;
        let name =
            std::str::from_utf8(member.name()).map_err(ExtractMemberError::MemberName)?;
        let data = member.data(self.archive_data)?;

        Ok(ExtractedMember { name, data })
    }
}
