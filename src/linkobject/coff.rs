use num_enum::{IntoPrimitive, TryFromPrimitive};
use object::{
    LittleEndian as LE,
    coff::{CoffFile, ImageSymbol},
    pe::{
        IMAGE_COMDAT_SELECT_ANY, IMAGE_COMDAT_SELECT_ASSOCIATIVE, IMAGE_COMDAT_SELECT_EXACT_MATCH,
        IMAGE_COMDAT_SELECT_LARGEST, IMAGE_COMDAT_SELECT_NODUPLICATES,
        IMAGE_COMDAT_SELECT_SAME_SIZE, IMAGE_SCN_ALIGN_1BYTES, IMAGE_SCN_ALIGN_8192BYTES,
        IMAGE_SYM_ABSOLUTE, IMAGE_SYM_CLASS_FILE, IMAGE_SYM_DEBUG, IMAGE_WEAK_EXTERN_SEARCH_ALIAS,
        IMAGE_WEAK_EXTERN_SEARCH_LIBRARY, IMAGE_WEAK_EXTERN_SEARCH_NOLIBRARY,
    },
    read::{Object, ObjectSection, ObjectSymbol},
};

#[derive(Debug, Copy, Clone, thiserror::Error)]
#[error("invalid COMDAT selection ({0})")]
pub struct TryFromComdatSelectionError(u8);

/// COMDAT selection kinds from the auxiliary section definition record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[num_enum(error_type(name = TryFromComdatSelectionError, constructor = TryFromComdatSelectionError))]
#[repr(u8)]
pub enum ComdatSelection {
    NoDuplicates = IMAGE_COMDAT_SELECT_NODUPLICATES,
    Any = IMAGE_COMDAT_SELECT_ANY,
    SameSize = IMAGE_COMDAT_SELECT_SAME_SIZE,
    ExactMatch = IMAGE_COMDAT_SELECT_EXACT_MATCH,
    Associative = IMAGE_COMDAT_SELECT_ASSOCIATIVE,
    Largest = IMAGE_COMDAT_SELECT_LARGEST,
}

/// Section characteristic flags.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SectionFlags(u32);

bitflags::bitflags! {
    impl SectionFlags: u32 {
        const TypeNoPad = object::pe::IMAGE_SCN_TYPE_NO_PAD;
        const CntCode = object::pe::IMAGE_SCN_CNT_CODE;
        const CntInitializedData = object::pe::IMAGE_SCN_CNT_INITIALIZED_DATA;
        const CntUninitializedData = object::pe::IMAGE_SCN_CNT_UNINITIALIZED_DATA;
        const LnkInfo = object::pe::IMAGE_SCN_LNK_INFO;
        const LnkRemove = object::pe::IMAGE_SCN_LNK_REMOVE;
        const LnkComdat = object::pe::IMAGE_SCN_LNK_COMDAT;
        const MemDiscardable = object::pe::IMAGE_SCN_MEM_DISCARDABLE;
        const MemNotCached = object::pe::IMAGE_SCN_MEM_NOT_CACHED;
        const MemNotPaged = object::pe::IMAGE_SCN_MEM_NOT_PAGED;
        const MemShared = object::pe::IMAGE_SCN_MEM_SHARED;
        const MemExecute = object::pe::IMAGE_SCN_MEM_EXECUTE;
        const MemRead = object::pe::IMAGE_SCN_MEM_READ;
        const MemWrite = object::pe::IMAGE_SCN_MEM_WRITE;
        const _ = !0;
    }
}

impl SectionFlags {
    /// Returns the alignment from the `IMAGE_SCN_ALIGN_*` bits if set.
    pub fn alignment(&self) -> Option<u32> {
        let bits = self.bits() & (0xf << 20);
        (bits >= IMAGE_SCN_ALIGN_1BYTES && bits <= IMAGE_SCN_ALIGN_8192BYTES)
            .then(|| 1 << ((bits >> 20) - 1))
    }

    /// Returns the flags without the alignment bits set.
    pub fn zero_align(&self) -> SectionFlags {
        Self(self.bits() & !(0xf << 20))
    }
}

/// The section data.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SectionData<'data> {
    Initialized(&'data [u8]),
    Uninitialized(u32),
}

impl SectionData<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::Initialized(data) => data.len(),
            Self::Uninitialized(size) => *size as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A relocation record from an input section.
#[derive(Debug, Copy, Clone)]
pub struct InputReloc {
    /// Offset of the fixup location from the start of the section.
    pub address: u32,

    /// COFF symbol table index of the target symbol.
    pub symbol: usize,

    /// Raw machine-specific relocation type.
    pub typ: u16,
}

/// A decoded section from an input COFF.
#[derive(Debug)]
pub struct InputSection<'data> {
    name: &'data str,
    characteristics: SectionFlags,
    data: SectionData<'data>,
    relocs: Vec<InputReloc>,

    /// COMDAT selection from the auxiliary record of the section symbol.
    selection: Option<ComdatSelection>,

    /// Checksum from the auxiliary section record.
    checksum: u32,

    /// Parent section for `IMAGE_COMDAT_SELECT_ASSOCIATIVE` sections.
    associative: Option<usize>,
}

impl<'data> InputSection<'data> {
    pub fn name(&self) -> &'data str {
        self.name
    }

    /// Returns the section name without the `$` sort suffix.
    pub fn group_name(&self) -> &'data str {
        self.name.split_once('$').map_or(self.name, |(base, _)| base)
    }

    /// Returns the `$` sort suffix of the section name if it has one.
    pub fn sort_suffix(&self) -> Option<&'data str> {
        self.name.split_once('$').map(|(_, suffix)| suffix)
    }

    pub fn characteristics(&self) -> SectionFlags {
        self.characteristics
    }

    pub fn data(&self) -> SectionData<'data> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn relocs(&self) -> &[InputReloc] {
        &self.relocs
    }

    pub fn is_comdat(&self) -> bool {
        self.characteristics.contains(SectionFlags::LnkComdat)
    }

    pub fn selection(&self) -> Option<ComdatSelection> {
        self.selection
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn associative(&self) -> Option<usize> {
        self.associative
    }

    /// Returns the required alignment for this section's contribution.
    pub fn alignment(&self) -> u32 {
        self.characteristics.alignment().unwrap_or(1)
    }

    /// Returns `true` if this section is a debug information section.
    pub fn is_debug(&self) -> bool {
        self.name.starts_with(".debug")
    }
}

/// The weak external search hint from the auxiliary weak record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WeakSearch {
    /// Do not pull library members to resolve the symbol.
    NoLibrary,

    /// Library members may be pulled to resolve the symbol.
    Library,

    /// An alias; library members may be pulled, falling back to the
    /// default symbol's name.
    Alias,
}

impl From<u32> for WeakSearch {
    fn from(value: u32) -> Self {
        match value {
            IMAGE_WEAK_EXTERN_SEARCH_LIBRARY => Self::Library,
            IMAGE_WEAK_EXTERN_SEARCH_ALIAS => Self::Alias,
            IMAGE_WEAK_EXTERN_SEARCH_NOLIBRARY => Self::NoLibrary,
            _ => Self::NoLibrary,
        }
    }
}

/// Classification of a decoded input symbol.
#[derive(Debug, Copy, Clone)]
pub enum InputSymbolKind<'data> {
    /// Defined at an offset inside a section of the same object.
    Section { section: usize, offset: u32 },

    /// A common symbol; the value field holds the size.
    Common { size: u32 },

    /// An absolute value symbol.
    Absolute { value: u32 },

    /// A debug symbol.
    Debug,

    /// An undefined external reference.
    Undefined,

    /// A weak external with a default definition symbol.
    Weak {
        default_name: &'data str,

        /// Section and offset of the default symbol when it is a local
        /// definition inside the same object.
        default_local: Option<(usize, u32)>,

        search: WeakSearch,
    },
}

/// A decoded symbol record from an input COFF.
#[derive(Debug, Copy, Clone)]
pub struct InputSymbol<'data> {
    pub name: &'data str,
    pub external: bool,
    pub kind: InputSymbolKind<'data>,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkObjectParseError {
    #[error("{0}")]
    Object(#[from] object::read::Error),

    #[error("symbol {name} references invalid section number {number}")]
    SymbolSection { name: String, number: usize },

    #[error("COMDAT symbol {name}: {error}")]
    ComdatSelection {
        name: String,
        error: TryFromComdatSelectionError,
    },

    #[error("relocation in section {section} references invalid symbol index {symbol}")]
    RelocationTarget { section: String, symbol: usize },
}

/// A parsed relocatable COFF for linking.
///
/// Symbol slots are indexed by the COFF symbol table index so relocation
/// records resolve without renumbering. Auxiliary records occupy `None`
/// slots.
#[derive(Debug)]
pub struct LinkObject<'data> {
    machine: u16,
    sections: Vec<InputSection<'data>>,
    symbols: Vec<Option<InputSymbol<'data>>>,
}

impl<'data> LinkObject<'data> {
    /// Parses the data as a relocatable COFF.
    pub fn parse(data: &'data [u8]) -> Result<LinkObject<'data>, LinkObjectParseError> {
        let coff = CoffFile::<&[u8]>::parse(data)?;
        let symbol_table = coff.coff_symbol_table();
        let machine = coff.coff_header().machine.get(LE);

        let mut sections = Vec::with_capacity(coff.coff_section_table().len());
        for section in coff.sections() {
            let coff_section = section.coff_section();
            let characteristics =
                SectionFlags::from_bits_retain(coff_section.characteristics.get(LE));

            let data = if characteristics.contains(SectionFlags::CntUninitializedData) {
                SectionData::Uninitialized(coff_section.size_of_raw_data.get(LE))
            } else {
                SectionData::Initialized(section.data()?)
            };

            let section_name = section.name()?;
            let mut relocs = Vec::new();
            for reloc in section.coff_relocations()? {
                relocs.push(InputReloc {
                    address: reloc.virtual_address.get(LE),
                    symbol: reloc.symbol().0,
                    typ: reloc.typ.get(LE),
                });
            }

            sections.push(InputSection {
                name: section_name,
                characteristics,
                data,
                relocs,
                selection: None,
                checksum: 0,
                associative: None,
            });
        }

        let mut symbols: Vec<Option<InputSymbol<'data>>> = Vec::new();
        symbols.resize_with(symbol_table.len(), || None);

        for symbol in coff.symbols() {
            let coff_symbol = symbol.coff_symbol();
            let storage_class = coff_symbol.storage_class();

            if storage_class == IMAGE_SYM_CLASS_FILE {
                continue;
            }

            let name = symbol.name()?;
            let external = symbol.is_global();

            let kind = if symbol.is_weak() {
                let weak_aux = symbol_table.aux_weak_external(symbol.index())?;
                let default = coff.symbol_by_index(weak_aux.default_symbol())?;

                let default_local = if default.is_local() {
                    default
                        .section_index()
                        .map(|idx| (idx.0 - 1, default.coff_symbol().value()))
                } else {
                    None
                };

                InputSymbolKind::Weak {
                    default_name: default.name()?,
                    default_local,
                    search: WeakSearch::from(weak_aux.weak_search_type.get(LE)),
                }
            } else {
                match coff_symbol.section_number() {
                    IMAGE_SYM_ABSOLUTE => InputSymbolKind::Absolute {
                        value: coff_symbol.value(),
                    },
                    IMAGE_SYM_DEBUG => InputSymbolKind::Debug,
                    _ => match symbol.section_index() {
                        Some(section_index) => {
                            let section = section_index.0 - 1;
                            if section >= sections.len() {
                                return Err(LinkObjectParseError::SymbolSection {
                                    name: name.to_string(),
                                    number: section_index.0,
                                });
                            }

                            InputSymbolKind::Section {
                                section,
                                offset: coff_symbol.value(),
                            }
                        }
                        None => {
                            if symbol.is_common() {
                                InputSymbolKind::Common {
                                    size: coff_symbol.value(),
                                }
                            } else {
                                InputSymbolKind::Undefined
                            }
                        }
                    },
                }
            };

            if coff_symbol.has_aux_section() {
                if let Some(section_index) = symbol.section_index() {
                    let aux_section = symbol_table.aux_section(symbol.index())?;
                    let section = sections.get_mut(section_index.0 - 1).ok_or_else(|| {
                        LinkObjectParseError::SymbolSection {
                            name: name.to_string(),
                            number: section_index.0,
                        }
                    })?;

                    section.checksum = aux_section.check_sum.get(LE);

                    if section.is_comdat() {
                        let selection = ComdatSelection::try_from(aux_section.selection)
                            .map_err(|error| LinkObjectParseError::ComdatSelection {
                                name: name.to_string(),
                                error,
                            })?;

                        if selection == ComdatSelection::Associative {
                            section.associative =
                                Some(aux_section.number.get(LE).saturating_sub(1) as usize);
                        }

                        section.selection = Some(selection);
                    }
                }
            }

            symbols[symbol.index().0] = Some(InputSymbol {
                name,
                external,
                kind,
            });
        }

        // Relocation targets must resolve to decoded symbol slots.
        for section in &sections {
            for reloc in &section.relocs {
                if symbols.get(reloc.symbol).is_none_or(|slot| slot.is_none()) {
                    return Err(LinkObjectParseError::RelocationTarget {
                        section: section.name.to_string(),
                        symbol: reloc.symbol,
                    });
                }
            }
        }

        Ok(Self {
            machine,
            sections,
            symbols,
        })
    }

    /// Returns the COFF machine value from the file header.
    pub fn machine(&self) -> u16 {
        self.machine
    }

    pub fn sections(&self) -> &[InputSection<'data>] {
        &self.sections
    }

    pub fn section(&self, idx: usize) -> Option<&InputSection<'data>> {
        self.sections.get(idx)
    }

    /// Returns the symbol at the COFF symbol table index.
    pub fn symbol(&self, idx: usize) -> Option<&InputSymbol<'data>> {
        self.symbols.get(idx).and_then(|slot| slot.as_ref())
    }

    /// Iterates over the decoded symbols with their COFF table indices.
    pub fn symbols(&self) -> impl Iterator<Item = (usize, &InputSymbol<'data>)> {
        self.symbols
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|symbol| (idx, symbol)))
    }

    /// Number of COFF symbol table slots, including auxiliary records.
    pub fn symbol_slots(&self) -> usize {
        self.symbols.len()
    }
}
