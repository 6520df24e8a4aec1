//! Structures and parsers for COFF objects, short import headers, and
//! (for round-trip checks) PE images.
//!
//! See the Microsoft PE/COFF specification.

use crate::{
    consts::{self as c, Machine, SectionFlags, StorageClass},
    idx::{define_idx, ElfIndexExt, ToIdxUsize},
};
use bstr::BStr;

use std::{fmt::Debug, mem};

use bytemuck::{Pod, PodCastError, Zeroable};

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoffReadError {
    #[error("the file is too small for a COFF file header")]
    FileTooSmall,
    #[error("an index into {2} is out of bounds. Expected at least {0} bytes, found {1} bytes")]
    RegionOutOfBounds(usize, usize, String),
    #[error("the input is not aligned in memory. Expected align {0}, found align {1}")]
    UnalignedInput(usize, usize),
    #[error("an index is out of bounds: {0}: {1}")]
    IndexOutOfBounds(&'static str, usize),
    #[error("string in string table does not end with a nul terminator: offset {0}")]
    NoStringNulTerm(usize),
    #[error("the {0} with the name {1:?} was not found")]
    NotFoundByName(&'static str, Vec<u8>),
    #[error("not a short import header (bad sig1/sig2: {0:x},{1:x})")]
    NotAShortImport(u16, u16),
    #[error("not a PE image (missing MZ/PE signature)")]
    NotAPeImage,
}

pub type Result<T> = std::result::Result<T, CoffReadError>;

define_idx! {
    pub struct SymIdx(u32);
}

/// `IMAGE_FILE_HEADER`.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct CoffHeader {
    pub machine: c::Machine,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: c::Characteristics,
}

/// `IMAGE_SECTION_HEADER`.
#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: c::SectionFlags,
}

impl Debug for SectionHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectionHeader")
            .field("name", &BStr::new(&self.name))
            .field("size_of_raw_data", &self.size_of_raw_data)
            .field("characteristics", &self.characteristics)
            .finish()
    }
}

/// `IMAGE_SYMBOL`, the fixed 18-byte record. A short name (<= 8 bytes) is
/// stored inline; a long name is `[0, 0, 0, 0, offset: u32]` into the
/// string table that directly follows the symbol table.
#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct Symbol {
    pub name: [u8; 8],
    pub value: u32,
    pub section_number: i16,
    pub r#type: u16,
    pub storage_class: c::StorageClass,
    pub number_of_aux_symbols: u8,
}

impl Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Symbol")
            .field("value", &self.value)
            .field("section_number", &self.section_number)
            .field("storage_class", &self.storage_class)
            .field("number_of_aux_symbols", &self.number_of_aux_symbols)
            .finish()
    }
}

impl Symbol {
    pub fn is_long_name(&self) -> bool {
        self.name[0..4] == [0, 0, 0, 0]
    }

    pub fn long_name_offset(&self) -> u32 {
        u32::from_le_bytes(self.name[4..8].try_into().unwrap())
    }

    pub fn is_weak_external(&self) -> bool {
        self.storage_class == c::IMAGE_SYM_CLASS_WEAK_EXTERNAL
    }
}

/// `IMAGE_RELOCATION`.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct Relocation {
    pub virtual_address: u32,
    pub symbol_table_index: u32,
    pub r#type: u16,
}

/// A raw COFF object (`.obj`, or a member of a static `.lib`/`.a`).
#[derive(Debug, Clone, Copy)]
pub struct CoffReader<'a> {
    pub data: &'a [u8],
}

impl<'a> CoffReader<'a> {
    /// Create a reader over a COFF object. Unlike ELF, COFF objects carry no
    /// magic bytes of their own; callers that also accept archives or short
    /// import headers must branch on those first (see `is_short_import`,
    /// `elven_parser::archive::ARMAG`).
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < mem::size_of::<CoffHeader>() {
            return Err(CoffReadError::FileTooSmall);
        }
        Ok(CoffReader { data })
    }

    pub fn header(&self) -> Result<&'a CoffHeader> {
        load_ref(self.data, "COFF header")
    }

    pub fn section_headers(&self) -> Result<&'a [SectionHeader]> {
        let header = self.header()?;
        let offset = mem::size_of::<CoffHeader>() + header.size_of_optional_header as usize;
        let data = self
            .data
            .get_elf(offset.., "section header table offset")?;
        load_slice(
            data,
            header.number_of_sections as usize,
            "section headers",
        )
    }

    pub fn section_header(&self, idx: usize) -> Result<&'a SectionHeader> {
        self.section_headers()?.get_elf(idx, "section number")
    }

    pub fn section_content(&self, sh: &SectionHeader) -> Result<&'a [u8]> {
        if sh.characteristics.contains(c::IMAGE_SCN_CNT_UNINITIALIZED_DATA)
            || sh.pointer_to_raw_data == 0
        {
            return Ok(&[]);
        }
        self.data
            .get_elf((sh.pointer_to_raw_data as usize).., "section offset")?
            .get_elf(..sh.size_of_raw_data as u64, "section size")
    }

    pub fn section_relocations(&self, sh: &SectionHeader) -> Result<&'a [Relocation]> {
        if sh.number_of_relocations == 0 {
            return Ok(&[]);
        }
        let data = self
            .data
            .get_elf((sh.pointer_to_relocations as usize).., "relocation offset")?;
        load_slice(
            data,
            sh.number_of_relocations as usize,
            "section relocations",
        )
    }

    pub fn symbols(&self) -> Result<&'a [Symbol]> {
        let header = self.header()?;
        if header.number_of_symbols == 0 {
            return Ok(&[]);
        }
        let data = self
            .data
            .get_elf((header.pointer_to_symbol_table as usize).., "symbol table offset")?;
        load_slice(data, header.number_of_symbols as usize, "symbols")
    }

    pub fn symbol(&self, idx: SymIdx) -> Result<&'a Symbol> {
        self.symbols()?.get_elf(idx, "symbol index")
    }

    /// The string table directly follows the symbol table: a leading `u32`
    /// total-size (itself included), then NUL-terminated strings.
    pub fn string_table(&self) -> Result<&'a [u8]> {
        let header = self.header()?;
        let symtab_end = header.pointer_to_symbol_table as usize
            + header.number_of_symbols as usize * mem::size_of::<Symbol>();
        let size_bytes = self
            .data
            .get_elf(symtab_end.., "string table size")?
            .get_elf(..4u64, "string table size")?;
        let size = u32::from_le_bytes(size_bytes.try_into().unwrap()) as usize;
        self.data.get_elf(symtab_end.., "string table")?.get_elf(..size as u64, "string table")
    }

    pub fn symbol_name(&self, sym: &Symbol) -> Result<&'a BStr> {
        if sym.is_long_name() {
            let offset = sym.long_name_offset() as usize;
            let table = self.string_table()?;
            let indexed = table.get_elf(offset.., "symbol name offset")?;
            let end = indexed
                .iter()
                .position(|&b| b == 0)
                .ok_or(CoffReadError::NoStringNulTerm(offset))?;
            Ok(BStr::new(&indexed[..end]))
        } else {
            let end = sym.name.iter().position(|&b| b == 0).unwrap_or(8);
            Ok(BStr::new(&sym.name[..end]))
        }
    }

    pub fn section_header_by_name(&self, name: &[u8]) -> Result<&'a SectionHeader> {
        for sh in self.section_headers()? {
            if short_section_name(&sh.name) == name {
                return Ok(sh);
            }
        }
        Err(CoffReadError::NotFoundByName("section", name.to_vec()))
    }
}

fn short_section_name(name: &[u8; 8]) -> &[u8] {
    let end = name.iter().position(|&b| b == 0).unwrap_or(8);
    &name[..end]
}

// ------------------
// Short import header (archive member produced by `lib.exe`/`llvm-lib`
// for a symbol exported by name-only, i.e. not a full COFF object).
// ------------------

/// `IMPORT_OBJECT_HEADER`, fixed 20-byte prefix; followed by
/// `name\0dll_name\0`.
#[derive(Debug, Clone)]
pub struct ShortImport<'a> {
    pub machine: Machine,
    pub ordinal_or_hint: u16,
    pub import_type: c::ImportType,
    pub name_type: c::ImportNameType,
    pub symbol_name: &'a BStr,
    pub dll_name: &'a BStr,
}

#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C)]
struct ShortImportHeader {
    sig1: u16,
    sig2: u16,
    version: u16,
    machine: u16,
    time_date_stamp: u32,
    size_of_data: u32,
    ordinal_or_hint: u16,
    flags: u16,
}

pub fn is_short_import(data: &[u8]) -> bool {
    data.len() >= mem::size_of::<ShortImportHeader>()
        && u16::from_le_bytes([data[0], data[1]]) == 0
        && u16::from_le_bytes([data[2], data[3]]) == c::IMPORT_OBJECT_HDR_SIG2
}

impl<'a> ShortImport<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let header: &ShortImportHeader = load_ref(data, "short import header")?;
        if header.sig1 != 0 || header.sig2 != c::IMPORT_OBJECT_HDR_SIG2 {
            return Err(CoffReadError::NotAShortImport(header.sig1, header.sig2));
        }

        let names = data.get_elf(mem::size_of::<ShortImportHeader>().., "import names")?;
        let names = names.get_elf(..header.size_of_data as u64, "import names")?;

        let sym_end = names
            .iter()
            .position(|&b| b == 0)
            .ok_or(CoffReadError::NoStringNulTerm(0))?;
        let symbol_name = BStr::new(&names[..sym_end]);

        let dll_start = sym_end + 1;
        let dll_rest = names.get_elf(dll_start.., "import dll name")?;
        let dll_end = dll_rest
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(dll_rest.len());
        let dll_name = BStr::new(&dll_rest[..dll_end]);

        let ty = header.flags & 0x3;
        let name_type = (header.flags >> 2) & 0x7;

        Ok(ShortImport {
            machine: Machine(header.machine),
            ordinal_or_hint: header.ordinal_or_hint,
            import_type: c::ImportType(ty),
            name_type: c::ImportNameType(name_type),
            symbol_name,
            dll_name,
        })
    }
}

fn load_ref<'a, T: Pod>(data: &'a [u8], kind: impl Into<String>) -> Result<&'a T> {
    load_slice(data, 1, kind).map(|slice| &slice[0])
}

pub(crate) fn load_slice<'a, T: Pod>(
    data: &'a [u8],
    amount_of_elems: usize,
    kind: impl Into<String>,
) -> Result<&'a [T]> {
    let size = mem::size_of::<T>() * amount_of_elems;
    let align = mem::align_of::<T>();

    if data.len() < size {
        return Err(CoffReadError::RegionOutOfBounds(
            size,
            data.len(),
            kind.into(),
        ));
    }

    let data_addr = (data as *const [u8]).cast::<u8>() as usize;
    let data_align = data_addr.trailing_zeros() as usize;

    let data = &data[..size];

    bytemuck::try_cast_slice::<_, T>(data).map_err(|e| match e {
        e @ (PodCastError::SizeMismatch
        | PodCastError::OutputSliceWouldHaveSlop
        | PodCastError::AlignmentMismatch) => {
            unreachable!("already checked for these errors: {e}")
        }
        PodCastError::TargetAlignmentGreaterAndInputNotAligned => {
            CoffReadError::UnalignedInput(align, data_align)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_import_header_roundtrip() {
        let mut data = Vec::new();
        data.extend_from_slice(&0u16.to_le_bytes()); // sig1
        data.extend_from_slice(&c::IMPORT_OBJECT_HDR_SIG2.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes()); // version
        data.extend_from_slice(&c::IMAGE_FILE_MACHINE_AMD64.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // timestamp
        let names = b"ExitProcess\0kernel32.dll\0";
        data.extend_from_slice(&(names.len() as u32).to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes()); // ordinal/hint
        let ty = c::IMPORT_CODE;
        let name_type = c::IMPORT_NAME;
        data.extend_from_slice(&((ty & 0x3) | ((name_type & 0x7) << 2)).to_le_bytes());
        data.extend_from_slice(names);

        assert!(is_short_import(&data));
        let import = ShortImport::parse(&data).unwrap();
        assert_eq!(import.symbol_name.as_bytes(), b"ExitProcess");
        assert_eq!(import.dll_name.as_bytes(), b"kernel32.dll");
        assert_eq!(import.machine, c::IMAGE_FILE_MACHINE_AMD64);
    }
}
