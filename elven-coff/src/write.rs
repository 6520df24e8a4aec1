//! PE32+ image writer. PE32 (32-bit) output is not implemented; `elven-wald`
//! only targets AMD64/i386 per the machine scope this crate commits to.

use std::io::{self, Write};
use std::mem::size_of;
use std::num::NonZeroU64;

use bytemuck::Pod;

use crate::consts::{self as c, DllCharacteristics, Machine, SectionFlags, Subsystem};

#[derive(Debug, thiserror::Error)]
pub enum WriteCoffError {
    #[error("too many {0}")]
    TooMany(&'static str),
    #[error("writer IO error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, WriteCoffError>;

#[derive(Debug, Clone)]
pub struct Header {
    pub machine: Machine,
    pub subsystem: Subsystem,
    pub dll_characteristics: DllCharacteristics,
    pub image_base: u64,
    pub is_dll: bool,
    /// Sets `IMAGE_FILE_RELOCS_STRIPPED`: the image carries no base
    /// relocation table and cannot be rebased from `image_base`.
    pub relocations_stripped: bool,
    pub stack_reserve: u64,
    pub stack_commit: u64,
    pub heap_reserve: u64,
    pub heap_commit: u64,
}

#[derive(Debug, Clone)]
pub struct Section {
    /// Truncated to 8 bytes on write; longer names need a `/offset` string
    /// table entry, which this writer does not emit (linker output section
    /// names are always short).
    pub name: [u8; 8],
    pub characteristics: SectionFlags,
    /// RVA, set by the address assigner before `write()` runs.
    pub rva: u32,
    pub content: Vec<u8>,
    /// Overrides `VirtualSize` when set: the in-memory extent of a
    /// `.bss`-style section is larger than its (empty) file content.
    pub logical_size: Option<u32>,
}

impl Section {
    fn virtual_size(&self) -> u32 {
        self.logical_size.unwrap_or(self.content.len() as u32)
    }
}

pub struct PeWriter {
    header: Header,
    sections: Vec<Section>,
    entry_rva: u32,
    data_directories: [(u32, u32); c::IMAGE_NUMBEROF_DIRECTORY_ENTRIES],
}

impl PeWriter {
    pub fn new(header: Header) -> Self {
        PeWriter {
            header,
            sections: Vec::new(),
            entry_rva: 0,
            data_directories: [(0, 0); c::IMAGE_NUMBEROF_DIRECTORY_ENTRIES],
        }
    }

    pub fn set_entry_rva(&mut self, rva: u32) {
        self.entry_rva = rva;
    }

    pub fn set_data_directory(&mut self, index: usize, rva: u32, size: u32) {
        self.data_directories[index] = (rva, size);
    }

    pub fn add_section(&mut self, section: Section) -> Result<u32> {
        let idx = self.sections.len();
        self.sections.push(section);
        idx.try_into()
            .map_err(|_| WriteCoffError::TooMany("sections"))
    }

    pub fn section_mut(&mut self, idx: usize) -> &mut Section {
        &mut self.sections[idx]
    }

    fn section_alignment(&self) -> u32 {
        c::DEFAULT_SECTION_ALIGNMENT
    }

    fn file_alignment(&self) -> u32 {
        c::DEFAULT_FILE_ALIGNMENT
    }

    /// Lays sections out back to back in virtual-address order, returning
    /// the file offset assigned to each and the final `SizeOfImage`.
    fn layout(&self) -> (Vec<u32>, u32, u32) {
        let headers_size = align_up(self.headers_size(), self.file_alignment());
        let mut file_offset = headers_size;
        let mut file_offsets = Vec::with_capacity(self.sections.len());
        let mut size_of_image = align_up(headers_size, self.section_alignment());

        for section in &self.sections {
            file_offsets.push(file_offset);
            file_offset += align_up(section.content.len() as u32, self.file_alignment());
            let section_end = align_up(
                section.rva + section.virtual_size().max(1),
                self.section_alignment(),
            );
            size_of_image = size_of_image.max(section_end);
        }

        (file_offsets, headers_size, size_of_image)
    }

    fn headers_size(&self) -> u32 {
        headers_size_for(self.sections.len())
    }

    pub fn write(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();

        write_dos_stub(&mut out);
        out.extend_from_slice(c::PE_SIGNATURE);

        let (file_offsets, _headers_size, size_of_image) = self.layout();

        let coff_header = CoffFileHeader {
            machine: self.header.machine.0,
            number_of_sections: self
                .sections
                .len()
                .try_into()
                .map_err(|_| WriteCoffError::TooMany("sections"))?,
            time_date_stamp: 0,
            pointer_to_symbol_table: 0,
            number_of_symbols: 0,
            size_of_optional_header: size_of::<OptionalHeader64>() as u16,
            characteristics: {
                let mut flags = if self.header.is_dll {
                    c::IMAGE_FILE_EXECUTABLE_IMAGE | c::IMAGE_FILE_DLL | c::IMAGE_FILE_LARGE_ADDRESS_AWARE
                } else {
                    c::IMAGE_FILE_EXECUTABLE_IMAGE | c::IMAGE_FILE_LARGE_ADDRESS_AWARE
                };
                if self.header.relocations_stripped {
                    flags |= c::IMAGE_FILE_RELOCS_STRIPPED;
                }
                flags
            },
        };
        write_pod(&coff_header, &mut out);

        let size_of_headers = align_up(self.headers_size(), self.file_alignment());

        let optional_header = OptionalHeader64 {
            magic: c::IMAGE_NT_OPTIONAL_HDR64_MAGIC,
            major_linker_version: 0,
            minor_linker_version: 0,
            size_of_code: sum_sections(&self.sections, c::IMAGE_SCN_CNT_CODE),
            size_of_initialized_data: sum_sections(&self.sections, c::IMAGE_SCN_CNT_INITIALIZED_DATA),
            size_of_uninitialized_data: sum_sections(
                &self.sections,
                c::IMAGE_SCN_CNT_UNINITIALIZED_DATA,
            ),
            address_of_entry_point: self.entry_rva,
            base_of_code: self
                .sections
                .iter()
                .find(|s| s.characteristics.contains(c::IMAGE_SCN_CNT_CODE))
                .map(|s| s.rva)
                .unwrap_or(0),
            image_base: self.header.image_base,
            section_alignment: self.section_alignment(),
            file_alignment: self.file_alignment(),
            major_os_version: 6,
            minor_os_version: 0,
            major_image_version: 0,
            minor_image_version: 0,
            major_subsystem_version: 6,
            minor_subsystem_version: 0,
            win32_version_value: 0,
            size_of_image,
            size_of_headers,
            checksum: 0,
            subsystem: self.header.subsystem.0,
            dll_characteristics: self.header.dll_characteristics.0,
            size_of_stack_reserve: self.header.stack_reserve,
            size_of_stack_commit: self.header.stack_commit,
            size_of_heap_reserve: self.header.heap_reserve,
            size_of_heap_commit: self.header.heap_commit,
            loader_flags: 0,
            number_of_rva_and_sizes: c::IMAGE_NUMBEROF_DIRECTORY_ENTRIES as u32,
        };
        write_pod(&optional_header, &mut out);

        for (rva, size) in self.data_directories {
            write_pod(&rva, &mut out);
            write_pod(&size, &mut out);
        }

        for (section, &file_offset) in self.sections.iter().zip(&file_offsets) {
            let raw_size = align_up(section.content.len() as u32, self.file_alignment());
            let raw = RawSectionHeader {
                name: section.name,
                virtual_size: section.virtual_size(),
                virtual_address: section.rva,
                size_of_raw_data: raw_size,
                pointer_to_raw_data: if section.content.is_empty() { 0 } else { file_offset },
                pointer_to_relocations: 0,
                pointer_to_linenumbers: 0,
                number_of_relocations: 0,
                number_of_linenumbers: 0,
                characteristics: section.characteristics.0,
            };
            write_pod(&raw, &mut out);
        }

        pad_to(&mut out, size_of_headers as usize)?;

        for (section, &file_offset) in self.sections.iter().zip(&file_offsets) {
            if section.content.is_empty() {
                continue;
            }
            pad_to(&mut out, file_offset as usize)?;
            out.write_all(&section.content)?;
        }

        let raw_end = file_offsets
            .last()
            .zip(self.sections.last())
            .map(|(&off, s)| off + align_up(s.content.len() as u32, self.file_alignment()))
            .unwrap_or(size_of_headers);
        pad_to(&mut out, raw_end as usize)?;

        Ok(out)
    }
}

fn sum_sections(sections: &[Section], flag: u32) -> u32 {
    sections
        .iter()
        .filter(|s| s.characteristics.contains(flag))
        .map(|s| align_up(s.virtual_size(), c::DEFAULT_FILE_ALIGNMENT))
        .sum()
}

/// Total size of DOS stub, PE signature, COFF header, optional header and
/// section headers for an image with `n_sections` sections. Exposed so
/// `AddressAssigner` can lay out RVAs starting right past the headers
/// without duplicating this arithmetic.
pub fn headers_size_for(n_sections: usize) -> u32 {
    (c::DOS_STUB_SIZE
        + c::PE_SIGNATURE.len()
        + size_of::<CoffFileHeader>()
        + size_of::<OptionalHeader64>()
        + n_sections * size_of::<RawSectionHeader>()) as u32
}

fn pad_to(out: &mut Vec<u8>, target: usize) -> Result<()> {
    if out.len() < target {
        out.write_all(&vec![0u8; target - out.len()])?;
    }
    Ok(())
}

/// The classic 128-byte DOS stub: just enough `MZ` header for `e_lfanew`
/// (offset 0x3c) to point right after it, at the `PE\0\0` signature.
fn write_dos_stub(out: &mut Vec<u8>) {
    let mut stub = vec![0u8; c::DOS_STUB_SIZE];
    stub[0..2].copy_from_slice(b"MZ");
    let e_lfanew = c::DOS_STUB_SIZE as u32;
    stub[0x3c..0x40].copy_from_slice(&e_lfanew.to_le_bytes());
    out.extend(stub);
}

#[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
struct CoffFileHeader {
    machine: u16,
    number_of_sections: u16,
    time_date_stamp: u32,
    pointer_to_symbol_table: u32,
    number_of_symbols: u32,
    size_of_optional_header: u16,
    characteristics: u16,
}

#[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
struct OptionalHeader64 {
    magic: u16,
    major_linker_version: u8,
    minor_linker_version: u8,
    size_of_code: u32,
    size_of_initialized_data: u32,
    size_of_uninitialized_data: u32,
    address_of_entry_point: u32,
    base_of_code: u32,
    image_base: u64,
    section_alignment: u32,
    file_alignment: u32,
    major_os_version: u16,
    minor_os_version: u16,
    major_image_version: u16,
    minor_image_version: u16,
    major_subsystem_version: u16,
    minor_subsystem_version: u16,
    win32_version_value: u32,
    size_of_image: u32,
    size_of_headers: u32,
    checksum: u32,
    subsystem: u16,
    dll_characteristics: u16,
    size_of_stack_reserve: u64,
    size_of_stack_commit: u64,
    size_of_heap_reserve: u64,
    size_of_heap_commit: u64,
    loader_flags: u32,
    number_of_rva_and_sizes: u32,
}

#[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
struct RawSectionHeader {
    name: [u8; 8],
    virtual_size: u32,
    virtual_address: u32,
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
    pointer_to_relocations: u32,
    pointer_to_linenumbers: u32,
    number_of_relocations: u16,
    number_of_linenumbers: u16,
    characteristics: u32,
}

fn write_pod<T: Pod>(data: &T, output: &mut Vec<u8>) {
    output.extend(bytemuck::bytes_of(data));
}

/// Align a number `n` up to `align`, which must be a power of two.
pub fn align_up(n: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

#[allow(dead_code)]
fn nonzero_align(align: u32) -> Option<NonZeroU64> {
    NonZeroU64::new(align as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_matches_reference_cases() {
        assert_eq!(align_up(0x1, 0x200), 0x200);
        assert_eq!(align_up(0x200, 0x200), 0x200);
        assert_eq!(align_up(0x201, 0x200), 0x400);
    }

    #[test]
    fn minimal_exe_has_dos_and_pe_signatures() {
        let header = Header {
            machine: Machine(c::IMAGE_FILE_MACHINE_AMD64),
            subsystem: Subsystem(c::IMAGE_SUBSYSTEM_WINDOWS_CUI),
            dll_characteristics: DllCharacteristics(c::IMAGE_DLLCHARACTERISTICS_NX_COMPAT),
            image_base: c::DEFAULT_IMAGE_BASE_EXE,
            is_dll: false,
            relocations_stripped: false,
            stack_reserve: 0x100000,
            stack_commit: 0x1000,
            heap_reserve: 0x100000,
            heap_commit: 0x1000,
        };
        let mut writer = PeWriter::new(header);
        writer.add_section(Section {
            name: *b".text\0\0\0",
            characteristics: SectionFlags(c::IMAGE_SCN_CNT_CODE | c::IMAGE_SCN_MEM_EXECUTE | c::IMAGE_SCN_MEM_READ),
            rva: 0x1000,
            content: vec![0x55, 0x89, 0xE5, 0xB8, 0x2A, 0x00, 0x00, 0x00],
            logical_size: None,
        }).unwrap();
        writer.set_entry_rva(0x1000);

        let out = writer.write().unwrap();
        assert_eq!(&out[0..2], b"MZ");
        let e_lfanew = u32::from_le_bytes(out[0x3c..0x40].try_into().unwrap()) as usize;
        assert_eq!(&out[e_lfanew..e_lfanew + 4], c::PE_SIGNATURE);
    }

    #[test]
    fn relocations_stripped_sets_the_file_header_characteristics_bit() {
        let base_header = Header {
            machine: Machine(c::IMAGE_FILE_MACHINE_AMD64),
            subsystem: Subsystem(c::IMAGE_SUBSYSTEM_WINDOWS_CUI),
            dll_characteristics: DllCharacteristics(0),
            image_base: c::DEFAULT_IMAGE_BASE_EXE,
            is_dll: false,
            relocations_stripped: false,
            stack_reserve: 0x100000,
            stack_commit: 0x1000,
            heap_reserve: 0x100000,
            heap_commit: 0x1000,
        };
        let mut stripped_header = base_header.clone();
        stripped_header.relocations_stripped = true;

        let characteristics_of = |header: Header| {
            let mut writer = PeWriter::new(header);
            writer.add_section(Section {
                name: *b".text\0\0\0",
                characteristics: SectionFlags(c::IMAGE_SCN_CNT_CODE | c::IMAGE_SCN_MEM_EXECUTE | c::IMAGE_SCN_MEM_READ),
                rva: 0x1000,
                content: vec![0x90],
                logical_size: None,
            }).unwrap();
            let out = writer.write().unwrap();
            let e_lfanew = u32::from_le_bytes(out[0x3c..0x40].try_into().unwrap()) as usize;
            let coff_header_start = e_lfanew + 4;
            u16::from_le_bytes(out[coff_header_start + 18..coff_header_start + 20].try_into().unwrap())
        };

        assert_eq!(characteristics_of(base_header) & c::IMAGE_FILE_RELOCS_STRIPPED, 0);
        assert_ne!(characteristics_of(stripped_header) & c::IMAGE_FILE_RELOCS_STRIPPED, 0);
    }
}
