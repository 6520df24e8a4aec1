//! `AddressAssigner` for the ELF container: assigns file
//! offsets and RVAs to every output section, building `PT_LOAD` program
//! headers along the way. File offsets grow monotonically and are
//! replicated exactly as `elven_parser::write::ElfWriter`'s own internal
//! layout pass will recompute them, so the two stay congruent without the
//! writer needing to expose its layout ahead of time.

use std::collections::HashMap;
use std::num::NonZeroU64;

use elven_parser::{
    consts::{self as c, PhFlags, PhType, SectionIdx, ShFlags, ShType},
    read::{ElfHeader, Phdr},
    write::{self, ElfWriter, ProgramHeader, Section, SectionRelativeAbsoluteAddr},
    Addr, Offset,
};

use crate::{
    atom::{Atom, AtomId, FileId},
    context::LinkContext,
    layout::OutputSection,
    resolver::Resolver,
    utils::AlignExt,
};

pub struct Placement {
    pub addr: Addr,
    /// Index into `ElfLayout::section_content`, i.e. position in the
    /// flattened `sections` slice this atom landed in.
    pub section_idx: usize,
    pub offset_in_section: u64,
}

pub struct ElfLayout {
    pub writer: ElfWriter,
    pub section_content: Vec<Vec<u8>>,
    pub section_idx_of: HashMap<String, SectionIdx>,
    pub placements: HashMap<AtomId, Placement>,
    pub entry: Addr,
    /// File offset/vaddr just past the last atom-bearing section, still
    /// congruent mod `ctx.section_alignment`. `dynamic::finalize` resumes
    /// the same sequential layout from here for `.dynsym`/`.dynstr`/
    /// `.hash`/`.rela.dyn`/`.rela.plt`/`.dynamic`/`.interp`.
    pub end_file_offset: u64,
    pub end_vaddr: u64,
}

fn elf_header_and_phdr_bytes(n_phdrs: usize) -> u64 {
    (std::mem::size_of::<ElfHeader>() + n_phdrs * std::mem::size_of::<Phdr>()) as u64
}

fn shdr_bytes(n_sections: usize) -> u64 {
    // +2: the null section and `.shstrtab` every `ElfWriter` starts with.
    ((n_sections + 2) * std::mem::size_of::<elven_parser::read::Shdr>()) as u64
}

/// Assigns file offsets and RVAs to `sections` (already grouped/ordered by
/// `LayoutEngine`) and builds the `PT_LOAD` segments covering them, plus
/// the atom-level address map `RelocEngine` needs.
pub fn assign_elf_addresses(
    resolver: &Resolver,
    sections: &[OutputSection],
    ctx: &LinkContext,
    extra_phdrs: usize,
) -> ElfLayout {
    let page = ctx.section_alignment;
    let image_base = ctx.default_image_base();

    // One PT_LOAD per maximal run of sections sharing permissions, plus
    // the leading segment covering the ELF/program headers themselves.
    let mut segment_bounds: Vec<(usize, usize)> = Vec::new(); // [start, end) into `sections`
    let mut i = 0;
    while i < sections.len() {
        let perm = sections[i].permissions;
        let start = i;
        while i < sections.len() && sections[i].permissions == perm {
            i += 1;
        }
        segment_bounds.push((start, i));
    }

    let n_phdrs = 1 + segment_bounds.len() + extra_phdrs; // headers segment + one per group + dynamic linking
    let header_bytes = elf_header_and_phdr_bytes(n_phdrs);
    let content_offset_base = header_bytes + shdr_bytes(sections.len());

    let ident = elven_parser::read::ElfIdent {
        magic: *c::ELFMAG,
        class: c::Class(c::ELFCLASS64),
        data: c::Data(c::ELFDATA2LSB),
        version: 1,
        osabi: c::OsAbi(c::ELFOSABI_SYSV),
        abiversion: 0,
        _pad: [0; 7],
    };
    let machine = match ctx.arch {
        crate::atom::Arch::AArch64 => c::Machine(c::EM_AARCH64),
        _ => c::Machine(c::EM_X86_64),
    };
    let elf_type = match ctx.output_kind {
        crate::context::OutputKind::SharedLibrary => c::Type(c::ET_DYN),
        crate::context::OutputKind::Relocatable => c::Type(c::ET_REL),
        crate::context::OutputKind::Executable if ctx.pic => c::Type(c::ET_DYN),
        crate::context::OutputKind::Executable => c::Type(c::ET_EXEC),
    };
    let mut writer = ElfWriter::new(write::Header { ident, r#type: elf_type, machine });

    let mut cursor_off = content_offset_base;
    let mut cursor_vaddr = image_base.u64();
    let mut placements: HashMap<AtomId, Placement> = HashMap::new();
    let mut section_content: Vec<Vec<u8>> = Vec::with_capacity(sections.len());
    let mut section_idx_of: HashMap<String, SectionIdx> = HashMap::new();
    let mut program_headers = Vec::new();

    program_headers.push(ProgramHeader {
        r#type: PhType(c::PT_LOAD),
        flags: PhFlags::PF_R,
        offset: SectionRelativeAbsoluteAddr { section: SectionIdx(0), rel_offset: Offset(0) },
        vaddr: image_base,
        paddr: image_base,
        filesz: content_offset_base,
        memsz: content_offset_base,
        align: page,
    });

    for &(start, end) in &segment_bounds {
        // New segment: round both cursors up to the page boundary. Both
        // started life congruent mod `page` (file offset 0 vs.
        // page-aligned `image_base`), and every step below advances them
        // by identical amounts, so this preserves that invariant
        //.
        cursor_off = cursor_off.align_up(page);
        cursor_vaddr = cursor_vaddr.align_up(page);
        let seg_off = cursor_off;
        let seg_vaddr = cursor_vaddr;
        let mut seg_filesz = 0u64;
        let mut seg_memsz = 0u64;
        let mut seg_flags = PhFlags(0);
        let mut first_section_idx: Option<SectionIdx> = None;

        for section in &sections[start..end] {
            let flat_section_idx = section_content.len();
            let perm = section.permissions;
            let mut flags = PhFlags::PF_R;
            if perm.write {
                flags = flags | PhFlags::PF_W;
            }
            if perm.execute {
                flags = flags | PhFlags::PF_X;
            }
            seg_flags = seg_flags | flags;

            let align = section_alignment(resolver, section).max(1);
            cursor_off = cursor_off.align_up(align);
            cursor_vaddr = cursor_vaddr.align_up(align);
            let sec_off = cursor_off;
            let sec_vaddr = cursor_vaddr;

            let mut content = Vec::new();
            let mut logical_size = 0u64;
            for &atom_id in &section.atoms {
                let Some(Atom::Defined(d)) = atom_at(resolver, atom_id) else { continue };
                let atom_align = 1u64 << d.align_pow2;
                let pad = content.len() as u64 % atom_align.max(1);
                let pad = if pad == 0 { 0 } else { atom_align - pad };
                for _ in 0..pad {
                    content.push(0);
                }
                logical_size += pad;
                let atom_offset = logical_size;
                placements.insert(
                    atom_id,
                    Placement {
                        addr: Addr(sec_vaddr + atom_offset),
                        section_idx: flat_section_idx,
                        offset_in_section: atom_offset,
                    },
                );
                if !section.is_nobits {
                    content.extend_from_slice(&d.content);
                }
                logical_size += d.size;
            }

            let sh_type = if section.is_nobits { ShType(c::SHT_NOBITS) } else { ShType(c::SHT_PROGBITS) };
            let mut sh_flags = ShFlags::SHF_ALLOC;
            if perm.write {
                sh_flags = sh_flags | ShFlags::SHF_WRITE;
            }
            if perm.execute {
                sh_flags = sh_flags | ShFlags::SHF_EXECINSTR;
            }
            if section.is_tls {
                sh_flags = sh_flags | ShFlags::SHF_TLS;
            }

            let name_idx = writer.add_sh_string(section.name.as_slice());
            let idx = writer
                .add_section(Section {
                    name: name_idx,
                    r#type: sh_type,
                    flags: sh_flags,
                    link: 0,
                    info: 0,
                    addr: Addr(sec_vaddr),
                    fixed_entsize: None,
                    addr_align: NonZeroU64::new(align),
                    content: if section.is_nobits { Vec::new() } else { content.clone() },
                    logical_size: section.is_nobits.then_some(logical_size),
                })
                .expect("section count fits u16");
            if first_section_idx.is_none() {
                first_section_idx = Some(idx);
            }
            section_idx_of.insert(String::from_utf8_lossy(section.name.as_slice()).into_owned(), idx);
            section_content.push(content);

            if section.is_nobits {
                seg_memsz += logical_size;
            } else {
                cursor_off += logical_size;
                seg_filesz += logical_size;
                seg_memsz += logical_size;
            }
        }

        program_headers.push(ProgramHeader {
            r#type: PhType(c::PT_LOAD),
            flags: seg_flags,
            offset: SectionRelativeAbsoluteAddr {
                section: first_section_idx.unwrap_or(SectionIdx(0)),
                rel_offset: Offset(0),
            },
            vaddr: Addr(seg_vaddr),
            paddr: Addr(seg_vaddr),
            filesz: seg_filesz,
            memsz: seg_memsz,
            align: page,
        });
        let _ = seg_off;
    }

    for ph in program_headers {
        writer.add_program_header(ph);
    }

    let entry = resolver
        .entry_atom()
        .and_then(|id| placements.get(&id))
        .map(|p| p.addr)
        .unwrap_or(image_base);
    writer.set_entry(entry);

    ElfLayout {
        writer,
        section_content,
        section_idx_of,
        placements,
        entry,
        end_file_offset: cursor_off,
        end_vaddr: cursor_vaddr,
    }
}

fn atom_at<'a>(resolver: &'a Resolver, id: AtomId) -> Option<&'a Atom> {
    if id.file == FileId::SYNTHETIC {
        resolver.synthetic.atoms.get(id.idx.0 as usize)
    } else {
        resolver.files.get(id.file.0 as usize)?.atoms().get(id.idx.0 as usize)
    }
}

fn section_alignment(resolver: &Resolver, section: &OutputSection) -> u64 {
    section
        .atoms
        .iter()
        .filter_map(|&id| atom_at(resolver, id))
        .filter_map(|a| a.as_defined())
        .map(|d| 1u64 << d.align_pow2)
        .max()
        .unwrap_or(1)
}
