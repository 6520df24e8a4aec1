//! `InputFile` + the ELF flavor of `AtomFactory`.
//!
//! One `InputFile` owns one arena of atoms (`Vec<Atom>`); everything else
//! (the `SymbolTable`, `Reference::target`) holds indices into that arena
//! or into the global name table, never a borrowed pointer, keeping atoms owned by one arena rather than scattered behind pointers.

use std::path::{Path, PathBuf};

use bstr::{BStr, BString};
use elven_parser::{
    consts::{self as c},
    read::{ElfReader, Shdr, Sym},
};

use crate::{
    atom::{
        Arch, Atom, AtomIdx, ContentType, DeadStripPolicy, DefinedAtom, FileId, MergePolicy,
        Permissions, RefKind, RefTarget, Reference, SectionChoice, UndefinedAtom,
    },
    error::ParseError,
};

/// A COMDAT group as AtomFactory found it: the signature (conventionally
/// the name of the group's defining symbol) and every atom transitively
/// inside it. The Resolver keeps one global `signature -> first file`
/// map and marks every atom of every later group with the same signature
/// discarded.
#[derive(Debug, Clone)]
pub struct ComdatGroup {
    pub signature: BString,
    pub atoms: Vec<AtomIdx>,
}

/// One parsed input file's atoms plus the COMDAT groups found in it.
/// Produced by `AtomFactory` in a single pass, consumed by the Resolver.
#[derive(Debug, Default)]
pub struct FileAtoms {
    pub atoms: Vec<Atom>,
    pub comdat_groups: Vec<ComdatGroup>,
}

/// A loaded object, archive, or bitcode stub, addressable by `FileId`.
pub enum InputFile<'a> {
    Elf(ElfInputFile<'a>),
    Coff(crate::file_coff::CoffInputFile<'a>),
    SharedObject(SharedObjectFile<'a>),
    Archive(ArchiveInputFile<'a>),
    Bitcode(BitcodeStub),
    /// The one internal file owning every linker-generated atom
    /// (`__ImageBase`, PLT stubs, IAT thunks, GOT, ...). Per-file internal
    /// synthetic files collapse to this single global `SyntheticFile`.
    Synthetic(SyntheticFile),
}

impl<'a> InputFile<'a> {
    pub fn path(&self) -> &Path {
        match self {
            InputFile::Elf(f) => &f.path,
            InputFile::Coff(f) => &f.path,
            InputFile::SharedObject(f) => &f.path,
            InputFile::Archive(f) => &f.path,
            InputFile::Bitcode(f) => &f.path,
            InputFile::Synthetic(_) => Path::new("<synthetic>"),
        }
    }

    pub fn atoms(&self) -> &[Atom] {
        match self {
            InputFile::Elf(f) => &f.atoms.atoms,
            InputFile::Coff(f) => &f.atoms.atoms,
            InputFile::SharedObject(f) => &f.atoms,
            InputFile::Archive(_) => &[],
            InputFile::Bitcode(f) => &f.atoms,
            InputFile::Synthetic(f) => &f.atoms,
        }
    }

    pub fn atoms_mut(&mut self) -> &mut Vec<Atom> {
        match self {
            InputFile::Elf(f) => &mut f.atoms.atoms,
            InputFile::Coff(f) => &mut f.atoms.atoms,
            InputFile::SharedObject(f) => &mut f.atoms,
            InputFile::Archive(_) => panic!("archives hold no atoms of their own"),
            InputFile::Bitcode(f) => &mut f.atoms,
            InputFile::Synthetic(f) => &mut f.atoms,
        }
    }

    pub fn comdat_groups(&self) -> &[ComdatGroup] {
        match self {
            InputFile::Elf(f) => &f.atoms.comdat_groups,
            InputFile::Coff(f) => &f.atoms.comdat_groups,
            _ => &[],
        }
    }
}

pub struct ElfInputFile<'a> {
    pub path: PathBuf,
    pub reader: ElfReader<'a>,
    pub atoms: FileAtoms,
}

/// `ET_DYN` input consumed only for the symbol names it exports as
/// `SharedLibraryAtom`s; we never copy a `.so`'s code into the output,
/// only record that a name is satisfied by it.
pub struct SharedObjectFile<'a> {
    pub path: PathBuf,
    pub reader: ElfReader<'a>,
    pub soname: BString,
    pub atoms: Vec<Atom>,
}

pub struct ArchiveInputFile<'a> {
    pub path: PathBuf,
    pub archive: elven_parser::archive::ArchiveFile<'a>,
}

/// The opaque stub a bitcode wrapper file is reduced to:
/// only its external symbol names are visible to the SymbolTable; actual
/// codegen is out of scope.
pub struct BitcodeStub {
    pub atoms: Vec<Atom>,
}

/// Every linker-generated atom: IAT/PLT/GOT entries, `__ImageBase`,
/// `/alternatename` aliases, `--defsym` absolutes, and so on.
#[derive(Default)]
pub struct SyntheticFile {
    pub atoms: Vec<Atom>,
}

impl SyntheticFile {
    pub fn push(&mut self, atom: Atom) -> AtomIdx {
        let idx = AtomIdx(self.atoms.len() as u32);
        self.atoms.push(atom);
        idx
    }
}

/// Reserved ELF section names that are never dead-stripped at the
/// section level.
const DEAD_STRIP_NEVER_SECTIONS: &[&[u8]] =
    &[b".init", b".fini", b".ctors", b".dtors", b".eh_frame"];

fn content_type_for_section(name: &BStr, sh: &Shdr) -> ContentType {
    if sh.r#type == c::SHT_INIT_ARRAY || name.starts_with(b".init_array") {
        return ContentType::InitializerPointer;
    }
    if sh.r#type == c::SHT_FINI_ARRAY || name.starts_with(b".fini_array") {
        return ContentType::FinalizerPointer;
    }
    if name.starts_with(b".ctors") {
        return ContentType::InitializerPointer;
    }
    if name.starts_with(b".dtors") {
        return ContentType::FinalizerPointer;
    }
    if name.starts_with(b".eh_frame") {
        return ContentType::EhFrame;
    }
    if sh.r#type == c::SHT_NOTE {
        return ContentType::Note;
    }
    if sh.flags.contains(c::SHF_TLS) {
        return if sh.r#type == c::SHT_NOBITS {
            ContentType::ThreadLocalZeroFill
        } else {
            ContentType::ThreadLocalData
        };
    }
    if sh.r#type == c::SHT_NOBITS {
        return ContentType::ZeroFill;
    }
    if sh.flags.contains(c::SHF_EXECINSTR) {
        return ContentType::Code;
    }
    ContentType::Data
}

fn permissions_for_section(sh: &Shdr) -> Permissions {
    Permissions {
        read: true,
        write: sh.flags.contains(c::SHF_WRITE),
        execute: sh.flags.contains(c::SHF_EXECINSTR),
    }
}

fn dead_strip_for_section(name: &BStr, sh: &Shdr) -> DeadStripPolicy {
    if DEAD_STRIP_NEVER_SECTIONS.iter().any(|n| name.starts_with(n))
        || matches!(
            sh.r#type.0,
            c::SHT_INIT_ARRAY | c::SHT_FINI_ARRAY | c::SHT_PREINIT_ARRAY | c::SHT_NOTE
        )
    {
        DeadStripPolicy::Never
    } else {
        DeadStripPolicy::Normal
    }
}

/// Is this section discard-flagged (`SHF_EXCLUDE`, or a debug section when
/// debug info is being dropped)? `.drectve`-equivalent directive sections
/// don't exist on ELF; this only covers the ELF-side discard rule.
fn is_discarded_section(sh: &Shdr) -> bool {
    sh.flags.contains(c::SHF_EXCLUDE)
}

/// Sections that never produce atoms regardless of discard flags:
/// metadata tables AtomFactory consumes structurally instead.
fn is_structural_section(sh: &Shdr) -> bool {
    matches!(
        sh.r#type.0,
        c::SHT_NULL
            | c::SHT_SYMTAB
            | c::SHT_STRTAB
            | c::SHT_RELA
            | c::SHT_REL
            | c::SHT_GROUP
            | c::SHT_DYNSYM
            | c::SHT_DYNAMIC
            | c::SHT_HASH
            | c::SHT_GNU_HASH
            | c::SHT_SYMTAB_SHNDX
    )
}

struct SectionAtomRange {
    start: u64,
    end: u64,
    atom_idx: AtomIdx,
}

/// Produces atoms and references from one ELF relocatable object in a
/// single pass.
pub fn atoms_from_elf(path: &Path, elf: &ElfReader<'_>) -> Result<FileAtoms, ParseError> {
    let mut out = FileAtoms::default();
    let mut ordinal: u32 = 0;

    let sections = elf.section_headers()?;
    let symbols = elf.symbols().unwrap_or(&[]);
    let first_global = elf.first_global_symbol_index().unwrap_or(symbols.len());

    // sym_idx -> atom already materialized for it (undefined/common/lazy
    // atoms, and later, section-carved atoms keyed by their defining
    // symbol). Section-type symbols are resolved separately via
    // `section_ranges` + addend, since their own "atom" is really
    // "wherever inside the section the addend points".
    let mut sym_atom: Vec<Option<AtomIdx>> = vec![None; symbols.len()];
    let mut section_ranges: Vec<Vec<SectionAtomRange>> = vec![Vec::new(); sections.len()];

    // Pass 1: undefined and common symbols become atoms immediately; they
    // don't belong to any section's byte range.
    for (i, sym) in symbols.iter().enumerate() {
        let is_local = i < first_global;
        let ty = sym.info.r#type();
        if ty.0 == c::STT_FILE || ty.0 == c::STT_SECTION {
            continue;
        }
        if sym.shndx == c::SHN_UNDEF {
            if is_local {
                continue;
            }
            let name = elf.string(sym.name)?.to_owned();
            let weak = sym.info.binding() == c::STB_WEAK;
            out.atoms.push(Atom::Undefined(UndefinedAtom {
                name,
                fallback: None,
                can_be_null: false,
                weak,
            }));
            sym_atom[i] = Some(AtomIdx((out.atoms.len() - 1) as u32));
        } else if sym.shndx == c::SHN_COMMON {
            let name = elf.string(sym.name)?.to_owned();
            let align = sym.value.u64().max(1);
            out.atoms.push(Atom::Defined(DefinedAtom {
                content_type: ContentType::ZeroFill,
                permissions: Permissions::RW,
                align_pow2: align.trailing_zeros() as u8,
                align_modulus: 1,
                binding: binding_of(sym),
                visibility: visibility_of(sym),
                merge: MergePolicy::Largest,
                section_choice: SectionChoice::ContentDerived,
                section_name: BString::from(b".bss".to_vec()),
                dead_strip: DeadStripPolicy::Normal,
                ordinal,
                content: Vec::new(),
                size: sym.size,
                references: Vec::new(),
                name: Some(name),
            }));
            ordinal += 1;
            sym_atom[i] = Some(AtomIdx((out.atoms.len() - 1) as u32));
        }
    }

    // Pass 2: carve every eligible section into atoms at symbol
    // boundaries.
    for (sec_idx, sh) in sections.iter().enumerate() {
        if is_structural_section(sh) || is_discarded_section(sh) {
            continue;
        }
        let name = elf.sh_string(sh.name)?;
        let content = elf.section_content(sh)?;

        if elf.is_mergeable_section(sh) {
            carve_mergeable_section(
                &mut out,
                &mut section_ranges[sec_idx],
                name,
                sh,
                content,
                &mut ordinal,
            );
            continue;
        }

        let mut members: Vec<(usize, &Sym)> = symbols
            .iter()
            .enumerate()
            .filter(|(i, sym)| {
                sym.shndx.usize() == sec_idx
                    && sym_atom[*i].is_none()
                    && !matches!(sym.info.r#type().0, c::STT_FILE | c::STT_SECTION)
            })
            .collect();
        members.sort_by_key(|(_, sym)| sym.value);

        let mut cursor = 0u64;
        let mut i = 0;
        while i < members.len() {
            let start = members[i].1.value.u64();
            // Every symbol sharing this exact value aliases the same
            // atom; the first (lowest symtab index) donates the name.
            let mut j = i;
            while j < members.len() && members[j].1.value.u64() == start {
                j += 1;
            }
            let end = members
                .get(j)
                .map(|(_, s)| s.value.u64())
                .unwrap_or(sh.size);

            let (primary_i, primary_sym) = members[i];
            let primary_name = elf.string(primary_sym.name)?.to_owned();
            let atom_idx = push_section_atom(
                &mut out,
                name,
                sh,
                content,
                start,
                end,
                Some(primary_name),
                primary_sym,
                &mut ordinal,
            );
            for &(sym_i, _) in &members[i..j] {
                sym_atom[sym_i] = Some(atom_idx);
            }
            section_ranges[sec_idx].push(SectionAtomRange {
                start,
                end,
                atom_idx,
            });
            cursor = end;
            i = j;
        }

        if cursor < sh.size || members.is_empty() {
            let atom_idx = push_anonymous_section_atom(
                &mut out,
                name,
                sh,
                content,
                cursor,
                sh.size,
                &mut ordinal,
            );
            section_ranges[sec_idx].push(SectionAtomRange {
                start: cursor,
                end: sh.size,
                atom_idx,
            });
        }

        // Consecutive atoms in the same section chain layout-before edges
        //.
        chain_layout_edges(&mut out, &section_ranges[sec_idx]);
    }

    // Pass 3: relocations become references on the atom whose byte range
    // contains the relocation site.
    for (sh, rela) in elf.relas()? {
        let target_sec = sh.info as usize;
        let Some(ranges) = section_ranges.get(target_sec) else {
            continue;
        };
        if ranges.is_empty() {
            // The target section produced no atoms (fully discarded);
            // the relocation is against dead content and is dropped.
            continue;
        }
        let offset = rela.offset.u64();
        let Some(range) = ranges
            .iter()
            .find(|r| offset >= r.start && offset < r.end)
            .or_else(|| ranges.iter().find(|r| offset == r.end && r.start == r.end))
        else {
            return Err(ParseError::RelocationStraddlesAtom {
                section: elf.sh_string(sh.name)?.to_owned(),
                offset,
            });
        };

        let sym = elf.symbol(rela.info.sym())?;
        // `STT_SECTION` symbols carry value 0; the real target lives at
        // `addend` bytes into the section they name, so they resolve
        // against `section_ranges` directly instead of `sym_atom`.
        let target = if sym.info.r#type().0 == c::STT_SECTION {
            let sec_idx = sym.shndx.usize();
            let target_offset = rela.addend.max(0) as u64;
            let found = section_ranges.get(sec_idx).and_then(|ranges| {
                ranges
                    .iter()
                    .find(|r| target_offset >= r.start && target_offset < r.end)
                    .or_else(|| ranges.iter().find(|r| target_offset == r.end))
            });
            match found {
                Some(r) => RefTarget::Atom(crate::atom::AtomId {
                    file: FileId(0),
                    idx: r.atom_idx,
                }),
                None => RefTarget::Name(elf.sh_string(sections[sec_idx].name)?.to_owned()),
            }
        } else if let Some(idx) = sym_atom.get(rela.info.sym().0 as usize).copied().flatten() {
            RefTarget::Atom(crate::atom::AtomId {
                file: FileId(0),
                idx,
            })
        } else {
            RefTarget::Name(elf.string(sym.name)?.to_owned())
        };
        // Section-relative targets with `STT_SECTION` carry their own
        // displacement in `addend`; once resolved to a concrete atom the
        // addend left on the `Reference` is relative to that atom's
        // start, not the section's, so subtract the atom's base offset.
        let addend = if sym.info.r#type().0 == c::STT_SECTION {
            if let RefTarget::Atom(crate::atom::AtomId { idx, .. }) = &target {
                let sec_idx = sym.shndx.usize();
                let base = section_ranges[sec_idx]
                    .iter()
                    .find(|r| r.atom_idx == *idx)
                    .map(|r| r.start)
                    .unwrap_or(0);
                rela.addend - base as i64
            } else {
                rela.addend
            }
        } else {
            rela.addend
        };

        if let Atom::Defined(defined) = &mut out.atoms[range.atom_idx.0 as usize] {
            defined.references.push(Reference {
                offset_in_atom: offset - range.start,
                target,
                kind: RefKind::Elf(rela.info.r#type()),
                arch: Arch::X86_64,
                addend,
            });
        }
    }

    // Pass 4: COMDAT groups, physical format per `SHT_GROUP`, grounded in
    // lld's `InputFiles::initializeSections`.
    for (group_sh, flags, members) in elf.section_groups()? {
        if flags & c::GRP_COMDAT == 0 {
            continue;
        }
        let signature = elf.sh_string(group_sh.name)?.to_owned();
        let mut atoms = Vec::new();
        for &member_sec in members {
            if let Some(ranges) = section_ranges.get(member_sec as usize) {
                atoms.extend(ranges.iter().map(|r| r.atom_idx));
            }
        }
        if !atoms.is_empty() {
            out.comdat_groups.push(ComdatGroup { signature, atoms });
        }
    }

    Ok(out)
}

fn binding_of(sym: &Sym) -> crate::atom::Binding {
    match sym.info.binding().0 {
        c::STB_WEAK => crate::atom::Binding::Weak,
        c::STB_LOCAL => crate::atom::Binding::Local,
        _ => crate::atom::Binding::Global,
    }
}

fn visibility_of(sym: &Sym) -> crate::atom::Visibility {
    match sym.other.0 & 0x3 {
        c::STV_HIDDEN => crate::atom::Visibility::Hidden,
        c::STV_INTERNAL => crate::atom::Visibility::Internal,
        c::STV_PROTECTED => crate::atom::Visibility::Protected,
        _ => crate::atom::Visibility::Default,
    }
}

#[allow(clippy::too_many_arguments)]
fn push_section_atom(
    out: &mut FileAtoms,
    name: &BStr,
    sh: &Shdr,
    content: &[u8],
    start: u64,
    end: u64,
    atom_name: Option<BString>,
    sym: &Sym,
    ordinal: &mut u32,
) -> AtomIdx {
    let size = end - start;
    let bytes = if sh.r#type == c::SHT_NOBITS {
        Vec::new()
    } else {
        content[start as usize..end as usize].to_vec()
    };
    let atom = DefinedAtom {
        content_type: content_type_for_section(name, sh),
        permissions: permissions_for_section(sh),
        align_pow2: sh.addralign.max(1).trailing_zeros() as u8,
        align_modulus: 1,
        binding: binding_of(sym),
        visibility: visibility_of(sym),
        merge: MergePolicy::NoMerge,
        section_choice: SectionChoice::ContentDerived,
        section_name: name.to_owned(),
        dead_strip: dead_strip_for_section(name, sh),
        ordinal: *ordinal,
        content: bytes,
        size,
        references: Vec::new(),
        name: atom_name,
    };
    *ordinal += 1;
    out.atoms.push(Atom::Defined(atom));
    AtomIdx((out.atoms.len() - 1) as u32)
}

fn push_anonymous_section_atom(
    out: &mut FileAtoms,
    name: &BStr,
    sh: &Shdr,
    content: &[u8],
    start: u64,
    end: u64,
    ordinal: &mut u32,
) -> AtomIdx {
    let size = end - start;
    let bytes = if sh.r#type == c::SHT_NOBITS || size == 0 {
        Vec::new()
    } else {
        content[start as usize..end as usize].to_vec()
    };
    let atom = DefinedAtom {
        content_type: content_type_for_section(name, sh),
        permissions: permissions_for_section(sh),
        align_pow2: sh.addralign.max(1).trailing_zeros() as u8,
        align_modulus: 1,
        binding: crate::atom::Binding::Local,
        visibility: crate::atom::Visibility::Hidden,
        merge: MergePolicy::NoMerge,
        section_choice: SectionChoice::ContentDerived,
        section_name: name.to_owned(),
        dead_strip: dead_strip_for_section(name, sh),
        ordinal: *ordinal,
        content: bytes,
        size,
        references: Vec::new(),
        name: None,
    };
    *ordinal += 1;
    out.atoms.push(Atom::Defined(atom));
    AtomIdx((out.atoms.len() - 1) as u32)
}

/// Splits a mergeable section (`SHF_MERGE|SHF_STRINGS`, or fixed-entsize
/// constants) into one atom per entry, each carrying `merge = ByContent`
/// so the Resolver can dedup by content across files.
fn carve_mergeable_section(
    out: &mut FileAtoms,
    ranges: &mut Vec<SectionAtomRange>,
    name: &BStr,
    sh: &Shdr,
    content: &[u8],
    ordinal: &mut u32,
) {
    let perms = permissions_for_section(sh);
    if sh.flags.contains(c::SHF_STRINGS) {
        let mut start = 0usize;
        for (i, &b) in content.iter().enumerate() {
            if b == 0 {
                let end = i + 1;
                push_merge_atom(out, ranges, name, perms, sh, &content[start..end], start as u64, ordinal);
                start = end;
            }
        }
        if start < content.len() {
            push_merge_atom(out, ranges, name, perms, sh, &content[start..], start as u64, ordinal);
        }
    } else {
        let entsize = sh.entsize.max(1) as usize;
        for (chunk_idx, chunk) in content.chunks(entsize).enumerate() {
            push_merge_atom(
                out,
                ranges,
                name,
                perms,
                sh,
                chunk,
                (chunk_idx * entsize) as u64,
                ordinal,
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn push_merge_atom(
    out: &mut FileAtoms,
    ranges: &mut Vec<SectionAtomRange>,
    name: &BStr,
    perms: Permissions,
    sh: &Shdr,
    bytes: &[u8],
    start: u64,
    ordinal: &mut u32,
) {
    let atom = DefinedAtom {
        content_type: ContentType::MergeString,
        permissions: perms,
        align_pow2: sh.addralign.max(1).trailing_zeros() as u8,
        align_modulus: 1,
        binding: crate::atom::Binding::Local,
        visibility: crate::atom::Visibility::Hidden,
        merge: MergePolicy::ByContent,
        section_choice: SectionChoice::ContentDerived,
        section_name: name.to_owned(),
        dead_strip: DeadStripPolicy::Normal,
        ordinal: *ordinal,
        content: bytes.to_vec(),
        size: bytes.len() as u64,
        references: Vec::new(),
        name: None,
    };
    *ordinal += 1;
    out.atoms.push(Atom::Defined(atom));
    let idx = AtomIdx((out.atoms.len() - 1) as u32);
    ranges.push(SectionAtomRange {
        start,
        end: start + bytes.len() as u64,
        atom_idx: idx,
    });
}

/// Chains consecutive atoms carved from the same section with
/// `layout-before`/`layout-after` edges.
fn chain_layout_edges(out: &mut FileAtoms, ranges: &[SectionAtomRange]) {
    let mut sorted: Vec<&SectionAtomRange> = ranges.iter().collect();
    sorted.sort_by_key(|r| r.start);
    for pair in sorted.windows(2) {
        let (a, b) = (pair[0].atom_idx, pair[1].atom_idx);
        if let Atom::Defined(defined) = &mut out.atoms[a.0 as usize] {
            defined.references.push(Reference {
                offset_in_atom: 0,
                target: RefTarget::Atom(crate::atom::AtomId {
                    file: FileId(0), // patched to the real FileId by the caller
                    idx: b,
                }),
                kind: RefKind::Layout(crate::atom::LayoutKind::Before),
                arch: Arch::All,
                addend: 0,
            });
        }
    }
}

