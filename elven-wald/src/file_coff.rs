//! The COFF flavor of `AtomFactory`, mirroring `file.rs`
//! but keyed on `IMAGE_SYMBOL`/`IMAGE_SECTION_HEADER` instead of ELF's
//! `Sym`/`Shdr`. Grounded in `elven-coff::read` plus
//! `original_source/lld/COFF/InputFiles.cpp`'s `initializeSymbols` for
//! the aux-record layouts (weak externals, COMDAT section records)
//! that `elven-coff::read::Symbol` deliberately leaves unparsed.

use std::path::{Path, PathBuf};

use bstr::BString;
use elven_coff::{
    consts::{self as c},
    read::{CoffReader, SectionHeader, Symbol},
};

use crate::{
    atom::{
        Arch, Atom, AtomIdx, Binding, ContentType, DeadStripPolicy, DefinedAtom, FileId, MergePolicy,
        Permissions, RefKind, RefTarget, Reference, SectionChoice, UndefinedAtom, Visibility,
    },
    error::ParseError,
    file::{ComdatGroup, FileAtoms},
};

pub struct CoffInputFile<'a> {
    pub path: PathBuf,
    pub reader: CoffReader<'a>,
    pub atoms: FileAtoms,
}

struct SectionAtomRange {
    start: u64,
    end: u64,
    atom_idx: AtomIdx,
}

fn content_type_for_section(name: &[u8], characteristics: c::SectionFlags) -> ContentType {
    if characteristics.contains(c::IMAGE_SCN_MEM_EXECUTE) || characteristics.contains(c::IMAGE_SCN_CNT_CODE) {
        return ContentType::Code;
    }
    if characteristics.contains(c::IMAGE_SCN_CNT_UNINITIALIZED_DATA) {
        return ContentType::ZeroFill;
    }
    if name == b".tls" || name.starts_with(b".tls$") {
        return ContentType::ThreadLocalData;
    }
    ContentType::Data
}

fn permissions_for_section(characteristics: c::SectionFlags) -> Permissions {
    Permissions {
        read: characteristics.contains(c::IMAGE_SCN_MEM_READ),
        write: characteristics.contains(c::IMAGE_SCN_MEM_WRITE),
        execute: characteristics.contains(c::IMAGE_SCN_MEM_EXECUTE),
    }
}

/// A weak-external aux record: `{ TagIndex: u32, Characteristics: u32,
/// Unused: [u8; 10] }`, stored in the raw 18 bytes of the aux symbol slot
/// that follows a `IMAGE_SYM_CLASS_WEAK_EXTERNAL` symbol.
fn weak_external_aux(aux: &Symbol) -> (u32, u32) {
    let tag_index = u32::from_le_bytes(aux.name[0..4].try_into().unwrap());
    let characteristics = u32::from_le_bytes(aux.name[4..8].try_into().unwrap());
    (tag_index, characteristics)
}

/// A COMDAT section aux record: `{ Length, NumberOfRelocations,
/// NumberOfLinenumbers, CheckSum, Number: u16, Selection: u8, Unused: [u8; 3] }`.
/// `CheckSum`/`Number` happen to land on `Symbol::value`/`section_number`
/// thanks to the shared 18-byte layout; `Selection` is the low byte of
/// `Symbol::type`.
fn comdat_section_aux(aux: &Symbol) -> (u16, c::ComdatSelect) {
    let associated_section = aux.section_number as u16;
    let selection = c::ComdatSelect((aux.r#type & 0xff) as u8);
    (associated_section, selection)
}

/// Produces atoms and references from one COFF object.
pub fn atoms_from_coff(path: &Path, coff: &CoffReader<'_>) -> Result<FileAtoms, ParseError> {
    let mut out = FileAtoms::default();
    let mut ordinal: u32 = 0;

    let sections = coff.section_headers()?;
    let symbols = coff.symbols()?;

    let mut sym_atom: Vec<Option<AtomIdx>> = vec![None; symbols.len()];
    let mut section_ranges: Vec<Vec<SectionAtomRange>> = vec![Vec::new(); sections.len()];
    // (symbol_idx, weak_characteristics, tag_index) for a deferred
    // second pass, since the fallback symbol may not have an atom yet.
    let mut weak_externals: Vec<(usize, u32, u32)> = Vec::new();
    // section_idx -> (associated_section_number, selection) for the
    // COMDAT-defining symbol found in that section.
    let mut comdat_sections: Vec<Option<(u16, c::ComdatSelect)>> = vec![None; sections.len()];

    // Pass 0: classify symbols, skipping aux slots, recording
    // undefined/weak-external atoms up front exactly like the ELF side.
    let mut i = 0usize;
    while i < symbols.len() {
        let sym = &symbols[i];
        let naux = sym.number_of_aux_symbols as usize;

        if sym.storage_class == c::IMAGE_SYM_CLASS_WEAK_EXTERNAL && naux >= 1 {
            let aux = &symbols[i + 1];
            let (tag_index, characteristics) = weak_external_aux(aux);
            let name = coff.symbol_name(sym)?.to_owned();
            out.atoms.push(Atom::Undefined(UndefinedAtom {
                name,
                fallback: None,
                can_be_null: false,
                weak: true,
            }));
            sym_atom[i] = Some(AtomIdx((out.atoms.len() - 1) as u32));
            weak_externals.push((i, characteristics, tag_index));
        } else if sym.section_number == c::IMAGE_SYM_UNDEFINED
            && sym.storage_class == c::IMAGE_SYM_CLASS_EXTERNAL
        {
            let name = coff.symbol_name(sym)?.to_owned();
            out.atoms.push(Atom::Undefined(UndefinedAtom {
                name,
                fallback: None,
                can_be_null: false,
                weak: false,
            }));
            sym_atom[i] = Some(AtomIdx((out.atoms.len() - 1) as u32));
        } else if sym.section_number == c::IMAGE_SYM_ABSOLUTE {
            let name = coff.symbol_name(sym)?.to_owned();
            out.atoms.push(Atom::Absolute(crate::atom::AbsoluteAtom {
                name,
                value: sym.value as u64,
            }));
            sym_atom[i] = Some(AtomIdx((out.atoms.len() - 1) as u32));
        } else if sym.section_number > 0
            && sym.storage_class == c::IMAGE_SYM_CLASS_STATIC
            && naux >= 1
        {
            // Could be a COMDAT's defining symbol, whose aux record picks
            // out the section-level aux.
            let aux = &symbols[i + 1];
            let sec_idx = sym.section_number as usize - 1;
            if let Some(sh) = sections.get(sec_idx) {
                if sh.characteristics.contains(c::IMAGE_SCN_LNK_COMDAT) {
                    comdat_sections[sec_idx] = Some(comdat_section_aux(aux));
                }
            }
        }

        i += 1 + naux;
    }

    // Pass 1: carve sections into atoms (debug/line-number/removed
    // sections produce nothing).
    for (sec_idx, sh) in sections.iter().enumerate() {
        if sh.characteristics.contains(c::IMAGE_SCN_LNK_REMOVE)
            || sh.characteristics.contains(c::IMAGE_SCN_MEM_DISCARDABLE)
        {
            continue;
        }
        let name = short_name(&sh.name);
        if name.starts_with(b".drectve") || name.starts_with(b".debug") {
            continue;
        }
        let content = coff.section_content(sh)?;

        let mut members: Vec<(usize, &Symbol)> = Vec::new();
        let mut k = 0usize;
        while k < symbols.len() {
            let sym = &symbols[k];
            let naux = sym.number_of_aux_symbols as usize;
            if sym.section_number as usize == sec_idx + 1 && sym_atom[k].is_none() {
                members.push((k, sym));
            }
            k += 1 + naux;
        }
        members.sort_by_key(|(_, sym)| sym.value);

        let mut cursor = 0u64;
        let mut mi = 0;
        while mi < members.len() {
            let start = members[mi].1.value as u64;
            let mut mj = mi;
            while mj < members.len() && members[mj].1.value as u64 == start {
                mj += 1;
            }
            let end = members
                .get(mj)
                .map(|(_, s)| s.value as u64)
                .unwrap_or(sh.virtual_size.max(sh.size_of_raw_data as u32) as u64);

            let (_, primary_sym) = members[mi];
            let primary_name = coff.symbol_name(primary_sym)?.to_owned();
            let size = end.saturating_sub(start);
            let bytes = if content.is_empty() {
                Vec::new()
            } else {
                content[start.min(content.len() as u64) as usize..end.min(content.len() as u64) as usize].to_vec()
            };
            let merge = match comdat_sections[sec_idx].map(|(_, sel)| sel.0) {
                Some(c::IMAGE_COMDAT_SELECT_EXACT_MATCH) => MergePolicy::SameNameAndSize,
                Some(c::IMAGE_COMDAT_SELECT_LARGEST) => MergePolicy::Largest,
                Some(c::IMAGE_COMDAT_SELECT_ASSOCIATIVE) => MergePolicy::Associative,
                Some(_) => MergePolicy::SameNameAddressUsed,
                None => MergePolicy::NoMerge,
            };
            let atom = DefinedAtom {
                content_type: content_type_for_section(name, sh.characteristics),
                permissions: permissions_for_section(sh.characteristics),
                align_pow2: c::section_alignment(sh.characteristics.0).max(1).trailing_zeros() as u8,
                align_modulus: 1,
                binding: if primary_sym.storage_class == c::IMAGE_SYM_CLASS_EXTERNAL {
                    Binding::Global
                } else {
                    Binding::Local
                },
                visibility: Visibility::Default,
                merge,
                section_choice: SectionChoice::ContentDerived,
                section_name: BString::from(name.to_vec()),
                dead_strip: DeadStripPolicy::Normal,
                ordinal,
                content: bytes,
                size,
                references: Vec::new(),
                name: Some(primary_name),
            };
            ordinal += 1;
            out.atoms.push(Atom::Defined(atom));
            let atom_idx = AtomIdx((out.atoms.len() - 1) as u32);
            for &(sym_i, _) in &members[mi..mj] {
                sym_atom[sym_i] = Some(atom_idx);
            }
            section_ranges[sec_idx].push(SectionAtomRange {
                start,
                end,
                atom_idx,
            });
            cursor = end;
            mi = mj;
        }

        let section_end = sh.virtual_size.max(sh.size_of_raw_data as u32) as u64;
        if cursor < section_end || members.is_empty() {
            let bytes = if content.is_empty() {
                Vec::new()
            } else {
                content[cursor.min(content.len() as u64) as usize..].to_vec()
            };
            let atom = DefinedAtom {
                content_type: content_type_for_section(name, sh.characteristics),
                permissions: permissions_for_section(sh.characteristics),
                align_pow2: c::section_alignment(sh.characteristics.0).max(1).trailing_zeros() as u8,
                align_modulus: 1,
                binding: Binding::Local,
                visibility: Visibility::Hidden,
                merge: MergePolicy::NoMerge,
                section_choice: SectionChoice::ContentDerived,
                section_name: BString::from(name.to_vec()),
                dead_strip: DeadStripPolicy::Normal,
                ordinal,
                content: bytes,
                size: section_end - cursor,
                references: Vec::new(),
                name: None,
            };
            ordinal += 1;
            out.atoms.push(Atom::Defined(atom));
            let atom_idx = AtomIdx((out.atoms.len() - 1) as u32);
            section_ranges[sec_idx].push(SectionAtomRange {
                start: cursor,
                end: section_end,
                atom_idx,
            });
        }

        for r in coff.section_relocations(sh)? {
            let ranges = &section_ranges[sec_idx];
            let offset = r.virtual_address as u64;
            let Some(range) = ranges
                .iter()
                .find(|rg| offset >= rg.start && offset < rg.end)
                .or_else(|| ranges.iter().find(|rg| offset == rg.end))
            else {
                return Err(ParseError::RelocationStraddlesAtom {
                    section: BString::from(name.to_vec()),
                    offset,
                });
            };
            let sym_idx = r.symbol_table_index as usize;
            let Some(sym) = symbols.get(sym_idx) else {
                continue;
            };
            let target = if let Some(idx) = sym_atom.get(sym_idx).copied().flatten() {
                RefTarget::Atom(crate::atom::AtomId {
                    file: FileId(0),
                    idx,
                })
            } else {
                RefTarget::Name(coff.symbol_name(sym)?.to_owned())
            };
            if let Atom::Defined(defined) = &mut out.atoms[range.atom_idx.0 as usize] {
                defined.references.push(Reference {
                    offset_in_atom: offset - range.start,
                    target,
                    kind: RefKind::Coff(r.r#type),
                    arch: coff_arch(coff)?,
                    addend: 0,
                });
            }
        }
    }

    // Pass 2: resolve weak-external fallback chains now that every
    // section-carved atom exists.
    for (sym_idx, characteristics, tag_index) in weak_externals {
        let _ = characteristics;
        if let Some(Atom::Undefined(u)) = out.atoms.get_mut(sym_atom[sym_idx].unwrap().0 as usize) {
            u.fallback = sym_atom
                .get(tag_index as usize)
                .copied()
                .flatten()
                .map(|idx| crate::atom::AtomId { file: FileId(0), idx });
        }
    }

    // Pass 3: COMDAT associative children (`IMAGE_COMDAT_SELECT_ASSOCIATIVE`)
    // group with their parent via the section-level aux record's
    // associated-section-number field.
    let mut comdat_groups: std::collections::HashMap<BString, Vec<AtomIdx>> = Default::default();
    for (sec_idx, entry) in comdat_sections.iter().enumerate() {
        let Some((_assoc_section, _selection)) = entry else {
            continue;
        };
        let sh = &sections[sec_idx];
        let signature = BString::from(short_name(&sh.name).to_vec());
        comdat_groups
            .entry(signature)
            .or_default()
            .extend(section_ranges[sec_idx].iter().map(|r| r.atom_idx));
    }
    out.comdat_groups = comdat_groups
        .into_iter()
        .map(|(signature, atoms)| ComdatGroup { signature, atoms })
        .collect();

    Ok(out)
}

fn short_name(raw: &[u8; 8]) -> &[u8] {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(8);
    &raw[..end]
}

fn coff_arch(coff: &CoffReader<'_>) -> Result<Arch, ParseError> {
    let header = coff.header()?;
    Ok(match header.machine.0 {
        c::IMAGE_FILE_MACHINE_AMD64 => Arch::X86_64,
        c::IMAGE_FILE_MACHINE_I386 => Arch::X86,
        c::IMAGE_FILE_MACHINE_ARM | c::IMAGE_FILE_MACHINE_ARMNT => Arch::Arm,
        c::IMAGE_FILE_MACHINE_ARM64 => Arch::AArch64,
        _ => Arch::All,
    })
}
