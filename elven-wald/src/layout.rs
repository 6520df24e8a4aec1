//! `LayoutEngine`: groups live atoms into output sections,
//! discards losing COMDAT groups, and orders both the atoms within a
//! section and the sections themselves.

use std::collections::{HashMap, HashSet};

use bstr::{BStr, BString};

use crate::{
    atom::{Atom, AtomId, ContentType, FileId, Permissions},
    context::{ContainerFamily, LinkContext},
    resolver::Resolver,
};

#[derive(Debug)]
pub struct OutputSection {
    pub name: BString,
    pub permissions: Permissions,
    pub is_nobits: bool,
    pub is_tls: bool,
    pub atoms: Vec<AtomId>,
}

/// For each COMDAT signature seen across every non-synthetic input file,
/// only the first file to define it (in file-arrival order) is kept; every
/// atom belonging to a later group with the same signature is discarded
/// outright, independent of reachability.
pub fn discarded_comdat_atoms(resolver: &Resolver) -> HashSet<AtomId> {
    let mut winners: HashMap<BString, u32> = HashMap::new();
    let mut discarded = HashSet::new();

    for (file_idx, file) in resolver.files.iter().enumerate() {
        for group in file.comdat_groups() {
            winners.entry(group.signature.clone()).or_insert(file_idx as u32);
        }
    }

    for (file_idx, file) in resolver.files.iter().enumerate() {
        for group in file.comdat_groups() {
            if winners[&group.signature] != file_idx as u32 {
                for &atom_idx in &group.atoms {
                    discarded.insert(AtomId {
                        file: FileId(file_idx as u32),
                        idx: atom_idx,
                    });
                }
            }
        }
    }

    discarded
}

/// Derive the canonical output-section name from an input section name:
/// strip a COFF grouped-section `$suffix` and fold standard ELF section
/// families together.
pub fn canonical_section_name(name: &BStr, container: ContainerFamily) -> BString {
    let name_bytes: &[u8] = name.as_ref();
    let base: &[u8] = if container == ContainerFamily::Coff {
        match name_bytes.iter().position(|&b| b == b'$') {
            Some(pos) => &name_bytes[..pos],
            None => name_bytes,
        }
    } else {
        name_bytes
    };

    const FAMILIES: &[&[u8]] = &[
        b".text", b".rodata", b".data.rel.ro", b".data", b".bss", b".tbss", b".tdata", b".init_array",
        b".fini_array", b".init", b".fini", b".ctors", b".dtors", b".eh_frame",
    ];
    for family in FAMILIES {
        let dotted_prefix = [*family, b"."].concat();
        if base == *family || base.starts_with(dotted_prefix.as_slice()) {
            return BString::from(family.to_vec());
        }
    }
    BString::from(base.to_vec())
}

/// Groups live, non-discarded atoms into `OutputSection`s keyed on
/// `(canonical name, permissions)` and orders both the atoms inside each
/// and the sections themselves.
pub fn build_output_sections(
    resolver: &Resolver,
    live: &HashSet<AtomId>,
    discarded_comdat: &HashSet<AtomId>,
    ctx: &LinkContext,
) -> Vec<OutputSection> {
    struct Entry {
        id: AtomId,
        section_name: BString,
        permissions: Permissions,
        is_nobits: bool,
        is_tls: bool,
        file_ordinal: u32,
        ordinal: u32,
        priority: Option<u32>,
        /// COFF grouped-section `$suffix` (e.g. `mn` of `.text$mn`), empty
        /// for ELF or for a COFF section with no `$`. Sorted
        /// lexicographically ahead of file/atom ordinal so `.idata$2`
        /// lands before `.idata$5` regardless of which file defined each.
        group_suffix: Vec<u8>,
    }

    let mut entries: Vec<Entry> = Vec::new();

    let mut push_entry = |id: AtomId, file_ordinal: u32| {
        if !live.contains(&id) || discarded_comdat.contains(&id) {
            return;
        }
        let atom = atom_at(resolver, id).expect("live atom must exist");
        let Atom::Defined(d) = atom else { return };
        let canon = canonical_section_name(&d.section_name, ctx.container);
        let priority = init_array_priority(&d.section_name, &canon);
        let group_suffix = coff_group_suffix(&d.section_name, ctx.container);
        entries.push(Entry {
            id,
            section_name: canon,
            permissions: d.permissions,
            is_nobits: d.content_type.is_zero_fill(),
            is_tls: d.content_type.is_tls(),
            file_ordinal,
            ordinal: d.ordinal,
            priority,
            group_suffix,
        });
    };

    for (file_idx, file) in resolver.files.iter().enumerate() {
        for i in 0..file.atoms().len() {
            push_entry(
                AtomId { file: FileId(file_idx as u32), idx: crate::atom::AtomIdx(i as u32) },
                file_idx as u32,
            );
        }
    }
    for i in 0..resolver.synthetic.atoms.len() {
        push_entry(
            AtomId { file: FileId::SYNTHETIC, idx: crate::atom::AtomIdx(i as u32) },
            u32::MAX,
        );
    }

    let mut by_section: HashMap<BString, Vec<Entry>> = HashMap::new();
    for e in entries {
        by_section.entry(e.section_name.clone()).or_default().push(e);
    }

    let mut sections: Vec<OutputSection> = Vec::new();
    for (name, mut group) in by_section {
        // Rule 3/4: init/fini-array and ctors/dtors families sort by
        // numeric priority (missing -> +inf), ties by file then atom
        // ordinal. Everything else keeps file/atom ordinal order, which
        // for a single file matches source order (ordinal stability)
        // and across files uses file arrival as tie-breaker.
        group.sort_by(|a, b| {
            (a.priority.unwrap_or(u32::MAX), &a.group_suffix, a.file_ordinal, a.ordinal).cmp(&(
                b.priority.unwrap_or(u32::MAX),
                &b.group_suffix,
                b.file_ordinal,
                b.ordinal,
            ))
        });
        let permissions = group
            .iter()
            .fold(Permissions { read: false, write: false, execute: false }, |acc, e| Permissions {
                read: acc.read || e.permissions.read,
                write: acc.write || e.permissions.write,
                execute: acc.execute || e.permissions.execute,
            });
        let is_nobits = group.iter().all(|e| e.is_nobits) && !group.is_empty();
        let is_tls = group.iter().any(|e| e.is_tls);
        sections.push(OutputSection {
            name,
            permissions,
            is_nobits,
            is_tls,
            atoms: group.into_iter().map(|e| e.id).collect(),
        });
    }

    // Output-section ordering: loadable before non-loadable (everything
    // here is loadable), read-only before writable, executable before
    // writable-data, NOBITS last within matching permissions so a
    // segment's `p_memsz > p_filesz` tail stays contiguous.
    sections.sort_by_key(|s| (s.permissions.order_key(), s.is_nobits, s.name.clone()));
    sections
}

fn atom_at<'a>(resolver: &'a Resolver, id: AtomId) -> Option<&'a Atom> {
    if id.file == FileId::SYNTHETIC {
        resolver.synthetic.atoms.get(id.idx.0 as usize)
    } else {
        resolver.files.get(id.file.0 as usize)?.atoms().get(id.idx.0 as usize)
    }
}

/// The raw bytes after a COFF grouped-section `$`, e.g. `mn` for
/// `.text$mn`. Empty for ELF (no such convention) or a COFF name without
/// a `$`.
fn coff_group_suffix(name: &BStr, container: ContainerFamily) -> Vec<u8> {
    if container != ContainerFamily::Coff {
        return Vec::new();
    }
    let bytes: &[u8] = name.as_ref();
    match bytes.iter().position(|&b| b == b'$') {
        Some(pos) => bytes[pos + 1..].to_vec(),
        None => Vec::new(),
    }
}

/// `.init_array.N`/`.ctors.N`-style numeric priority suffix, or `None` for
/// the base name (sorted last).
fn init_array_priority(original: &BStr, canon: &BStr) -> Option<u32> {
    let canon_bytes: &[u8] = canon.as_ref();
    if !matches!(canon_bytes, b".init_array" | b".fini_array" | b".ctors" | b".dtors") {
        return None;
    }
    let original_bytes: &[u8] = original.as_ref();
    let rest = original_bytes.get(canon_bytes.len()..)?;
    let rest = rest.strip_prefix(b".")?;
    std::str::from_utf8(rest).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bstr::ByteSlice;

    #[test]
    fn canonical_name_elf_numeric_suffix() {
        let name = b".text.foo".as_bstr();
        assert_eq!(canonical_section_name(name, ContainerFamily::Elf), ".text");
        let name = b".rodata.str1.1".as_bstr();
        assert_eq!(canonical_section_name(name, ContainerFamily::Elf), ".rodata");
    }

    #[test]
    fn canonical_name_elf_exact_match_unaffected() {
        let name = b".bss".as_bstr();
        assert_eq!(canonical_section_name(name, ContainerFamily::Elf), ".bss");
    }

    #[test]
    fn canonical_name_unknown_family_passes_through() {
        let name = b".mysection".as_bstr();
        assert_eq!(canonical_section_name(name, ContainerFamily::Elf), ".mysection");
    }

    #[test]
    fn canonical_name_coff_strips_dollar_suffix() {
        let name = b".text$mn".as_bstr();
        assert_eq!(canonical_section_name(name, ContainerFamily::Coff), ".text");
    }

    #[test]
    fn coff_group_suffix_orders_dollar_groups_lexicographically() {
        assert!(coff_group_suffix(b".idata$2".as_bstr(), ContainerFamily::Coff) < coff_group_suffix(b".idata$5".as_bstr(), ContainerFamily::Coff));
        assert_eq!(coff_group_suffix(b".text".as_bstr(), ContainerFamily::Coff), Vec::<u8>::new());
        assert_eq!(coff_group_suffix(b".text$mn".as_bstr(), ContainerFamily::Elf), Vec::<u8>::new());
    }

    #[test]
    fn init_array_priority_reads_numeric_suffix() {
        let original = b".init_array.00100".as_bstr();
        let canon = b".init_array".as_bstr();
        assert_eq!(init_array_priority(original, canon), Some(100));
    }

    #[test]
    fn init_array_priority_none_for_base_name() {
        let original = b".init_array".as_bstr();
        let canon = b".init_array".as_bstr();
        assert_eq!(init_array_priority(original, canon), None);
    }

    #[test]
    fn init_array_priority_none_outside_priority_families() {
        let original = b".text.5".as_bstr();
        let canon = b".text".as_bstr();
        assert_eq!(init_array_priority(original, canon), None);
    }
}
