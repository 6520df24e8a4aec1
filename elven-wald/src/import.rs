//! `ImportTableBuilder` for the PE/COFF container: rewrites every
//! reference to a DLL-imported symbol into one targeting a synthesized
//! Import Address Table slot or an import thunk (`inject`), then builds
//! the raw `.idata$2`/`$4`/`$5`/`$6`/`$7` table bytes once
//! `AddressAssigner` has placed every atom (`finalize`). Mirrors
//! `dynamic.rs`'s two-phase split for the ELF `.got`/`.plt`/`.dynamic`
//! machinery; see DESIGN.md for how the two differ (PE imports are
//! resolved eagerly at load time, so there's no PLT0/lazy-binding
//! header to synthesize).

use std::collections::HashMap;

use bstr::BString;

use crate::{
    address_coff::CoffLayout,
    atom::{
        Arch, Atom, AtomId, ContentType, DeadStripPolicy, DefinedAtom, FileId, KindNamespace,
        MergePolicy, Permissions, RefKind, RefTarget, Reference, SectionChoice, Visibility,
    },
    context::{ContainerFamily, LinkContext},
    resolver::Resolver,
};

mod cc {
    pub use elven_coff::consts::*;
}

/// Reference kinds resolved by loading straight out of the IAT slot: a
/// direct address reference, typically the `__imp_`-prefixed symbol form.
const IAT_KINDS: &[u16] = &[cc::IMAGE_REL_AMD64_ADDR32, cc::IMAGE_REL_AMD64_ADDR32NB, cc::IMAGE_REL_AMD64_ADDR64];

fn is_thunk_kind(kind: u16) -> bool {
    (cc::IMAGE_REL_AMD64_REL32..=cc::IMAGE_REL_AMD64_REL32_5).contains(&kind)
}

pub struct ImportEntry {
    pub target: AtomId,
    pub hint_atom: AtomId,
    pub slot_index: usize,
}

pub struct DllImports {
    pub name_atom: AtomId,
    pub ilt_atom: AtomId,
    pub iat_atom: AtomId,
    pub entries: Vec<ImportEntry>,
}

#[derive(Default)]
pub struct ImportPlan {
    pub dlls: Vec<DllImports>,
    pub dir_table_atom: Option<AtomId>,
}

impl ImportPlan {
    fn is_empty(&self) -> bool {
        self.dlls.is_empty()
    }
}

struct Candidate {
    owner: AtomId,
    ref_idx: usize,
    target: AtomId,
    kind: u16,
}

fn atom_at<'a>(resolver: &'a Resolver, id: AtomId) -> Option<&'a Atom> {
    if id.file == FileId::SYNTHETIC {
        resolver.synthetic.atoms.get(id.idx.0 as usize)
    } else {
        resolver.files.get(id.file.0 as usize)?.atoms().get(id.idx.0 as usize)
    }
}

fn retarget(resolver: &mut Resolver, owner: AtomId, ref_idx: usize, new_target: AtomId, extra_addend: i64) {
    let atom = if owner.file == FileId::SYNTHETIC {
        resolver.synthetic.atoms.get_mut(owner.idx.0 as usize)
    } else {
        resolver.files.get_mut(owner.file.0 as usize).and_then(|f| f.atoms_mut().get_mut(owner.idx.0 as usize))
    };
    if let Some(Atom::Defined(d)) = atom {
        let r = &mut d.references[ref_idx];
        r.target = RefTarget::Atom(new_target);
        r.addend += extra_addend;
    }
}

fn collect_candidates(resolver: &Resolver) -> Vec<Candidate> {
    let mut out = Vec::new();
    for (file_idx, file) in resolver.files.iter().enumerate() {
        collect_from(crate::atom::FileId(file_idx as u32), file.atoms(), &mut out);
    }
    collect_from(FileId::SYNTHETIC, &resolver.synthetic.atoms, &mut out);
    out
}

fn collect_from(file: FileId, atoms: &[Atom], out: &mut Vec<Candidate>) {
    for (i, atom) in atoms.iter().enumerate() {
        let Atom::Defined(d) = atom else { continue };
        for (ref_idx, r) in d.references.iter().enumerate() {
            if r.kind.namespace() == KindNamespace::Layout {
                continue;
            }
            let RefKind::Coff(kind) = r.kind else { continue };
            if !IAT_KINDS.contains(&kind) && !is_thunk_kind(kind) {
                continue;
            }
            let RefTarget::Atom(target) = r.target else { continue };
            out.push(Candidate { owner: AtomId { file, idx: crate::atom::AtomIdx(i as u32) }, ref_idx, target, kind });
        }
    }
}

fn base_defined(content_type: ContentType, permissions: Permissions, section_name: &str, content: Vec<u8>, ordinal: u32) -> DefinedAtom {
    let size = content.len() as u64;
    DefinedAtom {
        content_type,
        permissions,
        align_pow2: 3,
        align_modulus: 1,
        binding: crate::atom::Binding::Local,
        visibility: Visibility::Hidden,
        merge: MergePolicy::NoMerge,
        section_choice: SectionChoice::ContentDerived,
        section_name: BString::from(section_name.as_bytes().to_vec()),
        dead_strip: DeadStripPolicy::Never,
        ordinal,
        content,
        size,
        references: Vec::new(),
        name: None,
    }
}

fn push_synthetic(resolver: &mut Resolver, atom: DefinedAtom) -> AtomId {
    let idx = crate::atom::AtomIdx(resolver.synthetic.atoms.len() as u32);
    resolver.synthetic.atoms.push(Atom::Defined(atom));
    AtomId { file: FileId::SYNTHETIC, idx }
}

/// Null-terminated byte string, padded to an even length (the convention
/// `.idata$6`'s Hint/Name entries and `.idata$7`'s DLL name strings both
/// follow, so every subsequent entry stays 2-byte aligned).
fn padded_cstr(bytes: &[u8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out.push(0);
    if out.len() % 2 != 0 {
        out.push(0);
    }
    out
}

/// Rewrites every reference to a DLL-imported symbol into one targeting a
/// synthesized IAT slot (direct-address kinds) or import thunk (call-site
/// kinds), and builds the placeholder `.idata$2`/`$4`/`$5`/`$6`/`$7` atoms
/// those slots live in. Must run after `Resolver::finish` and before
/// `DeadStrip`/`LayoutEngine`.
pub fn inject(resolver: &mut Resolver, ctx: &LinkContext) -> ImportPlan {
    let mut plan = ImportPlan::default();
    if ctx.container != ContainerFamily::Coff {
        return plan;
    }

    let candidates = collect_candidates(resolver);
    if candidates.is_empty() {
        return plan;
    }

    // One IAT/ILT slot per distinct imported target, grouped by the DLL
    // that exports it, in first-seen order.
    let mut dll_index_of: HashMap<BString, usize> = HashMap::new();
    let mut slot_of: HashMap<AtomId, (usize, usize)> = HashMap::new();
    let mut thunk_of: HashMap<AtomId, AtomId> = HashMap::new();
    let mut dll_names: Vec<BString> = Vec::new();
    let mut dll_entries: Vec<Vec<ImportEntry>> = Vec::new();

    for c in &candidates {
        if slot_of.contains_key(&c.target) {
            continue;
        }
        let Some(Atom::SharedLibrary(lib)) = atom_at(resolver, c.target) else { continue };
        let dll = lib.dso.clone();
        let hint = lib.ordinal.unwrap_or(0);
        let sym_name = lib.name.clone();

        let dll_idx = *dll_index_of.entry(dll.clone()).or_insert_with(|| {
            dll_names.push(dll.clone());
            dll_entries.push(Vec::new());
            dll_names.len() - 1
        });

        let hint_content = {
            let mut v = Vec::with_capacity(2 + sym_name.len() + 2);
            v.extend_from_slice(&hint.to_le_bytes());
            v.extend(padded_cstr(sym_name.as_slice()));
            v
        };
        let ordinal = resolver.synthetic.atoms.len() as u32;
        let hint_atom = push_synthetic(resolver, base_defined(ContentType::Data, Permissions::R, ".idata$6", hint_content, ordinal));

        let slot_index = dll_entries[dll_idx].len();
        dll_entries[dll_idx].push(ImportEntry { target: c.target, hint_atom, slot_index });
        slot_of.insert(c.target, (dll_idx, slot_index));
    }

    if dll_names.is_empty() {
        return plan;
    }

    let mut dlls: Vec<DllImports> = Vec::with_capacity(dll_names.len());
    for (dll_idx, name) in dll_names.into_iter().enumerate() {
        let entries = std::mem::take(&mut dll_entries[dll_idx]);
        let n_slots = entries.len() + 1; // +1 null terminator

        let name_ordinal = resolver.synthetic.atoms.len() as u32;
        let name_atom = push_synthetic(
            resolver,
            base_defined(ContentType::Data, Permissions::R, ".idata$7", padded_cstr(name.as_slice()), name_ordinal),
        );

        let ilt_ordinal = resolver.synthetic.atoms.len() as u32;
        let ilt_atom =
            push_synthetic(resolver, base_defined(ContentType::Data, Permissions::R, ".idata$4", vec![0u8; n_slots * 8], ilt_ordinal));

        let iat_ordinal = resolver.synthetic.atoms.len() as u32;
        let iat_atom =
            push_synthetic(resolver, base_defined(ContentType::Data, Permissions::RW, ".idata$5", vec![0u8; n_slots * 8], iat_ordinal));

        dlls.push(DllImports { name_atom, ilt_atom, iat_atom, entries });
    }

    let n_dirs = dlls.len() + 1; // +1 null terminator entry
    let dir_ordinal = resolver.synthetic.atoms.len() as u32;
    let dir_table_atom =
        push_synthetic(resolver, base_defined(ContentType::Data, Permissions::R, ".idata$2", vec![0u8; n_dirs * 20], dir_ordinal));

    // Rewrite every candidate reference.
    for c in &candidates {
        let Some(&(dll_idx, slot_index)) = slot_of.get(&c.target) else { continue };
        let iat_atom = dlls[dll_idx].iat_atom;
        let slot_addend = (slot_index * 8) as i64;

        if IAT_KINDS.contains(&c.kind) {
            retarget(resolver, c.owner, c.ref_idx, iat_atom, slot_addend);
        } else {
            let thunk = *thunk_of.entry(c.target).or_insert_with(|| {
                let ordinal = resolver.synthetic.atoms.len() as u32;
                let mut thunk_atom =
                    base_defined(ContentType::Code, Permissions::RX, ".text$yimp", THUNK_TEMPLATE.to_vec(), ordinal);
                thunk_atom.references.push(Reference {
                    offset_in_atom: 2,
                    target: RefTarget::Atom(iat_atom),
                    kind: RefKind::Coff(cc::IMAGE_REL_AMD64_REL32),
                    arch: Arch::X86_64,
                    addend: slot_addend,
                });
                push_synthetic(resolver, thunk_atom)
            });
            retarget(resolver, c.owner, c.ref_idx, thunk, 0);
        }
    }

    plan.dlls = dlls;
    plan.dir_table_atom = Some(dir_table_atom);
    plan
}

/// `jmp qword ptr [rip + &iat_slot]`, padded to 16 bytes with `int3` the
/// way an unreachable-after-jmp stub conventionally is.
const THUNK_TEMPLATE: [u8; 16] = [
    0xff, 0x25, 0, 0, 0, 0, // jmp qword [rip + disp32]
    0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc,
];

/// Writes the RVA-dependent bytes of every `.idata` table atom `inject`
/// placed: ILT/IAT thunk-data entries, and the Import Directory Table.
/// Must run after `AddressAssigner` and before `RelocEngine` (the import
/// thunks' own `REL32` reference to their IAT slot is left to
/// `RelocEngine`, same as `dynamic.rs`'s PLT stubs).
pub fn finalize(layout: &mut CoffLayout, plan: &ImportPlan) {
    if plan.is_empty() {
        return;
    }
    let image_base = layout.image_base;

    for dll in &plan.dlls {
        let (Some(ilt), Some(iat)) =
            (layout.placements.get(&dll.ilt_atom).map(|p| (p.section_idx, p.offset_in_section)), layout
                .placements
                .get(&dll.iat_atom)
                .map(|p| (p.section_idx, p.offset_in_section)))
        else {
            continue;
        };
        for entry in &dll.entries {
            let Some(hint_p) = layout.placements.get(&entry.hint_atom) else { continue };
            let thunk_value = hint_p.addr; // VA of the Hint/Name entry; high bit 0 selects import-by-name.
            let off = entry.slot_index * 8;
            layout.section_content[ilt.0][ilt.1 as usize + off..ilt.1 as usize + off + 8]
                .copy_from_slice(&thunk_value.to_le_bytes());
            layout.section_content[iat.0][iat.1 as usize + off..iat.1 as usize + off + 8]
                .copy_from_slice(&thunk_value.to_le_bytes());
        }
    }

    if let Some(dir_atom) = plan.dir_table_atom {
        if let Some(dir_p) = layout.placements.get(&dir_atom) {
            let (dir_section_idx, dir_off) = (dir_p.section_idx, dir_p.offset_in_section);
            for (i, dll) in plan.dlls.iter().enumerate() {
                let Some(ilt_p) = layout.placements.get(&dll.ilt_atom) else { continue };
                let Some(iat_p) = layout.placements.get(&dll.iat_atom) else { continue };
                let Some(name_p) = layout.placements.get(&dll.name_atom) else { continue };
                let entry_off = dir_off as usize + i * 20;
                let ilt_rva = (ilt_p.addr - image_base) as u32;
                let iat_rva = (iat_p.addr - image_base) as u32;
                let name_rva = (name_p.addr - image_base) as u32;
                let buf = &mut layout.section_content[dir_section_idx];
                buf[entry_off..entry_off + 4].copy_from_slice(&ilt_rva.to_le_bytes());
                buf[entry_off + 4..entry_off + 8].copy_from_slice(&0u32.to_le_bytes());
                buf[entry_off + 8..entry_off + 12].copy_from_slice(&0u32.to_le_bytes());
                buf[entry_off + 12..entry_off + 16].copy_from_slice(&name_rva.to_le_bytes());
                buf[entry_off + 16..entry_off + 20].copy_from_slice(&iat_rva.to_le_bytes());
            }

            layout.writer.set_data_directory(
                cc::IMAGE_DIRECTORY_ENTRY_IMPORT,
                (dir_p.addr - image_base) as u32,
                (plan.dlls.len() as u32 + 1) * 20,
            );
        }
    }

    let mut iat_min = u64::MAX;
    let mut iat_max = 0u64;
    for dll in &plan.dlls {
        if let Some(p) = layout.placements.get(&dll.iat_atom) {
            iat_min = iat_min.min(p.addr);
            iat_max = iat_max.max(p.addr + (dll.entries.len() as u64 + 1) * 8);
        }
    }
    if iat_min <= iat_max && iat_min != u64::MAX {
        layout.writer.set_data_directory(cc::IMAGE_DIRECTORY_ENTRY_IAT, (iat_min - image_base) as u32, (iat_max - iat_min) as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_cstr_pads_odd_length_names_to_even() {
        assert_eq!(padded_cstr(b"Foo"), vec![b'F', b'o', b'o', 0, 0]);
        assert_eq!(padded_cstr(b"Four"), vec![b'F', b'o', b'u', b'r', 0]);
    }

    #[test]
    fn is_thunk_kind_covers_rel32_family_only() {
        assert!(is_thunk_kind(cc::IMAGE_REL_AMD64_REL32));
        assert!(is_thunk_kind(cc::IMAGE_REL_AMD64_REL32_5));
        assert!(!is_thunk_kind(cc::IMAGE_REL_AMD64_ADDR32));
        assert!(!is_thunk_kind(cc::IMAGE_REL_AMD64_SECTION));
    }
}
