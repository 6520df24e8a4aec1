//! `DynamicTableBuilder` for the ELF container: synthesizes the `.got`/
//! `.got.plt`/`.plt` atoms GOT- and PLT-relative references need
//! (`inject`), then the `.dynsym`/`.dynstr`/`.hash`/`.rela.dyn`/
//! `.rela.plt`/`.dynamic`/`.interp` raw tables a dynamically-linked
//! output requires (`finalize`), once `AddressAssigner` has placed every
//! atom and before `RelocEngine` runs.
//!
//! Only the classic SysV `.hash` is emitted, not `.gnu.hash`; see
//! DESIGN.md for the full list of simplifications this builder makes
//! relative to a production dynamic linker.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroU64;

use bstr::BString;
use elven_parser::{
    consts::{self as c, PhFlags, PhType, SectionIdx, ShFlags, ShType},
    read::{Dyn, Rela, RelInfo, Sym, SymInfo},
    write::{ProgramHeader, Section, SectionRelativeAbsoluteAddr},
    Addr, Offset,
};

use crate::{
    address::ElfLayout,
    atom::{
        Arch, Atom, AtomId, ContentType, DeadStripPolicy, DefinedAtom, FileId, KindNamespace,
        MergePolicy, Permissions, RefKind, RefTarget, Reference, SectionChoice, Visibility,
    },
    context::{ContainerFamily, LinkContext, OutputKind},
    file::InputFile,
    resolver::Resolver,
    utils::AlignExt,
};

const GOT_KINDS: &[u32] = &[c::R_X86_64_GOTPCREL, c::R_X86_64_GOTPCRELX, c::R_X86_64_REX_GOTPCRELX];
const PLT_CALL_KINDS: &[u32] = &[c::R_X86_64_PLT32, c::R_X86_64_PC32];

/// A single PLT stub's triple: the import it resolves, the `.plt` stub
/// atom itself, and the `.got.plt` slot it jumps through. Indexed by
/// creation order, which is also the `.rela.plt` / lazy-binding index
/// baked into the stub's `push $index` instruction.
pub struct PltEntry {
    pub target: AtomId,
    pub plt: AtomId,
    pub gotplt: AtomId,
}

#[derive(Default)]
pub struct DynamicPlan {
    /// GOT-relative reference target -> synthesized `.got` slot atom.
    pub got_map: HashMap<AtomId, AtomId>,
    pub plt_map: HashMap<AtomId, AtomId>,
    pub plt_entries: Vec<PltEntry>,
    pub plt0: Option<AtomId>,
    /// Every distinct `SharedLibraryAtom` a GOT or PLT slot was created
    /// for, in first-seen order -- the order `.dynsym`'s import block is
    /// written in.
    pub imports: Vec<AtomId>,
}

impl DynamicPlan {
    fn is_empty(&self) -> bool {
        self.got_map.is_empty() && self.plt_entries.is_empty()
    }
}

/// True when this link needs any dynamic-linking machinery at all: a
/// shared-library output, `--export-dynamic`, or any shared object among
/// the inputs.
pub fn needs_dynamic(resolver: &Resolver, ctx: &LinkContext) -> bool {
    ctx.container == ContainerFamily::Elf
        && (ctx.output_kind == OutputKind::SharedLibrary
            || ctx.export_dynamic
            || !ctx.dynamic_list_patterns.is_empty()
            || resolver.files.iter().any(|f| matches!(f, InputFile::SharedObject(_))))
}

/// How many extra program headers `finalize` will add on top of the
/// `PT_LOAD` segments `AddressAssigner` already produces for ordinary
/// atoms: one combined `PT_LOAD` for every dynamic-linking table, one
/// `PT_DYNAMIC`, and (executables only) one `PT_INTERP`.
pub fn extra_phdr_count(ctx: &LinkContext, needs_dynamic: bool) -> usize {
    if !needs_dynamic {
        return 0;
    }
    let interp = usize::from(ctx.output_kind == OutputKind::Executable);
    2 + interp
}

struct Candidate {
    owner: AtomId,
    ref_idx: usize,
    target: AtomId,
    kind: u32,
}

fn atom_at<'a>(resolver: &'a Resolver, id: AtomId) -> Option<&'a Atom> {
    if id.file == FileId::SYNTHETIC {
        resolver.synthetic.atoms.get(id.idx.0 as usize)
    } else {
        resolver.files.get(id.file.0 as usize)?.atoms().get(id.idx.0 as usize)
    }
}

fn set_reference_target(resolver: &mut Resolver, owner: AtomId, ref_idx: usize, new_target: AtomId) {
    let atom = if owner.file == FileId::SYNTHETIC {
        resolver.synthetic.atoms.get_mut(owner.idx.0 as usize)
    } else {
        resolver
            .files
            .get_mut(owner.file.0 as usize)
            .and_then(|f| f.atoms_mut().get_mut(owner.idx.0 as usize))
    };
    if let Some(Atom::Defined(d)) = atom {
        d.references[ref_idx].target = RefTarget::Atom(new_target);
    }
}

fn collect_candidates(resolver: &Resolver) -> Vec<Candidate> {
    let mut out = Vec::new();
    for (file_idx, file) in resolver.files.iter().enumerate() {
        collect_from(FileId(file_idx as u32), file.atoms(), &mut out);
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
            let RefKind::Elf(kind) = r.kind else { continue };
            if !GOT_KINDS.contains(&kind) && !PLT_CALL_KINDS.contains(&kind) {
                continue;
            }
            let RefTarget::Atom(target) = r.target else { continue };
            out.push(Candidate {
                owner: AtomId { file, idx: crate::atom::AtomIdx(i as u32) },
                ref_idx,
                target,
                kind,
            });
        }
    }
}

fn base_defined(content_type: ContentType, permissions: Permissions, section_name: &str, size: u64, content: Vec<u8>, ordinal: u32) -> DefinedAtom {
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

fn note_import(plan: &mut DynamicPlan, seen: &mut HashSet<AtomId>, target: AtomId) {
    if seen.insert(target) {
        plan.imports.push(target);
    }
}

/// Rewrites every GOT/PLT-relative reference into one targeting a
/// synthesized slot atom, and builds the `.got`/`.got.plt`/`.plt` atoms
/// those slots live in. Must run after `Resolver::finish` (every
/// reference is `RefTarget::Atom` by then) and before `DeadStrip`/
/// `LayoutEngine` (the new atoms need to participate in both).
pub fn inject(resolver: &mut Resolver, ctx: &LinkContext) -> DynamicPlan {
    let mut plan = DynamicPlan::default();
    if ctx.container != ContainerFamily::Elf {
        return plan;
    }

    let candidates = collect_candidates(resolver);
    if candidates.is_empty() {
        return plan;
    }

    let mut imports_seen: HashSet<AtomId> = HashSet::new();

    // Pass 1: one `.got` slot per distinct GOT-relative target.
    for c in &candidates {
        if !GOT_KINDS.contains(&c.kind) || plan.got_map.contains_key(&c.target) {
            continue;
        }
        let is_shared = matches!(atom_at(resolver, c.target), Some(Atom::SharedLibrary(_)));
        if is_shared {
            note_import(&mut plan, &mut imports_seen, c.target);
        }
        let ordinal = resolver.synthetic.atoms.len() as u32;
        let mut atom = base_defined(ContentType::Got, Permissions::RW, ".got", 8, vec![0; 8], ordinal);
        if !is_shared {
            // Baked directly rather than emitted as a runtime
            // `R_X86_64_RELATIVE` dynamic relocation -- see DESIGN.md.
            atom.references.push(Reference {
                offset_in_atom: 0,
                target: RefTarget::Atom(c.target),
                kind: RefKind::Elf(c::R_X86_64_64),
                arch: Arch::X86_64,
                addend: 0,
            });
        }
        let idx = resolver.synthetic.push(Atom::Defined(atom));
        plan.got_map.insert(c.target, AtomId { file: FileId::SYNTHETIC, idx });
    }

    // Pass 2: one `.plt` stub (plus its `.got.plt` slot) per distinct
    // shared-library target actually reached through a call-site
    // reference. A `PC32`/`PLT32` reference to a local definition never
    // matches here, so ordinary direct calls are left untouched.
    for c in &candidates {
        if !PLT_CALL_KINDS.contains(&c.kind) || plan.plt_map.contains_key(&c.target) {
            continue;
        }
        if !matches!(atom_at(resolver, c.target), Some(Atom::SharedLibrary(_))) {
            continue;
        }
        note_import(&mut plan, &mut imports_seen, c.target);
        if plan.plt0.is_none() {
            plan.plt0 = Some(make_plt_header(resolver));
        }
        let plt0 = plan.plt0.expect("just set");
        let reloc_index = plan.plt_entries.len() as u32;
        let (plt_id, gotplt_id) = make_plt_stub(resolver, plt0, reloc_index);
        plan.plt_map.insert(c.target, plt_id);
        plan.plt_entries.push(PltEntry { target: c.target, plt: plt_id, gotplt: gotplt_id });
    }

    // Pass 3: rewrite every candidate reference's target to its slot.
    for c in &candidates {
        let new_target = if GOT_KINDS.contains(&c.kind) {
            plan.got_map.get(&c.target).copied()
        } else {
            plan.plt_map.get(&c.target).copied()
        };
        let Some(new_target) = new_target else { continue };
        set_reference_target(resolver, c.owner, c.ref_idx, new_target);
    }

    plan
}

const PLT0_TEMPLATE: [u8; 16] = [
    0xff, 0x35, 0, 0, 0, 0, // push qword [rip + &.got.plt[1]]
    0xff, 0x25, 0, 0, 0, 0, // jmp  qword [rip + &.got.plt[2]]
    0x0f, 0x1f, 0x40, 0x00, // nop
];

const PLTN_TEMPLATE: [u8; 16] = [
    0xff, 0x25, 0, 0, 0, 0, // jmp  qword [rip + &.got.plt[n]]
    0x68, 0, 0, 0, 0, // push $reloc_index
    0xe9, 0, 0, 0, 0, // jmp  plt0
];

fn gotplt_slot(resolver: &mut Resolver) -> AtomId {
    let ordinal = resolver.synthetic.atoms.len() as u32;
    let atom = base_defined(ContentType::GotPlt, Permissions::RW, ".got.plt", 8, vec![0; 8], ordinal);
    let idx = resolver.synthetic.push(Atom::Defined(atom));
    AtomId { file: FileId::SYNTHETIC, idx }
}

/// `.got.plt`'s three reserved header slots (`.dynamic`'s address --
/// left zero, no atom models `.dynamic` itself -- then the two words the
/// dynamic linker fills with the link map and its lazy-resolver entry
/// point) plus `PLT0`, the stub every lazily-bound call falls through to
/// on first use.
fn make_plt_header(resolver: &mut Resolver) -> AtomId {
    let _dynamic_ptr_slot = gotplt_slot(resolver);
    let linker_slot = gotplt_slot(resolver);
    let resolver_slot = gotplt_slot(resolver);

    let ordinal = resolver.synthetic.atoms.len() as u32;
    let mut plt0 = base_defined(ContentType::Plt, Permissions::RX, ".plt", 16, PLT0_TEMPLATE.to_vec(), ordinal);
    plt0.references.push(Reference {
        offset_in_atom: 2,
        target: RefTarget::Atom(linker_slot),
        kind: RefKind::Elf(c::R_X86_64_PC32),
        arch: Arch::X86_64,
        addend: -4,
    });
    plt0.references.push(Reference {
        offset_in_atom: 8,
        target: RefTarget::Atom(resolver_slot),
        kind: RefKind::Elf(c::R_X86_64_PC32),
        arch: Arch::X86_64,
        addend: -4,
    });
    let idx = resolver.synthetic.push(Atom::Defined(plt0));
    AtomId { file: FileId::SYNTHETIC, idx }
}

/// One `(plt, got.plt)` pair. The `.got.plt` slot's initial value (a
/// pointer back into the middle of its own stub, for the lazy-binding
/// path) can't be a `Reference` -- it isn't known until `finalize` has
/// the stub's placed address -- so it's patched directly there instead.
fn make_plt_stub(resolver: &mut Resolver, plt0: AtomId, reloc_index: u32) -> (AtomId, AtomId) {
    let gotplt_id = gotplt_slot(resolver);

    let mut content = PLTN_TEMPLATE.to_vec();
    content[7..11].copy_from_slice(&reloc_index.to_le_bytes());
    let ordinal = resolver.synthetic.atoms.len() as u32;
    let mut plt = base_defined(ContentType::Plt, Permissions::RX, ".plt", 16, content, ordinal);
    plt.references.push(Reference {
        offset_in_atom: 2,
        target: RefTarget::Atom(gotplt_id),
        kind: RefKind::Elf(c::R_X86_64_PC32),
        arch: Arch::X86_64,
        addend: -4,
    });
    plt.references.push(Reference {
        offset_in_atom: 12,
        target: RefTarget::Atom(plt0),
        kind: RefKind::Elf(c::R_X86_64_PC32),
        arch: Arch::X86_64,
        addend: -4,
    });
    let idx = resolver.synthetic.push(Atom::Defined(plt));
    (AtomId { file: FileId::SYNTHETIC, idx }, gotplt_id)
}

/// Classic SysV `elf_hash` (the one every `DT_HASH` implementation since
/// the System V ABI uses; `.gnu.hash` is a different, unimplemented,
/// algorithm -- see DESIGN.md).
fn elf_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in name {
        h = (h << 4).wrapping_add(b as u32);
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

struct DynStrBuilder {
    content: Vec<u8>,
    offsets: HashMap<BString, u32>,
}

impl DynStrBuilder {
    fn new() -> Self {
        Self { content: vec![0], offsets: HashMap::new() }
    }

    fn intern(&mut self, name: &BString) -> u32 {
        if let Some(&off) = self.offsets.get(name) {
            return off;
        }
        let off = self.content.len() as u32;
        self.content.extend_from_slice(name.as_slice());
        self.content.push(0);
        self.offsets.insert(name.clone(), off);
        off
    }
}

/// Synthesizes `.dynsym`/`.dynstr`/`.hash`/`.rela.dyn`/`.rela.plt`/
/// `.dynamic`/`.interp` and appends them (plus the program headers
/// `extra_phdr_count` budgeted for) right after the last atom-bearing
/// section `AddressAssigner` placed.
pub fn finalize(
    resolver: &Resolver,
    layout: &mut ElfLayout,
    live: &HashSet<AtomId>,
    plan: &DynamicPlan,
    ctx: &LinkContext,
) {
    let export_dynsym = ctx.output_kind == OutputKind::SharedLibrary || ctx.export_dynamic;
    if plan.is_empty() && !export_dynsym && ctx.dynamic_list_patterns.is_empty() {
        return;
    }

    let mut dynstr = DynStrBuilder::new();
    let mut syms: Vec<Sym> = vec![Sym {
        name: elven_parser::read::StringIdx(0),
        info: SymInfo(0),
        other: c::SymbolVisibility(0),
        shndx: SectionIdx(c::SHN_UNDEF),
        value: Addr(0),
        size: 0,
    }];
    let mut dynsym_idx: HashMap<AtomId, u32> = HashMap::new();

    for &target in &plan.imports {
        let name = atom_at(resolver, target).and_then(Atom::name).cloned().unwrap_or_default();
        let is_func = plan.plt_entries.iter().any(|e| e.target == target);
        dynstr.intern(&name);
        dynsym_idx.insert(target, syms.len() as u32);
        syms.push(Sym {
            name: elven_parser::read::StringIdx(*dynstr.offsets.get(&name).unwrap()),
            info: SymInfo((c::STB_GLOBAL << 4) | if is_func { c::STT_FUNC } else { c::STT_NOTYPE }),
            other: c::SymbolVisibility(0),
            shndx: SectionIdx(c::SHN_UNDEF),
            value: Addr(0),
            size: 0,
        });
    }

    if export_dynsym {
        let mut export_targets: Vec<AtomId> = Vec::new();
        for (file_idx, file) in resolver.files.iter().enumerate() {
            for i in 0..file.atoms().len() {
                export_targets.push(AtomId { file: FileId(file_idx as u32), idx: crate::atom::AtomIdx(i as u32) });
            }
        }
        for i in 0..resolver.synthetic.atoms.len() {
            export_targets.push(AtomId { file: FileId::SYNTHETIC, idx: crate::atom::AtomIdx(i as u32) });
        }

        for id in export_targets {
            if !live.contains(&id) {
                continue;
            }
            let Some(Atom::Defined(d)) = atom_at(resolver, id) else { continue };
            let Some(name) = &d.name else { continue };
            if matches!(d.visibility, Visibility::Hidden | Visibility::Internal) {
                continue;
            }
            let Some(placement) = layout.placements.get(&id) else { continue };
            dynstr.intern(name);
            dynsym_idx.insert(id, syms.len() as u32);
            let bind = match d.binding {
                crate::atom::Binding::Weak => c::STB_WEAK,
                _ => c::STB_GLOBAL,
            };
            let ty = if matches!(d.content_type, ContentType::Code) { c::STT_FUNC } else { c::STT_OBJECT };
            syms.push(Sym {
                name: elven_parser::read::StringIdx(*dynstr.offsets.get(name).unwrap()),
                info: SymInfo((bind << 4) | ty),
                other: c::SymbolVisibility(0),
                shndx: SectionIdx(c::SHN_ABS),
                value: placement.addr,
                size: d.size,
            });
        }
    }

    if !ctx.dynamic_list_patterns.is_empty() {
        let mut forced_targets: Vec<AtomId> = Vec::new();
        for (file_idx, file) in resolver.files.iter().enumerate() {
            for i in 0..file.atoms().len() {
                forced_targets.push(AtomId { file: FileId(file_idx as u32), idx: crate::atom::AtomIdx(i as u32) });
            }
        }
        for i in 0..resolver.synthetic.atoms.len() {
            forced_targets.push(AtomId { file: FileId::SYNTHETIC, idx: crate::atom::AtomIdx(i as u32) });
        }

        for id in forced_targets {
            if dynsym_idx.contains_key(&id) || !live.contains(&id) {
                continue;
            }
            let Some(Atom::Defined(d)) = atom_at(resolver, id) else { continue };
            let Some(name) = &d.name else { continue };
            if !crate::version_script::matches_any(&ctx.dynamic_list_patterns, name) {
                continue;
            }
            let Some(placement) = layout.placements.get(&id) else { continue };
            dynstr.intern(name);
            dynsym_idx.insert(id, syms.len() as u32);
            let bind = match d.binding {
                crate::atom::Binding::Weak => c::STB_WEAK,
                _ => c::STB_GLOBAL,
            };
            let ty = if matches!(d.content_type, ContentType::Code) { c::STT_FUNC } else { c::STT_OBJECT };
            syms.push(Sym {
                name: elven_parser::read::StringIdx(*dynstr.offsets.get(name).unwrap()),
                info: SymInfo((bind << 4) | ty),
                other: c::SymbolVisibility(0),
                shndx: SectionIdx(c::SHN_ABS),
                value: placement.addr,
                size: d.size,
            });
        }
    }

    // `.hash`: one bucket per symbol (including the null symbol) --
    // correct, if not tuned for lookup speed.
    let nsyms = syms.len() as u32;
    let nbucket = nsyms.max(1);
    let mut buckets = vec![0u32; nbucket as usize];
    let mut chains = vec![0u32; nsyms as usize];
    for (i, sym) in syms.iter().enumerate().skip(1) {
        let name = dynstr_name_at(&dynstr.content, sym.name.0);
        let h = elf_hash(name) % nbucket;
        chains[i] = buckets[h as usize];
        buckets[h as usize] = i as u32;
    }
    let mut hash_content = Vec::with_capacity((2 + nbucket as usize + nsyms as usize) * 4);
    hash_content.extend_from_slice(&nbucket.to_le_bytes());
    hash_content.extend_from_slice(&nsyms.to_le_bytes());
    hash_content.extend_from_slice(bytemuck::cast_slice(&buckets));
    hash_content.extend_from_slice(bytemuck::cast_slice(&chains));

    let mut rela_dyn: Vec<Rela> = Vec::new();
    for (&target, &got_id) in &plan.got_map {
        if !matches!(atom_at(resolver, target), Some(Atom::SharedLibrary(_))) {
            continue;
        }
        let Some(got_placement) = layout.placements.get(&got_id) else { continue };
        let Some(&sym) = dynsym_idx.get(&target) else { continue };
        rela_dyn.push(Rela {
            offset: got_placement.addr,
            info: RelInfo(((sym as u64) << 32) | c::R_X86_64_GLOB_DAT as u64),
            addend: 0,
        });
    }

    let mut rela_plt: Vec<Rela> = Vec::new();
    for entry in &plan.plt_entries {
        let Some(gotplt_placement) = layout.placements.get(&entry.gotplt) else { continue };
        let Some(&sym) = dynsym_idx.get(&entry.target) else { continue };
        rela_plt.push(Rela {
            offset: gotplt_placement.addr,
            info: RelInfo(((sym as u64) << 32) | c::R_X86_64_JUMP_SLOT as u64),
            addend: 0,
        });
        if let Some(plt_placement) = layout.placements.get(&entry.plt) {
            let stub_addr = plt_placement.addr.u64() + 6;
            layout.section_content[gotplt_placement.section_idx]
                [gotplt_placement.offset_in_section as usize..gotplt_placement.offset_in_section as usize + 8]
                .copy_from_slice(&stub_addr.to_le_bytes());
        }
    }

    let referenced_files: HashSet<FileId> = plan.imports.iter().map(|id| id.file).collect();
    let mut needed: Vec<BString> = Vec::new();
    for (file_idx, file) in resolver.files.iter().enumerate() {
        if let InputFile::SharedObject(f) = file {
            if ctx.as_needed && !referenced_files.contains(&FileId(file_idx as u32)) {
                continue;
            }
            if !needed.contains(&f.soname) {
                needed.push(f.soname.clone());
            }
        }
    }
    for soname in &needed {
        dynstr.intern(soname);
    }
    if let Some(soname) = &ctx.soname {
        dynstr.intern(soname);
    }
    for rpath in &ctx.rpath_list {
        dynstr.intern(rpath);
    }
    let dynstr_offsets = dynstr.offsets.clone();

    let page = ctx.section_alignment;
    let mut cursor_off = layout.end_file_offset.align_up(page);
    let mut cursor_vaddr = layout.end_vaddr.align_up(page);
    let seg_off = cursor_off;
    let seg_vaddr = cursor_vaddr;

    let mut push_table = |writer: &mut elven_parser::write::ElfWriter,
                           cursor_off: &mut u64,
                           cursor_vaddr: &mut u64,
                           name: &str,
                           r#type: ShType,
                           flags: ShFlags,
                           entsize: u64,
                           content: Vec<u8>|
     -> SectionIdx {
        let align = entsize.max(1);
        *cursor_off = cursor_off.align_up(align);
        *cursor_vaddr = cursor_vaddr.align_up(align);
        let addr = Addr(*cursor_vaddr);
        let size = content.len() as u64;
        let name_idx = writer.add_sh_string(name.as_bytes());
        let idx = writer
            .add_section(Section {
                name: name_idx,
                r#type,
                flags,
                link: 0,
                info: 0,
                addr,
                fixed_entsize: NonZeroU64::new(entsize),
                addr_align: NonZeroU64::new(align),
                content,
                logical_size: None,
            })
            .expect("section count fits u16");
        *cursor_off += size;
        *cursor_vaddr += size;
        idx
    };

    let dynstr_idx = push_table(
        &mut layout.writer,
        &mut cursor_off,
        &mut cursor_vaddr,
        ".dynstr",
        ShType(c::SHT_STRTAB),
        ShFlags::SHF_ALLOC,
        0,
        dynstr.content,
    );
    let dynsym_idx_section = push_table(
        &mut layout.writer,
        &mut cursor_off,
        &mut cursor_vaddr,
        ".dynsym",
        ShType(c::SHT_DYNSYM),
        ShFlags::SHF_ALLOC,
        std::mem::size_of::<Sym>() as u64,
        bytemuck::cast_slice(&syms).to_vec(),
    );
    layout.writer.section_mut(dynsym_idx_section).link = dynstr_idx.0 as u32;
    layout.writer.section_mut(dynsym_idx_section).info = 1;

    let hash_idx = push_table(
        &mut layout.writer,
        &mut cursor_off,
        &mut cursor_vaddr,
        ".hash",
        ShType(c::SHT_HASH),
        ShFlags::SHF_ALLOC,
        4,
        hash_content,
    );
    layout.writer.section_mut(hash_idx).link = dynsym_idx_section.0 as u32;

    let rela_dyn_addr = if !rela_dyn.is_empty() {
        let idx = push_table(
            &mut layout.writer,
            &mut cursor_off,
            &mut cursor_vaddr,
            ".rela.dyn",
            ShType(c::SHT_RELA),
            ShFlags::SHF_ALLOC,
            std::mem::size_of::<Rela>() as u64,
            bytemuck::cast_slice(&rela_dyn).to_vec(),
        );
        layout.writer.section_mut(idx).link = dynsym_idx_section.0 as u32;
        Some((layout.writer.section_mut(idx).addr, rela_dyn.len() as u64 * std::mem::size_of::<Rela>() as u64))
    } else {
        None
    };

    let rela_plt_addr = if !rela_plt.is_empty() {
        let idx = push_table(
            &mut layout.writer,
            &mut cursor_off,
            &mut cursor_vaddr,
            ".rela.plt",
            ShType(c::SHT_RELA),
            ShFlags::SHF_ALLOC,
            std::mem::size_of::<Rela>() as u64,
            bytemuck::cast_slice(&rela_plt).to_vec(),
        );
        layout.writer.section_mut(idx).link = dynsym_idx_section.0 as u32;
        Some((layout.writer.section_mut(idx).addr, rela_plt.len() as u64 * std::mem::size_of::<Rela>() as u64))
    } else {
        None
    };

    let is_executable = ctx.output_kind == OutputKind::Executable;
    let interp_extent = if is_executable {
        let mut content = ctx.dynamic_linker.to_vec();
        content.push(0);
        let idx = push_table(
            &mut layout.writer,
            &mut cursor_off,
            &mut cursor_vaddr,
            ".interp",
            ShType(c::SHT_PROGBITS),
            ShFlags::SHF_ALLOC,
            0,
            content,
        );
        let sec = layout.writer.section_mut(idx);
        Some((idx, sec.addr, sec.content.len() as u64))
    } else {
        None
    };

    let mut dyn_entries: Vec<Dyn> = Vec::new();
    for soname in &needed {
        let off = *dynstr_offsets.get(soname).expect("interned above");
        dyn_entries.push(Dyn { tag: c::DynamicTag(c::DT_NEEDED), val: off as u64 });
    }
    dyn_entries.push(Dyn { tag: c::DynamicTag(c::DT_HASH), val: layout.writer.section_mut(hash_idx).addr.u64() });
    dyn_entries.push(Dyn { tag: c::DynamicTag(c::DT_STRTAB), val: layout.writer.section_mut(dynstr_idx).addr.u64() });
    dyn_entries.push(Dyn {
        tag: c::DynamicTag(c::DT_SYMTAB),
        val: layout.writer.section_mut(dynsym_idx_section).addr.u64(),
    });
    dyn_entries.push(Dyn {
        tag: c::DynamicTag(c::DT_STRSZ),
        val: layout.writer.section_mut(dynstr_idx).content.len() as u64,
    });
    dyn_entries.push(Dyn { tag: c::DynamicTag(c::DT_SYMENT), val: std::mem::size_of::<Sym>() as u64 });

    if let Some(first_gotplt) = plan.plt_entries.first().map(|e| e.gotplt).or_else(|| plan.plt0.map(|_| plan.plt0.unwrap())) {
        if let Some(p) = layout.placements.get(&first_gotplt) {
            // `.got.plt`'s placement for any atom in the section shares
            // the section's base; `DT_PLTGOT` wants the section start.
            let base = p.addr.u64() - p.offset_in_section;
            dyn_entries.push(Dyn { tag: c::DynamicTag(c::DT_PLTGOT), val: base });
        }
    }
    if let Some((addr, size)) = rela_plt_addr {
        dyn_entries.push(Dyn { tag: c::DynamicTag(c::DT_JMPREL), val: addr.u64() });
        dyn_entries.push(Dyn { tag: c::DynamicTag(c::DT_PLTRELSZ), val: size });
        dyn_entries.push(Dyn { tag: c::DynamicTag(c::DT_PLTREL), val: c::DT_RELA });
    }
    if let Some((addr, size)) = rela_dyn_addr {
        dyn_entries.push(Dyn { tag: c::DynamicTag(c::DT_RELA), val: addr.u64() });
        dyn_entries.push(Dyn { tag: c::DynamicTag(c::DT_RELASZ), val: size });
        dyn_entries.push(Dyn { tag: c::DynamicTag(c::DT_RELAENT), val: std::mem::size_of::<Rela>() as u64 });
    }
    if let Some(soname) = &ctx.soname {
        let off = *dynstr_offsets.get(soname).expect("interned above");
        dyn_entries.push(Dyn { tag: c::DynamicTag(c::DT_SONAME), val: off as u64 });
    }
    for rpath in &ctx.rpath_list {
        let off = *dynstr_offsets.get(rpath).expect("interned above");
        dyn_entries.push(Dyn { tag: c::DynamicTag(c::DT_RUNPATH), val: off as u64 });
    }
    dyn_entries.push(Dyn { tag: c::DynamicTag(c::DT_NULL), val: 0 });

    let dynamic_idx = push_table(
        &mut layout.writer,
        &mut cursor_off,
        &mut cursor_vaddr,
        ".dynamic",
        ShType(c::SHT_DYNAMIC),
        ShFlags::SHF_ALLOC | ShFlags::SHF_WRITE,
        std::mem::size_of::<Dyn>() as u64,
        bytemuck::cast_slice(&dyn_entries).to_vec(),
    );
    layout.writer.section_mut(dynamic_idx).link = dynstr_idx.0 as u32;

    let seg_filesz = cursor_off - seg_off;
    let seg_memsz = cursor_vaddr - seg_vaddr;
    layout.writer.add_program_header(ProgramHeader {
        r#type: PhType(c::PT_LOAD),
        flags: PhFlags::PF_R | PhFlags::PF_W,
        offset: SectionRelativeAbsoluteAddr { section: dynstr_idx, rel_offset: Offset(0) },
        vaddr: Addr(seg_vaddr),
        paddr: Addr(seg_vaddr),
        filesz: seg_filesz,
        memsz: seg_memsz,
        align: page,
    });

    let dynamic_addr = layout.writer.section_mut(dynamic_idx).addr;
    let dynamic_size = layout.writer.section_mut(dynamic_idx).content.len() as u64;
    layout.writer.add_program_header(ProgramHeader {
        r#type: PhType(c::PT_DYNAMIC),
        flags: PhFlags::PF_R | PhFlags::PF_W,
        offset: SectionRelativeAbsoluteAddr { section: dynamic_idx, rel_offset: Offset(0) },
        vaddr: dynamic_addr,
        paddr: dynamic_addr,
        filesz: dynamic_size,
        memsz: dynamic_size,
        align: 8,
    });

    if let Some((idx, addr, size)) = interp_extent {
        layout.writer.add_program_header(ProgramHeader {
            r#type: PhType(c::PT_INTERP),
            flags: PhFlags::PF_R,
            offset: SectionRelativeAbsoluteAddr { section: idx, rel_offset: Offset(0) },
            vaddr: addr,
            paddr: addr,
            filesz: size,
            memsz: size,
            align: 1,
        });
    }
}

fn dynstr_name_at(content: &[u8], offset: u32) -> &[u8] {
    let start = offset as usize;
    let end = content[start..].iter().position(|&b| b == 0).map(|p| start + p).unwrap_or(content.len());
    &content[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContainerFamily, OutputKind};

    #[test]
    fn elf_hash_matches_known_vectors() {
        // Values from the System V ABI's own worked example.
        assert_eq!(elf_hash(b"printf"), 0x77905a6);
        assert_eq!(elf_hash(b"exit"), 0x6cf04);
        assert_eq!(elf_hash(b""), 0);
    }

    #[test]
    fn dynstr_builder_starts_with_null_string() {
        let b = DynStrBuilder::new();
        assert_eq!(b.content, vec![0]);
    }

    #[test]
    fn dynstr_builder_dedups_repeated_names() {
        let mut b = DynStrBuilder::new();
        let a = b.intern(&BString::from("libc.so.6"));
        let c = b.intern(&BString::from("libc.so.6"));
        assert_eq!(a, c);
        assert_eq!(b.content, b"\0libc.so.6\0".to_vec());
    }

    #[test]
    fn dynstr_builder_appends_distinct_names_after_the_previous_nul() {
        let mut b = DynStrBuilder::new();
        let first = b.intern(&BString::from("foo"));
        let second = b.intern(&BString::from("barbaz"));
        assert_eq!(first, 1);
        assert_eq!(second, 1 + "foo".len() as u32 + 1);
        assert_eq!(dynstr_name_at(&b.content, second), b"barbaz");
    }

    #[test]
    fn needs_dynamic_true_for_a_dynamic_list_with_no_shared_libs() {
        let mut ctx = fake_ctx(OutputKind::Executable);
        let resolver = Resolver::new(&ctx);
        assert!(!needs_dynamic(&resolver, &ctx));
        ctx.dynamic_list_patterns = vec![BString::from("keep_me")];
        let resolver = Resolver::new(&ctx);
        assert!(needs_dynamic(&resolver, &ctx));
    }

    #[test]
    fn extra_phdr_count_zero_when_not_dynamic() {
        assert_eq!(extra_phdr_count(&fake_ctx(OutputKind::Executable), false), 0);
    }

    #[test]
    fn extra_phdr_count_shared_library_has_no_interp() {
        assert_eq!(extra_phdr_count(&fake_ctx(OutputKind::SharedLibrary), true), 2);
    }

    #[test]
    fn extra_phdr_count_executable_adds_interp() {
        assert_eq!(extra_phdr_count(&fake_ctx(OutputKind::Executable), true), 3);
    }

    #[test]
    fn plt0_template_pushes_then_jumps_through_got_plt() {
        assert_eq!(&PLT0_TEMPLATE[0..2], &[0xff, 0x35]);
        assert_eq!(&PLT0_TEMPLATE[6..8], &[0xff, 0x25]);
    }

    #[test]
    fn pltn_template_jumps_pushes_index_then_jumps_to_plt0() {
        assert_eq!(&PLTN_TEMPLATE[0..2], &[0xff, 0x25]);
        assert_eq!(PLTN_TEMPLATE[6], 0x68);
        assert_eq!(PLTN_TEMPLATE[11], 0xe9);
    }

    fn fake_ctx(output_kind: OutputKind) -> LinkContext {
        LinkContext {
            container: ContainerFamily::Elf,
            arch: Arch::X86_64,
            output_kind,
            output_path: Default::default(),
            entry_symbol: None,
            image_base: None,
            section_alignment: 0x1000,
            file_alignment: 0x1000,
            subsystem: crate::context::Subsystem::WindowsCui,
            stack_reserve: 0,
            stack_commit: 0,
            heap_reserve: 0,
            heap_commit: 0,
            nx_compat: true,
            dynamic_base: true,
            large_address_aware: false,
            terminal_server_aware: true,
            allow_bind: true,
            allow_isolation: true,
            base_relocations: true,
            export_dynamic: false,
            pic: false,
            undefined_names: Vec::new(),
            include_names: Vec::new(),
            wrap_names: Vec::new(),
            defsyms: Vec::new(),
            alternate_names: Vec::new(),
            allow_remaining_undefines: false,
            allow_multiple_definition: false,
            no_inhibit_exec: false,
            force_undefined_to_absolute: false,
            rpath_list: Vec::new(),
            dynamic_linker: BString::from("/lib64/ld-linux-x86-64.so.2"),
            soname: None,
            as_needed: false,
            no_default_libs: false,
            search_paths: Vec::new(),
            default_libs: Vec::new(),
            gc_sections: false,
            build_id: false,
            version_script: None,
            dynamic_list: None,
            version_script_global: Vec::new(),
            version_script_local: Vec::new(),
            dynamic_list_patterns: Vec::new(),
        }
    }
}

