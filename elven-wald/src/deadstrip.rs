//! Mark-and-sweep dead-atom elimination.
//!
//! Seeded with the entry atom, every exported/forced-undefined/`--include`
//! atom, every atom matched by `--dynamic-list`, every atom whose section
//! is reserved (`.init`/`.fini`/`.ctors`/`.dtors`/`.eh_frame`/init-array
//! families/notes), and every atom marked `DeadStripPolicy::Never` or
//! `AlwaysRoot`. Marking follows ordinary references and walks
//! `associate` edges in both directions so a COMDAT child's liveness
//! tracks its parent.

use std::collections::{HashSet, VecDeque};

use bstr::BString;

use crate::{
    atom::{Atom, AtomId, DeadStripPolicy, FileId, LayoutKind, RefKind, RefTarget},
    context::LinkContext,
    file::InputFile,
    resolver::Resolver,
};

/// Every atom reachable from the root set. An atom not in this set is
/// omitted from the output entirely.
pub fn mark_live(resolver: &Resolver, ctx: &LinkContext) -> HashSet<AtomId> {
    let mut associate_edges: Vec<(AtomId, AtomId)> = Vec::new();
    let all_ids = |files: &[InputFile], synthetic_len: usize| -> Vec<AtomId> {
        let mut ids = Vec::new();
        for (file_idx, file) in files.iter().enumerate() {
            for i in 0..file.atoms().len() {
                ids.push(AtomId {
                    file: FileId(file_idx as u32),
                    idx: crate::atom::AtomIdx(i as u32),
                });
            }
        }
        for i in 0..synthetic_len {
            ids.push(AtomId {
                file: FileId::SYNTHETIC,
                idx: crate::atom::AtomIdx(i as u32),
            });
        }
        ids
    };

    let ids = all_ids(&resolver.files, resolver.synthetic.atoms.len());
    let mut queue: VecDeque<AtomId> = VecDeque::new();
    let mut live: HashSet<AtomId> = HashSet::new();

    let mut seed = |id: AtomId, live: &mut HashSet<AtomId>, queue: &mut VecDeque<AtomId>| {
        if live.insert(id) {
            queue.push_back(id);
        }
    };

    for &id in &ids {
        let Some(atom) = atom_at(resolver, id) else { continue };
        if let Atom::Defined(d) = atom {
            for r in &d.references {
                if r.kind.namespace() == crate::atom::KindNamespace::Layout
                    && matches!(r.kind, RefKind::Layout(LayoutKind::Associate))
                {
                    if let RefTarget::Atom(target) = r.target {
                        associate_edges.push((id, target));
                    }
                }
            }
            if d.dead_strip == DeadStripPolicy::Never || d.dead_strip == DeadStripPolicy::AlwaysRoot {
                seed(id, &mut live, &mut queue);
            }
            if is_reserved_section(&d.section_name) {
                seed(id, &mut live, &mut queue);
            }
        }
    }

    if !ctx.gc_sections {
        // Without `--gc-sections` every atom is a root: nothing is
        // eligible for elimination (the roots only apply
        // when dead-strip is actually requested by the driver).
        for &id in &ids {
            seed(id, &mut live, &mut queue);
        }
    }

    if let Some(entry) = resolver.entry_atom() {
        seed(entry, &mut live, &mut queue);
    }
    for name in ctx.undefined_names.iter().chain(ctx.include_names.iter()) {
        if let Some(id) = atom_for_name(resolver, name) {
            seed(id, &mut live, &mut queue);
        }
    }
    if ctx.export_dynamic || ctx.output_kind != crate::context::OutputKind::Executable {
        for (_, slot) in resolver.symtab.iter() {
            seed(slot.atom, &mut live, &mut queue);
        }
    }
    if !ctx.dynamic_list_patterns.is_empty() {
        for (name, slot) in resolver.symtab.iter() {
            if crate::version_script::matches_any(&ctx.dynamic_list_patterns, name) {
                seed(slot.atom, &mut live, &mut queue);
            }
        }
    }

    // Reverse-associate adjacency: a referenced parent keeps its children
    // alive even though the only edge recorded is child -> parent.
    let mut reverse_associate: std::collections::HashMap<AtomId, Vec<AtomId>> = Default::default();
    for &(child, parent) in &associate_edges {
        reverse_associate.entry(parent).or_default().push(child);
    }

    while let Some(id) = queue.pop_front() {
        let Some(atom) = atom_at(resolver, id) else { continue };
        if let Atom::Defined(d) = atom {
            for r in &d.references {
                if let RefTarget::Atom(target) = r.target {
                    seed(target, &mut live, &mut queue);
                }
            }
        }
        if let Some(children) = reverse_associate.get(&id) {
            for &child in children {
                seed(child, &mut live, &mut queue);
            }
        }
    }

    live
}

fn atom_at<'a>(resolver: &'a Resolver, id: AtomId) -> Option<&'a Atom> {
    if id.file == FileId::SYNTHETIC {
        resolver.synthetic.atoms.get(id.idx.0 as usize)
    } else {
        resolver
            .files
            .get(id.file.0 as usize)?
            .atoms()
            .get(id.idx.0 as usize)
    }
}

fn atom_for_name(resolver: &Resolver, name: &BString) -> Option<AtomId> {
    resolver.symtab.get(name).map(|s| s.atom)
}

const RESERVED_SECTION_PREFIXES: &[&[u8]] = &[
    b".init", b".fini", b".ctors", b".dtors", b".eh_frame", b".init_array", b".fini_array",
    b".preinit_array", b".note",
];

fn is_reserved_section(name: &bstr::BStr) -> bool {
    RESERVED_SECTION_PREFIXES.iter().any(|p| name.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{
        AtomIdx, Binding, ContentType, DefinedAtom, MergePolicy, Permissions, SectionChoice, Visibility as AtomVisibility,
    };
    use crate::context::{ContainerFamily, OutputKind, Subsystem};
    use crate::resolver::Resolver;

    fn fake_ctx(gc_sections: bool, dynamic_list_patterns: Vec<BString>) -> LinkContext {
        LinkContext {
            container: ContainerFamily::Elf,
            arch: crate::atom::Arch::X86_64,
            output_kind: OutputKind::Executable,
            output_path: std::path::PathBuf::new(),
            entry_symbol: None,
            image_base: None,
            section_alignment: 0x1000,
            file_alignment: 0x1000,
            subsystem: Subsystem::WindowsCui,
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
            gc_sections,
            build_id: false,
            version_script: None,
            dynamic_list: None,
            version_script_global: Vec::new(),
            version_script_local: Vec::new(),
            dynamic_list_patterns,
        }
    }

    fn unreferenced_defined(name: &str) -> Atom {
        Atom::Defined(DefinedAtom {
            content_type: ContentType::Code,
            permissions: Permissions::RX,
            align_pow2: 0,
            align_modulus: 1,
            binding: Binding::Global,
            visibility: AtomVisibility::Default,
            merge: MergePolicy::NoMerge,
            section_choice: SectionChoice::ContentDerived,
            section_name: BString::from(".text"),
            dead_strip: DeadStripPolicy::Normal,
            ordinal: 0,
            content: Vec::new(),
            size: 0,
            references: Vec::new(),
            name: Some(BString::from(name)),
        })
    }

    fn seed_symbol(resolver: &mut Resolver, name: &str, atom: Atom) -> AtomId {
        let idx = AtomIdx(resolver.synthetic.atoms.len() as u32);
        resolver.synthetic.atoms.push(atom);
        let id = AtomId { file: FileId::SYNTHETIC, idx };
        let bstring = BString::from(name);
        let atoms = &resolver.synthetic.atoms;
        resolver
            .symtab
            .offer(&bstring, id, &|at| atoms.get(at.idx.0 as usize), &|_| std::path::PathBuf::new())
            .unwrap();
        id
    }

    #[test]
    fn gc_sections_strips_an_atom_matched_by_no_root() {
        let ctx = fake_ctx(true, Vec::new());
        let mut resolver = Resolver::new(&ctx);
        let id = seed_symbol(&mut resolver, "dead_fn", unreferenced_defined("dead_fn"));
        let live = mark_live(&resolver, &ctx);
        assert!(!live.contains(&id));
    }

    #[test]
    fn dynamic_list_pattern_keeps_an_otherwise_unreferenced_atom_alive() {
        let ctx = fake_ctx(true, vec![BString::from("keep_*")]);
        let mut resolver = Resolver::new(&ctx);
        let kept = seed_symbol(&mut resolver, "keep_me", unreferenced_defined("keep_me"));
        let dropped = seed_symbol(&mut resolver, "drop_me", unreferenced_defined("drop_me"));
        let live = mark_live(&resolver, &ctx);
        assert!(live.contains(&kept));
        assert!(!live.contains(&dropped));
    }

    #[test]
    fn without_gc_sections_everything_survives_regardless_of_dynamic_list() {
        let ctx = fake_ctx(false, Vec::new());
        let mut resolver = Resolver::new(&ctx);
        let id = seed_symbol(&mut resolver, "anything", unreferenced_defined("anything"));
        let live = mark_live(&resolver, &ctx);
        assert!(live.contains(&id));
    }
}
