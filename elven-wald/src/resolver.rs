//! The fixed-point driver: feeds every input file's atoms
//! into the `SymbolTable`, pulls archive members on demand, and repeats
//! until a pass adds nothing new.

use std::path::{Path, PathBuf};

use bstr::BString;
use elven_coff::read::CoffReader;
use elven_parser::{archive::ArchiveFile, read::ElfReader};
use tracing::{debug, info, warn};

use crate::{
    atom::{Atom, AtomId, FileId, LazyAtom, RefTarget, Visibility},
    context::{ContainerFamily, LinkContext},
    error::{LinkError, ParseError},
    file::{atoms_from_elf, ArchiveInputFile, InputFile, SharedObjectFile, SyntheticFile},
    file_coff::atoms_from_coff,
    symtab::{Disposition, SymbolTable},
};

fn atom_in<'x>(files: &'x [InputFile<'_>], synthetic: &'x SyntheticFile, id: AtomId) -> Option<&'x Atom> {
    if id.file == FileId::SYNTHETIC {
        synthetic.atoms.get(id.idx.0 as usize)
    } else {
        files.get(id.file.0 as usize)?.atoms().get(id.idx.0 as usize)
    }
}

pub struct Resolver<'a> {
    pub files: Vec<InputFile<'a>>,
    pub symtab: SymbolTable,
    pub synthetic: SyntheticFile,
    ctx: &'a LinkContext,
}

impl<'a> Resolver<'a> {
    pub fn new(ctx: &'a LinkContext) -> Self {
        Resolver {
            files: Vec::new(),
            symtab: SymbolTable::new(),
            synthetic: SyntheticFile::default(),
            ctx,
        }
    }

    /// Loads one input (object, archive, or short-import member) and
    /// queues its atoms for resolution. ELF vs. COFF is picked by magic:
    /// ELF objects start with `\x7fELF`; archives start with `!<arch>\n`;
    /// everything else is assumed COFF.
    pub fn load_file(&mut self, path: &Path, data: &'a [u8]) -> Result<(), LinkError> {
        let to_parse_err = |e: ParseError| LinkError::Parse {
            file: path.to_path_buf(),
            source: e,
        };

        if data.starts_with(elven_parser::consts::ELFMAG) {
            let reader = ElfReader::new(data).map_err(ParseError::from).map_err(to_parse_err)?;
            let mut atoms = atoms_from_elf(path, &reader).map_err(to_parse_err)?;
            let file_id = FileId(self.files.len() as u32);
            Self::patch_placeholder_file_id(&mut atoms.atoms, file_id);
            self.register_file_atoms(file_id, &atoms.atoms, path)?;
            self.files.push(InputFile::Elf(crate::file::ElfInputFile {
                path: path.to_path_buf(),
                reader,
                atoms,
            }));
            return Ok(());
        }

        if data.starts_with(elven_parser::archive::ARMAG) {
            let archive = ArchiveFile::new(data).map_err(|e| LinkError::Archive(e))?;
            let file_id = FileId(self.files.len() as u32);
            self.register_archive(file_id, &archive, path)?;
            self.files
                .push(InputFile::Archive(ArchiveInputFile {
                    path: path.to_path_buf(),
                    archive,
                }));
            return Ok(());
        }

        // Not ELF, not an archive: COFF object (import libraries/short
        // imports are handled when pulled out of an archive member, not
        // as a bare top-level input).
        let reader = CoffReader::new(data).map_err(ParseError::from).map_err(to_parse_err)?;
        let mut atoms = atoms_from_coff(path, &reader).map_err(to_parse_err)?;
        let file_id = FileId(self.files.len() as u32);
        Self::patch_placeholder_file_id(&mut atoms.atoms, file_id);
        self.register_file_atoms(file_id, &atoms.atoms, path)?;
        self.files.push(InputFile::Coff(crate::file_coff::CoffInputFile {
            path: path.to_path_buf(),
            reader,
            atoms,
        }));
        Ok(())
    }

    /// `AtomFactory` can't know its file's final `FileId` while it's
    /// carving atoms, so every intra-file reference it builds uses
    /// `FileId(0)` as a placeholder (`file.rs`/`file_coff.rs`). This
    /// rewrites those placeholders to the real id once one is assigned;
    /// must run before the atoms are registered or stored anywhere.
    fn patch_placeholder_file_id(atoms: &mut [Atom], file_id: FileId) {
        for atom in atoms {
            if let Atom::Defined(d) = atom {
                for r in &mut d.references {
                    if let RefTarget::Atom(id) = &mut r.target {
                        if id.file == FileId(0) {
                            id.file = file_id;
                        }
                    }
                }
            }
        }
    }

    /// Registers every named atom from a freshly-parsed file.
    fn register_file_atoms(
        &mut self,
        file_id: FileId,
        atoms: &[Atom],
        path: &Path,
    ) -> Result<(), LinkError> {
        for (i, atom) in atoms.iter().enumerate() {
            let Some(name) = atom.name() else { continue };
            let id = AtomId {
                file: file_id,
                idx: crate::atom::AtomIdx(i as u32),
            };
            self.offer(name.clone(), id, path)?;
        }
        Ok(())
    }

    fn register_archive(
        &mut self,
        file_id: FileId,
        archive: &ArchiveFile<'a>,
        path: &Path,
    ) -> Result<(), LinkError> {
        for entry in archive
            .symbol_index()
            .map_err(|e| LinkError::Archive(e))?
        {
            let name = BString::from(entry.name.to_vec());
            // Only a non-weak `Defined`/`Absolute` slot can never be
            // displaced by this archive member; every other existing
            // state (most commonly `Undefined`, left by an earlier object
            // file referencing the symbol) still needs the `Lazy` atom
            // offered so `SymbolTable::offer`'s rank transition can fire
            // and pull the member in.
            if self.symtab.is_strong_defined(&name) {
                continue;
            }
            let idx = crate::atom::AtomIdx(self.synthetic.atoms.len() as u32);
            self.synthetic.atoms.push(Atom::Lazy(LazyAtom {
                name: name.clone(),
                archive_file: file_id,
                member_offset: entry.member_offset,
            }));
            let id = AtomId {
                file: FileId::SYNTHETIC,
                idx,
            };
            self.offer(name, id, path)?;
        }
        Ok(())
    }

    fn offer(&mut self, name: BString, id: AtomId, path: &Path) -> Result<(), LinkError> {
        // Borrow `self.files`/`self.synthetic` directly (not through a
        // `self.atom(id)` method call) so these closures stay disjoint
        // from the `&mut self.symtab` borrow `SymbolTable::offer` takes
        // below; a method call on `&self` would otherwise capture all of
        // `self` and conflict with it.
        let files = &self.files;
        let synthetic = &self.synthetic;
        let atoms_of = |id: AtomId| atom_in(files, synthetic, id);
        let synthetic_path = path.to_path_buf();
        let file_path_of = |id: AtomId| -> PathBuf {
            if id.file == FileId::SYNTHETIC {
                synthetic_path.clone()
            } else {
                files
                    .get(id.file.0 as usize)
                    .map(|f| f.path().to_path_buf())
                    .unwrap_or_default()
            }
        };
        let disposition = match self.symtab.offer(&name, id, &atoms_of, &file_path_of) {
            Ok(d) => d,
            Err(LinkError::DuplicateSymbol { name, first, second }) if self.ctx.allow_multiple_definition => {
                warn!(
                    %name,
                    first = %first.display(),
                    second = %second.display(),
                    "duplicate definitions allowed by --allow-multiple-definition; keeping the first"
                );
                Disposition::Discard
            }
            Err(e) => return Err(e),
        };
        if disposition == Disposition::PullArchiveMember {
            self.pull_archive_member(&name)?;
        }
        Ok(())
    }

    fn atom(&self, id: AtomId) -> Option<&Atom> {
        atom_in(&self.files, &self.synthetic, id)
    }

    /// Extracts the archive member backing `name`'s `LazyAtom` and feeds
    /// its atoms into the table, exactly as if it had been a direct
    /// command-line input.
    fn pull_archive_member(&mut self, name: &BString) -> Result<(), LinkError> {
        let Some(slot) = self.symtab.get(name) else {
            return Ok(());
        };
        let Some(Atom::Lazy(lazy)) = self.atom(slot.atom) else {
            return Ok(());
        };
        let archive_file = lazy.archive_file;
        let member_offset = lazy.member_offset;

        let InputFile::Archive(archive_input) = &self.files[archive_file.0 as usize] else {
            return Ok(());
        };
        let member = archive_input
            .archive
            .member_at(member_offset)
            .map_err(|e| LinkError::Archive(e))?;
        let member_path = archive_input.path.join(format!("({})", member.name));
        let data = member.data;

        info!(member = %member.name, archive = %archive_input.path.display(), "pulling archive member");

        if data.starts_with(elven_parser::consts::ELFMAG) {
            let reader = ElfReader::new(data)
                .map_err(ParseError::from)
                .map_err(|e| LinkError::Parse { file: member_path.clone(), source: e })?;
            let mut atoms = atoms_from_elf(&member_path, &reader)
                .map_err(|e| LinkError::Parse { file: member_path.clone(), source: e })?;
            let file_id = FileId(self.files.len() as u32);
            Self::patch_placeholder_file_id(&mut atoms.atoms, file_id);
            self.register_file_atoms(file_id, &atoms.atoms, &member_path)?;
            self.files.push(InputFile::Elf(crate::file::ElfInputFile {
                path: member_path,
                reader,
                atoms,
            }));
        } else if elven_coff::read::is_short_import(data) {
            // A short import header satisfies the name with a
            // `SharedLibraryAtom` instead of pulling in code.
            let import = elven_coff::read::ShortImport::parse(data)
                .map_err(ParseError::from)
                .map_err(|e| LinkError::Parse { file: member_path.clone(), source: e })?;
            let idx = crate::atom::AtomIdx(self.synthetic.atoms.len() as u32);
            self.synthetic.atoms.push(Atom::SharedLibrary(crate::atom::SharedLibraryAtom {
                name: import.symbol_name.to_owned(),
                dso: import.dll_name.to_owned(),
                ordinal: Some(import.ordinal_or_hint),
            }));
            self.offer(
                import.symbol_name.to_owned(),
                AtomId { file: FileId::SYNTHETIC, idx },
                &member_path,
            )?;
        } else {
            let reader = CoffReader::new(data)
                .map_err(ParseError::from)
                .map_err(|e| LinkError::Parse { file: member_path.clone(), source: e })?;
            let mut atoms = atoms_from_coff(&member_path, &reader)
                .map_err(|e| LinkError::Parse { file: member_path.clone(), source: e })?;
            let file_id = FileId(self.files.len() as u32);
            Self::patch_placeholder_file_id(&mut atoms.atoms, file_id);
            self.register_file_atoms(file_id, &atoms.atoms, &member_path)?;
            self.files.push(InputFile::Coff(crate::file_coff::CoffInputFile {
                path: member_path,
                reader,
                atoms,
            }));
        }
        Ok(())
    }

    /// Loads an `ET_DYN` shared object purely for the symbols it exports
    ///; its code is never copied into the output.
    pub fn load_shared_object(&mut self, path: &Path, data: &'a [u8]) -> Result<(), LinkError> {
        let to_parse_err = |e: elven_parser::read::ElfReadError| LinkError::Parse {
            file: path.to_path_buf(),
            source: ParseError::from(e),
        };
        let reader = ElfReader::new(data).map_err(to_parse_err)?;
        let soname = reader
            .dyn_entry_by_tag(elven_parser::consts::DT_SONAME)
            .ok()
            .and_then(|d| reader.dyn_string(elven_parser::read::StringIdx(d.val as u32)).ok())
            .map(|s| s.to_owned())
            .unwrap_or_else(|| BString::from(path.file_name().unwrap_or_default().to_string_lossy().into_owned()));

        let mut atoms = Vec::new();
        for sym in reader.dyn_symbols().unwrap_or(&[]) {
            if sym.shndx == elven_parser::consts::SHN_UNDEF {
                continue;
            }
            let Ok(name) = reader.dyn_string(sym.name) else {
                continue;
            };
            atoms.push(Atom::SharedLibrary(crate::atom::SharedLibraryAtom {
                name: name.to_owned(),
                dso: soname.clone(),
                ordinal: None,
            }));
        }

        let file_id = FileId(self.files.len() as u32);
        self.register_file_atoms(file_id, &atoms, path)?;
        self.files.push(InputFile::SharedObject(SharedObjectFile {
            path: path.to_path_buf(),
            reader,
            soname,
            atoms,
        }));
        Ok(())
    }

    /// Rewrites every `RefTarget::Name` on every atom to `RefTarget::Atom`
    /// once the table has reached its fixed point. Names that still don't
    /// resolve become hard errors unless `allow_remaining_undefines` (or
    /// `force_undefined_to_absolute`) is set, in which case they're left
    /// bound to a synthetic absolute-zero atom, or unless `no_inhibit_exec`
    /// downgrades the error back to a warning so the link still produces
    /// output.
    pub fn finish(&mut self) -> Result<(), LinkError> {
        self.apply_wrap_renames();

        if self.ctx.container == ContainerFamily::Coff {
            self.apply_coff_fallbacks();
        }

        self.apply_version_script();

        let unresolved: Vec<BString> = self.symtab.unresolved().cloned().collect();
        let mut hard_error: Option<LinkError> = None;
        for name in &unresolved {
            if self.ctx.allow_remaining_undefines || self.ctx.force_undefined_to_absolute {
                let idx = crate::atom::AtomIdx(self.synthetic.atoms.len() as u32);
                self.synthetic
                    .atoms
                    .push(Atom::Absolute(crate::atom::AbsoluteAtom { name: name.clone(), value: 0 }));
                let files = &self.files;
                let synthetic = &self.synthetic;
                let atoms_of = |id: AtomId| atom_in(files, synthetic, id);
                let _ = self.symtab.offer(
                    name,
                    AtomId { file: FileId::SYNTHETIC, idx },
                    &atoms_of,
                    &|_| PathBuf::new(),
                );
            } else {
                warn!(%name, "undefined symbol");
                if !self.ctx.no_inhibit_exec && hard_error.is_none() {
                    hard_error = Some(LinkError::UndefinedSymbol {
                        name: name.clone(),
                        referenced_from: self.first_reference_path(name),
                    });
                }
            }
        }
        if let Some(err) = hard_error {
            return Err(err);
        }

        let resolved: std::collections::HashMap<BString, AtomId> = self
            .symtab
            .iter()
            .map(|(name, slot)| (name.clone(), slot.atom))
            .collect();

        for file_idx in 0..self.files.len() {
            let mut file = std::mem::replace(&mut self.files[file_idx], InputFile::Archive(ArchiveInputFile {
                path: PathBuf::new(),
                archive: ArchiveFile::empty(),
            }));
            for atom in file.atoms_mut().iter_mut() {
                if let Atom::Defined(defined) = atom {
                    for r in &mut defined.references {
                        if let RefTarget::Name(name) = &r.target {
                            if let Some(resolved_id) = resolved.get(name) {
                                r.target = RefTarget::Atom(*resolved_id);
                            }
                        }
                    }
                }
            }
            self.files[file_idx] = file;
        }
        for atom in &mut self.synthetic.atoms {
            if let Atom::Defined(defined) = atom {
                for r in &mut defined.references {
                    if let RefTarget::Name(name) = &r.target {
                        if let Some(resolved_id) = resolved.get(name) {
                            r.target = RefTarget::Atom(*resolved_id);
                        }
                    }
                }
            }
        }

        debug!(files = self.files.len(), "resolution fixed point reached");
        Ok(())
    }

    /// `--wrap=name` redirects every reference to `name` at `__wrap_name`
    /// and every reference to `__real_name` back at `name`, so a
    /// user-supplied `__wrap_name` can call through to the original
    /// definition. Runs before any resolution so the rewritten names are
    /// what the fixed point actually sees; the symbol's own definition
    /// (its `atom.name()`) is untouched, only reference targets move.
    fn apply_wrap_renames(&mut self) {
        if self.ctx.wrap_names.is_empty() {
            return;
        }

        let wrapped: std::collections::HashSet<&BString> = self.ctx.wrap_names.iter().collect();
        let rename = |name: &BString| -> Option<BString> {
            if wrapped.contains(name) {
                let mut wrapped_name = BString::from("__wrap_");
                wrapped_name.extend_from_slice(name);
                return Some(wrapped_name);
            }
            if let Some(real) = name.strip_prefix(b"__real_") {
                let real = BString::from(real.to_vec());
                if wrapped.contains(&real) {
                    return Some(real);
                }
            }
            None
        };

        for file in &mut self.files {
            for atom in file.atoms_mut().iter_mut() {
                if let Atom::Defined(defined) = atom {
                    for r in &mut defined.references {
                        if let RefTarget::Name(name) = &r.target {
                            if let Some(renamed) = rename(name) {
                                r.target = RefTarget::Name(renamed);
                            }
                        }
                    }
                }
            }
        }
        for atom in &mut self.synthetic.atoms {
            if let Atom::Defined(defined) = atom {
                for r in &mut defined.references {
                    if let RefTarget::Name(name) = &r.target {
                        if let Some(renamed) = rename(name) {
                            r.target = RefTarget::Name(renamed);
                        }
                    }
                }
            }
        }
    }

    /// The PE/COFF name-mangling fallback chain (§4.3): a name still
    /// undefined after the fixed point tries `__imp_name` (the by-address
    /// import form), then every user-supplied `/alternatename` alias for
    /// it, in that order, before being reported as a hard undefined.
    /// MSVC's `?name@@Y...` C++ decoration fallback has no analogue here
    /// since a decorated name carries its own unique encoding and never
    /// collides with an undecorated fallback form.
    fn apply_coff_fallbacks(&mut self) {
        let unresolved: Vec<BString> = self.symtab.unresolved().cloned().collect();
        for name in &unresolved {
            let mut candidates = crate::symtab::coff_fallback_names(name);
            candidates.extend(
                self.ctx
                    .alternate_names
                    .iter()
                    .filter(|(from, _)| from == name)
                    .map(|(_, to)| to.clone()),
            );
            for candidate in candidates {
                if self.symtab.alias(name, &candidate) {
                    debug!(%name, fallback = %candidate, "resolved via COFF name-mangling fallback");
                    break;
                }
            }
        }
    }

    /// Applies `global:`/`local:` visibility assignment from a version
    /// script (§6.1 `version_script`): a name matched only by a `local`
    /// pattern is forced `Hidden` (dropped from `.dynsym` export in
    /// `dynamic::finalize`); a name matched by a `global` pattern is
    /// forced back to `Default` visibility, taking precedence if a name
    /// happens to match both. A name matched by neither list keeps
    /// whatever visibility the input file already gave it.
    fn apply_version_script(&mut self) {
        let ctx = self.ctx;
        if ctx.version_script_global.is_empty() && ctx.version_script_local.is_empty() {
            return;
        }

        let assign = |defined: &mut crate::atom::DefinedAtom| {
            let Some(name) = &defined.name else { return };
            let global = crate::version_script::matches_any(&ctx.version_script_global, name);
            let local = crate::version_script::matches_any(&ctx.version_script_local, name);
            if global {
                defined.visibility = Visibility::Default;
            } else if local {
                defined.visibility = Visibility::Hidden;
            }
        };

        for file in &mut self.files {
            for atom in file.atoms_mut().iter_mut() {
                if let Atom::Defined(defined) = atom {
                    assign(defined);
                }
            }
        }
        for atom in &mut self.synthetic.atoms {
            if let Atom::Defined(defined) = atom {
                assign(defined);
            }
        }
    }

    /// Finds the first input file holding a reference to the still-
    /// undefined `name`, for the `UndefinedSymbol` diagnostic. Empty if
    /// nothing actually references it (possible for a bare `--undefined`
    /// force-root with no real call site).
    fn first_reference_path(&self, name: &BString) -> PathBuf {
        for file in &self.files {
            for atom in file.atoms() {
                if let Atom::Defined(d) = atom {
                    for r in &d.references {
                        if let RefTarget::Name(n) = &r.target {
                            if n == name {
                                return file.path().to_path_buf();
                            }
                        }
                    }
                }
            }
        }
        PathBuf::new()
    }

    pub fn entry_atom(&self) -> Option<AtomId> {
        let name = self.ctx.entry_symbol.clone()?;
        self.symtab.get(&name).map(|s| s.atom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{
        Binding, ContentType, DeadStripPolicy, DefinedAtom, MergePolicy, Permissions, RefKind, SectionChoice, Visibility,
    };
    use crate::context::{ContainerFamily, OutputKind, Subsystem};

    fn name_ref(name: &str) -> crate::atom::Reference {
        crate::atom::Reference {
            offset_in_atom: 0,
            target: RefTarget::Name(BString::from(name)),
            kind: RefKind::Elf(0),
            arch: crate::atom::Arch::X86_64,
            addend: 0,
        }
    }

    fn defined_with_ref(target_name: &str) -> Atom {
        Atom::Defined(DefinedAtom {
            content_type: ContentType::Code,
            permissions: Permissions::RX,
            align_pow2: 0,
            align_modulus: 1,
            binding: Binding::Global,
            visibility: Visibility::Default,
            merge: MergePolicy::NoMerge,
            section_choice: SectionChoice::ContentDerived,
            section_name: BString::from(".text"),
            dead_strip: DeadStripPolicy::Normal,
            ordinal: 0,
            content: Vec::new(),
            size: 0,
            references: vec![name_ref(target_name)],
            name: None,
        })
    }

    fn fake_ctx(wrap_names: Vec<BString>) -> LinkContext {
        LinkContext {
            container: ContainerFamily::Elf,
            arch: crate::atom::Arch::X86_64,
            output_kind: OutputKind::Executable,
            output_path: PathBuf::new(),
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
            wrap_names,
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

    fn defined_named(name: &str, visibility: Visibility) -> Atom {
        Atom::Defined(DefinedAtom {
            content_type: ContentType::Code,
            permissions: Permissions::RX,
            align_pow2: 0,
            align_modulus: 1,
            binding: Binding::Global,
            visibility,
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

    fn atom_visibility(atom: &Atom) -> Visibility {
        let Atom::Defined(d) = atom else { panic!("expected a defined atom") };
        d.visibility
    }

    fn ref_name(atom: &Atom) -> &BString {
        let Atom::Defined(d) = atom else { panic!("expected a defined atom") };
        let RefTarget::Name(name) = &d.references[0].target else { panic!("expected a name target") };
        name
    }

    #[test]
    fn wrap_redirects_calls_to_the_wrapper() {
        let ctx = fake_ctx(vec![BString::from("malloc")]);
        let mut resolver = Resolver::new(&ctx);
        resolver.synthetic.atoms.push(defined_with_ref("malloc"));
        resolver.apply_wrap_renames();
        assert_eq!(ref_name(&resolver.synthetic.atoms[0]), &BString::from("__wrap_malloc"));
    }

    #[test]
    fn wrap_real_resolves_back_to_the_original() {
        let ctx = fake_ctx(vec![BString::from("malloc")]);
        let mut resolver = Resolver::new(&ctx);
        resolver.synthetic.atoms.push(defined_with_ref("__real_malloc"));
        resolver.apply_wrap_renames();
        assert_eq!(ref_name(&resolver.synthetic.atoms[0]), &BString::from("malloc"));
    }

    #[test]
    fn unrelated_names_are_left_alone() {
        let ctx = fake_ctx(vec![BString::from("malloc")]);
        let mut resolver = Resolver::new(&ctx);
        resolver.synthetic.atoms.push(defined_with_ref("free"));
        resolver.apply_wrap_renames();
        assert_eq!(ref_name(&resolver.synthetic.atoms[0]), &BString::from("free"));
    }

    #[test]
    fn no_wrap_names_is_a_no_op() {
        let ctx = fake_ctx(Vec::new());
        let mut resolver = Resolver::new(&ctx);
        resolver.synthetic.atoms.push(defined_with_ref("malloc"));
        resolver.apply_wrap_renames();
        assert_eq!(ref_name(&resolver.synthetic.atoms[0]), &BString::from("malloc"));
    }

    #[test]
    fn local_glob_hides_unmatched_global() {
        let mut ctx = fake_ctx(Vec::new());
        ctx.version_script_local = vec!["*".to_owned()];
        let mut resolver = Resolver::new(&ctx);
        resolver.synthetic.atoms.push(defined_named("internal_helper", Visibility::Default));
        resolver.apply_version_script();
        assert_eq!(atom_visibility(&resolver.synthetic.atoms[0]), Visibility::Hidden);
    }

    #[test]
    fn global_pattern_wins_over_local_catchall() {
        let mut ctx = fake_ctx(Vec::new());
        ctx.version_script_global = vec!["exported_*".to_owned()];
        ctx.version_script_local = vec!["*".to_owned()];
        let mut resolver = Resolver::new(&ctx);
        resolver.synthetic.atoms.push(defined_named("exported_fn", Visibility::Default));
        resolver.apply_version_script();
        assert_eq!(atom_visibility(&resolver.synthetic.atoms[0]), Visibility::Default);
    }

    #[test]
    fn empty_version_script_patterns_leave_visibility_untouched() {
        let ctx = fake_ctx(Vec::new());
        let mut resolver = Resolver::new(&ctx);
        resolver.synthetic.atoms.push(defined_named("anything", Visibility::Protected));
        resolver.apply_version_script();
        assert_eq!(atom_visibility(&resolver.synthetic.atoms[0]), Visibility::Protected);
    }

    fn undefined_atom(name: &str) -> Atom {
        Atom::Undefined(crate::atom::UndefinedAtom {
            name: BString::from(name),
            fallback: None,
            can_be_null: false,
            weak: false,
        })
    }

    fn offer_synthetic(resolver: &mut Resolver, name: &str, atom: Atom) {
        let idx = crate::atom::AtomIdx(resolver.synthetic.atoms.len() as u32);
        resolver.synthetic.atoms.push(atom);
        let id = AtomId { file: FileId::SYNTHETIC, idx };
        let files = &resolver.files;
        let synthetic = &resolver.synthetic;
        let atoms_of = |id: AtomId| atom_in(files, synthetic, id);
        resolver.symtab.offer(&BString::from(name), id, &atoms_of, &|_| PathBuf::new()).unwrap();
    }

    #[test]
    fn unresolved_name_is_a_hard_error_by_default() {
        let ctx = fake_ctx(Vec::new());
        let mut resolver = Resolver::new(&ctx);
        offer_synthetic(&mut resolver, "missing", undefined_atom("missing"));
        assert!(matches!(resolver.finish(), Err(LinkError::UndefinedSymbol { .. })));
    }

    #[test]
    fn no_inhibit_exec_downgrades_unresolved_names_to_a_warning() {
        let mut ctx = fake_ctx(Vec::new());
        ctx.no_inhibit_exec = true;
        let mut resolver = Resolver::new(&ctx);
        offer_synthetic(&mut resolver, "missing", undefined_atom("missing"));
        assert!(resolver.finish().is_ok());
    }

    #[test]
    fn allow_remaining_undefines_binds_an_absolute_zero_atom_instead_of_erroring() {
        let mut ctx = fake_ctx(Vec::new());
        ctx.allow_remaining_undefines = true;
        let mut resolver = Resolver::new(&ctx);
        offer_synthetic(&mut resolver, "missing", undefined_atom("missing"));
        assert!(resolver.finish().is_ok());
        assert!(matches!(resolver.symtab.get(b"missing").map(|s| resolver.atom(s.atom)), Some(Some(Atom::Absolute(_)))));
    }

    #[test]
    fn allow_multiple_definition_keeps_the_first_and_does_not_error() {
        let mut ctx = fake_ctx(Vec::new());
        ctx.allow_multiple_definition = true;
        let mut resolver = Resolver::new(&ctx);

        let first_idx = crate::atom::AtomIdx(resolver.synthetic.atoms.len() as u32);
        resolver.synthetic.atoms.push(defined_named("dup", Visibility::Default));
        let first_id = AtomId { file: FileId::SYNTHETIC, idx: first_idx };

        let second_idx = crate::atom::AtomIdx(resolver.synthetic.atoms.len() as u32);
        resolver.synthetic.atoms.push(defined_named("dup", Visibility::Default));
        let second_id = AtomId { file: FileId::SYNTHETIC, idx: second_idx };

        resolver.offer(BString::from("dup"), first_id, Path::new("first.o")).unwrap();
        resolver.offer(BString::from("dup"), second_id, Path::new("second.o")).unwrap();
        assert_eq!(resolver.symtab.get(b"dup").unwrap().atom, first_id);
    }
}
