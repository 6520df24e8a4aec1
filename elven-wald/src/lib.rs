//! Top-level driver: turns a parsed command line into a `LinkContext`,
//! then runs the resolve -> dead-strip -> layout -> address -> relocate ->
//! write pipeline.

#[macro_use]
extern crate tracing;

pub mod address;
pub mod address_coff;
pub mod atom;
pub mod context;
pub mod deadstrip;
pub mod dynamic;
pub mod error;
pub mod file;
pub mod file_coff;
pub mod import;
pub mod layout;
pub mod opts;
pub mod reloc;
pub mod resolver;
pub mod symtab;
pub mod utils;
pub mod version_script;
pub mod writer;

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use bstr::BString;
use memmap2::Mmap;

use crate::{
    context::{ContainerFamily, LinkContext, OutputKind, Subsystem},
    resolver::Resolver,
};

/// Everything `opts::parse` produced, collapsed into the single value
/// `run` needs. Kept separate from `LinkContext` itself so the CLI-facing
/// shape (optional strings, repeated flags) doesn't leak into the core.
pub struct Opts {
    pub scalars: opts::Opts,
    pub flags: opts::Flags,
    pub lists: opts::Lists,
    pub inputs: Vec<opts::InputFile>,
}

pub fn parse_args(args: impl Iterator<Item = String>) -> Result<Opts> {
    let (scalars, flags, lists, inputs) = opts::parse(args)?;
    Ok(Opts { scalars, flags, lists, inputs })
}

/// Parses `link.exe`'s `/STACK:reserve[,commit]` / `/HEAP:reserve[,commit]`
/// value shape, returning `(reserve, commit)` with `commit` left at
/// `default_commit` when no comma-separated second value is given.
fn parse_reserve_commit(s: &str, default_commit: u64) -> Result<(u64, u64)> {
    match s.split_once(',') {
        Some((reserve, commit)) => Ok((parse_u64(reserve)?, parse_u64(commit)?)),
        None => Ok((parse_u64(s)?, default_commit)),
    }
}

fn parse_u64(s: &str) -> Result<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Ok(u64::from_str_radix(hex, 16)?)
    } else {
        Ok(s.parse()?)
    }
}

fn build_context(opts: &Opts) -> Result<LinkContext> {
    let output_kind = if opts.flags.relocatable {
        OutputKind::Relocatable
    } else if opts.flags.shared {
        OutputKind::SharedLibrary
    } else {
        OutputKind::Executable
    };

    let output_path = opts.scalars.output.clone().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("a.out"));

    let container = match opts.scalars.oformat.as_deref() {
        Some(f) if f.starts_with("pe") || f.contains("coff") => ContainerFamily::Coff,
        Some(_) => ContainerFamily::Elf,
        None => match output_path.extension().and_then(|e| e.to_str()) {
            Some("exe" | "dll" | "obj") => ContainerFamily::Coff,
            _ => ContainerFamily::Elf,
        },
    };

    let section_alignment = opts
        .scalars
        .section_alignment
        .as_deref()
        .map(parse_u64)
        .transpose()?
        .unwrap_or(LinkContext::DEFAULT_PAGE_ALIGN);

    let defsyms = opts
        .lists
        .defsyms
        .iter()
        .map(|s| {
            let (name, value) = s.split_once('=').ok_or_else(|| anyhow::anyhow!("--defsym expects name=value, got {s}"))?;
            Ok((BString::from(name), parse_u64(value)?))
        })
        .collect::<Result<Vec<_>>>()?;

    let alternate_names = opts
        .lists
        .alternate_names
        .iter()
        .map(|s| {
            let (from, to) = s
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("--alternate-name expects from=to, got {s}"))?;
            Ok((BString::from(from), BString::from(to)))
        })
        .collect::<Result<Vec<_>>>()?;

    let version_script = opts.scalars.version_script.clone().map(PathBuf::from);
    let (version_script_global, version_script_local) = match &version_script {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("reading version script {}", path.display()))?;
            let script = version_script::parse(&text)?;
            (script.global, script.local)
        }
        None => (Vec::new(), Vec::new()),
    };

    let stack_reserve_commit = opts
        .scalars
        .stack
        .as_deref()
        .map(|s| parse_reserve_commit(s, 0x1000))
        .transpose()?
        .unwrap_or((0x100000, 0x1000));
    let heap_reserve_commit = opts
        .scalars
        .heap
        .as_deref()
        .map(|s| parse_reserve_commit(s, 0x1000))
        .transpose()?
        .unwrap_or((0x100000, 0x1000));

    let dynamic_list = opts.scalars.dynamic_list.clone().map(PathBuf::from);
    let dynamic_list_patterns = match &dynamic_list {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("reading dynamic list {}", path.display()))?;
            version_script::parse_dynamic_list(&text)?.into_iter().map(BString::from).collect()
        }
        None => Vec::new(),
    };

    Ok(LinkContext {
        container,
        arch: atom::Arch::X86_64,
        output_kind,
        output_path,
        entry_symbol: opts.scalars.entry.clone().map(BString::from).or_else(|| {
            (container == ContainerFamily::Elf && output_kind == OutputKind::Executable)
                .then(|| BString::from("_start"))
        }),
        image_base: opts.scalars.image_base.as_deref().map(parse_u64).transpose()?.map(elven_parser::Addr),
        section_alignment,
        file_alignment: section_alignment,
        subsystem: Subsystem::WindowsCui,
        stack_reserve: stack_reserve_commit.0,
        stack_commit: stack_reserve_commit.1,
        heap_reserve: heap_reserve_commit.0,
        heap_commit: heap_reserve_commit.1,
        nx_compat: true,
        dynamic_base: true,
        large_address_aware: false,
        terminal_server_aware: true,
        allow_bind: !opts.flags.no_bind,
        allow_isolation: !opts.flags.no_isolation,
        base_relocations: !opts.flags.no_relocations,
        export_dynamic: opts.flags.export_dynamic,
        pic: opts.flags.pie || opts.flags.shared,
        undefined_names: opts.lists.undefined.iter().cloned().map(BString::from).collect(),
        include_names: opts.lists.include.iter().cloned().map(BString::from).collect(),
        wrap_names: opts.lists.wrap.iter().cloned().map(BString::from).collect(),
        defsyms,
        alternate_names,
        allow_remaining_undefines: !opts.flags.no_undefined && opts.flags.shared,
        allow_multiple_definition: opts.flags.allow_multiple_definition,
        no_inhibit_exec: opts.flags.noinhibit_exec,
        force_undefined_to_absolute: opts.flags.force_unresolved,
        rpath_list: opts.lists.rpath.iter().cloned().map(BString::from).collect(),
        dynamic_linker: BString::from("/lib64/ld-linux-x86-64.so.2"),
        soname: opts.scalars.soname.clone().map(BString::from),
        as_needed: opts.flags.as_needed,
        no_default_libs: opts.flags.nostdlib,
        search_paths: opts.lists.library_paths.clone(),
        default_libs: opts.lists.libraries.iter().cloned().map(BString::from).collect(),
        gc_sections: opts.flags.gc_sections,
        build_id: opts.flags.build_id,
        version_script,
        dynamic_list,
        version_script_global,
        version_script_local,
        dynamic_list_patterns,
    })
}

/// Locates a `-lNAME` request on `search_paths`, preferring a shared
/// object over a static archive the way `ld` does (`-Bstatic` grouping
/// is not modeled here).
fn find_library(name: &str, search_paths: &[PathBuf]) -> Option<PathBuf> {
    for dir in search_paths {
        let so = dir.join(format!("lib{name}.so"));
        if so.is_file() {
            return Some(so);
        }
    }
    for dir in search_paths {
        let a = dir.join(format!("lib{name}.a"));
        if a.is_file() {
            return Some(a);
        }
    }
    None
}

pub fn run(opts: Opts) -> Result<()> {
    if opts.inputs.is_empty() {
        bail!("no input files");
    }

    let ctx = build_context(&opts)?;

    let mut library_inputs: Vec<PathBuf> = Vec::new();
    if !ctx.no_default_libs {
        for lib in &ctx.default_libs {
            let lib = lib.to_string();
            let path = find_library(&lib, &ctx.search_paths)
                .with_context(|| format!("cannot find -l{lib}"))?;
            library_inputs.push(path);
        }
    }

    let mut paths: Vec<PathBuf> = opts.inputs.iter().map(|f| f.name.clone()).collect();
    paths.extend(library_inputs);

    let mmaps: Vec<Mmap> = paths
        .iter()
        .map(|path| {
            let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
            unsafe { Mmap::map(&file).with_context(|| format!("memory mapping {}", path.display())) }
        })
        .collect::<Result<Vec<_>>>()?;

    info!(inputs = ?paths, output = %ctx.output_path.display(), "linking");

    let mut resolver = Resolver::new(&ctx);
    for (path, mmap) in paths.iter().zip(&mmaps) {
        let data: &[u8] = mmap;
        if is_shared_object(data) {
            resolver.load_shared_object(path, data)?;
        } else {
            resolver.load_file(path, data)?;
        }
    }

    for (name, value) in ctx.defsyms.clone() {
        let idx = atom::AtomIdx(resolver.synthetic.atoms.len() as u32);
        resolver
            .synthetic
            .atoms
            .push(atom::Atom::Absolute(atom::AbsoluteAtom { name: name.clone(), value }));
        let id = atom::AtomId { file: atom::FileId::SYNTHETIC, idx };
        let files = &resolver.files;
        let synthetic = &resolver.synthetic;
        let atoms_of = |id: atom::AtomId| {
            if id.file == atom::FileId::SYNTHETIC {
                synthetic.atoms.get(id.idx.0 as usize)
            } else {
                files.get(id.file.0 as usize)?.atoms().get(id.idx.0 as usize)
            }
        };
        resolver.symtab.offer(&name, id, &atoms_of, &|_| PathBuf::new())?;
    }

    resolver.finish()?;

    if ctx.entry_symbol.is_some() && ctx.output_kind == OutputKind::Executable && resolver.entry_atom().is_none() {
        warn!(entry = ?ctx.entry_symbol, "entry symbol not found; image will have a zero entry point");
    }

    let dynamic_plan = dynamic::inject(&mut resolver, &ctx);
    let import_plan = import::inject(&mut resolver, &ctx);

    let live = deadstrip::mark_live(&resolver, &ctx);
    let discarded_comdat = layout::discarded_comdat_atoms(&resolver);
    let sections = layout::build_output_sections(&resolver, &live, &discarded_comdat, &ctx);

    if sections.is_empty() {
        bail!("nothing to link: no live sections after dead-stripping");
    }

    match ctx.container {
        ContainerFamily::Elf => {
            let needs_dynamic = dynamic::needs_dynamic(&resolver, &ctx);
            let extra_phdrs = dynamic::extra_phdr_count(&ctx, needs_dynamic);
            let mut elf_layout = address::assign_elf_addresses(&resolver, &sections, &ctx, extra_phdrs);
            dynamic::finalize(&resolver, &mut elf_layout, &live, &dynamic_plan, &ctx);
            reloc::apply_elf_relocations(&resolver, &mut elf_layout, &ctx)?;
            writer::write_elf(elf_layout, &ctx.output_path)?;
        }
        ContainerFamily::Coff => {
            let mut coff_layout = address_coff::assign_coff_addresses(&resolver, &sections, &ctx);
            import::finalize(&mut coff_layout, &import_plan);
            reloc::apply_coff_relocations(&resolver, &mut coff_layout, &ctx)?;
            writer::write_coff(coff_layout, &ctx.output_path)?;
        }
    }

    debug!(output = %ctx.output_path.display(), "link complete");
    Ok(())
}

fn is_shared_object(data: &[u8]) -> bool {
    if !data.starts_with(elven_parser::consts::ELFMAG) {
        return false;
    }
    let Ok(reader) = elven_parser::read::ElfReader::new(data) else { return false };
    let Ok(header) = reader.header() else { return false };
    header.r#type == elven_parser::consts::Type(elven_parser::consts::ET_DYN)
}
