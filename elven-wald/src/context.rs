//! `LinkContext`: the single explicit struct threaded through every
//! component, rather than global mutable singletons (`Config`, `Target`,
//! `Driver`). Every component takes `&LinkContext` rather than reaching
//! for ambient global state.

use std::path::PathBuf;

use bstr::BString;
use elven_parser::Addr;

use crate::atom::Arch;

/// The two container families this core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFamily {
    Elf,
    Coff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Executable,
    SharedLibrary,
    /// `--relocatable` / `/partial`: emit another relinkable object
    /// rather than a final image. The core's
    /// `AddressAssigner` and table builders key off this to skip dynamic
    /// table synthesis entirely.
    Relocatable,
}

impl OutputKind {
    pub fn is_pic_by_default(self) -> bool {
        matches!(self, OutputKind::SharedLibrary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    WindowsCui,
    WindowsGui,
}

/// The driver-provided configuration surface, collected
/// from `Opts` (clap-derived CLI) before the resolver runs. Nothing in
/// here is mutated after construction; components read it by shared
/// reference.
#[derive(Debug, Clone)]
pub struct LinkContext {
    pub container: ContainerFamily,
    pub arch: Arch,
    pub output_kind: OutputKind,
    pub output_path: PathBuf,

    pub entry_symbol: Option<BString>,
    pub image_base: Option<Addr>,
    pub section_alignment: u64,
    pub file_alignment: u64,

    pub subsystem: Subsystem,
    pub stack_reserve: u64,
    pub stack_commit: u64,
    pub heap_reserve: u64,
    pub heap_commit: u64,

    pub nx_compat: bool,
    pub dynamic_base: bool,
    pub large_address_aware: bool,
    pub terminal_server_aware: bool,
    pub allow_bind: bool,
    pub allow_isolation: bool,
    pub base_relocations: bool,

    pub export_dynamic: bool,
    pub pic: bool,

    pub undefined_names: Vec<BString>,
    pub include_names: Vec<BString>,
    pub wrap_names: Vec<BString>,
    pub defsyms: Vec<(BString, u64)>,
    pub alternate_names: Vec<(BString, BString)>,

    pub allow_remaining_undefines: bool,
    pub allow_multiple_definition: bool,
    pub no_inhibit_exec: bool,
    pub force_undefined_to_absolute: bool,

    pub rpath_list: Vec<BString>,
    pub dynamic_linker: BString,
    pub soname: Option<BString>,
    pub as_needed: bool,
    pub no_default_libs: bool,
    pub search_paths: Vec<PathBuf>,
    pub default_libs: Vec<BString>,

    pub gc_sections: bool,
    pub build_id: bool,
    pub version_script: Option<PathBuf>,
    pub dynamic_list: Option<PathBuf>,
    /// Parsed `global:`/`local:` patterns from `version_script`, already
    /// split so `Resolver::apply_version_script` doesn't need to touch
    /// the filesystem or re-parse on every link.
    pub version_script_global: Vec<String>,
    pub version_script_local: Vec<String>,
    /// Parsed patterns from `dynamic_list`: symbols matching one of these
    /// are forced into `.dynsym` regardless of `export_dynamic` or their
    /// own visibility.
    pub dynamic_list_patterns: Vec<BString>,
}

impl LinkContext {
    /// The default page/segment alignment used when §6.1's
    /// `section_alignment` is not overridden: 4 KiB everywhere this core
    /// targets (x86/x86_64): typically 4 KiB.
    pub const DEFAULT_PAGE_ALIGN: u64 = 0x1000;

    pub fn default_image_base(&self) -> Addr {
        if let Some(base) = self.image_base {
            return base;
        }
        match (self.container, self.output_kind) {
            (ContainerFamily::Elf, OutputKind::SharedLibrary) => Addr(0),
            (ContainerFamily::Elf, _) => Addr(0x400000),
            (ContainerFamily::Coff, _) if self.output_kind == OutputKind::SharedLibrary => {
                Addr(elven_coff::consts::DEFAULT_IMAGE_BASE_DLL)
            }
            (ContainerFamily::Coff, _) => Addr(elven_coff::consts::DEFAULT_IMAGE_BASE_EXE),
        }
    }

    /// True once `--shared`/`--pic`/`-fPIC`-equivalent semantics apply:
    /// relocations may not be relaxed to absolute forms and symbols stay
    /// preemptible.
    pub fn is_shared_output(&self) -> bool {
        self.output_kind == OutputKind::SharedLibrary || self.pic
    }
}
