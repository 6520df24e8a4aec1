//! The atom/reference data model.
//!
//! An atom is the indivisible unit of linking: every byte that ends up in
//! the output either belongs to exactly one atom or is synthesized by one
//! of the table builders as a new atom owned by the `SyntheticFile`
//! (`crate::file::SyntheticFile`). Atoms never move between files; cross-
//! file edges are always resolved through the `SymbolTable`
//! (`crate::symtab`), never through a raw pointer, per an arena+index redesign keeping atoms owned in one place.

use bstr::BString;

/// Which input file owns an atom. Index into `Resolver::files`. File
/// `FileId::SYNTHETIC` is the one dedicated internal file that owns every
/// linker-generated atom (`__ImageBase`, IAT thunks, PLT stubs, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u32);

impl FileId {
    pub const SYNTHETIC: FileId = FileId(u32::MAX);
}

/// An atom's index within its owning file's arena. Stable for the whole
/// run: never reused, never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AtomIdx(pub u32);

/// A fully-qualified atom reference: which file, which slot in its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AtomId {
    pub file: FileId,
    pub idx: AtomIdx,
}

/// Content type of a `DefinedAtom`, used to pick the output section family
/// and whether the atom needs bytes written at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Code,
    Data,
    ZeroFill,
    Got,
    GotPlt,
    Plt,
    ThreadLocalData,
    ThreadLocalZeroFill,
    MergeString,
    MergeConstant,
    /// `.init_array`/`.fini_array`/`.ctors`/`.dtors` entries: ordered
    /// specially by `LayoutEngine`.
    InitializerPointer,
    FinalizerPointer,
    /// Notes, `.eh_frame`, build-id and similar sections that are kept
    /// verbatim but never referenced by relocations from regular code.
    Note,
    EhFrame,
    /// Dynamic linking auxiliary data (`.dynamic`, hash tables, ...).
    Dynamic,
}

impl ContentType {
    pub fn is_zero_fill(self) -> bool {
        matches!(self, ContentType::ZeroFill | ContentType::ThreadLocalZeroFill)
    }

    pub fn is_tls(self) -> bool {
        matches!(self, ContentType::ThreadLocalData | ContentType::ThreadLocalZeroFill)
    }
}

/// Read/write/execute permission triple, the coarsest axis output sections
/// are grouped and ordered by (loadable before non-loadable,
/// read-only before writable, executable before writable-data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Permissions {
    pub const R: Self = Permissions { read: true, write: false, execute: false };
    pub const RW: Self = Permissions { read: true, write: true, execute: false };
    pub const RX: Self = Permissions { read: true, write: false, execute: true };

    /// Segment ordering key: R before RW
    /// before RX before RWX, which in practice keeps `.text` ahead of
    /// `.data`/`.bss` and both ahead of any writable+executable oddity.
    pub fn order_key(self) -> u8 {
        (self.execute as u8) << 1 | (self.write as u8)
    }
}

/// How duplicate atoms of the same (section-derived) identity are
/// reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    NoMerge,
    SameNameAddressUsed,
    SameNameAndSize,
    /// Commons: keep the larger size, with the maximum alignment seen.
    Largest,
    /// Mergeable string/constant sections: dedup keyed on content.
    ByContent,
    /// COMDAT `associate` children: liveness tracks the parent, no
    /// independent dedup identity of their own.
    Associative,
}

/// Where an atom's bytes land in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionChoice {
    /// Derive the output section name from the atom's content type /
    /// input section name (the common case).
    ContentDerived,
    /// The atom insists on a specific output section name regardless of
    /// content (`__attribute__((section(...)))`-style custom placement).
    CustomNamed,
    /// Like `CustomNamed` but the section must exist even if empty
    /// (used by synthetic sections such as `.dynamic`).
    CustomRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadStripPolicy {
    Normal,
    Never,
    AlwaysRoot,
}

/// The preference-ordering binding kind carried on a symbol slot
///. Distinct from ELF/COFF wire binding so the table can
/// reason about "strong vs weak" uniformly across container families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Global,
    Weak,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Visibility {
    Default,
    Protected,
    Hidden,
    Internal,
}

impl Visibility {
    /// Merge two visibilities by taking the most restrictive
    ///.
    pub fn merge(self, other: Self) -> Self {
        self.max(other)
    }
}

#[derive(Debug, Clone)]
pub struct DefinedAtom {
    pub content_type: ContentType,
    pub permissions: Permissions,
    /// `2^align_pow2` bytes, further constrained to a multiple of
    /// `align_modulus` (almost always 1 in practice, but kept
    /// for the rare "aligned mod N" ELF relocation requirement).
    pub align_pow2: u8,
    pub align_modulus: u32,
    pub binding: Binding,
    pub visibility: Visibility,
    pub merge: MergePolicy,
    pub section_choice: SectionChoice,
    /// The output section name this atom wants, honoring
    /// `section_choice`; always populated even for `ContentDerived` atoms
    /// (AtomFactory fills it in from the input section name).
    pub section_name: BString,
    pub dead_strip: DeadStripPolicy,
    /// Source-file declaration order; the final ordering tie-breaker
    ///.
    pub ordinal: u32,
    /// The atom's own bytes. Empty for zero-fill content; `size` below is
    /// authoritative for those.
    pub content: Vec<u8>,
    /// Authoritative size; equals `content.len()` for non-zero-fill atoms.
    pub size: u64,
    pub references: Vec<Reference>,
    /// Present only for named (externally visible) atoms.
    pub name: Option<BString>,
}

#[derive(Debug, Clone)]
pub struct UndefinedAtom {
    pub name: BString,
    /// COFF weak-external fallback: resolves to this atom if `name`
    /// remains undefined everywhere else.
    pub fallback: Option<AtomId>,
    pub can_be_null: bool,
    pub weak: bool,
}

#[derive(Debug, Clone)]
pub struct SharedLibraryAtom {
    pub name: BString,
    pub dso: BString,
    pub ordinal: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct AbsoluteAtom {
    pub name: BString,
    pub value: u64,
}

/// A placeholder materialized from an archive's symbol index; resolving
/// it triggers extraction of the member at `member_offset` from `archive`
///.
#[derive(Debug, Clone)]
pub struct LazyAtom {
    pub name: BString,
    pub archive_file: FileId,
    pub member_offset: usize,
}

#[derive(Debug, Clone)]
pub enum Atom {
    Defined(DefinedAtom),
    Undefined(UndefinedAtom),
    SharedLibrary(SharedLibraryAtom),
    Absolute(AbsoluteAtom),
    Lazy(LazyAtom),
}

impl Atom {
    pub fn name(&self) -> Option<&BString> {
        match self {
            Atom::Defined(a) => a.name.as_ref(),
            Atom::Undefined(a) => Some(&a.name),
            Atom::SharedLibrary(a) => Some(&a.name),
            Atom::Absolute(a) => Some(&a.name),
            Atom::Lazy(a) => Some(&a.name),
        }
    }

    pub fn as_defined(&self) -> Option<&DefinedAtom> {
        match self {
            Atom::Defined(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_defined_mut(&mut self) -> Option<&mut DefinedAtom> {
        match self {
            Atom::Defined(a) => Some(a),
            _ => None,
        }
    }
}

/// Reference namespaces: which kind space a reference's
/// numeric `kind_value` must be interpreted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindNamespace {
    Elf,
    Coff,
    /// Ordering-only edges that produce no bytes (`layout-before`,
    /// `layout-after`, `in-group`, `associate`).
    Layout,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    X86_64,
    AArch64,
    Arm,
    Ppc,
    Ppc64,
    Mips32,
    Mips64,
    Hexagon,
    AmdGpu,
    All,
}

/// Ordering-only reference kinds. These never produce
/// bytes; `LayoutEngine` walks them to build the partial order and
/// `DeadStrip` walks `Associate` edges bidirectionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    Before,
    After,
    InGroup,
    Associate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Elf(u32),
    Coff(u16),
    Layout(LayoutKind),
}

impl RefKind {
    pub fn namespace(self) -> KindNamespace {
        match self {
            RefKind::Elf(_) => KindNamespace::Elf,
            RefKind::Coff(_) => KindNamespace::Coff,
            RefKind::Layout(_) => KindNamespace::Layout,
        }
    }

    pub fn is_layout_only(self) -> bool {
        matches!(self, RefKind::Layout(_))
    }
}

/// Where a `Reference` points. Most references target a specific atom
/// already identified by `AtomFactory` (an intra-file relocation against
/// a symbol whose section is known); cross-file/undefined targets go
/// through the interned name and are rewritten to `Atom` once resolved.
#[derive(Debug, Clone)]
pub enum RefTarget {
    Atom(AtomId),
    Name(BString),
}

/// A directed edge from one atom at `offset_in_atom` to a target,
/// parameterized by `(kind_namespace, kind_arch, kind_value, addend)`
///.
#[derive(Debug, Clone)]
pub struct Reference {
    pub offset_in_atom: u64,
    pub target: RefTarget,
    pub kind: RefKind,
    pub arch: Arch,
    pub addend: i64,
}
