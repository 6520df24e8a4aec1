//! The link-wide error taxonomy. Every error that can abort a
//! link carries the offending symbol/offset and the source file(s)
//! involved, so the CLI can print a useful diagnostic without the core
//! needing to know anything about presentation.

use std::path::PathBuf;

use bstr::BString;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("{file}: {source}")]
    Parse {
        file: PathBuf,
        #[source]
        source: ParseError,
    },
    #[error(
        "duplicate symbol `{name}`: already defined in {first}, duplicate definition in {second}"
    )]
    DuplicateSymbol {
        name: BString,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("undefined symbol `{name}`, referenced from {referenced_from}")]
    UndefinedSymbol {
        name: BString,
        referenced_from: PathBuf,
    },
    #[error("relocation overflow in {file} at offset {offset:#x}: {kind} cannot hold {value:#x}")]
    RelocationOverflow {
        file: PathBuf,
        offset: u64,
        kind: String,
        value: i64,
    },
    #[error("relocation kind {kind} against `{symbol}` in {file} is not supported by this target")]
    RelocationUnsupported {
        file: PathBuf,
        symbol: BString,
        kind: String,
    },
    #[error("relocation in {file} at offset {offset:#x} violates the required alignment of {kind}")]
    RelocationAlignment {
        file: PathBuf,
        offset: u64,
        kind: String,
    },
    #[error("`{name}` is accessed both as a TLS and a non-TLS symbol (first in {first}, then in {second})")]
    TlsTypeMismatch {
        name: BString,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("{0}")]
    Archive(#[from] elven_parser::archive::ArchiveReadError),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported target: {0}")]
    UnsupportedTarget(String),
    #[error("{0}")]
    WriteElf(#[from] elven_parser::write::WriteElfError),
    #[error("{0}")]
    WriteCoff(#[from] elven_coff::write::WriteCoffError),
}

/// Structural parse failures (truncation, bad magic, out-of-range indices).
/// Kept as its own enum (rather than folded into `LinkError` directly) so
/// `BinaryReader` callers can match on it without the symbol/reloc variants
/// that only make sense once resolution has started.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("{0}")]
    Elf(#[from] elven_parser::read::ElfReadError),
    #[error("{0}")]
    Coff(#[from] elven_coff::read::CoffReadError),
    #[error("{0}")]
    Archive(#[from] elven_parser::archive::ArchiveReadError),
    #[error("relocation at offset {offset:#x} in section `{section}` straddles atom boundaries")]
    RelocationStraddlesAtom { section: BString, offset: u64 },
    #[error("unrecognized input file format (bad magic)")]
    UnknownFormat,
    #[error("COFF weak-external alias chain for `{0}` did not terminate (cycle detected)")]
    WeakExternalCycle(BString),
    #[error("malformed version script/dynamic list: {0}")]
    VersionScriptSyntax(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;
