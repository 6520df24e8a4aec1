//! System-V `ar` archives (`.a` static libraries, COFF/PE import libraries).
//!
//! See <https://en.wikipedia.org/wiki/Ar_(Unix)#File_format_details>

use std::{mem, str};

use bstr::BStr;

pub const ARMAG: &[u8; 8] = b"!<arch>\n";
const HEADER_LEN: usize = 60;
const HEADER_TERMINATOR: &[u8; 2] = b"\x60\n";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ArchiveReadError {
    #[error("archive is too small to hold the ar magic")]
    TooSmall,
    #[error("wrong archive magic, found {0:x?}")]
    WrongMagic([u8; 8]),
    #[error("member header at offset {0} is truncated")]
    TruncatedHeader(usize),
    #[error("member header at offset {0} has an invalid size field {1:?}")]
    InvalidSize(usize, String),
    #[error("member header at offset {0} is missing its `{}` terminator", HEADER_TERMINATOR_DISPLAY)]
    MissingTerminator(usize),
    #[error("member body at offset {0} extends past end of file")]
    TruncatedBody(usize),
    #[error("long member name index {0} is out of range of the `//` table")]
    LongNameOutOfRange(usize),
}

const HEADER_TERMINATOR_DISPLAY: &str = "`\\n";

pub type Result<T> = std::result::Result<T, ArchiveReadError>;

/// A single member (`.o`, short import header, nested archive, ...) of an
/// `ar` archive, with its raw header fields still attached.
#[derive(Debug, Clone, Copy)]
pub struct Member<'a> {
    pub name: &'a BStr,
    pub data: &'a [u8],
    /// Byte offset of the member's header in the archive. Used as the
    /// first-seen-wins identity for archive-member loading (§5 Resource
    /// policies: re-requesting an already-loaded member is a no-op).
    pub header_offset: usize,
}

/// A parsed `ar` archive: the System-V symbol index plus random access to
/// members by byte offset.
pub struct ArchiveFile<'a> {
    data: &'a [u8],
    /// Extended name table (the `//` member), if present.
    long_names: &'a [u8],
    /// Offsets of every "real" member, in file order (skips `/` and `//`).
    member_offsets: Vec<usize>,
}

/// One entry in the System-V symbol index: a symbol name and the byte
/// offset of the archive member that defines it.
#[derive(Debug, Clone, Copy)]
pub struct SymbolIndexEntry<'a> {
    pub name: &'a BStr,
    pub member_offset: usize,
}

impl<'a> ArchiveFile<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < ARMAG.len() {
            return Err(ArchiveReadError::TooSmall);
        }
        let magic: [u8; 8] = data[..ARMAG.len()].try_into().unwrap();
        if &magic != ARMAG {
            return Err(ArchiveReadError::WrongMagic(magic));
        }

        let mut long_names: &[u8] = &[];
        let mut member_offsets = Vec::new();

        let mut offset = ARMAG.len();
        while offset < data.len() {
            // Members are 2-byte aligned; a single '\n' pad byte may separate them.
            if data[offset] == b'\n' {
                offset += 1;
                continue;
            }

            let header = parse_header(data, offset)?;
            let body_start = offset + HEADER_LEN;
            let body_end = body_start
                .checked_add(header.size)
                .ok_or(ArchiveReadError::TruncatedBody(offset))?;
            if body_end > data.len() {
                return Err(ArchiveReadError::TruncatedBody(offset));
            }

            let trimmed_name = trim_trailing_spaces_keep_slash(header.raw_name);
            match trimmed_name {
                b"/" => {
                    // System-V symbol index. Ignored here; callers that need
                    // fast lookup use `symbol_index()` which re-reads it.
                }
                b"//" => {
                    long_names = &data[body_start..body_end];
                }
                _ => member_offsets.push(offset),
            }

            // Member data is padded to an even size.
            offset = body_end + (header.size % 2);
        }

        Ok(ArchiveFile {
            data,
            long_names,
            member_offsets,
        })
    }

    /// Resolve a member's display name, following the `//` long-name table
    /// indirection (`/123` means "name starts at offset 123 in `//`").
    fn member_name(&self, header: &Header<'a>) -> Result<&'a BStr> {
        if let Some(rest) = header.raw_name.strip_prefix(b"/") {
            let rest = trim_trailing_spaces(rest);
            if rest.is_empty() {
                return Ok(BStr::new(b""));
            }
            let idx: usize = str::from_utf8(rest)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(ArchiveReadError::LongNameOutOfRange(0))?;
            if idx >= self.long_names.len() {
                return Err(ArchiveReadError::LongNameOutOfRange(idx));
            }
            let slice = &self.long_names[idx..];
            let end = slice
                .iter()
                .position(|&b| b == b'\n' || b == b'/')
                .unwrap_or(slice.len());
            Ok(BStr::new(&slice[..end]))
        } else {
            Ok(BStr::new(trim_trailing_spaces(header.raw_name)))
        }
    }

    pub fn member_at(&self, header_offset: usize) -> Result<Member<'a>> {
        let header = parse_header(self.data, header_offset)?;
        let body_start = header_offset + HEADER_LEN;
        let body_end = body_start + header.size;
        let name = self.member_name(&header)?;
        Ok(Member {
            name,
            data: &self.data[body_start..body_end],
            header_offset,
        })
    }

    pub fn members(&self) -> Result<Vec<Member<'a>>> {
        self.member_offsets
            .iter()
            .map(|&off| self.member_at(off))
            .collect()
    }

    /// The System-V symbol index (the `/` member): which member defines
    /// which external name. Used by the Resolver to decide whether pulling
    /// a member in satisfies an outstanding undefined symbol without first
    /// parsing every member as an object file.
    pub fn symbol_index(&self) -> Result<Vec<SymbolIndexEntry<'a>>> {
        let mut offset = ARMAG.len();
        while offset < self.data.len() {
            if self.data[offset] == b'\n' {
                offset += 1;
                continue;
            }
            let header = parse_header(self.data, offset)?;
            let body_start = offset + HEADER_LEN;
            let body_end = body_start + header.size;

            if trim_trailing_spaces_keep_slash(header.raw_name) == b"/" {
                let body = &self.data[body_start..body_end];
                return parse_symbol_index(body);
            }

            offset = body_end + (header.size % 2);
        }
        Ok(Vec::new())
    }
}

/// Trims trailing ASCII space padding from a fixed-width header field,
/// then strips the System-V short-name terminating `/` if present.
fn trim_trailing_spaces(name: &[u8]) -> &[u8] {
    let name = trim_trailing_spaces_keep_slash(name);
    name.strip_suffix(b"/").unwrap_or(name)
}

/// Trims trailing ASCII space padding only, keeping a terminating `/`
/// (used to recognize the special `/` and `//` member names).
fn trim_trailing_spaces_keep_slash(name: &[u8]) -> &[u8] {
    let end = name
        .iter()
        .rposition(|&b| b != b' ')
        .map(|i| i + 1)
        .unwrap_or(0);
    &name[..end]
}

struct Header<'a> {
    raw_name: &'a [u8],
    size: usize,
}

fn parse_header(data: &[u8], offset: usize) -> Result<Header<'_>> {
    if offset + HEADER_LEN > data.len() {
        return Err(ArchiveReadError::TruncatedHeader(offset));
    }
    let raw = &data[offset..offset + HEADER_LEN];

    let terminator = &raw[58..60];
    if terminator != HEADER_TERMINATOR {
        return Err(ArchiveReadError::MissingTerminator(offset));
    }

    let raw_name = &raw[0..16];
    let size_field = str::from_utf8(&raw[48..58])
        .map_err(|_| ArchiveReadError::InvalidSize(offset, "non-utf8".to_string()))?;
    let size: usize = size_field
        .trim()
        .parse()
        .map_err(|_| ArchiveReadError::InvalidSize(offset, size_field.to_string()))?;

    Ok(Header { raw_name, size })
}

/// The System-V `/` member: a big-endian u32 count, that many big-endian u32
/// member offsets, then that many NUL-terminated symbol names in the same
/// order as the offsets.
fn parse_symbol_index(body: &[u8]) -> Result<Vec<SymbolIndexEntry<'_>>> {
    if body.len() < 4 {
        return Ok(Vec::new());
    }
    let count = u32::from_be_bytes(body[0..4].try_into().unwrap()) as usize;
    let offsets_start = 4;
    let offsets_end = offsets_start + count * mem::size_of::<u32>();
    if offsets_end > body.len() {
        return Ok(Vec::new());
    }

    let mut offsets = Vec::with_capacity(count);
    for chunk in body[offsets_start..offsets_end].chunks_exact(4) {
        offsets.push(u32::from_be_bytes(chunk.try_into().unwrap()) as usize);
    }

    let mut names = body[offsets_end..].split(|&b| b == 0);
    let mut entries = Vec::with_capacity(count);
    for &member_offset in offsets.iter() {
        let Some(name) = names.next() else { break };
        if name.is_empty() && entries.len() == count {
            break;
        }
        entries.push(SymbolIndexEntry {
            name: BStr::new(name),
            member_offset,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pad_header(name: &str, size: usize) -> Vec<u8> {
        let mut header = vec![b' '; HEADER_LEN];
        header[0..name.len()].copy_from_slice(name.as_bytes());
        let date = b"0";
        header[16..16 + date.len()].copy_from_slice(date);
        let uid = b"0";
        header[28..28 + uid.len()].copy_from_slice(uid);
        let gid = b"0";
        header[34..34 + gid.len()].copy_from_slice(gid);
        let mode = b"100644";
        header[40..40 + mode.len()].copy_from_slice(mode);
        let size_str = size.to_string();
        header[48..48 + size_str.len()].copy_from_slice(size_str.as_bytes());
        header[58..60].copy_from_slice(HEADER_TERMINATOR);
        header
    }

    fn build_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = ARMAG.to_vec();
        for (name, content) in members {
            out.extend(pad_header(name, content.len()));
            out.extend(*content);
            if content.len() % 2 == 1 {
                out.push(b'\n');
            }
        }
        out
    }

    #[test]
    fn reads_simple_members() {
        let data = build_archive(&[("foo.o/", b"AAAA"), ("bar.o/", b"BB")]);
        let archive = ArchiveFile::new(&data).unwrap();
        let members = archive.members().unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name.as_bytes(), b"foo.o");
        assert_eq!(members[0].data, b"AAAA");
        assert_eq!(members[1].name.as_bytes(), b"bar.o");
        assert_eq!(members[1].data, b"BB");
    }

    #[test]
    fn rejects_bad_magic() {
        let data = b"not an archive!!";
        assert!(matches!(
            ArchiveFile::new(data),
            Err(ArchiveReadError::WrongMagic(_))
        ));
    }

    #[test]
    fn odd_sized_member_is_padded() {
        let data = build_archive(&[("a.o/", b"X"), ("b.o/", b"YY")]);
        let archive = ArchiveFile::new(&data).unwrap();
        let members = archive.members().unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[1].data, b"YY");
    }
}
