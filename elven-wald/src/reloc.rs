//! `RelocEngine`: walks every live atom's references and
//! patches the output bytes in place. ELF x86_64 is the fully-implemented
//! target; other `Arch` values return `RelocationUnsupported` rather than
//! silently emitting wrong bytes.

use std::path::{Path, PathBuf};

use elven_parser::consts::RX86_64;

use crate::{
    address::ElfLayout,
    address_coff::CoffLayout,
    atom::{Arch, Atom, AtomId, FileId, KindNamespace, RefKind, RefTarget},
    context::LinkContext,
    error::{LinkError, Result},
    resolver::Resolver,
};

/// Apply every non-layout reference in every placed atom against
/// `layout.section_content`. `S`/`A`/`P` follow the usual relocation
/// notation: symbol value, addend, place (the address being patched).
///
/// TLS GD/LD relaxation rewrites bytes outside the relocated field itself
/// (the `call __tls_get_addr@plt` that immediately follows), so `apply_one`
/// reports back the absolute byte range it consumed; that range is then
/// skipped when its turn comes up later in `d.references`, the same way a
/// real assembler/linker treats the call's own `R_X86_64_PLT32` relocation
/// as already spoken for once the surrounding `lea`/`call` sequence has
/// been rewritten to a direct `mov %fs:0,%rax` form.
pub fn apply_elf_relocations(resolver: &Resolver, layout: &mut ElfLayout, ctx: &LinkContext) -> Result<()> {
    for (&atom_id, placement) in &layout.placements {
        let Some(Atom::Defined(d)) = atom_at(resolver, atom_id) else { continue };
        let mut consumed: Vec<std::ops::Range<usize>> = Vec::new();
        for r in &d.references {
            if r.kind.namespace() == KindNamespace::Layout {
                continue;
            }
            let RefKind::Elf(kind) = r.kind else { continue };

            let target = match &r.target {
                RefTarget::Atom(id) => *id,
                RefTarget::Name(_) => continue, // resolver::finish() rewrites every name
            };
            let s = symbol_value(resolver, layout, target);
            let p = placement.addr.u64() + r.offset_in_atom;
            let a = r.addend;

            let file = file_path(resolver, atom_id.file);
            let patch_at = (placement.offset_in_section + r.offset_in_atom) as usize;

            if consumed.iter().any(|range| range.contains(&patch_at)) {
                continue;
            }

            let buf = &mut layout.section_content[placement.section_idx];
            let preemptible = matches!(atom_at(resolver, target), Some(Atom::SharedLibrary(_)));
            if let Some(range) = apply_one(
                buf,
                patch_at,
                kind,
                s,
                a,
                p,
                preemptible,
                ctx.is_shared_output(),
                &file,
                r.offset_in_atom,
            )? {
                consumed.push(range);
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_one(
    buf: &mut [u8],
    at: usize,
    kind: u32,
    s: u64,
    a: i64,
    p: u64,
    preemptible: bool,
    shared_output: bool,
    file: &Path,
    offset: u64,
) -> Result<Option<std::ops::Range<usize>>> {
    let kind_name = |k: u32| RX86_64(k).to_string();

    // Relaxation gate: TLS GD/LD/IE -> LE forms only fire
    // for a non-PIC executable resolving against a local definition.
    let can_relax_tls = !shared_output && !preemptible;

    match kind {
        c if c == c::R_X86_64_NONE => Ok(None),
        c if c == c::R_X86_64_64 => write_u64(buf, at, (s as i64).wrapping_add(a) as u64).map(|_| None),
        c if c == c::R_X86_64_PC64 => write_u64(buf, at, ((s as i64 + a) - p as i64) as u64).map(|_| None),
        c if c == c::R_X86_64_32 => {
            write_checked_u32(buf, at, s as i64 + a, file, offset, &kind_name(c)).map(|_| None)
        }
        c if c == c::R_X86_64_32S => {
            write_checked_i32(buf, at, s as i64 + a, file, offset, &kind_name(c)).map(|_| None)
        }
        c if c == c::R_X86_64_PC32
            || c == c::R_X86_64_PLT32
            || c == c::R_X86_64_GOTPCREL
            || c == c::R_X86_64_GOTPCRELX
            || c == c::R_X86_64_REX_GOTPCRELX =>
        {
            // With no separate GOT/PLT atom materialized for this
            // reference, GOT/PLT-relative kinds degrade to ordinary
            // PC-relative ones: valid whenever the target is a regular
            // local definition (the common case this core's synthetic
            // table builders cover by routing GOT/PLT-needing references
            // through `.got`/`.plt` atoms before `RelocEngine` ever runs).
            write_checked_i32(buf, at, s as i64 + a - p as i64, file, offset, &kind_name(c)).map(|_| None)
        }
        c if c == c::R_X86_64_16 => {
            write_checked_u16(buf, at, s as i64 + a, file, offset, &kind_name(c)).map(|_| None)
        }
        c if c == c::R_X86_64_PC16 => {
            write_checked_i16(buf, at, s as i64 + a - p as i64, file, offset, &kind_name(c)).map(|_| None)
        }
        c if c == c::R_X86_64_8 => write_checked_u8(buf, at, s as i64 + a, file, offset, &kind_name(c)).map(|_| None),
        c if c == c::R_X86_64_PC8 => {
            write_checked_i8(buf, at, s as i64 + a - p as i64, file, offset, &kind_name(c)).map(|_| None)
        }
        c if c == c::R_X86_64_TPOFF32 => {
            // Already relaxed to LE by construction (direct TLS offset),
            // valid regardless of `can_relax_tls`.
            write_checked_i32(buf, at, s as i64 + a, file, offset, &kind_name(c)).map(|_| None)
        }
        c if c == c::R_X86_64_DTPOFF32 => {
            // Once `R_X86_64_TLSLD` has relaxed the module-base call to a
            // direct `mov %fs:0,%rax`, the per-variable module offset and
            // the initial-exec offset are the same quantity (there is only
            // ever one TLS module in a statically-linked LE binary).
            write_checked_i32(buf, at, s as i64 + a, file, offset, &kind_name(c)).map(|_| None)
        }
        c if c == c::R_X86_64_GOTTPOFF && can_relax_tls => {
            // IE -> LE: flip the `mov`/`add` opcode and ModRM byte from a
            // RIP-relative GOT load to a register-direct immediate form,
            // then write the now-direct TP offset into the same field.
            relax_gottpoff_ie_to_le(buf, at, file, offset)?;
            write_checked_i32(buf, at, s as i64 + a, file, offset, &kind_name(c)).map(|_| None)
        }
        c if c == c::R_X86_64_TLSGD && can_relax_tls => {
            relax_tlsgd_to_le(buf, at, s as i64 + a, file, offset).map(Some)
        }
        c if c == c::R_X86_64_TLSLD && can_relax_tls => relax_tlsld_to_le(buf, at, file, offset).map(Some),
        c if c == c::R_X86_64_RELATIVE => write_u64(buf, at, (s as i64 + a) as u64).map(|_| None),
        other => Err(LinkError::RelocationUnsupported {
            file: file.to_path_buf(),
            symbol: bstr::BString::from(format!("kind {other}")),
            kind: kind_name(other),
        }),
    }
}

/// IE -> LE: `mov foo@gottpoff(%rip),%reg` (opcode `0x8b`) or
/// `add foo@gottpoff(%rip),%reg` (opcode `0x03`) becomes a register-direct
/// immediate form (`0xc7`/`0x81`, ModRM `/0`) at the same two bytes
/// preceding the relocated field, preserving the destination register
/// (carried in the original ModRM's reg bits) and the REX prefix (operand
/// width) untouched. `at` is the relocation's 4-byte field, i.e. the
/// ModRM byte is at `at - 1` and the opcode at `at - 2`.
fn relax_gottpoff_ie_to_le(buf: &mut [u8], at: usize, file: &Path, offset: u64) -> Result<()> {
    if at < 2 {
        return Err(unsupported(file, offset, "R_X86_64_GOTTPOFF"));
    }
    let opcode_at = at - 2;
    let modrm_at = at - 1;
    let reg_bits = (buf[modrm_at] >> 3) & 0x7;
    buf[opcode_at] = match buf[opcode_at] {
        0x8b => 0xc7,
        0x03 => 0x81,
        _ => return Err(unsupported(file, offset, "R_X86_64_GOTTPOFF")),
    };
    buf[modrm_at] = 0xc0 | reg_bits;
    Ok(())
}

/// GD -> LE: rewrites the fixed 16-byte
/// `.byte 0x66; leaq x@tlsgd(%rip),%rdi; .word 0x6666; rex64; call __tls_get_addr@plt`
/// sequence (`at` is the `R_X86_64_TLSGD` relocation's 4-byte field, 4
/// bytes into the sequence) to the canonical
/// `mov %fs:0,%rax; lea x@tpoff,%rax` form, writing `tpoff` into the same
/// trailing 4 bytes the call's own `R_X86_64_PLT32` relocation used to
/// occupy. Returns the consumed `[at-4, at+12)` range so the caller skips
/// that now-stale `PLT32` reference.
fn relax_tlsgd_to_le(buf: &mut [u8], at: usize, tpoff: i64, file: &Path, offset: u64) -> Result<std::ops::Range<usize>> {
    let start = at.checked_sub(4).ok_or_else(|| unsupported(file, offset, "R_X86_64_TLSGD"))?;
    let end = start + 16;
    if end > buf.len() {
        return Err(unsupported(file, offset, "R_X86_64_TLSGD"));
    }
    buf[start..start + 9].copy_from_slice(&[0x64, 0x48, 0x8b, 0x04, 0x25, 0x00, 0x00, 0x00, 0x00]);
    buf[start + 9..start + 12].copy_from_slice(&[0x48, 0x8d, 0x80]);
    write_checked_i32(buf, start + 12, tpoff, file, offset, "R_X86_64_TLSGD")?;
    Ok(start..end)
}

/// LD -> LE: rewrites the fixed 12-byte
/// `leaq x@tlsld(%rip),%rdi; call __tls_get_addr@plt` sequence (`at` is the
/// `R_X86_64_TLSLD` relocation's 4-byte field, 3 bytes into the sequence)
/// to `.word 0x6666; .byte 0x66; mov %fs:0,%rax` — loading the thread
/// pointer directly rather than the module base `__tls_get_addr` would
/// have returned, since a statically-linked LE binary has exactly one TLS
/// module. Returns the consumed `[at-3, at+9)` range so the caller skips
/// the call's own now-stale `PLT32` reference.
fn relax_tlsld_to_le(buf: &mut [u8], at: usize, file: &Path, offset: u64) -> Result<std::ops::Range<usize>> {
    let start = at.checked_sub(3).ok_or_else(|| unsupported(file, offset, "R_X86_64_TLSLD"))?;
    let end = start + 12;
    if end > buf.len() {
        return Err(unsupported(file, offset, "R_X86_64_TLSLD"));
    }
    buf[start..start + 3].copy_from_slice(&[0x66, 0x66, 0x66]);
    buf[start + 3..start + 12].copy_from_slice(&[0x64, 0x48, 0x8b, 0x04, 0x25, 0x00, 0x00, 0x00, 0x00]);
    Ok(start..end)
}

fn write_u64(buf: &mut [u8], at: usize, value: u64) -> Result<()> {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn write_checked_u32(buf: &mut [u8], at: usize, value: i64, file: &Path, offset: u64, kind: &str) -> Result<()> {
    if value < 0 || value > u32::MAX as i64 {
        return Err(overflow(file, offset, kind, value));
    }
    buf[at..at + 4].copy_from_slice(&(value as u32).to_le_bytes());
    Ok(())
}

fn write_checked_i32(buf: &mut [u8], at: usize, value: i64, file: &Path, offset: u64, kind: &str) -> Result<()> {
    if value < i32::MIN as i64 || value > i32::MAX as i64 {
        return Err(overflow(file, offset, kind, value));
    }
    buf[at..at + 4].copy_from_slice(&(value as i32).to_le_bytes());
    Ok(())
}

fn write_checked_u16(buf: &mut [u8], at: usize, value: i64, file: &Path, offset: u64, kind: &str) -> Result<()> {
    if value < 0 || value > u16::MAX as i64 {
        return Err(overflow(file, offset, kind, value));
    }
    buf[at..at + 2].copy_from_slice(&(value as u16).to_le_bytes());
    Ok(())
}

fn write_checked_i16(buf: &mut [u8], at: usize, value: i64, file: &Path, offset: u64, kind: &str) -> Result<()> {
    if value < i16::MIN as i64 || value > i16::MAX as i64 {
        return Err(overflow(file, offset, kind, value));
    }
    buf[at..at + 2].copy_from_slice(&(value as i16).to_le_bytes());
    Ok(())
}

fn write_checked_u8(buf: &mut [u8], at: usize, value: i64, file: &Path, offset: u64, kind: &str) -> Result<()> {
    if value < 0 || value > u8::MAX as i64 {
        return Err(overflow(file, offset, kind, value));
    }
    buf[at] = value as u8;
    Ok(())
}

fn write_checked_i8(buf: &mut [u8], at: usize, value: i64, file: &Path, offset: u64, kind: &str) -> Result<()> {
    if value < i8::MIN as i64 || value > i8::MAX as i64 {
        return Err(overflow(file, offset, kind, value));
    }
    buf[at] = value as u8;
    Ok(())
}

fn overflow(file: &Path, offset: u64, kind: &str, value: i64) -> LinkError {
    LinkError::RelocationOverflow { file: file.to_path_buf(), offset, kind: kind.to_string(), value }
}

fn symbol_value(resolver: &Resolver, layout: &ElfLayout, id: AtomId) -> u64 {
    if let Some(p) = layout.placements.get(&id) {
        return p.addr.u64();
    }
    if let Some(Atom::Absolute(a)) = atom_at(resolver, id) {
        return a.value;
    }
    0
}

fn atom_at<'a>(resolver: &'a Resolver, id: AtomId) -> Option<&'a Atom> {
    if id.file == FileId::SYNTHETIC {
        resolver.synthetic.atoms.get(id.idx.0 as usize)
    } else {
        resolver.files.get(id.file.0 as usize)?.atoms().get(id.idx.0 as usize)
    }
}

fn file_path(resolver: &Resolver, file: FileId) -> PathBuf {
    if file == FileId::SYNTHETIC {
        return PathBuf::from("<synthetic>");
    }
    resolver.files.get(file.0 as usize).map(|f| f.path().to_path_buf()).unwrap_or_default()
}

mod c {
    pub use elven_parser::consts::*;
}

/// `RelocEngine` for the arch actually exercised by the `.text`/`.data`
/// relocation kinds this core knows about. Anything outside x86_64 is
/// rejected up front: the `--machine` surface accepts x86_64/aarch64, but
/// AArch64 relocation application isn't implemented yet (see DESIGN.md).
pub fn check_arch_supported(arch: Arch) -> Result<()> {
    match arch {
        Arch::X86_64 => Ok(()),
        other => Err(LinkError::UnsupportedTarget(format!("{other:?}"))),
    }
}

mod cc {
    pub use elven_coff::consts::*;
}

/// Apply every non-layout COFF reference in every placed atom against
/// `layout.section_content`. Implicit addends encoded in the instruction
/// stream are never present here (`file_coff::atoms_from_coff` always
/// records `addend: 0`): the non-zero addends seen here are ones
/// `import::inject` sets itself, to address a slot inside a combined
/// IAT/ILT array atom rather than a standalone one.
pub fn apply_coff_relocations(resolver: &Resolver, layout: &mut CoffLayout, _ctx: &LinkContext) -> Result<()> {
    for (&atom_id, placement) in &layout.placements {
        let Some(Atom::Defined(d)) = atom_at(resolver, atom_id) else { continue };
        for r in &d.references {
            if r.kind.namespace() == KindNamespace::Layout {
                continue;
            }
            let RefKind::Coff(kind) = r.kind else { continue };

            let target = match &r.target {
                RefTarget::Atom(id) => *id,
                RefTarget::Name(_) => continue,
            };
            let s = coff_symbol_value(resolver, layout, target);
            let p = placement.addr + r.offset_in_atom;
            let a = r.addend;

            let file = file_path(resolver, atom_id.file);
            let target_placement = layout.placements.get(&target);
            let section_index = target_placement.map(|p| (p.section_idx + 1) as u16);
            let section_rel = target_placement.map(|p| p.offset_in_section);

            let buf = &mut layout.section_content[placement.section_idx];
            let patch_at = (placement.offset_in_section + r.offset_in_atom) as usize;

            apply_coff_one(
                buf,
                patch_at,
                kind,
                s,
                a,
                p,
                layout.image_base,
                section_index,
                section_rel,
                &file,
                r.offset_in_atom,
            )?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_coff_one(
    buf: &mut [u8],
    at: usize,
    kind: u16,
    s: u64,
    a: i64,
    p: u64,
    image_base: u64,
    section_index: Option<u16>,
    section_rel: Option<u64>,
    file: &Path,
    offset: u64,
) -> Result<()> {
    let kind_name = |k: u16| cc::RelocAmd64(k).to_string();

    match kind {
        k if k == cc::IMAGE_REL_AMD64_ABSOLUTE => Ok(()),
        k if k == cc::IMAGE_REL_AMD64_ADDR64 => write_u64(buf, at, (s as i64 + a) as u64),
        k if k == cc::IMAGE_REL_AMD64_ADDR32 => {
            write_checked_u32(buf, at, s as i64 + a, file, offset, &kind_name(k))
        }
        k if k == cc::IMAGE_REL_AMD64_ADDR32NB => {
            write_checked_u32(buf, at, s as i64 + a - image_base as i64, file, offset, &kind_name(k))
        }
        k if (cc::IMAGE_REL_AMD64_REL32..=cc::IMAGE_REL_AMD64_REL32_5).contains(&k) => {
            let trailing_bytes = 4 + (k - cc::IMAGE_REL_AMD64_REL32) as i64;
            write_checked_i32(buf, at, s as i64 + a - p as i64 - trailing_bytes, file, offset, &kind_name(k))
        }
        k if k == cc::IMAGE_REL_AMD64_SECTION => {
            let idx = section_index
                .ok_or_else(|| unsupported(file, offset, &kind_name(k)))?;
            buf[at..at + 2].copy_from_slice(&idx.to_le_bytes());
            Ok(())
        }
        k if k == cc::IMAGE_REL_AMD64_SECREL => {
            let rel = section_rel.ok_or_else(|| unsupported(file, offset, &kind_name(k)))?;
            write_checked_u32(buf, at, rel as i64 + a, file, offset, &kind_name(k))
        }
        other => Err(unsupported(file, offset, &kind_name(other))),
    }
}

fn unsupported(file: &Path, offset: u64, kind: &str) -> LinkError {
    LinkError::RelocationUnsupported {
        file: file.to_path_buf(),
        symbol: bstr::BString::from(format!("kind {kind}")),
        kind: kind.to_string(),
    }
}

fn coff_symbol_value(resolver: &Resolver, layout: &CoffLayout, id: AtomId) -> u64 {
    if let Some(p) = layout.placements.get(&id) {
        return p.addr;
    }
    if let Some(Atom::Absolute(a)) = atom_at(resolver, id) {
        return a.value;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_arch_supported_accepts_only_x86_64() {
        assert!(check_arch_supported(Arch::X86_64).is_ok());
        assert!(check_arch_supported(Arch::AArch64).is_err());
        assert!(check_arch_supported(Arch::Mips32).is_err());
    }

    #[test]
    fn direct_64_writes_symbol_plus_addend_le() {
        let mut buf = vec![0u8; 8];
        apply_one(&mut buf, 0, c::R_X86_64_64, 0x1000, 4, 0, false, false, Path::new("a.o"), 0).unwrap();
        assert_eq!(buf, 0x1004u64.to_le_bytes());
    }

    #[test]
    fn pc_relative_32_computes_s_plus_a_minus_p() {
        let mut buf = vec![0u8; 4];
        // s = 0x2000, a = 0, p = 0x1000 -> 0x1000
        apply_one(&mut buf, 0, c::R_X86_64_PC32, 0x2000, 0, 0x1000, false, false, Path::new("a.o"), 0).unwrap();
        assert_eq!(buf, 0x1000i32.to_le_bytes());
    }

    #[test]
    fn r_x86_64_32_rejects_negative_result() {
        let mut buf = vec![0u8; 4];
        let err = apply_one(&mut buf, 0, c::R_X86_64_32, 0, -1, 0, false, false, Path::new("a.o"), 0).unwrap_err();
        assert!(matches!(err, LinkError::RelocationOverflow { .. }));
    }

    #[test]
    fn r_x86_64_32_rejects_value_above_u32_max() {
        let mut buf = vec![0u8; 4];
        let err = apply_one(&mut buf, 0, c::R_X86_64_32, u32::MAX as u64 + 1, 0, 0, false, false, Path::new("a.o"), 0)
            .unwrap_err();
        assert!(matches!(err, LinkError::RelocationOverflow { .. }));
    }

    #[test]
    fn tls_gottpoff_relaxes_only_when_not_preemptible_and_not_shared() {
        // `48 8b 05 00 00 00 00` = `mov foo@gottpoff(%rip),%rax`; the
        // relocation's 4-byte field starts at offset 3.
        let mut buf = vec![0x48, 0x8b, 0x05, 0, 0, 0, 0];
        assert!(apply_one(&mut buf, 3, c::R_X86_64_GOTTPOFF, 0x10, 0, 0, false, false, Path::new("a.o"), 0).is_ok());
        let mut buf2 = buf.clone();
        let err =
            apply_one(&mut buf2, 3, c::R_X86_64_GOTTPOFF, 0x10, 0, 0, true, false, Path::new("a.o"), 0).unwrap_err();
        assert!(matches!(err, LinkError::RelocationUnsupported { .. }));
    }

    #[test]
    fn tls_gottpoff_ie_to_le_rewrites_mov_opcode_and_modrm() {
        // `mov foo@gottpoff(%rip),%rax` -> `mov $tpoff,%rax`.
        let mut buf = vec![0x48, 0x8b, 0x05, 0, 0, 0, 0];
        apply_one(&mut buf, 3, c::R_X86_64_GOTTPOFF, 0x10, 0, 0, false, false, Path::new("a.o"), 0).unwrap();
        assert_eq!(buf[0], 0x48); // REX.W untouched
        assert_eq!(buf[1], 0xc7); // mov r/m64, imm32
        assert_eq!(buf[2], 0xc0); // ModRM: mod=11, reg=/0, rm=000 (%rax)
        assert_eq!(&buf[3..7], &0x10i32.to_le_bytes());
    }

    #[test]
    fn tls_gottpoff_ie_to_le_rewrites_add_opcode() {
        // `add foo@gottpoff(%rip),%rdx` -> `add $tpoff,%rdx`: reg field
        // (010 = %rdx) is preserved, moved from ModRM's reg bits to its
        // rm bits.
        let mut buf = vec![0x48, 0x03, 0x15, 0, 0, 0, 0];
        apply_one(&mut buf, 3, c::R_X86_64_GOTTPOFF, 0x10, 0, 0, false, false, Path::new("a.o"), 0).unwrap();
        assert_eq!(buf[1], 0x81); // add r/m64, imm32
        assert_eq!(buf[2], 0xc2); // ModRM: mod=11, reg=/0, rm=010 (%rdx)
    }

    #[test]
    fn tls_gd_to_le_rewrites_full_sequence_and_skips_trailing_call() {
        // 16-byte GD sequence: `.byte 0x66; lea x@tlsgd(%rip),%rdi;
        // .word 0x6666; rex64; call __tls_get_addr@plt`. The `TLSGD`
        // relocation's field is at offset 4; the trailing `PLT32` call
        // relocation's field is at offset 12.
        let mut buf = vec![0x66, 0x48, 0x8d, 0x3d, 0, 0, 0, 0, 0x66, 0x66, 0x48, 0xe8, 0, 0, 0, 0];
        let range =
            apply_one(&mut buf, 4, c::R_X86_64_TLSGD, 0x30, 0, 0, false, false, Path::new("a.o"), 0).unwrap();
        assert_eq!(range, Some(0..16));
        assert_eq!(&buf[0..9], &[0x64, 0x48, 0x8b, 0x04, 0x25, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&buf[9..12], &[0x48, 0x8d, 0x80]);
        assert_eq!(&buf[12..16], &0x30i32.to_le_bytes());
    }

    #[test]
    fn tls_gd_relaxation_gated_on_preemptible_and_shared() {
        let mut buf = vec![0x66, 0x48, 0x8d, 0x3d, 0, 0, 0, 0, 0x66, 0x66, 0x48, 0xe8, 0, 0, 0, 0];
        let err = apply_one(&mut buf, 4, c::R_X86_64_TLSGD, 0x30, 0, 0, true, false, Path::new("a.o"), 0).unwrap_err();
        assert!(matches!(err, LinkError::RelocationUnsupported { .. }));
    }

    #[test]
    fn tls_ld_to_le_rewrites_sequence_with_leading_padding() {
        // 12-byte LD sequence: `lea x@tlsld(%rip),%rdi; call
        // __tls_get_addr@plt`. The `TLSLD` relocation's field is at
        // offset 3.
        let mut buf = vec![0x48, 0x8d, 0x3d, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0];
        let range = apply_one(&mut buf, 3, c::R_X86_64_TLSLD, 0, 0, 0, false, false, Path::new("a.o"), 0).unwrap();
        assert_eq!(range, Some(0..12));
        assert_eq!(&buf[0..3], &[0x66, 0x66, 0x66]);
        assert_eq!(&buf[3..12], &[0x64, 0x48, 0x8b, 0x04, 0x25, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn unknown_kind_is_unsupported_not_silently_ignored() {
        let mut buf = vec![0u8; 4];
        let err = apply_one(&mut buf, 0, 0xffff, 0, 0, 0, false, false, Path::new("a.o"), 0).unwrap_err();
        assert!(matches!(err, LinkError::RelocationUnsupported { .. }));
    }

    #[test]
    fn coff_addr32nb_subtracts_image_base() {
        let mut buf = vec![0u8; 4];
        apply_coff_one(
            &mut buf,
            0,
            cc::IMAGE_REL_AMD64_ADDR32NB,
            0x1_4000_1000,
            0,
            0,
            0x1_4000_0000,
            None,
            None,
            Path::new("a.obj"),
            0,
        )
        .unwrap();
        assert_eq!(buf, 0x1000u32.to_le_bytes());
    }

    #[test]
    fn coff_rel32_matches_rel32_1_trailing_byte_convention() {
        let mut buf = vec![0u8; 4];
        // s = 0x2000, p = 0x1000, no addend: REL32 -> 0x2000 - 0x1000 - 4 = 0xffc
        apply_coff_one(&mut buf, 0, cc::IMAGE_REL_AMD64_REL32, 0x2000, 0, 0x1000, 0, None, None, Path::new("a.obj"), 0)
            .unwrap();
        assert_eq!(buf, 0xffci32.to_le_bytes());

        let mut buf2 = vec![0u8; 4];
        // REL32_1 has one extra trailing byte: subtract 5 instead of 4.
        apply_coff_one(
            &mut buf2,
            0,
            cc::IMAGE_REL_AMD64_REL32_1,
            0x2000,
            0,
            0x1000,
            0,
            None,
            None,
            Path::new("a.obj"),
            0,
        )
        .unwrap();
        assert_eq!(buf2, 0xffbi32.to_le_bytes());
    }

    #[test]
    fn coff_section_writes_one_based_section_index() {
        let mut buf = vec![0u8; 2];
        apply_coff_one(&mut buf, 0, cc::IMAGE_REL_AMD64_SECTION, 0, 0, 0, 0, Some(3), None, Path::new("a.obj"), 0)
            .unwrap();
        assert_eq!(buf, 3u16.to_le_bytes());
    }

    #[test]
    fn coff_secrel_uses_target_offset_in_section() {
        let mut buf = vec![0u8; 4];
        apply_coff_one(&mut buf, 0, cc::IMAGE_REL_AMD64_SECREL, 0, 0, 0, 0, None, Some(0x40), Path::new("a.obj"), 0)
            .unwrap();
        assert_eq!(buf, 0x40u32.to_le_bytes());
    }

    #[test]
    fn coff_unknown_kind_is_unsupported() {
        let mut buf = vec![0u8; 4];
        let err = apply_coff_one(&mut buf, 0, 0xffff, 0, 0, 0, 0, None, None, Path::new("a.obj"), 0).unwrap_err();
        assert!(matches!(err, LinkError::RelocationUnsupported { .. }));
    }
}
