//! `AddressAssigner` for the PE/COFF container. Simpler than the ELF one:
//! a PE section's RVA is independently settable (no page-congruence
//! constraint tying file offset to virtual address), so this just walks
//! `LayoutEngine`'s output sections once, handing each the next free,
//! section-alignment-rounded RVA. `elven_coff::write::PeWriter` derives
//! file offsets from RVA order when it serializes.

use std::collections::HashMap;

use bstr::BString;

use elven_coff::{
    consts::{self as c, DllCharacteristics, Machine, Subsystem as PeSubsystem},
    write::{self, Header, PeWriter, Section},
};

use crate::{
    atom::{Atom, AtomId, FileId},
    context::{LinkContext, OutputKind, Subsystem},
    layout::OutputSection,
    resolver::Resolver,
};

pub struct Placement {
    /// Absolute virtual address (`image_base + rva`).
    pub addr: u64,
    /// Index into `CoffLayout::section_content`.
    pub section_idx: usize,
    pub offset_in_section: u64,
}

pub struct CoffLayout {
    pub writer: PeWriter,
    pub section_content: Vec<Vec<u8>>,
    pub section_rva_of: HashMap<BString, u32>,
    pub placements: HashMap<AtomId, Placement>,
    pub image_base: u64,
    /// RVA just past the last section `AddressAssigner` placed, already
    /// rounded to `section_alignment`. `import::inject`'s sections land
    /// here automatically since they're folded into `sections` before
    /// this runs; kept for symmetry with `ElfLayout::end_vaddr` and any
    /// future table builder that needs to append past everything else.
    pub end_rva: u32,
}

fn align_up_u32(n: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

/// Builds the PE optional header's `DllCharacteristics` bitfield from the
/// driver-provided DLL characteristics group. `allow_bind`/`allow_isolation`
/// invert (the PE bit means "no", the driver option means "yes").
fn dll_characteristics_for(ctx: &LinkContext) -> u16 {
    let mut bits = 0u16;
    if ctx.dynamic_base {
        bits |= c::IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE;
    }
    if ctx.nx_compat {
        bits |= c::IMAGE_DLLCHARACTERISTICS_NX_COMPAT;
    }
    if ctx.terminal_server_aware {
        bits |= c::IMAGE_DLLCHARACTERISTICS_TERMINAL_SERVER_AWARE;
    }
    if ctx.large_address_aware {
        bits |= c::IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA;
    }
    if !ctx.allow_bind {
        bits |= c::IMAGE_DLLCHARACTERISTICS_NO_BIND;
    }
    if !ctx.allow_isolation {
        bits |= c::IMAGE_DLLCHARACTERISTICS_NO_ISOLATION;
    }
    bits
}

/// Assigns RVAs to `sections` (already grouped/ordered by `LayoutEngine`,
/// including any `import::inject`-synthesized `.idata$N` atoms) and
/// builds the atom-level address map `RelocEngine` needs.
pub fn assign_coff_addresses(resolver: &Resolver, sections: &[OutputSection], ctx: &LinkContext) -> CoffLayout {
    let image_base = ctx.default_image_base().u64();
    let section_align = c::DEFAULT_SECTION_ALIGNMENT;

    let headers_size = write::headers_size_for(sections.len());
    let mut rva_cursor = align_up_u32(headers_size, section_align);

    let is_dll = ctx.output_kind == OutputKind::SharedLibrary;
    let subsystem = match ctx.subsystem {
        Subsystem::WindowsGui => PeSubsystem(c::IMAGE_SUBSYSTEM_WINDOWS_GUI),
        Subsystem::WindowsCui => PeSubsystem(c::IMAGE_SUBSYSTEM_WINDOWS_CUI),
    };
    let dll_characteristics = dll_characteristics_for(ctx);

    let mut writer = PeWriter::new(Header {
        machine: Machine(c::IMAGE_FILE_MACHINE_AMD64),
        subsystem,
        dll_characteristics: DllCharacteristics(dll_characteristics),
        image_base,
        is_dll,
        relocations_stripped: !ctx.base_relocations,
        stack_reserve: ctx.stack_reserve,
        stack_commit: ctx.stack_commit,
        heap_reserve: ctx.heap_reserve,
        heap_commit: ctx.heap_commit,
    });

    let mut placements: HashMap<AtomId, Placement> = HashMap::new();
    let mut section_content: Vec<Vec<u8>> = Vec::with_capacity(sections.len());
    let mut section_rva_of: HashMap<BString, u32> = HashMap::new();

    for section in sections {
        let flat_idx = section_content.len();
        let sec_rva = rva_cursor;

        let mut content = Vec::new();
        let mut logical_size = 0u64;
        for &atom_id in &section.atoms {
            let Some(Atom::Defined(d)) = atom_at(resolver, atom_id) else { continue };
            let atom_align = 1u64 << d.align_pow2;
            let pad = content.len() as u64 % atom_align.max(1);
            let pad = if pad == 0 { 0 } else { atom_align - pad };
            for _ in 0..pad {
                content.push(0);
            }
            logical_size += pad;
            let atom_offset = logical_size;
            placements.insert(
                atom_id,
                Placement {
                    addr: image_base + sec_rva as u64 + atom_offset,
                    section_idx: flat_idx,
                    offset_in_section: atom_offset,
                },
            );
            if !section.is_nobits {
                content.extend_from_slice(&d.content);
            }
            logical_size += d.size;
        }

        let mut characteristics = 0u32;
        if section.permissions.read {
            characteristics |= c::IMAGE_SCN_MEM_READ;
        }
        if section.permissions.write {
            characteristics |= c::IMAGE_SCN_MEM_WRITE;
        }
        if section.permissions.execute {
            characteristics |= c::IMAGE_SCN_MEM_EXECUTE;
        }
        characteristics |= if section.is_nobits {
            c::IMAGE_SCN_CNT_UNINITIALIZED_DATA
        } else if section.permissions.execute {
            c::IMAGE_SCN_CNT_CODE
        } else {
            c::IMAGE_SCN_CNT_INITIALIZED_DATA
        };

        writer
            .add_section(Section {
                name: truncated_name(&section.name),
                characteristics: c::SectionFlags(characteristics),
                rva: sec_rva,
                content: if section.is_nobits { Vec::new() } else { content.clone() },
                logical_size: section.is_nobits.then_some(logical_size as u32),
            })
            .expect("section count fits u32");
        section_rva_of.insert(section.name.clone(), sec_rva);
        section_content.push(content);

        rva_cursor = align_up_u32(sec_rva + (logical_size.max(1) as u32), section_align);
    }

    let entry_addr = resolver.entry_atom().and_then(|id| placements.get(&id)).map(|p| p.addr).unwrap_or(image_base);
    writer.set_entry_rva((entry_addr - image_base) as u32);

    CoffLayout {
        writer,
        section_content,
        section_rva_of,
        placements,
        image_base,
        end_rva: rva_cursor,
    }
}

fn truncated_name(name: &BString) -> [u8; 8] {
    let mut out = [0u8; 8];
    let bytes = name.as_slice();
    let n = bytes.len().min(8);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn atom_at<'a>(resolver: &'a Resolver, id: AtomId) -> Option<&'a Atom> {
    if id.file == FileId::SYNTHETIC {
        resolver.synthetic.atoms.get(id.idx.0 as usize)
    } else {
        resolver.files.get(id.file.0 as usize)?.atoms().get(id.idx.0 as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_matches_section_alignment() {
        assert_eq!(align_up_u32(0x10, 0x1000), 0x1000);
        assert_eq!(align_up_u32(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up_u32(0x1001, 0x1000), 0x2000);
    }

    #[test]
    fn truncated_name_pads_short_names_with_nul() {
        let name = BString::from(".text".as_bytes().to_vec());
        assert_eq!(truncated_name(&name), *b".text\0\0\0");
    }

    fn fake_ctx() -> LinkContext {
        LinkContext {
            container: crate::context::ContainerFamily::Coff,
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
            gc_sections: false,
            build_id: false,
            version_script: None,
            dynamic_list: None,
            version_script_global: Vec::new(),
            version_script_local: Vec::new(),
            dynamic_list_patterns: Vec::new(),
        }
    }

    #[test]
    fn dll_characteristics_defaults_set_dynamic_base_nx_and_tsaware_only() {
        let ctx = fake_ctx();
        let bits = dll_characteristics_for(&ctx);
        assert_ne!(bits & c::IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE, 0);
        assert_ne!(bits & c::IMAGE_DLLCHARACTERISTICS_NX_COMPAT, 0);
        assert_ne!(bits & c::IMAGE_DLLCHARACTERISTICS_TERMINAL_SERVER_AWARE, 0);
        assert_eq!(bits & c::IMAGE_DLLCHARACTERISTICS_NO_BIND, 0);
        assert_eq!(bits & c::IMAGE_DLLCHARACTERISTICS_NO_ISOLATION, 0);
    }

    #[test]
    fn no_bind_and_no_isolation_set_their_inverse_bits() {
        let mut ctx = fake_ctx();
        ctx.allow_bind = false;
        ctx.allow_isolation = false;
        let bits = dll_characteristics_for(&ctx);
        assert_ne!(bits & c::IMAGE_DLLCHARACTERISTICS_NO_BIND, 0);
        assert_ne!(bits & c::IMAGE_DLLCHARACTERISTICS_NO_ISOLATION, 0);
    }
}
