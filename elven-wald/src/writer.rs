//! `OutputWriter`: copies the patched section bytes back
//! into the `ElfWriter`, serializes, and commits the result to disk
//! atomically (write to a temp file in the same directory, then rename).

use std::fs;
use std::io::Write as _;
use std::path::Path;

use crate::{address::ElfLayout, address_coff::CoffLayout, error::LinkError};

pub fn write_elf(layout: ElfLayout, output_path: &Path) -> Result<(), LinkError> {
    let ElfLayout { mut writer, section_content, section_idx_of, .. } = layout;
    // `AddressAssigner` called `add_section` once per entry of
    // `section_content`, in order, right after the null section and
    // `.shstrtab` (indices 0 and 1) -- so the Nth output section's
    // post-relocation bytes live at `section_content[N]` and its
    // `SectionIdx` is `N + 2`. Apply them back before serializing so the
    // file carries `RelocEngine`'s patched bytes rather than the
    // pre-relocation copy `add_section` was given.
    for (i, content) in section_content.into_iter().enumerate() {
        let idx = elven_parser::consts::SectionIdx((i + 2) as u16);
        writer.section_mut(idx).content = content;
    }
    let _ = section_idx_of;

    let bytes = writer.write()?;
    commit(output_path, &bytes)?;
    Ok(())
}

pub fn write_coff(layout: CoffLayout, output_path: &Path) -> Result<(), LinkError> {
    let CoffLayout { mut writer, section_content, .. } = layout;
    // `AddressAssigner` called `add_section` once per entry of
    // `section_content`, in the same order -- the Nth output section's
    // post-relocation/post-import-table-build bytes live at
    // `section_content[N]`. A NOBITS (`.bss`-style) section was added with
    // empty `content` on purpose (its `logical_size` carries the real
    // extent); leave it alone rather than writing synthesized padding
    // bytes to the file.
    for (i, content) in section_content.into_iter().enumerate() {
        if !writer.section_mut(i).content.is_empty() {
            writer.section_mut(i).content = content;
        }
    }

    let bytes = writer.write()?;
    commit(output_path, &bytes)?;
    Ok(())
}

fn commit(output_path: &Path, bytes: &[u8]) -> Result<(), LinkError> {
    let dir = output_path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        output_path.file_name().and_then(|n| n.to_str()).unwrap_or("elven-wald-output")
    ));

    let write_result = (|| -> std::io::Result<()> {
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = f.metadata()?.permissions();
            perms.set_mode(0o755);
            f.set_permissions(perms)?;
        }
        Ok(())
    })();

    write_result.map_err(|source| LinkError::Io { path: tmp_path.clone(), source })?;
    fs::rename(&tmp_path, output_path).map_err(|source| LinkError::Io { path: output_path.to_path_buf(), source })?;
    Ok(())
}
