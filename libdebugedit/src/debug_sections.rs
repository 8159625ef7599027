//! Recognition of the DWARF sections we edit and the per-section state the
//! editor carries: decompressed bytes, the associated relocation section and
//! the lazily built relocation index.

use crate::bail;
use crate::bytes;
use crate::elf::Compression;
use crate::elf::LoadedElf;
use crate::error::warning;
use crate::error::Result;
use crate::reloc::RelocIndex;
use object::Endianness;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DebugSectionKind {
    Info,
    Abbrev,
    Line,
    Aranges,
    Pubnames,
    Pubtypes,
    Macinfo,
    Loc,
    Str,
    Frame,
    Ranges,
    Types,
    Macro,
    GdbScripts,
    Rnglists,
    LineStr,
    Addr,
    StrOffsets,
    Loclists,
}

impl DebugSectionKind {
    pub(crate) fn from_name(name: &[u8]) -> Option<DebugSectionKind> {
        Some(match name {
            b".debug_info" => DebugSectionKind::Info,
            b".debug_abbrev" => DebugSectionKind::Abbrev,
            b".debug_line" => DebugSectionKind::Line,
            b".debug_aranges" => DebugSectionKind::Aranges,
            b".debug_pubnames" => DebugSectionKind::Pubnames,
            b".debug_pubtypes" => DebugSectionKind::Pubtypes,
            b".debug_macinfo" => DebugSectionKind::Macinfo,
            b".debug_loc" => DebugSectionKind::Loc,
            b".debug_str" => DebugSectionKind::Str,
            b".debug_frame" => DebugSectionKind::Frame,
            b".debug_ranges" => DebugSectionKind::Ranges,
            b".debug_types" => DebugSectionKind::Types,
            b".debug_macro" => DebugSectionKind::Macro,
            b".debug_gdb_scripts" => DebugSectionKind::GdbScripts,
            b".debug_rnglists" => DebugSectionKind::Rnglists,
            b".debug_line_str" => DebugSectionKind::LineStr,
            b".debug_addr" => DebugSectionKind::Addr,
            b".debug_str_offsets" => DebugSectionKind::StrOffsets,
            b".debug_loclists" => DebugSectionKind::Loclists,
            _ => return None,
        })
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            DebugSectionKind::Info => ".debug_info",
            DebugSectionKind::Abbrev => ".debug_abbrev",
            DebugSectionKind::Line => ".debug_line",
            DebugSectionKind::Aranges => ".debug_aranges",
            DebugSectionKind::Pubnames => ".debug_pubnames",
            DebugSectionKind::Pubtypes => ".debug_pubtypes",
            DebugSectionKind::Macinfo => ".debug_macinfo",
            DebugSectionKind::Loc => ".debug_loc",
            DebugSectionKind::Str => ".debug_str",
            DebugSectionKind::Frame => ".debug_frame",
            DebugSectionKind::Ranges => ".debug_ranges",
            DebugSectionKind::Types => ".debug_types",
            DebugSectionKind::Macro => ".debug_macro",
            DebugSectionKind::GdbScripts => ".debug_gdb_scripts",
            DebugSectionKind::Rnglists => ".debug_rnglists",
            DebugSectionKind::LineStr => ".debug_line_str",
            DebugSectionKind::Addr => ".debug_addr",
            DebugSectionKind::StrOffsets => ".debug_str_offsets",
            DebugSectionKind::Loclists => ".debug_loclists",
        }
    }

    /// `.debug_macro` and `.debug_types` may legitimately appear more than
    /// once in a relocatable file (COMDAT groups).
    fn allows_duplicates(self) -> bool {
        matches!(self, DebugSectionKind::Macro | DebugSectionKind::Types)
    }
}

pub(crate) struct DebugSection {
    pub(crate) kind: DebugSectionKind,
    pub(crate) shndx: usize,
    pub(crate) endian: Endianness,
    pub(crate) data: Vec<u8>,
    pub(crate) compression: Option<Compression>,
    pub(crate) relsec: Option<usize>,
    pub(crate) relocs: Option<RelocIndex>,
    pub(crate) relocs_built: bool,
    pub(crate) dirty: bool,
}

impl DebugSection {
    /// Reads a possibly-relocated 32-bit word at `offset`.
    pub(crate) fn read_u32_rel(&mut self, offset: usize) -> Result<u32> {
        match &mut self.relocs {
            Some(relocs) => relocs.read_u32(self.endian, &self.data, offset),
            None => bytes::read_u32_at(self.endian, &self.data, offset),
        }
    }

    /// Writes a 32-bit word at the site of the immediately preceding
    /// `read_u32_rel`.
    pub(crate) fn write_u32_rel(&mut self, offset: usize, value: u32) -> Result<()> {
        if offset + 4 > self.data.len() {
            bail!("Write past end of {} section", self.kind.name());
        }
        match &mut self.relocs {
            Some(relocs) => relocs.write_u32(self.endian, &mut self.data, offset, value),
            None => bytes::write_u32_at(self.endian, &mut self.data, offset, value),
        }
        Ok(())
    }
}

/// Finds every recognized `.debug_*` section and materializes its
/// (decompressed) contents, then pairs each with its relocation section.
pub(crate) fn classify(elf: &LoadedElf) -> Result<Vec<DebugSection>> {
    let mut sections: Vec<DebugSection> = Vec::new();

    for (shndx, meta) in elf.sections.iter().enumerate().skip(1) {
        let non_alloc_flags = u64::from(
            object::elf::SHF_ALLOC | object::elf::SHF_WRITE | object::elf::SHF_EXECINSTR,
        );
        if meta.sh_flags & non_alloc_flags != 0 || meta.sh_size == 0 {
            continue;
        }
        if !meta.name.starts_with(b".debug_") {
            continue;
        }
        let Some(kind) = DebugSectionKind::from_name(&meta.name) else {
            warning(&format!(
                "Unknown debugging section {}",
                String::from_utf8_lossy(&meta.name)
            ));
            continue;
        };
        if !kind.allows_duplicates() && sections.iter().any(|sec| sec.kind == kind) {
            bail!("Found two copies of {} section", kind.name());
        }
        sections.push(DebugSection {
            kind,
            shndx,
            endian: elf.endian,
            data: elf.section_payload(shndx)?,
            compression: elf.sections[shndx].compression,
            relsec: None,
            relocs: None,
            relocs_built: false,
            dirty: false,
        });
    }

    if elf.e_type == object::elf::ET_REL {
        for (shndx, meta) in elf.sections.iter().enumerate().skip(1) {
            let target_name = match meta.sh_type {
                object::elf::SHT_REL => meta.name.strip_prefix(b".rel"),
                object::elf::SHT_RELA => meta.name.strip_prefix(b".rela"),
                _ => None,
            };
            let Some(target_name) = target_name else {
                continue;
            };
            if !target_name.starts_with(b".debug_") {
                continue;
            }
            let Some(kind) = DebugSectionKind::from_name(target_name) else {
                continue;
            };
            // COMDAT copies have their own relocation sections; sh_info says
            // which copy this one applies to.
            let target = sections.iter_mut().find(|sec| {
                sec.kind == kind
                    && (!kind.allows_duplicates() || sec.shndx == meta.sh_info as usize)
            });
            match target {
                Some(sec) => sec.relsec = Some(shndx),
                None => {
                    if kind.allows_duplicates() {
                        warning(&format!("No {} section for relocation section", kind.name()));
                    }
                }
            }
        }
    }

    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_all_debug_section_names() {
        for name in [
            ".debug_info",
            ".debug_abbrev",
            ".debug_line",
            ".debug_aranges",
            ".debug_pubnames",
            ".debug_pubtypes",
            ".debug_macinfo",
            ".debug_loc",
            ".debug_str",
            ".debug_frame",
            ".debug_ranges",
            ".debug_types",
            ".debug_macro",
            ".debug_gdb_scripts",
            ".debug_rnglists",
            ".debug_line_str",
            ".debug_addr",
            ".debug_str_offsets",
            ".debug_loclists",
        ] {
            let kind = DebugSectionKind::from_name(name.as_bytes()).unwrap();
            assert_eq!(kind.name(), name);
        }
        assert!(DebugSectionKind::from_name(b".debug_unknown").is_none());
        assert!(DebugSectionKind::from_name(b".text").is_none());
    }

    #[test]
    fn only_comdat_kinds_allow_duplicates() {
        assert!(DebugSectionKind::Macro.allows_duplicates());
        assert!(DebugSectionKind::Types.allows_duplicates());
        assert!(!DebugSectionKind::Info.allows_duplicates());
        assert!(!DebugSectionKind::Str.allows_duplicates());
    }
}
