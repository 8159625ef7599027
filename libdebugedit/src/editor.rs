//! The editing session for one file: owns the materialized debug sections,
//! the string pools, the line-table map and the relocation buffers, and
//! drives the two passes over the DWARF data.
//!
//! A naive in-place rewrite is impossible because string offsets and
//! stmt-list offsets observe each other's effects. The collection pass
//! records everything, a planning step freezes the pools and rebuilds
//! `.debug_line`, and only then does the rewrite pass mutate bytes.

use crate::bail;
use crate::debug_sections;
use crate::debug_sections::DebugSection;
use crate::debug_sections::DebugSectionKind;
use crate::elf;
use crate::elf::LoadedElf;
use crate::error::Context as _;
use crate::error::Result;
use crate::info;
use crate::info::Cu;
use crate::line::LineTables;
use crate::macros;
use crate::reloc;
use crate::reloc::RelocIndex;
use crate::source_list::SourceList;
use crate::str_offsets;
use crate::strings::StringPool;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Collect,
    Rewrite,
}

pub(crate) struct RelocBuffer {
    pub(crate) data: Vec<u8>,
    pub(crate) dirty: bool,
}

/// New contents for the sections an edit changed, keyed by section index.
/// Compressed sections are already recompressed here.
pub(crate) struct EditOutcome {
    pub(crate) replacements: BTreeMap<usize, Vec<u8>>,
}

impl EditOutcome {
    pub(crate) fn changed(&self) -> bool {
        !self.replacements.is_empty()
    }
}

pub(crate) struct Editor<'elf> {
    pub(crate) elf: &'elf LoadedElf,
    pub(crate) base_dir: Option<Vec<u8>>,
    pub(crate) dest_dir: Option<Vec<u8>>,
    pub(crate) sections: Vec<DebugSection>,
    pub(crate) debug_str: StringPool,
    pub(crate) debug_line_str: StringPool,
    pub(crate) lines: LineTables,
    pub(crate) cus: Vec<Cu>,
    pub(crate) cu_cursor: usize,
    pub(crate) reloc_buffers: BTreeMap<usize, RelocBuffer>,
    pub(crate) source_list: SourceList,

    /// Whether any literal `DW_FORM_string` comp_dir needs replacing.
    pub(crate) need_string_replacement: bool,
    /// Whether `.debug_str` offsets change and references need updating.
    pub(crate) need_strp_update: bool,
    /// Likewise for `.debug_line_str`.
    pub(crate) need_line_strp_update: bool,
    /// Whether `.debug_line` changes size and stmt-list references move.
    pub(crate) need_stmt_update: bool,
}

impl<'elf> Editor<'elf> {
    pub(crate) fn new(
        elf: &'elf LoadedElf,
        base_dir: Option<Vec<u8>>,
        dest_dir: Option<Vec<u8>>,
        source_list: SourceList,
    ) -> Result<Editor<'elf>> {
        let sections = debug_sections::classify(elf)?;
        let pool_data = |kind| {
            sections
                .iter()
                .find(|sec: &&DebugSection| sec.kind == kind)
                .map(|sec| sec.data.clone())
                .unwrap_or_default()
        };
        let debug_str = StringPool::new(pool_data(DebugSectionKind::Str));
        let debug_line_str = StringPool::new(pool_data(DebugSectionKind::LineStr));
        Ok(Editor {
            elf,
            base_dir,
            dest_dir,
            sections,
            debug_str,
            debug_line_str,
            lines: LineTables::default(),
            cus: Vec::new(),
            cu_cursor: 0,
            reloc_buffers: BTreeMap::new(),
            source_list,
            need_string_replacement: false,
            need_strp_update: false,
            need_line_strp_update: false,
            need_stmt_update: false,
        })
    }

    pub(crate) fn section_pos(&self, kind: DebugSectionKind) -> Option<usize> {
        self.sections.iter().position(|sec| sec.kind == kind)
    }

    fn positions_of(&self, kind: DebugSectionKind) -> Vec<usize> {
        self.sections
            .iter()
            .enumerate()
            .filter(|(_, sec)| sec.kind == kind)
            .map(|(i, _)| i)
            .collect()
    }

    pub(crate) fn pool(&self, line_strp: bool) -> &StringPool {
        if line_strp {
            &self.debug_line_str
        } else {
            &self.debug_str
        }
    }

    pub(crate) fn pool_mut(&mut self, line_strp: bool) -> &mut StringPool {
        if line_strp {
            &mut self.debug_line_str
        } else {
            &mut self.debug_str
        }
    }

    pub(crate) fn set_strp_update(&mut self, line_strp: bool) {
        if line_strp {
            self.need_line_strp_update = true;
        } else {
            self.need_strp_update = true;
        }
    }

    fn any_updates_needed(&self) -> bool {
        self.need_strp_update
            || self.need_line_strp_update
            || self.need_string_replacement
            || self.need_stmt_update
    }

    /// Looks up the unit that owns the `.debug_macro` contribution at
    /// `offset`; falls back to the first unit.
    pub(crate) fn find_macro_cu(&self, offset: u32) -> Result<Cu> {
        match self.cus.iter().find(|cu| cu.macros_offs == Some(offset)) {
            Some(cu) => Ok(cu.clone()),
            None => self
                .cus
                .first()
                .cloned()
                .context("No compilation units for .debug_macro"),
        }
    }

    /// Section indices whose symbols a debug relocation may legitimately
    /// reference: the string pools and the offset-bearing sections.
    fn allowed_reloc_targets(&self) -> Vec<usize> {
        self.sections
            .iter()
            .filter(|sec| {
                matches!(
                    sec.kind,
                    DebugSectionKind::Str
                        | DebugSectionKind::StrOffsets
                        | DebugSectionKind::Line
                        | DebugSectionKind::LineStr
                        | DebugSectionKind::Macro
                        | DebugSectionKind::Abbrev
                )
            })
            .map(|sec| sec.shndx)
            .collect()
    }

    /// Builds the relocation index for a section the first time it's needed.
    /// The relocation section's bytes are copied so addend and offset updates
    /// have somewhere to land.
    pub(crate) fn ensure_relocs(&mut self, pos: usize) -> Result<()> {
        if self.sections[pos].relocs_built {
            return Ok(());
        }
        self.sections[pos].relocs_built = true;
        let Some(relsec) = self.sections[pos].relsec else {
            return Ok(());
        };
        if !self.reloc_buffers.contains_key(&relsec) {
            let data = self.elf.section_data(relsec)?.to_vec();
            self.reloc_buffers
                .insert(relsec, RelocBuffer { data, dirty: false });
        }
        let allowed = self.allowed_reloc_targets();
        let shndx = self.sections[pos].shndx;
        let meta = &self.elf.sections[shndx];
        let index = RelocIndex::build(
            self.elf,
            relsec,
            &self.reloc_buffers[&relsec].data,
            meta.sh_addr,
            &meta.name,
            &allowed,
        )?;
        self.sections[pos].relocs = index;
        Ok(())
    }

    /// Runs the whole edit: both passes, the line-section rebuild between
    /// them, and the final `.debug_str_offsets` and relocation fixups.
    pub(crate) fn edit(&mut self) -> Result<()> {
        let Some(info_pos) = self.section_pos(DebugSectionKind::Info) else {
            return Ok(());
        };

        for phase in [Phase::Collect, Phase::Rewrite] {
            if phase == Phase::Rewrite && !self.any_updates_needed() {
                break;
            }
            tracing::debug!(?phase, "walking debug info");
            self.cu_cursor = 0;

            info::edit_info(self, phase, info_pos)?;
            for types_pos in self.positions_of(DebugSectionKind::Types) {
                info::edit_info(self, phase, types_pos)?;
            }

            // The new .debug_line must exist before the rewrite pass so all
            // new stmt-list offsets are known. This is separate from the
            // dir/file scan because stmt lists might arrive out of order or
            // skip padding that has to go.
            if phase == Phase::Collect && self.need_stmt_update {
                self.rebuild_line_section()?;
            }

            // .debug_macro units reference both .debug_str and .debug_line.
            if self.need_strp_update || self.need_stmt_update {
                for macro_pos in self.positions_of(DebugSectionKind::Macro) {
                    macros::edit_macros(self, phase, macro_pos)?;
                }
            }

            // DWARF 5 line tables carry strp/line_strp path entries that need
            // recording and rewriting.
            if let Some(line_pos) = self.section_pos(DebugSectionKind::Line) {
                self.ensure_relocs(line_pos)?;
                for idx in 0..self.lines.tables.len() {
                    if self.lines.tables[idx].version >= 5 {
                        info::walk_v5_line_unit(self, idx, phase)?;
                    }
                }
            }

            if phase == Phase::Collect && self.need_strp_update {
                // Unused strings referenced from .debug_str_offsets need a
                // replacement entry; we can't know yet whether any exist, so
                // install the sentinel whenever the section is present.
                if self.section_pos(DebugSectionKind::StrOffsets).is_some() {
                    self.debug_str.add_sentinel();
                }
                let buf = self.debug_str.finalize();
                let pos = self
                    .section_pos(DebugSectionKind::Str)
                    .context(".debug_str not present")?;
                self.sections[pos].data = buf;
                self.sections[pos].dirty = true;
            }
            if phase == Phase::Collect && self.need_line_strp_update {
                let buf = self.debug_line_str.finalize();
                let pos = self
                    .section_pos(DebugSectionKind::LineStr)
                    .context(".debug_line_str not present")?;
                self.sections[pos].data = buf;
                self.sections[pos].dirty = true;
            }
        }

        // Mark everything the rewrite pass touched.
        if self.any_updates_needed() {
            self.mark_dirty(DebugSectionKind::Info);
            self.mark_dirty(DebugSectionKind::Types);
        }
        if self.need_strp_update || self.need_stmt_update {
            self.mark_dirty(DebugSectionKind::Macro);
        }
        if self.need_stmt_update || self.need_line_strp_update {
            self.mark_dirty(DebugSectionKind::Line);
        }

        if self.need_strp_update {
            if let Some(so_pos) = self.section_pos(DebugSectionKind::StrOffsets) {
                str_offsets::update_str_offsets(self, so_pos)?;
                self.sections[so_pos].dirty = true;
                self.commit_relocs(so_pos);
            }
        }

        self.commit_relocs(info_pos);
        for pos in self.positions_of(DebugSectionKind::Types) {
            self.commit_relocs(pos);
        }
        for pos in self.positions_of(DebugSectionKind::Macro) {
            self.commit_relocs(pos);
        }
        if let Some(pos) = self.section_pos(DebugSectionKind::Line) {
            self.commit_relocs(pos);
        }

        self.source_list.flush()?;
        Ok(())
    }

    fn mark_dirty(&mut self, kind: DebugSectionKind) {
        for sec in &mut self.sections {
            if sec.kind == kind {
                sec.dirty = true;
            }
        }
    }

    fn rebuild_line_section(&mut self) -> Result<()> {
        let line_pos = self
            .section_pos(DebugSectionKind::Line)
            .context("No .debug_line section")?;
        let base = self.base_dir.clone().context("No base directory")?;
        let dest = self.dest_dir.clone().context("No destination directory")?;
        let endian = self.sections[line_pos].endian;

        tracing::debug!(
            new_len = self.lines.total_new_len,
            "rebuilding .debug_line"
        );
        let old = std::mem::take(&mut self.sections[line_pos].data);
        let new = self.lines.rebuild(endian, &old, &base, &dest)?;
        self.sections[line_pos].data = new;
        self.sections[line_pos].dirty = true;

        // The line table programs moved forwards/backwards a bit in the new
        // data; relocations pointing into them must follow.
        if let Some(relsec) = self.sections[line_pos].relsec {
            self.repoint_line_relocs(relsec)?;
        }
        Ok(())
    }

    fn repoint_line_relocs(&mut self, relsec: usize) -> Result<()> {
        if !self.reloc_buffers.contains_key(&relsec) {
            let data = self.elf.section_data(relsec)?.to_vec();
            self.reloc_buffers
                .insert(relsec, RelocBuffer { data, dirty: false });
        }

        let Editor {
            elf,
            lines,
            reloc_buffers,
            ..
        } = self;
        let meta = &elf.sections[relsec];
        let entsize = usize::try_from(meta.sh_entsize)?;
        if entsize == 0 {
            bail!("Relocation section {relsec} has zero sh_entsize");
        }
        let buffer = reloc_buffers.get_mut(&relsec).unwrap();
        let count = buffer.data.len() / entsize;

        let mut order = Vec::with_capacity(count);
        for ndx in 0..count {
            let raw = reloc::read_raw_reloc(
                elf.class,
                elf.endian,
                meta.sh_type,
                &buffer.data,
                ndx,
                entsize,
            )?;
            order.push((raw.r_offset, ndx));
        }
        order.sort_unstable();

        // The tables are sorted by old offset; walk both lists in step.
        let tables = &lines.tables;
        let mut lndx = 0;
        for (r_offset, ndx) in order {
            while lndx < tables.len()
                && r_offset
                    > u64::from(tables[lndx].old_offset) + 4 + u64::from(tables[lndx].unit_length)
            {
                lndx += 1;
            }
            if lndx >= tables.len() {
                bail!(".debug_line relocation offset out of range");
            }
            let table = &tables[lndx];
            let new_offset = (r_offset as i64
                + (i64::from(table.new_offset) - i64::from(table.old_offset))
                + table.size_diff) as u64;
            reloc::write_r_offset(
                elf.class,
                elf.endian,
                &mut buffer.data,
                ndx,
                entsize,
                new_offset,
            );
        }
        buffer.dirty = true;
        Ok(())
    }

    fn commit_relocs(&mut self, pos: usize) {
        let Editor {
            elf,
            sections,
            reloc_buffers,
            ..
        } = self;
        let Some(relocs) = &sections[pos].relocs else {
            return;
        };
        if !relocs.dirty {
            return;
        }
        let relsec = relocs.relsec;
        let entsize = elf.sections[relsec].sh_entsize as usize;
        let buffer = reloc_buffers
            .get_mut(&relsec)
            .expect("relocation buffer materialized when the index was built");
        relocs.commit(elf.class, elf.endian, entsize, &mut buffer.data);
        buffer.dirty = true;
    }

    /// Consumes the session, recompressing what was compressed, and returns
    /// the new bytes per section.
    pub(crate) fn finish(self) -> Result<EditOutcome> {
        let mut replacements = BTreeMap::new();
        let class = self.elf.class;
        let endian = self.elf.endian;
        for sec in self.sections {
            if !sec.dirty {
                continue;
            }
            let bytes = match sec.compression {
                Some(compression) => elf::recompress(class, endian, compression, &sec.data)?,
                None => sec.data,
            };
            replacements.insert(sec.shndx, bytes);
        }
        for (shndx, buffer) in self.reloc_buffers {
            if buffer.dirty {
                replacements.insert(shndx, buffer.data);
            }
        }
        Ok(EditOutcome { replacements })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes;
    use crate::elf_writer;
    use object::Endianness;

    const E: Endianness = Endianness::Little;

    struct TestSection {
        name: &'static str,
        sh_type: u32,
        sh_flags: u64,
        data: Vec<u8>,
    }

    /// Assembles a minimal ET_REL ELF64 little-endian image: header, section
    /// data, .shstrtab, then the section header table.
    fn build_elf(sections: Vec<TestSection>) -> Vec<u8> {
        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for sec in &sections {
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(sec.name.as_bytes());
            shstrtab.push(0);
        }
        let shstrtab_name_offset = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab\0");

        let shnum = sections.len() + 2; // null + sections + shstrtab
        let mut out = vec![0u8; 64];
        out[..4].copy_from_slice(&object::elf::ELFMAG);
        out[4] = object::elf::ELFCLASS64;
        out[5] = object::elf::ELFDATA2LSB;
        out[6] = 1; // EV_CURRENT
        bytes::write_u16_at(E, &mut out, 16, object::elf::ET_REL);
        bytes::write_u16_at(E, &mut out, 18, object::elf::EM_X86_64);
        bytes::write_u32_at(E, &mut out, 20, 1);
        bytes::write_u16_at(E, &mut out, 52, 64); // e_ehsize
        bytes::write_u16_at(E, &mut out, 58, 64); // e_shentsize
        bytes::write_u16_at(E, &mut out, 60, shnum as u16);
        bytes::write_u16_at(E, &mut out, 62, (shnum - 1) as u16); // e_shstrndx

        let mut offsets = Vec::new();
        for sec in &sections {
            while out.len() % 8 != 0 {
                out.push(0);
            }
            offsets.push(out.len() as u64);
            out.extend_from_slice(&sec.data);
        }
        while out.len() % 8 != 0 {
            out.push(0);
        }
        let shstrtab_offset = out.len() as u64;
        out.extend_from_slice(&shstrtab);
        while out.len() % 8 != 0 {
            out.push(0);
        }

        let shoff = out.len() as u64;
        bytes::write_u64_at(E, &mut out, 40, shoff);

        let mut push_shdr =
            |out: &mut Vec<u8>, name: u32, sh_type: u32, flags: u64, offset: u64, size: u64| {
                let base = out.len();
                out.resize(base + 64, 0);
                bytes::write_u32_at(E, out, base, name);
                bytes::write_u32_at(E, out, base + 4, sh_type);
                bytes::write_u64_at(E, out, base + 8, flags);
                bytes::write_u64_at(E, out, base + 24, offset);
                bytes::write_u64_at(E, out, base + 32, size);
                bytes::write_u64_at(E, out, base + 48, 1); // sh_addralign
            };

        push_shdr(&mut out, 0, object::elf::SHT_NULL, 0, 0, 0);
        for (i, sec) in sections.iter().enumerate() {
            push_shdr(
                &mut out,
                name_offsets[i],
                sec.sh_type,
                sec.sh_flags,
                offsets[i],
                sec.data.len() as u64,
            );
        }
        push_shdr(
            &mut out,
            shstrtab_name_offset,
            object::elf::SHT_STRTAB,
            0,
            shstrtab_offset,
            shstrtab.len() as u64,
        );
        out
    }

    /// One DWARF 4 compilation unit whose root DIE has DW_AT_name and
    /// DW_AT_comp_dir as .debug_str references.
    fn build_debug_sections() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        use gimli::constants;

        let mut debug_str = vec![0u8];
        let name_off = debug_str.len() as u32;
        debug_str.extend_from_slice(b"foo.c\0");
        let comp_dir_off = debug_str.len() as u32;
        debug_str.extend_from_slice(b"/tmp/build\0");

        let mut abbrev = Vec::new();
        bytes::write_uleb128(&mut abbrev, 1);
        bytes::write_uleb128(&mut abbrev, constants::DW_TAG_compile_unit.0.into());
        abbrev.push(0); // no children
        bytes::write_uleb128(&mut abbrev, constants::DW_AT_name.0.into());
        bytes::write_uleb128(&mut abbrev, constants::DW_FORM_strp.0.into());
        bytes::write_uleb128(&mut abbrev, constants::DW_AT_comp_dir.0.into());
        bytes::write_uleb128(&mut abbrev, constants::DW_FORM_strp.0.into());
        bytes::write_uleb128(&mut abbrev, 0);
        bytes::write_uleb128(&mut abbrev, 0);
        bytes::write_uleb128(&mut abbrev, 0);

        let mut die = Vec::new();
        bytes::write_uleb128(&mut die, 1);
        bytes::push_u32(E, &mut die, name_off);
        bytes::push_u32(E, &mut die, comp_dir_off);

        let mut info = Vec::new();
        let unit_length = (2 + 4 + 1 + die.len()) as u32;
        bytes::push_u32(E, &mut info, unit_length);
        bytes::push_u16(E, &mut info, 4); // version
        bytes::push_u32(E, &mut info, 0); // abbrev offset
        info.push(8); // pointer size
        info.extend_from_slice(&die);

        (info, abbrev, debug_str)
    }

    fn test_elf() -> Vec<u8> {
        let (info, abbrev, debug_str) = build_debug_sections();
        build_elf(vec![
            TestSection {
                name: ".text",
                sh_type: object::elf::SHT_PROGBITS,
                sh_flags: (object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR).into(),
                data: vec![0xc3],
            },
            TestSection {
                name: ".debug_info",
                sh_type: object::elf::SHT_PROGBITS,
                sh_flags: 0,
                data: info,
            },
            TestSection {
                name: ".debug_abbrev",
                sh_type: object::elf::SHT_PROGBITS,
                sh_flags: 0,
                data: abbrev,
            },
            TestSection {
                name: ".debug_str",
                sh_type: object::elf::SHT_PROGBITS,
                sh_flags: 0,
                data: debug_str,
            },
        ])
    }

    fn edit(
        elf: &LoadedElf,
        base: &str,
        dest: &str,
    ) -> (BTreeMap<usize, Vec<u8>>, Vec<usize>) {
        let mut editor = Editor::new(
            elf,
            Some(base.as_bytes().to_vec()),
            Some(dest.as_bytes().to_vec()),
            SourceList::disabled(),
        )
        .unwrap();
        editor.edit().unwrap();
        let info_pos = editor.section_pos(DebugSectionKind::Info).unwrap();
        let str_pos = editor.section_pos(DebugSectionKind::Str).unwrap();
        let shndx = vec![
            editor.sections[info_pos].shndx,
            editor.sections[str_pos].shndx,
        ];
        (editor.finish().unwrap().replacements, shndx)
    }

    #[test]
    fn rewrites_comp_dir_prefix_in_debug_str() {
        let elf = LoadedElf::parse(test_elf()).unwrap();
        let (replacements, shndx) = edit(&elf, "/tmp/build", "/usr/src/debug/pkg");
        let info_shndx = shndx[0];
        let str_shndx = shndx[1];

        // The new pool holds the strings in first-seen order: the unit name,
        // then the rewritten comp_dir.
        let new_str = &replacements[&str_shndx];
        assert_eq!(new_str.as_slice(), b"foo.c\0/usr/src/debug/pkg\0");

        // The DIE's references moved to the new offsets.
        let new_info = &replacements[&info_shndx];
        let die_start = 4 + 2 + 4 + 1 + 1;
        assert_eq!(bytes::read_u32_at(E, new_info, die_start).unwrap(), 0);
        assert_eq!(bytes::read_u32_at(E, new_info, die_start + 4).unwrap(), 6);
    }

    #[test]
    fn untouched_prefix_changes_nothing() {
        let elf = LoadedElf::parse(test_elf()).unwrap();
        let (replacements, _) = edit(&elf, "/somewhere/else", "/usr/src/debug/pkg");
        assert!(replacements.is_empty());
    }

    #[test]
    fn written_file_reparses_with_new_contents() {
        let elf = LoadedElf::parse(test_elf()).unwrap();
        let (replacements, shndx) = edit(&elf, "/tmp/build", "/usr/src/debug");
        let str_shndx = shndx[1];

        let image = elf_writer::write_file(&elf, &replacements).unwrap();
        let rewritten = LoadedElf::parse(image.data).unwrap();
        assert_eq!(rewritten.sections.len(), elf.sections.len());
        assert_eq!(
            rewritten.section_data(str_shndx).unwrap(),
            b"foo.c\0/usr/src/debug\0"
        );
        // Allocated sections keep their bytes.
        assert_eq!(rewritten.section_data(1).unwrap(), elf.section_data(1).unwrap());
    }

    #[test]
    fn editing_twice_is_idempotent() {
        let elf = LoadedElf::parse(test_elf()).unwrap();
        let (replacements, _) = edit(&elf, "/tmp/build", "/usr/src/debug");
        let image = elf_writer::write_file(&elf, &replacements).unwrap();

        let first = image.data.clone();
        let rewritten = LoadedElf::parse(image.data).unwrap();
        let (replacements, _) = edit(&rewritten, "/tmp/build", "/usr/src/debug");
        // Nothing is under /tmp/build any more.
        assert!(replacements.is_empty());

        // So a second run leaves the bytes exactly as the first produced
        // them.
        let rewritten = LoadedElf::parse(first.clone()).unwrap();
        assert_eq!(rewritten.data, first);
    }
}
