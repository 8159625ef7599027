//! The two-pass walk over `.debug_info` and COMDAT `.debug_types`.
//!
//! The collection pass interns every referenced string, registers every line
//! table and emits the sources list. Between the passes the string pools are
//! frozen and `.debug_line` is rebuilt, so the rewrite pass can overwrite
//! every 32-bit string and stmt-list reference with its new value. DIEs are
//! visited in tree order, units in section byte order; that order is what
//! makes the output deterministic.

use crate::abbrev;
use crate::abbrev::AbbrevTag;
use crate::bail;
use crate::bytes;
use crate::debug_sections::DebugSectionKind;
use crate::editor::Editor;
use crate::editor::Phase;
use crate::error::warning;
use crate::error::Context as _;
use crate::error::Result;
use crate::line;
use crate::line::Registered;
use crate::paths;
use gimli::constants;
use gimli::constants::DwForm;

/// Per-compilation-unit context collected from the unit header and its root
/// DIE.
#[derive(Debug, Clone)]
pub(crate) struct Cu {
    pub(crate) version: u16,
    pub(crate) ptr_size: u8,
    /// Origin in `.debug_str_offsets` for `DW_FORM_strx*` in this unit. The
    /// first index slot sits just past the unit header when the attribute is
    /// absent.
    pub(crate) str_offsets_base: u32,
    /// Offset of this unit's `.debug_macro` contribution (`DW_AT_macros`).
    pub(crate) macros_offs: Option<u32>,
}

pub(crate) enum SkipOutcome {
    Consumed,
    /// `DW_FORM_indirect`: the real form was read and stored back into the
    /// caller's form, which must be re-dispatched.
    Indirect,
}

pub(crate) fn is_str_form(form: DwForm) -> bool {
    matches!(
        form,
        constants::DW_FORM_strp
            | constants::DW_FORM_line_strp
            | constants::DW_FORM_strx
            | constants::DW_FORM_strx1
            | constants::DW_FORM_strx2
            | constants::DW_FORM_strx3
            | constants::DW_FORM_strx4
    )
}

/// Advances `pos` past an attribute value of the given form.
pub(crate) fn skip_form(
    endian: object::Endianness,
    data: &[u8],
    pos: &mut usize,
    form: &mut DwForm,
    cu: &Cu,
) -> Result<SkipOutcome> {
    let mut block_len = None;
    match *form {
        constants::DW_FORM_ref_addr => {
            *pos += if cu.version == 2 {
                usize::from(cu.ptr_size)
            } else {
                4
            };
        }
        constants::DW_FORM_flag_present | constants::DW_FORM_implicit_const => {}
        constants::DW_FORM_addr => *pos += usize::from(cu.ptr_size),
        constants::DW_FORM_ref1
        | constants::DW_FORM_flag
        | constants::DW_FORM_data1
        | constants::DW_FORM_strx1
        | constants::DW_FORM_addrx1 => *pos += 1,
        constants::DW_FORM_ref2
        | constants::DW_FORM_data2
        | constants::DW_FORM_strx2
        | constants::DW_FORM_addrx2 => *pos += 2,
        constants::DW_FORM_strx3 | constants::DW_FORM_addrx3 => *pos += 3,
        constants::DW_FORM_ref4
        | constants::DW_FORM_data4
        | constants::DW_FORM_strx4
        | constants::DW_FORM_addrx4
        | constants::DW_FORM_sec_offset => *pos += 4,
        constants::DW_FORM_ref8 | constants::DW_FORM_data8 | constants::DW_FORM_ref_sig8 => {
            *pos += 8;
        }
        constants::DW_FORM_data16 => *pos += 16,
        constants::DW_FORM_sdata
        | constants::DW_FORM_ref_udata
        | constants::DW_FORM_udata
        | constants::DW_FORM_strx
        | constants::DW_FORM_loclistx
        | constants::DW_FORM_rnglistx
        | constants::DW_FORM_addrx => {
            bytes::read_uleb128(data, pos)?;
        }
        constants::DW_FORM_strp | constants::DW_FORM_line_strp => *pos += 4,
        constants::DW_FORM_string => {
            let s = bytes::read_cstr(data, *pos)?;
            *pos += s.len() + 1;
        }
        constants::DW_FORM_indirect => {
            let real = bytes::read_uleb128(data, pos)?;
            if real > u64::from(u16::MAX) {
                bail!("Unknown DWARF DW_FORM_0x{real:x}");
            }
            *form = DwForm(real as u16);
            return Ok(SkipOutcome::Indirect);
        }
        constants::DW_FORM_block1 => {
            block_len = Some(usize::from(bytes::read_u8(data, pos)?));
        }
        constants::DW_FORM_block2 => {
            block_len = Some(usize::from(bytes::read_u16(endian, data, pos)?));
        }
        constants::DW_FORM_block4 => {
            block_len = Some(bytes::read_u32(endian, data, pos)? as usize);
        }
        constants::DW_FORM_block | constants::DW_FORM_exprloc => {
            block_len = Some(usize::try_from(bytes::read_uleb128(data, pos)?)?);
        }
        other => bail!("Unknown DWARF DW_FORM_0x{:x}", other.0),
    }
    if let Some(len) = block_len {
        *pos += len;
    }
    if *pos > data.len() {
        bail!("DIE attribute extends past end of section");
    }
    Ok(SkipOutcome::Consumed)
}

/// Resolves a string attribute to its `.debug_str` / `.debug_line_str`
/// offset. Direct forms read the (possibly relocated) offset in place;
/// indexed forms go through the unit's `.debug_str_offsets` slots.
pub(crate) fn read_str_form(
    ed: &mut Editor,
    sec_pos: usize,
    cu: &Cu,
    form: DwForm,
    pos: usize,
) -> Result<u32> {
    if form == constants::DW_FORM_strp || form == constants::DW_FORM_line_strp {
        return ed.sections[sec_pos].read_u32_rel(pos);
    }

    let endian = ed.sections[sec_pos].endian;
    let data = &ed.sections[sec_pos].data;
    let index = match form {
        constants::DW_FORM_strx1 => {
            u32::from(*data.get(pos).context("Section data truncated")?)
        }
        constants::DW_FORM_strx2 => u32::from(bytes::read_u16_at(endian, data, pos)?),
        constants::DW_FORM_strx3 => {
            let mut p = pos;
            bytes::read_u24(endian, data, &mut p)?
        }
        constants::DW_FORM_strx4 => bytes::read_u32_at(endian, data, pos)?,
        constants::DW_FORM_strx => {
            let mut p = pos;
            u32::try_from(bytes::read_uleb128(data, &mut p)?)?
        }
        other => bail!("Unhandled string form DW_FORM_0x{:x}", other.0),
    };

    let str_offsets_pos = ed
        .section_pos(DebugSectionKind::StrOffsets)
        .context("Indexed string without a .debug_str_offsets section")?;
    ed.ensure_relocs(str_offsets_pos)?;
    let slot = cu.str_offsets_base as usize + index as usize * 4;
    if slot + 4 > ed.sections[str_offsets_pos].data.len() {
        bail!("String index {index} outside .debug_str_offsets");
    }
    ed.sections[str_offsets_pos].read_u32_rel(slot)
}

/// Records (collection pass) or rewrites (rewrite pass) a string reference.
/// `DW_FORM_strx*` references stay as-is in the rewrite pass; their
/// indirection slots are rewritten with the `.debug_str_offsets` section.
pub(crate) fn edit_strp(
    ed: &mut Editor,
    sec_pos: usize,
    cu: &Cu,
    form: DwForm,
    pos: usize,
    phase: Phase,
    handled_strp: bool,
) -> Result<()> {
    let line_strp = form == constants::DW_FORM_line_strp;
    if phase == Phase::Collect {
        // Attributes referring to files set handled_strp; those strings are
        // already recorded.
        if !handled_strp {
            let offset = read_str_form(ed, sec_pos, cu, form, pos)?;
            let name = pool_name(line_strp);
            ed.pool_mut(line_strp).intern_existing(offset, name)?;
        }
    } else if (form == constants::DW_FORM_strp || line_strp)
        && if line_strp {
            ed.need_line_strp_update
        } else {
            ed.need_strp_update
        }
    {
        let offset = ed.sections[sec_pos].read_u32_rel(pos)?;
        let new_offset = ed.pool(line_strp).lookup(offset)?;
        ed.sections[sec_pos].write_u32_rel(pos, new_offset)?;
    }
    Ok(())
}

fn pool_name(line_strp: bool) -> &'static str {
    if line_strp {
        ".debug_line_str"
    } else {
        ".debug_str"
    }
}

/// Walks every unit in a `.debug_info` or `.debug_types` section, phase by
/// phase.
pub(crate) fn edit_info(ed: &mut Editor, phase: Phase, sec_pos: usize) -> Result<()> {
    if ed.sections[sec_pos].data.is_empty() {
        return Ok(());
    }
    ed.ensure_relocs(sec_pos)?;

    let endian = ed.sections[sec_pos].endian;
    let sec_name = ed.sections[sec_pos].kind.name();
    let is_info = ed.sections[sec_pos].kind == DebugSectionKind::Info;
    let base = ed.base_dir.clone();
    let dest = ed.dest_dir.clone();
    let len = ed.sections[sec_pos].data.len();

    let mut pos = 0;
    while pos < len {
        let cu_start = pos;
        if pos + 4 + 2 + 1 + 1 > len {
            bail!("{sec_name} CU header too small");
        }

        let unit_length = {
            let data = &ed.sections[sec_pos].data;
            bytes::read_u32(endian, data, &mut pos)?
        };
        if unit_length == 0xffff_ffff {
            bail!("64-bit DWARF not supported");
        }
        let endcu = cu_start + 4 + unit_length as usize;
        if endcu > len {
            bail!("{sec_name} too small");
        }

        let version = {
            let data = &ed.sections[sec_pos].data;
            bytes::read_u16(endian, data, &mut pos)?
        };
        if !(2..=5).contains(&version) {
            bail!("DWARF version {version} unhandled");
        }

        let mut unit_type = constants::DW_UT_compile;
        let mut ptr_size = 0u8;
        if version >= 5 {
            let data = &ed.sections[sec_pos].data;
            unit_type = constants::DwUt(bytes::read_u8(data, &mut pos)?);
            if unit_type != constants::DW_UT_compile
                && unit_type != constants::DW_UT_partial
                && unit_type != constants::DW_UT_type
            {
                bail!("Unit type {} unhandled", unit_type.0);
            }
            ptr_size = bytes::read_u8(data, &mut pos)?;
        }

        let abbrev_offset = ed.sections[sec_pos].read_u32_rel(pos)?;
        pos += 4;

        if version < 5 {
            let data = &ed.sections[sec_pos].data;
            ptr_size = bytes::read_u8(data, &mut pos)?;
        }
        if ptr_size != 4 && ptr_size != 8 {
            bail!("Invalid DWARF pointer size {ptr_size}");
        }

        // Type units carry type_signature and type_offset.
        if !is_info || unit_type == constants::DW_UT_type {
            pos += 12;
        }
        if pos > endcu {
            bail!("{sec_name} CU header too small");
        }

        let cu_idx = match phase {
            Phase::Collect => {
                ed.cus.push(Cu {
                    version,
                    ptr_size,
                    str_offsets_base: 8,
                    macros_offs: None,
                });
                ed.cus.len() - 1
            }
            Phase::Rewrite => {
                let idx = ed.cu_cursor;
                if idx >= ed.cus.len() {
                    bail!("{sec_name} changed between passes");
                }
                idx
            }
        };
        ed.cu_cursor += 1;

        let abbrevs = {
            let Some(abbrev_pos) = ed.section_pos(DebugSectionKind::Abbrev) else {
                bail!(".debug_abbrev not present");
            };
            let abbrev_data = &ed.sections[abbrev_pos].data;
            if abbrev_offset as usize >= abbrev_data.len() {
                bail!("DWARF CU abbrev offset too large");
            }
            abbrev::parse(&abbrev_data[abbrev_offset as usize..])
                .with_context(|| format!("Could not read .debug_abbrev for {sec_name} CU"))?
        };

        let mut first = true;
        while pos < endcu {
            let code = {
                let data = &ed.sections[sec_pos].data;
                bytes::read_uleb128(data, &mut pos)?
            };
            if code == 0 {
                continue;
            }
            let Some(tag) = abbrevs.get(&code) else {
                bail!("Could not find DWARF abbreviation {code}");
            };

            // str_offsets_base is needed before any strx attribute in this
            // unit resolves, so scan the root DIE for it up front.
            if first {
                first = false;
                if version >= 5 {
                    prescan_str_offsets_base(ed, sec_pos, endian, tag, pos, cu_idx)?;
                }
            }

            pos = edit_attributes(
                ed,
                sec_pos,
                pos,
                tag,
                phase,
                cu_idx,
                endian,
                base.as_deref(),
                dest.as_deref(),
            )?;
        }
    }

    Ok(())
}

fn prescan_str_offsets_base(
    ed: &mut Editor,
    sec_pos: usize,
    endian: object::Endianness,
    tag: &AbbrevTag,
    pos: usize,
    cu_idx: usize,
) -> Result<()> {
    let cu = ed.cus[cu_idx].clone();
    let mut fpos = pos;
    for &(attr, form) in &tag.attrs {
        if attr == constants::DW_AT_str_offsets_base {
            let value = ed.sections[sec_pos].read_u32_rel(fpos)?;
            ed.cus[cu_idx].str_offsets_base = value;
            break;
        }
        let mut form = form;
        loop {
            let outcome = {
                let data = &ed.sections[sec_pos].data;
                skip_form(endian, data, &mut fpos, &mut form, &cu)?
            };
            match outcome {
                SkipOutcome::Consumed => break,
                SkipOutcome::Indirect => continue,
            }
        }
    }
    Ok(())
}

/// Processes one DIE's attributes. Returns the position just past the DIE.
#[allow(clippy::too_many_arguments)]
fn edit_attributes(
    ed: &mut Editor,
    sec_pos: usize,
    mut pos: usize,
    tag: &AbbrevTag,
    phase: Phase,
    cu_idx: usize,
    endian: object::Endianness,
    base: Option<&[u8]>,
    dest: Option<&[u8]>,
) -> Result<usize> {
    let cu = ed.cus[cu_idx].clone();
    let mut comp_dir: Option<Vec<u8>> = None;
    let mut found_list_offs: Option<u32> = None;

    for &(attr, initial_form) in &tag.attrs {
        let mut form = initial_form;
        loop {
            // Whether this attribute's string was already recorded as a file
            // path; the generic string handling below must not record it
            // again.
            let mut handled_strp = false;

            if attr == constants::DW_AT_stmt_list
                && (form == constants::DW_FORM_data4 || form == constants::DW_FORM_sec_offset)
            {
                match phase {
                    Phase::Collect => {
                        found_list_offs = Some(ed.sections[sec_pos].read_u32_rel(pos)?);
                    }
                    Phase::Rewrite => {
                        if ed.need_stmt_update {
                            let old = ed.sections[sec_pos].read_u32_rel(pos)?;
                            let new = ed.lines.new_offset_for(old)?;
                            ed.sections[sec_pos].write_u32_rel(pos, new)?;
                        }
                    }
                }
            }

            if attr == constants::DW_AT_macros && form == constants::DW_FORM_sec_offset {
                let offset = ed.sections[sec_pos].read_u32_rel(pos)?;
                ed.cus[cu_idx].macros_offs = Some(offset);
            }

            if attr == constants::DW_AT_comp_dir {
                if form == constants::DW_FORM_string {
                    let dir = bytes::read_cstr(&ed.sections[sec_pos].data, pos)?.to_vec();
                    if let (Some(base), Some(dest)) = (base, dest) {
                        if let Some(file) = paths::skip_dir_prefix(&dir, base) {
                            match phase {
                                Phase::Collect => ed.need_string_replacement = true,
                                Phase::Rewrite => {
                                    rewrite_string_comp_dir(
                                        &mut ed.sections[sec_pos].data,
                                        pos,
                                        &dir,
                                        file.len(),
                                        base,
                                        dest,
                                    );
                                }
                            }
                        }
                    }
                    comp_dir = Some(dir);
                } else if is_str_form(form) {
                    let line_strp = form == constants::DW_FORM_line_strp;
                    let offset = read_str_form(ed, sec_pos, &cu, form, pos)?;
                    if phase == Phase::Collect {
                        let dir = ed
                            .pool(line_strp)
                            .string_at(offset, pool_name(line_strp))
                            .with_context(|| {
                                format!("Bad string pointer index for comp_dir ({})", pool_name(line_strp))
                            })?
                            .to_vec();
                        comp_dir = Some(dir);
                        if let (Some(base), Some(dest)) = (base, dest) {
                            let replaced = ed.pool_mut(line_strp).intern_replaced(
                                offset,
                                base,
                                dest,
                                pool_name(line_strp),
                            )?;
                            if replaced {
                                ed.set_strp_update(line_strp);
                            }
                            handled_strp = true;
                        }
                    }
                }
            } else if (tag.tag == constants::DW_TAG_compile_unit
                || tag.tag == constants::DW_TAG_partial_unit)
                && attr == constants::DW_AT_name
                && phase == Phase::Collect
                && str_form_sections_present(ed, form)
            {
                let line_strp = form == constants::DW_FORM_line_strp;
                // DW_AT_name is the primary file for this compile unit. If
                // starting with / it is a full path name. Note that we don't
                // handle DW_FORM_string in this case.
                let offset = read_str_form(ed, sec_pos, &cu, form, pos)?;
                let name = ed
                    .pool(line_strp)
                    .string_at(offset, pool_name(line_strp))
                    .with_context(|| {
                        format!("Bad string pointer index for unit name ({})", pool_name(line_strp))
                    })?
                    .to_vec();
                if name.first() == Some(&b'/') && comp_dir.is_none() {
                    comp_dir = Some(match name.iter().rposition(|&b| b == b'/') {
                        Some(0) | None => b"/".to_vec(),
                        Some(end) => name[..end].to_vec(),
                    });
                }
                if let (Some(base), Some(dest)) = (base, dest) {
                    let replaced = ed.pool_mut(line_strp).intern_replaced(
                        offset,
                        base,
                        dest,
                        pool_name(line_strp),
                    )?;
                    if replaced {
                        ed.set_strp_update(line_strp);
                    }
                    handled_strp = true;
                }
            }

            if is_str_form(form) {
                edit_strp(ed, sec_pos, &cu, form, pos, phase, handled_strp)?;
            }

            let outcome = {
                let data = &ed.sections[sec_pos].data;
                skip_form(endian, data, &mut pos, &mut form, &cu)?
            };
            match outcome {
                SkipOutcome::Consumed => break,
                SkipOutcome::Indirect => continue,
            }
        }
    }

    // Record the unit's build directory in the sources list. Source file
    // names may refer relatively to it, so the debugger needs the directory
    // to exist even if empty. Skip the empty string (comp_dir == base).
    if phase == Phase::Collect && ed.source_list.is_active() {
        if let (Some(base), Some(dir)) = (base, comp_dir.as_deref()) {
            if let Some(suffix) = paths::skip_dir_prefix(dir, base) {
                ed.source_list.write_comp_dir(suffix)?;
            }
        }
    }

    // All file names of the referenced line table are collected now that the
    // comp_dir is known. Offsets and sizes are recalculated at the end of the
    // collection pass once every unit has been scanned.
    if phase == Phase::Collect {
        if let Some(offset) = found_list_offs {
            if register_line_table(ed, offset, comp_dir.as_deref(), cu_idx, base, dest)? {
                ed.need_stmt_update = true;
            }
        }
    }

    Ok(pos)
}

/// Replaces an inline `DW_FORM_string` comp_dir in place. The string's byte
/// layout cannot change, so a growing replacement is skipped with a warning
/// and a shrinking one is padded with `/` between the destination directory
/// and the original suffix.
fn rewrite_string_comp_dir(
    data: &mut [u8],
    pos: usize,
    dir: &[u8],
    file_len: usize,
    base: &[u8],
    dest: &[u8],
) {
    let orig_len = dir.len();
    let mut new_len = dest.len();
    if file_len > 0 {
        new_len += 1 + file_len;
    }
    if orig_len < new_len {
        warning(&format!(
            "not replacing comp_dir '{}' prefix ('{}' -> '{}') encoded as DW_FORM_string. Replacement too large.",
            String::from_utf8_lossy(dir),
            String::from_utf8_lossy(base),
            String::from_utf8_lossy(dest),
        ));
        return;
    }
    // The original suffix and terminator are already in place at the end of
    // the string; only the front needs to change.
    data[pos..pos + dest.len()].copy_from_slice(dest);
    for byte in &mut data[pos + dest.len()..pos + dest.len() + (orig_len - new_len)] {
        *byte = b'/';
    }
}

fn str_form_sections_present(ed: &Editor, form: DwForm) -> bool {
    match form {
        constants::DW_FORM_strp => ed.section_pos(DebugSectionKind::Str).is_some(),
        constants::DW_FORM_line_strp => ed.section_pos(DebugSectionKind::LineStr).is_some(),
        constants::DW_FORM_strx
        | constants::DW_FORM_strx1
        | constants::DW_FORM_strx2
        | constants::DW_FORM_strx3
        | constants::DW_FORM_strx4 => ed.section_pos(DebugSectionKind::StrOffsets).is_some(),
        _ => false,
    }
}

/// Registers the line table a `DW_AT_stmt_list` points at and, the first time
/// it is seen, scans it for path replacements and source files. Returns
/// whether the table's dir or file paths will need rewriting.
fn register_line_table(
    ed: &mut Editor,
    offset: u32,
    comp_dir: Option<&[u8]>,
    cu_idx: usize,
    base: Option<&[u8]>,
    dest: Option<&[u8]>,
) -> Result<bool> {
    let line_pos = ed
        .section_pos(DebugSectionKind::Line)
        .context("No .debug_line section")?;
    let ptr_size = ed.cus[cu_idx].ptr_size;

    let Editor {
        sections,
        lines,
        source_list,
        ..
    } = ed;
    let line_data = &sections[line_pos].data;
    let endian = sections[line_pos].endian;

    match lines.register(endian, line_data, offset, cu_idx, ptr_size)? {
        Registered::Existing => Ok(false),
        Registered::New(idx) => {
            if lines.tables[idx].version < 5 {
                line::scan_v4_unit(
                    &mut lines.tables[idx],
                    line_data,
                    comp_dir,
                    base,
                    dest,
                    source_list,
                )?;
            }
            let table = &lines.tables[idx];
            lines.total_new_len = (lines.total_new_len as i64
                + 4
                + i64::from(table.unit_length)
                + table.size_diff) as usize;
            Ok(table.replace_dirs || table.replace_files)
        }
    }
}

/// Walks the directory and file tables of a DWARF 5 line unit. These never
/// change size, but their `DW_FORM_strp` / `DW_FORM_line_strp` path entries
/// are recorded in the collection pass and rewritten in the rewrite pass, and
/// the file entries feed the sources list.
pub(crate) fn walk_v5_line_unit(ed: &mut Editor, table_idx: usize, phase: Phase) -> Result<()> {
    let line_pos = ed
        .section_pos(DebugSectionKind::Line)
        .context("No .debug_line section")?;
    let (start, cu_idx, prefix_len) = {
        let table = &ed.lines.tables[table_idx];
        (
            table.new_offset as usize,
            table.cu,
            table.header_prefix_len(),
        )
    };
    let cu = ed.cus[cu_idx].clone();
    let base = ed.base_dir.clone();
    let dest = ed.dest_dir.clone();

    let mut pos = start + prefix_len;
    let mut dirs: Option<Vec<Vec<u8>>> = None;
    for entry_kind in ["directory", "file name"] {
        walk_v5_entries(
            ed,
            line_pos,
            &mut pos,
            &cu,
            phase,
            &mut dirs,
            entry_kind,
            base.as_deref(),
            dest.as_deref(),
        )?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn walk_v5_entries(
    ed: &mut Editor,
    line_pos: usize,
    pos: &mut usize,
    cu: &Cu,
    phase: Phase,
    dirs: &mut Option<Vec<Vec<u8>>>,
    entry_kind: &str,
    base: Option<&[u8]>,
    dest: Option<&[u8]>,
) -> Result<()> {
    let endian = ed.sections[line_pos].endian;

    let mut formats = Vec::new();
    let entry_count = {
        let data = &ed.sections[line_pos].data;
        let format_count = bytes::read_u8(data, pos)?;
        for _ in 0..format_count {
            let lnct = bytes::read_uleb128(data, pos)?;
            let form = bytes::read_uleb128(data, pos)?;
            if form > u64::from(u16::MAX) {
                bail!("Unknown DWARF DW_FORM_0x{form:x}");
            }
            formats.push((lnct, DwForm(form as u16)));
        }
        bytes::read_uleb128(data, pos)?
    };

    let collecting_dirs = phase == Phase::Collect && dirs.is_none();
    let writing_files = phase == Phase::Collect && dirs.is_some();
    if collecting_dirs {
        *dirs = Some(Vec::with_capacity(entry_count as usize));
    }

    for entryi in 0..entry_count {
        let mut dir: Option<Vec<u8>> = None;
        let mut file: Option<Vec<u8>> = None;

        for &(lnct, form) in &formats {
            let mut form = form;
            let mut handled_form = false;
            let mut handled_strp = false;
            let line_strp = form == constants::DW_FORM_line_strp;

            if lnct == u64::from(constants::DW_LNCT_path.0) {
                match form {
                    constants::DW_FORM_strp | constants::DW_FORM_line_strp => {
                        if phase == Phase::Collect {
                            let offset = ed.sections[line_pos].read_u32_rel(*pos)?;
                            if let (Some(base), Some(dest)) = (base, dest) {
                                let replaced = ed.pool_mut(line_strp).intern_replaced(
                                    offset,
                                    base,
                                    dest,
                                    pool_name(line_strp),
                                )?;
                                if replaced {
                                    ed.set_strp_update(line_strp);
                                }
                            }
                            handled_strp = true;
                            if collecting_dirs || writing_files {
                                let s = ed
                                    .pool(line_strp)
                                    .string_at(offset, pool_name(line_strp))?
                                    .to_vec();
                                if collecting_dirs {
                                    dir = Some(s);
                                } else {
                                    file = Some(s);
                                }
                            }
                        }
                    }
                    other => bail!(
                        "Unsupported .debug_line {entry_kind} {entryi} path DW_FORM_0x{:x}",
                        other.0
                    ),
                }
            }

            if writing_files && lnct == u64::from(constants::DW_LNCT_directory_index.0) {
                let data = &ed.sections[line_pos].data;
                let dirndx = match form {
                    constants::DW_FORM_udata => {
                        handled_form = true;
                        bytes::read_uleb128(data, pos)? as usize
                    }
                    constants::DW_FORM_data1 => {
                        usize::from(*data.get(*pos).context("Section data truncated")?)
                    }
                    constants::DW_FORM_data2 => bytes::read_u16_at(endian, data, *pos)?.into(),
                    constants::DW_FORM_data4 => bytes::read_u32_at(endian, data, *pos)? as usize,
                    other => bail!(
                        "Unsupported .debug_line {entry_kind} {entryi} dirndx DW_FORM_0x{:x}",
                        other.0
                    ),
                };
                let dir_table = dirs.as_ref().unwrap();
                if dirndx >= dir_table.len() {
                    bail!("Bad dir number {entryi} in .debug_line {entry_kind}");
                }
                dir = Some(dir_table[dirndx].clone());
            }

            if is_str_form(form) {
                edit_strp(ed, line_pos, cu, form, *pos, phase, handled_strp)?;
            }

            if !handled_form {
                let outcome = {
                    let data = &ed.sections[line_pos].data;
                    skip_form(endian, data, pos, &mut form, cu)?
                };
                if matches!(outcome, SkipOutcome::Indirect) {
                    bail!("Unsupported .debug_line {entry_kind} {entryi} DW_FORM_indirect");
                }
            }
        }

        if collecting_dirs {
            dirs.as_mut().unwrap().push(dir.clone().unwrap_or_default());
        }

        if writing_files && ed.source_list.is_active() {
            if let Some(file) = file {
                let dir_table = dirs.as_ref().unwrap();
                let comp_dir = dir_table.first().map(Vec::as_slice).unwrap_or(b"");
                let full = line::resolve_source_path(
                    &file,
                    dir.as_deref().unwrap_or_default(),
                    comp_dir,
                );
                line::emit_source_path(&full, base, dest, &mut ed.source_list)?;
            }
        }
    }

    Ok(())
}
