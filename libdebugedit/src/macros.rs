//! Walks `.debug_macro` units (version 4 uses the GNU extension opcodes,
//! version 5 the standardized ones; the encodings match). Each unit may carry
//! a `.debug_line` offset in its header and `.debug_str` offsets in its
//! define/undef opcodes; both are rewritten here. The section itself never
//! changes size.

use crate::bail;
use crate::bytes;
use crate::editor::Editor;
use crate::editor::Phase;
use crate::error::Result;
use crate::info;
use gimli::constants;

pub(crate) fn edit_macros(ed: &mut Editor, phase: Phase, macro_pos: usize) -> Result<()> {
    ed.ensure_relocs(macro_pos)?;
    let endian = ed.sections[macro_pos].endian;
    let len = ed.sections[macro_pos].data.len();
    let mut pos = 0;

    while pos < len {
        let cu = ed.find_macro_cu(pos as u32)?;

        let (version, flags) = {
            let data = &ed.sections[macro_pos].data;
            (
                bytes::read_u16(endian, data, &mut pos)?,
                bytes::read_u8(data, &mut pos)?,
            )
        };
        if !(4..=5).contains(&version) {
            bail!("unhandled .debug_macro version: {version}");
        }
        // Bit 0 would select the 64-bit offset format, bit 1 a debug_line
        // offset field; only the latter is supported.
        if flags & !2 != 0 {
            bail!("unhandled .debug_macro flags: 0x{flags:x}");
        }

        if flags & 2 != 0 {
            match phase {
                Phase::Collect => pos += 4,
                Phase::Rewrite => {
                    let old = ed.sections[macro_pos].read_u32_rel(pos)?;
                    let new = ed.lines.new_offset_for(old)?;
                    ed.sections[macro_pos].write_u32_rel(pos, new)?;
                    pos += 4;
                }
            }
        }

        loop {
            let op = {
                let data = &ed.sections[macro_pos].data;
                bytes::read_u8(data, &mut pos)?
            };
            if op == 0 {
                break;
            }
            let op = constants::DwMacro(op);
            match op {
                constants::DW_MACRO_define | constants::DW_MACRO_undef => {
                    let data = &ed.sections[macro_pos].data;
                    bytes::read_uleb128(data, &mut pos)?;
                    let text = bytes::read_cstr(data, pos)?;
                    pos += text.len() + 1;
                }
                constants::DW_MACRO_start_file => {
                    let data = &ed.sections[macro_pos].data;
                    bytes::read_uleb128(data, &mut pos)?;
                    bytes::read_uleb128(data, &mut pos)?;
                }
                constants::DW_MACRO_end_file => {}
                constants::DW_MACRO_define_strp | constants::DW_MACRO_undef_strp => {
                    {
                        let data = &ed.sections[macro_pos].data;
                        bytes::read_uleb128(data, &mut pos)?;
                    }
                    match phase {
                        Phase::Collect => {
                            let offset = ed.sections[macro_pos].read_u32_rel(pos)?;
                            ed.debug_str.intern_existing(offset, ".debug_str")?;
                        }
                        // String offsets only move when the pool was rebuilt;
                        // a pure line-table resize leaves them alone.
                        Phase::Rewrite if ed.need_strp_update => {
                            let offset = ed.sections[macro_pos].read_u32_rel(pos)?;
                            let new_offset = ed.debug_str.lookup(offset)?;
                            ed.sections[macro_pos].write_u32_rel(pos, new_offset)?;
                        }
                        Phase::Rewrite => {}
                    }
                    pos += 4;
                }
                constants::DW_MACRO_import => {
                    // Offset into this same section; the section never moves
                    // or resizes, so nothing to rewrite.
                    pos += 4;
                }
                constants::DW_MACRO_define_strx | constants::DW_MACRO_undef_strx => {
                    {
                        let data = &ed.sections[macro_pos].data;
                        bytes::read_uleb128(data, &mut pos)?;
                    }
                    if phase == Phase::Collect {
                        let offset = info::read_str_form(
                            ed,
                            macro_pos,
                            &cu,
                            constants::DW_FORM_strx,
                            pos,
                        )?;
                        ed.debug_str.intern_existing(offset, ".debug_str")?;
                    }
                    let data = &ed.sections[macro_pos].data;
                    bytes::read_uleb128(data, &mut pos)?;
                }
                other => bail!("Unhandled DW_MACRO op 0x{:x}", other.0),
            }
        }
    }

    Ok(())
}
