//! Rewrites `.debug_str_offsets`: every 32-bit slot is an offset into
//! `.debug_str` and gets remapped to the rebuilt pool. Slots whose string was
//! never referenced anywhere are redirected to the `<debugedit>` sentinel
//! with a warning; dropping them would leave the slot pointing at garbage.

use crate::bytes;
use crate::editor::Editor;
use crate::error::warning;
use crate::error::Result;

pub(crate) fn update_str_offsets(ed: &mut Editor, so_pos: usize) -> Result<()> {
    ed.ensure_relocs(so_pos)?;
    let endian = ed.sections[so_pos].endian;
    let len = ed.sections[so_pos].data.len();
    let mut pos = 0;

    while pos < len {
        let unit_offset = pos;
        if len - pos < 12 {
            break;
        }
        let unit_length = {
            let data = &ed.sections[so_pos].data;
            bytes::read_u32(endian, data, &mut pos)?
        };
        if unit_length == 0xffff_ffff || len - pos < unit_length as usize {
            break;
        }
        let end = pos + unit_length as usize;
        let (version, padding) = {
            let data = &ed.sections[so_pos].data;
            (
                bytes::read_u16(endian, data, &mut pos)?,
                bytes::read_u16(endian, data, &mut pos)?,
            )
        };
        if version != 5 || padding != 0 {
            break;
        }

        let slots_start = pos;
        while pos < end {
            let old = ed.sections[so_pos].read_u32_rel(pos)?;
            let (new, unused) = ed.debug_str.lookup_or_sentinel(old)?;
            if unused {
                warning(&format!(
                    ".debug_str_offsets table at offset {unit_offset:x} index [{}] \
                     .debug_str [{old:x}] entry '{}' unused, replacing with '<debugedit>'",
                    (pos - slots_start) / 4,
                    String::from_utf8_lossy(ed.debug_str.orig_str(old)),
                ));
            }
            ed.sections[so_pos].write_u32_rel(pos, new)?;
            pos += 4;
        }
    }

    Ok(())
}
