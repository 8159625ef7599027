//! Parsing of `.debug_abbrev` tables. Each compilation unit points at one
//! table; we parse it into a map keyed by abbreviation code before walking the
//! unit's DIEs.

use crate::bail;
use crate::bytes;
use crate::error::Result;
use gimli::constants;
use gimli::constants::DwAt;
use gimli::constants::DwForm;
use gimli::constants::DwTag;
use hashbrown::HashMap;

#[derive(Debug)]
pub(crate) struct AbbrevTag {
    pub(crate) tag: DwTag,
    pub(crate) attrs: Vec<(DwAt, DwForm)>,
}

pub(crate) type Abbrevs = HashMap<u64, AbbrevTag>;

/// Returns whether we know how to consume a value of this form. Forms outside
/// this set make the whole unit unparseable, so they're fatal.
fn form_is_known(form: DwForm) -> bool {
    if form.0 == 0x02 {
        // Reserved since DWARF 2.
        return false;
    }
    if form.0 <= constants::DW_FORM_flag_present.0 {
        return true;
    }
    matches!(
        form,
        constants::DW_FORM_ref_sig8
            | constants::DW_FORM_data16
            | constants::DW_FORM_line_strp
            | constants::DW_FORM_implicit_const
            | constants::DW_FORM_addrx
            | constants::DW_FORM_loclistx
            | constants::DW_FORM_rnglistx
            | constants::DW_FORM_addrx1
            | constants::DW_FORM_addrx2
            | constants::DW_FORM_addrx3
            | constants::DW_FORM_addrx4
            | constants::DW_FORM_strx
            | constants::DW_FORM_strx1
            | constants::DW_FORM_strx2
            | constants::DW_FORM_strx3
            | constants::DW_FORM_strx4
    )
}

/// Parses one abbreviation table starting at `data[0]` (the caller slices the
/// section at the unit's abbrev offset). The table ends at an entry with
/// code 0.
pub(crate) fn parse(data: &[u8]) -> Result<Abbrevs> {
    let mut abbrevs = Abbrevs::new();
    let mut pos = 0;

    loop {
        let code = bytes::read_uleb128(data, &mut pos)?;
        if code == 0 {
            break;
        }
        let tag = bytes::read_uleb128(data, &mut pos)?;
        // Skip the has-children flag.
        bytes::read_u8(data, &mut pos)?;

        let mut attrs = Vec::new();
        loop {
            let attr = bytes::read_uleb128(data, &mut pos)?;
            if attr == 0 {
                if bytes::read_uleb128(data, &mut pos)? != 0 {
                    bail!("DWARF abbreviation does not end with 2 zeros");
                }
                break;
            }
            let form = bytes::read_uleb128(data, &mut pos)?;
            if attr > u64::from(u16::MAX) || form > u64::from(u16::MAX) {
                bail!("Unknown DWARF DW_FORM_0x{form:x}");
            }
            let form = DwForm(form as u16);
            if !form_is_known(form) {
                bail!("Unknown DWARF DW_FORM_0x{:x}", form.0);
            }
            if form == constants::DW_FORM_implicit_const {
                // The constant lives in the abbrev table; the value is
                // irrelevant to us.
                bytes::skip_sleb128(data, &mut pos)?;
            }
            attrs.push((DwAt(attr as u16), form));
        }

        let tag = if tag > u64::from(u16::MAX) {
            bail!("Invalid DWARF tag 0x{tag:x}")
        } else {
            DwTag(tag as u16)
        };
        if abbrevs
            .insert(code, AbbrevTag { tag, attrs })
            .is_some()
        {
            bail!("Duplicate DWARF abbreviation {code}");
        }
    }

    Ok(abbrevs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uleb(out: &mut Vec<u8>, v: u64) {
        bytes::write_uleb128(out, v);
    }

    #[test]
    fn parses_a_simple_table() {
        let mut data = Vec::new();
        uleb(&mut data, 1); // code
        uleb(&mut data, constants::DW_TAG_compile_unit.0.into());
        data.push(1); // has children
        uleb(&mut data, constants::DW_AT_name.0.into());
        uleb(&mut data, constants::DW_FORM_strp.0.into());
        uleb(&mut data, constants::DW_AT_comp_dir.0.into());
        uleb(&mut data, constants::DW_FORM_string.0.into());
        uleb(&mut data, 0);
        uleb(&mut data, 0);
        uleb(&mut data, 0); // end of table

        let abbrevs = parse(&data).unwrap();
        let tag = &abbrevs[&1];
        assert_eq!(tag.tag, constants::DW_TAG_compile_unit);
        assert_eq!(
            tag.attrs,
            vec![
                (constants::DW_AT_name, constants::DW_FORM_strp),
                (constants::DW_AT_comp_dir, constants::DW_FORM_string),
            ]
        );
    }

    #[test]
    fn implicit_const_value_is_consumed() {
        let mut data = Vec::new();
        uleb(&mut data, 3);
        uleb(&mut data, constants::DW_TAG_subprogram.0.into());
        data.push(0);
        uleb(&mut data, constants::DW_AT_decl_file.0.into());
        uleb(&mut data, constants::DW_FORM_implicit_const.0.into());
        data.push(0x7f); // SLEB128 -1
        uleb(&mut data, 0);
        uleb(&mut data, 0);
        uleb(&mut data, 0);

        let abbrevs = parse(&data).unwrap();
        assert_eq!(
            abbrevs[&3].attrs,
            vec![(constants::DW_AT_decl_file, constants::DW_FORM_implicit_const)]
        );
    }

    #[test]
    fn duplicate_code_is_fatal() {
        let mut data = Vec::new();
        for _ in 0..2 {
            uleb(&mut data, 7);
            uleb(&mut data, constants::DW_TAG_base_type.0.into());
            data.push(0);
            uleb(&mut data, 0);
            uleb(&mut data, 0);
        }
        uleb(&mut data, 0);
        assert!(parse(&data).is_err());
    }

    #[test]
    fn unknown_form_is_fatal() {
        let mut data = Vec::new();
        uleb(&mut data, 1);
        uleb(&mut data, constants::DW_TAG_base_type.0.into());
        data.push(0);
        uleb(&mut data, constants::DW_AT_name.0.into());
        uleb(&mut data, 0x7f); // not a valid form
        uleb(&mut data, 0);
        uleb(&mut data, 0);
        uleb(&mut data, 0);
        assert!(parse(&data).is_err());

        // 0x02 has been reserved since DWARF 2.
        let mut data = Vec::new();
        uleb(&mut data, 1);
        uleb(&mut data, constants::DW_TAG_base_type.0.into());
        data.push(0);
        uleb(&mut data, constants::DW_AT_name.0.into());
        uleb(&mut data, 0x02);
        uleb(&mut data, 0);
        uleb(&mut data, 0);
        uleb(&mut data, 0);
        assert!(parse(&data).is_err());
    }
}
