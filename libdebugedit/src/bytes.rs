//! Endian-aware primitives for walking and patching raw DWARF section bytes.
//!
//! All readers take the position by `&mut usize` and advance it, mirroring how
//! the DWARF data is consumed: a long run of variable-width fields where the
//! next field starts wherever the previous one ended.

use crate::bail;
use crate::error::Context as _;
use crate::error::Result;
use object::Endian as _;
use object::Endianness;

pub(crate) fn read_u8(data: &[u8], pos: &mut usize) -> Result<u8> {
    let b = *data.get(*pos).context("Section data truncated")?;
    *pos += 1;
    Ok(b)
}

pub(crate) fn read_u16(endian: Endianness, data: &[u8], pos: &mut usize) -> Result<u16> {
    let bytes: [u8; 2] = data
        .get(*pos..*pos + 2)
        .context("Section data truncated")?
        .try_into()
        .unwrap();
    *pos += 2;
    Ok(endian.read_u16_bytes(bytes))
}

pub(crate) fn read_u24(endian: Endianness, data: &[u8], pos: &mut usize) -> Result<u32> {
    let b = data.get(*pos..*pos + 3).context("Section data truncated")?;
    *pos += 3;
    Ok(if endian.is_big_endian() {
        u32::from(b[2]) | u32::from(b[1]) << 8 | u32::from(b[0]) << 16
    } else {
        u32::from(b[0]) | u32::from(b[1]) << 8 | u32::from(b[2]) << 16
    })
}

pub(crate) fn read_u32(endian: Endianness, data: &[u8], pos: &mut usize) -> Result<u32> {
    let v = read_u32_at(endian, data, *pos)?;
    *pos += 4;
    Ok(v)
}

pub(crate) fn read_u32_at(endian: Endianness, data: &[u8], offset: usize) -> Result<u32> {
    let bytes: [u8; 4] = data
        .get(offset..offset + 4)
        .context("Section data truncated")?
        .try_into()
        .unwrap();
    Ok(endian.read_u32_bytes(bytes))
}

pub(crate) fn read_u16_at(endian: Endianness, data: &[u8], offset: usize) -> Result<u16> {
    let bytes: [u8; 2] = data
        .get(offset..offset + 2)
        .context("Section data truncated")?
        .try_into()
        .unwrap();
    Ok(endian.read_u16_bytes(bytes))
}

pub(crate) fn read_u64_at(endian: Endianness, data: &[u8], offset: usize) -> Result<u64> {
    let bytes: [u8; 8] = data
        .get(offset..offset + 8)
        .context("Section data truncated")?
        .try_into()
        .unwrap();
    Ok(endian.read_u64_bytes(bytes))
}

pub(crate) fn write_u16_at(endian: Endianness, data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&endian.write_u16_bytes(value));
}

pub(crate) fn write_u64_at(endian: Endianness, data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&endian.write_u64_bytes(value));
}

pub(crate) fn write_u32_at(endian: Endianness, data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&endian.write_u32_bytes(value));
}

pub(crate) fn push_u16(endian: Endianness, out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&endian.write_u16_bytes(value));
}

pub(crate) fn push_u32(endian: Endianness, out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&endian.write_u32_bytes(value));
}

pub(crate) fn read_uleb128(data: &[u8], pos: &mut usize) -> Result<u64> {
    let rest = data.get(*pos..).context("Section data truncated")?;
    let mut reader = gimli::EndianSlice::new(rest, gimli::LittleEndian);
    let value =
        gimli::leb128::read::unsigned(&mut reader).context("Invalid ULEB128 encoding")?;
    *pos += rest.len() - reader.len();
    Ok(value)
}

pub(crate) fn skip_sleb128(data: &[u8], pos: &mut usize) -> Result<()> {
    let rest = data.get(*pos..).context("Section data truncated")?;
    let mut reader = gimli::EndianSlice::new(rest, gimli::LittleEndian);
    gimli::leb128::read::signed(&mut reader).context("Invalid SLEB128 encoding")?;
    *pos += rest.len() - reader.len();
    Ok(())
}

pub(crate) fn write_uleb128(out: &mut Vec<u8>, value: u64) {
    // Writing to a Vec cannot fail.
    gimli::leb128::write::unsigned(out, value).unwrap();
}

/// Returns the null-terminated byte string starting at `offset`, without the
/// terminator.
pub(crate) fn read_cstr(data: &[u8], offset: usize) -> Result<&[u8]> {
    let rest = data.get(offset..).context("String offset out of range")?;
    match memchr::memchr(0, rest) {
        Some(end) => Ok(&rest[..end]),
        None => bail!("Unterminated string in section data"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endian_aware_reads() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let mut pos = 0;
        assert_eq!(read_u32(Endianness::Little, &data, &mut pos).unwrap(), 0x04030201);
        pos = 0;
        assert_eq!(read_u32(Endianness::Big, &data, &mut pos).unwrap(), 0x01020304);
        pos = 0;
        assert_eq!(read_u24(Endianness::Little, &data, &mut pos).unwrap(), 0x030201);
        assert_eq!(pos, 3);
    }

    #[test]
    fn uleb128_round_trip() {
        let mut buf = Vec::new();
        write_uleb128(&mut buf, 624485);
        assert_eq!(buf, [0xe5, 0x8e, 0x26]);
        let mut pos = 0;
        assert_eq!(read_uleb128(&buf, &mut pos).unwrap(), 624485);
        assert_eq!(pos, 3);
    }

    #[test]
    fn truncated_read_is_an_error() {
        let data = [0x01];
        let mut pos = 0;
        assert!(read_u32(Endianness::Little, &data, &mut pos).is_err());
    }

    #[test]
    fn cstr_reads_until_terminator() {
        let data = b"abc\0def\0";
        assert_eq!(read_cstr(data, 0).unwrap(), b"abc");
        assert_eq!(read_cstr(data, 4).unwrap(), b"def");
        assert!(read_cstr(b"no-nul", 0).is_err());
    }
}
