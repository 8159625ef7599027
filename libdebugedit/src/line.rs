//! Parsing and rewriting of `.debug_line`.
//!
//! Version 2-4 tables embed directory and file paths inline, so rewriting a
//! path prefix changes the header size and every table behind it moves.
//! During the collection pass we parse each referenced table, compute its
//! size delta and emit its source files; between passes the whole section is
//! rebuilt and the old-offset to new-offset mapping recorded here re-points
//! every consumer. Version 5 tables keep their paths in the string sections
//! and never change size.

use crate::bail;
use crate::bytes;
use crate::error::Context as _;
use crate::error::Result;
use crate::paths;
use crate::source_list::SourceList;
use object::Endianness;

#[derive(Debug)]
pub(crate) struct LineTable {
    /// Index of the (first) CU that references this table.
    pub(crate) cu: usize,

    pub(crate) old_offset: u32,
    /// Offset in the rebuilt section. Equal to `old_offset` until then.
    pub(crate) new_offset: u32,
    /// Difference in header size once paths are rewritten.
    pub(crate) size_diff: i64,
    pub(crate) replace_dirs: bool,
    pub(crate) replace_files: bool,

    pub(crate) unit_length: u32,
    pub(crate) version: u16,
    pub(crate) header_length: u32,
    pub(crate) min_instr_len: u8,
    /// Only present for version >= 4.
    pub(crate) max_op_per_instr: u8,
    pub(crate) default_is_stmt: u8,
    pub(crate) line_base: i8,
    pub(crate) line_range: u8,
    pub(crate) opcode_base: u8,
}

impl LineTable {
    /// Bytes from the start of the table up to the directory table: the fixed
    /// header fields plus the opcode length table.
    pub(crate) fn header_prefix_len(&self) -> usize {
        4 + 2
            + if self.version >= 5 { 2 } else { 0 }
            + 4
            + 1
            + usize::from(self.version >= 4)
            + 1
            + 1
            + 1
            + 1
            + usize::from(self.opcode_base) - 1
    }

    pub(crate) fn end_offset(&self) -> usize {
        self.old_offset as usize + 4 + self.unit_length as usize
    }
}

pub(crate) enum Registered {
    Existing,
    New(usize),
}

#[derive(Debug, Default)]
pub(crate) struct LineTables {
    pub(crate) tables: Vec<LineTable>,
    /// Total size of the rebuilt section; accumulated as tables register.
    pub(crate) total_new_len: usize,
    pub(crate) rebuilt: bool,
}

impl LineTables {
    /// Looks up or parses the table at `offset`. The table list stays in
    /// registration order until the rebuild sorts it.
    pub(crate) fn register(
        &mut self,
        endian: Endianness,
        data: &[u8],
        offset: u32,
        cu: usize,
        cu_ptr_size: u8,
    ) -> Result<Registered> {
        if self.tables.iter().any(|t| t.old_offset == offset) {
            return Ok(Registered::Existing);
        }
        let table = parse_header(endian, data, offset, cu, cu_ptr_size)?;
        self.tables.push(table);
        Ok(Registered::New(self.tables.len() - 1))
    }

    /// Maps a table's offset in the original section to its offset in the
    /// rebuilt one.
    pub(crate) fn new_offset_for(&self, old_offset: u32) -> Result<u32> {
        if !self.rebuilt {
            return Ok(old_offset);
        }
        self.tables
            .binary_search_by_key(&old_offset, |t| t.old_offset)
            .map(|i| self.tables[i].new_offset)
            .map_err(|_| {
                anyhow::anyhow!("No .debug_line table at offset 0x{old_offset:x}")
            })
    }

    /// Concatenates the new `.debug_line` contents. Tables needing no rewrite
    /// are copied verbatim; the rest get their headers reconstructed with the
    /// grown lengths and their directory/file tables rewritten.
    pub(crate) fn rebuild(
        &mut self,
        endian: Endianness,
        old_data: &[u8],
        base: &[u8],
        dest: &[u8],
    ) -> Result<Vec<u8>> {
        self.tables.sort_by_key(|t| t.old_offset);
        self.rebuilt = true;

        let mut out = Vec::with_capacity(self.total_new_len);
        for table in &mut self.tables {
            table.new_offset = out.len() as u32;
            let old_start = table.old_offset as usize;
            let old_end = table.end_offset();
            let old = old_data
                .get(old_start..old_end)
                .context(".debug_line table extends past end of section")?;

            if !table.replace_dirs && !table.replace_files {
                debug_assert_eq!(table.size_diff, 0);
                out.extend_from_slice(old);
                continue;
            }

            bytes::push_u32(endian, &mut out, (i64::from(table.unit_length) + table.size_diff) as u32);
            bytes::push_u16(endian, &mut out, table.version);
            bytes::push_u32(
                endian,
                &mut out,
                (i64::from(table.header_length) + table.size_diff) as u32,
            );
            out.push(table.min_instr_len);
            if table.version >= 4 {
                out.push(table.max_op_per_instr);
            }
            out.push(table.default_is_stmt);
            out.push(table.line_base as u8);
            out.push(table.line_range);
            out.push(table.opcode_base);

            let mut pos = 4 + 2 + 4
                + 1
                + usize::from(table.version >= 4)
                + 1
                + 1
                + 1
                + 1;
            let opcode_lens = usize::from(table.opcode_base) - 1;
            out.extend_from_slice(&old[pos..pos + opcode_lens]);
            pos += opcode_lens;

            // Directory table. We need to find the end (start of the file
            // table) anyway, so loop over all dirs even if replace_dirs is
            // false.
            while pos < old.len() && old[pos] != 0 {
                let dir = bytes::read_cstr(old, pos)?;
                let replacement = if table.replace_dirs {
                    paths::replace_dir_prefix(dir, base, dest)
                } else {
                    None
                };
                match replacement {
                    Some(new_dir) => {
                        out.extend_from_slice(&new_dir);
                        out.push(0);
                    }
                    None => {
                        out.extend_from_slice(dir);
                        out.push(0);
                    }
                }
                pos += dir.len() + 1;
            }
            pos += 1;
            out.push(0);

            // File table, only rewritten when a file path changes; otherwise
            // it's copied below along with the line number program.
            if table.replace_files {
                while pos < old.len() && old[pos] != 0 {
                    let file = bytes::read_cstr(old, pos)?;
                    match paths::replace_dir_prefix(file, base, dest) {
                        Some(new_file) => {
                            out.extend_from_slice(&new_file);
                            out.push(0);
                        }
                        None => {
                            out.extend_from_slice(file);
                            out.push(0);
                        }
                    }
                    pos += file.len() + 1;

                    let dir_idx = bytes::read_uleb128(old, &mut pos)?;
                    bytes::write_uleb128(&mut out, dir_idx);
                    let mtime = bytes::read_uleb128(old, &mut pos)?;
                    bytes::write_uleb128(&mut out, mtime);
                    let length = bytes::read_uleb128(old, &mut pos)?;
                    bytes::write_uleb128(&mut out, length);
                }
                pos += 1;
                out.push(0);
            }

            // Line number program (and the file table if it wasn't rewritten
            // above).
            out.extend_from_slice(old.get(pos..).unwrap_or_default());
        }

        debug_assert_eq!(out.len(), self.total_new_len);
        Ok(out)
    }
}

fn parse_header(
    endian: Endianness,
    data: &[u8],
    offset: u32,
    cu: usize,
    cu_ptr_size: u8,
) -> Result<LineTable> {
    if offset as usize > data.len() {
        bail!("Invalid .debug_line offset 0x{offset:x}");
    }
    let mut pos = offset as usize;

    let unit_length = bytes::read_u32(endian, data, &mut pos)?;
    if unit_length == 0xffff_ffff {
        bail!("64-bit DWARF not supported");
    }
    let end = offset as usize + 4 + unit_length as usize;
    if end > data.len() {
        bail!(".debug_line CU does not fit into section");
    }

    let version = bytes::read_u16(endian, data, &mut pos)?;
    if !(2..=5).contains(&version) {
        bail!("DWARF version {version} unhandled");
    }

    if version >= 5 {
        let address_size = bytes::read_u8(data, &mut pos)?;
        if address_size != cu_ptr_size {
            bail!(".debug_line address size differs from .debug_info");
        }
        // segment_selector_size
        bytes::read_u8(data, &mut pos)?;
    }

    let header_length = bytes::read_u32(endian, data, &mut pos)?;
    if pos + header_length as usize > end {
        bail!(".debug_line CU prologue does not fit into CU");
    }

    let min_instr_len = bytes::read_u8(data, &mut pos)?;
    let max_op_per_instr = if version >= 4 {
        bytes::read_u8(data, &mut pos)?
    } else {
        0
    };
    let default_is_stmt = bytes::read_u8(data, &mut pos)?;
    let line_base = bytes::read_u8(data, &mut pos)? as i8;
    let line_range = bytes::read_u8(data, &mut pos)?;
    let opcode_base = bytes::read_u8(data, &mut pos)?;
    if pos + usize::from(opcode_base) - 1 >= end {
        bail!(".debug_line opcode table does not fit into CU");
    }

    Ok(LineTable {
        cu,
        old_offset: offset,
        new_offset: offset,
        size_diff: 0,
        replace_dirs: false,
        replace_files: false,
        unit_length,
        version,
        header_length,
        min_instr_len,
        max_op_per_instr,
        default_is_stmt,
        line_base,
        line_range,
        opcode_base,
    })
}

/// Joins `file` against its directory and the compilation directory the way
/// the line-table semantics prescribe, producing the canonicalized full path.
pub(crate) fn resolve_source_path(file: &[u8], dir: &[u8], comp_dir: &[u8]) -> Vec<u8> {
    let mut s = Vec::new();
    if file.first() == Some(&b'/') {
        s.extend_from_slice(file);
    } else if dir.first() == Some(&b'/') {
        s.extend_from_slice(dir);
        s.push(b'/');
        s.extend_from_slice(file);
    } else {
        if !comp_dir.is_empty() {
            s.extend_from_slice(comp_dir);
            s.push(b'/');
        }
        s.extend_from_slice(dir);
        s.push(b'/');
        s.extend_from_slice(file);
    }
    paths::canonicalize_path(&s)
}

/// Writes one resolved source path to the sources list: everything when no
/// base directory was given, otherwise only paths under the base (or
/// destination) directory, emitted as the suffix relative to it.
pub(crate) fn emit_source_path(
    full: &[u8],
    base: Option<&[u8]>,
    dest: Option<&[u8]>,
    list: &mut SourceList,
) -> Result<()> {
    let suffix = match base {
        None => Some(full),
        Some(base) => paths::skip_dir_prefix(full, base)
            .or_else(|| dest.and_then(|dest| paths::skip_dir_prefix(full, dest))),
    };
    if let Some(suffix) = suffix {
        list.write_file(suffix)?;
    }
    Ok(())
}

/// Scans a version 2-4 table's directory and file lists: computes the size
/// deltas a prefix rewrite will cause and emits every referenced source file.
pub(crate) fn scan_v4_unit(
    table: &mut LineTable,
    data: &[u8],
    comp_dir: Option<&[u8]>,
    base: Option<&[u8]>,
    dest: Option<&[u8]>,
    list: &mut SourceList,
) -> Result<()> {
    let mut pos = table.old_offset as usize + table.header_prefix_len();
    let end = table.end_offset();
    let replacing = base.is_some() && dest.is_some();

    let mut dirs: Vec<&[u8]> = vec![b"."];
    while pos < end && data[pos] != 0 {
        let dir = bytes::read_cstr(data, pos)?;
        if replacing {
            if let Some(suffix) = paths::skip_dir_prefix(dir, base.unwrap()) {
                let old_size = dir.len() + 1;
                let mut new_size = dest.unwrap().len() + 1;
                if !suffix.is_empty() {
                    new_size += 1 + suffix.len();
                }
                table.size_diff += new_size as i64 - old_size as i64;
                table.replace_dirs = true;
            }
        }
        dirs.push(dir);
        pos += dir.len() + 1;
    }
    pos += 1;

    while pos < end && data[pos] != 0 {
        let file = bytes::read_cstr(data, pos)?;
        pos += file.len() + 1;
        let dir_idx = bytes::read_uleb128(data, &mut pos)? as usize;
        if dir_idx >= dirs.len() {
            bail!("Wrong directory table index {dir_idx}");
        }
        if replacing {
            if let Some(suffix) = paths::skip_dir_prefix(file, base.unwrap()) {
                let old_size = file.len() + 1;
                let mut new_size = dest.unwrap().len() + 1;
                if !suffix.is_empty() {
                    new_size += 1 + suffix.len();
                }
                table.size_diff += new_size as i64 - old_size as i64;
                table.replace_files = true;
            }
        }

        if list.is_active() {
            let full = resolve_source_path(file, dirs[dir_idx], comp_dir.unwrap_or(b""));
            emit_source_path(&full, base, dest, list)?;
        }

        // mtime and length
        bytes::read_uleb128(data, &mut pos)?;
        bytes::read_uleb128(data, &mut pos)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &[u8] = b"/tmp/build";
    const DEST: &[u8] = b"/usr/src/debug/pkg";

    /// Builds a DWARF 4 line table with the given directory and file tables
    /// and a dummy two-byte line program.
    fn build_v4_table(endian: Endianness, dirs: &[&[u8]], files: &[(&[u8], u64)]) -> Vec<u8> {
        let mut header_tail = Vec::new();
        header_tail.push(1); // min_instr_len
        header_tail.push(1); // max_op_per_instr
        header_tail.push(1); // default_is_stmt
        header_tail.push(0xfb); // line_base (-5)
        header_tail.push(14); // line_range
        header_tail.push(13); // opcode_base
        header_tail.extend_from_slice(&[0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1]);
        for dir in dirs {
            header_tail.extend_from_slice(dir);
            header_tail.push(0);
        }
        header_tail.push(0);
        for (file, dir_idx) in files {
            header_tail.extend_from_slice(file);
            header_tail.push(0);
            bytes::write_uleb128(&mut header_tail, *dir_idx);
            bytes::write_uleb128(&mut header_tail, 0); // mtime
            bytes::write_uleb128(&mut header_tail, 0); // length
        }
        header_tail.push(0);

        let program: &[u8] = &[0x02, 0x01]; // advance_pc 1
        // header_length counts from just past itself to the end of the file
        // table, which is exactly the tail built above.
        let header_length = header_tail.len() as u32;
        let unit_length = 2 + 4 + header_tail.len() as u32 + program.len() as u32;

        let mut out = Vec::new();
        bytes::push_u32(endian, &mut out, unit_length);
        bytes::push_u16(endian, &mut out, 4);
        bytes::push_u32(endian, &mut out, header_length);
        out.extend_from_slice(&header_tail);
        out.extend_from_slice(program);
        out
    }

    fn register_one(endian: Endianness, data: &[u8]) -> (LineTables, usize) {
        let mut lines = LineTables::default();
        let Registered::New(idx) = lines.register(endian, data, 0, 0, 8).unwrap() else {
            panic!("table should be new");
        };
        let table = &lines.tables[idx];
        lines.total_new_len += 4 + table.unit_length as usize + table.size_diff as usize;
        (lines, idx)
    }

    #[test]
    fn parses_v4_header() {
        let endian = Endianness::Little;
        let data = build_v4_table(endian, &[b"/tmp/build/include"], &[(b"foo.c", 0)]);
        let (lines, idx) = register_one(endian, &data);
        let table = &lines.tables[idx];
        assert_eq!(table.version, 4);
        assert_eq!(table.opcode_base, 13);
        assert_eq!(table.end_offset(), data.len());
    }

    #[test]
    fn duplicate_registration_is_detected() {
        let endian = Endianness::Little;
        let data = build_v4_table(endian, &[], &[(b"foo.c", 0)]);
        let mut lines = LineTables::default();
        assert!(matches!(
            lines.register(endian, &data, 0, 0, 8).unwrap(),
            Registered::New(_)
        ));
        assert!(matches!(
            lines.register(endian, &data, 0, 1, 8).unwrap(),
            Registered::Existing
        ));
    }

    #[test]
    fn rejects_64_bit_dwarf() {
        let endian = Endianness::Little;
        let mut data = vec![0u8; 32];
        bytes::write_u32_at(endian, &mut data, 0, 0xffff_ffff);
        let mut lines = LineTables::default();
        assert!(lines.register(endian, &data, 0, 0, 8).is_err());
    }

    #[test]
    fn scan_computes_growth_and_flags() {
        let endian = Endianness::Little;
        let data = build_v4_table(
            endian,
            &[b"/tmp/build/include", b"/usr/include"],
            &[(b"/tmp/build/foo.c", 0), (b"bar.c", 1)],
        );
        let (mut lines, idx) = register_one(endian, &data);
        let mut list = SourceList::disabled();
        scan_v4_unit(
            &mut lines.tables[idx],
            &data,
            Some(b"/tmp/build"),
            Some(BASE),
            Some(DEST),
            &mut list,
        )
        .unwrap();
        let table = &lines.tables[idx];
        assert!(table.replace_dirs);
        assert!(table.replace_files);
        // "/tmp/build/include" -> "/usr/src/debug/pkg/include" grows by 8,
        // "/tmp/build/foo.c" -> "/usr/src/debug/pkg/foo.c" grows by 8.
        assert_eq!(table.size_diff, 16);
    }

    #[test]
    fn rebuild_grows_header_and_remaps_offsets() {
        let endian = Endianness::Little;
        let first = build_v4_table(endian, &[b"/tmp/build/include"], &[(b"foo.c", 1)]);
        let second = build_v4_table(endian, &[b"/elsewhere"], &[(b"bar.c", 1)]);
        let mut data = first.clone();
        data.extend_from_slice(&second);

        let mut lines = LineTables::default();
        let mut list = SourceList::disabled();
        for offset in [0u32, first.len() as u32] {
            let Registered::New(idx) = lines.register(endian, &data, offset, 0, 8).unwrap() else {
                panic!("table should be new");
            };
            scan_v4_unit(
                &mut lines.tables[idx],
                &data,
                None,
                Some(BASE),
                Some(DEST),
                &mut list,
            )
            .unwrap();
            let table = &lines.tables[idx];
            lines.total_new_len += 4 + table.unit_length as usize + table.size_diff as usize;
        }

        let growth = DEST.len() as i64 - BASE.len() as i64;
        assert_eq!(lines.tables[0].size_diff, growth);

        let new_data = lines.rebuild(endian, &data, BASE, DEST).unwrap();
        assert_eq!(new_data.len(), data.len() + growth as usize);

        // The first table grew in place; the second moved by the growth.
        assert_eq!(lines.new_offset_for(0).unwrap(), 0);
        assert_eq!(
            lines.new_offset_for(first.len() as u32).unwrap(),
            (first.len() as i64 + growth) as u32
        );

        // The first table's lengths grew; its directory was rewritten.
        let mut pos = 0;
        let unit_length = bytes::read_u32(endian, &new_data, &mut pos).unwrap();
        assert_eq!(
            unit_length as i64,
            i64::from(lines.tables[0].unit_length) + growth
        );
        let version = bytes::read_u16(endian, &new_data, &mut pos).unwrap();
        assert_eq!(version, 4);
        let header_length = bytes::read_u32(endian, &new_data, &mut pos).unwrap();
        assert_eq!(
            header_length as i64,
            i64::from(lines.tables[0].header_length) + growth
        );
        let dir_start = lines.tables[0].header_prefix_len();
        let dir = bytes::read_cstr(&new_data, dir_start).unwrap();
        assert_eq!(dir, b"/usr/src/debug/pkg/include");

        // The second table was copied verbatim at its new offset.
        let second_new = &new_data[(first.len() as i64 + growth) as usize..];
        assert_eq!(second_new, &second[..]);
    }

    #[test]
    fn unknown_table_offset_is_an_error_after_rebuild() {
        let endian = Endianness::Little;
        let data = build_v4_table(endian, &[b"/tmp/build/x"], &[(b"f.c", 1)]);
        let (mut lines, idx) = register_one(endian, &data);
        let mut list = SourceList::disabled();
        scan_v4_unit(
            &mut lines.tables[idx],
            &data,
            None,
            Some(BASE),
            Some(DEST),
            &mut list,
        )
        .unwrap();
        lines.total_new_len = (lines.total_new_len as i64 + lines.tables[idx].size_diff) as usize;
        lines.rebuild(endian, &data, BASE, DEST).unwrap();
        assert!(lines.new_offset_for(2).is_err());
    }

    #[test]
    fn resolves_relative_paths_through_comp_dir() {
        assert_eq!(resolve_source_path(b"/abs/foo.c", b"sub", b"/cd"), b"/abs/foo.c");
        assert_eq!(
            resolve_source_path(b"foo.c", b"/abs/dir", b"/cd"),
            b"/abs/dir/foo.c"
        );
        assert_eq!(
            resolve_source_path(b"foo.c", b"sub", b"/cd"),
            b"/cd/sub/foo.c"
        );
        assert_eq!(resolve_source_path(b"foo.c", b".", b"/cd"), b"/cd/foo.c");
        assert_eq!(resolve_source_path(b"foo.c", b".", b""), b"foo.c");
    }
}
