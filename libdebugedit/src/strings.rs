//! Rebuilds `.debug_str` / `.debug_line_str`. During the collection pass every
//! referenced string is interned by its offset in the original section; paths
//! under the base directory are interned as their rewritten form. Once
//! finalized, the pool is a single deduplicated blob of null-terminated
//! strings and every original offset maps to a stable new offset.
//!
//! We key entries on the original offset rather than on string contents so
//! that repeated sightings of the same offset don't re-compare (or rebuild)
//! the string. A correctly produced string table shouldn't contain duplicate
//! strings anyway; any that do exist are deduplicated by the table below.

use crate::bail;
use crate::bytes;
use crate::error::Result;
use crate::paths;
use indexmap::IndexSet;
use std::collections::BTreeMap;

/// The replacement string installed for `.debug_str_offsets` slots whose
/// string was never referenced by the info walk.
pub(crate) const UNUSED_STRING_SENTINEL: &[u8] = b"<debugedit>";

/// A deduplicated string table. Offsets are assigned in insertion order when
/// the table is finalized, which keeps the output deterministic.
#[derive(Debug, Default)]
struct StringTable {
    strings: IndexSet<Vec<u8>>,
    offsets: Vec<u32>,
}

impl StringTable {
    fn add(&mut self, string: Vec<u8>) -> usize {
        self.strings.insert_full(string).0
    }

    fn finalize(&mut self) -> Vec<u8> {
        let total: usize = self.strings.iter().map(|s| s.len() + 1).sum();
        let mut buf = Vec::with_capacity(total);
        self.offsets = Vec::with_capacity(self.strings.len());
        for string in &self.strings {
            self.offsets.push(buf.len() as u32);
            buf.extend_from_slice(string);
            buf.push(0);
        }
        buf
    }
}

#[derive(Debug, Default)]
pub(crate) struct StringPool {
    /// Bytes of the original string section.
    orig: Vec<u8>,
    /// Maps original offsets to entries in the new table.
    entries: BTreeMap<u32, usize>,
    table: StringTable,
    sentinel: Option<usize>,
    finalized: bool,
}

impl StringPool {
    pub(crate) fn new(orig: Vec<u8>) -> StringPool {
        StringPool {
            orig,
            ..StringPool::default()
        }
    }

    pub(crate) fn orig_str(&self, old_offset: u32) -> &[u8] {
        bytes::read_cstr(&self.orig, old_offset as usize).unwrap_or(b"<invalid>")
    }

    pub(crate) fn string_at(&self, old_offset: u32, section_name: &str) -> Result<&[u8]> {
        self.old_string(old_offset, section_name)
    }

    fn old_string(&self, old_offset: u32, section_name: &str) -> Result<&[u8]> {
        if old_offset as usize >= self.orig.len() {
            bail!("Bad string pointer index 0x{old_offset:x} ({section_name})");
        }
        bytes::read_cstr(&self.orig, old_offset as usize)
    }

    /// Records the string at `old_offset` in the new pool, unchanged. Does
    /// nothing if the offset was already seen.
    pub(crate) fn intern_existing(&mut self, old_offset: u32, section_name: &str) -> Result<()> {
        debug_assert!(!self.finalized);
        if self.entries.contains_key(&old_offset) {
            return Ok(());
        }
        let string = self.old_string(old_offset, section_name)?.to_vec();
        let id = self.table.add(string);
        self.entries.insert(old_offset, id);
        Ok(())
    }

    /// Records the string at `old_offset`, replacing a leading `base` prefix
    /// with `dest`. Returns true if the offset was not yet seen and a
    /// replacement was performed.
    pub(crate) fn intern_replaced(
        &mut self,
        old_offset: u32,
        base: &[u8],
        dest: &[u8],
        section_name: &str,
    ) -> Result<bool> {
        debug_assert!(!self.finalized);
        if self.entries.contains_key(&old_offset) {
            return Ok(false);
        }
        let old = self.old_string(old_offset, section_name)?;
        let (string, replaced) = match paths::replace_dir_prefix(old, base, dest) {
            Some(new) => (new, true),
            None => (old.to_vec(), false),
        };
        let id = self.table.add(string);
        self.entries.insert(old_offset, id);
        Ok(replaced)
    }

    /// Installs the `<debugedit>` sentinel entry. Needed whenever a
    /// `.debug_str_offsets` section exists, because its index slots may
    /// reference strings the info walk never reaches.
    pub(crate) fn add_sentinel(&mut self) {
        debug_assert!(!self.finalized);
        if self.sentinel.is_none() {
            self.sentinel = Some(self.table.add(UNUSED_STRING_SENTINEL.to_vec()));
        }
    }

    /// Produces the new section contents and freezes offset assignment.
    pub(crate) fn finalize(&mut self) -> Vec<u8> {
        debug_assert!(!self.finalized);
        self.finalized = true;
        self.table.finalize()
    }

    /// Maps an original offset to its offset in the finalized pool.
    pub(crate) fn lookup(&self, old_offset: u32) -> Result<u32> {
        debug_assert!(self.finalized);
        match self.entries.get(&old_offset) {
            Some(&id) => Ok(self.table.offsets[id]),
            None => bail!("String at offset 0x{old_offset:x} was never interned"),
        }
    }

    /// As `lookup`, but redirects offsets that were never interned to the
    /// sentinel entry. Returns the new offset and whether the redirect
    /// happened.
    pub(crate) fn lookup_or_sentinel(&self, old_offset: u32) -> Result<(u32, bool)> {
        debug_assert!(self.finalized);
        if let Some(&id) = self.entries.get(&old_offset) {
            return Ok((self.table.offsets[id], false));
        }
        match self.sentinel {
            Some(id) => Ok((self.table.offsets[id], true)),
            None => bail!("String at offset 0x{old_offset:x} was never interned"),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_from(strings: &[&[u8]]) -> (StringPool, Vec<u32>) {
        let mut orig = Vec::new();
        let mut offsets = Vec::new();
        for s in strings {
            offsets.push(orig.len() as u32);
            orig.extend_from_slice(s);
            orig.push(0);
        }
        (StringPool::new(orig), offsets)
    }

    #[test]
    fn interned_strings_keep_their_bytes() {
        let (mut pool, offs) = pool_from(&[b"main", b"/tmp/build/foo.c"]);
        pool.intern_existing(offs[0], ".debug_str").unwrap();
        pool.intern_existing(offs[1], ".debug_str").unwrap();
        let buf = pool.finalize();
        assert_eq!(buf, b"main\0/tmp/build/foo.c\0");
        assert_eq!(pool.lookup(offs[0]).unwrap(), 0);
        assert_eq!(pool.lookup(offs[1]).unwrap(), 5);
    }

    #[test]
    fn replacement_rewrites_prefix() {
        let (mut pool, offs) = pool_from(&[b"/tmp/build/foo.c", b"/tmp/build", b"/other/bar.c"]);
        assert!(pool
            .intern_replaced(offs[0], b"/tmp/build", b"/usr/src/debug", ".debug_str")
            .unwrap());
        assert!(pool
            .intern_replaced(offs[1], b"/tmp/build", b"/usr/src/debug", ".debug_str")
            .unwrap());
        assert!(!pool
            .intern_replaced(offs[2], b"/tmp/build", b"/usr/src/debug", ".debug_str")
            .unwrap());
        let buf = pool.finalize();
        assert_eq!(buf, b"/usr/src/debug/foo.c\0/usr/src/debug\0/other/bar.c\0");
    }

    #[test]
    fn repeated_offsets_resolve_to_one_entry() {
        let (mut pool, offs) = pool_from(&[b"dup"]);
        pool.intern_existing(offs[0], ".debug_str").unwrap();
        pool.intern_existing(offs[0], ".debug_str").unwrap();
        let buf = pool.finalize();
        assert_eq!(buf, b"dup\0");
    }

    #[test]
    fn identical_strings_are_deduplicated() {
        // Two different old offsets holding the same bytes share one output
        // entry.
        let (mut pool, offs) = pool_from(&[b"same", b"same"]);
        pool.intern_existing(offs[0], ".debug_str").unwrap();
        pool.intern_existing(offs[1], ".debug_str").unwrap();
        let buf = pool.finalize();
        assert_eq!(buf, b"same\0");
        assert_eq!(pool.lookup(offs[0]).unwrap(), pool.lookup(offs[1]).unwrap());
    }

    #[test]
    fn sentinel_catches_unreferenced_offsets() {
        let (mut pool, offs) = pool_from(&[b"used", b"unused"]);
        pool.intern_existing(offs[0], ".debug_str").unwrap();
        pool.add_sentinel();
        pool.finalize();
        let (off, missing) = pool.lookup_or_sentinel(offs[1]).unwrap();
        assert!(missing);
        assert_eq!(off, 5);
        let (off, missing) = pool.lookup_or_sentinel(offs[0]).unwrap();
        assert!(!missing);
        assert_eq!(off, 0);
    }

    #[test]
    fn out_of_range_offset_is_fatal() {
        let (mut pool, _) = pool_from(&[b"x"]);
        assert!(pool.intern_existing(100, ".debug_str").is_err());
    }
}
