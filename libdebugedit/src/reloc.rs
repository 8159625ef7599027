//! An index over the relocations that target a debug section.
//!
//! In relocatable objects the "true" value of a 32-bit DWARF offset is
//! (literal word + relocation addend), and a rewrite may have to land in
//! either place. Reads therefore go through [`RelocIndex::read_u32`], which
//! records the relocation context, and the write that reinterprets the same
//! site must immediately follow through [`RelocIndex::write_u32`]. Updated
//! RELA addends are committed back to the relocation section once all edits
//! are done.

use crate::bail;
use crate::bytes;
use crate::elf::Class;
use crate::elf::LoadedElf;
use crate::error::Context as _;
use crate::error::Result;
use object::Endianness;

// Relocation constants for architectures the object crate doesn't cover.
pub(crate) const EM_ALPHA: u16 = 0x9026;
pub(crate) const EM_MCST_ELBRUS: u16 = 175;
pub(crate) const EM_AMDGPU: u16 = 224;
pub(crate) const R_ALPHA_REFLONG: u32 = 1;
pub(crate) const R_PARISC_DIR32: u32 = 1;
pub(crate) const R_IA64_SECREL32LSB: u32 = 0x65;
pub(crate) const R_68K_32: u32 = 1;
pub(crate) const R_E2K_32_ABS: u32 = 2;
pub(crate) const R_AMDGPU_ABS32: u32 = 6;

/// Returns the 32-bit absolute relocation types valid for DWARF offsets on
/// the given machine. Anything else found on a debug section is fatal.
fn accepted_reloc_types(e_machine: u16) -> Option<&'static [u32]> {
    Some(match e_machine {
        object::elf::EM_SPARC | object::elf::EM_SPARC32PLUS | object::elf::EM_SPARCV9 => {
            &[object::elf::R_SPARC_32, object::elf::R_SPARC_UA32]
        }
        object::elf::EM_386 => &[object::elf::R_386_32],
        object::elf::EM_PPC | object::elf::EM_PPC64 => {
            &[object::elf::R_PPC_ADDR32, object::elf::R_PPC_UADDR32]
        }
        object::elf::EM_S390 => &[object::elf::R_390_32],
        object::elf::EM_PARISC => &[R_PARISC_DIR32],
        object::elf::EM_IA_64 => &[R_IA64_SECREL32LSB],
        object::elf::EM_X86_64 => &[object::elf::R_X86_64_32],
        EM_ALPHA => &[R_ALPHA_REFLONG],
        object::elf::EM_AARCH64 => &[object::elf::R_AARCH64_ABS32],
        object::elf::EM_68K => &[R_68K_32],
        object::elf::EM_RISCV => &[object::elf::R_RISCV_32],
        EM_MCST_ELBRUS => &[R_E2K_32_ABS],
        object::elf::EM_LOONGARCH => &[object::elf::R_LARCH_32],
        EM_AMDGPU => &[R_AMDGPU_ABS32],
        _ => return None,
    })
}

/// One relocation entry in raw form, normalized across REL/RELA and both
/// ELF classes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawReloc {
    pub(crate) r_offset: u64,
    pub(crate) r_sym: u32,
    pub(crate) r_type: u32,
    pub(crate) r_addend: i64,
}

pub(crate) fn read_raw_reloc(
    class: Class,
    endian: Endianness,
    sh_type: u32,
    data: &[u8],
    ndx: usize,
    entsize: usize,
) -> Result<RawReloc> {
    let base = ndx * entsize;
    let is_rela = sh_type == object::elf::SHT_RELA;
    match class {
        Class::Elf32 => {
            let r_info = bytes::read_u32_at(endian, data, base + 4)?;
            Ok(RawReloc {
                r_offset: bytes::read_u32_at(endian, data, base)?.into(),
                r_sym: r_info >> 8,
                r_type: r_info & 0xff,
                r_addend: if is_rela {
                    bytes::read_u32_at(endian, data, base + 8)? as i32 as i64
                } else {
                    0
                },
            })
        }
        Class::Elf64 => {
            let r_info = bytes::read_u64_at(endian, data, base + 8)?;
            Ok(RawReloc {
                r_offset: bytes::read_u64_at(endian, data, base)?,
                r_sym: (r_info >> 32) as u32,
                r_type: r_info as u32,
                r_addend: if is_rela {
                    bytes::read_u64_at(endian, data, base + 16)? as i64
                } else {
                    0
                },
            })
        }
    }
}

pub(crate) fn write_r_offset(
    class: Class,
    endian: Endianness,
    data: &mut [u8],
    ndx: usize,
    entsize: usize,
    value: u64,
) {
    let base = ndx * entsize;
    match class {
        Class::Elf32 => bytes::write_u32_at(endian, data, base, value as u32),
        Class::Elf64 => bytes::write_u64_at(endian, data, base, value),
    }
}

pub(crate) fn write_r_addend(
    class: Class,
    endian: Endianness,
    data: &mut [u8],
    ndx: usize,
    entsize: usize,
    value: i64,
) {
    let base = ndx * entsize;
    match class {
        Class::Elf32 => bytes::write_u32_at(endian, data, base + 8, value as u32),
        Class::Elf64 => bytes::write_u64_at(endian, data, base + 16, value as u64),
    }
}

fn read_sym(
    class: Class,
    endian: Endianness,
    symdata: &[u8],
    ndx: usize,
) -> Result<(u64, u16)> {
    match class {
        Class::Elf32 => {
            let base = ndx * 16;
            Ok((
                bytes::read_u32_at(endian, symdata, base + 4)?.into(),
                bytes::read_u16_at(endian, symdata, base + 14)?,
            ))
        }
        Class::Elf64 => {
            let base = ndx * 24;
            Ok((
                bytes::read_u64_at(endian, symdata, base + 8)?,
                bytes::read_u16_at(endian, symdata, base + 6)?,
            ))
        }
    }
}

/// A relocation retained for the read/write protocol: its site within the
/// target section, its resolved addend and where it came from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RelEntry {
    pub(crate) offset: u64,
    pub(crate) addend: u32,
    pub(crate) sym_value: u64,
    pub(crate) ndx: usize,
}

#[derive(Debug)]
pub(crate) struct RelocIndex {
    pub(crate) relsec: usize,
    pub(crate) sh_type: u32,
    pub(crate) entries: Vec<RelEntry>,
    pub(crate) dirty: bool,
    last_read: Option<(usize, Option<usize>)>,
}

impl RelocIndex {
    /// Builds the index from the relocation section associated with a debug
    /// section. Only relocations whose symbol points at one of the sections
    /// in `allowed` are retained; those must use the machine's 32-bit
    /// absolute relocation type.
    pub(crate) fn build(
        elf: &LoadedElf,
        relsec: usize,
        reloc_data: &[u8],
        target_addr: u64,
        target_name: &[u8],
        allowed: &[usize],
    ) -> Result<Option<RelocIndex>> {
        let meta = &elf.sections[relsec];
        let sh_type = meta.sh_type;
        let entsize = usize::try_from(meta.sh_entsize)?;
        if entsize == 0 {
            bail!("Relocation section {relsec} has zero sh_entsize");
        }
        let count = reloc_data.len() / entsize;
        let symdata = elf.section_data(meta.sh_link as usize)?;

        let mut entries = Vec::with_capacity(count);
        for ndx in 0..count {
            let raw = read_raw_reloc(elf.class, elf.endian, sh_type, reloc_data, ndx, entsize)?;
            let (sym_value, st_shndx) = read_sym(elf.class, elf.endian, symdata, raw.r_sym as usize)
                .with_context(|| format!("Bad symbol index {} in relocation {ndx}", raw.r_sym))?;
            // Relocations against section symbols are uninteresting in REL.
            if sh_type == object::elf::SHT_REL && sym_value == 0 {
                continue;
            }
            // Only consider relocations against .debug_str, .debug_str_offsets,
            // .debug_line, .debug_line_str, .debug_macro and .debug_abbrev.
            if st_shndx == 0 || !allowed.contains(&usize::from(st_shndx)) {
                continue;
            }
            let Some(accepted) = accepted_reloc_types(elf.e_machine) else {
                bail!(
                    "Unhandled relocation {} at [{ndx}] for {} section (machine {})",
                    raw.r_type,
                    String::from_utf8_lossy(target_name),
                    elf.e_machine
                );
            };
            if !accepted.contains(&raw.r_type) {
                bail!(
                    "Unhandled relocation {} at [{ndx}] for {} section",
                    raw.r_type,
                    String::from_utf8_lossy(target_name)
                );
            }
            entries.push(RelEntry {
                offset: raw.r_offset.wrapping_sub(target_addr),
                addend: (raw.r_addend.wrapping_add(sym_value as i64)) as u32,
                sym_value,
                ndx,
            });
        }

        if entries.is_empty() {
            return Ok(None);
        }
        entries.sort_by_key(|entry| entry.offset);
        Ok(Some(RelocIndex {
            relsec,
            sh_type,
            entries,
            dirty: false,
            last_read: None,
        }))
    }

    fn find(&self, offset: usize) -> Option<usize> {
        self.entries
            .binary_search_by_key(&(offset as u64), |entry| entry.offset)
            .ok()
    }

    /// Reads the 32-bit word at `offset`, substituting the relocation's value
    /// when one covers exactly that site. Records the site so the next
    /// `write_u32` can target the right destination.
    pub(crate) fn read_u32(
        &mut self,
        endian: Endianness,
        data: &[u8],
        offset: usize,
    ) -> Result<u32> {
        let raw = bytes::read_u32_at(endian, data, offset)?;
        let found = self.find(offset);
        let value = match found {
            Some(i) => {
                if self.sh_type == object::elf::SHT_REL {
                    raw.wrapping_add(self.entries[i].addend)
                } else {
                    self.entries[i].addend
                }
            }
            None => raw,
        };
        self.last_read = Some((offset, found));
        Ok(value)
    }

    /// Writes `value` at the site of the immediately preceding `read_u32`:
    /// into the RELA addend, or into the section bytes for REL and
    /// unrelocated words.
    pub(crate) fn write_u32(
        &mut self,
        endian: Endianness,
        data: &mut [u8],
        offset: usize,
        value: u32,
    ) {
        let last = self.last_read.take();
        debug_assert_eq!(
            last.map(|(off, _)| off),
            Some(offset),
            "relocated write must follow a read of the same site"
        );
        match last.and_then(|(_, found)| found) {
            Some(i) => {
                if self.sh_type == object::elf::SHT_REL {
                    bytes::write_u32_at(endian, data, offset, value.wrapping_sub(self.entries[i].addend));
                } else {
                    self.entries[i].addend = value;
                    self.dirty = true;
                }
            }
            None => bytes::write_u32_at(endian, data, offset, value),
        }
    }

    /// Writes the updated addends back into a copy of the relocation section
    /// bytes. Only meaningful for RELA; REL edits went into the section
    /// literal.
    pub(crate) fn commit(
        &self,
        class: Class,
        endian: Endianness,
        entsize: usize,
        reloc_data: &mut [u8],
    ) {
        for entry in &self.entries {
            let addend = i64::from(entry.addend).wrapping_sub(entry.sym_value as i64);
            write_r_addend(class, endian, reloc_data, entry.ndx, entsize, addend);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_reloc_round_trip_elf64_rela() {
        let endian = Endianness::Little;
        let mut data = vec![0u8; 48];
        bytes::write_u64_at(endian, &mut data, 0, 0x30);
        bytes::write_u64_at(endian, &mut data, 8, (5u64 << 32) | u64::from(object::elf::R_X86_64_32));
        bytes::write_u64_at(endian, &mut data, 16, 0x1234);

        let raw = read_raw_reloc(Class::Elf64, endian, object::elf::SHT_RELA, &data, 0, 24).unwrap();
        assert_eq!(raw.r_offset, 0x30);
        assert_eq!(raw.r_sym, 5);
        assert_eq!(raw.r_type, object::elf::R_X86_64_32);
        assert_eq!(raw.r_addend, 0x1234);

        write_r_offset(Class::Elf64, endian, &mut data, 0, 24, 0x40);
        write_r_addend(Class::Elf64, endian, &mut data, 0, 24, -8);
        let raw = read_raw_reloc(Class::Elf64, endian, object::elf::SHT_RELA, &data, 0, 24).unwrap();
        assert_eq!(raw.r_offset, 0x40);
        assert_eq!(raw.r_addend, -8);
    }

    #[test]
    fn raw_reloc_elf32_rel_has_no_addend() {
        let endian = Endianness::Big;
        let mut data = vec![0u8; 8];
        bytes::write_u32_at(endian, &mut data, 0, 0x10);
        bytes::write_u32_at(endian, &mut data, 4, (7 << 8) | object::elf::R_386_32);
        let raw = read_raw_reloc(Class::Elf32, endian, object::elf::SHT_REL, &data, 0, 8).unwrap();
        assert_eq!(raw.r_offset, 0x10);
        assert_eq!(raw.r_sym, 7);
        assert_eq!(raw.r_type, object::elf::R_386_32);
        assert_eq!(raw.r_addend, 0);
    }

    fn index_with(entries: Vec<RelEntry>, sh_type: u32) -> RelocIndex {
        RelocIndex {
            relsec: 1,
            sh_type,
            entries,
            dirty: false,
            last_read: None,
        }
    }

    #[test]
    fn rela_write_goes_to_addend() {
        let endian = Endianness::Little;
        let mut data = vec![0u8; 8];
        let mut index = index_with(
            vec![RelEntry {
                offset: 4,
                addend: 0x100,
                sym_value: 0,
                ndx: 0,
            }],
            object::elf::SHT_RELA,
        );

        assert_eq!(index.read_u32(endian, &data, 4).unwrap(), 0x100);
        index.write_u32(endian, &mut data, 4, 0x180);
        assert_eq!(index.entries[0].addend, 0x180);
        assert!(index.dirty);
        // The literal bytes stay zero; the link editor applies the addend.
        assert_eq!(bytes::read_u32_at(endian, &data, 4).unwrap(), 0);
    }

    #[test]
    fn rel_write_goes_to_section_bytes() {
        let endian = Endianness::Little;
        let mut data = vec![0u8; 8];
        bytes::write_u32_at(endian, &mut data, 0, 0x40);
        let mut index = index_with(
            vec![RelEntry {
                offset: 0,
                addend: 0x10,
                sym_value: 0,
                ndx: 0,
            }],
            object::elf::SHT_REL,
        );

        assert_eq!(index.read_u32(endian, &data, 0).unwrap(), 0x50);
        index.write_u32(endian, &mut data, 0, 0x60);
        assert!(!index.dirty);
        assert_eq!(bytes::read_u32_at(endian, &data, 0).unwrap(), 0x50);
        assert_eq!(index.read_u32(endian, &data, 0).unwrap(), 0x60);
    }

    #[test]
    fn unrelocated_site_writes_literal() {
        let endian = Endianness::Little;
        let mut data = vec![0u8; 8];
        let mut index = index_with(
            vec![RelEntry {
                offset: 4,
                addend: 0,
                sym_value: 0,
                ndx: 0,
            }],
            object::elf::SHT_RELA,
        );
        assert_eq!(index.read_u32(endian, &data, 0).unwrap(), 0);
        index.write_u32(endian, &mut data, 0, 0xdead);
        assert_eq!(bytes::read_u32_at(endian, &data, 0).unwrap(), 0xdead);
    }

    #[test]
    fn commit_writes_addend_minus_symbol_value() {
        let endian = Endianness::Little;
        let mut reloc_data = vec![0u8; 24];
        let index = index_with(
            vec![RelEntry {
                offset: 0,
                addend: 0x80,
                sym_value: 0x20,
                ndx: 0,
            }],
            object::elf::SHT_RELA,
        );
        index.commit(Class::Elf64, endian, 24, &mut reloc_data);
        let raw =
            read_raw_reloc(Class::Elf64, endian, object::elf::SHT_RELA, &reloc_data, 0, 24).unwrap();
        assert_eq!(raw.r_addend, 0x60);
    }
}
