//! Serializes the edited file. When the ELF has program headers we own the
//! layout: allocated sections must stay at their file offsets or the
//! segments would break, so only the unallocated (debug) sections are
//! repacked behind the highest allocated offset, with the section header
//! table after them. Files without program headers (relocatable objects) are
//! laid out from scratch in section order.

use crate::bail;
use crate::bytes;
use crate::elf::Class;
use crate::elf::LoadedElf;
use crate::error::Result;
use object::Endianness;
use std::collections::BTreeMap;

/// The final byte image of the file plus where every section ended up.
pub(crate) struct FileImage {
    pub(crate) data: Vec<u8>,
    pub(crate) section_offsets: Vec<u64>,
    pub(crate) section_sizes: Vec<u64>,
}

/// The image of a file nothing was rewritten in.
pub(crate) fn unchanged_image(elf: &LoadedElf) -> FileImage {
    FileImage {
        data: elf.data.clone(),
        section_offsets: elf.sections.iter().map(|meta| meta.sh_offset).collect(),
        section_sizes: elf.sections.iter().map(|meta| meta.sh_size).collect(),
    }
}

pub(crate) fn write_file(
    elf: &LoadedElf,
    replacements: &BTreeMap<usize, Vec<u8>>,
) -> Result<FileImage> {
    let endian = elf.endian;
    let shnum = elf.sections.len();
    let shentsize = elf.class.shdr_entsize();

    let mut sizes: Vec<u64> = elf.sections.iter().map(|meta| meta.sh_size).collect();
    for (&shndx, data) in replacements {
        sizes[shndx] = data.len() as u64;
    }
    let mut offsets: Vec<u64> = elf.sections.iter().map(|meta| meta.sh_offset).collect();

    let mut last_offset;
    if elf.has_program_headers() {
        // Everything is positioned after the program headers. Allocated
        // sections keep their offsets; find the last one.
        last_offset =
            elf.e_phoff + u64::from(elf.e_phnum_raw) * u64::from(elf.e_phentsize);
        for meta in elf.sections.iter().skip(1) {
            if meta.is_alloc() {
                let end = meta.sh_offset
                    + if meta.sh_type != object::elf::SHT_NOBITS {
                        meta.sh_size
                    } else {
                        0
                    };
                last_offset = last_offset.max(end);
            }
        }
        for (shndx, meta) in elf.sections.iter().enumerate().skip(1) {
            if meta.is_alloc() || meta.sh_type == object::elf::SHT_NULL {
                continue;
            }
            let addralign = meta.sh_addralign.max(1);
            last_offset = last_offset.next_multiple_of(addralign);
            offsets[shndx] = last_offset;
            if meta.sh_type != object::elf::SHT_NOBITS {
                last_offset += sizes[shndx];
            }
        }
    } else {
        last_offset = u64::from(elf.e_ehsize);
        for (shndx, meta) in elf.sections.iter().enumerate().skip(1) {
            if meta.sh_type == object::elf::SHT_NULL {
                continue;
            }
            let addralign = meta.sh_addralign.max(1);
            last_offset = last_offset.next_multiple_of(addralign);
            offsets[shndx] = last_offset;
            if meta.sh_type != object::elf::SHT_NOBITS {
                last_offset += sizes[shndx];
            }
        }
    }

    let e_shoff = last_offset.next_multiple_of(elf.class.offset_size());
    let total = usize::try_from(e_shoff + shnum as u64 * shentsize)?;
    let mut out = vec![0u8; total];

    // ELF header, with the section header table re-pointed.
    let ehdr_len = usize::from(elf.e_ehsize);
    let Some(ehdr) = elf.data.get(..ehdr_len) else {
        bail!("ELF header extends past end of file");
    };
    out[..ehdr_len].copy_from_slice(ehdr);
    match elf.class {
        Class::Elf32 => bytes::write_u32_at(endian, &mut out, 32, e_shoff as u32),
        Class::Elf64 => bytes::write_u64_at(endian, &mut out, 40, e_shoff),
    }

    if elf.has_program_headers() {
        let phoff = usize::try_from(elf.e_phoff)?;
        let phsize = usize::from(elf.e_phnum_raw) * usize::from(elf.e_phentsize);
        let Some(phdrs) = elf.data.get(phoff..phoff + phsize) else {
            bail!("Program headers extend past end of file");
        };
        out[phoff..phoff + phsize].copy_from_slice(phdrs);
    }

    for (shndx, meta) in elf.sections.iter().enumerate().skip(1) {
        if meta.sh_type == object::elf::SHT_NULL || meta.sh_type == object::elf::SHT_NOBITS {
            continue;
        }
        let start = usize::try_from(offsets[shndx])?;
        match replacements.get(&shndx) {
            Some(data) => out[start..start + data.len()].copy_from_slice(data),
            None => {
                let data = elf.section_data(shndx)?;
                out[start..start + data.len()].copy_from_slice(data);
            }
        }
    }

    // Section header table: the original entries with offset and size fixed
    // up.
    let orig_shoff = usize::try_from(elf.e_shoff)?;
    let entsize = usize::try_from(shentsize)?;
    for shndx in 0..shnum {
        let src = elf
            .data
            .get(orig_shoff + shndx * entsize..orig_shoff + (shndx + 1) * entsize)
            .unwrap_or_default();
        let dst_start = usize::try_from(e_shoff)? + shndx * entsize;
        let dst = &mut out[dst_start..dst_start + entsize];
        if src.len() == entsize {
            dst.copy_from_slice(src);
        } else {
            bail!("Section header table extends past end of file");
        }
        if shndx == 0 {
            continue;
        }
        patch_shdr(elf.class, endian, dst, offsets[shndx], sizes[shndx]);
    }

    Ok(FileImage {
        data: out,
        section_offsets: offsets,
        section_sizes: sizes,
    })
}

fn patch_shdr(class: Class, endian: Endianness, shdr: &mut [u8], offset: u64, size: u64) {
    match class {
        Class::Elf32 => {
            bytes::write_u32_at(endian, shdr, 16, offset as u32);
            bytes::write_u32_at(endian, shdr, 20, size as u32);
        }
        Class::Elf64 => {
            bytes::write_u64_at(endian, shdr, 24, offset);
            bytes::write_u64_at(endian, shdr, 32, size);
        }
    }
}
