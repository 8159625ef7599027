//! Low-level access to the ELF file being edited. The file is read into
//! memory once and parsed into class-independent metadata, so the rest of the
//! editor doesn't need to be generic over ELF32/ELF64. All byte offsets in
//! `SectionMeta` refer to the original file image.

use crate::bail;
use crate::bytes;
use crate::error::Context as _;
use crate::error::Result;
use crate::file_kind::FileKind;
use object::read::elf::CompressionHeader as _;
use object::read::elf::FileHeader;
use object::read::elf::ProgramHeader as _;
use object::read::elf::SectionHeader as _;
use object::Endianness;
use std::io::Read as _;
use std::io::Write as _;

/// MIPS tags all its `.debug_*` sections with this processor-specific type.
pub(crate) const SHT_MIPS_DWARF: u32 = 0x7000_001e;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Class {
    Elf32,
    Elf64,
}

impl Class {
    pub(crate) fn shdr_entsize(self) -> u64 {
        match self {
            Class::Elf32 => 40,
            Class::Elf64 => 64,
        }
    }

    /// Size of an `sh_offset`-style file offset, used to align the section
    /// header table.
    pub(crate) fn offset_size(self) -> u64 {
        match self {
            Class::Elf32 => 4,
            Class::Elf64 => 8,
        }
    }
}

/// A program header, normalized to 64-bit field widths.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Phdr {
    pub(crate) p_type: u32,
    pub(crate) p_flags: u32,
    pub(crate) p_offset: u64,
    pub(crate) p_vaddr: u64,
    pub(crate) p_paddr: u64,
    pub(crate) p_filesz: u64,
    pub(crate) p_memsz: u64,
    pub(crate) p_align: u64,
}

/// Compression metadata recorded when a section carries `SHF_COMPRESSED`, so
/// the same algorithm can be reapplied on write.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Compression {
    pub(crate) ch_type: u32,
    pub(crate) ch_size: u64,
    pub(crate) ch_addralign: u64,
    pub(crate) header_size: usize,
}

/// A section header, normalized to 64-bit field widths.
#[derive(Debug, Clone)]
pub(crate) struct SectionMeta {
    pub(crate) name: Vec<u8>,
    pub(crate) sh_name: u32,
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) sh_addr: u64,
    pub(crate) sh_offset: u64,
    pub(crate) sh_size: u64,
    pub(crate) sh_link: u32,
    pub(crate) sh_info: u32,
    pub(crate) sh_addralign: u64,
    pub(crate) sh_entsize: u64,
    pub(crate) compression: Option<Compression>,
}

impl SectionMeta {
    pub(crate) fn is_alloc(&self) -> bool {
        self.sh_flags & u64::from(object::elf::SHF_ALLOC) != 0
    }
}

pub(crate) struct LoadedElf {
    pub(crate) data: Vec<u8>,
    pub(crate) class: Class,
    pub(crate) endian: Endianness,
    pub(crate) e_type: u16,
    pub(crate) e_machine: u16,
    pub(crate) e_version: u32,
    pub(crate) e_entry: u64,
    pub(crate) e_phoff: u64,
    pub(crate) e_shoff: u64,
    pub(crate) e_flags: u32,
    pub(crate) e_ehsize: u16,
    pub(crate) e_phentsize: u16,
    pub(crate) e_shentsize: u16,
    pub(crate) e_phnum_raw: u16,
    pub(crate) e_shnum_raw: u16,
    pub(crate) e_shstrndx_raw: u16,
    pub(crate) ident: [u8; 16],
    pub(crate) phdrs: Vec<Phdr>,
    pub(crate) sections: Vec<SectionMeta>,
}

impl LoadedElf {
    pub(crate) fn parse(data: Vec<u8>) -> Result<LoadedElf> {
        let kind = FileKind::identify_bytes(&data)?;
        let mut elf = match kind {
            FileKind::Elf32(_) => {
                parse_headers::<object::elf::FileHeader32<Endianness>>(&data, Class::Elf32)?
            }
            FileKind::Elf64(_) => {
                parse_headers::<object::elf::FileHeader64<Endianness>>(&data, Class::Elf64)?
            }
        };
        elf.data = data;
        match elf.e_type {
            object::elf::ET_REL | object::elf::ET_EXEC | object::elf::ET_DYN => {}
            other => bail!("Not a relocatable object, executable or shared library (e_type {other})"),
        }
        Ok(elf)
    }

    /// Returns the raw bytes of a section in the original file image. For
    /// compressed sections this includes the compression header.
    pub(crate) fn section_data(&self, shndx: usize) -> Result<&[u8]> {
        let meta = self
            .sections
            .get(shndx)
            .with_context(|| format!("Section index {shndx} out of range"))?;
        if meta.sh_type == object::elf::SHT_NOBITS || meta.sh_type == object::elf::SHT_NULL {
            return Ok(&[]);
        }
        let start = usize::try_from(meta.sh_offset)?;
        let size = usize::try_from(meta.sh_size)?;
        self.data
            .get(start..start + size)
            .with_context(|| format!("Section {shndx} extends past end of file"))
    }

    /// Returns the section payload with any `SHF_COMPRESSED` wrapping removed.
    pub(crate) fn section_payload(&self, shndx: usize) -> Result<Vec<u8>> {
        let raw = self.section_data(shndx)?;
        let meta = &self.sections[shndx];
        let Some(compression) = meta.compression else {
            return Ok(raw.to_vec());
        };
        let input = raw
            .get(compression.header_size..)
            .context("Compressed section smaller than its compression header")?;
        let mut out = vec![0; usize::try_from(compression.ch_size)?];
        decompress_into(compression.ch_type, input, &mut out)?;
        Ok(out)
    }

    pub(crate) fn has_program_headers(&self) -> bool {
        !self.phdrs.is_empty()
    }
}

fn parse_headers<H: FileHeader<Endian = Endianness>>(
    data: &[u8],
    class: Class,
) -> Result<LoadedElf> {
    let header = H::parse(data).context("Invalid ELF header")?;
    let endian = header.endian().context("Invalid ELF endianness")?;
    let section_headers = header
        .section_headers(endian, data)
        .context("Invalid ELF section headers")?;
    let shstrndx = header
        .shstrndx(endian, data)
        .context("Invalid ELF section string table index")? as usize;
    let shstrtab = match section_headers.get(shstrndx) {
        Some(shdr) => shdr
            .data(endian, data)
            .context("Invalid section name string table")?,
        None => &[],
    };

    let mut sections = Vec::with_capacity(section_headers.len());
    for shdr in section_headers {
        let sh_name = shdr.sh_name(endian);
        let name = bytes::read_cstr(shstrtab, sh_name as usize)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        let sh_flags: u64 = shdr.sh_flags(endian).into();
        let compression = if sh_flags & u64::from(object::elf::SHF_COMPRESSED) != 0 {
            let (chdr, _, _) = shdr
                .compression(endian, data)
                .context("Invalid compression header")?
                .context("SHF_COMPRESSED section without compression header")?;
            Some(Compression {
                ch_type: chdr.ch_type(endian),
                ch_size: chdr.ch_size(endian).into(),
                ch_addralign: chdr.ch_addralign(endian).into(),
                header_size: size_of::<H::CompressionHeader>(),
            })
        } else {
            None
        };
        sections.push(SectionMeta {
            name,
            sh_name,
            sh_type: shdr.sh_type(endian),
            sh_flags,
            sh_addr: shdr.sh_addr(endian).into(),
            sh_offset: shdr.sh_offset(endian).into(),
            sh_size: shdr.sh_size(endian).into(),
            sh_link: shdr.sh_link(endian),
            sh_info: shdr.sh_info(endian),
            sh_addralign: shdr.sh_addralign(endian).into(),
            sh_entsize: shdr.sh_entsize(endian).into(),
            compression,
        });
    }

    let phdrs = header
        .program_headers(endian, data)
        .context("Invalid ELF program headers")?
        .iter()
        .map(|phdr| Phdr {
            p_type: phdr.p_type(endian),
            p_flags: phdr.p_flags(endian),
            p_offset: phdr.p_offset(endian).into(),
            p_vaddr: phdr.p_vaddr(endian).into(),
            p_paddr: phdr.p_paddr(endian).into(),
            p_filesz: phdr.p_filesz(endian).into(),
            p_memsz: phdr.p_memsz(endian).into(),
            p_align: phdr.p_align(endian).into(),
        })
        .collect();

    let mut ident = [0u8; 16];
    ident.copy_from_slice(&data[..16]);

    Ok(LoadedElf {
        data: Vec::new(),
        class,
        endian,
        e_type: header.e_type(endian),
        e_machine: header.e_machine(endian),
        e_version: header.e_version(endian),
        e_entry: header.e_entry(endian).into(),
        e_phoff: header.e_phoff(endian).into(),
        e_shoff: header.e_shoff(endian).into(),
        e_flags: header.e_flags(endian),
        e_ehsize: header.e_ehsize(endian),
        e_phentsize: header.e_phentsize(endian),
        e_shentsize: header.e_shentsize(endian),
        e_phnum_raw: header.e_phnum(endian),
        e_shnum_raw: header.e_shnum(endian),
        e_shstrndx_raw: header.e_shstrndx(endian),
        ident,
        phdrs,
        sections,
    })
}

fn decompress_into(ch_type: u32, input: &[u8], out: &mut [u8]) -> Result {
    match ch_type {
        object::elf::ELFCOMPRESS_ZLIB => {
            flate2::Decompress::new(true).decompress(
                input,
                out,
                flate2::FlushDecompress::Finish,
            )?;
        }
        object::elf::ELFCOMPRESS_ZSTD => {
            zstd::stream::Decoder::new(input)?.read_exact(out)?;
        }
        c => bail!("Unsupported compression format: {c}"),
    }
    Ok(())
}

/// Rewraps freshly written section bytes with the compression algorithm the
/// section originally used.
pub(crate) fn recompress(
    class: Class,
    endian: Endianness,
    compression: Compression,
    data: &[u8],
) -> Result<Vec<u8>> {
    let payload = match compression.ch_type {
        object::elf::ELFCOMPRESS_ZLIB => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data)?;
            encoder.finish()?
        }
        object::elf::ELFCOMPRESS_ZSTD => zstd::stream::encode_all(data, 0)?,
        c => bail!("Unsupported compression format: {c}"),
    };

    let mut out = Vec::with_capacity(compression.header_size + payload.len());
    let e = endian;
    match class {
        Class::Elf32 => {
            out.extend_from_slice(&object::Endian::write_u32_bytes(e, compression.ch_type));
            out.extend_from_slice(&object::Endian::write_u32_bytes(e, data.len() as u32));
            out.extend_from_slice(&object::Endian::write_u32_bytes(
                e,
                compression.ch_addralign as u32,
            ));
        }
        Class::Elf64 => {
            out.extend_from_slice(&object::Endian::write_u32_bytes(e, compression.ch_type));
            out.extend_from_slice(&object::Endian::write_u32_bytes(e, 0));
            out.extend_from_slice(&object::Endian::write_u64_bytes(e, data.len() as u64));
            out.extend_from_slice(&object::Endian::write_u64_bytes(e, compression.ch_addralign));
        }
    }
    out.extend_from_slice(&payload);
    Ok(out)
}
