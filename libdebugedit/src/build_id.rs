//! Recomputes the GNU build-id note over the edited file contents.
//!
//! The hash covers a canonicalized view of the file: the ELF header with the
//! program/section header table offsets zeroed, every program header, and
//! every section header (offset zeroed) followed by its contents. Offsets
//! are the only fields ignored because a semantically identical file could
//! be written with a different layout. Headers are always hashed in their
//! 64-bit form, in the file's byte order, so ELF32 and ELF64 are treated
//! consistently. The note descriptor itself is hashed as zeros, which makes
//! the operation idempotent for a given seed.

use crate::bail;
use crate::bytes;
use crate::elf::LoadedElf;
use crate::elf::Phdr;
use crate::elf::SectionMeta;
use crate::elf_writer::FileImage;
use crate::error::Result;
use object::Endianness;

/// Number of descriptor bytes the hash replaces. Descriptors wider than this
/// keep their tail bytes as extra entropy.
pub(crate) const BUILD_ID_HASH_SIZE: usize = 16;

#[derive(Debug, Clone, Copy)]
pub(crate) struct BuildIdNote {
    pub(crate) shndx: usize,
    /// Offset of the descriptor within the section.
    pub(crate) desc_offset: usize,
    pub(crate) desc_size: usize,
}

/// Finds the `NT_GNU_BUILD_ID` note named "GNU" in the first allocated note
/// section that has one.
pub(crate) fn find_build_id_note(elf: &LoadedElf) -> Result<Option<BuildIdNote>> {
    for (shndx, meta) in elf.sections.iter().enumerate() {
        if meta.sh_type != object::elf::SHT_NOTE || !meta.is_alloc() {
            continue;
        }
        let data = elf.section_data(shndx)?;
        let mut pos = 0;
        while pos + 12 <= data.len() {
            let namesz = bytes::read_u32_at(elf.endian, data, pos)? as usize;
            let descsz = bytes::read_u32_at(elf.endian, data, pos + 4)? as usize;
            let n_type = bytes::read_u32_at(elf.endian, data, pos + 8)?;
            let name_start = pos + 12;
            let desc_start = (name_start + namesz).next_multiple_of(4);
            let desc_end = desc_start + descsz;
            if desc_end > data.len() {
                break;
            }
            if n_type == object::elf::NT_GNU_BUILD_ID
                && namesz == 4
                && data.get(name_start..name_start + 4) == Some(b"GNU\0")
            {
                return Ok(Some(BuildIdNote {
                    shndx,
                    desc_offset: desc_start,
                    desc_size: descsz,
                }));
            }
            pos = desc_end.next_multiple_of(4);
        }
    }
    Ok(None)
}

/// Computes the canonical 128-bit hash of the file image. The seed string, if
/// any, primes the hash.
pub(crate) fn compute(
    elf: &LoadedElf,
    image: &FileImage,
    note: &BuildIdNote,
    seed: Option<&str>,
) -> Result<[u8; BUILD_ID_HASH_SIZE]> {
    if note.desc_size == 0 {
        bail!("Cannot handle 0-byte build ID");
    }
    let endian = elf.endian;
    let mut hasher = blake3::Hasher::new();

    if let Some(seed) = seed {
        hasher.update(seed.as_bytes());
    }

    hasher.update(&canonical_ehdr(elf, endian));
    for phdr in &elf.phdrs {
        hasher.update(&canonical_phdr(phdr, endian));
    }

    for (shndx, meta) in elf.sections.iter().enumerate() {
        hasher.update(&canonical_shdr(meta, image.section_sizes[shndx], endian));
        if meta.sh_type == object::elf::SHT_NOBITS {
            continue;
        }
        let start = usize::try_from(image.section_offsets[shndx])?;
        let size = usize::try_from(image.section_sizes[shndx])?;
        let data = image
            .data
            .get(start..start + size)
            .unwrap_or_default();
        if shndx == note.shndx {
            // Hash the descriptor bytes being recomputed as zeros so the
            // result doesn't depend on the previous build id.
            let zeroed = note.desc_size.min(BUILD_ID_HASH_SIZE);
            hasher.update(&data[..note.desc_offset]);
            hasher.update(&[0u8; BUILD_ID_HASH_SIZE][..zeroed]);
            hasher.update(&data[note.desc_offset + zeroed..]);
        } else {
            hasher.update(data);
        }
    }

    let mut digest = [0u8; BUILD_ID_HASH_SIZE];
    digest.copy_from_slice(&hasher.finalize().as_bytes()[..BUILD_ID_HASH_SIZE]);
    Ok(digest)
}

/// The ELF header in Elf64 layout with `e_phoff` and `e_shoff` zeroed.
fn canonical_ehdr(elf: &LoadedElf, endian: Endianness) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&elf.ident);
    bytes::push_u16(endian, &mut out, elf.e_type);
    bytes::push_u16(endian, &mut out, elf.e_machine);
    bytes::push_u32(endian, &mut out, elf.e_version);
    push_u64(endian, &mut out, elf.e_entry);
    push_u64(endian, &mut out, 0); // e_phoff
    push_u64(endian, &mut out, 0); // e_shoff
    bytes::push_u32(endian, &mut out, elf.e_flags);
    bytes::push_u16(endian, &mut out, elf.e_ehsize);
    bytes::push_u16(endian, &mut out, elf.e_phentsize);
    bytes::push_u16(endian, &mut out, elf.e_phnum_raw);
    bytes::push_u16(endian, &mut out, elf.e_shentsize);
    bytes::push_u16(endian, &mut out, elf.e_shnum_raw);
    bytes::push_u16(endian, &mut out, elf.e_shstrndx_raw);
    out
}

/// A program header in Elf64 layout.
fn canonical_phdr(phdr: &Phdr, endian: Endianness) -> Vec<u8> {
    let mut out = Vec::with_capacity(56);
    bytes::push_u32(endian, &mut out, phdr.p_type);
    bytes::push_u32(endian, &mut out, phdr.p_flags);
    push_u64(endian, &mut out, phdr.p_offset);
    push_u64(endian, &mut out, phdr.p_vaddr);
    push_u64(endian, &mut out, phdr.p_paddr);
    push_u64(endian, &mut out, phdr.p_filesz);
    push_u64(endian, &mut out, phdr.p_memsz);
    push_u64(endian, &mut out, phdr.p_align);
    out
}

/// A section header in Elf64 layout with `sh_offset` zeroed and the section's
/// final size.
fn canonical_shdr(meta: &SectionMeta, size: u64, endian: Endianness) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    bytes::push_u32(endian, &mut out, meta.sh_name);
    bytes::push_u32(endian, &mut out, meta.sh_type);
    push_u64(endian, &mut out, meta.sh_flags);
    push_u64(endian, &mut out, meta.sh_addr);
    push_u64(endian, &mut out, 0); // sh_offset
    push_u64(endian, &mut out, size);
    bytes::push_u32(endian, &mut out, meta.sh_link);
    bytes::push_u32(endian, &mut out, meta.sh_info);
    push_u64(endian, &mut out, meta.sh_addralign);
    push_u64(endian, &mut out, meta.sh_entsize);
    out
}

fn push_u64(endian: Endianness, out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&object::Endian::write_u64_bytes(endian, value));
}

pub(crate) fn format_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf_writer;

    #[test]
    fn hex_formatting_is_lowercase_and_padded() {
        assert_eq!(format_hex(&[0x00, 0x0f, 0xab]), "000fab");
    }

    /// A minimal ELF64 with one allocated note section holding a 20-byte
    /// build-id.
    fn note_elf() -> Vec<u8> {
        let mut note = Vec::new();
        bytes::push_u32(Endianness::Little, &mut note, 4); // namesz
        bytes::push_u32(Endianness::Little, &mut note, 20); // descsz
        bytes::push_u32(Endianness::Little, &mut note, object::elf::NT_GNU_BUILD_ID);
        note.extend_from_slice(b"GNU\0");
        note.extend_from_slice(&[0xaa; 20]);

        let mut out = vec![0u8; 64];
        out[..4].copy_from_slice(&object::elf::ELFMAG);
        out[4] = object::elf::ELFCLASS64;
        out[5] = object::elf::ELFDATA2LSB;
        out[6] = 1;
        let e = Endianness::Little;
        bytes::write_u16_at(e, &mut out, 16, object::elf::ET_EXEC);
        bytes::write_u16_at(e, &mut out, 18, object::elf::EM_X86_64);
        bytes::write_u32_at(e, &mut out, 20, 1);
        bytes::write_u16_at(e, &mut out, 52, 64);
        bytes::write_u16_at(e, &mut out, 58, 64);
        bytes::write_u16_at(e, &mut out, 60, 3); // e_shnum
        bytes::write_u16_at(e, &mut out, 62, 2); // e_shstrndx

        let note_offset = out.len() as u64;
        out.extend_from_slice(&note);
        while out.len() % 8 != 0 {
            out.push(0);
        }
        let shoff = out.len() as u64;
        bytes::write_u64_at(e, &mut out, 40, shoff);

        out.resize(out.len() + 64, 0); // null section header
        let base = out.len();
        out.resize(base + 64, 0);
        bytes::write_u32_at(e, &mut out, base + 4, object::elf::SHT_NOTE);
        bytes::write_u64_at(e, &mut out, base + 8, object::elf::SHF_ALLOC.into());
        bytes::write_u64_at(e, &mut out, base + 24, note_offset);
        bytes::write_u64_at(e, &mut out, base + 32, note.len() as u64);
        bytes::write_u64_at(e, &mut out, base + 48, 4);

        out.resize(out.len() + 64, 0); // empty .shstrtab section header
        out
    }

    #[test]
    fn finds_the_gnu_note() {
        let elf = LoadedElf::parse(note_elf()).unwrap();
        let note = find_build_id_note(&elf).unwrap().unwrap();
        assert_eq!(note.shndx, 1);
        assert_eq!(note.desc_offset, 16);
        assert_eq!(note.desc_size, 20);
    }

    #[test]
    fn same_seed_is_idempotent_different_seeds_diverge() {
        let elf = LoadedElf::parse(note_elf()).unwrap();
        let note = find_build_id_note(&elf).unwrap().unwrap();
        let image = elf_writer::unchanged_image(&elf);

        let first = compute(&elf, &image, &note, Some("abc")).unwrap();
        let second = compute(&elf, &image, &note, Some("abc")).unwrap();
        assert_eq!(first, second);

        let other = compute(&elf, &image, &note, Some("xyz")).unwrap();
        assert_ne!(first, other);

        let unseeded = compute(&elf, &image, &note, None).unwrap();
        assert_ne!(first, unseeded);
    }

    #[test]
    fn digest_ignores_previous_note_contents() {
        // The descriptor bytes being recomputed are hashed as zeros, so the
        // digest must not depend on what the note held before.
        let elf = LoadedElf::parse(note_elf()).unwrap();
        let note = find_build_id_note(&elf).unwrap().unwrap();
        let image = elf_writer::unchanged_image(&elf);
        let digest = compute(&elf, &image, &note, Some("s")).unwrap();

        let mut scribbled = elf_writer::unchanged_image(&elf);
        let start = usize::try_from(scribbled.section_offsets[note.shndx]).unwrap()
            + note.desc_offset;
        scribbled.data[start..start + 16].copy_from_slice(&[0x55; 16]);
        let redone = compute(&elf, &scribbled, &note, Some("s")).unwrap();
        assert_eq!(digest, redone);
    }
}
