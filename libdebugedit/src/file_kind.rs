//! Code for identifying what sort of file we're dealing with based on the
//! bytes of the file.

use crate::bail;
use crate::error::Result;
use object::Endianness;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum FileKind {
    Elf32(Endianness),
    Elf64(Endianness),
}

impl FileKind {
    pub(crate) fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if !bytes.starts_with(&object::elf::ELFMAG) {
            bail!("Not an ELF file");
        }
        if bytes.len() < 16 {
            bail!("Invalid ELF file");
        }
        let endian = match bytes[EI_DATA] {
            object::elf::ELFDATA2LSB => Endianness::Little,
            object::elf::ELFDATA2MSB => Endianness::Big,
            other => bail!("Wrong ELF data encoding {other}"),
        };
        match bytes[EI_CLASS] {
            object::elf::ELFCLASS32 => Ok(FileKind::Elf32(endian)),
            object::elf::ELFCLASS64 => Ok(FileKind::Elf64(endian)),
            other => bail!("Wrong ELF class {other}"),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifies_class_and_endianness() {
        let mut bytes = [0u8; 64];
        bytes[..4].copy_from_slice(&object::elf::ELFMAG);
        bytes[EI_CLASS] = object::elf::ELFCLASS64;
        bytes[EI_DATA] = object::elf::ELFDATA2LSB;
        assert_eq!(
            FileKind::identify_bytes(&bytes).unwrap(),
            FileKind::Elf64(Endianness::Little)
        );

        bytes[EI_CLASS] = object::elf::ELFCLASS32;
        bytes[EI_DATA] = object::elf::ELFDATA2MSB;
        assert_eq!(
            FileKind::identify_bytes(&bytes).unwrap(),
            FileKind::Elf32(Endianness::Big)
        );
    }

    #[test]
    fn rejects_non_elf_input() {
        assert!(FileKind::identify_bytes(b"!<arch>\n").is_err());
        assert!(FileKind::identify_bytes(b"hello world").is_err());
    }
}
