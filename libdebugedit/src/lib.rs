//! Rewrites the build-time source-path prefix recorded in an ELF file's DWARF
//! debug info to an install-time prefix, lists the source files the file
//! refers to, and recomputes the GNU build-id note over the edited contents.

use crate::args::Args;
use crate::debug_sections::DebugSectionKind;
use crate::editor::EditOutcome;
use crate::editor::Editor;
use crate::elf::LoadedElf;
use crate::error::warning;
use crate::error::Context as _;
use crate::error::Result;
use crate::source_list::SourceList;
use std::collections::BTreeMap;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub(crate) use anyhow::bail;

mod abbrev;
pub mod args;
mod build_id;
mod bytes;
mod debug_sections;
mod editor;
mod elf;
mod elf_writer;
pub mod error;
mod file_kind;
mod fs;
mod info;
mod line;
mod macros;
mod paths;
mod reloc;
mod source_list;
mod str_offsets;
mod strings;

/// Edits one file according to the parsed arguments.
pub fn run(args: &Args) -> Result {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init();

    let state = fs::stat(&args.file)?;
    // Make sure we can read and write.
    fs::make_readable_writable(&args.file, &state);

    let result = edit_file(args);

    // Restore old access rights, and timestamps if asked to, even if the
    // edit failed part way.
    fs::restore_mode(&args.file, &state);
    if args.preserve_dates {
        fs::restore_times(&args.file, &state);
    }
    result
}

fn edit_file(args: &Args) -> Result {
    let data = std::fs::read(&args.file)
        .with_context(|| format!("Failed to open input file '{}'", args.file.display()))?;
    let elf = LoadedElf::parse(data)
        .with_context(|| format!("'{}'", args.file.display()))?;

    let wants_edit =
        args.base_dir.is_some() || args.dest_dir.is_some() || args.list_file.is_some();

    let outcome = if wants_edit && has_editable_debug_info(&elf) {
        let source_list = match &args.list_file {
            Some(path) => SourceList::create(path)?,
            None => SourceList::disabled(),
        };
        let mut editor = Editor::new(
            &elf,
            args.base_dir.as_ref().map(|dir| dir.clone().into_bytes()),
            args.dest_dir.as_ref().map(|dir| dir.clone().into_bytes()),
            source_list,
        )?;
        editor.edit()?;
        editor.finish()?
    } else {
        EditOutcome {
            replacements: BTreeMap::new(),
        }
    };

    let note = if args.build_id {
        build_id::find_build_id_note(&elf)?
    } else {
        None
    };

    let changed = outcome.changed();
    if !changed && note.is_none() {
        return Ok(());
    }

    let image = if changed {
        let image = elf_writer::write_file(&elf, &outcome.replacements)?;
        std::fs::write(&args.file, &image.data)
            .with_context(|| format!("Failed to write file '{}'", args.file.display()))?;
        tracing::debug!(bytes = image.data.len(), "rewrote file");
        image
    } else {
        elf_writer::unchanged_image(&elf)
    };

    if let Some(note) = note {
        handle_build_id(args, &elf, &image, &note, changed)?;
    }

    Ok(())
}

/// Whether the file carries debug info we know how to walk: a `.debug_info`
/// progbits section (or the MIPS-typed equivalent). Stabs is not supported.
fn has_editable_debug_info(elf: &LoadedElf) -> bool {
    let mips = matches!(
        elf.e_machine,
        object::elf::EM_MIPS | object::elf::EM_MIPS_RS3_LE
    );
    let mut found = false;
    for meta in &elf.sections {
        let recognized_type = meta.sh_type == object::elf::SHT_PROGBITS
            || (mips && meta.sh_type == crate::elf::SHT_MIPS_DWARF);
        if !recognized_type {
            continue;
        }
        if meta.name == b".stab" {
            warning("Stabs debuginfo not supported");
            continue;
        }
        if meta.name == DebugSectionKind::Info.name().as_bytes() {
            found = true;
        }
    }
    found
}

/// Recomputes (unless told not to) and prints the build-id note. The digest
/// goes back into the file with a short write of just the descriptor bytes;
/// the full image was already written.
fn handle_build_id(
    args: &Args,
    elf: &LoadedElf,
    image: &elf_writer::FileImage,
    note: &build_id::BuildIdNote,
    changed: bool,
) -> Result {
    if note.desc_size == 0 {
        bail!("Cannot handle 0-byte build ID");
    }
    let desc_file_offset = usize::try_from(image.section_offsets[note.shndx])? + note.desc_offset;
    let mut desc = image
        .data
        .get(desc_file_offset..desc_file_offset + note.desc_size)
        .context("Build-id note extends past end of file")?
        .to_vec();

    let recompute = !args.no_recompute_build_id && (changed || args.build_id_seed.is_some());
    if recompute {
        let digest = build_id::compute(elf, image, note, args.build_id_seed.as_deref())?;
        let used = note.desc_size.min(digest.len());
        desc[..used].copy_from_slice(&digest[..used]);

        use std::os::unix::fs::FileExt as _;
        let file = std::fs::File::options()
            .write(true)
            .open(&args.file)
            .with_context(|| format!("Failed to open input file '{}'", args.file.display()))?;
        file.write_at(&desc, desc_file_offset as u64)
            .with_context(|| format!("Failed to write file '{}'", args.file.display()))?;
    }

    println!("{}", build_id::format_hex(&desc));
    Ok(())
}
