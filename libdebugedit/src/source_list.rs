//! The sources-list output: a flat file of null-terminated byte strings
//! naming every source file a binary refers to. Compilation directories get a
//! trailing `/` so downstream tooling can tell them apart from regular files.

use crate::error::Context as _;
use crate::error::Result;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

pub(crate) struct SourceList {
    out: Option<(PathBuf, BufWriter<std::fs::File>)>,
}

impl SourceList {
    pub(crate) fn disabled() -> SourceList {
        SourceList { out: None }
    }

    pub(crate) fn create(path: &Path) -> Result<SourceList> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Could not open '{}'", path.display()))?;
        Ok(SourceList {
            out: Some((path.to_owned(), BufWriter::new(file))),
        })
    }

    pub(crate) fn is_active(&self) -> bool {
        self.out.is_some()
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some((path, writer)) = &mut self.out {
            writer
                .write_all(bytes)
                .with_context(|| format!("Could not write to '{}'", path.display()))?;
        }
        Ok(())
    }

    /// Appends one null-terminated source file path.
    pub(crate) fn write_file(&mut self, path: &[u8]) -> Result<()> {
        if self.out.is_none() {
            return Ok(());
        }
        self.write_all(path)?;
        self.write_all(b"\0")
    }

    /// Appends a compilation directory, with a trailing `/` before the null
    /// terminator unless the path already ends in one.
    pub(crate) fn write_comp_dir(&mut self, dir: &[u8]) -> Result<()> {
        if self.out.is_none() || dir.is_empty() {
            return Ok(());
        }
        self.write_all(dir)?;
        if dir.last() != Some(&b'/') {
            self.write_all(b"/\0")
        } else {
            self.write_all(b"\0")
        }
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        if let Some((path, writer)) = &mut self.out {
            writer
                .flush()
                .with_context(|| format!("Could not write to '{}'", path.display()))?;
        }
        Ok(())
    }
}
