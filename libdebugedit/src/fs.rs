//! File-mode and timestamp juggling around an edit: the editor grants itself
//! read+write on the target, then puts everything back the way it was.

use crate::error::warning;
use crate::error::Context as _;
use crate::error::Result;
use std::fs::FileTimes;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::SystemTime;

pub(crate) struct FileState {
    mode: u32,
    accessed: SystemTime,
    modified: SystemTime,
}

pub(crate) fn stat(path: &Path) -> Result<FileState> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to open input file '{}'", path.display()))?;
    Ok(FileState {
        mode: metadata.permissions().mode(),
        accessed: metadata.accessed()?,
        modified: metadata.modified()?,
    })
}

/// Makes sure we can read and write the file. Failure is only a warning; the
/// subsequent open reports the real error if there is one.
pub(crate) fn make_readable_writable(path: &Path, state: &FileState) {
    let permissions = std::fs::Permissions::from_mode(state.mode | 0o600);
    if let Err(error) = std::fs::set_permissions(path, permissions) {
        warning(&format!(
            "Failed to chmod input file '{}' to make sure we can read and write: {error}",
            path.display()
        ));
    }
}

pub(crate) fn restore_mode(path: &Path, state: &FileState) {
    let permissions = std::fs::Permissions::from_mode(state.mode);
    if let Err(error) = std::fs::set_permissions(path, permissions) {
        warning(&format!(
            "Failed to chmod input file '{}' to restore old access rights: {error}",
            path.display()
        ));
    }
}

pub(crate) fn restore_times(path: &Path, state: &FileState) {
    let times = FileTimes::new()
        .set_accessed(state.accessed)
        .set_modified(state.modified);
    let result = std::fs::File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_times(times));
    if let Err(error) = result {
        warning(&format!(
            "Failed to preserve timestamps on '{}': {error}",
            path.display()
        ));
    }
}
