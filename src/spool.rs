//! Spool files: the on-disk copy of a message while it is processed.

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    time::SystemTime,
};

use crate::{
    error::{SpoolError, SpoolStep},
    internal,
};

const PREFIX: &str = "spmfilter.";
const SUFFIX_LEN: usize = 6;

/// Create a new, empty spool file inside `queue_dir`.
///
/// The file is named `spmfilter.XXXXXX` and is not removed automatically;
/// call [`remove`] once the message has been dealt with.
///
/// # Errors
///
/// Returns an error if the file cannot be created.
pub fn create(queue_dir: &Path) -> Result<(File, PathBuf), SpoolError> {
    tempfile::Builder::new()
        .prefix(PREFIX)
        .rand_bytes(SUFFIX_LEN)
        .tempfile_in(queue_dir)
        .and_then(|file| file.keep().map_err(|err| err.error))
        .map_err(|err| SpoolError::new(SpoolStep::Create, queue_dir, err))
}

/// Remove a spool file, logging rather than failing if it is already gone.
pub fn remove(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        internal!(
            level = ERROR,
            "Failed to remove spool file {}: {err}",
            path.display()
        );
    } else {
        internal!("Removed spool file {}", path.display());
    }
}

/// Replace the spool file at `path` with the concatenation of `parts`.
///
/// The new content is written to a temporary file in `queue_dir`, the
/// original removed, and the temporary file renamed into its place.
///
/// # Errors
///
/// Returns an error naming the step that failed. The spool file may be
/// gone afterwards.
pub fn replace(queue_dir: &Path, path: &Path, parts: &[&[u8]]) -> Result<(), SpoolError> {
    let mut replacement = tempfile::Builder::new()
        .prefix(PREFIX)
        .rand_bytes(SUFFIX_LEN)
        .tempfile_in(queue_dir)
        .map_err(|err| SpoolError::new(SpoolStep::Create, queue_dir, err))?;

    parts
        .iter()
        .try_for_each(|part| replacement.write_all(part))
        .and_then(|()| replacement.as_file().sync_all())
        .map_err(|err| SpoolError::new(SpoolStep::Write, replacement.path(), err))?;

    std::fs::remove_file(path).map_err(|err| SpoolError::new(SpoolStep::Remove, path, err))?;

    replacement
        .persist(path)
        .map(|_: File| ())
        .map_err(|err| SpoolError::new(SpoolStep::Rename, path, err.error))
}

/// The last modification time of a spool file, if it can be determined.
pub fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
}
