//! Small path helpers that std leaves out.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

/// Unlike `Path::with_extension`, *appends* `extension` after any
/// existing extension instead of replacing it. Returns `None` if
/// `path` has no file name.
pub fn add_extension<P: AsRef<Path>>(path: P, extension: impl AsRef<str>) -> Option<PathBuf> {
    let path = path.as_ref();
    let file_name = path.file_name()?;
    let mut file_name = OsString::from(file_name);
    file_name.push(".");
    file_name.push(extension.as_ref());
    Some(path.with_file_name(file_name))
}

/// Total size in bytes of all regular files below `dir`, following no
/// symlinks. IO errors on individual entries are ignored so that a
/// concurrently mutated tree still yields a usable number.
pub fn dir_size(dir: &Path) -> u64 {
    let mut total = 0;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    for entry in entries.flatten() {
        let Ok(ft) = entry.file_type() else { continue };
        if ft.is_dir() {
            total += dir_size(&entry.path());
        } else if ft.is_file() {
            if let Ok(metadata) = entry.metadata() {
                total += metadata.len();
            }
        }
    }
    total
}
