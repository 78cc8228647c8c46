//! Filesystem side of static responses.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::error::HttpError;

#[derive(Debug)]
pub struct StaticFile {
    pub file: File,
    pub len: u64,
    pub content_type: String,
    pub path: PathBuf,
}

/// Opens the file a static route points at. Directories are served through
/// their index file. Anything resolving outside `root` after symlinks are
/// followed is refused.
pub fn open(path: &Path, root: &Path, index: &str) -> Result<StaticFile, HttpError> {
    let mut path = path.to_path_buf();
    let mut meta = fs::metadata(&path).map_err(|e| HttpError::from_io(&e))?;
    if meta.is_dir() {
        path.push(index);
        meta = fs::metadata(&path).map_err(|e| match HttpError::from_io(&e) {
            // A directory without an index is not listable.
            HttpError::NotFound => HttpError::Forbidden,
            other => other,
        })?;
    }
    if !meta.is_file() {
        return Err(HttpError::Forbidden);
    }
    let path = contained(&path, root)?;
    let file = File::open(&path).map_err(|e| HttpError::from_io(&e))?;
    let content_type = content_type(&path);
    Ok(StaticFile {
        file,
        len: meta.len(),
        content_type,
        path,
    })
}

/// Removes a regular file below `root`.
pub fn delete(path: &Path, root: &Path) -> Result<(), HttpError> {
    let meta = fs::symlink_metadata(path).map_err(|e| HttpError::from_io(&e))?;
    if !meta.is_file() {
        return Err(HttpError::Forbidden);
    }
    let path = contained(path, root)?;
    fs::remove_file(&path).map_err(|e| HttpError::from_io(&e))
}

pub fn content_type(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_() == mime_guess::mime::TEXT {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.essence_str().to_string()
    }
}

/// Canonical form of `path`, provided it stays under `root`.
pub(crate) fn contained(path: &Path, root: &Path) -> Result<PathBuf, HttpError> {
    let root = root.canonicalize().map_err(|e| HttpError::from_io(&e))?;
    let path = path.canonicalize().map_err(|e| HttpError::from_io(&e))?;
    if path.starts_with(&root) {
        Ok(path)
    } else {
        Err(HttpError::Forbidden)
    }
}
