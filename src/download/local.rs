use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::DownloadError;

/// Recursively copy a local package directory, skipping VCS metadata.
///
/// Returns the sha256 digest of the copied tree (relative paths and file
/// contents in name order), so changed content yields a different digest.
pub fn copy_dir(src: &Path, dest: &Path) -> Result<String, DownloadError> {
    std::fs::create_dir_all(dest)?;

    let mut hasher = Sha256::new();
    let walker = WalkDir::new(src)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(|e| {
            DownloadError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::other(format!("walking {:?} failed", src))
            }))
        })?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0]);
            hasher.update(std::fs::read(&target)?);
            hasher.update([0]);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}
