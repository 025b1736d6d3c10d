//! Tarball extraction into a staging directory.

use crate::error::StoreError;
use crate::integrity::{Algorithm, FileIntegrity, Integrity};
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tar::Archive;

/// Extract a gzipped tarball into `dest`, returning the per-file integrity
/// index of everything written.
///
/// The archive's single top-level directory (`package/` for most registry
/// tarballs, the bare package name for some) is stripped, so `dest` receives
/// the package content directly. Entries matching `ignore` are skipped, as
/// are symlinks and other special entries.
///
/// # Errors
/// `BAD_TARBALL` if the archive is corrupt or contains unsafe paths.
pub fn extract_tarball(
    bytes: &[u8],
    dest: &Path,
    ignore: Option<&(dyn Fn(&str) -> bool + Send + Sync)>,
) -> Result<BTreeMap<String, FileIntegrity>, StoreError> {
    fs::create_dir_all(dest)?;

    let gz = GzDecoder::new(bytes);
    let mut archive = Archive::new(gz);
    let mut index = BTreeMap::new();

    for entry in archive
        .entries()
        .map_err(|e| StoreError::corrupt_tarball(format!("Failed to read tarball entries: {e}")))?
    {
        let mut entry = entry
            .map_err(|e| StoreError::corrupt_tarball(format!("Failed to read tarball entry: {e}")))?;

        let path = entry
            .path()
            .map_err(|e| StoreError::corrupt_tarball(format!("Failed to read entry path: {e}")))?
            .into_owned();

        let Some(rel) = sanitize_entry_path(&path)? else {
            continue; // the root directory itself
        };

        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if ignore.is_some_and(|f| f(&rel_str)) {
            continue;
        }

        let dest_path = dest.join(&rel);
        if !dest_path.starts_with(dest) {
            return Err(StoreError::corrupt_tarball(format!(
                "Tarball entry escapes destination: {}",
                path.display()
            )));
        }

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            fs::create_dir_all(&dest_path)?;
        } else if entry_type.is_file() {
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }

            let mode = entry.header().mode().unwrap_or(0o644);
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut data)
                .map_err(|e| StoreError::corrupt_tarball(format!("Truncated tarball entry: {e}")))?;

            let mut file = File::create(&dest_path)?;
            io::copy(&mut data.as_slice(), &mut file)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&dest_path, fs::Permissions::from_mode(mode));
            }

            index.insert(
                rel_str,
                FileIntegrity {
                    integrity: Integrity::from_bytes(Algorithm::Sha512, &data).to_string(),
                    mode,
                    size: data.len() as u64,
                },
            );
        }
        // Symlinks and other special entries are skipped.
    }

    if index.is_empty() {
        return Err(StoreError::corrupt_tarball(
            "Tarball contains no package files",
        ));
    }

    Ok(index)
}

/// Strip the archive's root directory and reject unsafe paths.
///
/// Returns `None` for the root directory entry itself.
fn sanitize_entry_path(path: &Path) -> Result<Option<PathBuf>, StoreError> {
    if path.is_absolute() {
        return Err(StoreError::corrupt_tarball(format!(
            "Tarball contains absolute path: {}",
            path.display()
        )));
    }

    let mut components = path.components();
    // Drop the top-level directory (`package/`, or whatever the publisher used).
    let Some(first) = components.next() else {
        return Ok(None);
    };
    if matches!(first, Component::ParentDir) {
        return Err(StoreError::corrupt_tarball(format!(
            "Tarball contains path traversal: {}",
            path.display()
        )));
    }

    let mut rel = PathBuf::new();
    for component in components {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir => {}
            _ => {
                return Err(StoreError::corrupt_tarball(format!(
                    "Tarball contains path traversal: {}",
                    path.display()
                )))
            }
        }
    }

    if rel.as_os_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(rel))
    }
}
