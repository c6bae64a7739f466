//! Archive Extraction
//!
//! Unpacks release artifacts (zip) over an install directory. Entry paths
//! are validated against zip-slip, and files whose content already matches
//! the archive are left untouched so re-running an interrupted extraction
//! is a no-op.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use super::release::file_sha256;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bad archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Unsafe path in archive: {0}")]
    UnsafePath(String),
}

/// Extract a zip archive into `dest`, creating it if needed.
/// Returns the number of files written (skipped identical files excluded).
pub fn extract_zip(archive_path: &Path, dest: &Path) -> Result<usize, ArchiveError> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    std::fs::create_dir_all(dest)?;

    let mut written = 0;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(ArchiveError::UnsafePath(entry.name().to_string()));
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut contents)?;

        // Skip files already matching the archive content
        if out_path.exists() {
            let entry_hash = hex::encode(Sha256::digest(&contents));
            if file_sha256(&out_path).map(|h| h == entry_hash).unwrap_or(false) {
                debug!(path = %out_path.display(), "already up to date, skipping");
                continue;
            }
        }

        std::fs::write(&out_path, &contents)?;
        written += 1;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn make_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, data) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_extract_writes_entries() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("release.zip");
        make_zip(&archive, &[("app", b"binary"), ("docs/readme", b"hi")]);

        let dest = dir.path().join("install");
        let written = extract_zip(&archive, &dest).unwrap();
        assert_eq!(written, 2);
        assert_eq!(std::fs::read(dest.join("app")).unwrap(), b"binary");
        assert_eq!(std::fs::read(dest.join("docs/readme")).unwrap(), b"hi");
    }

    #[test]
    fn test_extract_is_idempotent() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("release.zip");
        make_zip(&archive, &[("app", b"binary")]);

        let dest = dir.path().join("install");
        assert_eq!(extract_zip(&archive, &dest).unwrap(), 1);
        // Identical content already on disk, nothing rewritten
        assert_eq!(extract_zip(&archive, &dest).unwrap(), 0);
    }

    #[test]
    fn test_extract_replaces_changed_files() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("release.zip");
        make_zip(&archive, &[("app", b"new version")]);

        let dest = dir.path().join("install");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("app"), b"old version").unwrap();

        assert_eq!(extract_zip(&archive, &dest).unwrap(), 1);
        assert_eq!(std::fs::read(dest.join("app")).unwrap(), b"new version");
    }

    #[test]
    fn test_extract_rejects_escaping_paths() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        make_zip(&archive, &[("../evil", b"pwned")]);

        let dest = dir.path().join("install");
        let result = extract_zip(&archive, &dest);
        assert!(matches!(result, Err(ArchiveError::UnsafePath(_))));
        assert!(!dir.path().join("evil").exists());
    }
}
