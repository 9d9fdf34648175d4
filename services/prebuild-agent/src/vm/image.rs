//! Drive image creation.

use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

/// Errors from drive image operations.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image already exists: {0}")]
    AlreadyExists(String),

    #[error("mkfs.ext4 failed: {0}")]
    MkfsFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Produce a zero-filled file of `size_mib` MiB with an ext4 filesystem in
/// it. Refuses to clobber an existing file unless `overwrite` is set.
pub fn create_ext4_image(path: &Path, size_mib: u64, overwrite: bool) -> Result<(), ImageError> {
    if path.exists() {
        if !overwrite {
            return Err(ImageError::AlreadyExists(path.display().to_string()));
        }
        fs::remove_file(path)?;
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    info!(path = %path.display(), size_mib, "Creating ext4 image");

    let file = fs::File::create(path)?;
    file.set_len(size_mib * 1024 * 1024)?;
    file.sync_all()?;
    drop(file);

    let output = std::process::Command::new("mkfs.ext4")
        .args(["-F", "-q"])
        .arg(path)
        .output()
        .map_err(|e| ImageError::MkfsFailed(e.to_string()))?;

    if !output.status.success() {
        // Don't leave a file without a filesystem behind.
        let _ = fs::remove_file(path);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ImageError::MkfsFailed(stderr.trim().to_string()));
    }

    debug!(path = %path.display(), "ext4 image created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drive.ext4");
        fs::write(&path, b"occupied").unwrap();

        let err = create_ext4_image(&path, 16, false).unwrap_err();
        assert!(matches!(err, ImageError::AlreadyExists(_)));

        // Untouched on refusal.
        assert_eq!(fs::read(&path).unwrap(), b"occupied");
    }

    #[test]
    fn test_overwrite_replaces_existing_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drive.ext4");
        fs::write(&path, b"stale image").unwrap();

        match create_ext4_image(&path, 16, true) {
            Ok(()) => {
                // The stale file was replaced by a zero-filled image of
                // the requested size.
                let len = fs::metadata(&path).unwrap().len();
                assert_eq!(len, 16 * 1024 * 1024);
            }
            Err(ImageError::MkfsFailed(_)) => {
                // mkfs.ext4 is unavailable on this host. The overwrite
                // itself was accepted, and no half-written file survives.
                assert!(!path.exists());
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
