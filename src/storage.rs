use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::error::StorageError;

/// External persistence collaborator for finished recordings. Failure is
/// non-fatal: the caller keeps the temporary file for manual recovery.
pub trait StorageSink: Send + Sync {
    /// Persist the finished media file, returning its new location. The
    /// source file is left in place; the caller owns its cleanup.
    fn persist(&self, file: &Path) -> Result<PathBuf, StorageError>;
}

/// Copies finished recordings into a library directory.
pub struct MediaLibrary {
    dir: PathBuf,
}

impl MediaLibrary {
    pub fn new(dir: PathBuf) -> Self {
        MediaLibrary { dir }
    }
}

impl StorageSink for MediaLibrary {
    fn persist(&self, file: &Path) -> Result<PathBuf, StorageError> {
        fs::create_dir_all(&self.dir).map_err(|source| StorageError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let name = file.file_name().ok_or_else(|| StorageError::Io {
            path: file.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a file path"),
        })?;
        let dest = self.dir.join(name);

        fs::copy(file, &dest).map_err(|source| {
            if source.kind() == std::io::ErrorKind::PermissionDenied {
                StorageError::Unauthorized(source.to_string())
            } else {
                StorageError::Io {
                    path: file.to_path_buf(),
                    source,
                }
            }
        })?;

        log::info!("recording saved to {}", dest.display());
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_copies_into_the_library() {
        let scratch = tempfile::tempdir().unwrap();
        let library = tempfile::tempdir().unwrap();
        let source = scratch.path().join("clip.mp4");
        fs::write(&source, b"container bytes").unwrap();

        let sink = MediaLibrary::new(library.path().join("clips"));
        let dest = sink.persist(&source).unwrap();

        assert!(dest.starts_with(library.path()));
        assert_eq!(fs::read(&dest).unwrap(), b"container bytes");
        // Source is untouched; cleanup is the caller's call.
        assert!(source.exists());
    }

    #[test]
    fn persisting_a_missing_file_reports_io_error() {
        let library = tempfile::tempdir().unwrap();
        let sink = MediaLibrary::new(library.path().to_path_buf());
        let missing = library.path().join("nope.mp4");
        assert!(matches!(
            sink.persist(&missing),
            Err(StorageError::Io { .. })
        ));
    }
}
