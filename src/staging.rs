//! Staging area for downloaded results.
//!
//! Remote results land in a temporary staging directory first; only after the
//! transfer completes are the destination's entries cleared and the staged
//! entries moved in. A transfer that dies half way never corrupts the
//! caller's sync dir.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// A temporary directory that receives a downloaded tree before it is
/// promoted into the caller's sync dir.
///
/// The directory is removed on drop if it was never promoted.
#[derive(Debug)]
pub struct StagingArea {
    root: Utf8PathBuf,
}

impl StagingArea {
    /// Creates a fresh, uniquely named staging directory under the system
    /// temp dir.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] when the temp dir path is not UTF-8 or the
    /// directory cannot be created.
    pub fn create() -> Result<Self, StagingError> {
        let base = Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .map_err(|path| StagingError::NonUtf8Path {
                path: path.display().to_string(),
            })?;
        let root = base.join(format!("caravel-stage-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).map_err(|source| StagingError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    /// Returns the staging directory path.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.root
    }

    /// Replaces the contents of `dest` with the staged entries.
    ///
    /// The destination is created when missing. Its existing entries are
    /// removed first, then each staged entry is renamed into place, and
    /// finally the emptied staging directory is deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::Io`] when any filesystem step fails; the
    /// destination may then hold a partial result.
    pub fn promote(self, dest: &Utf8Path) -> Result<(), StagingError> {
        std::fs::create_dir_all(dest).map_err(|source| StagingError::Io {
            path: dest.to_owned(),
            source,
        })?;
        clear_entries(dest)?;
        for entry in read_entries(&self.root)? {
            let target = dest.join(entry.file_name());
            std::fs::rename(entry.path(), &target).map_err(|source| StagingError::Io {
                path: target,
                source,
            })?;
        }
        std::fs::remove_dir_all(&self.root).map_err(|source| StagingError::Io {
            path: self.root.clone(),
            source,
        })?;
        std::mem::forget(self);
        Ok(())
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        // Best effort: a failed run must not leak staging trees.
        drop(std::fs::remove_dir_all(&self.root));
    }
}

fn read_entries(dir: &Utf8Path) -> Result<Vec<camino::Utf8DirEntry>, StagingError> {
    let reader = dir.read_dir_utf8().map_err(|source| StagingError::Io {
        path: dir.to_owned(),
        source,
    })?;
    reader
        .map(|entry| {
            entry.map_err(|source| StagingError::Io {
                path: dir.to_owned(),
                source,
            })
        })
        .collect()
}

fn clear_entries(dir: &Utf8Path) -> Result<(), StagingError> {
    for entry in read_entries(dir)? {
        let path = entry.path();
        let is_dir = entry
            .file_type()
            .map_err(|source| StagingError::Io {
                path: path.to_owned(),
                source,
            })?
            .is_dir();
        let removal = if is_dir {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };
        removal.map_err(|source| StagingError::Io {
            path: path.to_owned(),
            source,
        })?;
    }
    Ok(())
}

/// Errors raised by staging operations.
#[derive(Debug, Error)]
pub enum StagingError {
    /// Raised when a path on this system is not valid UTF-8.
    #[error("path is not valid UTF-8: {path}")]
    NonUtf8Path {
        /// Lossy rendering of the offending path.
        path: String,
    },
    /// Raised when a filesystem operation fails.
    #[error("staging operation failed at {path}: {source}")]
    Io {
        /// Path the operation was applied to.
        path: Utf8PathBuf,
        /// Underlying filesystem error.
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(path: &Utf8Path, contents: &str) {
        std::fs::write(path, contents).expect("write file");
    }

    fn utf8(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_path_buf()).expect("utf8 path")
    }

    #[test]
    fn promote_replaces_existing_destination_entries() {
        let dest_dir = tempfile::tempdir().expect("dest dir");
        let dest = utf8(dest_dir.path());
        write_file(&dest.join("stale.txt"), "old");
        std::fs::create_dir(dest.join("stale-dir")).expect("stale dir");

        let staging = StagingArea::create().expect("staging area");
        write_file(&staging.path().join("result.txt"), "fresh");

        staging.promote(&dest).expect("promote succeeds");

        assert!(!dest.join("stale.txt").exists());
        assert!(!dest.join("stale-dir").exists());
        let contents = std::fs::read_to_string(dest.join("result.txt")).expect("read result");
        assert_eq!(contents, "fresh");
    }

    #[test]
    fn promote_creates_missing_destination() {
        let parent = tempfile::tempdir().expect("parent dir");
        let dest = utf8(parent.path()).join("results");

        let staging = StagingArea::create().expect("staging area");
        write_file(&staging.path().join("out.log"), "ok");

        staging.promote(&dest).expect("promote succeeds");
        assert!(dest.join("out.log").exists());
    }

    #[test]
    fn promote_preserves_nested_structure() {
        let dest_dir = tempfile::tempdir().expect("dest dir");
        let dest = utf8(dest_dir.path());

        let staging = StagingArea::create().expect("staging area");
        let nested = staging.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("nested dirs");
        write_file(&nested.join("deep.txt"), "payload");

        staging.promote(&dest).expect("promote succeeds");
        let contents = std::fs::read_to_string(dest.join("a/b/deep.txt")).expect("read nested");
        assert_eq!(contents, "payload");
    }

    #[test]
    fn unpromoted_staging_area_is_removed_on_drop() {
        let staging = StagingArea::create().expect("staging area");
        let root = staging.path().to_owned();
        assert!(root.exists());
        drop(staging);
        assert!(!root.exists());
    }
}
