//! The active pointer
//!
//! A single symlink (`<store>/current`) names exactly one release as
//! currently serving. It is the only deployment state that changes during
//! cutover, and it only ever changes through [`ActivePointer::set_active`]:
//! a temp symlink plus one atomic rename, never an edit in place. A crash
//! immediately before or after the rename leaves the pointer resolving to
//! exactly one fully-staged release.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use semver::Version;
use thiserror::Error;

use super::RELEASES_DIR;

/// Name of the active pointer symlink inside the store root
pub const CURRENT_LINK: &str = "current";

/// Errors from pointer operations
#[derive(Debug, Error)]
pub enum PointerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("active pointer names a release missing from the store: {0}")]
    Dangling(String),

    #[error("active pointer target is not a release path: {0}")]
    Malformed(PathBuf),

    #[error("cannot activate {0}: release not present in the store")]
    NoSuchRelease(Version),
}

/// Result type for pointer operations
pub type PointerResult<T> = Result<T, PointerError>;

/// Accessor for the store's single mutable reference
#[derive(Debug, Clone)]
pub struct ActivePointer {
    store_root: PathBuf,
}

impl ActivePointer {
    /// Create an accessor for the pointer under `store_root`
    pub fn new(store_root: PathBuf) -> Self {
        Self { store_root }
    }

    fn link_path(&self) -> PathBuf {
        self.store_root.join(CURRENT_LINK)
    }

    /// Resolve the currently serving version, if any.
    ///
    /// Every reader goes through here; nothing else interprets the link.
    pub fn read(&self) -> PointerResult<Option<Version>> {
        let link = self.link_path();
        let target = match fs::read_link(&link) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let version_str = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| PointerError::Malformed(target.clone()))?;
        let version = Version::parse(&version_str)
            .map_err(|_| PointerError::Malformed(target.clone()))?;

        if !self.store_root.join(RELEASES_DIR).join(&version_str).exists() {
            return Err(PointerError::Dangling(version_str));
        }

        Ok(Some(version))
    }

    /// Atomically repoint the active pointer at `version`.
    ///
    /// The target must already be fully staged. The swap is a temp symlink
    /// followed by one `rename`; there is no moment when the pointer is
    /// absent or half-written.
    pub fn set_active(&self, version: &Version) -> PointerResult<()> {
        let rel_target = PathBuf::from(RELEASES_DIR).join(version.to_string());
        if !self.store_root.join(&rel_target).exists() {
            return Err(PointerError::NoSuchRelease(version.clone()));
        }

        let temp = self
            .store_root
            .join(format!(".{CURRENT_LINK}.tmp-{}", std::process::id()));
        if temp.exists() || fs::symlink_metadata(&temp).is_ok() {
            fs::remove_file(&temp)?;
        }

        make_symlink(&rel_target, &temp)?;
        fs::rename(&temp, self.link_path())?;
        Ok(())
    }

    /// Remove the pointer entirely.
    ///
    /// Only meaningful on a first install whose health check failed:
    /// there is no prior release to point back at.
    pub fn clear(&self) -> PointerResult<()> {
        match fs::remove_file(self.link_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlink-based active pointer requires a unix target",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with_release(version: &str) -> (TempDir, ActivePointer) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(RELEASES_DIR).join(version)).unwrap();
        let pointer = ActivePointer::new(dir.path().to_path_buf());
        (dir, pointer)
    }

    #[test]
    fn test_read_absent_pointer() {
        let dir = TempDir::new().unwrap();
        let pointer = ActivePointer::new(dir.path().to_path_buf());
        assert_eq!(pointer.read().unwrap(), None);
    }

    #[test]
    fn test_set_and_read() {
        let (_dir, pointer) = store_with_release("1.0.0");

        pointer.set_active(&Version::new(1, 0, 0)).unwrap();
        assert_eq!(pointer.read().unwrap(), Some(Version::new(1, 0, 0)));
    }

    #[test]
    fn test_swap_replaces_atomically() {
        let (dir, pointer) = store_with_release("1.0.0");
        fs::create_dir_all(dir.path().join(RELEASES_DIR).join("1.1.0")).unwrap();

        pointer.set_active(&Version::new(1, 0, 0)).unwrap();
        pointer.set_active(&Version::new(1, 1, 0)).unwrap();

        assert_eq!(pointer.read().unwrap(), Some(Version::new(1, 1, 0)));
        // No temp link left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_set_active_refuses_missing_release() {
        let (_dir, pointer) = store_with_release("1.0.0");

        let err = pointer.set_active(&Version::new(9, 9, 9)).unwrap_err();
        assert!(matches!(err, PointerError::NoSuchRelease(_)));
        assert_eq!(pointer.read().unwrap(), None);
    }

    #[test]
    fn test_dangling_pointer_detected() {
        let (dir, pointer) = store_with_release("1.0.0");
        pointer.set_active(&Version::new(1, 0, 0)).unwrap();

        fs::remove_dir_all(dir.path().join(RELEASES_DIR).join("1.0.0")).unwrap();
        assert!(matches!(pointer.read(), Err(PointerError::Dangling(_))));
    }

    #[test]
    fn test_clear() {
        let (_dir, pointer) = store_with_release("1.0.0");
        pointer.set_active(&Version::new(1, 0, 0)).unwrap();

        pointer.clear().unwrap();
        assert_eq!(pointer.read().unwrap(), None);

        // Clearing an absent pointer is fine.
        pointer.clear().unwrap();
    }
}
