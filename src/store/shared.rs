//! Shared state
//!
//! Mutable data that outlives any single release: configuration, logs,
//! persistent data, and the record of applied migrations. Every release
//! references it through a `shared` link; nothing is ever copied.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schema version for applied_migrations.json
pub const MIGRATIONS_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for applied_migrations.json
pub const MIGRATIONS_SCHEMA_ID: &str = "cutover/applied_migrations@1";

/// Subdirectories of the shared root
pub const SHARED_SUBDIRS: &[&str] = &["config", "logs", "data", "state"];

/// Link name inside each release directory
pub const SHARED_LINK: &str = "shared";

/// Errors from shared-state operations
#[derive(Debug, Error)]
pub enum SharedStateError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for shared-state operations
pub type SharedStateResult<T> = Result<T, SharedStateError>;

/// One applied migration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedMigration {
    /// Migration id (file name from the release's migrations dir)
    pub id: String,

    /// When it completed
    pub applied_at: DateTime<Utc>,
}

/// The applied-migrations record (state/applied_migrations.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedMigrations {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// Applied ids in application order
    pub applied: Vec<AppliedMigration>,
}

impl Default for AppliedMigrations {
    fn default() -> Self {
        Self {
            schema_version: MIGRATIONS_SCHEMA_VERSION,
            schema_id: MIGRATIONS_SCHEMA_ID.to_string(),
            applied: Vec::new(),
        }
    }
}

/// Handle to the machine's shared state directory
#[derive(Debug, Clone)]
pub struct SharedState {
    root: PathBuf,
}

impl SharedState {
    /// Open (and lay out) shared state at `root`
    pub fn open(root: PathBuf) -> SharedStateResult<Self> {
        for sub in SHARED_SUBDIRS {
            fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self { root })
    }

    /// The shared root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn migrations_path(&self) -> PathBuf {
        self.root.join("state").join("applied_migrations.json")
    }

    /// Read the applied-migrations record (empty when none yet)
    pub fn applied_migrations(&self) -> SharedStateResult<AppliedMigrations> {
        let path = self.migrations_path();
        if !path.exists() {
            return Ok(AppliedMigrations::default());
        }
        let json = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Applied migration ids, in application order
    pub fn applied_ids(&self) -> SharedStateResult<Vec<String>> {
        Ok(self
            .applied_migrations()?
            .applied
            .into_iter()
            .map(|m| m.id)
            .collect())
    }

    /// Record a migration as applied.
    ///
    /// Written atomically (temp + rename); recording the same id twice is
    /// a no-op, which keeps re-runs after a crash harmless.
    pub fn record_applied(&self, id: &str) -> SharedStateResult<()> {
        let mut record = self.applied_migrations()?;
        if record.applied.iter().any(|m| m.id == id) {
            return Ok(());
        }
        record.applied.push(AppliedMigration {
            id: id.to_string(),
            applied_at: Utc::now(),
        });

        let json = serde_json::to_string_pretty(&record)?;
        let path = self.migrations_path();
        let temp = path.with_extension("tmp");
        fs::write(&temp, json)?;
        fs::rename(&temp, &path)?;
        Ok(())
    }

    /// Link this shared root into a release directory.
    ///
    /// Re-linking an already-linked release is a no-op.
    pub fn link_into(&self, release_dir: &Path) -> SharedStateResult<()> {
        let link = release_dir.join(SHARED_LINK);
        if fs::symlink_metadata(&link).is_ok() {
            return Ok(());
        }

        make_symlink(&self.root, &link)?;
        Ok(())
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
        "shared-state links require a unix target",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_layout() {
        let dir = TempDir::new().unwrap();
        let shared = SharedState::open(dir.path().join("shared")).unwrap();

        for sub in SHARED_SUBDIRS {
            assert!(shared.root().join(sub).is_dir());
        }
    }

    #[test]
    fn test_applied_migrations_empty() {
        let dir = TempDir::new().unwrap();
        let shared = SharedState::open(dir.path().join("shared")).unwrap();

        assert!(shared.applied_ids().unwrap().is_empty());
    }

    #[test]
    fn test_record_applied_in_order() {
        let dir = TempDir::new().unwrap();
        let shared = SharedState::open(dir.path().join("shared")).unwrap();

        shared.record_applied("0001_init").unwrap();
        shared.record_applied("0002_add_index").unwrap();

        assert_eq!(
            shared.applied_ids().unwrap(),
            vec!["0001_init".to_string(), "0002_add_index".to_string()]
        );
    }

    #[test]
    fn test_record_applied_twice_is_noop() {
        let dir = TempDir::new().unwrap();
        let shared = SharedState::open(dir.path().join("shared")).unwrap();

        shared.record_applied("0001_init").unwrap();
        shared.record_applied("0001_init").unwrap();

        assert_eq!(shared.applied_ids().unwrap().len(), 1);
    }

    #[test]
    #[cfg(unix)]
    fn test_link_into_release() {
        let dir = TempDir::new().unwrap();
        let shared = SharedState::open(dir.path().join("shared")).unwrap();
        let release = dir.path().join("releases/1.0.0");
        fs::create_dir_all(&release).unwrap();

        shared.link_into(&release).unwrap();

        let link = release.join(SHARED_LINK);
        assert_eq!(fs::read_link(&link).unwrap(), shared.root());

        // Idempotent.
        shared.link_into(&release).unwrap();
    }
}
