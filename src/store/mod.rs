//! Release store
//!
//! The on-target collection of installed releases: an immutable
//! per-version directory tree under `releases/`, a single `current`
//! symlink (the active pointer), and store-level records under `state/`.
//! Append-only except for explicit pruning.

mod active;
mod lock;
mod shared;

pub use active::{ActivePointer, PointerError, PointerResult, CURRENT_LINK};
pub use lock::{LockError, LockResult, StoreLock};
pub use shared::{
    AppliedMigration, AppliedMigrations, SharedState, SharedStateError, SharedStateResult,
    SHARED_LINK, SHARED_SUBDIRS,
};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::manifest::{component_digest, FileDigest, ManifestError, ReleaseManifest};
use crate::signing::sha256_hex;

/// Directory of per-version release trees inside the store root
pub const RELEASES_DIR: &str = "releases";

/// Directory of store-level records inside the store root
pub const STATE_DIR: &str = "state";

/// Schema version for release records
pub const RELEASE_RECORD_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for release records
pub const RELEASE_RECORD_SCHEMA_ID: &str = "cutover/release_record@1";

/// Schema identifier for the activation history
pub const HISTORY_SCHEMA_ID: &str = "cutover/history@1";

/// Commit marker written last into a release directory; its presence is
/// what makes a release complete
pub const RELEASE_RECORD_FILENAME: &str = ".cutover-release.json";

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pointer error: {0}")]
    Pointer(#[from] PointerError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("shared state error: {0}")]
    Shared(#[from] SharedStateError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("release {0} already complete in the store")]
    ReleaseExists(Version),

    #[error("release {0} not present in the store")]
    ReleaseMissing(Version),

    #[error("component {component} checksum mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch {
        component: String,
        expected: String,
        actual: String,
    },

    #[error("component {0} missing from extracted release")]
    ComponentMissing(String),

    #[error("cannot prune {version}: {reason}")]
    CannotPrune { version: Version, reason: String },

    #[error("no previously-served release available to roll back to")]
    NoRollbackTarget,
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Release record (the commit marker) written last into a release dir
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRecord {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// Release version
    pub version: Version,

    /// When staging completed
    pub installed_at: DateTime<Utc>,

    /// Deployment id that staged this release
    pub deploy_id: String,

    /// SHA-256 of the artifact the release was extracted from
    pub artifact_sha256: String,
}

/// One entry in the activation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationEntry {
    /// Version that became active
    pub version: Version,

    /// Deployment id that performed the swap
    pub deploy_id: String,

    /// When the pointer moved
    pub activated_at: DateTime<Utc>,
}

/// Append-only record of every pointer swap (state/history.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActivationHistory {
    schema_version: u32,
    schema_id: String,
    entries: Vec<ActivationEntry>,
}

impl Default for ActivationHistory {
    fn default() -> Self {
        Self {
            schema_version: RELEASE_RECORD_SCHEMA_VERSION,
            schema_id: HISTORY_SCHEMA_ID.to_string(),
            entries: Vec::new(),
        }
    }
}

/// One installed release as listed by the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseEntry {
    /// Release version
    pub version: Version,

    /// Whether the commit marker is present
    pub complete: bool,
}

/// Handle to the release store on a target machine
#[derive(Debug, Clone)]
pub struct ReleaseStore {
    root: PathBuf,
}

impl ReleaseStore {
    /// Open (and lay out) a store at `root`
    pub fn open(root: PathBuf) -> StoreResult<Self> {
        fs::create_dir_all(root.join(RELEASES_DIR))?;
        fs::create_dir_all(root.join(STATE_DIR))?;
        Ok(Self { root })
    }

    /// The store root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one release
    pub fn release_dir(&self, version: &Version) -> PathBuf {
        self.root.join(RELEASES_DIR).join(version.to_string())
    }

    /// Acquire the store's advisory deployment lock
    pub fn lock(&self, timeout: Duration) -> StoreResult<StoreLock> {
        Ok(StoreLock::acquire(&self.root, timeout)?)
    }

    /// Accessor for the active pointer
    pub fn pointer(&self) -> ActivePointer {
        ActivePointer::new(self.root.clone())
    }

    /// Version currently serving, resolved through the pointer
    pub fn active_version(&self) -> StoreResult<Option<Version>> {
        Ok(self.pointer().read()?)
    }

    /// Whether a release is fully staged (commit marker present)
    pub fn is_complete(&self, version: &Version) -> bool {
        self.release_dir(version).join(RELEASE_RECORD_FILENAME).exists()
    }

    /// All releases in the store, sorted by version
    pub fn installed(&self) -> StoreResult<Vec<ReleaseEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.root.join(RELEASES_DIR))? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Ok(version) = Version::parse(&name) {
                let complete = self.is_complete(&version);
                entries.push(ReleaseEntry { version, complete });
            }
        }
        entries.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(entries)
    }

    /// Extract an artifact into the release's directory.
    ///
    /// A complete release dir is immutable and never re-extracted; a dir
    /// without its commit marker is a crashed stage and is discarded first.
    pub fn unpack_archive(&self, archive: &Path, version: &Version) -> StoreResult<PathBuf> {
        let dest = self.release_dir(version);
        if dest.exists() {
            if self.is_complete(version) {
                return Err(StoreError::ReleaseExists(version.clone()));
            }
            debug!(%version, "discarding incomplete release directory");
            fs::remove_dir_all(&dest)?;
        }
        fs::create_dir_all(&dest)?;

        let file = fs::File::open(archive)?;
        let decoder = flate2::read::GzDecoder::new(file);
        let mut tar = tar::Archive::new(decoder);
        tar.unpack(&dest)?;

        info!(%version, dest = %dest.display(), "release extracted");
        Ok(dest)
    }

    /// Verify every manifest checksum against the extracted tree.
    ///
    /// Recomputes each component's digest from the files on disk; any
    /// mismatch is an integrity failure, never repaired in place.
    pub fn verify_release(&self, manifest: &ReleaseManifest) -> StoreResult<()> {
        let release_dir = self.release_dir(&manifest.version);
        for (component, expected) in &manifest.checksums {
            let dir = release_dir.join(component);
            if !dir.exists() {
                return Err(StoreError::ComponentMissing(component.clone()));
            }

            let digests = collect_digests(&dir)?;
            let actual = component_digest(&digests)?;
            if &actual != expected {
                return Err(StoreError::ChecksumMismatch {
                    component: component.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Write the commit marker, completing the release.
    pub fn write_record(&self, record: &ReleaseRecord) -> StoreResult<()> {
        let path = self.release_dir(&record.version).join(RELEASE_RECORD_FILENAME);
        let json = serde_json::to_string_pretty(record)?;
        let temp = path.with_extension("tmp");
        fs::write(&temp, json)?;
        fs::rename(&temp, &path)?;
        Ok(())
    }

    /// Read a release's record, if complete
    pub fn read_record(&self, version: &Version) -> StoreResult<ReleaseRecord> {
        let path = self.release_dir(version).join(RELEASE_RECORD_FILENAME);
        if !path.exists() {
            return Err(StoreError::ReleaseMissing(version.clone()));
        }
        let json = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    fn history_path(&self) -> PathBuf {
        self.root.join(STATE_DIR).join("history.json")
    }

    fn read_history(&self) -> StoreResult<ActivationHistory> {
        let path = self.history_path();
        if !path.exists() {
            return Ok(ActivationHistory::default());
        }
        let json = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Every pointer swap ever performed, oldest first
    pub fn history(&self) -> StoreResult<Vec<ActivationEntry>> {
        Ok(self.read_history()?.entries)
    }

    /// Record that `version` became active
    pub fn record_activation(&self, version: &Version, deploy_id: &str) -> StoreResult<()> {
        let mut history = self.read_history()?;
        history.entries.push(ActivationEntry {
            version: version.clone(),
            deploy_id: deploy_id.to_string(),
            activated_at: Utc::now(),
        });

        let json = serde_json::to_string_pretty(&history)?;
        let path = self.history_path();
        let temp = path.with_extension("tmp");
        fs::write(&temp, json)?;
        fs::rename(&temp, &path)?;
        Ok(())
    }

    /// Most recent previously-served release other than `exclude` that is
    /// still complete in the store.
    pub fn rollback_target(&self, exclude: &Version) -> StoreResult<Option<Version>> {
        let history = self.read_history()?;
        for entry in history.entries.iter().rev() {
            if &entry.version != exclude && self.is_complete(&entry.version) {
                return Ok(Some(entry.version.clone()));
            }
        }
        Ok(None)
    }

    /// Remove one release from the store.
    ///
    /// Explicit operator action only: refuses the active release and the
    /// release an automatic rollback would target.
    pub fn prune(&self, version: &Version) -> StoreResult<()> {
        let dir = self.release_dir(version);
        if !dir.exists() {
            return Err(StoreError::ReleaseMissing(version.clone()));
        }

        if let Some(active) = self.active_version()? {
            if &active == version {
                return Err(StoreError::CannotPrune {
                    version: version.clone(),
                    reason: "release is currently active".to_string(),
                });
            }
            if self.rollback_target(&active)?.as_ref() == Some(version) {
                return Err(StoreError::CannotPrune {
                    version: version.clone(),
                    reason: "release is the current rollback target".to_string(),
                });
            }
        }

        fs::remove_dir_all(&dir)?;
        info!(%version, "release pruned");
        Ok(())
    }
}

/// Collect per-file digests for a directory, relative paths sorted
fn collect_digests(dir: &Path) -> StoreResult<Vec<FileDigest>> {
    let mut digests = Vec::new();
    for entry in WalkDir::new(dir)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .expect("walkdir yields paths under its root");
        digests.push(FileDigest {
            path: rel.to_string_lossy().to_string(),
            sha256: sha256_hex(&fs::read(entry.path())?),
        });
    }
    Ok(digests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_complete_release(store: &ReleaseStore, version: &str) {
        let v = Version::parse(version).unwrap();
        let dir = store.release_dir(&v);
        fs::create_dir_all(dir.join("backend")).unwrap();
        fs::write(dir.join("backend/server.py"), version).unwrap();
        store
            .write_record(&ReleaseRecord {
                schema_version: RELEASE_RECORD_SCHEMA_VERSION,
                schema_id: RELEASE_RECORD_SCHEMA_ID.to_string(),
                version: v,
                installed_at: Utc::now(),
                deploy_id: "test-deploy".to_string(),
                artifact_sha256: "0".repeat(64),
            })
            .unwrap();
    }

    #[test]
    fn test_open_lays_out_store() {
        let dir = TempDir::new().unwrap();
        let store = ReleaseStore::open(dir.path().join("store")).unwrap();

        assert!(store.root().join(RELEASES_DIR).is_dir());
        assert!(store.root().join(STATE_DIR).is_dir());
    }

    #[test]
    fn test_installed_sorted_with_completeness() {
        let dir = TempDir::new().unwrap();
        let store = ReleaseStore::open(dir.path().to_path_buf()).unwrap();

        make_complete_release(&store, "1.1.0");
        make_complete_release(&store, "1.0.0");
        fs::create_dir_all(store.release_dir(&Version::new(1, 2, 0))).unwrap();

        let entries = store.installed().unwrap();
        let versions: Vec<String> = entries.iter().map(|e| e.version.to_string()).collect();
        assert_eq!(versions, vec!["1.0.0", "1.1.0", "1.2.0"]);
        assert!(entries[0].complete);
        assert!(!entries[2].complete);
    }

    #[test]
    fn test_record_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ReleaseStore::open(dir.path().to_path_buf()).unwrap();
        make_complete_release(&store, "1.0.0");

        let record = store.read_record(&Version::new(1, 0, 0)).unwrap();
        assert_eq!(record.version, Version::new(1, 0, 0));
        assert_eq!(record.deploy_id, "test-deploy");
    }

    #[test]
    fn test_history_and_rollback_target() {
        let dir = TempDir::new().unwrap();
        let store = ReleaseStore::open(dir.path().to_path_buf()).unwrap();
        make_complete_release(&store, "1.0.0");
        make_complete_release(&store, "1.1.0");

        store.record_activation(&Version::new(1, 0, 0), "d1").unwrap();
        store.record_activation(&Version::new(1, 1, 0), "d2").unwrap();

        assert_eq!(
            store.rollback_target(&Version::new(1, 1, 0)).unwrap(),
            Some(Version::new(1, 0, 0))
        );
        // Nothing but 1.1.0 has served besides 1.0.0.
        assert_eq!(store.rollback_target(&Version::new(1, 0, 0)).unwrap(), Some(Version::new(1, 1, 0)));
    }

    #[test]
    fn test_rollback_target_skips_pruned_releases() {
        let dir = TempDir::new().unwrap();
        let store = ReleaseStore::open(dir.path().to_path_buf()).unwrap();
        make_complete_release(&store, "1.0.0");
        make_complete_release(&store, "1.1.0");
        make_complete_release(&store, "1.2.0");

        for (v, d) in [("1.0.0", "d1"), ("1.1.0", "d2"), ("1.2.0", "d3")] {
            store
                .record_activation(&Version::parse(v).unwrap(), d)
                .unwrap();
        }
        fs::remove_dir_all(store.release_dir(&Version::new(1, 1, 0))).unwrap();

        assert_eq!(
            store.rollback_target(&Version::new(1, 2, 0)).unwrap(),
            Some(Version::new(1, 0, 0))
        );
    }

    #[test]
    fn test_prune_refuses_active() {
        let dir = TempDir::new().unwrap();
        let store = ReleaseStore::open(dir.path().to_path_buf()).unwrap();
        make_complete_release(&store, "1.0.0");
        store.pointer().set_active(&Version::new(1, 0, 0)).unwrap();

        let err = store.prune(&Version::new(1, 0, 0)).unwrap_err();
        assert!(matches!(err, StoreError::CannotPrune { .. }));
    }

    #[test]
    fn test_prune_refuses_rollback_target() {
        let dir = TempDir::new().unwrap();
        let store = ReleaseStore::open(dir.path().to_path_buf()).unwrap();
        make_complete_release(&store, "1.0.0");
        make_complete_release(&store, "1.1.0");
        store.record_activation(&Version::new(1, 0, 0), "d1").unwrap();
        store.record_activation(&Version::new(1, 1, 0), "d2").unwrap();
        store.pointer().set_active(&Version::new(1, 1, 0)).unwrap();

        let err = store.prune(&Version::new(1, 0, 0)).unwrap_err();
        assert!(matches!(err, StoreError::CannotPrune { .. }));
    }

    #[test]
    fn test_prune_removes_old_release() {
        let dir = TempDir::new().unwrap();
        let store = ReleaseStore::open(dir.path().to_path_buf()).unwrap();
        make_complete_release(&store, "1.0.0");
        make_complete_release(&store, "1.1.0");
        make_complete_release(&store, "1.2.0");
        for (v, d) in [("1.0.0", "d1"), ("1.1.0", "d2"), ("1.2.0", "d3")] {
            store
                .record_activation(&Version::parse(v).unwrap(), d)
                .unwrap();
        }
        store.pointer().set_active(&Version::new(1, 2, 0)).unwrap();

        // 1.1.0 is the rollback target; 1.0.0 is prunable.
        store.prune(&Version::new(1, 0, 0)).unwrap();
        assert!(!store.release_dir(&Version::new(1, 0, 0)).exists());
    }

    #[test]
    fn test_verify_release_detects_tampering() {
        let dir = TempDir::new().unwrap();
        let store = ReleaseStore::open(dir.path().to_path_buf()).unwrap();

        let v = Version::new(1, 0, 0);
        let release = store.release_dir(&v);
        fs::create_dir_all(release.join("backend")).unwrap();
        fs::write(release.join("backend/server.py"), "print('serve')").unwrap();

        let digests = collect_digests(&release.join("backend")).unwrap();
        let mut checksums = std::collections::BTreeMap::new();
        checksums.insert("backend".to_string(), component_digest(&digests).unwrap());

        let manifest = ReleaseManifest {
            schema_version: crate::manifest::MANIFEST_SCHEMA_VERSION,
            schema_id: crate::manifest::MANIFEST_SCHEMA_ID.to_string(),
            name: "orderd".to_string(),
            version: v.clone(),
            channel: crate::manifest::Channel::Stable,
            arch: "x86_64".to_string(),
            built_at: Utc::now(),
            source_revision: "abc".to_string(),
            min_compatible: None,
            checksums,
            requirements: Default::default(),
            migrations: Vec::new(),
        };

        store.verify_release(&manifest).unwrap();

        // Flip a byte; verification must fail.
        fs::write(release.join("backend/server.py"), "print('servX')").unwrap();
        let err = store.verify_release(&manifest).unwrap_err();
        assert!(matches!(err, StoreError::ChecksumMismatch { .. }));
    }
}
