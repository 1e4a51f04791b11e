//! Migration runner
//!
//! Runs a release's pending migrations in order against shared state.
//! Semantics are at-least-once: an id is recorded applied only after its
//! script exits 0, so a crash between execution and bookkeeping re-runs
//! it. Migrations must therefore be idempotent.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::builder::MIGRATIONS_DIR;
use crate::store::{SharedState, SharedStateError};

/// Environment variable handing migrations the shared state root
pub const ENV_SHARED_DIR: &str = "CUTOVER_SHARED_DIR";

/// Environment variable handing migrations the release root
pub const ENV_RELEASE_DIR: &str = "CUTOVER_RELEASE_DIR";

/// Errors from migration execution
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("shared state error: {0}")]
    Shared(#[from] SharedStateError),

    #[error("migration {id} script missing at {path}")]
    MissingScript { id: String, path: PathBuf },

    #[error("migration {id} failed: {detail}")]
    Failed { id: String, detail: String },
}

/// Result type for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// What happened to one migration id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Executed now and recorded
    Applied,
    /// Already recorded applied in shared state
    Skipped,
}

/// Per-migration outcome for the deploy report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOutcome {
    /// Migration id
    pub id: String,

    /// Applied or skipped
    pub status: MigrationStatus,
}

/// Runs one release's migrations against one shared state
pub struct MigrationRunner<'a> {
    release_dir: &'a Path,
    shared: &'a SharedState,
}

impl<'a> MigrationRunner<'a> {
    /// Create a runner for a staged release
    pub fn new(release_dir: &'a Path, shared: &'a SharedState) -> Self {
        Self {
            release_dir,
            shared,
        }
    }

    /// Run every manifest migration not yet recorded applied, in manifest
    /// order. Stops at the first failure; already-applied ids are reported
    /// as skipped.
    pub fn run(&self, manifest_ids: &[String]) -> MigrationResult<Vec<MigrationOutcome>> {
        let applied = self.shared.applied_ids()?;
        let mut outcomes = Vec::with_capacity(manifest_ids.len());

        for id in manifest_ids {
            if applied.iter().any(|a| a == id) {
                outcomes.push(MigrationOutcome {
                    id: id.clone(),
                    status: MigrationStatus::Skipped,
                });
                continue;
            }

            self.run_one(id)?;
            self.shared.record_applied(id)?;
            outcomes.push(MigrationOutcome {
                id: id.clone(),
                status: MigrationStatus::Applied,
            });
        }

        Ok(outcomes)
    }

    fn run_one(&self, id: &str) -> MigrationResult<()> {
        let script = self.release_dir.join(MIGRATIONS_DIR).join(id);
        if !script.is_file() {
            return Err(MigrationError::MissingScript {
                id: id.to_string(),
                path: script,
            });
        }

        info!(migration = %id, "running migration");
        let output = Command::new(&script)
            .current_dir(self.release_dir)
            .env(ENV_SHARED_DIR, self.shared.root())
            .env(ENV_RELEASE_DIR, self.release_dir)
            .output()
            .map_err(|e| MigrationError::Failed {
                id: id.to_string(),
                detail: format!("failed to spawn: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(migration = %id, status = %output.status, "migration failed");
            return Err(MigrationError::Failed {
                id: id.to_string(),
                detail: format!(
                    "exited with {} ({})",
                    output.status,
                    stderr.trim().lines().last().unwrap_or("no output")
                ),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_script(release: &Path, id: &str, body: &str) {
        let dir = release.join(MIGRATIONS_DIR);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(id);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
        }
    }

    fn fixture() -> (TempDir, PathBuf, SharedState) {
        let dir = TempDir::new().unwrap();
        let release = dir.path().join("release");
        fs::create_dir_all(&release).unwrap();
        let shared = SharedState::open(dir.path().join("shared")).unwrap();
        (dir, release, shared)
    }

    #[test]
    fn test_runs_in_order_and_records() {
        let (_dir, release, shared) = fixture();
        write_script(&release, "0001_init", "echo one >> \"$CUTOVER_SHARED_DIR/data/log\"");
        write_script(&release, "0002_next", "echo two >> \"$CUTOVER_SHARED_DIR/data/log\"");

        let runner = MigrationRunner::new(&release, &shared);
        let outcomes = runner
            .run(&["0001_init".to_string(), "0002_next".to_string()])
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.status == MigrationStatus::Applied));
        assert_eq!(
            shared.applied_ids().unwrap(),
            vec!["0001_init".to_string(), "0002_next".to_string()]
        );

        let log = fs::read_to_string(shared.root().join("data/log")).unwrap();
        assert_eq!(log, "one\ntwo\n");
    }

    #[test]
    fn test_applied_ids_skipped() {
        let (_dir, release, shared) = fixture();
        write_script(&release, "0001_init", "echo ran >> \"$CUTOVER_SHARED_DIR/data/log\"");
        shared.record_applied("0001_init").unwrap();

        let runner = MigrationRunner::new(&release, &shared);
        let outcomes = runner.run(&["0001_init".to_string()]).unwrap();

        assert_eq!(outcomes[0].status, MigrationStatus::Skipped);
        assert!(!shared.root().join("data/log").exists());
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let (_dir, release, shared) = fixture();
        write_script(&release, "0001_init", "echo ran >> \"$CUTOVER_SHARED_DIR/data/log\"");

        let runner = MigrationRunner::new(&release, &shared);
        runner.run(&["0001_init".to_string()]).unwrap();
        runner.run(&["0001_init".to_string()]).unwrap();

        // Second run skips: same end state as running once.
        let log = fs::read_to_string(shared.root().join("data/log")).unwrap();
        assert_eq!(log, "ran\n");
    }

    #[test]
    fn test_failure_stops_and_records_nothing_further() {
        let (_dir, release, shared) = fixture();
        write_script(&release, "0001_ok", "exit 0");
        write_script(&release, "0002_bad", "echo boom >&2; exit 3");
        write_script(&release, "0003_never", "exit 0");

        let runner = MigrationRunner::new(&release, &shared);
        let err = runner
            .run(&[
                "0001_ok".to_string(),
                "0002_bad".to_string(),
                "0003_never".to_string(),
            ])
            .unwrap_err();

        assert!(matches!(err, MigrationError::Failed { ref id, .. } if id == "0002_bad"));
        // Only the migration that succeeded is recorded.
        assert_eq!(shared.applied_ids().unwrap(), vec!["0001_ok".to_string()]);
    }

    #[test]
    fn test_missing_script_is_error() {
        let (_dir, release, shared) = fixture();

        let runner = MigrationRunner::new(&release, &shared);
        let err = runner.run(&["0001_ghost".to_string()]).unwrap_err();
        assert!(matches!(err, MigrationError::MissingScript { .. }));
    }
}
