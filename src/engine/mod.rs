//! Cutover engine
//!
//! Drives a deployment through its state machine:
//! Idle → Validating → Staged → Migrating → Linked → HealthChecking →
//! {Committed | RolledBack} → Idle. The entire cutover is one atomic
//! pointer swap; everything before it leaves the machine untouched, and
//! everything after it is driven to a terminal state, never abandoned.

mod health;
mod supervisor;

pub use health::{
    CommandProbe, HealthProbe, HealthStatus, HealthVerdict, RetryPolicy, RetryPolicyError,
    ScriptedProbe, StaticProbe,
};
pub use supervisor::{
    CommandSupervisor, RecordingSupervisor, Supervisor, SupervisorError, SupervisorResult,
};

use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ed25519_dalek::VerifyingKey;
use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::manifest::{ManifestError, ReleaseManifest, MANIFEST_FILENAME};
use crate::migrate::{MigrationError, MigrationRunner};
use crate::preflight::{self, GatherSpec, MachineState, PreflightReport};
use crate::signing::{checksum_file, evaluate_signature, SigningError};
use crate::store::{
    ReleaseRecord, ReleaseStore, SharedState, StoreError, RELEASE_RECORD_SCHEMA_ID,
    RELEASE_RECORD_SCHEMA_VERSION,
};

/// Schema version for deploy reports
pub const DEPLOY_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for deploy reports
pub const DEPLOY_SCHEMA_ID: &str = "cutover/deploy@1";

/// Deployment state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployState {
    /// No deployment in flight; pointer stable
    Idle,
    /// Preflight running; nothing on disk changes
    Validating,
    /// Release extracted and verified; pointer untouched
    Staged,
    /// Pending migrations running; pointer untouched
    Migrating,
    /// Pointer swapped; supervisor restarting
    Linked,
    /// Bounded health polling in progress
    HealthChecking,
    /// New baseline recorded
    Committed,
    /// Failed upgrade safely reverted
    RolledBack,
}

impl DeployState {
    /// Whether this state ends a deployment
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployState::Committed | DeployState::RolledBack)
    }

    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: DeployState) -> bool {
        use DeployState::*;
        matches!(
            (self, target),
            (Idle, Validating)
                | (Validating, Staged)
                | (Validating, Idle)
                | (Staged, Migrating)
                | (Staged, Idle)
                | (Migrating, Linked)
                | (Migrating, Idle)
                | (Linked, HealthChecking)
                | (HealthChecking, Committed)
                | (HealthChecking, RolledBack)
                | (Committed, Idle)
                | (RolledBack, Idle)
        )
    }
}

/// Which operation a deployment performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployKind {
    /// First release onto an empty machine
    Install,
    /// Replace the active release with a newer one
    Upgrade,
    /// Operator-requested reversion to a previously-served release
    Rollback,
}

impl std::fmt::Display for DeployKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployKind::Install => write!(f, "install"),
            DeployKind::Upgrade => write!(f, "upgrade"),
            DeployKind::Rollback => write!(f, "rollback"),
        }
    }
}

/// One step of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStep {
    Validate,
    Stage,
    Migrate,
    Link,
    HealthCheck,
    Rollback,
    Commit,
}

/// Outcome of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Failed,
}

/// Structured per-step result; success is never inferred from prose
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Which step
    pub step: DeployStep,

    /// Ok or failed
    pub status: StepStatus,

    /// What happened
    pub detail: String,
}

/// Result of a deployment (deploy report)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployReport {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// Deployment id (ULID)
    pub deploy_id: String,

    /// Operation performed
    pub kind: DeployKind,

    /// Version serving before the deployment, if any
    pub from_version: Option<Version>,

    /// Version the deployment targeted
    pub to_version: Version,

    /// Preflight outcome, when the deployment got that far
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preflight: Option<PreflightReport>,

    /// Ordered step results
    pub steps: Vec<StepResult>,

    /// Terminal state of the deployment
    pub final_state: DeployState,
}

impl DeployReport {
    /// True when the new release serves as the baseline
    pub fn committed(&self) -> bool {
        self.final_state == DeployState::Committed
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Render for a terminal
    pub fn to_human(&self) -> String {
        let mut out = format!(
            "{} {} ({} -> {})\n",
            self.kind,
            self.to_version,
            self.from_version
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "none".to_string()),
            self.to_version
        );
        if let Some(preflight) = &self.preflight {
            out.push_str(&preflight.to_human());
        }
        for step in &self.steps {
            let tag = match step.status {
                StepStatus::Ok => "ok",
                StepStatus::Failed => "FAILED",
            };
            out.push_str(&format!("  {tag:6}  {:12} {}\n", format!("{:?}", step.step).to_lowercase(), step.detail));
        }
        out.push_str(&format!("Final state: {:?}\n", self.final_state));
        out
    }
}

/// Errors from deployment operations
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("migration failed; staged release retained, previous release still serving: {0}")]
    Migration(#[from] MigrationError),

    #[error("preflight failed")]
    Validation(Box<PreflightReport>),

    #[error("a release is already installed ({0}); use upgrade")]
    AlreadyInstalled(Version),

    #[error("no release installed; use install")]
    NothingInstalled,

    #[error("deployment cancelled before link; staged release discarded")]
    Cancelled,

    #[error("runtime environment setup failed: {0}")]
    SetupFailed(String),

    #[error("active pointer swap failed: {0}")]
    Cutover(String),

    #[error("first install failed its health check ({0}); pointer cleared, service stopped")]
    FirstInstallUnhealthy(String),

    #[error("rollback health check failed ({0}); halting, operator intervention required")]
    Rollback(String),

    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: DeployState, to: DeployState },
}

/// Result type for deployment operations
pub type DeployResult<T> = Result<T, DeployError>;

/// Collaborator commands and policies for one engine
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Health polling policy
    pub retry: RetryPolicy,

    /// How long to wait for the store lock
    pub lock_timeout: Duration,

    /// Command printing the runtime's version, for preflight
    pub runtime_version_command: Option<Vec<String>>,

    /// Command printing service status JSON, for preflight
    pub service_status_command: Option<Vec<String>>,

    /// Command constructing the release-scoped runtime environment,
    /// run inside the freshly staged release directory
    pub setup_command: Option<Vec<String>>,

    /// Public key artifacts must verify against, when provisioned
    pub verifying_key: Option<VerifyingKey>,
}

/// The cutover engine: stages, migrates, links, health-checks, reverts
pub struct CutoverEngine<'a> {
    store: &'a ReleaseStore,
    shared: &'a SharedState,
    probe: &'a dyn HealthProbe,
    supervisor: &'a dyn Supervisor,
    options: EngineOptions,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> CutoverEngine<'a> {
    /// Create an engine over a store and shared state
    pub fn new(
        store: &'a ReleaseStore,
        shared: &'a SharedState,
        probe: &'a dyn HealthProbe,
        supervisor: &'a dyn Supervisor,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            shared,
            probe,
            supervisor,
            options,
            cancel: None,
        }
    }

    /// Attach an operator cancellation flag, honored before Linked only
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn lock_timeout(&self) -> Duration {
        if self.options.lock_timeout.is_zero() {
            Duration::from_secs(5)
        } else {
            self.options.lock_timeout
        }
    }

    /// Install or upgrade from an artifact.
    ///
    /// `DeployKind::Install` requires an empty machine; `DeployKind::Upgrade`
    /// requires an active release. Returns a report whose final state is
    /// `Committed` or `RolledBack`; hard failures return an error instead.
    pub fn deploy(&self, kind: DeployKind, artifact: &Path) -> DeployResult<DeployReport> {
        let _lock = self.store.lock(self.lock_timeout())?;

        let mut machine = StateMachine::new();
        let mut steps = Vec::new();
        let deploy_id = ulid::Ulid::new().to_string().to_lowercase();

        // Validating: nothing on disk changes.
        machine.transition(DeployState::Validating)?;
        let manifest = read_manifest_from_archive(artifact)?;
        manifest.validate()?;
        let from_version = self.store.active_version()?;

        match (kind, &from_version) {
            (DeployKind::Install, Some(active)) => {
                return Err(DeployError::AlreadyInstalled(active.clone()))
            }
            (DeployKind::Upgrade, None) => return Err(DeployError::NothingInstalled),
            _ => {}
        }

        let preflight = self.run_preflight(artifact, &manifest, &from_version);
        if !preflight.passed() {
            machine.transition(DeployState::Idle)?;
            return Err(DeployError::Validation(Box::new(preflight)));
        }
        steps.push(step_ok(DeployStep::Validate, "preflight passed"));

        if self.cancelled() {
            return Err(DeployError::Cancelled);
        }

        // Staged: extract, verify, set up the scoped runtime, link shared
        // state, write the commit marker. Pointer untouched.
        machine.transition(DeployState::Staged)?;
        let freshly_staged = self.stage(artifact, &manifest, &deploy_id)?;
        steps.push(step_ok(
            DeployStep::Stage,
            if freshly_staged {
                "release extracted and verified"
            } else {
                "release already staged; checksums verified"
            },
        ));

        if self.cancelled() {
            self.discard_stage(&manifest.version, freshly_staged);
            return Err(DeployError::Cancelled);
        }

        // Migrating: any failure aborts with the old release serving.
        machine.transition(DeployState::Migrating)?;
        let outcomes = MigrationRunner::new(&self.store.release_dir(&manifest.version), self.shared)
            .run(&manifest.migrations)?;
        steps.push(step_ok(
            DeployStep::Migrate,
            &format!("{} migrations ({} applied)", outcomes.len(), outcomes
                .iter()
                .filter(|o| o.status == crate::migrate::MigrationStatus::Applied)
                .count()),
        ));

        if self.cancelled() {
            self.discard_stage(&manifest.version, freshly_staged);
            return Err(DeployError::Cancelled);
        }

        // Linked: the one atomic operation. Nothing past this point is
        // cancellable; the deployment is driven to Committed or RolledBack.
        machine.transition(DeployState::Linked)?;
        self.store
            .pointer()
            .set_active(&manifest.version)
            .map_err(|e| DeployError::Cutover(e.to_string()))?;
        self.store.record_activation(&manifest.version, &deploy_id)?;
        steps.push(step_ok(
            DeployStep::Link,
            &format!("active pointer -> {}", manifest.version),
        ));
        info!(version = %manifest.version, "active pointer swapped");

        let restart_failure = self.supervisor.restart().err();
        if let Some(e) = &restart_failure {
            warn!(error = %e, "supervisor restart failed; health check will decide");
        }

        // HealthChecking: bounded polling, then commit or revert.
        machine.transition(DeployState::HealthChecking)?;
        let verdict = self.options.retry.await_healthy(self.probe);

        match verdict {
            HealthVerdict::Healthy { attempts } => {
                steps.push(step_ok(
                    DeployStep::HealthCheck,
                    &format!("service healthy after {attempts} attempt(s)"),
                ));
                machine.transition(DeployState::Committed)?;
                steps.push(step_ok(
                    DeployStep::Commit,
                    &format!("{} is the new baseline", manifest.version),
                ));
                Ok(self.report(deploy_id, kind, from_version, manifest.version, Some(preflight), steps, machine))
            }
            HealthVerdict::Unhealthy { attempts, last_reason, .. } => {
                let reason = restart_failure
                    .map(|e| e.to_string())
                    .unwrap_or(last_reason);
                steps.push(step_failed(
                    DeployStep::HealthCheck,
                    &format!("unhealthy after {attempts} attempt(s): {reason}"),
                ));

                match &from_version {
                    Some(prior) => {
                        self.revert_to(prior, &deploy_id, &mut steps)?;
                        machine.transition(DeployState::RolledBack)?;
                        Ok(self.report(deploy_id, kind, from_version.clone(), manifest.version, Some(preflight), steps, machine))
                    }
                    None => {
                        // First install: nothing to roll back to. Clear the
                        // pointer and fail loudly.
                        self.store.pointer().clear().map_err(StoreError::from)?;
                        if let Err(e) = self.supervisor.stop() {
                            warn!(error = %e, "supervisor stop failed after unhealthy first install");
                        }
                        error!(%reason, "first install unhealthy; pointer cleared");
                        Err(DeployError::FirstInstallUnhealthy(reason))
                    }
                }
            }
        }
    }

    /// Explicit operator rollback to the most recent previously-served
    /// release. Fails fatally when none exists.
    pub fn rollback(&self) -> DeployResult<DeployReport> {
        let _lock = self.store.lock(self.lock_timeout())?;

        let mut machine = StateMachine::new();
        let mut steps = Vec::new();
        let deploy_id = ulid::Ulid::new().to_string().to_lowercase();

        machine.transition(DeployState::Validating)?;
        let active = self.store.active_version()?.ok_or(DeployError::NothingInstalled)?;
        let target = self
            .store
            .rollback_target(&active)?
            .ok_or(DeployError::Store(StoreError::NoRollbackTarget))?;
        steps.push(step_ok(
            DeployStep::Validate,
            &format!("rolling back {active} -> {target}"),
        ));

        // Same Linked → HealthChecking transitions as a deployment; the
        // staged/migrating phases have no work to do.
        machine.transition(DeployState::Staged)?;
        machine.transition(DeployState::Migrating)?;
        machine.transition(DeployState::Linked)?;
        self.store
            .pointer()
            .set_active(&target)
            .map_err(|e| DeployError::Cutover(e.to_string()))?;
        self.store.record_activation(&target, &deploy_id)?;
        steps.push(step_ok(DeployStep::Link, &format!("active pointer -> {target}")));

        if let Err(e) = self.supervisor.restart() {
            warn!(error = %e, "supervisor restart failed; health check will decide");
        }

        machine.transition(DeployState::HealthChecking)?;
        match self.options.retry.await_healthy(self.probe) {
            HealthVerdict::Healthy { attempts } => {
                steps.push(step_ok(
                    DeployStep::HealthCheck,
                    &format!("service healthy after {attempts} attempt(s)"),
                ));
                machine.transition(DeployState::Committed)?;
                steps.push(step_ok(DeployStep::Commit, &format!("{target} serving")));
                Ok(self.report(deploy_id, DeployKind::Rollback, Some(active), target, None, steps, machine))
            }
            HealthVerdict::Unhealthy { last_reason, .. } => {
                // The reversion itself failed; no second automatic attempt.
                Err(DeployError::Rollback(last_reason))
            }
        }
    }

    /// Revert the pointer to `prior` and confirm the reversion with a
    /// second health check. That failing too escalates to a fatal stop.
    fn revert_to(
        &self,
        prior: &Version,
        deploy_id: &str,
        steps: &mut Vec<StepResult>,
    ) -> DeployResult<()> {
        warn!(%prior, "health check failed; reverting active pointer");
        self.store
            .pointer()
            .set_active(prior)
            .map_err(|e| DeployError::Rollback(format!("pointer revert failed: {e}")))?;
        self.store.record_activation(prior, deploy_id)?;

        if let Err(e) = self.supervisor.restart() {
            return Err(DeployError::Rollback(format!("supervisor restart failed: {e}")));
        }

        match self.options.retry.await_healthy(self.probe) {
            HealthVerdict::Healthy { attempts } => {
                steps.push(step_ok(
                    DeployStep::Rollback,
                    &format!("reverted to {prior}; healthy after {attempts} attempt(s)"),
                ));
                Ok(())
            }
            HealthVerdict::Unhealthy { last_reason, .. } => {
                error!(%prior, %last_reason, "reversion health check failed; halting");
                Err(DeployError::Rollback(last_reason))
            }
        }
    }

    fn run_preflight(
        &self,
        artifact: &Path,
        manifest: &ReleaseManifest,
        active: &Option<Version>,
    ) -> PreflightReport {
        let signature = evaluate_signature(artifact, self.options.verifying_key.as_ref());
        let machine = MachineState::gather(&GatherSpec {
            install_root: self.store.root(),
            required_dirs: vec![
                self.store.root().to_path_buf(),
                self.store.root().join(crate::store::RELEASES_DIR),
                self.shared.root().to_path_buf(),
            ],
            runtime_version_command: self.options.runtime_version_command.clone(),
            service_status_command: self.options.service_status_command.clone(),
            active_version: active.clone(),
        });
        preflight::evaluate(manifest, &machine, &signature)
    }

    /// Extract and verify the release; returns whether it was freshly
    /// staged (vs. reusing a complete directory from an earlier attempt).
    fn stage(
        &self,
        artifact: &Path,
        manifest: &ReleaseManifest,
        deploy_id: &str,
    ) -> DeployResult<bool> {
        let version = &manifest.version;

        if self.store.is_complete(version) {
            // Immutable once complete: verify, never re-extract.
            self.store.verify_release(manifest)?;
            return Ok(false);
        }

        let release_dir = self.store.unpack_archive(artifact, version)?;
        self.store.verify_release(manifest)?;
        self.run_setup(&release_dir)?;
        self.shared
            .link_into(&release_dir)
            .map_err(StoreError::from)?;

        // Commit marker last: only now is the release complete.
        self.store.write_record(&ReleaseRecord {
            schema_version: RELEASE_RECORD_SCHEMA_VERSION,
            schema_id: RELEASE_RECORD_SCHEMA_ID.to_string(),
            version: version.clone(),
            installed_at: Utc::now(),
            deploy_id: deploy_id.to_string(),
            artifact_sha256: checksum_file(artifact)?,
        })?;
        Ok(true)
    }

    /// Construct the isolated runtime environment scoped to the release
    /// directory; a prior release's environment is never touched.
    fn run_setup(&self, release_dir: &Path) -> DeployResult<()> {
        let Some(command) = &self.options.setup_command else {
            return Ok(());
        };
        let Some((program, args)) = command.split_first() else {
            return Ok(());
        };

        info!(command = %command.join(" "), dir = %release_dir.display(), "runtime setup");
        let output = std::process::Command::new(program)
            .args(args)
            .current_dir(release_dir)
            .env(crate::migrate::ENV_RELEASE_DIR, release_dir)
            .env(crate::migrate::ENV_SHARED_DIR, self.shared.root())
            .output()
            .map_err(|e| DeployError::SetupFailed(format!("failed to spawn {program}: {e}")))?;

        if !output.status.success() {
            return Err(DeployError::SetupFailed(format!(
                "{program} exited with {}",
                output.status
            )));
        }
        Ok(())
    }

    fn discard_stage(&self, version: &Version, freshly_staged: bool) {
        if freshly_staged {
            let _ = fs::remove_dir_all(self.store.release_dir(version));
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        deploy_id: String,
        kind: DeployKind,
        from_version: Option<Version>,
        to_version: Version,
        preflight: Option<PreflightReport>,
        steps: Vec<StepResult>,
        machine: StateMachine,
    ) -> DeployReport {
        DeployReport {
            schema_version: DEPLOY_SCHEMA_VERSION,
            schema_id: DEPLOY_SCHEMA_ID.to_string(),
            deploy_id,
            kind,
            from_version,
            to_version,
            preflight,
            steps,
            final_state: machine.state,
        }
    }
}

/// Transition-guarded deployment state
struct StateMachine {
    state: DeployState,
}

impl StateMachine {
    fn new() -> Self {
        Self {
            state: DeployState::Idle,
        }
    }

    fn transition(&mut self, target: DeployState) -> DeployResult<()> {
        if !self.state.can_transition_to(target) {
            return Err(DeployError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        Ok(())
    }
}

fn step_ok(step: DeployStep, detail: &str) -> StepResult {
    StepResult {
        step,
        status: StepStatus::Ok,
        detail: detail.to_string(),
    }
}

fn step_failed(step: DeployStep, detail: &str) -> StepResult {
    StepResult {
        step,
        status: StepStatus::Failed,
        detail: detail.to_string(),
    }
}

/// Read the manifest out of a release archive without unpacking it
pub fn read_manifest_from_archive(artifact: &Path) -> DeployResult<ReleaseManifest> {
    let file = fs::File::open(artifact).map_err(ManifestError::Io)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);

    for entry in tar.entries().map_err(ManifestError::Io)? {
        let mut entry = entry.map_err(ManifestError::Io)?;
        let is_manifest = {
            let path = entry.path().map_err(ManifestError::Io)?;
            path.as_os_str() == MANIFEST_FILENAME
        };
        if is_manifest {
            let mut json = String::new();
            entry
                .read_to_string(&mut json)
                .map_err(ManifestError::Io)?;
            return Ok(ReleaseManifest::from_json(&json).map_err(ManifestError::Json)?);
        }
    }

    Err(DeployError::Manifest(ManifestError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("{MANIFEST_FILENAME} not found in archive"),
    ))))
}
