//! Preflight validation
//!
//! Gates install/upgrade against a target machine's environment and
//! business state. Every check runs regardless of earlier failures; the
//! verdict is the AND of fatal checks only. Warnings are surfaced but
//! never block.

mod machine;

pub use machine::{DirAccess, GatherSpec, MachineState};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::ReleaseManifest;
use crate::signing::SignatureStatus;

/// Schema version for preflight reports
pub const PREFLIGHT_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for preflight reports
pub const PREFLIGHT_SCHEMA_ID: &str = "cutover/preflight@1";

/// The individual preflight checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    DiskSpace,
    RuntimeVersion,
    VersionCompatibility,
    ServiceIdle,
    Memory,
    DirWritability,
    Signature,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CheckKind::DiskSpace => "disk_space",
            CheckKind::RuntimeVersion => "runtime_version",
            CheckKind::VersionCompatibility => "version_compatibility",
            CheckKind::ServiceIdle => "service_idle",
            CheckKind::Memory => "memory",
            CheckKind::DirWritability => "dir_writability",
            CheckKind::Signature => "signature",
        };
        write!(f, "{name}")
    }
}

/// Outcome of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warn,
}

/// One evaluated check with its detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightCheck {
    /// Which check this is
    pub kind: CheckKind,

    /// Pass, fail, or warn
    pub status: CheckStatus,

    /// Names the specific requirement and what was found
    pub detail: String,
}

/// Overall verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Result of validating one manifest against one machine (preflight.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightReport {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// When the validation ran
    pub created_at: DateTime<Utc>,

    /// Version being validated
    pub version: String,

    /// Every check outcome, in evaluation order
    pub checks: Vec<PreflightCheck>,

    /// AND of fatal checks
    pub verdict: Verdict,
}

impl PreflightReport {
    /// True when no fatal check failed
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// Check outcomes with warnings, for surfacing
    pub fn warnings(&self) -> impl Iterator<Item = &PreflightCheck> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Warn)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Render for a terminal
    pub fn to_human(&self) -> String {
        let mut out = format!("Preflight for version {}\n", self.version);
        for check in &self.checks {
            let tag = match check.status {
                CheckStatus::Pass => "PASS",
                CheckStatus::Fail => "FAIL",
                CheckStatus::Warn => "WARN",
            };
            out.push_str(&format!("  {tag:4}  {:22} {}\n", check.kind.to_string(), check.detail));
        }
        out.push_str(&format!(
            "Verdict: {}\n",
            if self.passed() { "pass" } else { "fail" }
        ));
        out
    }
}

/// Validate a manifest against observed machine state.
///
/// Pure: callers gather [`MachineState`] (and evaluate the signature)
/// separately, which is what makes the checks unit-testable.
pub fn evaluate(
    manifest: &ReleaseManifest,
    machine: &MachineState,
    signature: &SignatureStatus,
) -> PreflightReport {
    let checks = vec![
        check_disk(manifest, machine),
        check_runtime(manifest, machine),
        check_compatibility(manifest, machine),
        check_service_idle(machine),
        check_memory(manifest, machine),
        check_dir_writability(machine),
        check_signature(signature),
    ];

    let verdict = if checks.iter().any(|c| c.status == CheckStatus::Fail) {
        Verdict::Fail
    } else {
        Verdict::Pass
    };

    PreflightReport {
        schema_version: PREFLIGHT_SCHEMA_VERSION,
        schema_id: PREFLIGHT_SCHEMA_ID.to_string(),
        created_at: Utc::now(),
        version: manifest.version.to_string(),
        checks,
        verdict,
    }
}

fn check_disk(manifest: &ReleaseManifest, machine: &MachineState) -> PreflightCheck {
    let required = manifest.requirements.disk_mb;
    let (status, detail) = match machine.free_disk_mb {
        // Undetermined free space is a fail, not a shrug.
        None => (
            CheckStatus::Fail,
            format!("free disk undetermined; {required} MB required"),
        ),
        Some(free) if free < required => (
            CheckStatus::Fail,
            format!("free disk {free} MB < required {required} MB"),
        ),
        Some(free) => (
            CheckStatus::Pass,
            format!("free disk {free} MB >= required {required} MB"),
        ),
    };
    PreflightCheck {
        kind: CheckKind::DiskSpace,
        status,
        detail,
    }
}

fn check_runtime(manifest: &ReleaseManifest, machine: &MachineState) -> PreflightCheck {
    let (status, detail) = match (&manifest.requirements.runtime, &machine.runtime_version) {
        (None, _) => (CheckStatus::Pass, "no runtime requirement".to_string()),
        (Some(req), None) => (
            CheckStatus::Fail,
            format!("runtime not found; {req} required"),
        ),
        (Some(req), Some(found)) if !req.matches(found) => (
            CheckStatus::Fail,
            format!("runtime {found} does not satisfy {req}"),
        ),
        (Some(req), Some(found)) => {
            (CheckStatus::Pass, format!("runtime {found} satisfies {req}"))
        }
    };
    PreflightCheck {
        kind: CheckKind::RuntimeVersion,
        status,
        detail,
    }
}

fn check_compatibility(manifest: &ReleaseManifest, machine: &MachineState) -> PreflightCheck {
    let (status, detail) = match (&manifest.min_compatible, &machine.active_version) {
        (_, None) => (CheckStatus::Pass, "fresh install".to_string()),
        (None, Some(active)) => (
            CheckStatus::Pass,
            format!("no minimum-compatible bound; active {active}"),
        ),
        (Some(min), Some(active)) if active < min => (
            CheckStatus::Fail,
            format!("active {active} older than minimum compatible {min}"),
        ),
        (Some(min), Some(active)) => (
            CheckStatus::Pass,
            format!("active {active} >= minimum compatible {min}"),
        ),
    };
    PreflightCheck {
        kind: CheckKind::VersionCompatibility,
        status,
        detail,
    }
}

fn check_service_idle(machine: &MachineState) -> PreflightCheck {
    let (status, detail) = match machine.service_busy {
        Some(true) => (
            CheckStatus::Fail,
            "service reports a long-running operation in progress".to_string(),
        ),
        Some(false) => (CheckStatus::Pass, "service idle".to_string()),
        // Unreachable must not block first installs.
        None => (
            CheckStatus::Warn,
            "service status unreachable; treating as not running".to_string(),
        ),
    };
    PreflightCheck {
        kind: CheckKind::ServiceIdle,
        status,
        detail,
    }
}

fn check_memory(manifest: &ReleaseManifest, machine: &MachineState) -> PreflightCheck {
    let required = manifest.requirements.ram_mb;
    let (status, detail) = match machine.available_ram_mb {
        None => (
            CheckStatus::Warn,
            format!("available memory undetermined; {required} MB recommended"),
        ),
        Some(avail) if avail < required => (
            CheckStatus::Warn,
            format!("available memory {avail} MB < recommended {required} MB"),
        ),
        Some(avail) => (
            CheckStatus::Pass,
            format!("available memory {avail} MB >= recommended {required} MB"),
        ),
    };
    PreflightCheck {
        kind: CheckKind::Memory,
        status,
        detail,
    }
}

fn check_dir_writability(machine: &MachineState) -> PreflightCheck {
    let blocked: Vec<String> = machine
        .dir_access
        .iter()
        .filter(|d| !d.writable)
        .map(|d| d.path.display().to_string())
        .collect();

    let (status, detail) = if blocked.is_empty() {
        (
            CheckStatus::Pass,
            format!("{} required paths writable", machine.dir_access.len()),
        )
    } else {
        (
            CheckStatus::Fail,
            format!("not writable: {}", blocked.join(", ")),
        )
    };
    PreflightCheck {
        kind: CheckKind::DirWritability,
        status,
        detail,
    }
}

fn check_signature(signature: &SignatureStatus) -> PreflightCheck {
    let (status, detail) = match signature {
        SignatureStatus::Valid { fingerprint } => (
            CheckStatus::Pass,
            format!("signature verified (signer {})", &fingerprint[..12.min(fingerprint.len())]),
        ),
        // Unsigned development builds are permitted, loudly.
        SignatureStatus::Missing => (CheckStatus::Warn, "artifact is unsigned".to_string()),
        SignatureStatus::Invalid { reason } => {
            (CheckStatus::Fail, format!("invalid signature: {reason}"))
        }
    };
    PreflightCheck {
        kind: CheckKind::Signature,
        status,
        detail,
    }
}
