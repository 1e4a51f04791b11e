//! Machine state gathering
//!
//! Probes the target machine for the facts preflight checks evaluate:
//! free disk, available memory, installed runtime version, service
//! business state, and directory writability. Gathering never fails hard;
//! anything undetermined is reported as such and judged by the checks.

use std::path::{Path, PathBuf};
use std::process::Command;

use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Writability of one required path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirAccess {
    /// The path that must be present-or-creatable and writable
    pub path: PathBuf,

    /// Whether the installing principal can write it
    pub writable: bool,
}

/// Observed facts about the target machine
#[derive(Debug, Clone)]
pub struct MachineState {
    /// Free disk at the install root, MB; None when undetermined
    pub free_disk_mb: Option<u64>,

    /// Available memory, MB; None when undetermined
    pub available_ram_mb: Option<u64>,

    /// Installed runtime version; None when the runtime is missing
    pub runtime_version: Option<Version>,

    /// Version currently serving, if any
    pub active_version: Option<Version>,

    /// Whether the service reports a long-running operation;
    /// None when the service is unreachable
    pub service_busy: Option<bool>,

    /// Writability of every required path
    pub dir_access: Vec<DirAccess>,
}

/// What to probe and how
#[derive(Debug, Clone)]
pub struct GatherSpec<'a> {
    /// Filesystem the release will land on
    pub install_root: &'a Path,

    /// Paths that must be present-or-creatable and writable
    pub required_dirs: Vec<PathBuf>,

    /// Command printing the runtime's version (e.g. ["python3", "--version"])
    pub runtime_version_command: Option<Vec<String>>,

    /// Command printing service status JSON with a boolean "busy" field
    pub service_status_command: Option<Vec<String>>,

    /// Version currently serving, resolved through the active pointer
    pub active_version: Option<Version>,
}

impl MachineState {
    /// Probe the real machine
    pub fn gather(spec: &GatherSpec<'_>) -> Self {
        let dir_access = spec
            .required_dirs
            .iter()
            .map(|path| DirAccess {
                path: path.clone(),
                writable: probe_writable(path),
            })
            .collect();

        Self {
            free_disk_mb: free_disk_mb(spec.install_root),
            available_ram_mb: available_ram_mb(),
            runtime_version: spec
                .runtime_version_command
                .as_deref()
                .and_then(runtime_version),
            active_version: spec.active_version.clone(),
            service_busy: spec
                .service_status_command
                .as_deref()
                .and_then(service_busy),
            dir_access,
        }
    }
}

/// Free space on the filesystem holding `path`, in MB
#[cfg(unix)]
pub fn free_disk_mb(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    // Walk up to the nearest existing ancestor; the install root may not
    // exist yet on a first install.
    let mut probe = path;
    while !probe.exists() {
        probe = probe.parent()?;
    }

    let c_path = CString::new(probe.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }

    let bytes = (stat.f_bavail as u64).checked_mul(stat.f_frsize as u64)?;
    Some(bytes / (1024 * 1024))
}

#[cfg(not(unix))]
pub fn free_disk_mb(_path: &Path) -> Option<u64> {
    None
}

/// Available memory in MB, from /proc/meminfo
pub fn available_ram_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb / 1024);
        }
    }
    None
}

/// Run the runtime's version command and extract a semver from its output
pub fn runtime_version(command: &[String]) -> Option<Version> {
    let output = run_command(command)?;
    parse_version_output(&output)
}

/// Extract the first x.y[.z] from command output (e.g. "Python 3.11.4")
pub fn parse_version_output(output: &str) -> Option<Version> {
    let re = regex_lite::Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").ok()?;
    let caps = re.captures(output)?;

    let major = caps.get(1)?.as_str().parse().ok()?;
    let minor = caps.get(2)?.as_str().parse().ok()?;
    let patch = caps
        .get(3)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    Some(Version::new(major, minor, patch))
}

/// Query the service's status interface for a "busy" flag.
///
/// Returns None when the service is unreachable or its output is not the
/// expected JSON; preflight treats that as a warning, not a failure.
pub fn service_busy(command: &[String]) -> Option<bool> {
    let output = run_command(command)?;
    let value: serde_json::Value = serde_json::from_str(output.trim()).ok()?;
    value.get("busy")?.as_bool()
}

fn run_command(command: &[String]) -> Option<String> {
    let (program, args) = command.split_first()?;
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        debug!(%program, status = %output.status, "probe command failed");
        return None;
    }
    // Some runtimes print their version to stderr.
    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    if text.trim().is_empty() {
        text = String::from_utf8_lossy(&output.stderr).to_string();
    }
    Some(text)
}

/// A path is writable when it exists (or can be created) and a probe file
/// can be written inside it.
fn probe_writable(path: &Path) -> bool {
    if !path.exists() && std::fs::create_dir_all(path).is_err() {
        return false;
    }

    let probe = path.join(format!(".cutover-write-probe-{}", std::process::id()));
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
