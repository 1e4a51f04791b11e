//! Artifact builder
//!
//! Assembles a staged release tree from a source checkout, computes
//! per-component checksums, emits the manifest, and packages everything
//! into a deterministic compressed archive with a checksum companion.
//! Side effects are confined to the output directory.

mod exclude;

pub use exclude::{ExcludeError, ExcludeRules};

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use semver::Version;
use serde::{Deserialize, Serialize};
use tar::{Builder as TarBuilder, Header};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::manifest::{
    component_digest, Channel, FileDigest, ManifestError, ReleaseManifest, Requirements,
    MANIFEST_FILENAME, MANIFEST_SCHEMA_ID, MANIFEST_SCHEMA_VERSION,
};
use crate::signing::{sha256_hex, signature_path, DetachedSignature, SigningError};

/// Directory name for migration scripts, in source trees and releases
pub const MIGRATIONS_DIR: &str = "migrations";

/// Directory name for operator assets inside a release
pub const DEPLOY_DIR: &str = "deploy";

/// Ignore file consulted in the source root
pub const IGNORE_FILENAME: &str = ".cutoverignore";

/// Errors from artifact assembly
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("exclude rules error: {0}")]
    Exclude(#[from] ExcludeError),

    #[error("signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("required component {name} missing at {path}")]
    MissingComponent { name: String, path: PathBuf },

    #[error("no version given and none derivable from source control: {0}")]
    NoVersion(String),

    #[error("invalid version {value}: {reason}")]
    InvalidVersion { value: String, reason: String },
}

/// Result type for build operations
pub type BuildResult<T> = Result<T, BuildError>;

/// One shipped component of the release
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Component name; becomes a top-level directory in the release
    pub name: String,

    /// Path relative to the source root
    pub path: String,

    /// A missing required component aborts the build
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

/// Optional frontend sub-build run before staging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiBuildSpec {
    /// Component name for the produced tree
    pub name: String,

    /// Directory (relative to source root) the command runs in
    pub path: String,

    /// Build command and arguments
    pub command: Vec<String>,

    /// Output tree (relative to `path`) copied into the release
    pub dist: String,
}

/// Everything the builder needs besides version/channel
#[derive(Debug, Clone)]
pub struct BuildSpec {
    /// Product name
    pub name: String,

    /// Target architecture; defaults to the build host's
    pub arch: Option<String>,

    /// Shipped components
    pub components: Vec<ComponentSpec>,

    /// Optional frontend sub-build
    pub ui: Option<UiBuildSpec>,

    /// Extra exclude patterns on top of the defaults
    pub excludes: Vec<String>,

    /// Requirements stamped into the manifest
    pub requirements: Requirements,

    /// Oldest active version this release can upgrade from
    pub min_compatible: Option<Version>,
}

/// Result of a successful build
#[derive(Debug)]
pub struct BuildReport {
    /// The emitted manifest
    pub manifest: ReleaseManifest,

    /// Staged release tree in the output directory
    pub staged_dir: PathBuf,

    /// Packaged archive path
    pub artifact: PathBuf,

    /// SHA-256 of the archive bytes
    pub artifact_sha256: String,

    /// Checksum companion path
    pub checksum_file: PathBuf,

    /// Detached signature path, when signing was requested
    pub signature_file: Option<PathBuf>,

    /// Non-fatal degradations (e.g. a failed optional UI build)
    pub warnings: Vec<String>,
}

/// Artifact builder for one source tree
pub struct Builder {
    source_root: PathBuf,
    out_dir: PathBuf,
    spec: BuildSpec,
}

impl Builder {
    /// Create a builder over a source root, writing into `out_dir`
    pub fn new(source_root: PathBuf, out_dir: PathBuf, spec: BuildSpec) -> Self {
        Self {
            source_root,
            out_dir,
            spec,
        }
    }

    /// Run the build: stage, checksum, manifest, archive, companions.
    ///
    /// `version` may be omitted when the source tree is a git checkout with
    /// a describable tag. A failing optional UI sub-build degrades to a
    /// backend-only release and is surfaced as a warning.
    pub fn build(
        &self,
        version: Option<Version>,
        channel: Channel,
        signing_key: Option<&SigningKey>,
    ) -> BuildResult<BuildReport> {
        let mut warnings = Vec::new();

        let version = match version {
            Some(v) => v,
            None => self.version_from_git()?,
        };
        let arch = self
            .spec
            .arch
            .clone()
            .unwrap_or_else(|| std::env::consts::ARCH.to_string());
        let source_revision = self.revision_from_git(&mut warnings);
        let built_at = self.commit_time_from_git(&mut warnings);

        info!(name = %self.spec.name, %version, %channel, "building release");

        fs::create_dir_all(&self.out_dir)?;
        let stage = self
            .out_dir
            .join(format!(".stage-{}", ulid::Ulid::new().to_string().to_lowercase()));
        fs::create_dir_all(&stage)?;

        let result = self.build_into(&stage, &version, channel, &arch, source_revision, built_at, signing_key, &mut warnings);

        match result {
            Ok(report) => Ok(report),
            Err(e) => {
                // No partial artifact is ever published.
                let _ = fs::remove_dir_all(&stage);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_into(
        &self,
        stage: &Path,
        version: &Version,
        channel: Channel,
        arch: &str,
        source_revision: String,
        built_at: DateTime<Utc>,
        signing_key: Option<&SigningKey>,
        warnings: &mut Vec<String>,
    ) -> BuildResult<BuildReport> {
        let excludes = self.exclude_rules()?;

        // Optional UI sub-build first; its output becomes a component.
        let mut components = self.spec.components.clone();
        if let Some(ui) = &self.spec.ui {
            match self.run_ui_build(ui) {
                Ok(dist) => components.push(ComponentSpec {
                    name: ui.name.clone(),
                    path: dist,
                    required: true,
                }),
                Err(reason) => {
                    warn!(%reason, "UI sub-build failed; producing backend-only release");
                    warnings.push(format!(
                        "UI sub-build failed ({reason}); release is backend-only"
                    ));
                }
            }
        }

        let mut checksums = BTreeMap::new();
        for component in &components {
            let src = self.source_root.join(&component.path);
            if !src.exists() {
                if component.required {
                    return Err(BuildError::MissingComponent {
                        name: component.name.clone(),
                        path: src,
                    });
                }
                warnings.push(format!(
                    "optional component {} missing at {}; skipped",
                    component.name,
                    src.display()
                ));
                continue;
            }

            let dest = stage.join(&component.name);
            let digests = copy_tree(&src, &dest, &excludes)?;
            debug!(component = %component.name, files = digests.len(), "staged component");
            checksums.insert(component.name.clone(), component_digest(&digests)?);
        }

        let migrations = self.stage_migrations(stage, &excludes)?;
        self.stage_operator_assets(stage)?;

        let manifest = ReleaseManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            schema_id: MANIFEST_SCHEMA_ID.to_string(),
            name: self.spec.name.clone(),
            version: version.clone(),
            channel,
            arch: arch.to_string(),
            built_at,
            source_revision,
            min_compatible: self.spec.min_compatible.clone(),
            checksums,
            requirements: self.spec.requirements.clone(),
            migrations,
        };
        manifest.validate()?;
        manifest.write_to_file(&stage.join(MANIFEST_FILENAME))?;

        // Archive the staged tree, then move the stage to its final name.
        let tar_bytes = canonical_tar(stage)?;
        let gz_bytes = gzip_deterministic(&tar_bytes)?;
        let artifact = self.out_dir.join(manifest.archive_name());
        fs::write(&artifact, &gz_bytes)?;
        let artifact_sha256 = sha256_hex(&gz_bytes);

        let checksum_file = crate::signing::write_checksum_file(&artifact)?;

        let signature_file = match signing_key {
            Some(key) => {
                let sig = DetachedSignature::sign(&gz_bytes, key);
                let path = signature_path(&artifact);
                sig.write_to_file(&path)?;
                Some(path)
            }
            None => None,
        };

        let staged_dir = self
            .out_dir
            .join(format!("{}-{}-{}", manifest.name, manifest.version, manifest.arch));
        if staged_dir.exists() {
            fs::remove_dir_all(&staged_dir)?;
        }
        fs::rename(stage, &staged_dir)?;

        info!(artifact = %artifact.display(), sha256 = %artifact_sha256, "release packaged");

        Ok(BuildReport {
            manifest,
            staged_dir,
            artifact,
            artifact_sha256,
            checksum_file,
            signature_file,
            warnings: std::mem::take(warnings),
        })
    }

    fn exclude_rules(&self) -> BuildResult<ExcludeRules> {
        let mut rules = ExcludeRules::new()?;
        let ignore = self.source_root.join(IGNORE_FILENAME);
        if ignore.exists() {
            rules = rules.with_ignore_file(&ignore)?;
        }
        if !self.spec.excludes.is_empty() {
            let patterns: Vec<&str> = self.spec.excludes.iter().map(String::as_str).collect();
            rules = rules.with_patterns(&patterns)?;
        }
        Ok(rules)
    }

    /// Run the UI sub-build; returns the dist path relative to source root
    fn run_ui_build(&self, ui: &UiBuildSpec) -> Result<String, String> {
        if ui.command.is_empty() {
            return Err("empty build command".to_string());
        }
        let cwd = self.source_root.join(&ui.path);
        let status = Command::new(&ui.command[0])
            .args(&ui.command[1..])
            .current_dir(&cwd)
            .status()
            .map_err(|e| format!("failed to spawn {}: {e}", ui.command[0]))?;
        if !status.success() {
            return Err(format!("{} exited with {status}", ui.command[0]));
        }

        let dist_rel = format!("{}/{}", ui.path, ui.dist);
        if !self.source_root.join(&dist_rel).exists() {
            return Err(format!("build produced no output at {dist_rel}"));
        }
        Ok(dist_rel)
    }

    /// Copy migration scripts into the stage; ids are sorted file names
    fn stage_migrations(&self, stage: &Path, excludes: &ExcludeRules) -> BuildResult<Vec<String>> {
        let src = self.source_root.join(MIGRATIONS_DIR);
        if !src.exists() {
            return Ok(Vec::new());
        }

        let dest = stage.join(MIGRATIONS_DIR);
        copy_tree(&src, &dest, excludes)?;

        let mut ids: Vec<String> = fs::read_dir(&dest)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Stage the supervisor unit, env template, and operator wrappers.
    ///
    /// The wrappers delegate to the `cutover` binary; all deployment logic
    /// lives in the commands, not in generated scripts.
    fn stage_operator_assets(&self, stage: &Path) -> BuildResult<()> {
        let deploy = stage.join(DEPLOY_DIR);
        fs::create_dir_all(&deploy)?;
        let name = &self.spec.name;

        fs::write(deploy.join(format!("{name}.service")), unit_template(name))?;
        fs::write(deploy.join("env.template"), env_template(name))?;

        for (file, subcommand) in [
            ("install.sh", "install"),
            ("upgrade.sh", "upgrade"),
            ("rollback.sh", "rollback"),
        ] {
            let path = deploy.join(file);
            fs::write(&path, wrapper_script(subcommand))?;
            set_executable(&path)?;
        }
        Ok(())
    }

    fn version_from_git(&self) -> BuildResult<Version> {
        let described = git_output(&self.source_root, &["describe", "--tags", "--always"])
            .map_err(BuildError::NoVersion)?;
        let trimmed = described.trim().trim_start_matches('v');
        Version::parse(trimmed).map_err(|e| BuildError::InvalidVersion {
            value: trimmed.to_string(),
            reason: e.to_string(),
        })
    }

    fn revision_from_git(&self, warnings: &mut Vec<String>) -> String {
        match git_output(&self.source_root, &["rev-parse", "--short=12", "HEAD"]) {
            Ok(rev) => rev.trim().to_string(),
            Err(e) => {
                warnings.push(format!("source revision unknown ({e})"));
                "untracked".to_string()
            }
        }
    }

    /// Commit time keeps manifests byte-identical across rebuilds of the
    /// same revision; uncommitted trees fall back to the epoch.
    fn commit_time_from_git(&self, warnings: &mut Vec<String>) -> DateTime<Utc> {
        match git_output(&self.source_root, &["log", "-1", "--format=%cI"]) {
            Ok(out) => match DateTime::parse_from_rfc3339(out.trim()) {
                Ok(t) => t.with_timezone(&Utc),
                Err(_) => {
                    warnings.push("unparseable commit time; built_at set to epoch".to_string());
                    DateTime::UNIX_EPOCH
                }
            },
            Err(e) => {
                warnings.push(format!("no commit time ({e}); built_at set to epoch"));
                DateTime::UNIX_EPOCH
            }
        }
    }
}

fn git_output(cwd: &Path, args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|e| format!("failed to run git: {e}"))?;
    if !output.status.success() {
        return Err(format!("git {} failed", args.join(" ")));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Copy a tree, applying excludes, preserving executable bits, and
/// collecting per-file digests relative to `dest`.
pub fn copy_tree(src: &Path, dest: &Path, excludes: &ExcludeRules) -> BuildResult<Vec<FileDigest>> {
    let mut digests = Vec::new();

    if src.is_file() {
        // Single-file component.
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dest)?;
        digests.push(FileDigest {
            path: dest
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            sha256: sha256_hex(&fs::read(dest)?),
        });
        return Ok(digests);
    }

    for entry in WalkDir::new(src)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        if rel.as_os_str().is_empty() || excludes.is_excluded(rel) {
            continue;
        }

        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            digests.push(FileDigest {
                path: rel.to_string_lossy().to_string(),
                sha256: sha256_hex(&fs::read(&target)?),
            });
        }
        // Symlinks inside components are not shipped; releases link only
        // to shared state, created at stage time.
    }

    Ok(digests)
}

/// Build a canonical tar of a directory: sorted paths, zeroed
/// mtime/uid/gid, modes normalized to 644/755.
pub fn canonical_tar(root: &Path) -> BuildResult<Vec<u8>> {
    let mut entries: Vec<(PathBuf, bool)> = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields paths under its root")
            .to_path_buf();
        if rel.as_os_str().is_empty() {
            continue;
        }
        entries.push((rel, entry.file_type().is_dir()));
    }
    entries.sort();

    let mut tar_buffer = Vec::new();
    {
        let mut builder = TarBuilder::new(&mut tar_buffer);

        for (rel, is_dir) in &entries {
            let full = root.join(rel);
            let mut header = Header::new_gnu();
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);

            if *is_dir {
                header.set_path(format!("{}/", rel.display()))?;
                header.set_size(0);
                header.set_mode(0o755);
                header.set_entry_type(tar::EntryType::Directory);
                header.set_cksum();
                builder.append(&header, &[] as &[u8])?;
            } else {
                let contents = fs::read(&full)?;
                header.set_path(rel)?;
                header.set_size(contents.len() as u64);
                header.set_mode(if is_executable(&full) { 0o755 } else { 0o644 });
                header.set_cksum();
                builder.append(&header, contents.as_slice())?;
            }
        }

        builder.finish()?;
    }
    Ok(tar_buffer)
}

/// Gzip with zeroed mtime and no embedded filename, for reproducibility
fn gzip_deterministic(bytes: &[u8]) -> io::Result<Vec<u8>> {
    use std::io::Write;

    let mut encoder = flate2::GzBuilder::new()
        .mtime(0)
        .write(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = fs::metadata(path) {
            return metadata.permissions().mode() & 0o111 != 0;
        }
    }
    false
}

fn set_executable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn unit_template(name: &str) -> String {
    format!(
        "[Unit]\n\
         Description={name} service\n\
         After=network.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         EnvironmentFile=/srv/{name}/shared/config/{name}.env\n\
         ExecStart=/srv/{name}/current/deploy/start.sh\n\
         Restart=on-failure\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}

fn env_template(name: &str) -> String {
    format!(
        "# Environment for {name}; copied to shared/config/{name}.env on first install\n\
         {upper}_SHARED_DIR=/srv/{name}/shared\n\
         {upper}_LISTEN_ADDR=127.0.0.1:8080\n",
        upper = name.to_uppercase().replace('-', "_")
    )
}

fn wrapper_script(subcommand: &str) -> String {
    format!("#!/bin/sh\nexec cutover {subcommand} \"$@\"\n")
}
