//! Shared fixtures for deployment integration tests

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cutover::builder::{BuildSpec, Builder, ComponentSpec};
use cutover::engine::{EngineOptions, RetryPolicy};
use cutover::manifest::{Channel, Requirements};
use cutover::store::{ReleaseStore, SharedState};
use semver::Version;
use tempfile::TempDir;

/// A target machine in a temp directory: store plus shared state
pub struct TargetFixture {
    /// Held for its Drop; everything below lives inside it
    #[allow(dead_code)]
    pub dir: TempDir,
    pub store: ReleaseStore,
    pub shared: SharedState,
}

impl TargetFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = ReleaseStore::open(dir.path().join("srv")).unwrap();
        let shared = SharedState::open(dir.path().join("srv/shared")).unwrap();
        Self { dir, store, shared }
    }

    /// Engine options tuned for tests: fast retries, short lock wait
    pub fn options(&self) -> EngineOptions {
        EngineOptions {
            retry: RetryPolicy {
                max_attempts: 2,
                delay_ms: 1,
                timeout_secs: 30,
            },
            lock_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }
}

/// Options for building a test artifact
pub struct ArtifactSpec<'a> {
    pub version: &'a str,
    /// (id, shell body) pairs written as executable migration scripts
    pub migrations: &'a [(&'a str, &'a str)],
    pub min_compatible: Option<&'a str>,
    pub disk_mb: u64,
}

impl Default for ArtifactSpec<'_> {
    fn default() -> Self {
        Self {
            version: "1.0.0",
            migrations: &[],
            min_compatible: None,
            disk_mb: 1,
        }
    }
}

/// Build a release archive into `out`; returns the artifact path
pub fn build_artifact(out: &Path, spec: &ArtifactSpec<'_>) -> PathBuf {
    let source = TempDir::new().unwrap();
    fs::create_dir_all(source.path().join("app")).unwrap();
    fs::write(
        source.path().join("app/server.py"),
        format!("VERSION = \"{}\"\n", spec.version),
    )
    .unwrap();

    if !spec.migrations.is_empty() {
        let dir = source.path().join("migrations");
        fs::create_dir_all(&dir).unwrap();
        for (id, body) in spec.migrations {
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
    }

    let build_spec = BuildSpec {
        name: "orderd".to_string(),
        arch: Some("x86_64".to_string()),
        components: vec![ComponentSpec {
            name: "backend".to_string(),
            path: "app".to_string(),
            required: true,
        }],
        ui: None,
        excludes: Vec::new(),
        requirements: Requirements {
            runtime: None,
            disk_mb: spec.disk_mb,
            ram_mb: 1,
        },
        min_compatible: spec.min_compatible.map(|v| Version::parse(v).unwrap()),
    };

    Builder::new(source.path().to_path_buf(), out.to_path_buf(), build_spec)
        .build(
            Some(Version::parse(spec.version).unwrap()),
            Channel::Stable,
            None,
        )
        .unwrap()
        .artifact
}
