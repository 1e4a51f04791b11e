//! Configuration
//!
//! One cutover.toml drives both sides of the tool: the `[build]` section
//! in a source checkout, and the deployment sections on a target machine.
//! Built-in defaults underlie the file; CLI flags override both.

mod defaults;

pub use defaults::{
    CONFIG_FILENAME, DEFAULT_LOCK_TIMEOUT_SECS, DEFAULT_NAME, DEFAULT_OUT_DIR, DEFAULT_ROOT,
};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::builder::{BuildSpec, ComponentSpec, UiBuildSpec};
use crate::engine::{EngineOptions, RetryPolicy, RetryPolicyError};
use crate::manifest::Requirements;
use crate::signing::{load_verifying_key, SigningError};

/// Errors from configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parse error in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("public key unusable: {0}")]
    PublicKey(#[from] SigningError),

    #[error("health retry policy invalid: {0}")]
    Retry(#[from] RetryPolicyError),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level configuration (cutover.toml)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Deployment target settings
    pub deploy: DeploySection,

    /// Runtime collaborator commands
    pub runtime: RuntimeSection,

    /// Service status interface
    pub service: ServiceSection,

    /// Process supervisor commands
    pub supervisor: SupervisorSection,

    /// Health probe and retry policy
    pub health: HealthSection,

    /// Build settings (used in source checkouts)
    pub build: BuildSection,
}

/// `[deploy]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySection {
    /// Product name
    pub name: String,

    /// Deployment root; the store lives here, shared state beside it
    pub root: PathBuf,

    /// Shared state directory (default: <root>/shared)
    pub shared_dir: Option<PathBuf>,

    /// Path to the provisioned Ed25519 public key, when signing is used
    pub public_key: Option<PathBuf>,

    /// How long to wait for the store lock before rejecting
    pub lock_timeout_secs: u64,
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            name: defaults::name(),
            root: defaults::root(),
            shared_dir: None,
            public_key: None,
            lock_timeout_secs: defaults::lock_timeout_secs(),
        }
    }
}

/// `[runtime]`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeSection {
    /// Command printing the runtime's version (e.g. ["python3", "--version"])
    pub version_command: Option<Vec<String>>,

    /// Command constructing a release-scoped runtime environment,
    /// run inside the freshly staged release directory
    pub setup_command: Option<Vec<String>>,
}

/// `[service]`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceSection {
    /// Command printing service status JSON with a boolean "busy" field
    pub status_command: Option<Vec<String>>,
}

/// `[supervisor]`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SupervisorSection {
    /// Start command
    pub start: Vec<String>,

    /// Stop command
    pub stop: Vec<String>,

    /// Restart command (default: stop then start)
    pub restart: Option<Vec<String>>,
}

/// `[health]`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HealthSection {
    /// Probe command; exit 0 means ready
    pub command: Vec<String>,

    /// Retry policy
    #[serde(flatten)]
    pub retry: RetryPolicy,
}

/// `[build]`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BuildSection {
    /// Output directory for artifacts and the staged tree
    pub out_dir: Option<PathBuf>,

    /// Target architecture override
    pub arch: Option<String>,

    /// Shipped components
    pub components: Vec<ComponentSpec>,

    /// Optional frontend sub-build
    pub ui: Option<UiBuildSpec>,

    /// Extra exclude patterns
    pub excludes: Vec<String>,

    /// Requirements stamped into the manifest
    pub requirements: Requirements,

    /// Oldest active version a release can upgrade from
    pub min_compatible: Option<Version>,
}

impl Config {
    /// Load from a file, or fall back to built-in defaults when the
    /// default path does not exist. An explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(CONFIG_FILENAME), false),
        };

        if !path.exists() {
            if required {
                return Err(ConfigError::Io {
                    source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
                    path,
                });
            }
            return Ok(Self::default());
        }

        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Store root (the deployment root)
    pub fn store_root(&self) -> PathBuf {
        self.deploy.root.clone()
    }

    /// Shared state directory
    pub fn shared_dir(&self) -> PathBuf {
        self.deploy
            .shared_dir
            .clone()
            .unwrap_or_else(|| self.deploy.root.join("shared"))
    }

    /// Store lock wait
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy.lock_timeout_secs)
    }

    /// Engine options assembled from the deployment sections.
    ///
    /// Loading a configured-but-unusable public key is an error, not a
    /// silent downgrade to unsigned verification.
    pub fn engine_options(&self) -> ConfigResult<EngineOptions> {
        self.health.retry.validate()?;
        let verifying_key = match &self.deploy.public_key {
            Some(path) => Some(load_verifying_key(path)?),
            None => None,
        };

        Ok(EngineOptions {
            retry: self.health.retry,
            lock_timeout: self.lock_timeout(),
            runtime_version_command: self.runtime.version_command.clone(),
            service_status_command: self.service.status_command.clone(),
            setup_command: self.runtime.setup_command.clone(),
            verifying_key,
        })
    }

    /// Build spec assembled from `[deploy]` and `[build]`
    pub fn build_spec(&self) -> BuildSpec {
        BuildSpec {
            name: self.deploy.name.clone(),
            arch: self.build.arch.clone(),
            components: self.build.components.clone(),
            ui: self.build.ui.clone(),
            excludes: self.build.excludes.clone(),
            requirements: self.build.requirements.clone(),
            min_compatible: self.build.min_compatible.clone(),
        }
    }

    /// Build output directory
    pub fn out_dir(&self) -> PathBuf {
        self.build.out_dir.clone().unwrap_or_else(defaults::out_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.deploy.name, DEFAULT_NAME);
        assert_eq!(config.store_root(), PathBuf::from(DEFAULT_ROOT));
        assert_eq!(config.shared_dir(), PathBuf::from(DEFAULT_ROOT).join("shared"));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let err = Config::load(Some(Path::new("/nonexistent/cutover.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_partial_file_overlays_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        fs::write(
            &path,
            r#"
[deploy]
name = "orderd"
root = "/srv/orderd"

[health]
command = ["curl", "-fsS", "http://127.0.0.1:8080/healthz"]
max_attempts = 5
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.deploy.name, "orderd");
        assert_eq!(config.health.retry.max_attempts, 5);
        // Unspecified retry fields keep their defaults.
        assert_eq!(config.health.retry.delay_ms, RetryPolicy::default().delay_ms);
        assert_eq!(config.deploy.lock_timeout_secs, DEFAULT_LOCK_TIMEOUT_SECS);
    }

    #[test]
    fn test_build_section_maps_to_spec() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        fs::write(
            &path,
            r#"
[deploy]
name = "orderd"

[build]
min_compatible = "1.0.0"

[[build.components]]
name = "backend"
path = "app"

[build.requirements]
runtime = ">=3.11"
disk_mb = 500
ram_mb = 256
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        let spec = config.build_spec();
        assert_eq!(spec.name, "orderd");
        assert_eq!(spec.components.len(), 1);
        assert!(spec.components[0].required);
        assert_eq!(spec.requirements.disk_mb, 500);
        assert_eq!(spec.min_compatible, Some(Version::new(1, 0, 0)));
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        fs::write(&path, "[deploy\nname=").unwrap();

        assert!(matches!(
            Config::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
    }
}
