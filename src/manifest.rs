//! Release manifest model
//!
//! The manifest is the trust-boundary form of a release: everything
//! downstream trusts after signature verification is derived from it.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Schema version for manifest.json
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for manifest.json
pub const MANIFEST_SCHEMA_ID: &str = "cutover/manifest@1";

/// File name of the manifest inside a release archive and release dir
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Errors from manifest operations
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JCS canonicalization error: {0}")]
    Jcs(String),

    #[error("duplicate migration id: {0}")]
    DuplicateMigration(String),

    #[error("manifest has no components")]
    NoComponents,

    #[error("manifest field {0} is empty")]
    EmptyField(&'static str),

    #[error("unsupported schema: {id} v{version}")]
    UnsupportedSchema { id: String, version: u32 },
}

/// Result type for manifest operations
pub type ManifestResult<T> = Result<T, ManifestError>;

/// Release channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Stable,
    Beta,
    Dev,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Stable => write!(f, "stable"),
            Channel::Beta => write!(f, "beta"),
            Channel::Dev => write!(f, "dev"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stable" => Ok(Channel::Stable),
            "beta" => Ok(Channel::Beta),
            "dev" => Ok(Channel::Dev),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// Resource requirements a target machine must satisfy
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Requirements {
    /// Required runtime version as a comparator expression (e.g. ">=3.11")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<VersionReq>,

    /// Minimum free disk at the install root, in MB (fatal when short)
    pub disk_mb: u64,

    /// Minimum available memory, in MB (advisory only)
    pub ram_mb: u64,
}

/// Per-file digest used to derive component checksums
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDigest {
    /// Path relative to the component root
    pub path: String,

    /// SHA-256 of file contents, hex-encoded
    pub sha256: String,
}

/// Release manifest (manifest.json)
///
/// Immutable after signing. Two builds of the same source revision must
/// produce byte-identical manifests, so `built_at` carries the revision's
/// commit time rather than wall clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseManifest {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// Product name (names the archive and the service)
    pub name: String,

    /// Release version
    pub version: Version,

    /// Release channel
    pub channel: Channel,

    /// Target architecture (e.g. x86_64)
    pub arch: String,

    /// Build timestamp (source revision commit time)
    pub built_at: DateTime<Utc>,

    /// Source revision id the release was built from
    pub source_revision: String,

    /// Oldest active version this release can upgrade from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_compatible: Option<Version>,

    /// Component name → content digest (JCS over sorted per-file hashes)
    pub checksums: BTreeMap<String, String>,

    /// Resource requirements
    pub requirements: Requirements,

    /// Ordered list of migration ids shipped with this release
    pub migrations: Vec<String>,
}

impl ReleaseManifest {
    /// Validate internal consistency
    pub fn validate(&self) -> ManifestResult<()> {
        if self.schema_id != MANIFEST_SCHEMA_ID || self.schema_version != MANIFEST_SCHEMA_VERSION {
            return Err(ManifestError::UnsupportedSchema {
                id: self.schema_id.clone(),
                version: self.schema_version,
            });
        }
        if self.name.is_empty() {
            return Err(ManifestError::EmptyField("name"));
        }
        if self.arch.is_empty() {
            return Err(ManifestError::EmptyField("arch"));
        }
        if self.checksums.is_empty() {
            return Err(ManifestError::NoComponents);
        }

        let mut seen = std::collections::BTreeSet::new();
        for id in &self.migrations {
            if !seen.insert(id) {
                return Err(ManifestError::DuplicateMigration(id.clone()));
            }
        }

        Ok(())
    }

    /// Canonical (JCS) bytes of the manifest, the form signatures cover
    pub fn canonical_bytes(&self) -> ManifestResult<Vec<u8>> {
        serde_json_canonicalizer::to_vec(self).map_err(|e| ManifestError::Jcs(e.to_string()))
    }

    /// Archive file name for this release: name-version-arch.tar.gz
    pub fn archive_name(&self) -> String {
        format!("{}-{}-{}.tar.gz", self.name, self.version, self.arch)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Write to file
    pub fn write_to_file(&self, path: &Path) -> ManifestResult<()> {
        let json = self.to_json()?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load from file
    pub fn from_file(path: &Path) -> ManifestResult<Self> {
        let json = fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }
}

/// Compute a component digest from its per-file hashes.
///
/// Entries are sorted by path and serialized to JCS before hashing, so the
/// digest is deterministic and any single-byte change in any file changes it.
pub fn component_digest(files: &[FileDigest]) -> ManifestResult<String> {
    let mut sorted: Vec<&FileDigest> = files.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let jcs_bytes =
        serde_json_canonicalizer::to_vec(&sorted).map_err(|e| ManifestError::Jcs(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&jcs_bytes);
    Ok(hex::encode(hasher.finalize()))
}
