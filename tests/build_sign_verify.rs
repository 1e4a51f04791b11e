//! Build, sign, and verify integration tests
//!
//! Covers the artifact pipeline end to end: deterministic builds,
//! checksum companions, detached signatures, and fail-closed verification.

use std::fs;
use std::path::{Path, PathBuf};

use cutover::builder::{BuildSpec, Builder, ComponentSpec};
use cutover::engine::read_manifest_from_archive;
use cutover::manifest::{Channel, Requirements};
use cutover::signing::{
    self, evaluate_signature, DetachedSignature, SignatureStatus,
};
use semver::Version;
use tempfile::TempDir;

fn sample_source() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("app")).unwrap();
    fs::write(dir.path().join("app/server.py"), "print('serve')\n").unwrap();
    fs::write(dir.path().join("app/worker.py"), "print('work')\n").unwrap();
    fs::create_dir_all(dir.path().join("migrations")).unwrap();
    fs::write(
        dir.path().join("migrations/0001_init"),
        "#!/bin/sh\nexit 0\n",
    )
    .unwrap();
    dir
}

fn spec() -> BuildSpec {
    BuildSpec {
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
            disk_mb: 1,
            ram_mb: 1,
        },
        min_compatible: None,
    }
}

fn build(source: &Path, out: &Path, version: &str) -> PathBuf {
    Builder::new(source.to_path_buf(), out.to_path_buf(), spec())
        .build(
            Some(Version::parse(version).unwrap()),
            Channel::Stable,
            None,
        )
        .unwrap()
        .artifact
}

// =============================================================================
// Checksum tests
// =============================================================================

#[test]
fn checksum_verification_round_trip() {
    let source = sample_source();
    let out = TempDir::new().unwrap();
    let artifact = build(source.path(), out.path(), "1.0.0");

    assert!(signing::verify_checksum_file(&artifact).unwrap());
}

#[test]
fn any_byte_flip_fails_checksum() {
    let source = sample_source();
    let out = TempDir::new().unwrap();
    let artifact = build(source.path(), out.path(), "1.0.0");

    let mut bytes = fs::read(&artifact).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x01;
    fs::write(&artifact, &bytes).unwrap();

    assert!(!signing::verify_checksum_file(&artifact).unwrap());
}

// =============================================================================
// Signature tests
// =============================================================================

#[test]
fn signed_artifact_verifies_with_matching_key() {
    let source = sample_source();
    let out = TempDir::new().unwrap();
    let key = signing::generate_keypair();

    let report = Builder::new(source.path().to_path_buf(), out.path().to_path_buf(), spec())
        .build(Some(Version::new(1, 0, 0)), Channel::Stable, Some(&key))
        .unwrap();

    let status = evaluate_signature(&report.artifact, Some(&key.verifying_key()));
    assert!(status.is_valid());
}

#[test]
fn wrong_key_fails_without_fault() {
    let source = sample_source();
    let out = TempDir::new().unwrap();
    let signer = signing::generate_keypair();
    let other = signing::generate_keypair();

    let report = Builder::new(source.path().to_path_buf(), out.path().to_path_buf(), spec())
        .build(Some(Version::new(1, 0, 0)), Channel::Stable, Some(&signer))
        .unwrap();

    // A definite invalid result, never an unhandled fault.
    let status = evaluate_signature(&report.artifact, Some(&other.verifying_key()));
    assert!(matches!(status, SignatureStatus::Invalid { .. }));
}

#[test]
fn modified_artifact_invalidates_signature() {
    let source = sample_source();
    let out = TempDir::new().unwrap();
    let key = signing::generate_keypair();

    let report = Builder::new(source.path().to_path_buf(), out.path().to_path_buf(), spec())
        .build(Some(Version::new(1, 0, 0)), Channel::Stable, Some(&key))
        .unwrap();

    let mut bytes = fs::read(&report.artifact).unwrap();
    bytes[10] ^= 0xff;
    fs::write(&report.artifact, &bytes).unwrap();

    let status = evaluate_signature(&report.artifact, Some(&key.verifying_key()));
    assert!(matches!(status, SignatureStatus::Invalid { .. }));
}

#[test]
fn detached_sign_after_build() {
    let source = sample_source();
    let out = TempDir::new().unwrap();
    let artifact = build(source.path(), out.path(), "1.0.0");
    let key = signing::generate_keypair();

    // Sign as a separate step, the way `cutover sign` does.
    let bytes = fs::read(&artifact).unwrap();
    let signature = DetachedSignature::sign(&bytes, &key);
    signature
        .write_to_file(&signing::signature_path(&artifact))
        .unwrap();

    let status = evaluate_signature(&artifact, Some(&key.verifying_key()));
    assert!(status.is_valid());
}

#[test]
fn unsigned_artifact_reports_missing() {
    let source = sample_source();
    let out = TempDir::new().unwrap();
    let artifact = build(source.path(), out.path(), "1.0.0");
    let key = signing::generate_keypair();

    let status = evaluate_signature(&artifact, Some(&key.verifying_key()));
    assert_eq!(status, SignatureStatus::Missing);
}

// =============================================================================
// Manifest and reproducibility tests
// =============================================================================

#[test]
fn manifest_readable_from_archive() {
    let source = sample_source();
    let out = TempDir::new().unwrap();
    let artifact = build(source.path(), out.path(), "1.2.3");

    let manifest = read_manifest_from_archive(&artifact).unwrap();
    assert_eq!(manifest.version, Version::new(1, 2, 3));
    assert_eq!(manifest.name, "orderd");
    assert!(manifest.checksums.contains_key("backend"));
    assert_eq!(manifest.migrations, vec!["0001_init".to_string()]);
}

#[test]
fn same_source_builds_identical_artifacts() {
    let source = sample_source();
    let out1 = TempDir::new().unwrap();
    let out2 = TempDir::new().unwrap();

    let a1 = build(source.path(), out1.path(), "1.0.0");
    let a2 = build(source.path(), out2.path(), "1.0.0");

    assert_eq!(fs::read(&a1).unwrap(), fs::read(&a2).unwrap());
}
