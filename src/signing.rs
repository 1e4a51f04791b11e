//! Ed25519 signing and verification for release artifacts
//!
//! The builder signs the packaged archive with an Ed25519 key held in the
//! build environment; target machines verify against a pre-provisioned
//! public key. Verification fails closed: any I/O error, missing key, or
//! malformed input is reported as not-valid, never defaulted to valid.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Schema version for detached signature files
pub const SIGNATURE_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for detached signature files
pub const SIGNATURE_SCHEMA_ID: &str = "cutover/signature@1";

/// Signature algorithm identifier
pub const SIGNATURE_ALGORITHM: &str = "Ed25519";

/// Errors from signing/verification operations
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("malformed checksum file: {0}")]
    MalformedChecksumFile(PathBuf),
}

/// Result type for signing operations
pub type SigningResult<T> = Result<T, SigningError>;

/// Detached signature stored beside the artifact (<artifact>.sig)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachedSignature {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// When the signature was produced
    pub created_at: DateTime<Utc>,

    /// SHA-256 of the artifact bytes the signature covers
    pub artifact_sha256: String,

    /// Base64-encoded Ed25519 signature over the artifact bytes
    pub signature: String,

    /// Signature algorithm identifier (always "Ed25519")
    pub signature_algorithm: String,

    /// SHA-256 fingerprint of the signing public key (hex-encoded)
    pub pubkey_fingerprint: String,
}

impl DetachedSignature {
    /// Sign artifact bytes with the given key
    pub fn sign(artifact_bytes: &[u8], signing_key: &SigningKey) -> Self {
        let signature = signing_key.sign(artifact_bytes);
        let verifying_key = signing_key.verifying_key();

        Self {
            schema_version: SIGNATURE_SCHEMA_VERSION,
            schema_id: SIGNATURE_SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            artifact_sha256: sha256_hex(artifact_bytes),
            signature: base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                signature.to_bytes(),
            ),
            signature_algorithm: SIGNATURE_ALGORITHM.to_string(),
            pubkey_fingerprint: compute_key_fingerprint(&verifying_key),
        }
    }

    /// Verify the signature against artifact bytes and a verifying key.
    ///
    /// Returns `Ok(false)` for a signature that does not verify; errors are
    /// reserved for inputs that cannot even be decoded.
    pub fn verify(&self, artifact_bytes: &[u8], verifying_key: &VerifyingKey) -> SigningResult<bool> {
        if sha256_hex(artifact_bytes) != self.artifact_sha256 {
            return Ok(false);
        }

        let sig_bytes = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            &self.signature,
        )?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|e| SigningError::InvalidSignature(e.to_string()))?;

        Ok(verifying_key.verify(artifact_bytes, &signature).is_ok())
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
    pub fn write_to_file(&self, path: &Path) -> SigningResult<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Load from file
    pub fn from_file(path: &Path) -> SigningResult<Self> {
        let json = fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }
}

/// Outcome of evaluating an artifact's signature, fail-closed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SignatureStatus {
    /// Signature present and verified; carries the signer's fingerprint
    Valid { fingerprint: String },
    /// Signature present but did not verify, or could not be evaluated
    Invalid { reason: String },
    /// No signature file found beside the artifact
    Missing,
}

impl SignatureStatus {
    /// True only for a verified signature
    pub fn is_valid(&self) -> bool {
        matches!(self, SignatureStatus::Valid { .. })
    }
}

/// Sidecar path for the detached signature: <artifact>.sig
pub fn signature_path(artifact: &Path) -> PathBuf {
    sidecar_path(artifact, "sig")
}

/// Sidecar path for the checksum file: <artifact>.sha256
pub fn checksum_path(artifact: &Path) -> PathBuf {
    sidecar_path(artifact, "sha256")
}

fn sidecar_path(artifact: &Path, ext: &str) -> PathBuf {
    let file_name = artifact.file_name().unwrap_or_default().to_string_lossy();
    artifact.with_file_name(format!("{file_name}.{ext}"))
}

/// Evaluate an artifact's detached signature, folding every failure mode
/// into a definite status.
pub fn evaluate_signature(artifact: &Path, verifying_key: Option<&VerifyingKey>) -> SignatureStatus {
    let sig_path = signature_path(artifact);
    if !sig_path.exists() {
        return SignatureStatus::Missing;
    }

    let Some(key) = verifying_key else {
        return SignatureStatus::Invalid {
            reason: "signature present but no public key provisioned".to_string(),
        };
    };

    let signature = match DetachedSignature::from_file(&sig_path) {
        Ok(s) => s,
        Err(e) => {
            return SignatureStatus::Invalid {
                reason: format!("unreadable signature file: {e}"),
            }
        }
    };

    let bytes = match fs::read(artifact) {
        Ok(b) => b,
        Err(e) => {
            return SignatureStatus::Invalid {
                reason: format!("unreadable artifact: {e}"),
            }
        }
    };

    match signature.verify(&bytes, key) {
        Ok(true) => SignatureStatus::Valid {
            fingerprint: signature.pubkey_fingerprint,
        },
        Ok(false) => SignatureStatus::Invalid {
            reason: "signature does not match artifact bytes".to_string(),
        },
        Err(e) => SignatureStatus::Invalid {
            reason: e.to_string(),
        },
    }
}

/// SHA-256 of bytes, hex-encoded
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a file's contents, hex-encoded
pub fn checksum_file(path: &Path) -> SigningResult<String> {
    Ok(sha256_hex(&fs::read(path)?))
}

/// Write the standalone checksum companion: "<hex>  <filename>\n"
pub fn write_checksum_file(artifact: &Path) -> SigningResult<PathBuf> {
    let digest = checksum_file(artifact)?;
    let file_name = artifact.file_name().unwrap_or_default().to_string_lossy();
    let out = checksum_path(artifact);
    fs::write(&out, format!("{digest}  {file_name}\n"))?;
    Ok(out)
}

/// Verify an artifact against its checksum companion.
///
/// Returns `Ok(false)` on mismatch or unreadable inputs (fail closed).
pub fn verify_checksum_file(artifact: &Path) -> SigningResult<bool> {
    let path = checksum_path(artifact);
    let contents = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(_) => return Ok(false),
    };
    let expected = contents
        .split_whitespace()
        .next()
        .ok_or(SigningError::MalformedChecksumFile(path))?;

    let actual = match checksum_file(artifact) {
        Ok(d) => d,
        Err(_) => return Ok(false),
    };
    Ok(actual == expected)
}

/// Compute SHA-256 fingerprint of an Ed25519 public key
pub fn compute_key_fingerprint(key: &VerifyingKey) -> String {
    sha256_hex(key.as_bytes())
}

/// Generate a new Ed25519 keypair
pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut rand::thread_rng())
}

/// Encode a signing key to base64 for storage
pub fn encode_signing_key(key: &SigningKey) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key.to_bytes())
}

/// Decode a signing key from base64
pub fn decode_signing_key(encoded: &str) -> SigningResult<SigningKey> {
    let bytes = base64::Engine::decode(
        &base64::engine::general_purpose::STANDARD,
        encoded.trim(),
    )?;
    let bytes_array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SigningError::InvalidKey("key must be 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&bytes_array))
}

/// Encode a verifying key to base64 for storage
pub fn encode_verifying_key(key: &VerifyingKey) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key.as_bytes())
}

/// Decode a verifying key from base64
pub fn decode_verifying_key(encoded: &str) -> SigningResult<VerifyingKey> {
    let bytes = base64::Engine::decode(
        &base64::engine::general_purpose::STANDARD,
        encoded.trim(),
    )?;
    let bytes_array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SigningError::InvalidKey("key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes_array).map_err(|e| SigningError::InvalidKey(e.to_string()))
}

/// Load a signing key from a base64 key file
pub fn load_signing_key(path: &Path) -> SigningResult<SigningKey> {
    decode_signing_key(&fs::read_to_string(path)?)
}

/// Load a verifying key from a base64 key file
pub fn load_verifying_key(path: &Path) -> SigningResult<VerifyingKey> {
    decode_verifying_key(&fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sign_and_verify() {
        let key = generate_keypair();
        let bytes = b"release artifact bytes";

        let signed = DetachedSignature::sign(bytes, &key);
        assert!(signed.verify(bytes, &key.verifying_key()).unwrap());
        assert_eq!(signed.signature_algorithm, SIGNATURE_ALGORITHM);
        assert_eq!(signed.artifact_sha256, sha256_hex(bytes));
    }

    #[test]
    fn test_verify_with_wrong_key() {
        let key1 = generate_keypair();
        let key2 = generate_keypair();
        let bytes = b"release artifact bytes";

        let signed = DetachedSignature::sign(bytes, &key1);
        assert!(!signed.verify(bytes, &key2.verifying_key()).unwrap());
    }

    #[test]
    fn test_verify_modified_artifact() {
        let key = generate_keypair();
        let bytes = b"release artifact bytes".to_vec();

        let signed = DetachedSignature::sign(&bytes, &key);

        let mut flipped = bytes.clone();
        flipped[3] ^= 0x01;
        assert!(!signed.verify(&flipped, &key.verifying_key()).unwrap());
    }

    #[test]
    fn test_evaluate_signature_missing() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("app-1.0.0-x86_64.tar.gz");
        fs::write(&artifact, b"bytes").unwrap();

        let key = generate_keypair();
        let status = evaluate_signature(&artifact, Some(&key.verifying_key()));
        assert_eq!(status, SignatureStatus::Missing);
    }

    #[test]
    fn test_evaluate_signature_valid_and_tampered() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("app-1.0.0-x86_64.tar.gz");
        fs::write(&artifact, b"artifact contents").unwrap();

        let key = generate_keypair();
        let signed = DetachedSignature::sign(&fs::read(&artifact).unwrap(), &key);
        signed.write_to_file(&signature_path(&artifact)).unwrap();

        let status = evaluate_signature(&artifact, Some(&key.verifying_key()));
        assert!(status.is_valid());

        // Flip one byte of the artifact; the same signature must now fail.
        fs::write(&artifact, b"artifact contentsX").unwrap();
        let status = evaluate_signature(&artifact, Some(&key.verifying_key()));
        assert!(matches!(status, SignatureStatus::Invalid { .. }));
    }

    #[test]
    fn test_evaluate_signature_garbage_file_is_invalid_not_error() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("app.tar.gz");
        fs::write(&artifact, b"bytes").unwrap();
        fs::write(signature_path(&artifact), b"not json at all").unwrap();

        let key = generate_keypair();
        let status = evaluate_signature(&artifact, Some(&key.verifying_key()));
        assert!(matches!(status, SignatureStatus::Invalid { .. }));
    }

    #[test]
    fn test_checksum_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("app.tar.gz");
        fs::write(&artifact, b"archive bytes").unwrap();

        write_checksum_file(&artifact).unwrap();
        assert!(verify_checksum_file(&artifact).unwrap());

        // Any single byte flip must fail the checksum.
        fs::write(&artifact, b"archive byteX").unwrap();
        assert!(!verify_checksum_file(&artifact).unwrap());
    }

    #[test]
    fn test_checksum_missing_companion_fails_closed() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("app.tar.gz");
        fs::write(&artifact, b"archive bytes").unwrap();

        assert!(!verify_checksum_file(&artifact).unwrap());
    }

    #[test]
    fn test_key_encoding_round_trip() {
        let key = generate_keypair();

        let decoded = decode_signing_key(&encode_signing_key(&key)).unwrap();
        assert_eq!(key.to_bytes(), decoded.to_bytes());

        let verifying = key.verifying_key();
        let decoded = decode_verifying_key(&encode_verifying_key(&verifying)).unwrap();
        assert_eq!(verifying.as_bytes(), decoded.as_bytes());
    }

    #[test]
    fn test_key_fingerprint_deterministic() {
        let key = generate_keypair().verifying_key();
        assert_eq!(compute_key_fingerprint(&key), compute_key_fingerprint(&key));
        assert_eq!(compute_key_fingerprint(&key).len(), 64);
    }

    #[test]
    fn test_sidecar_paths() {
        let artifact = Path::new("/out/app-1.0.0-x86_64.tar.gz");
        assert_eq!(
            signature_path(artifact),
            Path::new("/out/app-1.0.0-x86_64.tar.gz.sig")
        );
        assert_eq!(
            checksum_path(artifact),
            Path::new("/out/app-1.0.0-x86_64.tar.gz.sha256")
        );
    }
}
