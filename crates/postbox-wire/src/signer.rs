//! Detached message signing and signer attribution.
//!
//! The bus signs every envelope and lets receivers attribute it to a
//! person. The backend is opaque: anything that can produce a detached
//! signature token and report on verification in human-readable text
//! works. Attribution is recovered from that report — an identity of the
//! form `Name <email>` and a key fingerprint (a hex run of at least 32
//! characters). Captures that fail are reported as `unknown` rather than
//! failing the verification.
//!
//! The default backend is [`KeyringSigner`]: a per-user Ed25519 seed file
//! plus a shared keyring directory mapping key fingerprints to identities,
//! so unrelated processes of other users can attribute signatures.

use crate::encoding;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SEED_FILE_PERMS: u32 = 0o600;
const SEED_LEN: usize = 32;

/// Signature blob layout: public key followed by the Ed25519 signature.
const BLOB_LEN: usize = 32 + 64;

/// Value reported for identity fields that could not be captured.
pub const UNKNOWN: &str = "unknown";

/// Errors from signing backends.
#[derive(Debug, Error)]
pub enum SignerError {
    /// No signing identity is configured, or the backend cannot be used.
    #[error("signing identity unavailable: {0}")]
    Unavailable(String),
    /// The signature token is structurally invalid and cannot be checked.
    #[error("signature is structurally invalid")]
    BadSignature,
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Who signed a message, as recovered from a verification report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerInfo {
    /// Whether the signature verified over the presented bytes.
    pub valid: bool,
    /// Hex fingerprint of the signing key, or `unknown`.
    pub key_fingerprint: String,
    /// Signer email, or `unknown`.
    pub email: String,
    /// Signer display name, or `unknown`.
    pub name: String,
}

impl SignerInfo {
    /// Extract signer identity from a backend's verification report.
    ///
    /// The identity capture looks for `Name <email>`; the fingerprint
    /// capture takes the longest hex run of at least 32 characters.
    /// A failed capture yields the literal `unknown` for that field.
    #[must_use]
    pub fn from_report(valid: bool, report: &str) -> Self {
        let (name, email) = capture_identity(report)
            .unwrap_or_else(|| (UNKNOWN.to_string(), UNKNOWN.to_string()));
        let key_fingerprint =
            capture_fingerprint(report).unwrap_or_else(|| UNKNOWN.to_string());
        Self {
            valid,
            key_fingerprint,
            email,
            name,
        }
    }
}

/// A detached-signature producer and verifier.
///
/// Implementations must be safe to share across threads; callers holding
/// exclusive backend resources are expected to serialize internally.
/// `sign` returns the signature as an encoded token so queue items stay
/// single-line regardless of backend output discipline.
pub trait Signer: Send + Sync {
    /// Produce a detached signature token over `data`.
    ///
    /// # Errors
    ///
    /// [`SignerError::Unavailable`] when no signing identity is configured.
    fn sign(&self, data: &[u8]) -> Result<String, SignerError>;

    /// Check `signature` against `data`.
    ///
    /// Returns `(valid, report_text)`. A signature that parses but does not
    /// verify yields `Ok((false, report))`; one that cannot be parsed at
    /// all yields [`SignerError::BadSignature`].
    fn verify(&self, signature: &str, data: &[u8]) -> Result<(bool, String), SignerError>;
}

fn capture_identity(report: &str) -> Option<(String, String)> {
    for line in report.lines() {
        let Some(open) = line.find('<') else { continue };
        let Some(close) = line[open..].find('>') else { continue };
        let email = &line[open + 1..open + close];
        if email.is_empty() || !email.contains('@') {
            continue;
        }
        let prefix = line[..open].trim_end();
        let name = match prefix.rfind('"') {
            Some(q) => &prefix[q + 1..],
            None => prefix,
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        return Some((name.to_string(), email.to_string()));
    }
    None
}

fn capture_fingerprint(report: &str) -> Option<String> {
    let mut best: Option<&str> = None;
    let bytes = report.as_bytes();
    let mut start = None;
    for (i, &b) in bytes.iter().chain(std::iter::once(&b' ')).enumerate() {
        if (b as char).is_ascii_hexdigit() {
            start.get_or_insert(i);
        } else if let Some(s) = start.take() {
            let run = &report[s..i];
            if run.len() >= 32 && best.map_or(true, |b| run.len() > b.len()) {
                best = Some(run);
            }
        }
    }
    best.map(str::to_lowercase)
}

/// Ed25519 signing backend with a shared identity keyring.
///
/// The seed lives in a per-user file with `0600` permissions. Signature
/// blobs carry the public key, and a keyring directory under the shared
/// IPC root maps `sha256(pubkey)` fingerprints to one-line
/// `Name <email>` identity files, written when the signer is opened.
#[derive(Debug)]
pub struct KeyringSigner {
    keypair: SigningKey,
    keyring: PathBuf,
    name: String,
    email: String,
}

impl KeyringSigner {
    /// Open (creating if needed) the seed file and register the caller's
    /// identity in the keyring.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::Unavailable`] if the identity is empty or the
    /// seed file is unusable (wrong length, overly permissive mode).
    pub fn open(
        seed_path: &Path,
        keyring: &Path,
        name: &str,
        email: &str,
    ) -> Result<Self, SignerError> {
        if name.is_empty() || email.is_empty() {
            return Err(SignerError::Unavailable(
                "signer identity has no name or email".to_string(),
            ));
        }
        let keypair = load_or_generate_seed(seed_path)?;
        fs::create_dir_all(keyring)?;
        let signer = Self {
            keypair,
            keyring: keyring.to_path_buf(),
            name: name.to_string(),
            email: email.to_string(),
        };
        signer.register()?;
        Ok(signer)
    }

    /// Hex fingerprint of this signer's public key.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.keypair.verifying_key())
    }

    /// Write `fingerprint -> "Name <email>"` into the keyring, atomically,
    /// skipping the write when the entry is already current.
    fn register(&self) -> Result<(), SignerError> {
        let identity = format!("{} <{}>\n", self.name, self.email);
        let path = self.keyring.join(self.fingerprint());
        if let Ok(existing) = fs::read_to_string(&path) {
            if existing == identity {
                return Ok(());
            }
        }
        let tmp = self.keyring.join(format!(".{}.tmp", self.fingerprint()));
        fs::write(&tmp, &identity)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn identity_for(&self, fingerprint: &str) -> Option<String> {
        let entry = fs::read_to_string(self.keyring.join(fingerprint)).ok()?;
        let entry = entry.trim();
        (!entry.is_empty()).then(|| entry.to_string())
    }
}

impl Signer for KeyringSigner {
    fn sign(&self, data: &[u8]) -> Result<String, SignerError> {
        use ed25519_dalek::Signer as _;
        let mut blob = Vec::with_capacity(BLOB_LEN);
        blob.extend_from_slice(self.keypair.verifying_key().as_bytes());
        blob.extend_from_slice(&self.keypair.sign(data).to_bytes());
        Ok(encoding::encode(&blob))
    }

    fn verify(&self, signature: &str, data: &[u8]) -> Result<(bool, String), SignerError> {
        use ed25519_dalek::Verifier as _;
        let blob = encoding::decode(signature).map_err(|_| SignerError::BadSignature)?;
        if blob.len() != BLOB_LEN {
            return Err(SignerError::BadSignature);
        }
        let pubkey: [u8; 32] = blob[..32]
            .try_into()
            .map_err(|_| SignerError::BadSignature)?;
        let sig: [u8; 64] = blob[32..]
            .try_into()
            .map_err(|_| SignerError::BadSignature)?;
        let verifying_key =
            VerifyingKey::from_bytes(&pubkey).map_err(|_| SignerError::BadSignature)?;
        let valid = verifying_key
            .verify(data, &Signature::from_bytes(&sig))
            .is_ok();

        let fingerprint = fingerprint_of(&verifying_key);
        let verdict = if valid { "Good" } else { "BAD" };
        let report = match self.identity_for(&fingerprint) {
            Some(identity) => format!(
                "{verdict} signature from \"{identity}\"\nPrimary key fingerprint: {fingerprint}\n"
            ),
            None => format!(
                "{verdict} signature from unregistered key\nPrimary key fingerprint: {fingerprint}\n"
            ),
        };
        Ok((valid, report))
    }
}

fn fingerprint_of(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Load the Ed25519 seed from `path`, generating one on first use.
///
/// Existing files must be exactly 32 bytes and not readable by group or
/// other. New files are created with `0600` from the start.
fn load_or_generate_seed(path: &Path) -> Result<SigningKey, SignerError> {
    if path.exists() {
        let mode = fs::metadata(path)?.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(SignerError::Unavailable(format!(
                "seed file {} has overly permissive permissions ({:o}), must be 0600",
                path.display(),
                mode & 0o777
            )));
        }
        let seed = fs::read(path)?;
        let seed: [u8; SEED_LEN] = seed.try_into().map_err(|v: Vec<u8>| {
            SignerError::Unavailable(format!(
                "seed file must contain exactly {SEED_LEN} bytes, got {}",
                v.len()
            ))
        })?;
        Ok(SigningKey::from_bytes(&seed))
    } else {
        let keypair = SigningKey::generate(&mut OsRng);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(SEED_FILE_PERMS)
            .open(path)?;
        file.write_all(&keypair.to_bytes())?;
        Ok(keypair)
    }
}
