//! Key material: read keys, client secrets, and the one-way derivations
//! from them (convergent key, storage index, nonce, lease owner)

use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use tessera_core::{EncodingParams, GridError, GridResult, LeaseOwner, StorageIndex};
use zeroize::Zeroize;

use crate::{KEY_SIZE, NONCE_SIZE};

const CONVERGENT_KEY_CONTEXT: &str = "tessera 2024 convergent encryption key";
const LEASE_OWNER_CONTEXT: &str = "tessera 2024 lease owner";

/// A 256-bit symmetric key that decrypts one object. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct ReadKey {
    bytes: [u8; KEY_SIZE],
}

impl ReadKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Storage index peers know this object by. One-way.
    pub fn storage_index(&self) -> GridResult<StorageIndex> {
        Ok(StorageIndex::from_bytes(hkdf_derive(
            &self.bytes,
            b"tessera-storage-index",
        )?))
    }

    /// Nonce for immutable ciphertext. A convergent key only ever encrypts
    /// the plaintext it was derived from, so a key-derived nonce is safe.
    pub fn immutable_nonce(&self) -> GridResult<[u8; NONCE_SIZE]> {
        let hkdf = Hkdf::<Sha256>::new(None, &self.bytes);
        let mut nonce = [0u8; NONCE_SIZE];
        hkdf.expand(b"tessera-chk-nonce", &mut nonce)
            .map_err(|e| GridError::Other(anyhow::anyhow!("HKDF expand failed: {e}")))?;
        Ok(nonce)
    }
}

impl Drop for ReadKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ReadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Scopes convergent encryption: only clients holding the same secret
/// produce the same keys (and so deduplicate against each other).
#[derive(Clone)]
pub struct ConvergenceSecret {
    bytes: Vec<u8>,
}

impl ConvergenceSecret {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<&SecretString> for ConvergenceSecret {
    fn from(secret: &SecretString) -> Self {
        Self::from_bytes(secret.expose_secret().as_bytes())
    }
}

impl Drop for ConvergenceSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ConvergenceSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConvergenceSecret([REDACTED])")
    }
}

/// Client secret from which per-object lease owners are derived.
#[derive(Clone)]
pub struct LeaseSecret {
    bytes: [u8; KEY_SIZE],
}

impl LeaseSecret {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Hash an arbitrary configured string down to a lease secret.
    pub fn from_phrase(phrase: &SecretString) -> Self {
        Self::from_bytes(blake3::derive_key(
            "tessera 2024 lease secret from phrase",
            phrase.expose_secret().as_bytes(),
        ))
    }

    /// Owner id this client presents for every share of `storage_index`.
    pub fn lease_owner(&self, storage_index: &StorageIndex) -> LeaseOwner {
        let mut hasher = blake3::Hasher::new_derive_key(LEASE_OWNER_CONTEXT);
        hasher.update(&self.bytes);
        hasher.update(storage_index.as_bytes());
        LeaseOwner(*hasher.finalize().as_bytes())
    }
}

impl Drop for LeaseSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for LeaseSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LeaseSecret([REDACTED])")
    }
}

/// Deterministic content key for an immutable object.
///
/// Same plaintext, same encoding parameters and same convergence secret
/// always give the same key, and so the same storage index and capability.
pub fn derive_convergent_key(
    plaintext: &[u8],
    params: &EncodingParams,
    secret: Option<&ConvergenceSecret>,
) -> ReadKey {
    let secret = secret.map(|s| s.as_bytes()).unwrap_or_default();
    let mut hasher = blake3::Hasher::new_derive_key(CONVERGENT_KEY_CONTEXT);
    hasher.update(&(secret.len() as u64).to_be_bytes());
    hasher.update(secret);
    hasher.update(&params.to_bytes());
    hasher.update(plaintext);
    ReadKey::from_bytes(*hasher.finalize().as_bytes())
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
pub(crate) fn hkdf_derive(ikm: &[u8; KEY_SIZE], info: &[u8]) -> GridResult<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| GridError::Other(anyhow::anyhow!("HKDF expand failed: {e}")))?;
    Ok(okm)
}
