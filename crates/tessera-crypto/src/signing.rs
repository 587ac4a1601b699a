//! Ed25519 signing for mutable objects
//!
//! A mutable object's storage index is a hash of its verifying key, so a
//! storage node holding only the storage index can check that a header was
//! signed by the object's owner without ever seeing a read key.
//!
//! Signed header layout (176 bytes, big-endian):
//! ```text
//! storage_index (32) | version u64 | descriptor_hash (32) | size u64
//! verifying_key (32) | signature (64)
//! ```
//! The signature covers a domain tag followed by the first four fields.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use tessera_core::{GridError, GridResult, StorageIndex};

use crate::keys::{hkdf_derive, ReadKey};

const HEADER_DOMAIN: &[u8] = b"tessera ssk header v1";
const DELETE_DOMAIN: &[u8] = b"tessera ssk delete v1";
const STORAGE_INDEX_CONTEXT: &str = "tessera 2024 ssk storage index";

/// Fresh signing key for a new mutable object.
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut rand::rngs::OsRng)
}

/// Read key for a mutable object, one-way from the signing seed.
pub fn mutable_read_key(signing_key: &SigningKey) -> GridResult<ReadKey> {
    let mut seed = signing_key.to_bytes();
    let derived = hkdf_derive(&seed, b"tessera-ssk-read-key");
    zeroize::Zeroize::zeroize(&mut seed);
    Ok(ReadKey::from_bytes(derived?))
}

/// Storage index of a mutable object: binds the slot to its verifying key.
pub fn mutable_storage_index(verifying_key: &VerifyingKey) -> StorageIndex {
    StorageIndex::from_bytes(blake3::derive_key(
        STORAGE_INDEX_CONTEXT,
        verifying_key.as_bytes(),
    ))
}

/// One signed version of a mutable object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeader {
    pub storage_index: StorageIndex,
    pub version: u64,
    pub descriptor_hash: blake3::Hash,
    /// Plaintext length in bytes
    pub size: u64,
    pub verifying_key: VerifyingKey,
    pub signature: Signature,
}

impl SignedHeader {
    pub const ENCODED_LEN: usize = 32 + 8 + 32 + 8 + 32 + 64;

    pub fn sign(
        signing_key: &SigningKey,
        version: u64,
        descriptor_hash: blake3::Hash,
        size: u64,
    ) -> Self {
        let verifying_key = signing_key.verifying_key();
        let storage_index = mutable_storage_index(&verifying_key);
        let message = header_message(&storage_index, version, &descriptor_hash, size);
        Self {
            storage_index,
            version,
            descriptor_hash,
            size,
            verifying_key,
            signature: signing_key.sign(&message),
        }
    }

    /// Check the key binding and the signature.
    pub fn verify(&self) -> GridResult<()> {
        if mutable_storage_index(&self.verifying_key) != self.storage_index {
            return Err(GridError::AuthenticationFailure(
                "verifying key does not match storage index".into(),
            ));
        }
        let message = header_message(
            &self.storage_index,
            self.version,
            &self.descriptor_hash,
            self.size,
        );
        self.verifying_key
            .verify_strict(&message, &self.signature)
            .map_err(|e| {
                GridError::AuthenticationFailure(format!(
                    "bad signature on version {}: {e}",
                    self.version
                ))
            })
    }

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..32].copy_from_slice(self.storage_index.as_bytes());
        out[32..40].copy_from_slice(&self.version.to_be_bytes());
        out[40..72].copy_from_slice(self.descriptor_hash.as_bytes());
        out[72..80].copy_from_slice(&self.size.to_be_bytes());
        out[80..112].copy_from_slice(self.verifying_key.as_bytes());
        out[112..176].copy_from_slice(&self.signature.to_bytes());
        out
    }

    /// Parse without verifying; call [`SignedHeader::verify`] before trusting it.
    pub fn from_bytes(data: &[u8]) -> GridResult<Self> {
        if data.len() != Self::ENCODED_LEN {
            return Err(GridError::Codec(format!(
                "signed header is {} bytes, expected {}",
                data.len(),
                Self::ENCODED_LEN
            )));
        }
        let verifying_key = VerifyingKey::from_bytes(&array32(&data[80..112]))
            .map_err(|e| GridError::AuthenticationFailure(format!("bad verifying key: {e}")))?;
        let mut sig = [0u8; 64];
        sig.copy_from_slice(&data[112..176]);
        Ok(Self {
            storage_index: StorageIndex::from_bytes(array32(&data[0..32])),
            version: u64::from_be_bytes(array8(&data[32..40])),
            descriptor_hash: blake3::Hash::from(array32(&data[40..72])),
            size: u64::from_be_bytes(array8(&data[72..80])),
            verifying_key,
            signature: Signature::from_bytes(&sig),
        })
    }
}

/// Request to remove every slot of a mutable object, signed by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDelete {
    pub storage_index: StorageIndex,
    pub verifying_key: VerifyingKey,
    pub signature: Signature,
}

impl SignedDelete {
    pub fn sign(signing_key: &SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let storage_index = mutable_storage_index(&verifying_key);
        Self {
            storage_index,
            verifying_key,
            signature: signing_key.sign(&delete_message(&storage_index)),
        }
    }

    pub fn verify(&self) -> GridResult<()> {
        if mutable_storage_index(&self.verifying_key) != self.storage_index {
            return Err(GridError::AuthenticationFailure(
                "verifying key does not match storage index".into(),
            ));
        }
        self.verifying_key
            .verify_strict(&delete_message(&self.storage_index), &self.signature)
            .map_err(|e| GridError::AuthenticationFailure(format!("bad delete signature: {e}")))
    }
}

fn header_message(
    storage_index: &StorageIndex,
    version: u64,
    descriptor_hash: &blake3::Hash,
    size: u64,
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HEADER_DOMAIN.len() + 80);
    msg.extend_from_slice(HEADER_DOMAIN);
    msg.extend_from_slice(storage_index.as_bytes());
    msg.extend_from_slice(&version.to_be_bytes());
    msg.extend_from_slice(descriptor_hash.as_bytes());
    msg.extend_from_slice(&size.to_be_bytes());
    msg
}

fn delete_message(storage_index: &StorageIndex) -> Vec<u8> {
    let mut msg = Vec::with_capacity(DELETE_DOMAIN.len() + 32);
    msg.extend_from_slice(DELETE_DOMAIN);
    msg.extend_from_slice(storage_index.as_bytes());
    msg
}

fn array32(slice: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(slice);
    out
}

fn array8(slice: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(slice);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(b: &[u8]) -> blake3::Hash {
        blake3::hash(b)
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let sk = generate_signing_key();
        let header = SignedHeader::sign(&sk, 4, hash(b"descriptor"), 1234);
        header.verify().unwrap();

        let parsed = SignedHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        parsed.verify().unwrap();
    }

    #[test]
    fn test_tampered_version_fails() {
        let sk = generate_signing_key();
        let mut header = SignedHeader::sign(&sk, 4, hash(b"d"), 10);
        header.version = 5;
        assert!(matches!(header.verify(), Err(GridError::AuthenticationFailure(_))));
    }

    #[test]
    fn test_foreign_key_cannot_claim_slot() {
        let owner = generate_signing_key();
        let attacker = generate_signing_key();
        let mut header = SignedHeader::sign(&attacker, 9, hash(b"evil"), 4);
        // Valid signature, but for someone else's storage index
        header.storage_index = mutable_storage_index(&owner.verifying_key());
        assert!(header.verify().is_err());
    }

    #[test]
    fn test_delete_signature() {
        let sk = generate_signing_key();
        let delete = SignedDelete::sign(&sk);
        delete.verify().unwrap();

        let other = generate_signing_key();
        let forged = SignedDelete {
            signature: SignedDelete::sign(&other).signature,
            ..delete
        };
        assert!(forged.verify().is_err());
    }

    #[test]
    fn test_header_signature_is_not_a_delete() {
        let sk = generate_signing_key();
        let header = SignedHeader::sign(&sk, 1, hash(b"x"), 1);
        let delete = SignedDelete {
            storage_index: header.storage_index,
            verifying_key: header.verifying_key,
            signature: header.signature,
        };
        assert!(delete.verify().is_err());
    }

    #[test]
    fn test_read_key_is_one_way() {
        let sk = SigningKey::from_bytes(&[5u8; 32]);
        let rk = mutable_read_key(&sk).unwrap();
        assert_eq!(rk, mutable_read_key(&sk).unwrap());
        assert_ne!(rk.as_bytes(), &sk.to_bytes());
    }

    #[test]
    fn test_wrong_header_length() {
        assert!(SignedHeader::from_bytes(&[0u8; 100]).is_err());
    }
}
