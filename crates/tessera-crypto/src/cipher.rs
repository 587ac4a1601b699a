//! Object encryption with XChaCha20-Poly1305
//!
//! Encrypted object format (binary):
//! ```text
//! [24 bytes: nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//!
//! Immutable objects: nonce derived from the convergent key, AAD = storage index.
//! Mutable versions:  random nonce, AAD = storage index || version (8 bytes, BE).
//!
//! The AAD binds ciphertext to its object (and version), so shares of one
//! object can't be substituted for another's even under the same key.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use tessera_core::{GridError, GridResult, StorageIndex};

use crate::keys::ReadKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Ciphertext length for `plaintext_len` bytes of input, `None` when it
/// does not fit in a u64.
pub const fn ciphertext_len(plaintext_len: u64) -> Option<u64> {
    plaintext_len.checked_add((NONCE_SIZE + TAG_SIZE) as u64)
}

/// Encrypt with an explicit nonce.
///
/// Returns: `[24-byte nonce][ciphertext][16-byte tag]`
pub fn encrypt(
    key: &ReadKey,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> GridResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| GridError::Other(anyhow::anyhow!("encryption failed: {e}")))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(nonce);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt `[nonce][ciphertext][tag]`. Any mismatch of key, AAD or bytes is
/// an `AuthenticationFailure`.
pub fn decrypt(key: &ReadKey, aad: &[u8], encrypted: &[u8]) -> GridResult<Vec<u8>> {
    if encrypted.len() < NONCE_SIZE + TAG_SIZE {
        return Err(GridError::AuthenticationFailure(format!(
            "ciphertext too short: {} bytes (minimum {})",
            encrypted.len(),
            NONCE_SIZE + TAG_SIZE
        )));
    }

    let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(
            XNonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| {
            GridError::AuthenticationFailure(
                "decryption failed: wrong key, tampered ciphertext, or wrong object".into(),
            )
        })
}

pub fn encrypt_immutable(key: &ReadKey, plaintext: &[u8]) -> GridResult<Vec<u8>> {
    let si = key.storage_index()?;
    encrypt(key, &key.immutable_nonce()?, si.as_bytes(), plaintext)
}

pub fn decrypt_immutable(key: &ReadKey, encrypted: &[u8]) -> GridResult<Vec<u8>> {
    let si = key.storage_index()?;
    decrypt(key, si.as_bytes(), encrypted)
}

pub fn encrypt_mutable(
    key: &ReadKey,
    storage_index: &StorageIndex,
    version: u64,
    plaintext: &[u8],
) -> GridResult<Vec<u8>> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    encrypt(key, &nonce, &mutable_aad(storage_index, version), plaintext)
}

pub fn decrypt_mutable(
    key: &ReadKey,
    storage_index: &StorageIndex,
    version: u64,
    encrypted: &[u8],
) -> GridResult<Vec<u8>> {
    decrypt(key, &mutable_aad(storage_index, version), encrypted)
}

/// Build AAD: storage_index (32 bytes) || version (8 bytes BE)
fn mutable_aad(storage_index: &StorageIndex, version: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(32 + 8);
    aad.extend_from_slice(storage_index.as_bytes());
    aad.extend_from_slice(&version.to_be_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::derive_convergent_key;
    use tessera_core::EncodingParams;

    fn key_for(data: &[u8]) -> ReadKey {
        derive_convergent_key(data, &EncodingParams::default(), None)
    }

    #[test]
    fn test_immutable_roundtrip() {
        let plaintext = b"hello, encrypted grid!";
        let key = key_for(plaintext);
        let encrypted = encrypt_immutable(&key, plaintext).unwrap();
        assert_eq!(decrypt_immutable(&key, &encrypted).unwrap(), plaintext);
    }

    #[test]
    fn test_immutable_is_deterministic() {
        let plaintext = b"same content";
        let key = key_for(plaintext);
        assert_eq!(
            encrypt_immutable(&key, plaintext).unwrap(),
            encrypt_immutable(&key, plaintext).unwrap()
        );
    }

    #[test]
    fn test_encrypt_decrypt_empty() {
        let key = key_for(b"");
        let encrypted = encrypt_immutable(&key, b"").unwrap();
        assert_eq!(Some(encrypted.len() as u64), ciphertext_len(0));
        assert!(decrypt_immutable(&key, &encrypted).unwrap().is_empty());
    }

    #[test]
    fn test_ciphertext_len_overflow() {
        assert_eq!(ciphertext_len(100), Some(140));
        assert_eq!(ciphertext_len(u64::MAX), None);
        assert_eq!(ciphertext_len(u64::MAX - 40), Some(u64::MAX));
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let encrypted = encrypt_immutable(&key_for(b"a"), b"secret data").unwrap();
        let result = decrypt_immutable(&key_for(b"b"), &encrypted);
        assert!(matches!(result, Err(GridError::AuthenticationFailure(_))));
    }

    #[test]
    fn test_mutable_wrong_version() {
        let key = ReadKey::from_bytes([7u8; 32]);
        let si = StorageIndex([1u8; 32]);
        let encrypted = encrypt_mutable(&key, &si, 3, b"v3 contents").unwrap();
        assert_eq!(decrypt_mutable(&key, &si, 3, &encrypted).unwrap(), b"v3 contents");
        assert!(
            decrypt_mutable(&key, &si, 4, &encrypted).is_err(),
            "wrong version must fail (AAD mismatch)"
        );
    }

    #[test]
    fn test_mutable_wrong_storage_index() {
        let key = ReadKey::from_bytes([7u8; 32]);
        let encrypted = encrypt_mutable(&key, &StorageIndex([1u8; 32]), 1, b"data").unwrap();
        assert!(decrypt_mutable(&key, &StorageIndex([2u8; 32]), 1, &encrypted).is_err());
    }

    #[test]
    fn test_mutable_nonces_are_random() {
        let key = ReadKey::from_bytes([7u8; 32]);
        let si = StorageIndex([1u8; 32]);
        let a = encrypt_mutable(&key, &si, 1, b"data").unwrap();
        let b = encrypt_mutable(&key, &si, 1, b"data").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }

    #[test]
    fn test_encrypted_size() {
        let plaintext = vec![0u8; 1000];
        let encrypted = encrypt_immutable(&key_for(&plaintext), &plaintext).unwrap();

        // nonce (24) + plaintext (1000) + tag (16) = 1040
        assert_eq!(encrypted.len(), 24 + 1000 + 16);
    }

    #[test]
    fn test_tampered_ciphertext() {
        let key = key_for(b"secret data");
        let mut encrypted = encrypt_immutable(&key, b"secret data").unwrap();
        // Flip a byte in the ciphertext (after nonce)
        encrypted[25] ^= 0xFF;

        let result = decrypt_immutable(&key, &encrypted);
        assert!(
            matches!(result, Err(GridError::AuthenticationFailure(_))),
            "tampered ciphertext must fail"
        );
    }

    #[test]
    fn test_truncated_ciphertext() {
        let key = key_for(b"x");
        assert!(matches!(
            decrypt_immutable(&key, &[0u8; 10]),
            Err(GridError::AuthenticationFailure(_))
        ));
    }
}
