//! tessera-crypto: convergent encryption, capabilities, and mutable-object signing
//!
//! Architecture: Encrypt-then-Encode with XChaCha20-Poly1305
//!
//! Pipeline: plaintext → convergent key → encrypt → erasure code (tessera-codec) → place
//!
//! Key hierarchy:
//! ```text
//! Immutable (CHK)
//!   Read Key = BLAKE3 derive-key(convergence secret, params, plaintext)
//!   ├── Storage Index = HKDF(read key, "tessera-storage-index")
//!   └── Nonce         = HKDF(read key, "tessera-chk-nonce")
//!
//! Mutable (SSK)
//!   Signing Key (Ed25519, random)
//!   ├── Read Key      = HKDF(signing seed, "tessera-ssk-read-key")
//!   └── Verifying Key
//!       └── Storage Index = BLAKE3 derive-key(verifying key)
//!
//! Client root (Argon2id from passphrase, optional)
//!   ├── Convergence Secret (HKDF, "tessera-convergence-secret")
//!   └── Lease Secret       (HKDF, "tessera-lease-secret")
//!       └── Lease Owner per object = BLAKE3 derive-key(lease secret, storage index)
//! ```

pub mod capability;
pub mod cipher;
pub mod kdf;
pub mod keys;
pub mod signing;

pub use capability::Capability;
pub use cipher::{
    ciphertext_len, decrypt, decrypt_immutable, decrypt_mutable, encrypt, encrypt_immutable,
    encrypt_mutable,
};
pub use ed25519_dalek::{SigningKey, VerifyingKey};
pub use kdf::{derive_client_secrets, ClientSecrets, KdfParams};
pub use keys::{derive_convergent_key, ConvergenceSecret, LeaseSecret, ReadKey};
pub use signing::{
    generate_signing_key, mutable_read_key, mutable_storage_index, SignedDelete, SignedHeader,
};

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
