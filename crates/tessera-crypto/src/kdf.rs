//! Key derivation: Argon2id passphrase → client secrets
//!
//! A passphrase stretches to a 256-bit client root, from which the
//! convergence secret and the lease secret are expanded with HKDF. Clients
//! that share a passphrase and salt share both, so they deduplicate against
//! each other and can renew each other's leases.

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use tessera_core::{GridError, GridResult};
use tracing::debug;
use zeroize::Zeroize;

use crate::keys::{hkdf_derive, ConvergenceSecret, LeaseSecret};
use crate::KEY_SIZE;

/// Argon2id parameters for KDF
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientSecrets {
    pub convergence: ConvergenceSecret,
    pub lease: LeaseSecret,
}

/// Derive both client secrets from a passphrase and salt using Argon2id.
///
/// The salt need not be secret, but every client meant to converge must use
/// the same one.
pub fn derive_client_secrets(
    passphrase: &SecretString,
    salt: &[u8; 16],
    params: &KdfParams,
) -> GridResult<ClientSecrets> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| GridError::Config(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut root = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut root)
        .map_err(|e| GridError::Other(anyhow::anyhow!("Argon2id KDF failed: {e}")))?;

    let convergence = hkdf_derive(&root, b"tessera-convergence-secret");
    let lease = hkdf_derive(&root, b"tessera-lease-secret");
    root.zeroize();
    debug!(
        mem_cost_kib = params.mem_cost_kib,
        time_cost = params.time_cost,
        "derived client secrets from passphrase"
    );

    Ok(ClientSecrets {
        convergence: ConvergenceSecret::from_bytes(convergence?.to_vec()),
        lease: LeaseSecret::from_bytes(lease?),
    })
}
