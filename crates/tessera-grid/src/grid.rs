//! The client's handle on a set of storage nodes

use secrecy::SecretString;
use std::sync::Arc;
use tessera_core::config::ClientConfig;
use tessera_core::{EncodingParams, GridError, GridResult, PeerId, StorageIndex};
use tessera_crypto::{derive_client_secrets, ConvergenceSecret, KdfParams, LeaseSecret};
use tessera_storage::StorageNode;

use crate::permute::permute_nodes;

/// Client-side knobs for placement and retrieval.
#[derive(Debug)]
pub struct GridOptions {
    pub params: EncodingParams,
    /// Distinct shares that must be confirmed for an upload to succeed
    pub happy: usize,
    /// Accepting shares a mutable publish needs
    pub quorum: usize,
    /// Concurrent peer queries during retrieval
    pub window: usize,
    pub convergence: Option<ConvergenceSecret>,
    pub lease_secret: LeaseSecret,
}

impl GridOptions {
    /// Defaults: happy = n, quorum = max(k, n/2 + 1), window = k, no
    /// convergence secret, a fresh random lease secret.
    pub fn new(params: EncodingParams) -> Self {
        let k = params.needed as usize;
        let n = params.total as usize;
        Self {
            params,
            happy: n,
            quorum: k.max(n / 2 + 1),
            window: k,
            convergence: None,
            lease_secret: LeaseSecret::generate(),
        }
    }

    pub fn from_config(client: &ClientConfig) -> GridResult<Self> {
        let mut opts = Self::new(client.encoding_params()?);
        opts.happy = client.happy()?;
        opts.quorum = client.quorum()?;
        opts.window = client.window();
        if let (Some(passphrase), Some(salt)) = (&client.passphrase, client.salt()?) {
            let kdf = KdfParams {
                mem_cost_kib: client.kdf_mem_cost_kib,
                time_cost: client.kdf_time_cost,
                parallelism: client.kdf_parallelism,
            };
            let secrets = derive_client_secrets(&SecretString::from(passphrase.clone()), &salt, &kdf)?;
            opts.convergence = Some(secrets.convergence);
            opts.lease_secret = secrets.lease;
        }
        if let Some(secret) = &client.convergence_secret {
            opts.convergence = Some(ConvergenceSecret::from(&SecretString::from(secret.clone())));
        }
        if let Some(phrase) = &client.lease_secret {
            opts.lease_secret = LeaseSecret::from_phrase(&SecretString::from(phrase.clone()));
        }
        Ok(opts)
    }

    pub fn with_happy(mut self, happy: usize) -> GridResult<Self> {
        self.happy = self.within_k_n("happy", happy)?;
        Ok(self)
    }

    pub fn with_quorum(mut self, quorum: usize) -> GridResult<Self> {
        self.quorum = self.within_k_n("quorum", quorum)?;
        Ok(self)
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn with_convergence_secret(mut self, secret: ConvergenceSecret) -> Self {
        self.convergence = Some(secret);
        self
    }

    pub fn with_lease_secret(mut self, secret: LeaseSecret) -> Self {
        self.lease_secret = secret;
        self
    }

    fn within_k_n(&self, what: &str, value: usize) -> GridResult<usize> {
        let (k, n) = (self.params.needed as usize, self.params.total as usize);
        if value < k || value > n {
            return Err(GridError::Config(format!(
                "{what} ({value}) must lie between k ({k}) and n ({n})"
            )));
        }
        Ok(value)
    }
}

/// Entry point for every client operation.
///
/// Operations live in sibling modules: `upload`, `download`, `mutable`,
/// `health`. A `Grid` is cheap to share behind an `Arc`; it holds no
/// per-operation state.
pub struct Grid {
    peers: Vec<Arc<dyn StorageNode>>,
    opts: GridOptions,
}

impl Grid {
    pub fn new(peers: Vec<Arc<dyn StorageNode>>, opts: GridOptions) -> Self {
        tracing::debug!(peers = peers.len(), params = %opts.params, happy = opts.happy, "grid client ready");
        Self { peers, opts }
    }

    pub fn options(&self) -> &GridOptions {
        &self.opts
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|p| p.peer_id()).collect()
    }

    /// Peers in the order this object's shares are placed and sought.
    pub(crate) fn peers_for(&self, storage_index: &StorageIndex) -> Vec<Arc<dyn StorageNode>> {
        permute_nodes(storage_index, &self.peers)
    }
}
