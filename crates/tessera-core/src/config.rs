use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{GridError, GridResult};
use crate::types::EncodingParams;

/// Top-level configuration (loaded from tessera.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    pub node: NodeConfig,
    pub client: ClientConfig,
    pub lease: LeaseConfig,
    pub daemon: DaemonConfig,
}

/// Storage node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Human-readable node name; the peer id is derived from it
    pub name: String,
    /// Share byte store: "memory", "fs", or "s3"
    pub backend: String,
    /// Root directory for the fs backend
    pub root: PathBuf,
    /// S3 endpoint (s3 backend only)
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// S3 bucket
    pub bucket: String,
    /// Refuse new shares once this many bytes are held (0 = unlimited)
    pub capacity_bytes: u64,
}

/// Uploader/downloader settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Shares needed to reconstruct (k)
    pub shares_needed: u8,
    /// Shares produced per object (n)
    pub shares_total: u8,
    /// Distinct shares that must be confirmed for an upload to succeed
    pub shares_happy: u8,
    /// Ciphertext segment size in bytes
    pub segment_size: u32,
    /// Optional convergence secret; scopes deduplication to clients sharing it
    pub convergence_secret: Option<String>,
    /// Secret from which per-object lease owner ids are derived
    pub lease_secret: Option<String>,
    /// Concurrent peer queries during retrieval (0 = k)
    pub retrieve_window: usize,
    /// Shares that must accept a mutable write (None = max(k, n/2 + 1))
    pub write_quorum: Option<u8>,
    /// Passphrase both client secrets are stretched from (Argon2id).
    /// `convergence_secret` and `lease_secret` override what it yields.
    pub passphrase: Option<String>,
    /// 16-byte salt for `passphrase`, as 32 hex chars
    pub passphrase_salt: Option<String>,
    /// Argon2id memory cost in KiB
    pub kdf_mem_cost_kib: u32,
    /// Argon2id iterations
    pub kdf_time_cost: u32,
    pub kdf_parallelism: u32,
}

/// Lease and garbage-collection policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lifetime of a new or renewed lease (default: 31 days)
    pub duration_secs: u64,
    /// Extra time after the last lease expires before a share is reclaimed
    pub grace_period_secs: u64,
    /// Interval between expiry sweeps
    pub sweep_interval_secs: u64,
    /// JSON file the lease table is persisted to
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Prometheus metrics endpoint (default: 127.0.0.1:9100)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

impl ClientConfig {
    /// Encoding parameters after validation
    pub fn encoding_params(&self) -> GridResult<EncodingParams> {
        EncodingParams::new(self.shares_needed, self.shares_total)?
            .with_segment_size(self.segment_size)
    }

    /// Happy threshold clamped into k..=n
    pub fn happy(&self) -> GridResult<usize> {
        let params = self.encoding_params()?;
        if self.shares_happy < params.needed || self.shares_happy > params.total {
            return Err(GridError::Config(format!(
                "shares_happy ({}) must lie between k ({}) and n ({})",
                self.shares_happy, params.needed, params.total
            )));
        }
        Ok(self.shares_happy as usize)
    }

    pub fn quorum(&self) -> GridResult<usize> {
        let params = self.encoding_params()?;
        let default = (params.needed as usize).max(params.total as usize / 2 + 1);
        let q = self.write_quorum.map(usize::from).unwrap_or(default);
        if q < params.needed as usize || q > params.total as usize {
            return Err(GridError::Config(format!(
                "write_quorum ({q}) must lie between k and n"
            )));
        }
        Ok(q)
    }

    /// Decoded `passphrase_salt`; required whenever `passphrase` is set.
    pub fn salt(&self) -> GridResult<Option<[u8; 16]>> {
        match (&self.passphrase, &self.passphrase_salt) {
            (None, _) => Ok(None),
            (Some(_), None) => Err(GridError::Config(
                "passphrase is set but passphrase_salt is missing".into(),
            )),
            (Some(_), Some(text)) => {
                let mut salt = [0u8; 16];
                hex::decode_to_slice(text, &mut salt).map_err(|e| {
                    GridError::Config(format!("passphrase_salt must be 32 hex chars: {e}"))
                })?;
                Ok(Some(salt))
            }
        }
    }

    pub fn window(&self) -> usize {
        if self.retrieve_window == 0 {
            self.shares_needed.max(1) as usize
        } else {
            self.retrieve_window
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "tessera-node".into(),
            backend: "memory".into(),
            root: PathBuf::from("~/.local/share/tessera/shares"),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "tessera".into(),
            capacity_bytes: 0,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            shares_needed: 3,
            shares_total: 10,
            shares_happy: 10,
            segment_size: EncodingParams::DEFAULT_SEGMENT_SIZE,
            convergence_secret: None,
            lease_secret: None,
            retrieve_window: 0,
            write_quorum: None,
            passphrase: None,
            passphrase_salt: None,
            kdf_mem_cost_kib: 65536,
            kdf_time_cost: 3,
            kdf_parallelism: 4,
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_secs: 31 * 24 * 3600,
            grace_period_secs: 24 * 3600,
            sweep_interval_secs: 3600,
            state_file: None,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            metrics_addr: Some("127.0.0.1:9100".into()),
            log_level: "info".into(),
            log_format: "json".into(),
        }
    }
}

impl TesseraConfig {
    /// Read `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config
            .client
            .encoding_params()
            .with_context(|| format!("invalid [client] section in {}", path.display()))?;
        Ok(config)
    }
}
