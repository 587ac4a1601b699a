//! OpenDAL Operator factory for a storage node's share byte store

use anyhow::{Context, Result};
use opendal::{Builder, Operator};
use tessera_core::config::NodeConfig;

/// S3 credentials, loaded by the daemon from its environment
#[derive(Clone, Default)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// Build the operator named by `node.backend`: "memory", "fs", or "s3".
///
/// Every backend gets the same logging and retry layers.
pub fn build_operator(node: &NodeConfig, creds: Option<&S3Credentials>) -> Result<Operator> {
    match node.backend.as_str() {
        "memory" => finish(opendal::services::Memory::default()),
        "fs" => {
            let root = node
                .root
                .to_str()
                .context("fs backend root is not valid UTF-8")?;
            // opendal 0.55: builders use the consuming pattern
            finish(opendal::services::Fs::default().root(root))
        }
        "s3" => {
            if node.endpoint.starts_with("http://") {
                tracing::warn!(
                    endpoint = %node.endpoint,
                    "S3 endpoint uses plaintext HTTP; shares are encrypted but credentials are not"
                );
            }
            let creds = creds.context("s3 backend requires credentials")?;
            // Path-style addressing is the default, which SeaweedFS and MinIO need.
            finish(
                opendal::services::S3::default()
                    .endpoint(&node.endpoint)
                    .region(&node.region)
                    .bucket(&node.bucket)
                    .access_key_id(&creds.access_key_id)
                    .secret_access_key(&creds.secret_access_key),
            )
        }
        other => anyhow::bail!("unknown storage backend '{other}' (expected memory, fs, or s3)"),
    }
}

fn finish<B: Builder>(builder: B) -> Result<Operator> {
    let op = Operator::new(builder)
        .context("creating OpenDAL operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();
    Ok(op)
}
