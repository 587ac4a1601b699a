//! Share byte store health check

use opendal::Operator;
use tessera_core::{GridError, GridResult};

const PROBE_PATH: &str = ".tessera-health-probe";

/// Verify the backend accepts a write, serves it back, and deletes it.
pub async fn check_health(op: &Operator) -> GridResult<()> {
    let probe = b"ok".to_vec();
    op.write(PROBE_PATH, probe.clone())
        .await
        .map_err(|e| GridError::Storage(format!("health probe write failed: {e}")))?;
    let read = op
        .read(PROBE_PATH)
        .await
        .map_err(|e| GridError::Storage(format!("health probe read failed: {e}")))?;
    if read.to_vec() != probe {
        return Err(GridError::Storage("health probe read back different bytes".into()));
    }
    op.delete(PROBE_PATH)
        .await
        .map_err(|e| GridError::Storage(format!("health probe delete failed: {e}")))
}

/// Returns true if the backend is usable, false otherwise (non-panicking)
pub async fn is_healthy(op: &Operator) -> bool {
    check_health(op).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendal::services::Memory;

    #[test]
    fn memory_backend_is_healthy() {
        let op = Operator::new(Memory::default()).unwrap().finish();
        assert!(tokio_test::block_on(is_healthy(&op)));
        // probe cleans up after itself
        let exists = tokio_test::block_on(op.exists(PROBE_PATH)).unwrap();
        assert!(!exists);
    }
}
