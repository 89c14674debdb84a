// pgvault/src/backup/upload.rs
use std::path::Path;
use tracing::{info, warn};

use crate::errors::Result;
use crate::snapshot::Snapshot;
use crate::storage::SnapshotStore;

/// Uploads a staged artifact. On failure the local file is left in place for
/// manual recovery; no retry happens here, the next scheduled run is the retry.
pub async fn upload(
    artifact_path: &Path,
    name: &str,
    store: &dyn SnapshotStore,
    keep_local_artifact: bool,
) -> Result<Snapshot> {
    info!("Uploading {} to {}", name, store.describe());
    let snapshot = match store.put(artifact_path, name).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(
                "Upload failed, local artifact kept at {}",
                artifact_path.display()
            );
            return Err(e);
        }
    };

    if !keep_local_artifact {
        if let Err(e) = tokio::fs::remove_file(artifact_path).await {
            warn!(
                "Uploaded but could not remove staged artifact {}: {}",
                artifact_path.display(),
                e
            );
        }
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_failed_upload_keeps_local_artifact() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("db_20250101_000000.sql.gz");
        std::fs::write(&artifact, b"gz").unwrap();
        let store = MemoryStore {
            fail_puts: true,
            ..Default::default()
        };

        let result = upload(&artifact, "db_20250101_000000.sql.gz", &store, false).await;
        assert!(result.is_err());
        assert!(artifact.exists());
    }

    #[tokio::test]
    async fn test_successful_upload_removes_staged_file() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("db_20250101_000000.sql.gz");
        std::fs::write(&artifact, b"gz").unwrap();
        let store = MemoryStore::default();

        let snap = upload(&artifact, "db_20250101_000000.sql.gz", &store, false)
            .await
            .unwrap();
        assert_eq!(snap.size_bytes, 2);
        assert!(!artifact.exists());
        assert_eq!(store.names(), vec!["db_20250101_000000.sql.gz".to_string()]);
    }

    #[tokio::test]
    async fn test_keep_local_artifact() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("db_20250101_000000.sql.gz");
        std::fs::write(&artifact, b"gz").unwrap();
        let store = MemoryStore::default();

        upload(&artifact, "db_20250101_000000.sql.gz", &store, true)
            .await
            .unwrap();
        assert!(artifact.exists());
    }
}
