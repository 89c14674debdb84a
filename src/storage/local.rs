// pgvault/src/storage/local.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::SnapshotStore;
use crate::errors::{AppError, Result};
use crate::snapshot::{Snapshot, matches_prefix};

/// Directory-backed store, for clusters that ship backups to a mounted volume
/// instead of object storage.
pub struct LocalStore {
    root: PathBuf,
    backup_prefix: String,
}

impl LocalStore {
    pub fn new(root: PathBuf, backup_prefix: &str) -> Result<Self> {
        std::fs::create_dir_all(&root).map_err(|e| {
            AppError::connection(root.display().to_string(), format!("cannot create directory: {}", e))
        })?;
        Ok(LocalStore {
            root,
            backup_prefix: backup_prefix.to_string(),
        })
    }
}

#[async_trait]
impl SnapshotStore for LocalStore {
    async fn put(&self, artifact: &Path, name: &str) -> Result<Snapshot> {
        let dest = self.root.join(name);
        // Copy beside the destination first so a reader never sees a partial file.
        let partial = self.root.join(format!(".{}.partial", name));
        info!("Copying {} to {}", artifact.display(), dest.display());
        let size_bytes = tokio::fs::copy(artifact, &partial).await?;
        tokio::fs::rename(&partial, &dest).await?;
        Ok(Snapshot {
            name: name.to_string(),
            created_at: crate::snapshot::parse_snapshot_timestamp(name).unwrap_or_else(Utc::now),
            size_bytes,
            storage_key: dest.display().to_string(),
        })
    }

    async fn list(&self) -> Result<Vec<Snapshot>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !matches_prefix(&name, &self.backup_prefix) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
            let key = entry.path().display().to_string();
            match Snapshot::from_listing(&name, &key, metadata.len(), modified) {
                Some(snapshot) => snapshots.push(snapshot),
                None => warn!("Skipping {}: no usable timestamp", key),
            }
        }
        Ok(snapshots)
    }

    async fn delete(&self, snapshot: &Snapshot) -> Result<()> {
        tokio::fs::remove_file(&snapshot.storage_key).await?;
        Ok(())
    }

    async fn fetch(&self, snapshot: &Snapshot, dest: &Path) -> Result<u64> {
        match tokio::fs::copy(&snapshot.storage_key, dest).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::NotFound(snapshot.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_put_list_fetch_delete() {
        let root = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let store = LocalStore::new(root.path().join("backups"), "db").unwrap();

        let artifact = staging.path().join("artifact.sql.gz");
        std::fs::write(&artifact, b"payload").unwrap();

        let snap = store.put(&artifact, "db_20250105_010203.sql.gz").await.unwrap();
        assert_eq!(snap.size_bytes, 7);

        // Foreign files and leftovers from other families are ignored.
        std::fs::write(root.path().join("backups/other_20250105_010203.sql.gz"), b"x").unwrap();
        std::fs::write(root.path().join("backups/notes.txt"), b"x").unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed, vec![snap.clone()]);

        let dest = staging.path().join("fetched.sql.gz");
        assert_eq!(store.fetch(&snap, &dest).await.unwrap(), 7);
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");

        store.delete(&snap).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert!(matches!(
            store.fetch(&snap, &dest).await,
            Err(AppError::NotFound(_))
        ));
    }
}
