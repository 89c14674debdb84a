// pgvault/src/storage/mod.rs
pub(crate) mod local;
pub(crate) mod s3;

use async_trait::async_trait;
use std::path::Path;

use crate::config::{AppConfig, StorageConfig};
use crate::errors::Result;
use crate::snapshot::Snapshot;

/// Object storage holding the snapshot artifacts. The orchestrator only
/// creates, lists, fetches and deletes by key.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Uploads `artifact` under `name` and returns the stored snapshot.
    async fn put(&self, artifact: &Path, name: &str) -> Result<Snapshot>;

    /// All snapshots of this store's family, in no particular order.
    async fn list(&self) -> Result<Vec<Snapshot>>;

    async fn delete(&self, snapshot: &Snapshot) -> Result<()>;

    /// Downloads `snapshot` to `dest`, returning the number of bytes written.
    async fn fetch(&self, snapshot: &Snapshot, dest: &Path) -> Result<u64>;

    /// Human-readable location, used in logs and errors.
    fn describe(&self) -> String;
}

pub async fn open_store(app_config: &AppConfig) -> Result<Box<dyn SnapshotStore>> {
    match &app_config.storage {
        StorageConfig::S3(spaces) => Ok(Box::new(
            s3::S3Store::connect(spaces.clone(), &app_config.backup_prefix).await,
        )),
        StorageConfig::Local(dir) => Ok(Box::new(local::LocalStore::new(
            dir.clone(),
            &app_config.backup_prefix,
        )?)),
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory store for orchestration tests.
    use super::*;
    use crate::errors::AppError;
    use crate::snapshot::parse_snapshot_timestamp;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryStore {
        pub objects: Mutex<BTreeMap<String, (Snapshot, Vec<u8>)>>,
        pub fail_puts: bool,
        pub fail_lists: bool,
        pub deletes: Mutex<Vec<String>>,
        pub fetches: Mutex<Vec<String>>,
    }

    impl MemoryStore {
        pub fn with(snapshots: Vec<Snapshot>) -> Self {
            let store = MemoryStore::default();
            for snap in snapshots {
                store.insert(snap, Vec::new());
            }
            store
        }

        pub fn insert(&self, snapshot: Snapshot, body: Vec<u8>) {
            self.objects
                .lock()
                .unwrap()
                .insert(snapshot.name.clone(), (snapshot, body));
        }

        pub fn names(&self) -> Vec<String> {
            self.objects.lock().unwrap().keys().cloned().collect()
        }
    }

    #[async_trait]
    impl SnapshotStore for MemoryStore {
        async fn put(&self, artifact: &Path, name: &str) -> Result<Snapshot> {
            if self.fail_puts {
                return Err(AppError::connection("memory", "simulated upload failure"));
            }
            let body = tokio::fs::read(artifact).await?;
            let snapshot = Snapshot {
                name: name.to_string(),
                created_at: parse_snapshot_timestamp(name).unwrap_or_else(Utc::now),
                size_bytes: body.len() as u64,
                storage_key: format!("mem/{}", name),
            };
            self.insert(snapshot.clone(), body);
            Ok(snapshot)
        }

        async fn list(&self) -> Result<Vec<Snapshot>> {
            if self.fail_lists {
                return Err(AppError::connection("memory", "simulated list failure"));
            }
            Ok(self
                .objects
                .lock()
                .unwrap()
                .values()
                .map(|(s, _)| s.clone())
                .collect())
        }

        async fn delete(&self, snapshot: &Snapshot) -> Result<()> {
            self.objects.lock().unwrap().remove(&snapshot.name);
            self.deletes.lock().unwrap().push(snapshot.name.clone());
            Ok(())
        }

        async fn fetch(&self, snapshot: &Snapshot, dest: &Path) -> Result<u64> {
            self.fetches.lock().unwrap().push(snapshot.name.clone());
            let body = self
                .objects
                .lock()
                .unwrap()
                .get(&snapshot.name)
                .map(|(_, b)| b.clone())
                .ok_or_else(|| AppError::NotFound(snapshot.name.clone()))?;
            tokio::fs::write(dest, &body).await?;
            Ok(body.len() as u64)
        }

        fn describe(&self) -> String {
            "memory://test".to_string()
        }
    }
}
