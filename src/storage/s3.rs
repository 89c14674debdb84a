// pgvault/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::DateTime;
use s3::config::Region;
use s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use s3::primitives::ByteStream;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::SnapshotStore;
use crate::config::SpacesConfig;
use crate::errors::{AppError, Result};
use crate::snapshot::{Snapshot, matches_prefix};

const AUTH_ERROR_CODES: &[&str] = &[
    "AccessDenied",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "InvalidToken",
    "ExpiredToken",
];

/// S3-compatible store (AWS, MinIO, DigitalOcean Spaces).
pub struct S3Store {
    client: s3::Client,
    spaces_config: SpacesConfig,
    backup_prefix: String,
}

impl S3Store {
    pub async fn connect(spaces_config: SpacesConfig, backup_prefix: &str) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static",
            ))
            .load()
            .await;

        // MinIO and most self-hosted endpoints only speak path-style.
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        S3Store {
            client: s3::Client::from_conf(s3_config),
            spaces_config,
            backup_prefix: backup_prefix.to_string(),
        }
    }

    fn key_for(&self, name: &str) -> String {
        object_key(self.spaces_config.folder_prefix.as_deref(), name)
    }

    fn list_prefix(&self) -> String {
        self.key_for(&self.backup_prefix)
    }
}

pub(crate) fn object_key(folder_prefix: Option<&str>, name: &str) -> String {
    match folder_prefix {
        Some(folder) if !folder.is_empty() => format!("{}/{}", folder, name),
        _ => name.to_string(),
    }
}

/// Splits SDK failures into auth, missing-object and transport errors.
fn classify<E, R>(err: SdkError<E, R>, target: &str) -> AppError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let code = err.code().map(str::to_string);
    let detail = DisplayErrorContext(&err).to_string();
    match code.as_deref() {
        Some(c) if AUTH_ERROR_CODES.contains(&c) => AppError::Auth {
            target: target.to_string(),
            detail,
        },
        Some("NoSuchKey") | Some("NotFound") => AppError::NotFound(target.to_string()),
        _ => AppError::connection(target, detail),
    }
}

#[async_trait]
impl SnapshotStore for S3Store {
    async fn put(&self, artifact: &Path, name: &str) -> Result<Snapshot> {
        let s3_key = self.key_for(name);
        info!(
            "Uploading {} to S3 bucket {} with key {}",
            artifact.display(),
            self.spaces_config.bucket_name,
            s3_key
        );

        let size_bytes = tokio::fs::metadata(artifact).await?.len();
        let body = ByteStream::from_path(artifact)
            .await
            .map_err(|e| AppError::Io(std::io::Error::other(e)))?;

        self.client
            .put_object()
            .bucket(&self.spaces_config.bucket_name)
            .key(&s3_key)
            .body(body)
            .content_type("application/gzip")
            .send()
            .await
            .map_err(|e| classify(e, &format!("s3://{}", self.spaces_config.bucket_name)))?;

        info!("✓ Uploaded {} ({} bytes)", s3_key, size_bytes);
        Ok(Snapshot {
            name: name.to_string(),
            created_at: crate::snapshot::parse_snapshot_timestamp(name)
                .unwrap_or_else(chrono::Utc::now),
            size_bytes,
            storage_key: s3_key,
        })
    }

    async fn list(&self) -> Result<Vec<Snapshot>> {
        let prefix = self.list_prefix();
        let target = format!("s3://{}/{}", self.spaces_config.bucket_name, prefix);
        let mut snapshots = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.spaces_config.bucket_name)
                .prefix(&prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| classify(e, &target))?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let name = key.rsplit('/').next().unwrap_or(key);
                if !matches_prefix(name, &self.backup_prefix) {
                    debug!("Ignoring foreign object {}", key);
                    continue;
                }
                let last_modified = object
                    .last_modified()
                    .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()));
                let size = object.size().unwrap_or_default().max(0) as u64;
                match Snapshot::from_listing(name, key, size, last_modified) {
                    Some(snapshot) => snapshots.push(snapshot),
                    None => warn!("Skipping {}: no usable timestamp", key),
                }
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(snapshots)
    }

    async fn delete(&self, snapshot: &Snapshot) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.spaces_config.bucket_name)
            .key(&snapshot.storage_key)
            .send()
            .await
            .map_err(|e| classify(e, &snapshot.storage_key))?;
        Ok(())
    }

    async fn fetch(&self, snapshot: &Snapshot, dest: &Path) -> Result<u64> {
        info!(
            "Downloading s3://{}/{} to {}",
            self.spaces_config.bucket_name,
            snapshot.storage_key,
            dest.display()
        );

        let object = self
            .client
            .get_object()
            .bucket(&self.spaces_config.bucket_name)
            .key(&snapshot.storage_key)
            .send()
            .await
            .map_err(|e| classify(e, &snapshot.name))?;

        let mut output_file = tokio::fs::File::create(dest).await?;
        let mut reader = object.body.into_async_read();
        let total = tokio::io::copy(&mut reader, &mut output_file)
            .await
            .map_err(|e| AppError::connection(&snapshot.storage_key, e))?;
        output_file.flush().await?;

        info!("✓ Downloaded {} bytes", total);
        Ok(total)
    }

    fn describe(&self) -> String {
        format!(
            "s3://{}/{}",
            self.spaces_config.bucket_name,
            self.spaces_config.folder_prefix.as_deref().unwrap_or("")
        )
    }
}
