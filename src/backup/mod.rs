// pgvault/src/backup/mod.rs
pub(crate) mod archive;
pub(crate) mod db_dump;
pub(crate) mod retention;
pub(crate) mod upload;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::{AppConfig, RetentionPolicy, Timeouts};
use crate::errors::{AppError, Result};
use crate::notify::{Notifier, build_notifier, notify_backup};
use crate::snapshot::Snapshot;
use crate::storage::{SnapshotStore, open_store};
use crate::utils::with_timeout;
use db_dump::DumpArtifact;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failure,
}

/// Record of one pipeline execution. Lives only until it has been reported.
#[derive(Debug, Clone)]
pub struct BackupRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub snapshot: Option<Snapshot>,
    pub error_detail: Option<String>,
    pub deleted_count: usize,
    /// Snapshots in storage after the run; `None` when storage could not be listed.
    pub total_snapshot_count: Option<usize>,
    pub retention_days: u32,
    pub databases: Vec<String>,
}

impl BackupRun {
    pub fn start(started_at: DateTime<Utc>, retention_days: u32) -> Self {
        BackupRun {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: None,
            status: RunStatus::Failure,
            snapshot: None,
            error_detail: None,
            deleted_count: 0,
            total_snapshot_count: None,
            retention_days,
            databases: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }

    fn fail(&mut self, err: &AppError) {
        self.status = RunStatus::Failure;
        self.error_detail = Some(err.to_string());
    }
}

/// Produces the compressed artifact for a run.
#[async_trait]
pub trait DumpSource: Send + Sync {
    async fn create_dump(&self, started_at: DateTime<Utc>) -> Result<DumpArtifact>;
}

/// `pg_dump` against the configured server.
pub struct PgDumpSource<'a> {
    pub app_config: &'a AppConfig,
}

#[async_trait]
impl DumpSource for PgDumpSource<'_> {
    async fn create_dump(&self, started_at: DateTime<Utc>) -> Result<DumpArtifact> {
        db_dump::create_dump(self.app_config, started_at).await
    }
}

pub struct BackupContext<'a> {
    pub store: &'a dyn SnapshotStore,
    pub notifier: &'a dyn Notifier,
    pub retention: RetentionPolicy,
    pub keep_local_artifact: bool,
    pub timeouts: &'a Timeouts,
}

/// Dump → Upload → Retention → Notify. Never returns an error: the outcome is
/// carried by the returned run, which has already been reported.
pub async fn run_backup(
    ctx: &BackupContext<'_>,
    dumper: &dyn DumpSource,
    started_at: DateTime<Utc>,
) -> BackupRun {
    let mut run = BackupRun::start(started_at, ctx.retention.retention_days);
    let span = info_span!("backup", run_id = %run.run_id);

    async {
        info!("🚀 Starting database backup");
        if let Err(e) = execute_stages(ctx, dumper, &mut run).await {
            error!("❌ Backup failed: {}", e);
            run.fail(&e);
        }

        run.total_snapshot_count = match ctx.store.list().await {
            Ok(snapshots) => Some(snapshots.len()),
            Err(e) => {
                warn!("Could not count snapshots in {}: {}", ctx.store.describe(), e);
                None
            }
        };
        run.finished_at = Some(Utc::now());

        notify_backup(ctx.notifier, &run).await;
        if run.is_success() {
            info!("🎉 Backup completed successfully");
        }
    }
    .instrument(span)
    .await;

    run
}

async fn execute_stages(
    ctx: &BackupContext<'_>,
    dumper: &dyn DumpSource,
    run: &mut BackupRun,
) -> Result<()> {
    let artifact = with_timeout(
        "dump",
        ctx.timeouts.dump,
        dumper.create_dump(run.started_at),
    )
    .await?;
    run.databases = artifact.databases.clone();
    info!(
        "✓ Dump {} ready ({} bytes, {} databases)",
        artifact.name,
        artifact.size_bytes,
        artifact.databases.len()
    );
    if artifact.excluded_rows > 0 {
        info!("{} rows of excluded tables left out", artifact.excluded_rows);
    }

    let snapshot = with_timeout(
        "upload",
        ctx.timeouts.transfer,
        upload::upload(
            &artifact.path,
            &artifact.name,
            ctx.store,
            ctx.keep_local_artifact,
        ),
    )
    .await?;
    run.snapshot = Some(snapshot);

    // Only reached after a successful upload: a failed run never prunes.
    run.deleted_count = with_timeout(
        "retention sweep",
        ctx.timeouts.transfer,
        retention::enforce_retention(ctx.store, &ctx.retention, Utc::now()),
    )
    .await?;

    run.status = RunStatus::Success;
    Ok(())
}

/// Entry point for `pgvault backup`.
pub async fn run_backup_flow(app_config: &AppConfig) -> BackupRun {
    let notifier = build_notifier(app_config.webhook_url.as_deref(), app_config.timeouts.webhook);
    let started_at = Utc::now();

    let store = match open_store(app_config).await {
        Ok(store) => store,
        Err(e) => {
            error!("❌ Cannot open snapshot storage: {}", e);
            let mut run = BackupRun::start(started_at, app_config.retention.retention_days);
            run.fail(&e);
            run.finished_at = Some(Utc::now());
            notify_backup(notifier.as_ref(), &run).await;
            return run;
        }
    };

    let ctx = BackupContext {
        store: store.as_ref(),
        notifier: notifier.as_ref(),
        retention: app_config.retention,
        keep_local_artifact: app_config.keep_local_artifact,
        timeouts: &app_config.timeouts,
    };
    run_backup(&ctx, &PgDumpSource { app_config }, started_at).await
}

/// Entry point for `pgvault prune`.
pub async fn run_prune_flow(app_config: &AppConfig) -> Result<usize> {
    let store = open_store(app_config).await?;
    let deleted = with_timeout(
        "retention sweep",
        app_config.timeouts.transfer,
        retention::enforce_retention(store.as_ref(), &app_config.retention, Utc::now()),
    )
    .await?;
    info!("✓ Retention sweep removed {} snapshots", deleted);
    Ok(deleted)
}
