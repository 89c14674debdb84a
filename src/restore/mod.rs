// pgvault/src/restore/mod.rs
pub(crate) mod db_restore;
mod logic;
pub(crate) mod verification;

use async_trait::async_trait;
use std::path::Path;
use uuid::Uuid;

use crate::config::{AppConfig, DatabaseConfig};
use crate::errors::{AppError, Result};
use crate::notify::build_notifier;
use crate::snapshot::{Snapshot, find_by_name, latest};
use crate::storage::{SnapshotStore, open_store};
use crate::utils::connection::check_db_connection;
use crate::utils::sql_filter::TableFilter;
pub use logic::{RestoreContext, perform_restore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    Idle,
    ListingSnapshots,
    Downloading,
    Decompressing,
    Restoring,
    Done,
    Failed,
}

impl RestoreState {
    /// Forward one step at a time; `Failed` from any state that has started
    /// and not yet finished.
    pub fn can_transition_to(self, next: RestoreState) -> bool {
        use RestoreState::*;
        match next {
            Failed => !matches!(self, Idle | Done | Failed),
            _ => matches!(
                (self, next),
                (Idle, ListingSnapshots)
                    | (ListingSnapshots, Downloading)
                    | (Downloading, Decompressing)
                    | (Decompressing, Restoring)
                    | (Restoring, Done)
            ),
        }
    }
}

/// `None` restores the newest snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreRequest {
    pub target_snapshot: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub snapshot: Snapshot,
    pub databases: Vec<String>,
    pub skipped_statements: usize,
    pub states: Vec<RestoreState>,
}

/// What the notifier is told about a restore, successful or not.
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub run_id: Uuid,
    pub snapshot: Option<Snapshot>,
    pub databases: Vec<String>,
    pub error_detail: Option<String>,
    pub final_state: RestoreState,
}

/// Picks the snapshot a request refers to from a listing.
pub fn select_target(
    request: &RestoreRequest,
    snapshots: &[Snapshot],
    location: &str,
) -> Result<Snapshot> {
    match &request.target_snapshot {
        Some(name) => find_by_name(snapshots, name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(name.clone())),
        None => latest(snapshots)
            .cloned()
            .ok_or_else(|| AppError::NoSnapshotsAvailable(location.to_string())),
    }
}

pub async fn resolve_target(request: &RestoreRequest, store: &dyn SnapshotStore) -> Result<Snapshot> {
    let snapshots = store.list().await?;
    select_target(request, &snapshots, &store.describe())
}

/// The database a restore replays into.
#[async_trait]
pub trait ReplayTarget: Send + Sync {
    /// Connectivity check before anything is downloaded.
    async fn check(&self) -> Result<()>;

    async fn replay(&self, sql: &Path, snapshot_name: &str) -> Result<()>;

    /// Fails when a database named in the artifact is missing after replay.
    async fn verify(&self, snapshot_name: &str, databases: &[String]) -> Result<()>;
}

pub struct PsqlTarget {
    pub db: DatabaseConfig,
}

#[async_trait]
impl ReplayTarget for PsqlTarget {
    async fn check(&self) -> Result<()> {
        check_db_connection(&self.db).await
    }

    async fn replay(&self, sql: &Path, snapshot_name: &str) -> Result<()> {
        db_restore::execute_sql_file_with_psql(&self.db, sql, snapshot_name).await
    }

    async fn verify(&self, snapshot_name: &str, databases: &[String]) -> Result<()> {
        verification::verify_restore(&self.db, snapshot_name, databases).await
    }
}

/// Entry point for `pgvault restore`. An explicit `--snapshot` wins over the
/// configured `restore_snapshot`.
pub async fn run_restore_flow(
    app_config: &AppConfig,
    snapshot: Option<String>,
) -> Result<RestoreReport> {
    let request = RestoreRequest {
        target_snapshot: snapshot.or_else(|| app_config.restore_snapshot.clone()),
    };
    let store = open_store(app_config).await?;
    let notifier = build_notifier(app_config.webhook_url.as_deref(), app_config.timeouts.webhook);
    let target = PsqlTarget {
        db: app_config.database.clone(),
    };
    let table_filter = TableFilter::new(&app_config.excluded_tables);

    let ctx = RestoreContext {
        store: store.as_ref(),
        target: &target,
        notifier: notifier.as_ref(),
        staging_dir: &app_config.staging_dir,
        table_filter: &table_filter,
        timeouts: &app_config.timeouts,
    };
    perform_restore(&ctx, &request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::snapshot_at;
    use crate::storage::memory::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn day(d: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, d, 2, 0, 0).unwrap()
    }

    #[test]
    fn test_default_request_picks_newest() {
        let snapshots = vec![snapshot_at("db", day(3)), snapshot_at("db", day(9)), snapshot_at("db", day(1))];
        let picked = select_target(&RestoreRequest::default(), &snapshots, "mem").unwrap();
        assert_eq!(picked.created_at, day(9));
    }

    #[test]
    fn test_named_request_is_exact() {
        let snapshots = vec![snapshot_at("db", day(3)), snapshot_at("db", day(9))];
        let request = RestoreRequest {
            target_snapshot: Some(snapshots[0].name.clone()),
        };
        assert_eq!(select_target(&request, &snapshots, "mem").unwrap(), snapshots[0]);

        let request = RestoreRequest {
            target_snapshot: Some("db_20250303".to_string()),
        };
        assert!(matches!(
            select_target(&request, &snapshots, "mem"),
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_on_empty_store() {
        let store = MemoryStore::default();
        let err = resolve_target(&RestoreRequest::default(), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoSnapshotsAvailable(ref loc) if loc == "memory://test"));
    }

    #[test]
    fn test_failed_reachable_only_while_running() {
        use RestoreState::*;
        assert!(!Idle.can_transition_to(Failed));
        assert!(Restoring.can_transition_to(Failed));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Done.can_transition_to(Idle));
        assert!(!Decompressing.can_transition_to(Downloading));
    }
}
