// pgvault/src/restore/logic.rs
use std::path::{Path, PathBuf};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use super::db_restore::prepare_sql_blocking;
use super::{ReplayTarget, RestoreOutcome, RestoreReport, RestoreRequest, RestoreState, resolve_target};
use crate::config::Timeouts;
use crate::errors::{AppError, Result};
use crate::notify::{Notifier, notify_restore};
use crate::snapshot::{Snapshot, human_size};
use crate::storage::SnapshotStore;
use crate::utils::sql_filter::TableFilter;
use crate::utils::with_timeout;

/// Tracks the current state and every state entered, rejecting illegal moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreMachine {
    state: RestoreState,
    history: Vec<RestoreState>,
}

impl Default for RestoreMachine {
    fn default() -> Self {
        RestoreMachine {
            state: RestoreState::Idle,
            history: vec![RestoreState::Idle],
        }
    }
}

impl RestoreMachine {
    pub fn state(&self) -> RestoreState {
        self.state
    }

    pub fn history(&self) -> &[RestoreState] {
        &self.history
    }

    pub fn advance(&mut self, next: RestoreState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::InvalidState {
                from: format!("{:?}", self.state),
                to: format!("{:?}", next),
            });
        }
        info!("Restore state: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Moves to `Failed` when that is still reachable.
    pub fn fail(&mut self) {
        if self.state.can_transition_to(RestoreState::Failed) {
            self.state = RestoreState::Failed;
            self.history.push(RestoreState::Failed);
        }
    }
}

pub struct RestoreContext<'a> {
    pub store: &'a dyn SnapshotStore,
    pub target: &'a dyn ReplayTarget,
    pub notifier: &'a dyn Notifier,
    pub staging_dir: &'a Path,
    pub table_filter: &'a TableFilter,
    pub timeouts: &'a Timeouts,
}

struct RestoreSession {
    run_id: Uuid,
    machine: RestoreMachine,
    snapshot: Option<Snapshot>,
    databases: Vec<String>,
    download: Option<PathBuf>,
}

/// Runs one restore: resolve, download, decompress, replay, verify. The
/// outcome is reported to the notifier whether or not it succeeded.
pub async fn perform_restore(
    ctx: &RestoreContext<'_>,
    request: &RestoreRequest,
) -> Result<RestoreReport> {
    let mut session = RestoreSession {
        run_id: Uuid::new_v4(),
        machine: RestoreMachine::default(),
        snapshot: None,
        databases: Vec::new(),
        download: None,
    };
    let span = info_span!("restore", run_id = %session.run_id);

    async move {
        let result = execute(ctx, request, &mut session).await;
        if let Some(path) = session.download.take() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Could not remove downloaded artifact {}: {}", path.display(), e);
            }
        }
        if let Err(e) = &result {
            error!("❌ Restore failed in {:?}: {}", session.machine.state(), e);
            session.machine.fail();
        }

        let outcome = RestoreOutcome {
            run_id: session.run_id,
            snapshot: session.snapshot.clone(),
            databases: session.databases.clone(),
            error_detail: result.as_ref().err().map(|e| e.to_string()),
            final_state: session.machine.state(),
        };
        notify_restore(ctx.notifier, &outcome).await;
        result
    }
    .instrument(span)
    .await
}

async fn execute(
    ctx: &RestoreContext<'_>,
    request: &RestoreRequest,
    session: &mut RestoreSession,
) -> Result<RestoreReport> {
    session.machine.advance(RestoreState::ListingSnapshots)?;
    let snapshot = with_timeout(
        "snapshot listing",
        ctx.timeouts.transfer,
        resolve_target(request, ctx.store),
    )
    .await?;
    info!(
        "Restoring snapshot {} ({}, created {})",
        snapshot.name,
        human_size(snapshot.size_bytes),
        snapshot.created_at
    );
    session.snapshot = Some(snapshot.clone());
    ctx.target.check().await?;

    session.machine.advance(RestoreState::Downloading)?;
    tokio::fs::create_dir_all(ctx.staging_dir).await?;
    let download = ctx.staging_dir.join(format!("{}.download", snapshot.name));
    session.download = Some(download.clone());
    let bytes = with_timeout(
        "download",
        ctx.timeouts.transfer,
        ctx.store.fetch(&snapshot, &download),
    )
    .await?;
    info!("✓ Downloaded {} ({})", snapshot.name, human_size(bytes));

    session.machine.advance(RestoreState::Decompressing)?;
    let prepared = with_timeout(
        "decompression",
        ctx.timeouts.replay,
        prepare_sql_blocking(
            download,
            snapshot.name.clone(),
            ctx.staging_dir.to_path_buf(),
            ctx.table_filter.clone(),
        ),
    )
    .await?;
    session.databases = prepared.stats.databases.clone();
    if prepared.stats.skipped_statements > 0 {
        info!(
            "Left out {} statements touching excluded tables",
            prepared.stats.skipped_statements
        );
    }

    session.machine.advance(RestoreState::Restoring)?;
    with_timeout(
        "replay",
        ctx.timeouts.replay,
        ctx.target.replay(prepared.path(), &snapshot.name),
    )
    .await?;
    ctx.target
        .verify(&snapshot.name, &prepared.stats.databases)
        .await?;

    session.machine.advance(RestoreState::Done)?;
    info!("🎉 Restore of {} completed", snapshot.name);
    Ok(RestoreReport {
        snapshot,
        databases: prepared.stats.databases.clone(),
        skipped_statements: prepared.stats.skipped_statements,
        states: session.machine.history().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::{create_staged_artifact, finish_artifact};
    use crate::backup::db_dump::database_header;
    use crate::notify::{DisabledNotifier, MockNotifier};
    use crate::snapshot::snapshot_at;
    use crate::storage::memory::MemoryStore;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use RestoreState::*;

    #[derive(Default)]
    struct RecordingTarget {
        checks: Mutex<usize>,
        replayed: Mutex<Vec<String>>,
        verified: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReplayTarget for RecordingTarget {
        async fn check(&self) -> Result<()> {
            *self.checks.lock().unwrap() += 1;
            Ok(())
        }

        async fn replay(&self, sql: &Path, _snapshot_name: &str) -> Result<()> {
            let text = std::fs::read_to_string(sql)?;
            self.replayed.lock().unwrap().push(text);
            Ok(())
        }

        async fn verify(&self, _snapshot_name: &str, databases: &[String]) -> Result<()> {
            self.verified.lock().unwrap().extend_from_slice(databases);
            Ok(())
        }
    }

    fn gz_body(dir: &Path, sql: &str) -> Vec<u8> {
        let mut writer = create_staged_artifact(dir).unwrap();
        writer.write_all(sql.as_bytes()).unwrap();
        let path = finish_artifact(writer, &dir.join("body.sql.gz")).unwrap();
        std::fs::read(path).unwrap()
    }

    struct Fixture {
        staging: TempDir,
        store: MemoryStore,
        target: RecordingTarget,
        filter: TableFilter,
        timeouts: Timeouts,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                staging: tempfile::tempdir().unwrap(),
                store: MemoryStore::default(),
                target: RecordingTarget::default(),
                filter: TableFilter::default(),
                timeouts: Timeouts::default(),
            }
        }

        fn ctx<'a>(&'a self, notifier: &'a dyn Notifier) -> RestoreContext<'a> {
            RestoreContext {
                store: &self.store,
                target: &self.target,
                notifier,
                staging_dir: self.staging.path(),
                table_filter: &self.filter,
                timeouts: &self.timeouts,
            }
        }
    }

    #[test]
    fn test_machine_walks_the_happy_path() {
        let mut machine = RestoreMachine::default();
        for next in [ListingSnapshots, Downloading, Decompressing, Restoring, Done] {
            machine.advance(next).unwrap();
        }
        assert_eq!(machine.state(), Done);
        assert_eq!(machine.history().len(), 6);
    }

    #[test]
    fn test_machine_rejects_skipped_and_terminal_moves() {
        let mut machine = RestoreMachine::default();
        let err = machine.advance(Downloading).unwrap_err();
        assert!(matches!(err, AppError::InvalidState { .. }));
        assert_eq!(machine.state(), Idle);

        machine.fail();
        assert_eq!(machine.state(), Idle, "Idle cannot fail");

        machine.advance(ListingSnapshots).unwrap();
        machine.fail();
        assert_eq!(machine.state(), Failed);
        assert!(machine.advance(Downloading).is_err());
        assert!(machine.advance(Done).is_err());
    }

    #[tokio::test]
    async fn test_restores_newest_snapshot_by_default() {
        let fx = Fixture::new();
        let now = Utc::now();
        let older = snapshot_at("db", now - Duration::days(2));
        let newest = snapshot_at("db", now - Duration::hours(1));
        fx.store.insert(older, b"garbage".to_vec());
        let sql = format!("{}SELECT 1;\n", database_header("app"));
        fx.store
            .insert(newest.clone(), gz_body(fx.staging.path(), &sql));

        let report = perform_restore(&fx.ctx(&DisabledNotifier), &RestoreRequest::default())
            .await
            .unwrap();

        assert_eq!(report.snapshot.name, newest.name);
        assert_eq!(report.databases, vec!["app".to_string()]);
        assert_eq!(
            report.states,
            vec![Idle, ListingSnapshots, Downloading, Decompressing, Restoring, Done]
        );
        assert_eq!(*fx.target.replayed.lock().unwrap(), vec![sql]);
        assert_eq!(*fx.target.verified.lock().unwrap(), vec!["app".to_string()]);
        assert_eq!(*fx.store.fetches.lock().unwrap(), vec![newest.name.clone()]);
        assert!(!fx.staging.path().join(format!("{}.download", newest.name)).exists());
    }

    #[tokio::test]
    async fn test_empty_store_has_no_snapshots_available() {
        let fx = Fixture::new();
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send()
            .withf(|n| n.field_value("Final state") == Some("Failed"))
            .times(1)
            .returning(|_| Ok(()));

        let err = perform_restore(&fx.ctx(&notifier), &RestoreRequest::default())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::NoSnapshotsAvailable(_)), "{err}");
        assert_eq!(*fx.target.checks.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_name_is_not_found_without_touching_database() {
        let fx = Fixture::new();
        fx.store.insert(snapshot_at("db", Utc::now()), Vec::new());
        let request = RestoreRequest {
            target_snapshot: Some("db_19990101_000000.sql.gz".to_string()),
        };

        let err = perform_restore(&fx.ctx(&DisabledNotifier), &request)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::NotFound(ref n) if n == "db_19990101_000000.sql.gz"));
        assert!(fx.store.fetches.lock().unwrap().is_empty());
        assert_eq!(*fx.target.checks.lock().unwrap(), 0);
        assert!(fx.target.replayed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_artifact_fails_before_replay() {
        let fx = Fixture::new();
        let snap = snapshot_at("db", Utc::now());
        fx.store.insert(snap.clone(), b"definitely not gzip".to_vec());
        let request = RestoreRequest {
            target_snapshot: Some(snap.name.clone()),
        };

        let err = perform_restore(&fx.ctx(&DisabledNotifier), &request)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::CorruptArtifact { .. }), "{err}");
        assert!(fx.target.replayed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_fail_restore() {
        let fx = Fixture::new();
        let snap = snapshot_at("db", Utc::now());
        let sql = format!("{}SELECT 1;\n", database_header("app"));
        fx.store.insert(snap, gz_body(fx.staging.path(), &sql));
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send()
            .times(1)
            .returning(|_| Err(AppError::Notification("webhook down".into())));

        let report = perform_restore(&fx.ctx(&notifier), &RestoreRequest::default()).await;
        assert!(report.is_ok());
    }
}
