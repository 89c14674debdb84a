// pgvault/src/backup/retention.rs
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::config::RetentionPolicy;
use crate::errors::Result;
use crate::snapshot::Snapshot;
use crate::storage::SnapshotStore;

/// Snapshots the sweep would delete, oldest first.
///
/// A snapshot is expired when its age is at least `retention_days`. With
/// `keep_latest`, the newest snapshot survives even when expired, so a job
/// that has been failing for longer than the window never sweeps the bucket
/// empty.
pub fn plan_retention(
    snapshots: &[Snapshot],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<Snapshot> {
    let cutoff = now - Duration::days(i64::from(policy.retention_days));
    let mut sorted = snapshots.to_vec();
    sorted.sort();

    let protected = if policy.keep_latest {
        sorted.last().cloned()
    } else {
        None
    };

    sorted
        .into_iter()
        .filter(|s| s.created_at <= cutoff)
        .filter(|s| protected.as_ref() != Some(s))
        .collect()
}

/// Deletes expired snapshots and returns how many were removed.
pub async fn enforce_retention(
    store: &dyn SnapshotStore,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<usize> {
    let snapshots = store.list().await?;
    let expired = plan_retention(&snapshots, policy, now);
    if expired.is_empty() {
        info!(
            "Retention: nothing older than {} days among {} snapshots",
            policy.retention_days,
            snapshots.len()
        );
        return Ok(0);
    }

    if policy.keep_latest && expired.len() + 1 == snapshots.len() {
        warn!("Retention: every snapshot but the newest is expired; keeping the newest");
    }

    for snapshot in &expired {
        info!("Retention: deleting {} ({})", snapshot.name, snapshot.created_at);
        store.delete(snapshot).await?;
    }
    Ok(expired.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::snapshot_at;
    use crate::storage::memory::MemoryStore;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, d, 2, 0, 0).unwrap()
    }

    fn policy(days: u32, keep_latest: bool) -> RetentionPolicy {
        RetentionPolicy {
            retention_days: days,
            keep_latest,
        }
    }

    #[test]
    fn test_day_scenario_deletes_day_one_and_three() {
        let snaps: Vec<_> = [1, 3, 7, 10].iter().map(|d| snapshot_at("db", day(*d))).collect();
        let expired = plan_retention(&snaps, &policy(7, true), day(10));
        let days: Vec<_> = expired.iter().map(|s| s.created_at).collect();
        assert_eq!(days, vec![day(1), day(3)]);
    }

    #[test]
    fn test_never_deletes_newest_even_when_expired() {
        let snaps: Vec<_> = [1, 2, 3].iter().map(|d| snapshot_at("db", day(*d))).collect();
        let expired = plan_retention(&snaps, &policy(1, true), day(30));
        assert_eq!(expired.len(), 2);
        assert!(!expired.contains(&snapshot_at("db", day(3))));

        let single = vec![snapshot_at("db", day(1))];
        assert!(plan_retention(&single, &policy(1, true), day(30)).is_empty());
    }

    #[test]
    fn test_keep_latest_can_be_disabled() {
        let snaps: Vec<_> = [1, 2].iter().map(|d| snapshot_at("db", day(*d))).collect();
        assert_eq!(plan_retention(&snaps, &policy(1, false), day(30)).len(), 2);
    }

    #[test]
    fn test_plan_is_order_independent() {
        let mut snaps: Vec<_> = [9, 1, 5, 3].iter().map(|d| snapshot_at("db", day(*d))).collect();
        let a = plan_retention(&snaps, &policy(5, true), day(10));
        snaps.reverse();
        let b = plan_retention(&snaps, &policy(5, true), day(10));
        assert_eq!(a, b);
        assert_eq!(a.iter().map(|s| s.created_at).collect::<Vec<_>>(), vec![day(1), day(3), day(5)]);
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let snaps: Vec<_> = [1, 3, 7, 10].iter().map(|d| snapshot_at("db", day(*d))).collect();
        let store = MemoryStore::with(snaps);

        let first = enforce_retention(&store, &policy(7, true), day(10)).await.unwrap();
        let survivors = store.names();
        let second = enforce_retention(&store, &policy(7, true), day(10)).await.unwrap();

        assert_eq!(first, 2);
        assert_eq!(second, 0);
        assert_eq!(store.names(), survivors);
        assert_eq!(survivors.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_on_empty_store() {
        let store = MemoryStore::default();
        assert_eq!(enforce_retention(&store, &policy(7, true), day(10)).await.unwrap(), 0);
    }
}
