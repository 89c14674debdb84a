//! Snapshot metadata and the pure queries over snapshot lists.
//!
//! A snapshot name carries its own creation time
//! (`<prefix>_<YYYYMMDD>_<HHMMSS>.sql.gz`), so lexicographic and chronological
//! order coincide and "the latest backup" is always derived by sorting the
//! listing, never stored.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::cmp::Ordering;
use std::sync::OnceLock;

pub const SNAPSHOT_EXTENSION: &str = "sql.gz";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Location of the object in the backing store.
    pub storage_key: String,
}

impl Ord for Snapshot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for Snapshot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Snapshot {
    /// Builds a snapshot from a listing entry. The name's embedded timestamp
    /// wins over `last_modified`; entries with neither cannot be ordered and
    /// yield `None`.
    pub fn from_listing(
        name: &str,
        storage_key: &str,
        size_bytes: u64,
        last_modified: Option<DateTime<Utc>>,
    ) -> Option<Self> {
        let created_at = parse_snapshot_timestamp(name).or(last_modified)?;
        Some(Snapshot {
            name: name.to_string(),
            created_at,
            size_bytes,
            storage_key: storage_key.to_string(),
        })
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<prefix>.+)_(?P<ts>\d{8}_\d{6})\.(?P<ext>[A-Za-z0-9.]+)$")
            .expect("snapshot name pattern is valid")
    })
}

pub fn snapshot_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}_{}.{}",
        prefix,
        at.format(TIMESTAMP_FORMAT),
        SNAPSHOT_EXTENSION
    )
}

pub fn parse_snapshot_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let caps = name_pattern().captures(name)?;
    NaiveDateTime::parse_from_str(&caps["ts"], TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Whether `name` belongs to the snapshot family `prefix`.
pub fn matches_prefix(name: &str, prefix: &str) -> bool {
    name_pattern()
        .captures(name)
        .is_some_and(|caps| &caps["prefix"] == prefix)
}

/// Newest snapshot by `created_at`.
pub fn latest(snapshots: &[Snapshot]) -> Option<&Snapshot> {
    snapshots.iter().max()
}

pub fn find_by_name<'a>(snapshots: &'a [Snapshot], name: &str) -> Option<&'a Snapshot> {
    snapshots.iter().find(|s| s.name == name)
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
pub(crate) fn snapshot_at(prefix: &str, at: DateTime<Utc>) -> Snapshot {
    let name = snapshot_name(prefix, at);
    Snapshot {
        storage_key: format!("backups/{}", name),
        name,
        created_at: at,
        size_bytes: 1024,
    }
}
