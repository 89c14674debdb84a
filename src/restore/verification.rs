// pgvault/src/restore/verification.rs
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use crate::utils::connection::existing_databases;

/// Names from `expected` that are absent from `found`, in `expected` order.
pub fn missing_databases(expected: &[String], found: &[String]) -> Vec<String> {
    expected
        .iter()
        .filter(|db| !found.contains(db))
        .cloned()
        .collect()
}

/// Checks that every database the artifact switched to exists after replay.
pub async fn verify_restore(
    db: &DatabaseConfig,
    snapshot_name: &str,
    expected: &[String],
) -> Result<()> {
    let found = existing_databases(db, expected).await?;
    let missing = missing_databases(expected, &found);
    if !missing.is_empty() {
        warn!("Databases missing after replay of {}: {:?}", snapshot_name, missing);
        return Err(AppError::corrupt(
            snapshot_name,
            format!("databases missing after replay: {}", missing.join(", ")),
        ));
    }
    info!("✓ Restore verification passed for {} databases", expected.len());
    Ok(())
}
