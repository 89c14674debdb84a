// pgvault/src/utils/connection.rs
use sqlx::{Connection, PgConnection, Row};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens a connection to the maintenance database, failing fast with a
/// `Connection` or `Auth` error.
pub async fn connect_maintenance(db: &DatabaseConfig) -> Result<PgConnection> {
    let url = db.maintenance_url()?;
    match timeout(CONNECT_TIMEOUT, PgConnection::connect(&url)).await {
        Ok(conn) => Ok(conn?),
        Err(_) => Err(AppError::connection(
            db.redacted(),
            format!("no response within {}s", CONNECT_TIMEOUT.as_secs()),
        )),
    }
}

pub async fn check_db_connection(db: &DatabaseConfig) -> Result<()> {
    let mut conn = connect_maintenance(db).await?;
    sqlx::query("SELECT 1").execute(&mut conn).await?;
    let _ = conn.close().await;
    info!("✅ Successfully connected to {}", db.redacted());
    Ok(())
}

/// Every database that accepts connections and is not a template.
pub async fn list_databases(db: &DatabaseConfig) -> Result<Vec<String>> {
    let mut conn = connect_maintenance(db).await?;
    let rows = sqlx::query(
        "SELECT datname FROM pg_database WHERE datistemplate = false AND datallowconn = true ORDER BY datname",
    )
    .fetch_all(&mut conn)
    .await?;
    let _ = conn.close().await;

    let names = rows
        .iter()
        .map(|row| row.try_get::<String, _>("datname"))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    debug!("Found databases: {:?}", names);
    Ok(names)
}

/// Which of `names` exist on the server.
pub async fn existing_databases(db: &DatabaseConfig, names: &[String]) -> Result<Vec<String>> {
    let mut conn = connect_maintenance(db).await?;
    let found: Vec<String> =
        sqlx::query_scalar("SELECT datname FROM pg_database WHERE datname = ANY($1)")
            .bind(names)
            .fetch_all(&mut conn)
            .await?;
    let _ = conn.close().await;
    Ok(found)
}
