// pgvault/src/backup/db_dump.rs
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::archive::{ArtifactWriter, create_staged_artifact, finish_artifact};
use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::snapshot::snapshot_name;
use crate::utils::connection::{check_db_connection, list_databases};
use crate::utils::sql_filter::{FilterScope, FilterStats, SqlStreamFilter, TableFilter};
use crate::utils::{find_executable, stderr_tail};

/// A finished, compressed dump waiting in the staging directory.
#[derive(Debug, Clone)]
pub struct DumpArtifact {
    pub path: PathBuf,
    pub name: String,
    pub databases: Vec<String>,
    pub size_bytes: u64,
    pub excluded_rows: usize,
}

/// Explicitly configured databases win; otherwise every listed database except
/// templates and the configured exclusions.
pub fn select_databases(
    configured: Option<&[String]>,
    available: &[String],
    excluded: &[String],
) -> Vec<String> {
    let candidates: Vec<String> = match configured {
        Some(dbs) => dbs.to_vec(),
        None => available
            .iter()
            .filter(|db| !excluded.contains(db))
            .cloned()
            .collect(),
    };
    candidates
        .into_iter()
        .filter(|db| !db.starts_with("template"))
        .collect()
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Creates the database on replay if missing and switches psql to it.
pub fn database_header(db_name: &str) -> String {
    let create = format!("CREATE DATABASE {}", quote_ident(db_name));
    format!(
        "--\n-- pgvault database: {db}\n--\nSELECT {create} WHERE NOT EXISTS (SELECT FROM pg_database WHERE datname = {lit})\\gexec\n\\connect {ident}\n\n",
        db = db_name,
        create = quote_literal(&create),
        lit = quote_literal(db_name),
        ident = quote_ident(db_name),
    )
}

/// Dumps every selected database into one gzip artifact named
/// `<prefix>_<YYYYMMDD_HHMMSS>.sql.gz`.
pub async fn create_dump(app_config: &AppConfig, started_at: DateTime<Utc>) -> Result<DumpArtifact> {
    let db = &app_config.database;
    info!("Starting pg_dump based dump of {}", db.redacted());

    // Fail before anything is written to the staging volume.
    check_db_connection(db).await?;
    let pg_dump_path = find_executable("pg_dump")?;
    debug!("Found pg_dump executable at: {}", pg_dump_path.display());

    let available = match &app_config.databases {
        Some(_) => Vec::new(),
        None => list_databases(db).await?,
    };
    let databases = select_databases(
        app_config.databases.as_deref(),
        &available,
        &app_config.excluded_databases,
    );
    if databases.is_empty() {
        return Err(AppError::Config(
            "No databases found or specified to back up.".to_string(),
        ));
    }
    info!("Databases to be backed up: {:?}", databases);

    let table_filter = TableFilter::new(&app_config.excluded_tables);
    let mut writer = create_staged_artifact(&app_config.staging_dir)?;
    let mut excluded_rows = 0;

    for db_name in &databases {
        writer.write_all(database_header(db_name).as_bytes())?;
        let url = db.url_for(db_name)?;
        let (returned, skipped) =
            dump_database(&pg_dump_path, db_name, &url, &table_filter, writer).await?;
        writer = returned;
        excluded_rows += skipped;
        info!("✓ Dumped {}", db_name);
    }

    let name = snapshot_name(&app_config.backup_prefix, started_at);
    let dest = app_config.staging_dir.join(&name);
    let path = tokio::task::spawn_blocking(move || finish_artifact(writer, &dest))
        .await
        .map_err(|e| AppError::Io(std::io::Error::other(e)))??;
    let size_bytes = std::fs::metadata(&path)?.len();

    Ok(DumpArtifact {
        path,
        name,
        databases,
        size_bytes,
        excluded_rows,
    })
}

const BATCH_BYTES: usize = 64 * 1024;

/// Filtering and gzip for one database, run on the blocking pool. Batches of
/// whole lines arrive over `lines`; the writer comes back when the channel
/// closes.
struct ArtifactSink {
    lines: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<std::io::Result<(ArtifactWriter, FilterStats)>>,
}

impl ArtifactSink {
    fn spawn(mut writer: ArtifactWriter, table_filter: TableFilter) -> Self {
        let (lines, mut rx) = mpsc::channel::<Vec<u8>>(8);
        let task = tokio::task::spawn_blocking(move || {
            let mut filter = SqlStreamFilter::new(&table_filter, FilterScope::DataOnly);
            while let Some(batch) = rx.blocking_recv() {
                for line in batch.split_inclusive(|b| *b == b'\n') {
                    filter.push_line(line, &mut writer)?;
                }
            }
            let stats = filter.finish(&mut writer)?;
            Ok((writer, stats))
        });
        ArtifactSink { lines, task }
    }

    /// `false` once the blocking side has stopped; `finish` returns its error.
    async fn send(&self, batch: Vec<u8>) -> bool {
        self.lines.send(batch).await.is_ok()
    }

    async fn finish(self) -> Result<(ArtifactWriter, FilterStats)> {
        drop(self.lines);
        let (writer, stats) = self
            .task
            .await
            .map_err(|e| AppError::Io(std::io::Error::other(e)))??;
        Ok((writer, stats))
    }
}

/// Streams one `pg_dump` through the data filter into `writer`. Returns the
/// writer and the number of rows dropped for excluded tables.
async fn dump_database(
    pg_dump_path: &Path,
    db_name: &str,
    db_url: &str,
    table_filter: &TableFilter,
    writer: ArtifactWriter,
) -> Result<(ArtifactWriter, usize)> {
    let mut child = Command::new(pg_dump_path)
        .arg("--clean")
        .arg("--if-exists")
        .arg("--no-owner")
        .arg("--no-privileges")
        .arg("--dbname")
        .arg(db_url)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Io(std::io::Error::other("pg_dump stdout not captured")))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Io(std::io::Error::other("pg_dump stderr not captured")))?;

    // Drain stderr concurrently so a chatty pg_dump never blocks on a full pipe.
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let sink = ArtifactSink::spawn(writer, table_filter.clone());
    let mut reader = BufReader::new(stdout);
    let mut batch = Vec::with_capacity(BATCH_BYTES);
    loop {
        let read = reader.read_until(b'\n', &mut batch).await?;
        if read > 0 && batch.len() < BATCH_BYTES {
            continue;
        }
        if !batch.is_empty() {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(BATCH_BYTES));
            if !sink.send(full).await {
                break;
            }
        }
        if read == 0 {
            break;
        }
    }
    let (writer, stats) = sink.finish().await?;

    let status = child.wait().await?;
    let stderr = stderr_task.await.unwrap_or_default();
    if !status.success() {
        let detail = stderr_tail(&stderr, 5);
        if detail.contains("password authentication failed") {
            return Err(AppError::Auth {
                target: db_name.to_string(),
                detail,
            });
        }
        return Err(AppError::Command {
            program: format!("pg_dump {}", db_name),
            status: status.to_string(),
            stderr: detail,
        });
    }
    Ok((writer, stats.skipped_rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_all_minus_exclusions() {
        let available = names(&["app", "keycloak", "postgres", "template1"]);
        let selected = select_databases(None, &available, &names(&["postgres"]));
        assert_eq!(selected, names(&["app", "keycloak"]));
    }

    #[test]
    fn test_configured_list_wins() {
        let available = names(&["app", "keycloak"]);
        let configured = names(&["postgres", "template0", "app"]);
        let selected = select_databases(Some(&configured), &available, &names(&["postgres"]));
        assert_eq!(selected, names(&["postgres", "app"]));
    }

    #[tokio::test]
    async fn test_sink_filters_and_compresses_off_the_runtime() {
        use crate::backup::archive::open_artifact;
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let writer = create_staged_artifact(dir.path()).unwrap();
        let sink = ArtifactSink::spawn(writer, TableFilter::new(&["sessions".to_string()]));
        assert!(sink.send(b"COPY public.sessions (token) FROM stdin;\nabc\n".to_vec()).await);
        assert!(sink.send(b"def\n\\.\nCOPY public.orders (id) FROM stdin;\n".to_vec()).await);
        assert!(sink.send(b"1\n\\.\n".to_vec()).await);
        let (writer, stats) = sink.finish().await.unwrap();
        assert_eq!(stats.skipped_rows, 2);

        let path = finish_artifact(writer, &dir.path().join("db_20250101_000000.sql.gz")).unwrap();
        let mut text = String::new();
        open_artifact(&path).unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "COPY public.orders (id) FROM stdin;\n1\n\\.\n");
    }

    #[test]
    fn test_header_escapes_names() {
        let header = database_header("we'ird\"db");
        assert!(header.contains("SELECT 'CREATE DATABASE \"we''ird\"\"db\"' WHERE NOT EXISTS"));
        assert!(header.contains("datname = 'we''ird\"db')\\gexec\n"));
        assert!(header.contains("\\connect \"we'ird\"\"db\"\n"));
    }
}
