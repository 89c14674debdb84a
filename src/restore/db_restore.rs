// pgvault/src/restore/db_restore.rs
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info};

use crate::backup::archive::open_artifact;
use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use crate::utils::sql_filter::{FilterScope, FilterStats, SqlStreamFilter, TableFilter};
use crate::utils::{find_executable, stderr_tail};

/// Decompressed, filtered SQL ready for `psql`. The file is removed on drop.
#[derive(Debug)]
pub struct PreparedSql {
    pub file: NamedTempFile,
    pub stats: FilterStats,
}

impl PreparedSql {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Decompresses `artifact` into a staging file, dropping every statement that
/// touches an excluded table. Sequences are dropped only when an excluded
/// table owns them, which takes a first pass over the artifact to learn.
/// Gzip errors surface as `CorruptArtifact`.
pub fn prepare_sql(
    artifact: &Path,
    snapshot_name: &str,
    staging_dir: &Path,
    table_filter: &TableFilter,
) -> Result<PreparedSql> {
    std::fs::create_dir_all(staging_dir)?;
    let table_filter = if table_filter.is_empty() {
        table_filter.clone()
    } else {
        let owners = filter_artifact(artifact, snapshot_name, table_filter, &mut io::sink())?
            .sequence_owners;
        table_filter.with_sequence_owners(&owners)
    };

    let file = tempfile::Builder::new()
        .prefix(".restore-")
        .suffix(".sql")
        .tempfile_in(staging_dir)?;
    let mut out = BufWriter::new(file.as_file());
    let stats = filter_artifact(artifact, snapshot_name, &table_filter, &mut out)?;
    out.flush()?;
    drop(out);

    if stats.databases.is_empty() {
        return Err(AppError::corrupt(
            snapshot_name,
            "artifact does not switch to any database",
        ));
    }
    debug!(
        "Prepared {} for replay ({} statements filtered)",
        snapshot_name, stats.skipped_statements
    );
    Ok(PreparedSql { file, stats })
}

fn filter_artifact<W: Write>(
    artifact: &Path,
    snapshot_name: &str,
    table_filter: &TableFilter,
    out: &mut W,
) -> Result<FilterStats> {
    let mut reader = open_artifact(artifact)?;
    let mut filter = SqlStreamFilter::new(table_filter, FilterScope::All);
    let mut line = Vec::with_capacity(8 * 1024);
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(|e| AppError::corrupt(snapshot_name, format!("decompression failed: {}", e)))?;
        if read == 0 {
            break;
        }
        filter.push_line(&line, out)?;
    }
    Ok(filter.finish(out)?)
}

/// `prepare_sql` on the blocking pool; decompression is CPU and file bound.
pub async fn prepare_sql_blocking(
    artifact: PathBuf,
    snapshot_name: String,
    staging_dir: PathBuf,
    table_filter: TableFilter,
) -> Result<PreparedSql> {
    tokio::task::spawn_blocking(move || {
        prepare_sql(&artifact, &snapshot_name, &staging_dir, &table_filter)
    })
    .await
    .map_err(|e| AppError::Io(std::io::Error::other(e)))?
}

/// Replays a prepared SQL file with `psql` against the maintenance database.
/// The artifact's own `\connect` lines move the session to each database.
pub async fn execute_sql_file_with_psql(
    db: &DatabaseConfig,
    sql_file_path: &Path,
    snapshot_name: &str,
) -> Result<()> {
    let psql_path = find_executable("psql")?;
    info!(
        "Replaying {} with psql against {}",
        snapshot_name,
        db.redacted()
    );

    let mut command = Command::new(psql_path);
    command
        .arg("-X")
        .arg("-q")
        .arg("-v")
        .arg("ON_ERROR_STOP=1")
        .arg("-h")
        .arg(&db.host)
        .arg("-p")
        .arg(db.port.to_string())
        .arg("-U")
        .arg(&db.user)
        .arg("-d")
        .arg(&db.maintenance_db)
        .arg("-f")
        .arg(sql_file_path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !db.password.is_empty() {
        command.env("PGPASSWORD", &db.password);
    }

    let output = command.output().await?;
    if !output.status.success() {
        let detail = stderr_tail(&output.stderr, 5);
        if detail.contains("password authentication failed") {
            return Err(AppError::Auth {
                target: db.redacted(),
                detail,
            });
        }
        if detail.contains("could not connect") || detail.contains("Connection refused") {
            return Err(AppError::connection(db.redacted(), detail));
        }
        return Err(AppError::corrupt(
            snapshot_name,
            format!("replay failed ({}): {}", output.status, detail),
        ));
    }

    info!("✓ Replayed {}", snapshot_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::{create_staged_artifact, finish_artifact};
    use crate::backup::db_dump::database_header;
    use tempfile::tempdir;

    const APP_DUMP: &str = "SET statement_timeout = 0;\n\
DROP TABLE IF EXISTS public.orders;\n\
DROP TABLE IF EXISTS public.sessions;\n\
CREATE TABLE public.orders (\n    id integer NOT NULL\n);\n\
CREATE TABLE public.sessions (\n    token text\n);\n\
COPY public.orders (id) FROM stdin;\n1\n2\n\\.\n\
COPY public.sessions (token) FROM stdin;\nabc\n\\.\n";

    fn write_artifact(dir: &Path, body: &str) -> PathBuf {
        let mut writer = create_staged_artifact(dir).unwrap();
        writer.write_all(database_header("app").as_bytes()).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
        finish_artifact(writer, &dir.join("db_20250101_000000.sql.gz")).unwrap()
    }

    #[test]
    fn test_round_trip_reproduces_dump() {
        let dir = tempdir().unwrap();
        let artifact = write_artifact(dir.path(), APP_DUMP);

        let prepared =
            prepare_sql(&artifact, "db_20250101_000000.sql.gz", dir.path(), &TableFilter::default())
                .unwrap();

        let text = std::fs::read_to_string(prepared.path()).unwrap();
        assert_eq!(text, format!("{}{}", database_header("app"), APP_DUMP));
        assert_eq!(prepared.stats.databases, vec!["app".to_string()]);
        assert_eq!(prepared.stats.skipped_statements, 0);
    }

    #[test]
    fn test_excluded_table_is_removed_on_restore() {
        let dir = tempdir().unwrap();
        let artifact = write_artifact(dir.path(), APP_DUMP);
        let filter = TableFilter::new(&["sessions".to_string()]);

        let prepared = prepare_sql(&artifact, "snap", dir.path(), &filter).unwrap();
        let text = std::fs::read_to_string(prepared.path()).unwrap();

        assert!(!text.contains("sessions"));
        assert!(text.contains("COPY public.orders (id) FROM stdin;\n1\n2\n\\.\n"));
        assert_eq!(prepared.stats.skipped_statements, 3);
    }

    #[test]
    fn test_sequence_of_kept_table_survives_exclusion() {
        let dir = tempdir().unwrap();
        let body = "CREATE TABLE public.auth_user (\n    id integer NOT NULL\n);\n\
CREATE SEQUENCE public.auth_user_id_seq\n    AS integer\n    CACHE 1;\n\
ALTER SEQUENCE public.auth_user_id_seq OWNED BY public.auth_user.id;\n\
CREATE TABLE public.auth_user_groups (\n    id integer NOT NULL\n);\n\
CREATE SEQUENCE public.auth_user_groups_id_seq\n    AS integer\n    CACHE 1;\n\
ALTER SEQUENCE public.auth_user_groups_id_seq OWNED BY public.auth_user_groups.id;\n\
SELECT pg_catalog.setval('public.auth_user_id_seq', 2, true);\n\
SELECT pg_catalog.setval('public.auth_user_groups_id_seq', 4, true);\n";
        let artifact = write_artifact(dir.path(), body);
        let filter = TableFilter::new(&["auth_user".to_string()]);

        let prepared = prepare_sql(&artifact, "snap", dir.path(), &filter).unwrap();
        let text = std::fs::read_to_string(prepared.path()).unwrap();

        assert!(!text.contains("auth_user_id_seq"), "{text}");
        assert!(text.contains("CREATE SEQUENCE public.auth_user_groups_id_seq"));
        assert!(text.contains("OWNED BY public.auth_user_groups.id;"));
        assert!(text.contains("setval('public.auth_user_groups_id_seq', 4, true)"));
        assert_eq!(prepared.stats.skipped_statements, 4);
    }

    #[test]
    fn test_garbage_is_corrupt_artifact() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("broken.sql.gz");
        std::fs::write(&artifact, b"not a gzip stream").unwrap();

        let err = prepare_sql(&artifact, "broken.sql.gz", dir.path(), &TableFilter::default())
            .unwrap_err();
        assert!(matches!(err, AppError::CorruptArtifact { .. }), "{err}");
    }

    #[test]
    fn test_artifact_without_database_is_corrupt() {
        let dir = tempdir().unwrap();
        let mut writer = create_staged_artifact(dir.path()).unwrap();
        writer.write_all(b"SELECT 1;\n").unwrap();
        let artifact = finish_artifact(writer, &dir.path().join("x.sql.gz")).unwrap();

        let err = prepare_sql(&artifact, "x.sql.gz", dir.path(), &TableFilter::default()).unwrap_err();
        assert!(matches!(err, AppError::CorruptArtifact { .. }));
    }
}
