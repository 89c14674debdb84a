pub mod connection;
pub mod sql_filter;

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use which::which;

use crate::errors::{AppError, Result};

/// Finds a PostgreSQL client executable (`pg_dump`, `psql`) in the system PATH.
/// A missing tool fails the run, not the configuration.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|e| AppError::Command {
        program: name.to_string(),
        status: "not found in PATH".to_string(),
        stderr: format!(
            "{}. Please ensure PostgreSQL client tools are installed and in your PATH.",
            e
        ),
    })
}

/// Bounds a stage; an elapsed timer becomes `AppError::Timeout`.
pub async fn with_timeout<T, F>(stage: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout {
            stage: stage.to_string(),
            after: limit,
        }),
    }
}

/// Last lines of a command's stderr, enough to explain a failure.
pub fn stderr_tail(stderr: &[u8], max_lines: usize) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
