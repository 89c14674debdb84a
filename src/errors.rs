use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database or object storage could not be reached.
    #[error("Connection error ({target}): {detail}")]
    Connection { target: String, detail: String },

    /// Credentials were rejected by the database or object storage.
    #[error("Authentication error ({target}): {detail}")]
    Auth { target: String, detail: String },

    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("No snapshots available in {0}")]
    NoSnapshotsAvailable(String),

    /// Decompression or replay of an artifact failed.
    #[error("Corrupt artifact {name}: {detail}")]
    CorruptArtifact { name: String, detail: String },

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("{stage} timed out after {}s", .after.as_secs())]
    Timeout { stage: String, after: Duration },

    #[error("Command `{program}` failed with status {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Invalid restore state transition: {from} -> {to}")]
    InvalidState { from: String, to: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Every kind except a lost notification ends the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AppError::Notification(_))
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Config(_) => 2,
            err if !err.is_fatal() => 0,
            _ => 1,
        }
    }

    pub fn connection(target: impl Into<String>, detail: impl ToString) -> Self {
        AppError::Connection {
            target: target.into(),
            detail: detail.to_string(),
        }
    }

    pub fn corrupt(name: impl Into<String>, detail: impl ToString) -> Self {
        AppError::CorruptArtifact {
            name: name.into(),
            detail: detail.to_string(),
        }
    }
}

/// Maps a sqlx failure onto the connection/auth split. SQLSTATE class 28 is
/// "invalid authorization specification".
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().is_some_and(|code| code.starts_with("28")) {
                return AppError::Auth {
                    target: "database".to_string(),
                    detail: db_err.message().to_string(),
                };
            }
        }
        AppError::connection("database", err)
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_errors_are_not_fatal() {
        assert!(!AppError::Notification("webhook down".into()).is_fatal());
        assert!(AppError::NotFound("x".into()).is_fatal());
        assert!(AppError::corrupt("a.sql.gz", "bad gzip header").is_fatal());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(AppError::Config("missing bucket".into()).exit_code(), 2);
        assert_eq!(AppError::connection("s3", "refused").exit_code(), 1);
        assert_eq!(AppError::Notification("503".into()).exit_code(), 0);
        assert_eq!(
            AppError::Timeout {
                stage: "dump".into(),
                after: Duration::from_secs(5)
            }
            .exit_code(),
            1
        );
    }

    #[test]
    fn test_pool_timeout_is_connection_error() {
        let err: AppError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, AppError::Connection { .. }));
    }
}
