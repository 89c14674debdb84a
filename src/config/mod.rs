// pgvault/src/config/mod.rs
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use percent_encoding::percent_decode_str;
use std::time::Duration;
use url::Url;

use crate::errors::{AppError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
const DEFAULT_STAGING_DIR: &str = "./staging";
const DEFAULT_BACKUP_PREFIX: &str = "postgres_backup";
const DEFAULT_RETENTION_DAYS: u32 = 7;
const DEFAULT_PG_PORT: u16 = 5432;
const DEFAULT_S3_REGION: &str = "us-east-1";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonDatabaseConfig {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub maintenance_db: Option<String>,
}

/// Stage timeouts in seconds.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonTimeouts {
    pub dump_secs: Option<u64>,
    pub transfer_secs: Option<u64>,
    pub replay_secs: Option<u64>,
    pub webhook_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub database: Option<JsonDatabaseConfig>,
    pub databases: Option<Vec<String>>,
    pub excluded_databases: Option<Vec<String>>,
    pub excluded_tables: Option<Vec<String>>,
    pub staging_dir: Option<PathBuf>,
    pub local_backup_dir: Option<PathBuf>,
    pub backup_prefix: Option<String>,
    pub retention_days: Option<u32>,
    pub keep_latest: Option<bool>,
    pub keep_local_artifact: Option<bool>,
    pub webhook_url: Option<String>,
    pub restore_snapshot: Option<String>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub timeouts: Option<JsonTimeouts>,
}

impl RawJsonConfig {
    /// Overlays environment variables on top of the file values. `lookup`
    /// is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let db = self.database.get_or_insert_with(Default::default);
        if let Some(url) = get("DATABASE_URL") {
            db.url = Some(url);
        }
        if let Some(host) = get("PGHOST") {
            db.host = Some(host);
        }
        if let Some(port) = get("PGPORT") {
            db.port = Some(parse_env("PGPORT", &port)?);
        }
        if let Some(user) = get("PGUSER") {
            db.user = Some(user);
        }
        if let Some(password) = get("PGPASSWORD") {
            db.password = Some(password);
        }

        let s3_keys = [
            "S3_BUCKET",
            "S3_REGION",
            "S3_ACCESS_KEY",
            "S3_SECRET_KEY",
            "S3_ENDPOINT",
            "S3_PREFIX",
        ];
        if s3_keys.iter().any(|k| get(k).is_some()) {
            let s3 = self.s3_storage.get_or_insert_with(Default::default);
            if let Some(v) = get("S3_BUCKET") {
                s3.bucket_name = Some(v);
            }
            if let Some(v) = get("S3_REGION") {
                s3.region = Some(v);
            }
            if let Some(v) = get("S3_ACCESS_KEY") {
                s3.access_key_id = Some(v);
            }
            if let Some(v) = get("S3_SECRET_KEY") {
                s3.secret_access_key = Some(v);
            }
            if let Some(v) = get("S3_ENDPOINT") {
                s3.endpoint_url = Some(v);
            }
            if let Some(v) = get("S3_PREFIX") {
                s3.folder_prefix = Some(v);
            }
        }

        if let Some(v) = get("LOCAL_BACKUP_DIR") {
            self.local_backup_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("STAGING_DIR") {
            self.staging_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("BACKUP_PREFIX") {
            self.backup_prefix = Some(v);
        }
        if let Some(v) = get("RETENTION_DAYS") {
            self.retention_days = Some(parse_env("RETENTION_DAYS", &v)?);
        }
        if let Some(v) = get("KEEP_LATEST") {
            self.keep_latest = Some(parse_env("KEEP_LATEST", &v)?);
        }
        if let Some(v) = get("WEBHOOK_URL") {
            self.webhook_url = Some(v);
        }
        if let Some(v) = get("EXCLUDED_TABLES") {
            self.excluded_tables = Some(split_list(&v));
        }
        if let Some(v) = get("EXCLUDED_DATABASES") {
            self.excluded_databases = Some(split_list(&v));
        }
        if let Some(v) = get("RESTORE_SNAPSHOT") {
            self.restore_snapshot = Some(v);
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::Config(format!("{} has an invalid value: {}", key, value)))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// Application's internal configuration structs
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Database psql connects to before switching with `\connect`.
    pub maintenance_db: String,
}

impl DatabaseConfig {
    fn from_json(raw: &JsonDatabaseConfig) -> Result<Self> {
        let mut config = match raw.url.as_deref() {
            Some(url) => Self::from_url(url)?,
            None => DatabaseConfig {
                host: String::new(),
                port: DEFAULT_PG_PORT,
                user: String::new(),
                password: String::new(),
                maintenance_db: "postgres".to_string(),
            },
        };
        if let Some(host) = &raw.host {
            config.host = host.clone();
        }
        if let Some(port) = raw.port {
            config.port = port;
        }
        if let Some(user) = &raw.user {
            config.user = user.clone();
        }
        if let Some(password) = &raw.password {
            config.password = password.clone();
        }
        if let Some(db) = &raw.maintenance_db {
            config.maintenance_db = db.clone();
        }
        if config.host.is_empty() || config.user.is_empty() {
            return Err(AppError::Config(
                "database host and user must be set (database.url, PGHOST/PGUSER or DATABASE_URL)"
                    .to_string(),
            ));
        }
        Ok(config)
    }

    pub fn from_url(full_url: &str) -> Result<Self> {
        let parsed = Url::parse(full_url)
            .map_err(|e| AppError::Config(format!("Invalid database URL: {}", e)))?;
        if !matches!(parsed.scheme(), "postgres" | "postgresql") {
            return Err(AppError::Config(format!(
                "Unsupported database URL scheme: {}",
                parsed.scheme()
            )));
        }
        let db = decode_url_part(parsed.path().trim_start_matches('/'), "database name")?;
        Ok(DatabaseConfig {
            host: parsed.host_str().unwrap_or_default().to_string(),
            port: parsed.port().unwrap_or(DEFAULT_PG_PORT),
            user: decode_url_part(parsed.username(), "user")?,
            password: decode_url_part(parsed.password().unwrap_or_default(), "password")?,
            maintenance_db: if db.is_empty() { "postgres".to_string() } else { db },
        })
    }

    /// Connection URL for a specific database on this server. Credentials are
    /// stored decoded and re-encoded here.
    pub fn url_for(&self, db_name: &str) -> Result<String> {
        let invalid = |what: &str| AppError::Config(format!("Invalid database {}", what));
        let mut url = Url::parse("postgres://localhost").map_err(|_| invalid("URL"))?;
        url.set_host(Some(&self.host)).map_err(|_| invalid("host"))?;
        url.set_port(Some(self.port)).map_err(|_| invalid("port"))?;
        url.set_username(&self.user).map_err(|_| invalid("user"))?;
        if !self.password.is_empty() {
            url.set_password(Some(&self.password))
                .map_err(|_| invalid("password"))?;
        }
        url.set_path(db_name);
        Ok(url.to_string())
    }

    pub fn maintenance_url(&self) -> Result<String> {
        self.url_for(&self.maintenance_db)
    }

    /// `host:port` with the user, for log lines.
    pub fn redacted(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

/// URL userinfo and path are percent-encoded; `psql` and `PGPASSWORD` need the
/// raw text.
fn decode_url_part(raw: &str, what: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| AppError::Config(format!("Database URL {} is not valid UTF-8: {}", what, e)))
}

#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    S3(SpacesConfig),
    Local(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    /// Never delete the newest snapshot, even when it is past the window.
    pub keep_latest: bool,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub dump: Duration,
    pub transfer: Duration,
    pub replay: Duration,
    pub webhook: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            dump: Duration::from_secs(30 * 60),
            transfer: Duration::from_secs(30 * 60),
            replay: Duration::from_secs(60 * 60),
            webhook: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    /// Explicit database list; `None` means every non-template database.
    pub databases: Option<Vec<String>>,
    pub excluded_databases: Vec<String>,
    pub excluded_tables: Vec<String>,
    pub storage: StorageConfig,
    pub staging_dir: PathBuf,
    pub backup_prefix: String,
    pub retention: RetentionPolicy,
    pub keep_local_artifact: bool,
    pub webhook_url: Option<String>,
    pub restore_snapshot: Option<String>,
    pub timeouts: Timeouts,
}

impl AppConfig {
    /// Loads `config_path` (optional unless explicitly requested) and overlays
    /// the process environment.
    pub fn load(config_path: &Path, required: bool) -> Result<Self> {
        let mut raw = if config_path.exists() {
            load_raw_from_json(config_path)?
        } else if required {
            return Err(AppError::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        } else {
            RawJsonConfig::default()
        };
        raw.apply_env(|key| std::env::var(key).ok())?;
        Self::from_raw(&raw)
    }

    pub fn from_raw(raw: &RawJsonConfig) -> Result<Self> {
        let database = DatabaseConfig::from_json(&raw.database.clone().unwrap_or_default())?;
        let storage = resolve_storage(raw)?;

        let retention_days = raw.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS);
        if retention_days < 1 {
            return Err(AppError::Config("retention_days must be at least 1".to_string()));
        }

        let backup_prefix = raw
            .backup_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_BACKUP_PREFIX.to_string());
        if backup_prefix.is_empty()
            || backup_prefix.contains(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
        {
            return Err(AppError::Config(format!(
                "backup_prefix may only contain alphanumerics, '_' and '-': {:?}",
                backup_prefix
            )));
        }

        if let Some(dbs) = &raw.databases {
            if dbs.iter().any(|name| {
                name.trim().is_empty()
                    || name.contains(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
            }) {
                return Err(AppError::Config(format!(
                    "Invalid character in database list: {:?}",
                    dbs
                )));
            }
        }

        let mut timeouts = Timeouts::default();
        if let Some(t) = &raw.timeouts {
            if let Some(s) = t.dump_secs {
                timeouts.dump = Duration::from_secs(s);
            }
            if let Some(s) = t.transfer_secs {
                timeouts.transfer = Duration::from_secs(s);
            }
            if let Some(s) = t.replay_secs {
                timeouts.replay = Duration::from_secs(s);
            }
            if let Some(s) = t.webhook_secs {
                timeouts.webhook = Duration::from_secs(s);
            }
        }

        Ok(AppConfig {
            database,
            databases: raw.databases.clone().filter(|dbs| !dbs.is_empty()),
            excluded_databases: raw
                .excluded_databases
                .clone()
                .unwrap_or_else(|| vec!["postgres".to_string()]),
            excluded_tables: raw.excluded_tables.clone().unwrap_or_default(),
            storage,
            staging_dir: raw
                .staging_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STAGING_DIR)),
            backup_prefix,
            retention: RetentionPolicy {
                retention_days,
                keep_latest: raw.keep_latest.unwrap_or(true),
            },
            keep_local_artifact: raw.keep_local_artifact.unwrap_or(false),
            webhook_url: raw.webhook_url.clone().filter(|u| !u.trim().is_empty()),
            restore_snapshot: raw.restore_snapshot.clone(),
            timeouts,
        })
    }
}

pub fn load_raw_from_json(config_path: &Path) -> Result<RawJsonConfig> {
    let config_content = fs::read_to_string(config_path).map_err(|e| {
        AppError::Config(format!(
            "Failed to read config file at {}: {}",
            config_path.display(),
            e
        ))
    })?;
    serde_json::from_str(&config_content).map_err(|e| {
        AppError::Config(format!(
            "Failed to parse JSON from config file at {}: {}",
            config_path.display(),
            e
        ))
    })
}

/// S3 wins when fully configured; a partially filled S3 block is an error
/// rather than a silent fallback to local storage.
fn resolve_storage(raw: &RawJsonConfig) -> Result<StorageConfig> {
    if let Some(s3_raw) = &raw.s3_storage {
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        return match (
            non_empty(&s3_raw.bucket_name),
            non_empty(&s3_raw.access_key_id),
            non_empty(&s3_raw.secret_access_key),
            non_empty(&s3_raw.endpoint_url),
        ) {
            (Some(bucket_name), Some(access_key_id), Some(secret_access_key), Some(endpoint_url)) => {
                Ok(StorageConfig::S3(SpacesConfig {
                    endpoint_url,
                    region: non_empty(&s3_raw.region)
                        .unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
                    access_key_id,
                    secret_access_key,
                    bucket_name,
                    folder_prefix: non_empty(&s3_raw.folder_prefix)
                        .map(|p| p.trim_matches('/').to_string()),
                }))
            }
            _ => Err(AppError::Config(
                "s3_storage is present but bucket_name, access_key_id, secret_access_key or endpoint_url is missing"
                    .to_string(),
            )),
        };
    }
    match &raw.local_backup_dir {
        Some(dir) if !dir.as_os_str().is_empty() => Ok(StorageConfig::Local(dir.clone())),
        _ => Err(AppError::Config(
            "No storage configured: set s3_storage (or S3_* variables) or local_backup_dir"
                .to_string(),
        )),
    }
}
