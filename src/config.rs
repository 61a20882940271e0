//! Instance configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from `PGKEEPER_*` environment
//! variables (or a `.env` file via `dotenvy`). Only the data directory is
//! required; everything else falls back to the defaults listed on
//! [`InstanceConfig`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use crate::error::ConfigError;

/// Shortest backup interval that still enables the backup scheduler.
pub const MIN_BACKUP_INTERVAL: Duration = Duration::from_secs(60);

/// Database password whose `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    /// Wraps a plain-text password.
    #[must_use]
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    /// Returns the plain-text password.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

/// Settings for one supervised PostgreSQL instance.
///
/// Built either from the environment with [`InstanceConfig::from_env`] or
/// programmatically with [`InstanceConfig::new`] and field updates.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Server data directory passed to `pg_ctl -D`.
    pub data_dir: PathBuf,

    /// Port the server listens on. Default `5432`.
    pub port: u16,

    /// Host used by pooled connections. Default `localhost`.
    pub host: String,

    /// Role used by pooled connections and backups. Default `postgres`.
    pub user: String,

    /// Optional password. Never logged.
    pub password: Option<Password>,

    /// Target database. Default `postgres`.
    pub database: String,

    /// Maximum number of pooled connections. Default `10`.
    pub max_connections: u32,

    /// Idle pooled connections are closed after this long. Default 30 s.
    pub idle_timeout: Duration,

    /// Timeout for a single connection checkout. Default 5 s.
    pub acquire_timeout: Duration,

    /// Encoding label used when server output is not UTF-8. Default `gbk`.
    pub output_encoding: String,

    /// Backup directory. `None` disables backups.
    pub backup_dir: Option<PathBuf>,

    /// Number of backups kept. Default `10`.
    pub backup_retention: usize,

    /// Time between backups. Default one hour.
    pub backup_interval: Duration,

    /// Log every statement with its values and elapsed time.
    pub debug_queries: bool,

    /// Delay between spawning the server and the first readiness probe.
    /// Default 2 s.
    pub settle_delay: Duration,

    /// Delay between readiness probes. Default 1 s.
    pub poll_interval: Duration,

    /// Readiness probe ceiling. `None` retries until the server answers.
    pub max_ready_attempts: Option<u32>,

    /// Server control binary. Default `pg_ctl`.
    pub pg_ctl: String,

    /// Base-backup binary. Default `pg_basebackup`.
    pub pg_basebackup: String,

    /// Statement file executed once after startup.
    pub init_script: Option<PathBuf>,
}

impl InstanceConfig {
    /// Creates a configuration with defaults for everything except the data
    /// directory and port.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            data_dir: data_dir.into(),
            port,
            host: "localhost".to_string(),
            user: "postgres".to_string(),
            password: None,
            database: "postgres".to_string(),
            max_connections: 10,
            idle_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
            output_encoding: "gbk".to_string(),
            backup_dir: None,
            backup_retention: 10,
            backup_interval: Duration::from_secs(60 * 60),
            debug_queries: false,
            settle_delay: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            max_ready_attempts: None,
            pg_ctl: "pg_ctl".to_string(),
            pg_basebackup: "pg_basebackup".to_string(),
            init_script: None,
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if `PGKEEPER_DATA_DIR` is unset,
    /// [`ConfigError::Invalid`] if `PGKEEPER_PORT` cannot be parsed, and
    /// [`ConfigError::UnknownEncoding`] for an unknown
    /// `PGKEEPER_OUTPUT_ENCODING`.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let data_dir = std::env::var("PGKEEPER_DATA_DIR")
            .map_err(|_| ConfigError::Missing("PGKEEPER_DATA_DIR"))?;
        let port = match std::env::var("PGKEEPER_PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "PGKEEPER_PORT",
                value: raw,
            })?,
            Err(_) => 5432,
        };

        let mut config = Self::new(data_dir, port);
        if let Ok(host) = std::env::var("PGKEEPER_HOST") {
            config.host = host;
        }
        if let Ok(user) = std::env::var("PGKEEPER_USER") {
            config.user = user;
        }
        config.password = std::env::var("PGKEEPER_PASSWORD").ok().map(Password::new);
        if let Ok(database) = std::env::var("PGKEEPER_DATABASE") {
            config.database = database;
        }
        config.max_connections = parse_env("PGKEEPER_MAX_CONNECTIONS", config.max_connections);
        config.idle_timeout = Duration::from_secs(parse_env("PGKEEPER_IDLE_TIMEOUT_SECS", 30));
        config.acquire_timeout =
            Duration::from_secs(parse_env("PGKEEPER_ACQUIRE_TIMEOUT_SECS", 5));
        if let Ok(encoding) = std::env::var("PGKEEPER_OUTPUT_ENCODING") {
            config.output_encoding = encoding;
        }

        config.backup_dir = std::env::var("PGKEEPER_BACKUP_DIR").ok().map(PathBuf::from);
        config.backup_retention = parse_env("PGKEEPER_BACKUP_RETENTION", config.backup_retention);
        config.backup_interval =
            Duration::from_secs(parse_env("PGKEEPER_BACKUP_INTERVAL_SECS", 60 * 60));

        config.debug_queries = parse_env_bool("PGKEEPER_DEBUG_QUERIES", false);
        config.settle_delay = Duration::from_millis(parse_env("PGKEEPER_SETTLE_DELAY_MS", 2000));
        config.poll_interval = Duration::from_millis(parse_env("PGKEEPER_POLL_INTERVAL_MS", 1000));
        config.max_ready_attempts = std::env::var("PGKEEPER_MAX_READY_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok());

        if let Ok(pg_ctl) = std::env::var("PGKEEPER_PG_CTL") {
            config.pg_ctl = pg_ctl;
        }
        if let Ok(pg_basebackup) = std::env::var("PGKEEPER_PG_BASEBACKUP") {
            config.pg_basebackup = pg_basebackup;
        }
        config.init_script = std::env::var("PGKEEPER_INIT_SCRIPT").ok().map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    /// Checks values that cannot be caught by parsing alone.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownEncoding`] if the output encoding label
    /// is not recognised.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if encoding_rs::Encoding::for_label(self.output_encoding.as_bytes()).is_none() {
            return Err(ConfigError::UnknownEncoding(self.output_encoding.clone()));
        }
        Ok(())
    }

    /// Returns `true` when all backup settings are within their valid
    /// ranges. Any single invalid setting disables backups entirely.
    #[must_use]
    pub fn backups_enabled(&self) -> bool {
        self.backup_dir.is_some()
            && self.backup_interval >= MIN_BACKUP_INTERVAL
            && self.backup_retention >= 1
    }

    /// Connection options for the pooled client connections.
    #[must_use]
    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.database);
        match &self.password {
            Some(password) => options.password(password.expose()),
            None => options,
        }
    }

    /// Pool sizing and timeouts.
    #[must_use]
    pub fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .idle_timeout(self.idle_timeout)
            .acquire_timeout(self.acquire_timeout)
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses an environment variable as a boolean. Accepts `"true"`, `"1"`,
/// `"false"`, `"0"` (case-insensitive). Returns `default` otherwise.
fn parse_env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().as_deref() {
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => true,
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => false,
        _ => default,
    }
}
