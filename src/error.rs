//! Error types for every stage of the server lifecycle.
//!
//! Each concern gets its own enum so callers can match on exactly the
//! failures an operation can produce:
//!
//! | Type                  | Raised by                         | Retried?                    |
//! |-----------------------|-----------------------------------|-----------------------------|
//! | [`ConfigError`]       | [`crate::config`]                 | no                          |
//! | [`StartupError`]      | [`crate::process`]                | readiness only, fixed delay |
//! | [`TransactionError`]  | [`crate::transaction`]            | never, always rolled back   |
//! | [`BackupError`]       | [`crate::backup`]                 | on the next scheduled tick  |
//! | [`NotificationError`] | [`crate::notify`]                 | no, isolated per message    |
//! | [`DataError`]         | [`crate::json_data`]              | no                          |
//! | [`ShutdownError`]     | [`crate::process`], [`crate::manager`] | no, logged and swallowed |

use std::path::PathBuf;
use std::process::ExitStatus;

/// Invalid or missing configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is not set.
    #[error("missing required setting {0}")]
    Missing(&'static str),

    /// An environment variable is set but cannot be parsed.
    #[error("invalid value for {key}: {value:?}")]
    Invalid {
        /// Environment variable name.
        key: &'static str,
        /// The offending raw value.
        value: String,
    },

    /// The output encoding label is not known to `encoding_rs`.
    #[error("unknown output encoding {0:?}")]
    UnknownEncoding(String),
}

/// The database server could not be started.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The control binary could not be spawned at all.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to launch.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The server never answered the liveness probe within the configured
    /// attempt ceiling.
    #[error("server not ready after {attempts} attempts: {last_error}")]
    NotReady {
        /// Number of probes issued.
        attempts: u32,
        /// Message of the last probe failure.
        last_error: String,
    },

    /// The configured init script failed.
    #[error("init script failed: {0}")]
    InitScript(#[source] sqlx::Error),
}

/// A transaction attempt failed. The connection has already been rolled back
/// (where a transaction was open) and released when this is returned.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// No connection could be checked out of the pool.
    #[error("failed to acquire connection: {0}")]
    Acquire(#[source] sqlx::Error),

    /// The backend id lookup used as the serialization key failed.
    #[error("failed to query backend id: {0}")]
    BackendId(#[source] sqlx::Error),

    /// `BEGIN` failed.
    #[error("failed to begin transaction on backend {backend}: {source}")]
    Begin {
        /// Backend the transaction ran on.
        backend: i32,
        /// Driver error.
        #[source]
        source: sqlx::Error,
    },

    /// The caller's work returned an error.
    #[error("transaction work failed on backend {backend}: {source}")]
    Work {
        /// Backend the transaction ran on.
        backend: i32,
        /// Error returned by the work closure.
        #[source]
        source: anyhow::Error,
    },

    /// `COMMIT` failed.
    #[error("failed to commit transaction on backend {backend}: {source}")]
    Commit {
        /// Backend the transaction ran on.
        backend: i32,
        /// Driver error.
        #[source]
        source: sqlx::Error,
    },
}

/// A single backup tick failed. The scheduler logs it and carries on.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// The backup directory could not be created.
    #[error("failed to create backup directory {path}: {source}")]
    CreateDir {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The backup directory could not be listed.
    #[error("failed to list backup directory {path}: {source}")]
    List {
        /// Directory that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The oldest backup could not be removed.
    #[error("failed to remove old backup {path}: {source}")]
    Remove {
        /// Backup that could not be removed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The base-backup utility could not be spawned.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to launch.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The base-backup utility exited unsuccessfully.
    #[error("{program} exited with {status}: {stderr}")]
    Utility {
        /// Program that failed.
        program: String,
        /// Exit status.
        status: ExitStatus,
        /// Decoded standard error output.
        stderr: String,
    },
}

/// A single inbound notification could not be processed.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    /// The payload is not valid JSON or does not match any known operation.
    #[error("malformed payload on channel {channel}: {source}")]
    Decode {
        /// Channel the notification arrived on.
        channel: String,
        /// Parse error.
        #[source]
        source: serde_json::Error,
    },

    /// The operation handler returned an error.
    #[error("handler failed for {op} on table {table}: {source}")]
    Handler {
        /// Operation kind (`insert`, `update`, ...).
        op: &'static str,
        /// Table named in the payload.
        table: String,
        /// Error returned by the handler.
        #[source]
        source: anyhow::Error,
    },
}

/// A jsonb row could not be read or updated.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// The row data does not serialize to a JSON object.
    #[error("row data is not a JSON object")]
    NotAnObject,

    /// A partial update names a key field.
    #[error("key field {0} cannot be updated")]
    KeyField(String),

    /// The data does not convert to or from its row type.
    #[error("row data does not match its type: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failure while shutting down. Always logged, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// The stop command could not be spawned.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to launch.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Waiting for the stop command to exit failed.
    #[error("failed waiting for {program}: {source}")]
    Wait {
        /// Program being waited on.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A registered shutdown hook failed.
    #[error("shutdown hook {name} failed: {source}")]
    Hook {
        /// Name the hook was registered under.
        name: String,
        /// Error returned by the hook.
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_error_names_backend() {
        let err = TransactionError::Work {
            backend: 4242,
            source: anyhow::anyhow!("boom"),
        };
        let msg = err.to_string();
        assert!(msg.contains("4242"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn config_error_shows_raw_value() {
        let err = ConfigError::Invalid {
            key: "PGKEEPER_PORT",
            value: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "invalid value for PGKEEPER_PORT: \"abc\"");
    }

    #[test]
    fn decode_error_keeps_source() {
        let Err(source) = serde_json::from_str::<serde_json::Value>("{") else {
            unreachable!("truncated JSON must not parse");
        };
        let err = NotificationError::Decode {
            channel: "operation".to_string(),
            source,
        };
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().starts_with("malformed payload on channel operation"));
    }
}
