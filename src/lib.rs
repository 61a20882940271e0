//! # pgkeeper
//!
//! Supervisor for a self-hosted PostgreSQL instance, with per-session
//! transaction ordering, scheduled base backups and a LISTEN/NOTIFY driven
//! cache.
//!
//! ## Architecture
//!
//! ```text
//! DbManager (manager/)
//!     │
//!     ├── ProcessSupervisor (process/)   pg_ctl start/stop, output decoding,
//!     │                                  readiness polling
//!     ├── ConnectionGate (gate/)         statements, statement files
//!     ├── TransactionCoordinator         BEGIN/COMMIT, FIFO per backend pid
//!     │   (transaction/)
//!     ├── BackupScheduler (backup/)      pg_basebackup + retention
//!     │
//!     └── shutdown hooks
//!
//! CacheCoordinator (notify/)             LISTEN channel → RowOperation →
//!                                        OperationHandler → CacheStore
//!
//! JsonDataEntity (json_data/)            jsonb rows, change detection
//! ```
//!
//! Configuration comes from `PGKEEPER_*` environment variables, see
//! [`config::InstanceConfig::from_env`].

pub mod backup;
pub mod config;
pub mod error;
pub mod gate;
pub mod json_data;
pub mod manager;
pub mod notify;
pub mod process;
pub mod timestamp;
pub mod transaction;
