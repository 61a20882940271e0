//! Periodic base backups with retention rotation.
//!
//! Backups live in `<backup_dir>/pgsql-<local timestamp>` directories, where
//! the timestamp is `YYYY-MM-DDTHH_MM_SS` (colons replaced so the name is
//! valid on every filesystem). Before each new backup, if the directory
//! already holds `retention` or more backups, the single oldest one is
//! removed.
//!
//! A failed tick is logged and skipped; the next tick starts from scratch.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{InstanceConfig, Password};
use crate::error::{BackupError, ConfigError};
use crate::process::OutputDecoder;

/// Directory name prefix of every backup.
pub const BACKUP_PREFIX: &str = "pgsql-";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H_%M_%S";

/// Where, how often, and how many backups to keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPolicy {
    /// Directory holding the backups.
    pub dir: PathBuf,
    /// Number of backups kept after each tick.
    pub retention: usize,
    /// Time between ticks.
    pub interval: Duration,
}

impl BackupPolicy {
    /// Extracts the policy, or `None` when any backup setting is out of
    /// range (see [`InstanceConfig::backups_enabled`]).
    #[must_use]
    pub fn from_config(config: &InstanceConfig) -> Option<Self> {
        if !config.backups_enabled() {
            return None;
        }
        config.backup_dir.as_ref().map(|dir| Self {
            dir: dir.clone(),
            retention: config.backup_retention,
            interval: config.backup_interval,
        })
    }
}

/// One backup found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    /// Full path of the backup directory.
    pub path: PathBuf,
    /// Creation time parsed from the directory name.
    pub timestamp: NaiveDateTime,
}

/// Directory name for a backup taken at `at`.
#[must_use]
pub fn backup_dir_name(at: NaiveDateTime) -> String {
    format!("{BACKUP_PREFIX}{}", at.format(TIMESTAMP_FORMAT))
}

/// Parses the timestamp out of a backup directory name.
#[must_use]
pub fn parse_backup_name(name: &str) -> Option<NaiveDateTime> {
    let stamp = name.strip_prefix(BACKUP_PREFIX)?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()
}

/// Lists the backups in `dir`, oldest first.
///
/// Files, directories without the prefix, and names whose timestamp does
/// not parse are not backups and are skipped.
///
/// # Errors
///
/// Returns [`BackupError::List`] if the directory cannot be read.
pub async fn list_backups(dir: &Path) -> Result<Vec<BackupRecord>, BackupError> {
    let list_err = |source| BackupError::List {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(list_err)?;
    let mut backups = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
        if !entry.file_type().await.map_err(list_err)?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Some(timestamp) = name.to_str().and_then(parse_backup_name) {
            backups.push(BackupRecord {
                path: entry.path(),
                timestamp,
            });
        }
    }
    backups.sort_by_key(|b| b.timestamp);
    Ok(backups)
}

/// Removes the oldest backup if `dir` already holds `retention` or more.
///
/// Returns the removed path, if any.
///
/// # Errors
///
/// Returns [`BackupError::List`] or [`BackupError::Remove`].
pub async fn rotate(dir: &Path, retention: usize) -> Result<Option<PathBuf>, BackupError> {
    let backups = list_backups(dir).await?;
    if backups.len() < retention {
        return Ok(None);
    }
    let Some(oldest) = backups.into_iter().next() else {
        return Ok(None);
    };
    tokio::fs::remove_dir_all(&oldest.path)
        .await
        .map_err(|source| BackupError::Remove {
            path: oldest.path.clone(),
            source,
        })?;
    tracing::info!(path = %oldest.path.display(), "removed oldest backup");
    Ok(Some(oldest.path))
}

/// Produces a base backup at a destination directory.
#[async_trait]
pub trait BackupRunner: Send + Sync {
    /// Writes a complete backup into `destination`.
    async fn create(&self, destination: &Path) -> Result<(), BackupError>;
}

/// Runs `pg_basebackup` against the supervised server.
#[derive(Debug, Clone)]
pub struct PgBaseBackup {
    program: String,
    host: String,
    port: u16,
    user: String,
    password: Option<Password>,
    decoder: OutputDecoder,
}

impl PgBaseBackup {
    /// Builds the runner from the instance settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownEncoding`] for an unknown output
    /// encoding.
    pub fn from_config(config: &InstanceConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            program: config.pg_basebackup.clone(),
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            password: config.password.clone(),
            decoder: OutputDecoder::for_label(&config.output_encoding)?,
        })
    }

    /// Tar format, streamed WAL, gzip compression.
    fn args(&self, destination: &Path) -> Vec<OsString> {
        vec![
            "-D".into(),
            destination.as_os_str().to_owned(),
            "-Ft".into(),
            "-Xs".into(),
            "-U".into(),
            self.user.clone().into(),
            "-h".into(),
            self.host.clone().into(),
            "-p".into(),
            self.port.to_string().into(),
            "--compress=gzip".into(),
        ]
    }
}

#[async_trait]
impl BackupRunner for PgBaseBackup {
    async fn create(&self, destination: &Path) -> Result<(), BackupError> {
        let mut command = Command::new(&self.program);
        command.args(self.args(destination));
        if let Some(password) = &self.password {
            command.env("PGPASSWORD", password.expose());
        }
        let output = command
            .output()
            .await
            .map_err(|source| BackupError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = self.decoder.decode(&output.stdout);
        if !stdout.is_empty() {
            tracing::debug!(program = %self.program, "{stdout}");
        }
        if !output.status.success() {
            return Err(BackupError::Utility {
                program: self.program.clone(),
                status: output.status,
                stderr: self.decoder.decode(&output.stderr),
            });
        }
        Ok(())
    }
}

/// Performs one backup tick: rotate, then create `pgsql-<now>`.
///
/// # Errors
///
/// Returns the [`BackupError`] of the first failing step.
pub async fn run_backup<R>(policy: &BackupPolicy, runner: &R, now: NaiveDateTime) -> Result<PathBuf, BackupError>
where
    R: BackupRunner + ?Sized,
{
    let destination = policy.dir.join(backup_dir_name(now));
    tokio::fs::create_dir_all(&policy.dir)
        .await
        .map_err(|source| BackupError::CreateDir {
            path: policy.dir.clone(),
            source,
        })?;
    rotate(&policy.dir, policy.retention).await?;
    runner.create(&destination).await?;
    Ok(destination)
}

/// Timer task taking a backup every interval.
#[derive(Debug)]
pub struct BackupScheduler {
    policy: BackupPolicy,
    handle: JoinHandle<()>,
}

impl BackupScheduler {
    /// Starts the scheduler if the configuration enables backups.
    ///
    /// Returns `None`, without creating any timer, when it does not.
    #[must_use]
    pub fn start<R>(config: &InstanceConfig, runner: R) -> Option<Self>
    where
        R: BackupRunner + 'static,
    {
        let Some(policy) = BackupPolicy::from_config(config) else {
            tracing::info!("automatic backups disabled");
            return None;
        };
        Some(Self::spawn(policy, runner))
    }

    /// Spawns the timer for `policy`. The first tick fires one interval
    /// from now.
    #[must_use]
    pub fn spawn<R>(policy: BackupPolicy, runner: R) -> Self
    where
        R: BackupRunner + 'static,
    {
        tracing::info!(
            dir = %policy.dir.display(),
            retention = policy.retention,
            interval = ?policy.interval,
            "automatic backups enabled"
        );
        let task_policy = policy.clone();
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + task_policy.interval, task_policy.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracing::info!("starting scheduled backup");
                match run_backup(&task_policy, &runner, Local::now().naive_local()).await {
                    Ok(path) => tracing::info!(path = %path.display(), "backup completed"),
                    Err(e) => tracing::error!(error = %e, "backup failed"),
                }
            }
        });
        Self { policy, handle }
    }

    /// Active policy.
    #[must_use]
    pub fn policy(&self) -> &BackupPolicy {
        &self.policy
    }

    /// Cancels the timer. A backup in progress is abandoned at its next
    /// await point.
    pub fn stop(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeRunner {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl BackupRunner for FakeRunner {
        async fn create(&self, destination: &Path) -> Result<(), BackupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BackupError::Spawn {
                    program: "pg_basebackup".to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            tokio::fs::create_dir_all(destination)
                .await
                .map_err(|source| BackupError::CreateDir {
                    path: destination.to_path_buf(),
                    source,
                })
        }
    }

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        let Some(t) = NaiveDate::from_ymd_opt(2024, 3, day).and_then(|d| d.and_hms_opt(hour, 8, 9)) else {
            panic!("valid date");
        };
        t
    }

    fn temp_dir() -> tempfile::TempDir {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("temp dir");
        };
        dir
    }

    async fn seed(dir: &Path, stamps: &[NaiveDateTime]) {
        for stamp in stamps {
            let Ok(()) = tokio::fs::create_dir_all(dir.join(backup_dir_name(*stamp))).await else {
                panic!("seed backup");
            };
        }
    }

    fn policy(dir: &Path, retention: usize) -> BackupPolicy {
        BackupPolicy {
            dir: dir.to_path_buf(),
            retention,
            interval: Duration::from_secs(3600),
        }
    }

    #[test]
    fn names_are_filesystem_safe_and_parse_back() {
        let stamp = at(5, 7);
        let name = backup_dir_name(stamp);
        assert_eq!(name, "pgsql-2024-03-05T07_08_09");
        assert!(!name.contains(':'));
        assert_eq!(parse_backup_name(&name), Some(stamp));
        assert_eq!(parse_backup_name("pgsql-garbage"), None);
        assert_eq!(parse_backup_name("other-2024-03-05T07_08_09"), None);
    }

    #[test]
    fn policy_requires_every_setting_in_range() {
        let mut config = InstanceConfig::new("/data", 5432);
        assert!(BackupPolicy::from_config(&config).is_none());

        config.backup_dir = Some(PathBuf::from("/backups"));
        config.backup_retention = 3;
        let Some(policy) = BackupPolicy::from_config(&config) else {
            panic!("valid settings enable backups");
        };
        assert_eq!(policy.retention, 3);
        assert_eq!(policy.interval, Duration::from_secs(3600));

        config.backup_interval = Duration::from_secs(30);
        assert!(BackupPolicy::from_config(&config).is_none());
    }

    #[tokio::test]
    async fn scheduler_not_created_without_backup_dir() {
        let config = InstanceConfig::new("/data", 5432);
        assert!(BackupScheduler::start(&config, FakeRunner::default()).is_none());
    }

    #[tokio::test]
    async fn listing_skips_foreign_entries_and_sorts() {
        let dir = temp_dir();
        seed(dir.path(), &[at(9, 1), at(2, 1), at(5, 1)]).await;
        let Ok(()) = tokio::fs::create_dir_all(dir.path().join("pgsql-not-a-date")).await else {
            panic!("mkdir");
        };
        let Ok(()) = tokio::fs::create_dir_all(dir.path().join("scratch")).await else {
            panic!("mkdir");
        };
        let Ok(()) = tokio::fs::write(dir.path().join(backup_dir_name(at(1, 1))), b"file").await else {
            panic!("write");
        };

        let Ok(backups) = list_backups(dir.path()).await else {
            panic!("listing failed");
        };
        let stamps: Vec<_> = backups.iter().map(|b| b.timestamp).collect();
        assert_eq!(stamps, vec![at(2, 1), at(5, 1), at(9, 1)]);
    }

    #[tokio::test]
    async fn full_directory_evicts_exactly_the_oldest() {
        let dir = temp_dir();
        seed(dir.path(), &[at(3, 1), at(1, 1), at(2, 1)]).await;
        let runner = FakeRunner::default();

        let Ok(created) = run_backup(&policy(dir.path(), 3), &runner, at(4, 1)).await else {
            panic!("backup failed");
        };
        assert_eq!(created, dir.path().join("pgsql-2024-03-04T01_08_09"));

        let Ok(backups) = list_backups(dir.path()).await else {
            panic!("listing failed");
        };
        let stamps: Vec<_> = backups.iter().map(|b| b.timestamp).collect();
        assert_eq!(stamps, vec![at(2, 1), at(3, 1), at(4, 1)]);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn below_retention_nothing_is_removed() {
        let dir = temp_dir();
        seed(dir.path(), &[at(1, 1)]).await;
        let Ok(removed) = rotate(dir.path(), 3).await else {
            panic!("rotate failed");
        };
        assert!(removed.is_none());
    }

    #[tokio::test]
    async fn missing_directory_is_created() {
        let dir = temp_dir();
        let nested = dir.path().join("nested").join("backups");
        let runner = FakeRunner::default();
        tokio_test::assert_ok!(run_backup(&policy(&nested, 2), &runner, at(1, 1)).await);
        assert!(nested.join(backup_dir_name(at(1, 1))).is_dir());
    }

    #[tokio::test]
    async fn runner_failure_is_reported() {
        let dir = temp_dir();
        let runner = FakeRunner {
            fail: true,
            ..FakeRunner::default()
        };
        let result = run_backup(&policy(dir.path(), 2), &runner, at(1, 1)).await;
        assert!(matches!(result, Err(BackupError::Spawn { .. })));
    }

    #[test]
    fn basebackup_arguments() {
        let mut config = InstanceConfig::new("/data", 5433);
        config.user = "admin".to_string();
        let Ok(runner) = PgBaseBackup::from_config(&config) else {
            panic!("valid config");
        };
        let args: Vec<_> = runner
            .args(Path::new("/b/pgsql-x"))
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-D", "/b/pgsql-x", "-Ft", "-Xs", "-U", "admin", "-h", "localhost", "-p", "5433",
                "--compress=gzip"
            ]
        );
    }

    #[tokio::test]
    async fn scheduler_ticks_until_stopped() {
        let dir = temp_dir();
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = FakeRunner {
            calls: Arc::clone(&calls),
            fail: true,
        };
        let scheduler = BackupScheduler::spawn(
            BackupPolicy {
                dir: dir.path().to_path_buf(),
                retention: 2,
                interval: Duration::from_millis(20),
            },
            runner,
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let ticks = calls.load(Ordering::SeqCst);
        assert!(ticks >= 2, "expected repeated ticks despite failures, got {ticks}");

        scheduler.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_stop = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
    }
}
