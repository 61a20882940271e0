//! Top-level handle tying the server, pool, transactions and backups together.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::PgPool;
use tokio::sync::mpsc;

use crate::backup::{BackupScheduler, PgBaseBackup};
use crate::config::InstanceConfig;
use crate::error::{ShutdownError, StartupError, TransactionError};
use crate::gate::{ConnectionGate, HeldConnection, RunFileOptions};
use crate::process::ProcessSupervisor;
use crate::transaction::TransactionCoordinator;

type ShutdownHook = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// What ended [`DbManager::run_until_shutdown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    /// The shutdown signal resolved.
    Signal,
    /// A fatal failure was reported, with its description.
    Fatal(String),
}

impl ShutdownCause {
    /// Process exit code: 0 after a signal, 1 after a fatal failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Signal => 0,
            Self::Fatal(_) => 1,
        }
    }
}

/// A managed PostgreSQL instance.
///
/// Created with [`DbManager::create`]; shut down with [`DbManager::stop`],
/// which is safe to call any number of times from any task.
pub struct DbManager {
    supervisor: Mutex<Option<ProcessSupervisor>>,
    gate: ConnectionGate,
    transactions: TransactionCoordinator<ConnectionGate>,
    backups: Mutex<Option<BackupScheduler>>,
    hooks: Mutex<Vec<(String, ShutdownHook)>>,
    stopping: AtomicBool,
}

impl fmt::Debug for DbManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbManager")
            .field("gate", &self.gate)
            .field("backups", &self.backups.lock().is_some())
            .field("hooks", &self.hooks.lock().len())
            .field("stopping", &self.stopping.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl DbManager {
    /// Starts the server, then wires up the pool, transaction coordinator
    /// and backup timer, and finally runs the init script if configured.
    ///
    /// A failing init script stops the server again before the error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::Config`] for invalid settings, any startup
    /// failure of [`ProcessSupervisor::start`], or
    /// [`StartupError::InitScript`].
    pub async fn create(config: InstanceConfig) -> Result<Self, StartupError> {
        config.validate()?;
        let runner = PgBaseBackup::from_config(&config)?;
        let init_script = config.init_script.clone();
        let debug = config.debug_queries;

        let supervisor = ProcessSupervisor::start(config.clone()).await?;
        let gate = ConnectionGate::new(supervisor.pool().clone(), debug);
        let backups = BackupScheduler::start(&config, runner);
        let manager = Self::from_parts(Some(supervisor), gate, backups);

        if let Some(script) = init_script {
            if let Err(e) = manager.gate.run_file(&script, RunFileOptions::default()).await {
                tracing::error!(script = %script.display(), error = %e, "init script failed");
                manager.stop().await;
                return Err(StartupError::InitScript(e));
            }
            tracing::info!(script = %script.display(), "init script applied");
        }
        Ok(manager)
    }

    fn from_parts(
        supervisor: Option<ProcessSupervisor>,
        gate: ConnectionGate,
        backups: Option<BackupScheduler>,
    ) -> Self {
        Self {
            supervisor: Mutex::new(supervisor),
            transactions: TransactionCoordinator::new(gate.clone()),
            gate,
            backups: Mutex::new(backups),
            hooks: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
        }
    }

    /// Statement executor over the pool.
    #[must_use]
    pub fn gate(&self) -> &ConnectionGate {
        &self.gate
    }

    /// Underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        self.gate.pool()
    }

    /// Checks out one connection for exclusive use.
    ///
    /// # Errors
    ///
    /// Returns the pool error if no connection becomes available in time.
    pub async fn connect(&self) -> Result<HeldConnection, sqlx::Error> {
        self.gate.acquire().await
    }

    /// Runs `work` in a transaction serialized per backend session. See
    /// [`TransactionCoordinator::transaction`].
    ///
    /// # Errors
    ///
    /// Returns the [`TransactionError`] of the failing step.
    pub async fn transaction<T, F>(&self, work: F) -> Result<T, TransactionError>
    where
        F: for<'c> FnOnce(&'c mut HeldConnection) -> BoxFuture<'c, anyhow::Result<T>>,
    {
        self.transactions.transaction(work).await
    }

    /// Registers a hook run once by [`DbManager::stop`], before the server
    /// goes down. Hooks run in registration order.
    pub fn on_stop<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let hook: ShutdownHook = Box::new(move || hook().boxed());
        self.hooks.lock().push((name.into(), hook));
    }

    /// Whether [`DbManager::stop`] has been called.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Waits for `signal` or the first report on `fatal`, whichever comes
    /// first, then runs [`DbManager::stop`].
    pub async fn run_until_shutdown<S>(&self, signal: S, fatal: &mut mpsc::UnboundedReceiver<String>) -> ShutdownCause
    where
        S: Future<Output = ()>,
    {
        let cause = tokio::select! {
            () = signal => ShutdownCause::Signal,
            Some(reason) = fatal.recv() => ShutdownCause::Fatal(reason),
        };
        if let ShutdownCause::Fatal(reason) = &cause {
            tracing::error!(%reason, "fatal error, shutting down");
        }
        self.stop().await;
        cause
    }

    /// Cancels the backup timer, runs the shutdown hooks and stops the
    /// server. Only the first call does anything.
    ///
    /// Failures are logged and do not interrupt the remaining steps.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(backups) = self.backups.lock().take() {
            backups.stop();
        }

        let hooks = std::mem::take(&mut *self.hooks.lock());
        for (name, hook) in hooks {
            if let Err(source) = hook().await {
                let err = ShutdownError::Hook { name, source };
                tracing::error!(error = %err, "shutdown hook failed");
            }
        }

        let supervisor = self.supervisor.lock().take();
        match supervisor {
            Some(supervisor) => match supervisor.stop().await {
                Ok(()) => tracing::info!("database stopped"),
                Err(e) => tracing::error!(error = %e, "database stop failed"),
            },
            None => self.gate.pool().close().await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn detached() -> DbManager {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy_with(InstanceConfig::new("/tmp", 1).connect_options());
        DbManager::from_parts(None, ConnectionGate::new(pool, false), None)
    }

    #[tokio::test]
    async fn stop_runs_hooks_once_in_order() {
        let manager = detached();
        let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for name in ["first", "failing", "last"] {
            let calls = Arc::clone(&calls);
            manager.on_stop(name, move || async move {
                calls.lock().push(name);
                if name == "failing" {
                    anyhow::bail!("hook error");
                }
                Ok(())
            });
        }

        assert!(!manager.is_stopping());
        manager.stop().await;
        manager.stop().await;

        assert!(manager.is_stopping());
        assert_eq!(*calls.lock(), vec!["first", "failing", "last"]);
        assert!(manager.pool().is_closed());
    }

    #[tokio::test]
    async fn concurrent_stops_are_one_shot() {
        let manager = Arc::new(detached());
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        manager.on_stop("count", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let a = Arc::clone(&manager);
        let b = Arc::clone(&manager);
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.stop().await }),
            tokio::spawn(async move { b.stop().await })
        );
        tokio_test::assert_ok!(ra);
        tokio_test::assert_ok!(rb);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_report_runs_shutdown_once_and_exits_non_zero() {
        let manager = detached();
        let stops = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&stops);
        manager.on_stop("count", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = tx.clone();
        let worker = tokio::spawn(async move {
            let _ = reporter.send("worker panicked".to_string());
        });
        tokio_test::assert_ok!(worker.await);
        let _ = tx.send("second failure".to_string());

        let cause = manager
            .run_until_shutdown(std::future::pending(), &mut rx)
            .await;
        assert_eq!(cause, ShutdownCause::Fatal("worker panicked".to_string()));
        assert_eq!(cause.exit_code(), 1);
        assert!(manager.is_stopping());

        manager.stop().await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn signal_shutdown_exits_zero() {
        let manager = detached();
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let cause = manager.run_until_shutdown(async {}, &mut rx).await;
        assert_eq!(cause, ShutdownCause::Signal);
        assert_eq!(cause.exit_code(), 0);
        assert!(manager.is_stopping());
    }

    #[tokio::test]
    async fn create_reports_missing_pg_ctl() {
        let mut config = InstanceConfig::new("/nonexistent/pgkeeper-data", 54329);
        config.pg_ctl = "/nonexistent/pgkeeper/pg_ctl".to_string();
        let result = DbManager::create(config).await;
        assert!(matches!(result, Err(StartupError::Spawn { .. })));
    }

    #[tokio::test]
    async fn create_rejects_unknown_encoding() {
        let mut config = InstanceConfig::new("/nonexistent/pgkeeper-data", 54329);
        config.output_encoding = "no-such-encoding".to_string();
        let result = DbManager::create(config).await;
        assert!(matches!(result, Err(StartupError::Config(_))));
    }
}
