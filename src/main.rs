//! pgkeeper entry point.
//!
//! Starts the configured PostgreSQL instance, keeps it running with
//! scheduled backups, and stops it cleanly on SIGINT or SIGTERM. A panic
//! anywhere in the process runs the same shutdown once and then exits with
//! status 1.

use anyhow::Context;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use pgkeeper::config::InstanceConfig;
use pgkeeper::manager::DbManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("PGKEEPER_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load configuration
    let config = InstanceConfig::from_env().context("loading configuration")?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        "starting pgkeeper"
    );

    let mut fatal = install_fatal_hook();
    let manager = DbManager::create(config)
        .await
        .context("starting database")?;
    tracing::info!("database ready");

    let cause = manager.run_until_shutdown(shutdown_signal(), &mut fatal).await;
    match cause.exit_code() {
        0 => Ok(()),
        code => std::process::exit(code),
    }
}

/// Chains a panic hook that reports every panic, including those inside
/// spawned tasks, on the returned channel after the default hook has
/// printed it.
fn install_fatal_hook() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        // Fails only once main has stopped listening.
        let _ = tx.send(info.to_string());
    }));
    rx
}

/// Resolves on the first of SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
