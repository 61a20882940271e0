//! Start and stop of the external server through `pg_ctl`.

use std::ffi::OsString;
use std::process::Stdio;

use sqlx::PgPool;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::decode::OutputDecoder;
use super::readiness::ReadinessPoller;
use crate::config::InstanceConfig;
use crate::error::{ShutdownError, StartupError};

/// Which pipe a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output, logged at `info`.
    Stdout,
    /// Standard error, logged at `error`.
    Stderr,
}

/// A running PostgreSQL instance and its connection pool.
///
/// Owns the `pg_ctl start` child handle exclusively; the handle is
/// terminated and dropped by [`ProcessSupervisor::stop`].
#[derive(Debug)]
pub struct ProcessSupervisor {
    config: InstanceConfig,
    decoder: OutputDecoder,
    server: Child,
    pool: PgPool,
}

impl ProcessSupervisor {
    /// Starts the server and waits until it accepts queries.
    ///
    /// Spawns `pg_ctl start`, logs its decoded output, waits the settle
    /// delay and then polls `SELECT 1` through a fresh pool until it
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::Spawn`] if `pg_ctl` cannot be launched,
    /// [`StartupError::Config`] for an unknown output encoding, and
    /// [`StartupError::NotReady`] when a readiness ceiling is configured and
    /// reached.
    pub async fn start(config: InstanceConfig) -> Result<Self, StartupError> {
        let decoder = OutputDecoder::for_label(&config.output_encoding)?;

        tracing::info!(
            data_dir = %config.data_dir.display(),
            port = config.port,
            "starting postgres"
        );
        let mut server = spawn_ctl(&config.pg_ctl, start_args(&config)).map_err(|source| {
            StartupError::Spawn {
                program: config.pg_ctl.clone(),
                source,
            }
        })?;
        capture_output(&mut server, decoder, "postgres");

        tokio::time::sleep(config.settle_delay).await;

        // Server NOTICE messages are forwarded by sqlx to the `log` facade,
        // which the tracing subscriber picks up.
        let pool = config
            .pool_options()
            .connect_lazy_with(config.connect_options());

        let mut poller = ReadinessPoller::new(config.poll_interval, config.max_ready_attempts);
        match poller.run(|| probe(&pool)).await {
            Ok(attempts) => {
                tracing::info!(port = config.port, attempts, "postgres is ready");
            }
            Err(e) => {
                terminate(&mut server, "pg_ctl start");
                return Err(e);
            }
        }

        Ok(Self {
            config,
            decoder,
            server,
            pool,
        })
    }

    /// Connection pool of the running instance.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Configuration the instance was started with.
    #[must_use]
    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// Stops the server and resolves once `pg_ctl stop` has exited.
    ///
    /// Closes the pool first, then runs `pg_ctl stop` with its output
    /// decoded like at startup. Afterwards both the start and stop handles
    /// are terminated; either one already being gone is fine.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError::Spawn`] or [`ShutdownError::Wait`] if the
    /// stop command cannot be run. The start handle is terminated regardless.
    pub async fn stop(mut self) -> Result<(), ShutdownError> {
        tracing::info!(data_dir = %self.config.data_dir.display(), "stopping postgres");
        self.pool.close().await;

        let result = self.run_stop_command().await;

        if let Ok(Some(status)) = self.server.try_wait() {
            tracing::debug!(%status, "pg_ctl start had exited");
        }
        terminate(&mut self.server, "pg_ctl start");
        result
    }

    async fn run_stop_command(&self) -> Result<(), ShutdownError> {
        let program = self.config.pg_ctl.clone();
        let mut stopper =
            spawn_ctl(&program, stop_args(&self.config)).map_err(|source| ShutdownError::Spawn {
                program: program.clone(),
                source,
            })?;
        let pumps = capture_output(&mut stopper, self.decoder, "pg_ctl stop");

        let status = stopper
            .wait()
            .await
            .map_err(|source| ShutdownError::Wait { program, source })?;
        for pump in pumps {
            if let Err(e) = pump.await {
                tracing::debug!(error = %e, "pg_ctl stop output pump did not finish");
            }
        }
        tracing::info!(%status, "pg_ctl stop exited");

        terminate(&mut stopper, "pg_ctl stop");
        Ok(())
    }
}

/// Asks `child` to exit with SIGTERM, falling back to a hard kill when no
/// signal can be delivered. A child that already exited is left alone.
fn terminate(child: &mut Child, label: &'static str) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        match send_sigterm(pid) {
            Ok(()) => {
                tracing::debug!(process = label, pid, "sent SIGTERM");
                return;
            }
            Err(e) => tracing::debug!(process = label, pid, error = %e, "SIGTERM failed, killing"),
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(process = label, error = %e, "already gone");
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn send_sigterm(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid).map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    // SAFETY: kill(2) only takes integers. `pid` belongs to an unreaped
    // child, so it cannot have been recycled.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Issues the liveness query over a pooled connection.
async fn probe(pool: &PgPool) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("SELECT 1").execute(&mut *conn).await?;
    Ok(())
}

/// `pg_ctl start -D <dir> -o "-p <port>"`.
fn start_args(config: &InstanceConfig) -> Vec<OsString> {
    vec![
        "start".into(),
        "-D".into(),
        config.data_dir.clone().into_os_string(),
        "-o".into(),
        format!("-p {}", config.port).into(),
    ]
}

/// `pg_ctl stop -D <dir>`.
fn stop_args(config: &InstanceConfig) -> Vec<OsString> {
    vec![
        "stop".into(),
        "-D".into(),
        config.data_dir.clone().into_os_string(),
    ]
}

fn spawn_ctl(program: &str, args: Vec<OsString>) -> std::io::Result<Child> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

/// Starts background tasks that log the child's decoded stdout and stderr.
fn capture_output(child: &mut Child, decoder: OutputDecoder, label: &'static str) -> Vec<JoinHandle<()>> {
    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump_output(stdout, decoder, label, OutputStream::Stdout)));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump_output(stderr, decoder, label, OutputStream::Stderr)));
    }
    pumps
}

async fn pump_output<R>(reader: R, decoder: OutputDecoder, label: &'static str, stream: OutputStream)
where
    R: AsyncRead + Unpin,
{
    let result = read_decoded_lines(reader, decoder, |text| match stream {
        OutputStream::Stdout => tracing::info!(process = label, "{text}"),
        OutputStream::Stderr => tracing::error!(process = label, "{text}"),
    })
    .await;
    if let Err(e) = result {
        tracing::warn!(process = label, ?stream, error = %e, "output capture stopped");
    }
}

/// Reads whole lines from `reader` and hands each non-empty decoded line to
/// `sink`. Reading a full line first keeps multi-byte sequences intact.
async fn read_decoded_lines<R, F>(reader: R, decoder: OutputDecoder, mut sink: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        let text = decoder.decode(&line);
        if !text.is_empty() {
            sink(text);
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn config() -> InstanceConfig {
        InstanceConfig::new("/srv/pgdata", 5433)
    }

    fn decoder() -> OutputDecoder {
        let Ok(d) = OutputDecoder::for_label("gbk") else {
            panic!("gbk is a known label");
        };
        d
    }

    #[test]
    fn start_command_passes_port_as_single_option() {
        let args = start_args(&config());
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["start", "-D", "/srv/pgdata", "-o", "-p 5433"]);
    }

    #[test]
    fn stop_command_targets_data_dir() {
        let args = stop_args(&config());
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["stop", "-D", "/srv/pgdata"]);
    }

    #[tokio::test]
    async fn reads_mixed_encoding_lines() {
        let mut data = b"waiting for server to start....\r\n".to_vec();
        data.extend(encoding_rs::GBK.encode("日志:  数据库系统准备接受连接").0.iter());
        data.extend_from_slice(b"\n\n done\n");

        let mut lines = Vec::new();
        let result = read_decoded_lines(data.as_slice(), decoder(), |l| lines.push(l)).await;
        assert!(result.is_ok());
        assert_eq!(
            lines,
            vec![
                "waiting for server to start....".to_string(),
                "日志:  数据库系统准备接受连接".to_string(),
                " done".to_string(),
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_sends_sigterm_to_running_child() {
        use std::os::unix::process::ExitStatusExt;

        let Ok(mut child) = Command::new("sleep").arg("30").spawn() else {
            panic!("sleep should spawn");
        };
        terminate(&mut child, "sleep");
        let Ok(status) = child.wait().await else {
            panic!("child should be reaped");
        };
        assert_eq!(status.signal(), Some(libc::SIGTERM));

        // Reaped child: no pid left, falls through to the kill path quietly.
        assert!(child.id().is_none());
        terminate(&mut child, "sleep");
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let mut cfg = config();
        cfg.pg_ctl = "/nonexistent/pgkeeper-test/pg_ctl".to_string();
        cfg.settle_delay = std::time::Duration::ZERO;
        let Err(StartupError::Spawn { program, .. }) = ProcessSupervisor::start(cfg).await else {
            panic!("expected spawn failure");
        };
        assert_eq!(program, "/nonexistent/pgkeeper-test/pg_ctl");
    }
}
