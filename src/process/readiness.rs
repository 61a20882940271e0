//! Readiness polling state machine.
//!
//! Cold start time of a PostgreSQL server depends on disk speed and on
//! whether crash recovery has to run, so by default the poll never gives
//! up. Callers that prefer a hard ceiling set `max_attempts`.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::error::StartupError;

/// Where a readiness poll currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    /// No probe issued yet.
    Starting,
    /// Probing; holds the number of the attempt in flight.
    Polling(u32),
    /// The probe succeeded after this many attempts.
    Ready(u32),
    /// The attempt ceiling was reached after this many attempts.
    Failed(u32),
}

/// Drives a liveness probe until it succeeds or the ceiling is hit.
#[derive(Debug)]
pub struct ReadinessPoller {
    state: ReadinessState,
    interval: Duration,
    max_attempts: Option<u32>,
}

impl ReadinessPoller {
    /// Creates a poller that sleeps `interval` between failed probes.
    #[must_use]
    pub fn new(interval: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            state: ReadinessState::Starting,
            interval,
            max_attempts,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ReadinessState {
        self.state
    }

    /// Runs `probe` until it returns `Ok`.
    ///
    /// Returns the number of attempts it took.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::NotReady`] if `max_attempts` probes fail.
    /// Without a ceiling this only returns on success.
    pub async fn run<F, Fut, E>(&mut self, mut probe: F) -> Result<u32, StartupError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            self.state = ReadinessState::Polling(attempt);
            match probe().await {
                Ok(()) => {
                    self.state = ReadinessState::Ready(attempt);
                    return Ok(attempt);
                }
                Err(e) => {
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        self.state = ReadinessState::Failed(attempt);
                        return Err(StartupError::NotReady {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    tracing::info!(attempt, error = %e, "server not ready yet, retrying");
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }
}
