//! Keeps an in-memory cache coherent with LISTEN/NOTIFY row changes.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::task::JoinHandle;

use super::cache::CacheStore;
use super::operation::RowOperation;
use crate::error::NotificationError;

/// Applies one row change to the cache.
#[async_trait]
pub trait OperationHandler<V, R>: Send + Sync {
    /// Handles `op`, typically by updating or evicting entries through
    /// `cache`.
    async fn handle(&self, cache: &CacheCoordinator<V, R>, op: RowOperation<R>) -> anyhow::Result<()>;
}

/// One delivered notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Channel it arrived on.
    pub channel: String,
    /// Raw payload. Empty when the sender passed none.
    pub payload: String,
}

/// First delay after a listener error; doubles per consecutive error.
const RETRY_DELAY_MIN: Duration = Duration::from_secs(1);
/// Ceiling for the listener retry delay.
const RETRY_DELAY_MAX: Duration = Duration::from_secs(30);

/// Where [`CacheCoordinator::drive`] reads notifications from.
#[async_trait]
pub trait NotificationSource: Send {
    /// Waits for the next notification.
    ///
    /// An error reports a lost or failed connection; the next call is
    /// expected to reconnect.
    async fn next_notification(&mut self) -> Result<Notification, sqlx::Error>;
}

#[async_trait]
impl NotificationSource for PgListener {
    async fn next_notification(&mut self) -> Result<Notification, sqlx::Error> {
        let n = self.recv().await?;
        Ok(Notification {
            channel: n.channel().to_string(),
            payload: n.payload().to_string(),
        })
    }
}

/// Cache plus the handler that keeps it in sync with the database.
pub struct CacheCoordinator<V, R = serde_json::Value> {
    cache: Arc<dyn CacheStore<V>>,
    handler: Arc<dyn OperationHandler<V, R>>,
}

impl<V, R> Clone for CacheCoordinator<V, R> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<V, R> fmt::Debug for CacheCoordinator<V, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCoordinator").finish_non_exhaustive()
    }
}

impl<V, R> CacheCoordinator<V, R>
where
    V: Clone + Send + Sync + 'static,
    R: DeserializeOwned + Send + 'static,
{
    /// Creates a coordinator over `cache` that feeds changes to `handler`.
    #[must_use]
    pub fn new<C, H>(cache: C, handler: H) -> Self
    where
        C: CacheStore<V> + 'static,
        H: OperationHandler<V, R> + 'static,
    {
        Self {
            cache: Arc::new(cache),
            handler: Arc::new(handler),
        }
    }

    /// Opens a dedicated listening connection, issues `LISTEN channel` and
    /// processes notifications on a background task until the returned
    /// [`Subscription`] is stopped or dropped.
    ///
    /// # Errors
    ///
    /// Returns the driver error if the connection or `LISTEN` fails.
    pub async fn subscribe(&self, pool: &PgPool, channel: &str) -> Result<Subscription, sqlx::Error> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(channel).await?;
        tracing::info!(channel, "listening for row changes");

        let coordinator = self.clone();
        let expected = channel.to_string();
        let handle = tokio::spawn(async move {
            coordinator.drive(&expected, listener).await;
        });
        Ok(Subscription {
            channel: channel.to_string(),
            handle,
        })
    }

    /// Processes notifications in delivery order, one at a time, until the
    /// task is cancelled.
    ///
    /// A failing notification is logged and skipped. A source error is
    /// logged and retried after a delay that doubles from one second up to
    /// thirty and resets after the next delivery.
    pub async fn drive<S: NotificationSource>(&self, expected: &str, mut source: S) {
        let mut delay = RETRY_DELAY_MIN;
        loop {
            match source.next_notification().await {
                Ok(n) => {
                    delay = RETRY_DELAY_MIN;
                    if let Err(e) = self.handle_notification(expected, &n.channel, &n.payload).await {
                        tracing::warn!(channel = %n.channel, error = %e, "notification dropped");
                    }
                }
                Err(e) => {
                    tracing::error!(
                        channel = expected,
                        error = %e,
                        retry_in = ?delay,
                        "listener connection error"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_DELAY_MAX);
                }
            }
        }
    }

    /// Decodes and dispatches one notification.
    ///
    /// Returns `Ok(false)` when it was ignored (foreign channel or empty
    /// payload) and `Ok(true)` when the handler ran.
    ///
    /// # Errors
    ///
    /// [`NotificationError::Decode`] for a malformed payload or unknown
    /// operation, [`NotificationError::Handler`] if the handler fails.
    pub async fn handle_notification(
        &self,
        expected: &str,
        channel: &str,
        payload: &str,
    ) -> Result<bool, NotificationError> {
        if channel != expected || payload.is_empty() {
            return Ok(false);
        }
        let op: RowOperation<R> = serde_json::from_str(payload).map_err(|source| NotificationError::Decode {
            channel: channel.to_string(),
            source,
        })?;
        let op_name = op.op_name();
        let table = op.table().to_string();
        tracing::debug!(op = op_name, table = %table, "row change");
        self.handler
            .handle(self, op)
            .await
            .map_err(|source| NotificationError::Handler {
                op: op_name,
                table,
                source,
            })?;
        Ok(true)
    }

    /// Returns the cached value, or runs `producer` and caches a `Some`
    /// result.
    ///
    /// A value stored for `key` by someone else while the producer ran wins
    /// over the produced one and is returned instead. `None` is not cached.
    ///
    /// # Errors
    ///
    /// Returns the producer's error; nothing is cached in that case.
    pub async fn get_or_set_cache<F, Fut, E>(&self, key: &str, producer: F) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value));
        }
        let Some(value) = producer().await? else {
            return Ok(None);
        };
        Ok(Some(self.cache.set_if_absent(key.to_string(), value)))
    }

    /// Stores a value, replacing any previous one.
    pub fn set_cache(&self, key: impl Into<String>, value: V) {
        self.cache.set(key.into(), value);
    }

    /// Stores a value unless one is present; returns the stored value.
    pub fn set_cache_if_absent(&self, key: impl Into<String>, value: V) -> V {
        self.cache.set_if_absent(key.into(), value)
    }

    /// Cached value, promoting it.
    #[must_use]
    pub fn get_cache(&self, key: &str) -> Option<V> {
        self.cache.get(key)
    }

    /// Cached value, without promoting it.
    #[must_use]
    pub fn peek_cache(&self, key: &str) -> Option<V> {
        self.cache.peek(key)
    }

    /// Evicts a key and returns its value.
    pub fn remove_cache(&self, key: &str) -> Option<V> {
        self.cache.remove(key)
    }

    /// Whether the key is cached.
    #[must_use]
    pub fn has_cache(&self, key: &str) -> bool {
        self.cache.has(key)
    }
}

/// A running LISTEN task. Stopping or dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Channel being listened on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether the listener task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops listening and closes the dedicated connection.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
        tracing::debug!(channel = %self.channel, "unsubscribed");
    }
}
