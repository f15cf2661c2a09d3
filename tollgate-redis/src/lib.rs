//! Redis bucket store for `tollgate` (companion crate).
//!
//! Buckets are stored as JSON under their key with `SET .. EX`, so Redis expires
//! idle clients on its own. The store reports connection events to a
//! [`ConnectionLifecycle`]; while that is not `Ready` the admission engine
//! never calls the store and admits requests unmetered.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tollgate::rate_limit::store::{decode, encode};
use tollgate::telemetry::{NullSink, TelemetrySink};
use tollgate::{Bucket, BucketStore, ConnectionEvent, ConnectionLifecycle, StoreError};

/// First delay between recovery PINGs; doubles up to [`MAX_RECOVERY_DELAY`].
pub const INITIAL_RECOVERY_DELAY: Duration = Duration::from_millis(250);
/// Ceiling for the recovery PING delay.
pub const MAX_RECOVERY_DELAY: Duration = Duration::from_secs(30);

/// [`BucketStore`] backed by a Redis (or wire-compatible) server.
///
/// Clones share the connection, the lifecycle and the reconnect state.
pub struct RedisBucketStore<T = NullSink> {
    client: redis::Client,
    conn: Arc<RwLock<Option<ConnectionManager>>>,
    lifecycle: ConnectionLifecycle<T>,
    timeout: Duration,
    closed: Arc<AtomicBool>,
    recovering: Arc<AtomicBool>,
}

impl<T: Clone> Clone for RedisBucketStore<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            conn: self.conn.clone(),
            lifecycle: self.lifecycle.clone(),
            timeout: self.timeout,
            closed: self.closed.clone(),
            recovering: self.recovering.clone(),
        }
    }
}

impl<T> std::fmt::Debug for RedisBucketStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBucketStore")
            .field("client", &"<redis::Client>")
            .field("lifecycle", &self.lifecycle)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<T> RedisBucketStore<T>
where
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    /// Move `lifecycle` to `Connecting` and connect to `url` in the background.
    ///
    /// Returns as soon as the connect task is spawned. The lifecycle reaches
    /// `Ready` once the server answers `PING`; a failed attempt moves it to
    /// `Disconnected` and the task retries with back-off until it succeeds,
    /// the store is closed, or the lifecycle is shut down. Every command is
    /// bounded by `timeout`. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    /// Returns `Err` only if `url` cannot be parsed.
    pub async fn connect(
        url: &str,
        lifecycle: ConnectionLifecycle<T>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| {
            tracing::warn!(target: "tollgate::redis", error = %e, "invalid redis url");
            StoreError::Backend(format!("invalid redis url: {}", e))
        })?;

        let store = Self {
            client,
            conn: Arc::new(RwLock::new(None)),
            lifecycle,
            timeout,
            closed: Arc::new(AtomicBool::new(false)),
            recovering: Arc::new(AtomicBool::new(false)),
        };

        if store.lifecycle.apply(ConnectionEvent::Connect).await.is_err() {
            tracing::debug!(target: "tollgate::redis", state = %store.lifecycle.state(), "not connecting");
            return Ok(store);
        }
        let connector = store.clone();
        tokio::spawn(async move { connector.establish().await });
        Ok(store)
    }

    /// The lifecycle this store reports to.
    pub fn lifecycle(&self) -> &ConnectionLifecycle<T> {
        &self.lifecycle
    }

    /// Closed through this store or shut down through the lifecycle.
    fn stopped(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.lifecycle.is_shut_down()
    }

    async fn establish(&self) {
        let mut delay = INITIAL_RECOVERY_DELAY;
        loop {
            if self.stopped() {
                return;
            }
            match self.open_connection().await {
                Ok(manager) => {
                    *self.conn.write().await = Some(manager);
                    if self.stopped()
                        || self.lifecycle.apply(ConnectionEvent::Ready).await.is_err()
                    {
                        // Shut down while the handshake was in flight.
                        self.conn.write().await.take();
                        return;
                    }
                    tracing::debug!(target: "tollgate::redis", "connected to redis");
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        target: "tollgate::redis",
                        error = %e,
                        retry_in = ?delay,
                        "failed to connect to redis"
                    );
                    let _ = self.lifecycle.apply(ConnectionEvent::Error).await;
                }
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_RECOVERY_DELAY);
            if self.stopped() || self.lifecycle.apply(ConnectionEvent::Reconnecting).await.is_err() {
                return;
            }
        }
    }

    async fn open_connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = tokio::time::timeout(self.timeout, ConnectionManager::new(self.client.clone()))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut conn = manager.clone();
        self.ping(&mut conn).await?;
        Ok(manager)
    }

    async fn ping(&self, conn: &mut ConnectionManager) -> Result<(), StoreError> {
        tokio::time::timeout(self.timeout, redis::cmd("PING").query_async::<String>(conn))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
            .map(|_| ())
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        if self.stopped() {
            return Err(StoreError::Unavailable("store closed".into()));
        }
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| StoreError::Unavailable("not connected".into()))
    }

    /// Classify a command failure; connection-class failures flip the
    /// lifecycle to `Reconnecting` and start recovery.
    async fn on_command_error(&self, err: StoreError) -> StoreError {
        if err.is_connection_loss()
            && !self.stopped()
            && self.lifecycle.apply(ConnectionEvent::Reconnecting).await.is_ok()
        {
            self.spawn_recovery();
        }
        err
    }

    fn spawn_recovery(&self) {
        if self.recovering.swap(true, Ordering::AcqRel) {
            return;
        }
        let store = self.clone();
        tokio::spawn(async move {
            let mut delay = INITIAL_RECOVERY_DELAY;
            loop {
                tokio::time::sleep(delay).await;
                if store.stopped() {
                    break;
                }
                let pinged = match store.connection().await {
                    Ok(mut conn) => store.ping(&mut conn).await,
                    Err(e) => Err(e),
                };
                match pinged {
                    Ok(()) => {
                        let _ = store.lifecycle.apply(ConnectionEvent::Ready).await;
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(target: "tollgate::redis", error = %e, "redis still unreachable");
                        delay = (delay * 2).min(MAX_RECOVERY_DELAY);
                    }
                }
            }
            store.recovering.store(false, Ordering::Release);
        });
    }
}

fn classify(err: redis::RedisError) -> StoreError {
    if err.is_timeout() {
        StoreError::Unavailable(format!("redis timeout: {}", err))
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

#[async_trait]
impl<T> BucketStore for RedisBucketStore<T>
where
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        let mut conn = self.connection().await?;
        let reply = tokio::time::timeout(
            self.timeout,
            redis::cmd("GET").arg(key).query_async::<Option<Vec<u8>>>(&mut conn),
        )
        .await;
        match reply {
            Ok(Ok(Some(bytes))) => decode(&bytes).map(Some),
            Ok(Ok(None)) => Ok(None),
            Ok(Err(e)) => Err(self.on_command_error(classify(e)).await),
            Err(_) => Err(self.on_command_error(StoreError::Timeout(self.timeout)).await),
        }
    }

    async fn set(&self, key: &str, bucket: &Bucket, ttl_secs: u64) -> Result<(), StoreError> {
        let bytes = encode(bucket)?;
        let mut conn = self.connection().await?;
        let reply = tokio::time::timeout(
            self.timeout,
            redis::cmd("SET")
                .arg(key)
                .arg(bytes)
                .arg("EX")
                .arg(ttl_secs)
                .query_async::<()>(&mut conn),
        )
        .await;
        match reply {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.on_command_error(classify(e)).await),
            Err(_) => Err(self.on_command_error(StoreError::Timeout(self.timeout)).await),
        }
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        self.conn.write().await.take();
        let _ = self.lifecycle.apply(ConnectionEvent::End).await;
        tracing::debug!(target: "tollgate::redis", "redis bucket store closed");
        Ok(())
    }
}
