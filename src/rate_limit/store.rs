use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::rate_limit::bucket::Bucket;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Abstract storage interface for bucket records.
///
/// Implementations treat the record as an opaque blob under a key with an
/// expiry; only the admission engine interprets its fields. Every call is a
/// potential network round-trip and may fail independently of the others.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Fetch the bucket stored under `key`.
    ///
    /// A missing or expired key is `Ok(None)`, never an error.
    async fn get(&self, key: &str) -> Result<Option<Bucket>, StoreError>;

    /// Store `bucket` under `key`, resetting its expiry to `ttl_secs`.
    async fn set(&self, key: &str, bucket: &Bucket, ttl_secs: u64) -> Result<(), StoreError>;

    /// Release the underlying connection. Defaults to a no-op.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl<S> BucketStore for std::sync::Arc<S>
where
    S: BucketStore + ?Sized,
{
    async fn get(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, bucket: &Bucket, ttl_secs: u64) -> Result<(), StoreError> {
        (**self).set(key, bucket, ttl_secs).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        (**self).close().await
    }
}

/// Serialize a bucket for storage.
///
/// JSON keeps the record self-describing; `serde_json` writes `f64` with
/// enough digits to round-trip exactly.
pub fn encode(bucket: &Bucket) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(bucket).map_err(|e| StoreError::Backend(format!("encode bucket: {}", e)))
}

/// Parse a stored record.
///
/// # Errors
/// [`StoreError::Malformed`] when the bytes are not a bucket record.
pub fn decode(bytes: &[u8]) -> Result<Bucket, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Malformed(e.to_string()))
}

#[derive(Debug, Clone)]
struct Entry {
    bytes: Vec<u8>,
    expires_at_millis: u64,
}

/// Minimum spacing between sweeps of expired records.
const SWEEP_INTERVAL_MILLIS: u64 = 1_000;

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    fail_next: Option<StoreError>,
    failing: Option<StoreError>,
    closed: bool,
    close_count: usize,
    last_sweep_millis: u64,
}

impl Inner {
    /// Drop every expired record, at most once per [`SWEEP_INTERVAL_MILLIS`].
    fn sweep(&mut self, now: u64) {
        if now.saturating_sub(self.last_sweep_millis) < SWEEP_INTERVAL_MILLIS {
            return;
        }
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at_millis > now);
        self.last_sweep_millis = now;
        let purged = before - self.entries.len();
        if purged > 0 {
            tracing::trace!(purged, live = self.entries.len(), "purged expired bucket records");
        }
    }
}

/// In-process store with simulated expiry.
///
/// The stand-in for the shared store in tests and single-instance
/// deployments. Records are kept encoded, exactly as a network store would
/// hold them, and expire against the injected [`Clock`]. Writes sweep out
/// expired records, so idle clients stop costing memory once their TTL ends.
#[derive(Clone, Debug)]
pub struct InMemoryBucketStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryBucketStore {
    fn default() -> Self {
        Self::new(SystemClock)
    }
}

impl InMemoryBucketStore {
    /// Create an empty store expiring records against `clock`.
    pub fn new<C: Clock + 'static>(clock: C) -> Self {
        Self { inner: Arc::new(Mutex::new(Inner::default())), clock: Arc::new(clock) }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store raw bytes under `key`, bypassing the codec.
    pub fn insert_raw(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>, ttl_secs: u64) {
        let expires_at_millis = self.expiry(ttl_secs);
        self.lock().entries.insert(key.into(), Entry { bytes: bytes.into(), expires_at_millis });
    }

    /// Remaining lifetime of `key`, or `None` if absent or expired.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_millis();
        self.lock()
            .entries
            .get(key)
            .filter(|e| e.expires_at_millis > now)
            .map(|e| Duration::from_millis(e.expires_at_millis - now))
    }

    /// Fail the next `get` or `set` with `error`, then behave normally.
    pub fn fail_next(&self, error: StoreError) {
        self.lock().fail_next = Some(error);
    }

    /// Fail every `get` and `set` with `error` until cleared with `None`.
    pub fn set_failing(&self, error: Option<StoreError>) {
        self.lock().failing = error;
    }

    /// Number of live (unexpired) records.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.lock().entries.values().filter(|e| e.expires_at_millis > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times [`BucketStore::close`] has been called.
    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    fn expiry(&self, ttl_secs: u64) -> u64 {
        self.clock.now_millis().saturating_add(ttl_secs.saturating_mul(1_000))
    }

    fn check_usable(inner: &mut Inner) -> Result<(), StoreError> {
        if inner.closed {
            return Err(StoreError::Unavailable("store closed".into()));
        }
        if let Some(err) = inner.fail_next.take() {
            return Err(err);
        }
        match &inner.failing {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn get(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        Self::check_usable(&mut guard)?;
        let bytes = match guard.entries.get(key) {
            Some(entry) if entry.expires_at_millis > now => entry.bytes.clone(),
            Some(_) => {
                guard.entries.remove(key);
                return Ok(None);
            }
            None => return Ok(None),
        };
        drop(guard);
        decode(&bytes).map(Some)
    }

    async fn set(&self, key: &str, bucket: &Bucket, ttl_secs: u64) -> Result<(), StoreError> {
        let bytes = encode(bucket)?;
        let now = self.clock.now_millis();
        let expires_at_millis = now.saturating_add(ttl_secs.saturating_mul(1_000));
        let mut guard = self.lock();
        Self::check_usable(&mut guard)?;
        guard.sweep(now);
        guard.entries.insert(key.to_string(), Entry { bytes, expires_at_millis });
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.lock();
        guard.closed = true;
        guard.close_count += 1;
        Ok(())
    }
}
