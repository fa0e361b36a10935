//! Deduplicator: encode a value, fingerprint it, and ask a repository whether it was seen
//! within the window, bounded by a per-call timeout.
//!
//! Calls keep no shared mutable state, so one instance can serve many tasks. Two calls
//! racing on the same unseen value may both get `false`; see
//! [`ExpiringKeyRepository::with_atomic_insert`] for the one strategy that can close it.

use crate::bloom::BloomFilterRepository;
use crate::config::{Config, StoreBackend, StrategyConfig};
use crate::cuckoo::CuckooFilterRepository;
use crate::encode::{JsonEncoder, ValueEncoder};
use crate::error::{DedupError, Result};
use crate::expiring::ExpiringKeyRepository;
use crate::fingerprint::{Fingerprint, Fingerprinter, ValueHasher};
use crate::metrics;
use crate::repository::{KeyRepository, Payload};
use crate::store::{BloomStore, CuckooStore, KeyStore, MemoryStore, RedisStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Smallest per-call timeout. Smaller requests are raised to it.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Window of the repository built when none is supplied.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);
/// Deadline used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

pub struct Deduplicator<E = JsonEncoder> {
    hasher: Arc<dyn ValueHasher>,
    repository: Arc<dyn KeyRepository>,
    encoder: E,
    timeout: Duration,
}

impl Deduplicator {
    pub fn builder() -> DeduplicatorBuilder {
        DeduplicatorBuilder::new()
    }

    /// Build store, repository and deduplicator from a loaded config.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let repository = match config.store.backend {
            StoreBackend::Memory => {
                build_repository(&config.strategy, Arc::new(MemoryStore::new())).await?
            }
            StoreBackend::Redis => {
                let url = config.store.resolved_url().ok_or_else(|| {
                    DedupError::Config("no store url for the redis backend".into())
                })?;
                let store = RedisStore::connect(&url).await?;
                info!(strategy = config.strategy.name(), "connected to redis");
                build_repository(&config.strategy, Arc::new(store)).await?
            }
        };
        let mut builder = Deduplicator::builder()
            .hasher(config.fingerprint.fingerprinter())
            .repository(repository);
        if let Some(timeout) = config.timeout() {
            builder = builder.timeout(timeout);
        }
        builder.build().await
    }
}

async fn build_repository<S>(
    strategy: &StrategyConfig,
    store: Arc<S>,
) -> Result<Arc<dyn KeyRepository>>
where
    S: KeyStore + BloomStore + CuckooStore + 'static,
{
    let repository: Arc<dyn KeyRepository> = match strategy {
        StrategyConfig::ExpiringKey {
            window_ms,
            key_prefix,
            atomic,
        } => {
            let mut repo = ExpiringKeyRepository::new(store, Duration::from_millis(*window_ms))?
                .with_atomic_insert(*atomic);
            if let Some(prefix) = key_prefix {
                repo = repo.with_key_prefix(prefix.as_bytes());
            }
            Arc::new(repo)
        }
        StrategyConfig::Bloom { .. } => {
            let opts = strategy
                .bloom_options()
                .ok_or_else(|| DedupError::Config("bloom options missing".into()))?;
            Arc::new(BloomFilterRepository::new(store, opts).await?)
        }
        StrategyConfig::Cuckoo { .. } => {
            let opts = strategy
                .cuckoo_options()
                .ok_or_else(|| DedupError::Config("cuckoo options missing".into()))?;
            Arc::new(CuckooFilterRepository::new(store, opts).await?)
        }
    };
    Ok(repository)
}

impl<E: ValueEncoder> Deduplicator<E> {
    /// Returns true when the value was seen within the repository's window. An `Err` means
    /// the answer is unknown.
    pub async fn is_duplicate<T: Serialize + ?Sized>(&self, value: &T) -> Result<bool> {
        self.is_duplicate_before(value, deadline_after(Instant::now(), self.timeout))
            .await
    }

    /// Like [`is_duplicate`](Self::is_duplicate) with the caller's own deadline; the
    /// earlier of it and the configured timeout applies.
    pub async fn is_duplicate_before<T: Serialize + ?Sized>(
        &self,
        value: &T,
        deadline: Instant,
    ) -> Result<bool> {
        let start = std::time::Instant::now();
        let strategy = self.repository.strategy();
        let result = self.check(value, deadline).await;
        let elapsed = start.elapsed().as_secs_f64();
        match &result {
            Ok(true) => metrics::record_check(strategy, "duplicate", elapsed),
            Ok(false) => metrics::record_check(strategy, "unique", elapsed),
            Err(e) => {
                metrics::record_check(strategy, "error", elapsed);
                metrics::record_error(strategy, e.kind());
            }
        }
        result
    }

    /// Evict a value so its next check reports false. Only the cuckoo strategy supports it.
    pub async fn forget<T: Serialize + ?Sized>(&self, value: &T) -> Result<bool> {
        let payload = self.payload(value)?;
        let deadline = deadline_after(Instant::now(), self.timeout);
        bounded(deadline, self.timeout, self.repository.forget(&payload)).await
    }

    /// Fingerprint a value the way `is_duplicate` does, without touching the store.
    pub fn fingerprint<T: Serialize + ?Sized>(&self, value: &T) -> Result<Fingerprint> {
        let bytes = self.encoder.encode(value)?;
        self.hasher.fingerprint(&bytes)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn strategy(&self) -> &'static str {
        self.repository.strategy()
    }

    pub fn window(&self) -> Option<Duration> {
        self.repository.window()
    }

    fn payload<T: Serialize + ?Sized>(&self, value: &T) -> Result<Payload> {
        let bytes = self.encoder.encode(value)?;
        let key = self.hasher.fingerprint(&bytes)?;
        Ok(Payload::new(key, bytes))
    }

    async fn check<T: Serialize + ?Sized>(&self, value: &T, deadline: Instant) -> Result<bool> {
        let payload = self.payload(value)?;
        let now = Instant::now();
        let deadline = deadline.min(deadline_after(now, self.timeout));
        let budget = deadline.saturating_duration_since(now);
        let duplicate = bounded(deadline, budget, self.repository.is_duplicate(&payload)).await?;
        debug!(key = %payload.key, duplicate, "checked");
        Ok(duplicate)
    }
}

fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

/// Run a store call until `deadline`. On expiry the call is dropped, not left running.
async fn bounded<F>(deadline: Instant, budget: Duration, fut: F) -> Result<bool>
where
    F: std::future::Future<Output = Result<bool>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(budget_ms = budget.as_millis() as u64, "store call timed out");
            Err(DedupError::Timeout(budget))
        }
    }
}

/// Builds a [`Deduplicator`], filling unset parts with defaults: Adler-32 over the whole
/// value, an expiring-key repository with a 5 minute window, a 1 minute timeout.
pub struct DeduplicatorBuilder<E = JsonEncoder> {
    hasher: Option<Arc<dyn ValueHasher>>,
    repository: Option<Arc<dyn KeyRepository>>,
    timeout: Option<Duration>,
    encoder: E,
    default_store: Option<Arc<dyn KeyStore>>,
    store_url: Option<String>,
}

impl DeduplicatorBuilder {
    pub fn new() -> Self {
        Self {
            hasher: None,
            repository: None,
            timeout: None,
            encoder: JsonEncoder,
            default_store: None,
            store_url: None,
        }
    }
}

impl Default for DeduplicatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: ValueEncoder> DeduplicatorBuilder<E> {
    pub fn hasher(mut self, hasher: impl ValueHasher + 'static) -> Self {
        self.hasher = Some(Arc::new(hasher));
        self
    }

    pub fn repository(mut self, repository: Arc<dyn KeyRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Values under [`MIN_TIMEOUT`] are raised to it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn encoder<E2: ValueEncoder>(self, encoder: E2) -> DeduplicatorBuilder<E2> {
        DeduplicatorBuilder {
            hasher: self.hasher,
            repository: self.repository,
            timeout: self.timeout,
            encoder,
            default_store: self.default_store,
            store_url: self.store_url,
        }
    }

    /// Store for the default repository when no repository is set.
    pub fn default_store(mut self, store: Arc<dyn KeyStore>) -> Self {
        self.default_store = Some(store);
        self
    }

    /// Redis URL for the default repository. Falls back to REDUP_STORE_URL, then
    /// REDIS_HOST_URL.
    pub fn store_url(mut self, url: impl Into<String>) -> Self {
        self.store_url = Some(url.into());
        self
    }

    pub async fn build(self) -> Result<Deduplicator<E>> {
        let repository = match self.repository {
            Some(r) => r,
            None => {
                let store: Arc<dyn KeyStore> = match self.default_store {
                    Some(s) => s,
                    None => {
                        let url = self
                            .store_url
                            .or_else(|| std::env::var("REDUP_STORE_URL").ok())
                            .or_else(|| std::env::var("REDIS_HOST_URL").ok())
                            .filter(|u| !u.trim().is_empty())
                            .ok_or_else(|| {
                                DedupError::Config(
                                    "no repository and no store url for the default one".into(),
                                )
                            })?;
                        Arc::new(RedisStore::connect(&url).await?)
                    }
                };
                info!(
                    window_secs = DEFAULT_WINDOW.as_secs(),
                    "using default expiring-key repository"
                );
                Arc::new(ExpiringKeyRepository::new(store, DEFAULT_WINDOW)?)
            }
        };

        let requested = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let timeout = requested.max(MIN_TIMEOUT);
        if timeout != requested {
            debug!(
                requested_ms = requested.as_millis() as u64,
                "timeout raised to the 5 ms minimum"
            );
        }

        Ok(Deduplicator {
            hasher: self
                .hasher
                .unwrap_or_else(|| Arc::new(Fingerprinter::default())),
            repository,
            encoder: self.encoder,
            timeout,
        })
    }
}
