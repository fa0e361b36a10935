//! Cuckoo filter deduplication: approximate membership with deletion.
//!
//! Sized by capacity and bucket size; the false positive rate follows from load factor
//! and bucket size rather than being set directly. The window is advisory: the store
//! does not expire filter entries.

use crate::error::{DedupError, Result, StoreError};
use crate::fingerprint::Fingerprint;
use crate::repository::{KeyRepository, Payload};
use crate::store::CuckooStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, Span, debug, error, info, info_span};

#[derive(Debug, Clone, PartialEq)]
pub struct CuckooOptions {
    pub filter_key: String,
    pub capacity: u64,
    /// Items per bucket, 1..=255. Larger buckets fill better and raise the error rate.
    pub bucket_size: u32,
    pub window: Duration,
}

impl CuckooOptions {
    pub fn new(filter_key: impl Into<String>, capacity: u64, window: Duration) -> Self {
        Self {
            filter_key: filter_key.into(),
            capacity,
            bucket_size: 2,
            window,
        }
    }

    pub fn with_bucket_size(mut self, bucket_size: u32) -> Self {
        self.bucket_size = bucket_size;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.filter_key.is_empty() {
            return Err(DedupError::Config("cuckoo filter key is empty".into()));
        }
        if self.capacity == 0 {
            return Err(DedupError::Config("cuckoo capacity must be positive".into()));
        }
        if !(1..=255).contains(&self.bucket_size) {
            return Err(DedupError::Config(format!(
                "cuckoo bucket size {} must be between 1 and 255",
                self.bucket_size
            )));
        }
        Ok(())
    }
}

pub struct CuckooFilterRepository {
    store: Arc<dyn CuckooStore>,
    options: CuckooOptions,
    span: Span,
}

impl CuckooFilterRepository {
    /// Reserve the filter and return the repository. An already reserved filter under the
    /// same key is reused as is.
    pub async fn new(store: Arc<dyn CuckooStore>, options: CuckooOptions) -> Result<Self> {
        let span = info_span!("dedup", strategy = "cuckoo", filter = %options.filter_key);
        Self::with_span(store, options, span).await
    }

    pub async fn with_span(
        store: Arc<dyn CuckooStore>,
        options: CuckooOptions,
        span: Span,
    ) -> Result<Self> {
        options.validate()?;
        let reserve = store.cf_reserve(&options.filter_key, options.capacity, options.bucket_size);
        match reserve.instrument(span.clone()).await {
            Ok(()) => span.in_scope(|| {
                info!(
                    capacity = options.capacity,
                    bucket_size = options.bucket_size,
                    "cuckoo filter reserved"
                )
            }),
            Err(StoreError::FilterExists(_)) => {
                span.in_scope(|| info!("cuckoo filter already exists, reusing it"))
            }
            Err(e) => {
                span.in_scope(|| error!(error = %e, "cuckoo filter reservation failed"));
                return Err(e.into());
            }
        }
        Ok(Self {
            store,
            options,
            span,
        })
    }

    pub fn options(&self) -> &CuckooOptions {
        &self.options
    }

    /// Remove a key from the filter, e.g. to undo a mistaken insert. Returns false when
    /// the key was not present. Deleting a key that was never added can evict another key
    /// sharing its filter fingerprint.
    pub async fn delete(&self, key: &Fingerprint) -> Result<bool> {
        if key.is_empty() {
            return Err(DedupError::InvalidPayload("empty fingerprint key"));
        }
        let removed = self
            .store
            .cf_del(&self.options.filter_key, key.as_bytes())
            .instrument(self.span.clone())
            .await
            .inspect_err(|e| {
                self.span
                    .in_scope(|| error!(error = %e, key = %key, "cf delete failed"))
            })?;
        self.span
            .in_scope(|| debug!(key = %key, removed, "cf delete"));
        Ok(removed)
    }

    async fn check(&self, payload: &Payload) -> Result<bool> {
        let key = payload.checked_key()?;
        let filter = &self.options.filter_key;

        let exists = self
            .store
            .cf_exists(filter, key)
            .await
            .inspect_err(|e| error!(error = %e, "cf lookup failed"))?;
        if exists {
            debug!(key = %payload.key, "cf hit");
            return Ok(true);
        }

        self.store
            .cf_add(filter, key)
            .await
            .inspect_err(|e| error!(error = %e, "cf insert failed"))?;
        debug!(key = %payload.key, "cf recorded");
        Ok(false)
    }
}

#[async_trait]
impl KeyRepository for CuckooFilterRepository {
    async fn is_duplicate(&self, payload: &Payload) -> Result<bool> {
        self.check(payload).instrument(self.span.clone()).await
    }

    async fn forget(&self, payload: &Payload) -> Result<bool> {
        self.delete(&payload.key).await
    }

    fn strategy(&self) -> &'static str {
        "cuckoo"
    }

    fn window(&self) -> Option<Duration> {
        Some(self.options.window)
    }
}
