//! Bloom filter deduplication: approximate membership, no deletion.
//!
//! A member may be a false positive at the configured error rate; an inserted key is never
//! reported absent. Entries stay until the filter is reset outside this crate, so the
//! repository has no window of its own.

use crate::error::{DedupError, Result, StoreError};
use crate::repository::{KeyRepository, Payload};
use crate::store::BloomStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, Span, debug, error, info, info_span};

#[derive(Debug, Clone, PartialEq)]
pub struct BloomOptions {
    /// Store key of the reserved filter.
    pub filter_key: String,
    /// Target false positive rate, in (0, 1).
    pub error_rate: f64,
    /// Items the first sub-filter holds before the store grows the filter.
    pub capacity: u64,
    /// Growth factor for each added sub-filter.
    pub expansion: u32,
}

impl BloomOptions {
    pub fn new(filter_key: impl Into<String>, error_rate: f64, capacity: u64) -> Self {
        Self {
            filter_key: filter_key.into(),
            error_rate,
            capacity,
            expansion: 2,
        }
    }

    pub fn with_expansion(mut self, expansion: u32) -> Self {
        self.expansion = expansion;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.filter_key.is_empty() {
            return Err(DedupError::Config("bloom filter key is empty".into()));
        }
        if !(self.error_rate > 0.0 && self.error_rate < 1.0) {
            return Err(DedupError::Config(format!(
                "bloom error rate {} must be between 0 and 1",
                self.error_rate
            )));
        }
        if self.capacity == 0 {
            return Err(DedupError::Config("bloom capacity must be positive".into()));
        }
        if self.expansion == 0 {
            return Err(DedupError::Config("bloom expansion must be at least 1".into()));
        }
        Ok(())
    }
}

pub struct BloomFilterRepository {
    store: Arc<dyn BloomStore>,
    options: BloomOptions,
    span: Span,
}

impl BloomFilterRepository {
    /// Reserve the filter and return the repository. An already reserved filter under the
    /// same key is reused as is.
    pub async fn new(store: Arc<dyn BloomStore>, options: BloomOptions) -> Result<Self> {
        let span = info_span!("dedup", strategy = "bloom", filter = %options.filter_key);
        Self::with_span(store, options, span).await
    }

    pub async fn with_span(
        store: Arc<dyn BloomStore>,
        options: BloomOptions,
        span: Span,
    ) -> Result<Self> {
        options.validate()?;
        let reserve = store.bf_reserve(
            &options.filter_key,
            options.error_rate,
            options.capacity,
            options.expansion,
        );
        match reserve.instrument(span.clone()).await {
            Ok(()) => span.in_scope(|| {
                info!(
                    error_rate = options.error_rate,
                    capacity = options.capacity,
                    expansion = options.expansion,
                    "bloom filter reserved"
                )
            }),
            Err(StoreError::FilterExists(_)) => {
                span.in_scope(|| info!("bloom filter already exists, reusing it"))
            }
            Err(e) => {
                span.in_scope(|| error!(error = %e, "bloom filter reservation failed"));
                return Err(e.into());
            }
        }
        Ok(Self {
            store,
            options,
            span,
        })
    }

    pub fn options(&self) -> &BloomOptions {
        &self.options
    }

    async fn check(&self, payload: &Payload) -> Result<bool> {
        let key = payload.checked_key()?;
        let filter = &self.options.filter_key;

        let exists = self
            .store
            .bf_exists(filter, key)
            .await
            .inspect_err(|e| error!(error = %e, "bf lookup failed"))?;
        if exists {
            debug!(key = %payload.key, "bf hit");
            return Ok(true);
        }

        self.store
            .bf_add(filter, key)
            .await
            .inspect_err(|e| error!(error = %e, "bf insert failed"))?;
        debug!(key = %payload.key, "bf recorded");
        Ok(false)
    }
}

#[async_trait]
impl KeyRepository for BloomFilterRepository {
    async fn is_duplicate(&self, payload: &Payload) -> Result<bool> {
        self.check(payload).instrument(self.span.clone()).await
    }

    fn strategy(&self) -> &'static str {
        "bloom"
    }

    fn window(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::store::MemoryStore;

    /// Reserves fine, then fails every filter call.
    struct DownFilterStore;

    #[async_trait]
    impl BloomStore for DownFilterStore {
        async fn bf_reserve(&self, _: &str, _: f64, _: u64, _: u32) -> Result<(), StoreError> {
            Ok(())
        }
        async fn bf_add(&self, _: &str, _: &[u8]) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection reset".into()))
        }
        async fn bf_exists(&self, _: &str, _: &[u8]) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection reset".into()))
        }
    }

    fn payload(key: &str) -> Payload {
        Payload::new(Fingerprint::from_bytes(key.as_bytes()), Vec::new())
    }

    #[tokio::test]
    async fn capacity_four_distinct_keys() {
        let repo = BloomFilterRepository::new(
            Arc::new(MemoryStore::new()),
            BloomOptions::new("example_bf", 0.001, 4),
        )
        .await
        .unwrap();
        let keys = ["Nairobi", "Mombasa", "Kisumu", "Nakuru"];
        for k in keys {
            assert!(!repo.is_duplicate(&payload(k)).await.unwrap(), "{k}");
        }
        for k in keys {
            assert!(repo.is_duplicate(&payload(k)).await.unwrap(), "{k}");
        }
    }

    #[tokio::test]
    async fn member_stays_member() {
        let repo = BloomFilterRepository::new(
            Arc::new(MemoryStore::new()),
            BloomOptions::new("bf", 0.01, 100),
        )
        .await
        .unwrap();
        assert!(!repo.is_duplicate(&payload("k")).await.unwrap());
        for i in 0..50 {
            repo.is_duplicate(&payload(&format!("other-{i}"))).await.unwrap();
            assert!(repo.is_duplicate(&payload("k")).await.unwrap());
        }
        assert_eq!(repo.window(), None);
    }

    #[tokio::test]
    async fn existing_filter_is_reused() {
        let store = Arc::new(MemoryStore::new());
        let opts = BloomOptions::new("bf", 0.01, 100);
        let first = BloomFilterRepository::new(store.clone(), opts.clone())
            .await
            .unwrap();
        assert!(!first.is_duplicate(&payload("k")).await.unwrap());
        let second = BloomFilterRepository::new(store, opts).await.unwrap();
        assert!(second.is_duplicate(&payload("k")).await.unwrap());
    }

    #[tokio::test]
    async fn invalid_options_are_rejected_before_reserving() {
        let store = Arc::new(MemoryStore::new());
        for opts in [
            BloomOptions::new("bf", 0.0, 4),
            BloomOptions::new("bf", 1.0, 4),
            BloomOptions::new("bf", 0.01, 0),
            BloomOptions::new("", 0.01, 4),
            BloomOptions::new("bf", 0.01, 4).with_expansion(0),
        ] {
            let err = BloomFilterRepository::new(store.clone(), opts)
                .await
                .err()
                .unwrap();
            assert_eq!(err.kind(), "config");
        }
        assert_eq!(store.ops(), 0);
    }

    #[tokio::test]
    async fn forget_is_unsupported() {
        let repo = BloomFilterRepository::new(
            Arc::new(MemoryStore::new()),
            BloomOptions::new("bf", 0.01, 4),
        )
        .await
        .unwrap();
        assert_eq!(
            repo.forget(&payload("k")).await.unwrap_err().kind(),
            "unsupported"
        );
    }

    #[tokio::test]
    async fn store_errors_propagate() {
        let repo = BloomFilterRepository::new(
            Arc::new(DownFilterStore),
            BloomOptions::new("bf", 0.01, 4),
        )
        .await
        .unwrap();
        let err = repo.is_duplicate(&payload("k")).await.unwrap_err();
        assert!(matches!(err, DedupError::Store(StoreError::Unavailable(_))));
    }
}
