//! Exact deduplication over expiring keys.
//!
//! A key is a duplicate while it exists in the store. The first sighting writes it with a
//! TTL of one window; later hits never re-arm the TTL, so the window runs from the first
//! sighting.

use crate::error::{DedupError, Result};
use crate::repository::{KeyRepository, Payload};
use crate::store::KeyStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, Span, debug, error, info_span};

/// Smallest accepted deduplication window. Smaller windows are rejected, not clamped.
pub const MIN_WINDOW: Duration = Duration::from_millis(5);

pub struct ExpiringKeyRepository {
    store: Arc<dyn KeyStore>,
    window: Duration,
    key_prefix: Vec<u8>,
    atomic: bool,
    span: Span,
}

impl ExpiringKeyRepository {
    pub fn new(store: Arc<dyn KeyStore>, window: Duration) -> Result<Self> {
        if window < MIN_WINDOW {
            return Err(DedupError::Config(format!(
                "deduplication window {:?} is below the {:?} minimum",
                window, MIN_WINDOW
            )));
        }
        Ok(Self {
            store,
            window,
            key_prefix: Vec::new(),
            atomic: false,
            span: info_span!("dedup", strategy = "expiring_key"),
        })
    }

    /// Namespace stored keys as `prefix ++ fingerprint`.
    pub fn with_key_prefix(mut self, prefix: impl Into<Vec<u8>>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Use one `SET NX` round trip instead of exists-then-set. Closes the race between
    /// concurrent first sightings of the same value.
    pub fn with_atomic_insert(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    /// Span that all log events of this repository are recorded in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Number of live keys in the store.
    pub async fn len(&self) -> Result<u64> {
        Ok(self.store.key_count().await?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Remaining time before a payload's key stops counting as a duplicate.
    pub async fn remaining(&self, payload: &Payload) -> Result<Option<Duration>> {
        let key = self.store_key(payload)?;
        Ok(self.store.time_to_live(&key).await?)
    }

    fn store_key(&self, payload: &Payload) -> Result<Vec<u8>> {
        let fp = payload.checked_key()?;
        let mut key = Vec::with_capacity(self.key_prefix.len() + fp.len());
        key.extend_from_slice(&self.key_prefix);
        key.extend_from_slice(fp);
        Ok(key)
    }

    async fn check(&self, payload: &Payload) -> Result<bool> {
        let key = self.store_key(payload)?;

        if self.atomic {
            let written = self
                .store
                .set_if_absent(&key, &payload.value, self.window)
                .await
                .inspect_err(|e| error!(error = %e, "kv insert-if-absent failed"))?;
            debug!(key = %payload.key, duplicate = !written, "kv atomic check");
            return Ok(!written);
        }

        let exists = self
            .store
            .exists(&key)
            .await
            .inspect_err(|e| error!(error = %e, "kv lookup failed"))?;
        if exists {
            debug!(key = %payload.key, "kv hit");
            return Ok(true);
        }

        self.store
            .set_with_expiry(&key, &payload.value, self.window)
            .await
            .inspect_err(|e| error!(error = %e, "kv insert failed"))?;
        debug!(key = %payload.key, window_ms = self.window.as_millis() as u64, "kv recorded");
        Ok(false)
    }
}

#[async_trait]
impl KeyRepository for ExpiringKeyRepository {
    async fn is_duplicate(&self, payload: &Payload) -> Result<bool> {
        self.check(payload).instrument(self.span.clone()).await
    }

    fn strategy(&self) -> &'static str {
        "expiring_key"
    }

    fn window(&self) -> Option<Duration> {
        Some(self.window)
    }
}
