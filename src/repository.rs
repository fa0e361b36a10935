//! Repository contract shared by the expiring-key, Bloom and Cuckoo strategies.

use crate::error::{DedupError, Result};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use std::time::Duration;

/// One value to deduplicate: its fingerprint and its serialized bytes.
/// Built per call and dropped when the call returns.
#[derive(Debug, Clone)]
pub struct Payload {
    pub key: Fingerprint,
    pub value: Vec<u8>,
}

impl Payload {
    pub fn new(key: Fingerprint, value: Vec<u8>) -> Self {
        Self { key, value }
    }

    /// Repositories only accept payloads carrying a key.
    pub(crate) fn checked_key(&self) -> Result<&[u8]> {
        if self.key.is_empty() {
            return Err(DedupError::InvalidPayload("empty fingerprint key"));
        }
        Ok(self.key.as_bytes())
    }
}

/// Membership check over one backend. Must be Send + Sync for use across tasks.
#[async_trait]
pub trait KeyRepository: Send + Sync {
    /// Returns true when the key was already recorded. Otherwise records it and returns false.
    async fn is_duplicate(&self, payload: &Payload) -> Result<bool>;

    /// Evict a recorded key. Returns false when it was not present.
    async fn forget(&self, _payload: &Payload) -> Result<bool> {
        Err(DedupError::Unsupported {
            operation: "forget",
            strategy: self.strategy(),
        })
    }

    /// Strategy label for logs and metrics.
    fn strategy(&self) -> &'static str;

    /// Deduplication window, when the strategy has one.
    fn window(&self) -> Option<Duration>;
}
