//! redup: duplicate detection over Redis.
//!
//! A [`Deduplicator`] encodes a value, fingerprints the bytes and asks a [`KeyRepository`]
//! whether the fingerprint was seen before. Three repositories ship: expiring keys (exact,
//! windowed), a Bloom filter (approximate, no deletion) and a Cuckoo filter (approximate,
//! deletable). Each runs over a store port with a Redis binding and an in-memory one.

pub mod bloom;
pub mod config;
pub mod cuckoo;
pub mod dedup;
pub mod encode;
pub mod error;
pub mod event;
pub mod expiring;
pub mod fingerprint;
pub mod metrics;
pub mod repository;
pub mod store;

pub use bloom::{BloomFilterRepository, BloomOptions};
pub use config::Config;
pub use cuckoo::{CuckooFilterRepository, CuckooOptions};
pub use dedup::{Deduplicator, DeduplicatorBuilder};
pub use encode::{JsonEncoder, ValueEncoder};
pub use error::{DedupError, Result, StoreError};
pub use expiring::ExpiringKeyRepository;
pub use fingerprint::{Algorithm, Fingerprint, Fingerprinter, ValueHasher};
pub use repository::{KeyRepository, Payload};
pub use store::{BloomStore, CuckooStore, KeyStore, MemoryStore, RedisStore};
