//! Fingerprinting: turn serialized value bytes into a short, stable store key.
//!
//! At most `read_limit` leading bytes are hashed. Values sharing an identical prefix of
//! that length alias to the same fingerprint; lower limits hash faster and collide more.

use crate::error::{DedupError, Result};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::io::{self, Read, Write};

/// Least number of bytes hashed, whatever limit the caller asks for.
pub const MIN_READ_LIMIT: u64 = 64;

/// Raw digest bytes used verbatim as the store key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hex form for logs. Never used as the stored key.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Maps serialized value bytes to a fingerprint. Must be deterministic.
pub trait ValueHasher: Send + Sync {
    fn fingerprint(&self, value: &[u8]) -> Result<Fingerprint>;
}

impl<F> ValueHasher for F
where
    F: Fn(&[u8]) -> Result<Fingerprint> + Send + Sync,
{
    fn fingerprint(&self, value: &[u8]) -> Result<Fingerprint> {
        self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// 32-bit checksum: cheapest, highest collision rate.
    #[default]
    Adler32,
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Adler32 => "adler32",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            Algorithm::Adler32 => 4,
            Algorithm::Sha256 => 32,
            Algorithm::Sha512 => 64,
        }
    }
}

/// Fingerprint function over one of the built-in algorithms with a clamped read limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprinter {
    algorithm: Algorithm,
    read_limit: u64,
}

impl Fingerprinter {
    /// `read_limit` below [`MIN_READ_LIMIT`] is raised to it.
    pub fn new(algorithm: Algorithm, read_limit: u64) -> Self {
        Self {
            algorithm,
            read_limit: read_limit.max(MIN_READ_LIMIT),
        }
    }

    /// Hash the whole input.
    pub fn unbounded(algorithm: Algorithm) -> Self {
        Self::new(algorithm, u64::MAX)
    }

    pub fn adler32(read_limit: u64) -> Self {
        Self::new(Algorithm::Adler32, read_limit)
    }

    pub fn sha256(read_limit: u64) -> Self {
        Self::new(Algorithm::Sha256, read_limit)
    }

    pub fn sha512(read_limit: u64) -> Self {
        Self::new(Algorithm::Sha512, read_limit)
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn read_limit(&self) -> u64 {
        self.read_limit
    }

    /// Hash up to `read_limit` bytes from `reader`. Running out of input early is fine;
    /// any other read error is returned.
    pub fn fingerprint_reader<R: Read>(&self, reader: R) -> Result<Fingerprint> {
        let mut limited = reader.take(self.read_limit);
        let digest = match self.algorithm {
            Algorithm::Adler32 => {
                let mut w = AdlerWriter(adler2::Adler32::new());
                io::copy(&mut limited, &mut w).map_err(DedupError::Fingerprint)?;
                w.0.checksum().to_be_bytes().to_vec()
            }
            Algorithm::Sha256 => {
                let mut w = DigestWriter(Sha256::new());
                io::copy(&mut limited, &mut w).map_err(DedupError::Fingerprint)?;
                w.0.finalize().to_vec()
            }
            Algorithm::Sha512 => {
                let mut w = DigestWriter(Sha512::new());
                io::copy(&mut limited, &mut w).map_err(DedupError::Fingerprint)?;
                w.0.finalize().to_vec()
            }
        };
        Ok(Fingerprint(digest))
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::unbounded(Algorithm::Adler32)
    }
}

impl ValueHasher for Fingerprinter {
    fn fingerprint(&self, value: &[u8]) -> Result<Fingerprint> {
        self.fingerprint_reader(value)
    }
}

struct AdlerWriter(adler2::Adler32);

impl Write for AdlerWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct DigestWriter<D>(D);

impl<D: Digest> Write for DigestWriter<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
