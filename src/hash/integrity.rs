//! Content digests for parts and whole files
//!
//! Supports XXHash3, XXHash64, BLAKE3 and SHA-256. Part digests are computed
//! strictly after the part's bytes have been fully read; whole-file digests
//! stream the file through a fixed buffer.

use crate::chunk::ByteRange;
use crate::config::HashAlgorithm;
use crate::error::{IoResultExt, Result, TransferError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// A content digest tagged with the algorithm that produced it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    /// The hash algorithm used
    pub algorithm: HashAlgorithm,
    /// Hash value as lowercase hex string
    pub hex: String,
}

impl Digest {
    /// Create a digest from an algorithm and hex value
    pub fn new(algorithm: HashAlgorithm, hex: impl Into<String>) -> Self {
        Self {
            algorithm,
            hex: hex.into().to_ascii_lowercase(),
        }
    }

    /// Parse the `label:hex` form produced by `Display`
    pub fn parse(value: &str) -> Option<Self> {
        let (label, hex) = value.split_once(':')?;
        let algorithm = HashAlgorithm::from_label(label)?;
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self::new(algorithm, hex))
    }

    /// Short prefix for log lines
    pub fn short(&self) -> &str {
        &self.hex[..self.hex.len().min(12)]
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm.label(), self.hex)
    }
}

/// Unified hasher that supports all algorithms
pub enum Hasher {
    /// XXHash3 128-bit
    XXHash3(xxhash_rust::xxh3::Xxh3),
    /// XXHash64
    XXHash64(xxhash_rust::xxh64::Xxh64),
    /// BLAKE3
    Blake3(Box<blake3::Hasher>),
    /// SHA-256
    Sha256(sha2::Sha256),
}

impl Hasher {
    /// Create a new hasher for the given algorithm
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::XXHash3 => Self::XXHash3(xxhash_rust::xxh3::Xxh3::new()),
            HashAlgorithm::XXHash64 => Self::XXHash64(xxhash_rust::xxh64::Xxh64::new(0)),
            HashAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
            HashAlgorithm::Sha256 => {
                use sha2::Digest;
                Self::Sha256(sha2::Sha256::new())
            }
        }
    }

    /// Get the algorithm this hasher uses
    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            Self::XXHash3(_) => HashAlgorithm::XXHash3,
            Self::XXHash64(_) => HashAlgorithm::XXHash64,
            Self::Blake3(_) => HashAlgorithm::Blake3,
            Self::Sha256(_) => HashAlgorithm::Sha256,
        }
    }

    /// Update the hasher with more data
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::XXHash3(h) => h.update(data),
            Self::XXHash64(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
            Self::Sha256(h) => {
                use sha2::Digest;
                h.update(data);
            }
        }
    }

    /// Finalize into a tagged digest
    pub fn finalize(self) -> Digest {
        let algorithm = self.algorithm();
        let hex = match self {
            Self::XXHash3(h) => format!("{:032x}", h.digest128()),
            Self::XXHash64(h) => format!("{:016x}", h.digest()),
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
            Self::Sha256(h) => {
                use sha2::Digest;
                hex::encode(h.finalize())
            }
        };
        Digest { algorithm, hex }
    }
}

/// Compute the digest of data in memory
pub fn hash_bytes(data: &[u8], algorithm: HashAlgorithm) -> Digest {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Compute the whole-file digest
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<Digest> {
    let file = File::open(path).with_path(path)?;
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, file);
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer).with_path(path)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

/// Compute the digest of one byte range of a file
pub fn hash_file_range(path: &Path, range: ByteRange, algorithm: HashAlgorithm) -> Result<Digest> {
    let mut file = File::open(path).with_path(path)?;
    file.seek(SeekFrom::Start(range.start)).with_path(path)?;

    let mut reader = file.take(range.len());
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE.min(range.len() as usize).max(1)];
    let mut total = 0u64;

    loop {
        let bytes_read = reader.read(&mut buffer).with_path(path)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }

    if total != range.len() {
        return Err(TransferError::precondition(format!(
            "'{}' ended after {} of {} bytes in range {}",
            path.display(),
            total,
            range.len(),
            range
        )));
    }

    Ok(hasher.finalize())
}

/// Verify a file against an expected digest, using the expected algorithm
pub fn verify_file(path: &Path, expected: &Digest) -> Result<Option<Digest>> {
    let actual = hash_file(path, expected.algorithm)?;
    if &actual == expected {
        Ok(None)
    } else {
        Ok(Some(actual))
    }
}

/// Streaming hasher that also counts bytes
pub struct StreamingHasher {
    hasher: Hasher,
    bytes_processed: u64,
}

impl StreamingHasher {
    /// Create a new streaming hasher
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            hasher: Hasher::new(algorithm),
            bytes_processed: 0,
        }
    }

    /// Process a chunk of data
    pub fn process(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    /// Get bytes processed so far
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    /// Finalize and get the digest
    pub fn finalize(self) -> Digest {
        self.hasher.finalize()
    }
}
