//! Configuration settings for bulkxfer
//!
//! Defines the transfer configuration value object consumed by the engine,
//! plus the CLI arguments of the demonstration binary. The engine never reads
//! environment variables or files itself; the binary builds a
//! [`TransferConfig`] and injects it.

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Smallest part most object stores accept for a non-final part
pub const DEFAULT_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Largest single part most object stores accept
pub const DEFAULT_MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Largest part a derived plan will hold in memory at once
pub const DEFAULT_MAX_BUFFERED_PART_SIZE: u64 = 64 * 1024 * 1024;

/// Files below this size are uploaded in a single request
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 16 * 1024 * 1024;

/// bulkxfer - chunked, resumable object-storage transfers
#[derive(Parser, Debug, Clone)]
#[command(name = "bulkxfer")]
#[command(author = "Bulkxfer Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Chunked, resumable, integrity-checked bulk transfers")]
#[command(long_about = r#"
bulkxfer moves large files to and from an object store in concurrent parts.

Features:
  - Multipart uploads with ordered completion and abort on failure
  - Ranged, resumable downloads with a sidecar progress record
  - Content digests (SHA-256, BLAKE3, XXHash3) and a local transfer cache
  - Retry with exponential backoff and jitter
  - Direct transport through short-lived credential leases

Examples:
  bulkxfer --store /srv/objects upload ./big.bin datasets/big.bin
  bulkxfer --store /srv/objects download datasets/big.bin ./big.bin
  bulkxfer --store /srv/objects cache show
"#)]
pub struct CliArgs {
    /// Root directory of the filesystem-backed object store
    #[arg(long, env = "BULKXFER_STORE", value_name = "DIR")]
    pub store: PathBuf,

    /// Path of the transfer cache index
    #[arg(long, env = "BULKXFER_CACHE", value_name = "PATH")]
    pub cache: Option<PathBuf>,

    /// Maximum concurrent part operations (0 = auto-detect)
    #[arg(short = 't', long, default_value = "0", value_name = "NUM")]
    pub threads: usize,

    /// Fixed part size (e.g., 8M); derived from file size when omitted
    #[arg(long, value_name = "SIZE")]
    pub part_size: Option<String>,

    /// Minimum part size
    #[arg(long, default_value = "5M", value_name = "SIZE")]
    pub min_part_size: String,

    /// Cap on derived part sizes; every in-flight part is buffered whole
    #[arg(long, default_value = "64M", value_name = "SIZE")]
    pub max_buffered_part_size: String,

    /// Files below this size are uploaded in one request
    #[arg(long, default_value = "16M", value_name = "SIZE")]
    pub multipart_threshold: String,

    /// Retry failed part operations N times
    #[arg(long, default_value = "5", value_name = "NUM")]
    pub retries: u32,

    /// Upper bound for a single backoff wait (e.g., 30s, 2m)
    #[arg(long, default_value = "64s", value_name = "DURATION")]
    pub max_backoff: humantime::Duration,

    /// Use direct transport through credential leases when the store allows it
    #[arg(long)]
    pub direct: bool,

    /// Hash algorithm for content digests
    #[arg(long, value_enum, default_value = "sha256")]
    pub hash: HashAlgorithm,

    /// Keep the staging file when a download fails verification
    #[arg(long)]
    pub keep_mismatched: bool,

    /// Bandwidth limit (e.g., 100M for 100 MB/s)
    #[arg(long, value_name = "RATE")]
    pub bandwidth_limit: Option<String>,

    /// Show progress bars
    #[arg(short = 'p', long)]
    pub progress: bool,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Upload a local file to a remote object
    #[command(name = "upload")]
    Upload {
        /// Local file
        local: PathBuf,
        /// Remote object identity
        remote: String,
        /// Requested concurrency for this transfer
        #[arg(short = 'j', long, default_value = "4")]
        concurrency: usize,
    },

    /// Download a remote object to a local file
    #[command(name = "download")]
    Download {
        /// Remote object identity
        remote: String,
        /// Local destination file
        local: PathBuf,
        /// Requested concurrency for this transfer
        #[arg(short = 'j', long, default_value = "4")]
        concurrency: usize,
    },

    /// Inspect or edit the transfer cache
    #[command(name = "cache")]
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

/// Cache subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum CacheAction {
    /// List cached entries
    Show,
    /// Forget every entry for a local path
    Invalidate {
        /// Local path
        path: PathBuf,
    },
}

/// Hash algorithm for content digests
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// XXHash3 - Ultra fast, non-cryptographic (128-bit)
    #[value(name = "xxhash3")]
    XXHash3,
    /// XXHash64 - Fast, non-cryptographic (64-bit)
    #[value(name = "xxhash64")]
    XXHash64,
    /// BLAKE3 - Fast and cryptographically secure
    #[value(name = "blake3")]
    Blake3,
    /// SHA-256 - Standard cryptographic hash
    #[default]
    #[value(name = "sha256")]
    Sha256,
}

impl HashAlgorithm {
    /// Get the output size in bytes
    pub fn output_size(&self) -> usize {
        match self {
            Self::XXHash3 => 16,
            Self::XXHash64 => 8,
            Self::Blake3 => 32,
            Self::Sha256 => 32,
        }
    }

    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::XXHash3 => "XXHash3",
            Self::XXHash64 => "XXHash64",
            Self::Blake3 => "BLAKE3",
            Self::Sha256 => "SHA-256",
        }
    }

    /// Short lowercase label used in digest strings (`sha256:...`)
    pub fn label(&self) -> &'static str {
        match self {
            Self::XXHash3 => "xxh3",
            Self::XXHash64 => "xxh64",
            Self::Blake3 => "blake3",
            Self::Sha256 => "sha256",
        }
    }

    /// Parse a label produced by [`HashAlgorithm::label`]
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "xxh3" => Some(Self::XXHash3),
            "xxh64" => Some(Self::XXHash64),
            "blake3" => Some(Self::Blake3),
            "sha256" => Some(Self::Sha256),
            _ => None,
        }
    }
}

/// Jitter distribution applied on top of exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JitterMode {
    /// Exact exponential delay
    None,
    /// Uniform in `[0, delay]`
    #[default]
    Full,
    /// `delay / 2` plus uniform in `[0, delay / 2]`
    Equal,
}

/// What happens to a downloaded staging file that fails verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MismatchPolicy {
    /// Remove the staging file
    #[default]
    DeletePartial,
    /// Keep the staging file for inspection; it is never trusted or resumed
    RetainPartial,
}

/// Runtime transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Global cap on concurrent part/range operations across all transfers
    pub max_concurrency: usize,
    /// Minimum part size in bytes
    pub min_part_size: u64,
    /// Maximum part size in bytes (transport per-part limit)
    pub max_part_size: u64,
    /// Ceiling for derived part sizes, bounding per-worker buffers
    pub max_buffered_part_size: u64,
    /// Fixed part size; derived from size and concurrency when `None`
    pub part_size: Option<u64>,
    /// Uploads below this size use a single request
    pub multipart_threshold: u64,
    /// Retries allowed per part after the first attempt
    pub max_retry_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "humantime_serde_compat")]
    pub base_backoff: Duration,
    /// Upper bound for a computed backoff
    #[serde(with = "humantime_serde_compat")]
    pub max_backoff: Duration,
    /// Jitter distribution
    pub jitter: JitterMode,
    /// Attempts for the multipart completion transaction
    pub max_completion_attempts: u32,
    /// Allow the direct, lease-based transport
    pub enable_direct_transport: bool,
    /// Re-issue leases expiring within this window
    #[serde(with = "humantime_serde_compat")]
    pub lease_refresh_margin: Duration,
    /// Digest algorithm for parts and whole files
    pub hash_algorithm: HashAlgorithm,
    /// Download checksum-mismatch policy
    pub mismatch_policy: MismatchPolicy,
    /// Bandwidth limit in bytes/sec shared by all workers
    pub bandwidth_limit: Option<u64>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get().clamp(2, 16),
            min_part_size: DEFAULT_MIN_PART_SIZE,
            max_part_size: DEFAULT_MAX_PART_SIZE,
            max_buffered_part_size: DEFAULT_MAX_BUFFERED_PART_SIZE,
            part_size: None,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            max_retry_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(64),
            jitter: JitterMode::Full,
            max_completion_attempts: 3,
            enable_direct_transport: false,
            lease_refresh_margin: Duration::from_secs(60),
            hash_algorithm: HashAlgorithm::Sha256,
            mismatch_policy: MismatchPolicy::DeletePartial,
            bandwidth_limit: None,
        }
    }
}

impl TransferConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == 0 {
            return Err("max_concurrency must be greater than zero".to_string());
        }
        if self.min_part_size == 0 {
            return Err("min_part_size must be greater than zero".to_string());
        }
        if self.min_part_size > self.max_part_size {
            return Err(format!(
                "min_part_size ({}) exceeds max_part_size ({})",
                self.min_part_size, self.max_part_size
            ));
        }
        if self.max_buffered_part_size < self.min_part_size {
            return Err(format!(
                "max_buffered_part_size ({}) is below min_part_size ({})",
                self.max_buffered_part_size, self.min_part_size
            ));
        }
        if let Some(part_size) = self.part_size {
            if part_size < self.min_part_size || part_size > self.max_part_size {
                return Err(format!(
                    "part_size {} outside [{}, {}]",
                    part_size, self.min_part_size, self.max_part_size
                ));
            }
        }
        if self.base_backoff > self.max_backoff {
            return Err("base_backoff exceeds max_backoff".to_string());
        }
        if self.max_completion_attempts == 0 {
            return Err("max_completion_attempts must be at least 1".to_string());
        }
        if self.bandwidth_limit == Some(0) {
            return Err("bandwidth_limit must be greater than zero when set".to_string());
        }
        Ok(())
    }

    /// Create config from CLI arguments
    pub fn from_cli(args: &CliArgs) -> Result<Self, String> {
        let mut config = Self::default();

        if args.threads > 0 {
            config.max_concurrency = args.threads;
        }
        config.min_part_size =
            parse_size(&args.min_part_size).map_err(|e| format!("Invalid min part size: {}", e))?;
        config.max_buffered_part_size = parse_size(&args.max_buffered_part_size)
            .map_err(|e| format!("Invalid max buffered part size: {}", e))?;
        config.part_size = args
            .part_size
            .as_ref()
            .map(|s| parse_size(s))
            .transpose()
            .map_err(|e| format!("Invalid part size: {}", e))?;
        config.multipart_threshold = parse_size(&args.multipart_threshold)
            .map_err(|e| format!("Invalid multipart threshold: {}", e))?;
        config.max_retry_attempts = args.retries;
        config.max_backoff = args.max_backoff.into();
        config.base_backoff = config.base_backoff.min(config.max_backoff);
        config.enable_direct_transport = args.direct;
        config.hash_algorithm = args.hash;
        if args.keep_mismatched {
            config.mismatch_policy = MismatchPolicy::RetainPartial;
        }
        config.bandwidth_limit = args
            .bandwidth_limit
            .as_ref()
            .map(|s| parse_size(s))
            .transpose()
            .map_err(|e| format!("Invalid bandwidth limit: {}", e))?;

        config.validate()?;
        Ok(config)
    }
}

/// Parse human-readable size string to bytes
pub fn parse_size(size: &str) -> Result<u64, String> {
    let size = size.trim().to_uppercase();

    if size.is_empty() {
        return Err("Empty size string".to_string());
    }

    let (num_str, multiplier) = if size.ends_with("TB") || size.ends_with('T') {
        (size.trim_end_matches(['T', 'B']), 1024u64 * 1024 * 1024 * 1024)
    } else if size.ends_with("GB") || size.ends_with('G') {
        (size.trim_end_matches(['G', 'B']), 1024u64 * 1024 * 1024)
    } else if size.ends_with("MB") || size.ends_with('M') {
        (size.trim_end_matches(['M', 'B']), 1024u64 * 1024)
    } else if size.ends_with("KB") || size.ends_with('K') {
        (size.trim_end_matches(['K', 'B']), 1024u64)
    } else if size.ends_with('B') {
        (size.trim_end_matches('B'), 1u64)
    } else {
        // Assume bytes if no suffix
        (size.as_str(), 1u64)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number: {}", num_str))?;

    Ok((num * multiplier as f64) as u64)
}

/// Serde adapter storing durations as humantime strings ("1s", "500ms")
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
