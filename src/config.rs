//! Configuration for bidi read sessions and appendable uploads.
//!
//! Every section has a `Default`, a `test()` preset with small sizes and fast
//! retries, and a `high_throughput()` preset. Durations serialize as
//! milliseconds.
//!
//! ## Sources
//!
//! ```text
//! BidiConfig::default() ──► from_toml_str / load(path) ──► from_env overlay ──► validate()
//! ```
//!
//! Environment overrides:
//! - `BIDI_RETRY_MAX_ATTEMPTS`
//! - `BIDI_RETRY_INITIAL_BACKOFF_MS`
//! - `BIDI_RETRY_MAX_BACKOFF_MS`
//! - `BIDI_RETRY_TOTAL_TIMEOUT_MS`
//! - `BIDI_MAX_REDIRECTS`
//! - `BIDI_CHECKSUM_ENABLED`

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * KIB;

/// Wire alignment of appended data.
pub const DEFAULT_BLOCK_SIZE: usize = 256 * KIB;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BidiConfig {
    pub retry: RetrySettings,
    pub read: ReadSessionConfig,
    pub append: AppendConfig,
}

impl BidiConfig {
    /// Configuration for tests (small buffers, fast retries)
    pub fn test() -> Self {
        BidiConfig {
            retry: RetrySettings::test(),
            read: ReadSessionConfig::default(),
            append: AppendConfig::test(),
        }
    }

    pub fn high_throughput() -> Self {
        BidiConfig {
            retry: RetrySettings::default(),
            read: ReadSessionConfig::default(),
            append: AppendConfig::high_throughput(),
        }
    }

    pub fn from_toml_str(s: &str) -> StorageResult<Self> {
        let config: BidiConfig = toml::from_str(s)
            .map_err(|e| StorageError::InvalidArgument(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StorageError::InvalidArgument(format!("unable to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Overlay `BIDI_*` environment variables on top of `self`.
    pub fn from_env(mut self) -> StorageResult<Self> {
        if let Some(v) = env_parse::<i32>("BIDI_RETRY_MAX_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = env_parse::<u64>("BIDI_RETRY_INITIAL_BACKOFF_MS")? {
            self.retry.initial_backoff = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("BIDI_RETRY_MAX_BACKOFF_MS")? {
            self.retry.max_backoff = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("BIDI_RETRY_TOTAL_TIMEOUT_MS")? {
            self.retry.total_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u32>("BIDI_MAX_REDIRECTS")? {
            self.read.max_redirects = v;
            self.append.max_redirects = v;
        }
        if let Some(v) = env_parse::<bool>("BIDI_CHECKSUM_ENABLED")? {
            self.read.checksum_validation = v;
            self.append.chunking.checksum_enabled = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> StorageResult<()> {
        self.retry.validate()?;
        self.append.validate()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> StorageResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| StorageError::InvalidArgument(format!("{} has invalid value {:?}", key, raw))),
        Err(_) => Ok(None),
    }
}

/// Jitter applied to computed backoff delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterMode {
    /// Use the computed delay as-is
    None,
    /// Uniformly distributed in `[0, delay)`
    Uniform,
}

/// Retry budget for one logical operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
    /// Zero means no time budget
    #[serde(with = "duration_millis")]
    pub total_timeout: Duration,
    pub retry_delay_multiplier: f64,
    /// `<= 0` means unlimited attempts
    pub max_attempts: i32,
    pub jitter: JitterMode,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
            total_timeout: Duration::from_secs(50),
            retry_delay_multiplier: 2.0,
            max_attempts: 6,
            jitter: JitterMode::Uniform,
        }
    }
}

impl RetrySettings {
    pub fn test() -> Self {
        RetrySettings {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
            total_timeout: Duration::from_secs(30),
            retry_delay_multiplier: 2.0,
            max_attempts: 0,
            jitter: JitterMode::None,
        }
    }

    /// Single attempt, no backoff
    pub fn attempt_once() -> Self {
        RetrySettings {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            total_timeout: Duration::ZERO,
            retry_delay_multiplier: 1.0,
            max_attempts: 1,
            jitter: JitterMode::None,
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        if !(self.retry_delay_multiplier >= 1.0) {
            return Err(StorageError::InvalidArgument(format!(
                "retry_delay_multiplier must be >= 1.0 (was {})",
                self.retry_delay_multiplier
            )));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(StorageError::InvalidArgument(format!(
                "initial_backoff must be <= max_backoff ({:?} > {:?})",
                self.initial_backoff, self.max_backoff
            )));
        }
        Ok(())
    }
}

/// Read session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadSessionConfig {
    /// Consecutive redirects followed before the error is retried normally
    pub max_redirects: u32,
    /// Validate the CRC32C of every received range chunk
    pub checksum_validation: bool,
}

impl Default for ReadSessionConfig {
    fn default() -> Self {
        ReadSessionConfig {
            max_redirects: 3,
            checksum_validation: true,
        }
    }
}

/// Segmenting of appended bytes into wire chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Block alignment of emitted segments (default: 256KiB)
    pub alignment_bytes: usize,
    /// Upper bound of a single segment; multiple of `alignment_bytes` (default: 2MiB)
    pub max_segment_bytes: usize,
    /// Pending bytes needed before aligned segments are emitted
    pub min_flush_bytes: usize,
    /// Compute a CRC32C for every segment
    pub checksum_enabled: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig {
            alignment_bytes: DEFAULT_BLOCK_SIZE,
            max_segment_bytes: 2 * MIB,
            min_flush_bytes: DEFAULT_BLOCK_SIZE,
            checksum_enabled: true,
        }
    }
}

impl ChunkingConfig {
    pub fn test() -> Self {
        ChunkingConfig {
            alignment_bytes: 16,
            max_segment_bytes: 64,
            min_flush_bytes: 16,
            checksum_enabled: true,
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.alignment_bytes == 0 || self.max_segment_bytes == 0 {
            return Err(StorageError::InvalidArgument(
                "alignment_bytes and max_segment_bytes must be > 0".to_string(),
            ));
        }
        let rem = self.max_segment_bytes % self.alignment_bytes;
        if rem != 0 {
            return Err(StorageError::InvalidArgument(format!(
                "max_segment_bytes % alignment_bytes == 0 ({} % {} == {})",
                self.max_segment_bytes, self.alignment_bytes, rem
            )));
        }
        Ok(())
    }
}

/// Appendable upload settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppendConfig {
    /// Bytes allowed in flight before `write` waits for acknowledgement (default: 16MiB)
    pub max_pending_bytes: u64,
    /// Request a flush after this many bytes were enqueued since the last one
    pub flush_interval_bytes: u64,
    pub max_redirects: u32,
    pub chunking: ChunkingConfig,
}

impl Default for AppendConfig {
    fn default() -> Self {
        AppendConfig {
            max_pending_bytes: 16 * MIB as u64,
            flush_interval_bytes: 4 * MIB as u64,
            max_redirects: 3,
            chunking: ChunkingConfig::default(),
        }
    }
}

impl AppendConfig {
    pub fn test() -> Self {
        AppendConfig {
            max_pending_bytes: 512,
            flush_interval_bytes: 128,
            max_redirects: 3,
            chunking: ChunkingConfig::test(),
        }
    }

    pub fn high_throughput() -> Self {
        AppendConfig {
            max_pending_bytes: 64 * MIB as u64,
            flush_interval_bytes: 16 * MIB as u64,
            max_redirects: 3,
            chunking: ChunkingConfig {
                max_segment_bytes: 4 * MIB,
                min_flush_bytes: 2 * MIB,
                ..ChunkingConfig::default()
            },
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        self.chunking.validate()?;
        if self.max_pending_bytes < self.chunking.max_segment_bytes as u64 {
            return Err(StorageError::InvalidArgument(format!(
                "max_pending_bytes ({}) must hold at least one segment ({})",
                self.max_pending_bytes, self.chunking.max_segment_bytes
            )));
        }
        Ok(())
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
