//! Scan configuration: chunk budgets, concurrency, device limits.
//!
//! Loaded from JSON (every field optional) and validated before a scan
//! starts. Byte sizes accept either integers or strings such as `"32MB"`.

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConfigError;
use crate::storage::page::PAGE_SIZE;

/// Smallest chunk size accepted, in bytes.
pub const MIN_CHUNK_SIZE: usize = 4096 * 1024;

/// Default chunk size: 32MB minus two pages, rounded to whole KB.
pub const DEFAULT_CHUNK_SIZE: usize = (32768 - (2 * PAGE_SIZE) / 1024) * 1024;

/// Default device memory budget for all in-flight tasks.
pub const DEFAULT_DEVICE_MEMORY: usize = 1 << 30;

/// Threads per thread group, matching the generated kernels.
pub const DEFAULT_THREADS_PER_GROUP: usize = 256;

/// Tunables for one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    /// Byte budget of a source chunk.
    #[serde(deserialize_with = "deserialize_size")]
    pub chunk_size: usize,
    /// Upper bound a chunk may be expanded to.
    #[serde(deserialize_with = "deserialize_size")]
    pub chunk_limit: usize,
    /// Tasks that may be staged or running at the same time.
    pub max_concurrent_tasks: usize,
    /// Device memory available to in-flight tasks.
    #[serde(deserialize_with = "deserialize_size")]
    pub device_memory_limit: usize,
    /// Minimum savings for `Chunk::shrink` to compact.
    #[serde(deserialize_with = "deserialize_size")]
    pub shrink_threshold: usize,
    /// Thread group width of the kernels.
    pub threads_per_group: usize,
    /// Ship raw pages (block format) instead of extracted rows.
    pub use_block_format: bool,
    /// Re-evaluate on the host when the device asks for it.
    pub cpu_fallback_enabled: bool,
    /// Progress streams (worker threads) of the emulated device.
    pub stream_threads: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_limit: 5 * DEFAULT_CHUNK_SIZE,
            max_concurrent_tasks: 4,
            device_memory_limit: DEFAULT_DEVICE_MEMORY,
            shrink_threshold: PAGE_SIZE,
            threads_per_group: DEFAULT_THREADS_PER_GROUP,
            use_block_format: false,
            cpu_fallback_enabled: true,
            stream_threads: 2,
        }
    }
}

impl ScanConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: ScanConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(ConfigError::BelowMinimum {
                name: "chunk_size",
                min: MIN_CHUNK_SIZE,
                value: self.chunk_size,
            });
        }
        if self.chunk_limit < self.chunk_size {
            return Err(ConfigError::LimitBelowChunkSize {
                limit: self.chunk_limit,
                size: self.chunk_size,
            });
        }
        for (name, value) in [
            ("max_concurrent_tasks", self.max_concurrent_tasks),
            ("threads_per_group", self.threads_per_group),
            ("stream_threads", self.stream_threads),
        ] {
            if value == 0 {
                return Err(ConfigError::BelowMinimum { name, min: 1, value });
            }
        }
        Ok(())
    }
}

/// Parse a byte size: `4096`, `64KB`, `32MB`, `1GB` (binary multiples).
pub fn parse_size(s: &str) -> Result<usize, ConfigError> {
    let trimmed = s.trim();
    let upper = trimmed.to_ascii_uppercase();
    let (digits, multiplier) = [("GB", 1usize << 30), ("MB", 1 << 20), ("KB", 1 << 10), ("B", 1)]
        .iter()
        .find_map(|(suffix, mult)| upper.strip_suffix(suffix).map(|p| (p.to_string(), *mult)))
        .unwrap_or((upper.clone(), 1));
    let num: usize = digits
        .trim()
        .replace('_', "")
        .parse()
        .map_err(|_| ConfigError::InvalidSize(trimmed.to_string()))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| ConfigError::InvalidSize(trimmed.to_string()))
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeRepr {
        Bytes(usize),
        Text(String),
    }

    match SizeRepr::deserialize(deserializer)? {
        SizeRepr::Bytes(n) => Ok(n),
        SizeRepr::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}
