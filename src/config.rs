//! Engine-wide configuration.
//!
//! Unlike [`zarrs`'s global `Config`](https://docs.rs/zarrs), this crate's
//! [`Config`] is owned by the [`Client`](crate::client::Client) and passed
//! by reference rather than kept behind a process-wide `OnceLock`: the lock
//! protocol and memory accounting both need a config that can differ between
//! two `Client`s open on the same process (e.g. in tests), so there is no
//! singleton here.

use std::time::Duration;

use sysinfo::System;

use crate::error::{Error, Result};

/// Non-configurable directory names beneath a storage root's collection directory.
pub const COLLECTIONS_DIRECTORY: &str = "collections";
/// Main payload directory for Arrays.
pub const ARRAY_DATA_DIRECTORY: &str = "array_data";
/// Main payload directory for VArrays.
pub const VARRAY_DATA_DIRECTORY: &str = "varray_data";
/// Attribute symlink index directory for Arrays.
pub const ARRAY_SYMLINKS_DIRECTORY: &str = "array_symlinks";
/// Attribute symlink index directory for VArrays.
pub const VARRAY_SYMLINKS_DIRECTORY: &str = "varray_symlinks";

/// The collection metadata version written by this build of the engine.
pub const CURRENT_METADATA_VERSION: &str = "1.0.0";

/// Engine-wide tunables, resolved once at [`Client`](crate::client::Client) construction.
#[derive(Debug, Clone)]
pub struct Config {
    workers: usize,
    write_lock_timeout: Duration,
    write_lock_check_interval: Duration,
    memory_limit: u64,
}

impl Config {
    /// Start building a [`Config`] with the engine's defaults.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Number of worker threads used for `VArray` tile fan-out.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// How long a writer waits for conflicting locks to clear before giving up.
    #[must_use]
    pub fn write_lock_timeout(&self) -> Duration {
        self.write_lock_timeout
    }

    /// How often a writer re-polls for conflicting locks while waiting.
    #[must_use]
    pub fn write_lock_check_interval(&self) -> Duration {
        self.write_lock_check_interval
    }

    /// The resolved memory limit, in bytes, used by the pre-flight memory check.
    #[must_use]
    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }
}

/// Builder for [`Config`].
///
/// `memory_limit` accepts either an explicit byte count or a human-friendly
/// form (`"512M"`, `"4G"`); a limit of zero, or one exceeding the machine's
/// available RAM + swap, downshifts to `available_ram + swap`, mirroring
/// the source client's memory-limit computation.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    workers: Option<usize>,
    write_lock_timeout: Duration,
    write_lock_check_interval: Duration,
    memory_limit: Option<String>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            workers: None,
            write_lock_timeout: Duration::from_secs(30),
            write_lock_check_interval: Duration::from_millis(50),
            memory_limit: None,
        }
    }
}

impl ConfigBuilder {
    /// Override the number of `VArray` fan-out worker threads (default: `cpu_count + 4`).
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Override the write-lock acquisition timeout.
    #[must_use]
    pub fn write_lock_timeout(mut self, timeout: Duration) -> Self {
        self.write_lock_timeout = timeout;
        self
    }

    /// Override the write-lock busy-wait poll interval.
    #[must_use]
    pub fn write_lock_check_interval(mut self, interval: Duration) -> Self {
        self.write_lock_check_interval = interval;
        self
    }

    /// Set the memory limit as an explicit byte count or a human-friendly string (e.g. `"512M"`).
    #[must_use]
    pub fn memory_limit(mut self, limit: impl Into<String>) -> Self {
        self.memory_limit = Some(limit.into());
        self
    }

    /// Resolve the configuration, consulting system memory if needed.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if a `memory_limit` string could not be parsed.
    pub fn build(self) -> Result<Config> {
        let mut system = System::new();
        system.refresh_memory();
        let available = system.available_memory() + system.free_swap();

        let requested = match &self.memory_limit {
            None => 0,
            Some(s) => parse_memory_limit(s)?,
        };
        let memory_limit = if requested == 0 || requested > available {
            available
        } else {
            requested
        };

        let workers = self
            .workers
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(4, |n| n.get() + 4));

        Ok(Config {
            workers,
            write_lock_timeout: self.write_lock_timeout,
            write_lock_check_interval: self.write_lock_check_interval,
            memory_limit,
        })
    }
}

/// Parse a human-friendly memory limit (`"512M"`, `"4G"`, or a plain byte count) into bytes.
///
/// # Errors
/// Returns [`Error::Validation`] if the string is not a valid byte count or
/// does not carry one of the recognised unit suffixes (`K`, `M`, `G`, `T`).
pub fn parse_memory_limit(s: &str) -> Result<u64> {
    let s = s.trim();
    if let Ok(bytes) = s.parse::<u64>() {
        return Ok(bytes);
    }
    let (digits, multiplier) = match s.chars().last() {
        Some('K' | 'k') => (&s[..s.len() - 1], 1024),
        Some('M' | 'm') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G' | 'g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        Some('T' | 't') => (&s[..s.len() - 1], 1024_u64 * 1024 * 1024 * 1024),
        _ => return Err(Error::Validation(format!("invalid memory limit: {s}"))),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::Validation(format!("invalid memory limit: {s}")))?;
    Ok(value * multiplier)
}

/// Pre-flight memory check: `prod(shape) * size_of(dtype)` must fit within `limit`.
///
/// # Errors
/// Returns [`Error::Memory`] if the requested allocation would exceed `limit`.
pub fn check_memory(shape: &[u64], dtype_size: u64, limit: u64) -> Result<()> {
    let requested = shape.iter().product::<u64>().saturating_mul(dtype_size);
    if requested > limit {
        return Err(Error::Memory { requested, limit });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixed_limits() {
        assert_eq!(parse_memory_limit("100").unwrap(), 100);
        assert_eq!(parse_memory_limit("1K").unwrap(), 1024);
        assert_eq!(parse_memory_limit("4G").unwrap(), 4 * 1024 * 1024 * 1024);
    }

    #[test]
    fn memory_preflight_rejects_oversized_request() {
        let err = check_memory(&[10_000, 10_000], 8, 100).unwrap_err();
        assert!(matches!(err, Error::Memory { .. }));
    }
}
