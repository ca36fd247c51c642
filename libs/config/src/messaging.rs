//! Messaging Configuration Module
//!
//! Provides configuration loading and validation for the buffer pool and the
//! message handlers. Supports loading from TOML files with environment
//! variable overrides (`PTP_` prefix, `__` between nested keys, e.g.
//! `PTP_POOL__MAX_BUFFERS=32`).

use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "PTP";

/// Default payload capacity of a pooled buffer (64KB)
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;
pub const DEFAULT_INITIAL_BUFFERS: usize = 8;
pub const DEFAULT_MAX_BUFFERS: usize = 64;
pub const DEFAULT_MAX_COMPLETIONS_PER_POLL: usize = 256;
pub const DEFAULT_STRAY_COMPLETION_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_MAX_GAP_POLLS: usize = 256;

/// Top-level configuration for one messaging endpoint
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct MessagingConfig {
    pub pool: PoolConfig,
    pub handler: HandlerConfig,
    pub matching: MatchingConfig,
}

/// Buffer pool sizing and policies
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Buffers allocated when the pool is created
    pub initial_buffers: usize,
    /// Hard cap on buffers, only reachable with `GrowthPolicy::Growable`
    pub max_buffers: usize,
    /// Payload bytes each buffer can stage (header space is extra)
    pub buffer_capacity: usize,
    pub growth: GrowthPolicy,
    pub acquire: AcquirePolicy,
}

/// Whether the pool may allocate past its initial size
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GrowthPolicy {
    /// Never allocate after construction
    Fixed,
    /// Allocate one buffer at a time up to `max_buffers`
    #[default]
    Growable,
}

/// What `acquire()` does when nothing is free and the pool cannot grow
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AcquirePolicy {
    /// Wait for a release; `None` waits indefinitely
    Blocking {
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Fail immediately with a pool-exhausted error
    NonBlocking,
}

/// Message handler limits
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct HandlerConfig {
    /// Largest `payload_size` accepted from the wire; defaults to the buffer capacity
    pub max_payload_size: Option<u32>,
    /// Upper bound on transport completions drained by a single poll
    pub max_completions_per_poll: usize,
    /// How long a completion for an unregistered token is retried before it
    /// is dropped
    pub stray_completion_timeout_ms: u64,
}

/// Point-to-point matching settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct MatchingConfig {
    /// Receives kept posted even when no matched receive is waiting, so
    /// unexpected messages are drained off the transport
    pub prepost_receives: usize,
    /// Polls a channel may wait for a missing message before delivery
    /// resumes at the next one that did arrive
    pub max_gap_polls: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_buffers: DEFAULT_INITIAL_BUFFERS,
            max_buffers: DEFAULT_MAX_BUFFERS,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            growth: GrowthPolicy::Growable,
            acquire: AcquirePolicy::default(),
        }
    }
}

impl Default for AcquirePolicy {
    fn default() -> Self {
        Self::Blocking { timeout_ms: None }
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_payload_size: None,
            max_completions_per_poll: DEFAULT_MAX_COMPLETIONS_PER_POLL,
            stray_completion_timeout_ms: DEFAULT_STRAY_COMPLETION_TIMEOUT_MS,
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            prepost_receives: 1,
            max_gap_polls: DEFAULT_MAX_GAP_POLLS,
        }
    }
}

impl PoolConfig {
    /// Fixed-size, non-blocking pool: the shape used by most tests and demos
    pub fn fixed(buffers: usize, buffer_capacity: usize) -> Self {
        Self {
            initial_buffers: buffers,
            max_buffers: buffers,
            buffer_capacity,
            growth: GrowthPolicy::Fixed,
            acquire: AcquirePolicy::NonBlocking,
        }
    }

    /// Growable pool starting at `initial_buffers`
    pub fn growable(initial_buffers: usize, max_buffers: usize, buffer_capacity: usize) -> Self {
        Self {
            initial_buffers,
            max_buffers,
            buffer_capacity,
            growth: GrowthPolicy::Growable,
            acquire: AcquirePolicy::default(),
        }
    }

    pub fn with_acquire(mut self, acquire: AcquirePolicy) -> Self {
        self.acquire = acquire;
        self
    }

    /// Largest buffer count the pool may ever hold
    pub fn effective_max(&self) -> usize {
        match self.growth {
            GrowthPolicy::Fixed => self.initial_buffers,
            GrowthPolicy::Growable => self.max_buffers,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            bail!("pool.buffer_capacity must be greater than zero");
        }
        if self.max_buffers == 0 {
            bail!("pool.max_buffers must be greater than zero");
        }
        if self.initial_buffers > self.max_buffers {
            bail!(
                "pool.initial_buffers ({}) exceeds pool.max_buffers ({})",
                self.initial_buffers,
                self.max_buffers
            );
        }
        if self.growth == GrowthPolicy::Fixed && self.initial_buffers == 0 {
            bail!("a fixed pool needs at least one initial buffer");
        }
        if self.buffer_capacity > u32::MAX as usize {
            bail!("pool.buffer_capacity cannot exceed {} bytes", u32::MAX);
        }
        Ok(())
    }
}

impl AcquirePolicy {
    /// Blocking with an upper bound on the wait
    pub fn blocking_for(timeout: Duration) -> Self {
        Self::Blocking {
            timeout_ms: Some(timeout.as_millis() as u64),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self {
            AcquirePolicy::Blocking { timeout_ms } => timeout_ms.map(Duration::from_millis),
            AcquirePolicy::NonBlocking => None,
        }
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, AcquirePolicy::Blocking { .. })
    }
}

impl MessagingConfig {
    /// Load configuration from an optional TOML file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading messaging config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: MessagingConfig = builder
            .build()
            .context("Failed to build messaging configuration")?
            .try_deserialize()
            .context("Failed to deserialize messaging configuration")?;

        config.validate()?;
        debug!("Messaging config loaded: {:?}", config);
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: MessagingConfig =
            toml::from_str(source).context("Failed to parse messaging configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        if self.handler.max_completions_per_poll == 0 {
            bail!("handler.max_completions_per_poll must be greater than zero");
        }
        if self.matching.max_gap_polls == 0 {
            bail!("matching.max_gap_polls must be greater than zero");
        }
        if self.matching.prepost_receives > self.pool.effective_max() {
            bail!(
                "matching.prepost_receives ({}) exceeds the pool's buffer limit ({})",
                self.matching.prepost_receives,
                self.pool.effective_max()
            );
        }
        Ok(())
    }

    /// Largest payload accepted from the wire
    pub fn max_payload_size(&self) -> u32 {
        self.handler
            .max_payload_size
            .unwrap_or(self.pool.buffer_capacity.min(u32::MAX as usize) as u32)
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_prepost_receives(mut self, prepost_receives: usize) -> Self {
        self.matching.prepost_receives = prepost_receives;
        self
    }

    pub fn with_max_gap_polls(mut self, max_gap_polls: usize) -> Self {
        self.matching.max_gap_polls = max_gap_polls;
        self
    }

    /// Retry window for completions whose token was never registered
    pub fn stray_completion_timeout(&self) -> Duration {
        Duration::from_millis(self.handler.stray_completion_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = MessagingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.growth, GrowthPolicy::Growable);
        assert!(config.pool.acquire.is_blocking());
        assert_eq!(config.max_payload_size(), DEFAULT_BUFFER_CAPACITY as u32);
    }

    #[test]
    fn test_fixed_pool_caps_at_initial() {
        let pool = PoolConfig {
            max_buffers: 100,
            ..PoolConfig::fixed(4, 64)
        };
        assert_eq!(pool.effective_max(), 4);
        assert_eq!(PoolConfig::growable(2, 10, 64).effective_max(), 10);
    }

    #[test]
    fn test_parse_toml_with_policies() {
        let config = MessagingConfig::from_toml_str(
            r#"
            [pool]
            initial_buffers = 2
            max_buffers = 6
            buffer_capacity = 128
            growth = "growable"
            acquire = { mode = "blocking", timeout_ms = 250 }

            [handler]
            max_payload_size = 100
            max_completions_per_poll = 8

            [matching]
            prepost_receives = 3
            max_gap_polls = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.initial_buffers, 2);
        assert_eq!(
            config.pool.acquire.timeout(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.max_payload_size(), 100);
        assert_eq!(config.handler.max_completions_per_poll, 8);
        assert_eq!(config.matching.prepost_receives, 3);
        assert_eq!(config.matching.max_gap_polls, 16);
        assert_eq!(
            config.stray_completion_timeout(),
            Duration::from_millis(DEFAULT_STRAY_COMPLETION_TIMEOUT_MS)
        );
    }

    #[test]
    fn test_missing_sections_fall_back_to_defaults() {
        let config = MessagingConfig::from_toml_str(
            r#"
            [pool]
            acquire = { mode = "non_blocking" }
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.acquire, AcquirePolicy::NonBlocking);
        assert_eq!(config.pool.max_buffers, DEFAULT_MAX_BUFFERS);
        assert_eq!(config.handler, HandlerConfig::default());
    }

    #[test]
    fn test_validation_rejects_bad_sizes() {
        let bad = [
            PoolConfig::fixed(4, 0),
            PoolConfig::fixed(0, 64),
            PoolConfig::growable(10, 2, 64),
        ];
        for pool in bad {
            assert!(pool.validate().is_err(), "{:?} should be rejected", pool);
        }

        let config = MessagingConfig::default()
            .with_pool(PoolConfig::fixed(2, 64))
            .with_prepost_receives(3);
        assert!(config.validate().is_err());

        assert!(MessagingConfig::default().with_max_gap_polls(0).validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[pool]\ninitial_buffers = 3\nmax_buffers = 3\nbuffer_capacity = 256\ngrowth = \"fixed\""
        )
        .unwrap();

        let config = MessagingConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.pool, PoolConfig {
            acquire: AcquirePolicy::default(),
            ..PoolConfig::fixed(3, 256)
        });
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = MessagingConfig::load(Some(Path::new("/nonexistent/ptp.toml")));
        assert!(result.is_err());
    }
}
