//! # Messaging Configuration
//!
//! Centralized configuration for the messaging core, so pool sizing and
//! handler limits are not hardcoded at every construction site.
//!
//! ## Usage
//!
//! ```rust
//! use ptp_config::{AcquirePolicy, MessagingConfig};
//!
//! let config = MessagingConfig::from_toml_str(r#"
//!     [pool]
//!     initial_buffers = 4
//!     max_buffers = 16
//!     buffer_capacity = 4096
//!     acquire = { mode = "non_blocking" }
//! "#).unwrap();
//!
//! assert_eq!(config.pool.acquire, AcquirePolicy::NonBlocking);
//! ```

pub mod messaging;

pub use messaging::{
    AcquirePolicy, GrowthPolicy, HandlerConfig, MatchingConfig, MessagingConfig, PoolConfig,
    ENV_PREFIX,
};
