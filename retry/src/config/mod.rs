//! Configuration for the retry engine
//!
//! Layered the 12-factor way:
//! 1. Defaults (from code, built-in class policies included)
//! 2. Config file (ckit-retry.toml)
//! 3. Environment variables (CKIT_RETRY_* prefix)
//!
//! # Example
//!
//! ```no_run
//! use ckit_retry::config::ConfigLoader;
//!
//! // Load from default locations
//! let config = ConfigLoader::load_default().expect("Failed to load config");
//!
//! // Or load from specific file
//! let config = ConfigLoader::new()
//!     .with_file("./ckit-retry.toml")
//!     .load()
//!     .expect("Failed to load config");
//! ```
pub mod error;
pub mod loader;

// Re-export main types
pub use error::{ConfigError, Result};
pub use loader::{
    CircuitBreakerConfig, ConfigLoader, EngineConfig, ExecutionConfig, PolicyConfig,
};
