//! Unified retry and self-healing coordination
//!
//! Wraps fallible external operations (network calls, image builds, cluster
//! deploys, model API calls) in a policy-driven retry loop with:
//! - per-class backoff (fixed, linear, exponential, optional jitter);
//! - error classification into retry decisions and fix categories;
//! - per-class circuit breakers;
//! - pluggable fix providers that rewrite invocation metadata between
//!   attempts.
//!
//! ```no_run
//! use ckit_retry::{CancelScope, CoordinatorService};
//!
//! # async fn demo() -> ckit_retry::Result<()> {
//! let service = CoordinatorService::default();
//! let scope = CancelScope::default();
//!
//! let digest = service
//!     .docker_operation(&scope, "./Dockerfile", |_scope, ctx| {
//!         let no_cache = ctx.metadata_flag("no_cache");
//!         async move { Ok(format!("built (no_cache={no_cache})")) }
//!     })
//!     .await?;
//! # let _ = digest;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod backoff;
pub mod circuit_breaker;
pub mod classifier;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod fix;
pub mod policy;
pub mod service;

pub use backoff::BackoffCalculator;
pub use circuit_breaker::{
    BreakerSettings, CircuitBreaker, CircuitBreakers, CircuitPermit, CircuitSnapshot, CircuitState,
};
pub use classifier::{DomainError, ErrorClassifier};
pub use config::{ConfigError, ConfigLoader, EngineConfig};
pub use context::{AttemptResult, ExecutionContext};
pub use coordinator::{Coordinator, CoordinatorSettings};
pub use error::{Result, RetryError};
pub use fix::{FixOutcome, FixProvider, FixProviderRegistry, FixStrategy, Metadata};
pub use policy::{BackoffStrategy, Policy};
pub use service::CoordinatorService;

pub use ckit_async_utils::{CancelErr, CancelScope, OrCancelExt};
pub use tokio_util::sync::CancellationToken;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
