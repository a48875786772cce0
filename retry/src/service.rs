//! Coordinator service: a configured [`Coordinator`] plus per-class entry
//! points
//!
//! The coordinator is built on first use from the service's
//! [`EngineConfig`], once, even under concurrent first calls. Construct one
//! service at startup and hand references to call sites.

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use ckit_async_utils::CancelScope;

use crate::circuit_breaker::CircuitSnapshot;
use crate::classifier::{DomainError, category};
use crate::config::{ConfigError, ConfigLoader, EngineConfig};
use crate::context::ExecutionContext;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::fix::{ConfigFixProvider, DependencyFixProvider, DockerFixProvider, Metadata};
use crate::policy::class;

/// Lazily initialised coordinator with built-in policies and providers
#[derive(Debug)]
pub struct CoordinatorService {
    config: EngineConfig,
    coordinator: OnceLock<Coordinator>,
}

impl CoordinatorService {
    /// Validates `config`; the coordinator itself is built on first use.
    pub fn new(config: EngineConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            coordinator: OnceLock::new(),
        })
    }

    /// Service configured from the default file locations and environment.
    pub fn from_default_config() -> std::result::Result<Self, ConfigError> {
        Self::new(ConfigLoader::load_default()?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Coordinator {
        self.coordinator.get_or_init(|| build_coordinator(&self.config))
    }

    /// True once the coordinator has been built.
    pub fn is_initialized(&self) -> bool {
        self.coordinator.get().is_some()
    }

    /// Drop the coordinator with all its breakers and caches. The next call
    /// builds a fresh one from the same config.
    pub fn reset(&mut self) {
        self.coordinator = OnceLock::new();
    }

    pub async fn network_operation<T, F, Fut>(&self, scope: &CancelScope, op: F) -> Result<T>
    where
        F: FnMut(CancelScope, &mut ExecutionContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.coordinator()
            .execute_with_fix(scope, class::NETWORK, Metadata::new(), op)
            .await
    }

    /// Docker build or pull. `dockerfile_path` is exposed to the closure and
    /// to the docker fix provider.
    pub async fn docker_operation<T, F, Fut>(
        &self,
        scope: &CancelScope,
        dockerfile_path: impl AsRef<Path>,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(CancelScope, &mut ExecutionContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let metadata = metadata([("dockerfile_path", path_value(dockerfile_path))]);
        self.coordinator()
            .execute_with_fix(scope, class::DOCKER, metadata, op)
            .await
    }

    pub async fn kubernetes_operation<T, F, Fut>(
        &self,
        scope: &CancelScope,
        manifest_path: impl AsRef<Path>,
        namespace: &str,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(CancelScope, &mut ExecutionContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let metadata = metadata([
            ("manifest_path", path_value(manifest_path)),
            ("namespace", namespace.to_string()),
        ]);
        self.coordinator()
            .execute_with_fix(scope, class::KUBERNETES, metadata, op)
            .await
    }

    pub async fn git_operation<T, F, Fut>(
        &self,
        scope: &CancelScope,
        repo_url: &str,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(CancelScope, &mut ExecutionContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let metadata = metadata([("repo_url", repo_url.to_string())]);
        self.coordinator()
            .execute_with_fix(scope, class::GIT, metadata, op)
            .await
    }

    /// Calls to rate-limited model APIs.
    pub async fn ai_operation<T, F, Fut>(&self, scope: &CancelScope, op: F) -> Result<T>
    where
        F: FnMut(CancelScope, &mut ExecutionContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.coordinator()
            .execute_with_fix(scope, class::AI, Metadata::new(), op)
            .await
    }

    pub async fn build_operation<T, F, Fut>(
        &self,
        scope: &CancelScope,
        build_context: impl AsRef<Path>,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(CancelScope, &mut ExecutionContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let metadata = metadata([("build_context", path_value(build_context))]);
        self.coordinator()
            .execute_with_fix(scope, class::BUILD, metadata, op)
            .await
    }

    pub async fn deployment_operation<T, F, Fut>(
        &self,
        scope: &CancelScope,
        namespace: &str,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(CancelScope, &mut ExecutionContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let metadata = metadata([("namespace", namespace.to_string())]);
        self.coordinator()
            .execute_with_fix(scope, class::DEPLOYMENT, metadata, op)
            .await
    }

    pub async fn file_operation<T, F, Fut>(
        &self,
        scope: &CancelScope,
        path: impl AsRef<Path>,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(CancelScope, &mut ExecutionContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let metadata = metadata([("path", path_value(path))]);
        self.coordinator()
            .execute_with_fix(scope, class::FILE, metadata, op)
            .await
    }

    pub fn classify(&self, err: &anyhow::Error) -> String {
        self.coordinator().classify(err)
    }

    pub fn is_retryable(&self, err: &anyhow::Error) -> bool {
        self.coordinator().is_retryable(err)
    }

    pub fn circuit_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.coordinator().circuit_snapshots()
    }

    /// Error the coordinator will retry regardless of its text.
    pub fn retryable_error(
        category: impl Into<String>,
        message: impl Into<String>,
    ) -> anyhow::Error {
        anyhow::Error::new(DomainError::retryable(category, message))
    }

    /// Error the coordinator will never retry, whatever its text says.
    pub fn non_retryable_error(
        category: impl Into<String>,
        message: impl Into<String>,
    ) -> anyhow::Error {
        anyhow::Error::new(DomainError::permanent(category, message))
    }
}

impl Default for CoordinatorService {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            coordinator: OnceLock::new(),
        }
    }
}

fn build_coordinator(config: &EngineConfig) -> Coordinator {
    let coordinator = Coordinator::new(config.coordinator_settings());

    match config.default_policy.to_policy("default") {
        Ok(policy) => {
            if let Err(err) = coordinator.set_default_policy(policy) {
                tracing::warn!(error = %err, "Keeping built-in default policy");
            }
        }
        Err(err) => tracing::warn!(error = %err, "Keeping built-in default policy"),
    }

    match config.runtime_policies() {
        Ok(policies) => {
            for (class, policy) in policies {
                if let Err(err) = coordinator.set_policy(class, policy) {
                    tracing::warn!(error = %err, "Skipping retry policy");
                }
            }
        }
        Err(err) => tracing::warn!(error = %err, "Configured retry policies rejected"),
    }

    coordinator.register_fix_provider(category::DOCKER, Arc::new(DockerFixProvider::new()));
    coordinator.register_fix_provider(category::CONFIG, Arc::new(ConfigFixProvider::new()));
    coordinator.register_fix_provider(category::DEPENDENCY, Arc::new(DependencyFixProvider::new()));

    tracing::info!(
        policies = coordinator.registered_classes().len(),
        providers = coordinator.fix_providers().categories().len(),
        "Retry coordinator initialized"
    );
    coordinator
}

fn metadata<const N: usize>(pairs: [(&str, String); N]) -> Metadata {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), serde_json::Value::String(value)))
        .collect()
}

fn path_value(path: impl AsRef<Path>) -> String {
    path.as_ref().to_string_lossy().into_owned()
}
