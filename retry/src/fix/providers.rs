//! Built-in fix providers
//!
//! These never run processes. Each automated strategy carries the metadata
//! rewrites it stands for in `parameters`; applying it merges them into the
//! invocation metadata so the next attempt can rebuild without cache, pull
//! again, refresh a lockfile, and so on.

use async_trait::async_trait;

use super::{FixProvider, FixStrategy, Metadata, record_applied};

fn error_text(err: &anyhow::Error) -> String {
    format!("{err:#}").to_lowercase()
}

fn mentions(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| text.contains(needle))
}

/// Merge an automated strategy's parameters into `metadata`.
fn apply_parameters(
    provider: &str,
    known: &[&str],
    strategy: &FixStrategy,
    metadata: &mut Metadata,
) -> anyhow::Result<()> {
    if !known.contains(&strategy.name.as_str()) {
        anyhow::bail!("{provider} provider does not know strategy '{}'", strategy.name);
    }
    if !strategy.automated {
        anyhow::bail!("strategy '{}' requires manual action", strategy.name);
    }

    for (key, value) in &strategy.parameters {
        metadata.insert(key.clone(), value.clone());
    }
    record_applied(metadata, &strategy.name);
    Ok(())
}

/// Remediation for container image builds and pulls
#[derive(Debug, Default, Clone, Copy)]
pub struct DockerFixProvider;

impl DockerFixProvider {
    pub const NO_CACHE: &'static str = "no_cache_rebuild";
    pub const PULL_ALWAYS: &'static str = "pull_always";
    pub const BASE_IMAGE_FALLBACK: &'static str = "base_image_fallback";
    pub const DOCKERFILE_SYNTAX: &'static str = "fix_dockerfile_syntax";

    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FixProvider for DockerFixProvider {
    async fn fix_strategies(
        &self,
        err: &anyhow::Error,
        metadata: &Metadata,
    ) -> anyhow::Result<Vec<FixStrategy>> {
        let text = error_text(err);
        let mut strategies = Vec::new();

        if mentions(&text, &["cache", "layer", "failed to compute cache key", "snapshot"]) {
            strategies.push(
                FixStrategy::new("cache", Self::NO_CACHE, 1)
                    .description("Rebuild without the layer cache")
                    .parameter("no_cache", true),
            );
        }

        if mentions(
            &text,
            &[
                "toomanyrequests",
                "rate limit",
                "pull access denied",
                "error pulling image",
                "i/o timeout",
                "registry",
            ],
        ) {
            strategies.push(
                FixStrategy::new("registry", Self::PULL_ALWAYS, 2)
                    .description("Force a fresh pull and back off from the registry")
                    .parameter("pull", "always")
                    .parameter("registry_backoff", true),
            );
        }

        if mentions(&text, &["manifest unknown", "not found", "no such image"]) {
            let fallback = metadata
                .get("fallback_base_image")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string);
            let strategy = FixStrategy::new("image", Self::BASE_IMAGE_FALLBACK, 3)
                .description("Switch to the configured fallback base image")
                .automated(fallback.is_some());
            strategies.push(match fallback {
                Some(image) => strategy.parameter("base_image_fallback", image),
                None => strategy,
            });
        }

        if mentions(&text, &["dockerfile parse error", "unknown instruction", "dockerfile:"]) {
            let mut strategy = FixStrategy::new("dockerfile", Self::DOCKERFILE_SYNTAX, 4)
                .description("Dockerfile has a syntax error that needs editing")
                .manual();
            if let Some(path) = metadata.get("dockerfile_path") {
                strategy = strategy.parameter("dockerfile_path", path.clone());
            }
            strategies.push(strategy);
        }

        Ok(strategies)
    }

    async fn apply_fix(
        &self,
        strategy: &FixStrategy,
        metadata: &mut Metadata,
    ) -> anyhow::Result<()> {
        apply_parameters(
            self.name(),
            &[Self::NO_CACHE, Self::PULL_ALWAYS, Self::BASE_IMAGE_FALLBACK],
            strategy,
            metadata,
        )
    }

    fn name(&self) -> &str {
        "docker"
    }
}

/// Remediation for missing or malformed configuration
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigFixProvider;

impl ConfigFixProvider {
    pub const APPLY_DEFAULTS: &'static str = "apply_config_defaults";
    pub const SYNTAX: &'static str = "validate_config_syntax";

    pub fn new() -> Self {
        Self
    }
}

/// First SHOUTY_CASE token in `message`, usually the missing variable.
fn missing_key(message: &str) -> Option<String> {
    message
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .find(|token| {
            token.len() >= 2
                && token.chars().any(|c| c.is_ascii_uppercase())
                && token
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        })
        .map(str::to_string)
}

#[async_trait]
impl FixProvider for ConfigFixProvider {
    async fn fix_strategies(
        &self,
        err: &anyhow::Error,
        _metadata: &Metadata,
    ) -> anyhow::Result<Vec<FixStrategy>> {
        let raw = format!("{err:#}");
        let text = raw.to_lowercase();
        let mut strategies = Vec::new();

        if mentions(
            &text,
            &["environment variable", "env var", "not set", "missing key", "missing config"],
        ) {
            let mut strategy = FixStrategy::new("config", Self::APPLY_DEFAULTS, 1)
                .description("Fall back to default values for missing settings")
                .parameter("config_defaults_applied", true);
            if let Some(key) = missing_key(&raw) {
                strategy = strategy.parameter("missing_config_key", key);
            }
            strategies.push(strategy);
        }

        if mentions(&text, &["invalid yaml", "invalid json", "yaml:", "expected value at line"]) {
            strategies.push(
                FixStrategy::new("config", Self::SYNTAX, 2)
                    .description("Configuration file is malformed and must be corrected")
                    .manual(),
            );
        }

        Ok(strategies)
    }

    async fn apply_fix(
        &self,
        strategy: &FixStrategy,
        metadata: &mut Metadata,
    ) -> anyhow::Result<()> {
        apply_parameters(self.name(), &[Self::APPLY_DEFAULTS], strategy, metadata)
    }

    fn name(&self) -> &str {
        "config"
    }
}

/// Remediation for package resolution and lockfile problems
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyFixProvider;

impl DependencyFixProvider {
    pub const REFRESH_LOCKFILE: &'static str = "refresh_lockfile";
    pub const CLEAR_CACHE: &'static str = "clear_dependency_cache";
    pub const VERSION_CONFLICT: &'static str = "resolve_version_conflict";

    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FixProvider for DependencyFixProvider {
    async fn fix_strategies(
        &self,
        err: &anyhow::Error,
        _metadata: &Metadata,
    ) -> anyhow::Result<Vec<FixStrategy>> {
        let text = error_text(err);
        let mut strategies = Vec::new();

        if mentions(
            &text,
            &["lockfile", "lock file", "package-lock", "go.sum", "out of sync", "frozen"],
        ) {
            strategies.push(
                FixStrategy::new("lockfile", Self::REFRESH_LOCKFILE, 1)
                    .description("Regenerate the lockfile before the next attempt")
                    .parameter("refresh_lockfile", true),
            );
        }

        if mentions(
            &text,
            &[
                "checksum mismatch",
                "integrity",
                "could not resolve dependenc",
                "unable to resolve dependency",
                "etimedout",
                "fetch",
            ],
        ) {
            strategies.push(
                FixStrategy::new("cache", Self::CLEAR_CACHE, 2)
                    .description("Drop the local package cache and fetch again")
                    .parameter("clear_dependency_cache", true),
            );
        }

        if mentions(
            &text,
            &["version conflict", "no matching version", "eresolve", "incompatible"],
        ) {
            strategies.push(
                FixStrategy::new("version", Self::VERSION_CONFLICT, 3)
                    .description("Dependency versions conflict and need to be pinned by hand")
                    .manual(),
            );
        }

        Ok(strategies)
    }

    async fn apply_fix(
        &self,
        strategy: &FixStrategy,
        metadata: &mut Metadata,
    ) -> anyhow::Result<()> {
        apply_parameters(
            self.name(),
            &[Self::REFRESH_LOCKFILE, Self::CLEAR_CACHE],
            strategy,
            metadata,
        )
    }

    fn name(&self) -> &str {
        "dependency"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::APPLIED_FIXES_KEY;
    use anyhow::anyhow;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn names(strategies: &[FixStrategy]) -> Vec<&str> {
        strategies.iter().map(|s| s.name.as_str()).collect()
    }

    #[tokio::test]
    async fn docker_rate_limit_forces_pull() {
        let provider = DockerFixProvider::new();
        let err = anyhow!("toomanyrequests: You have reached your pull rate limit");

        let strategies = provider.fix_strategies(&err, &Metadata::new()).await.unwrap();
        assert_eq!(names(&strategies), vec![DockerFixProvider::PULL_ALWAYS]);

        let mut metadata = Metadata::new();
        provider.apply_fix(&strategies[0], &mut metadata).await.unwrap();
        assert_eq!(metadata["pull"], json!("always"));
        assert_eq!(metadata["registry_backoff"], json!(true));
        assert_eq!(metadata[APPLIED_FIXES_KEY], json!(["pull_always"]));
    }

    #[tokio::test]
    async fn docker_base_image_fallback_needs_configured_image() {
        let provider = DockerFixProvider::new();
        let err = anyhow!("manifest unknown: golang:1.99-alpine");

        let without = provider.fix_strategies(&err, &Metadata::new()).await.unwrap();
        assert!(!without[0].automated);

        let mut metadata = Metadata::new();
        metadata.insert("fallback_base_image".into(), json!("golang:1.22-alpine"));
        let with = provider.fix_strategies(&err, &metadata).await.unwrap();
        assert!(with[0].automated);

        provider.apply_fix(&with[0], &mut metadata).await.unwrap();
        assert_eq!(metadata["base_image_fallback"], json!("golang:1.22-alpine"));
    }

    #[tokio::test]
    async fn docker_refuses_manual_strategies() {
        let provider = DockerFixProvider::new();
        let err = anyhow!("Dockerfile parse error line 3: unknown instruction: RUNN");

        let strategies = provider.fix_strategies(&err, &Metadata::new()).await.unwrap();
        let syntax = strategies
            .iter()
            .find(|s| s.name == DockerFixProvider::DOCKERFILE_SYNTAX)
            .expect("syntax suggestion");
        assert!(!syntax.automated);

        let mut metadata = Metadata::new();
        assert!(provider.apply_fix(syntax, &mut metadata).await.is_err());
        assert!(metadata.is_empty());
    }

    #[tokio::test]
    async fn config_records_missing_key() {
        let provider = ConfigFixProvider::new();
        let err = anyhow!("required environment variable DATABASE_URL not set");

        let strategies = provider.fix_strategies(&err, &Metadata::new()).await.unwrap();
        assert_eq!(strategies[0].parameters["missing_config_key"], json!("DATABASE_URL"));

        let mut metadata = Metadata::new();
        provider.apply_fix(&strategies[0], &mut metadata).await.unwrap();
        assert_eq!(metadata["config_defaults_applied"], json!(true));
        assert_eq!(metadata["missing_config_key"], json!("DATABASE_URL"));
    }

    #[tokio::test]
    async fn dependency_strategies_are_ordered_and_typed() {
        let provider = DependencyFixProvider::new();
        let err = anyhow!("npm ERR! package-lock.json out of sync; checksum mismatch for left-pad");

        let strategies = provider.fix_strategies(&err, &Metadata::new()).await.unwrap();
        assert_eq!(
            names(&strategies),
            vec![DependencyFixProvider::REFRESH_LOCKFILE, DependencyFixProvider::CLEAR_CACHE]
        );

        let conflict = provider
            .fix_strategies(&anyhow!("ERESOLVE version conflict"), &Metadata::new())
            .await
            .unwrap();
        assert!(conflict.iter().all(|s| !s.automated));
    }

    #[tokio::test]
    async fn host_resolution_failure_does_not_clear_dependency_cache() {
        let provider = DependencyFixProvider::new();
        let err = anyhow!(
            "fatal: unable to access 'https://github.com/acme/app.git/': \
             Could not resolve host: github.com"
        );

        let strategies = provider.fix_strategies(&err, &Metadata::new()).await.unwrap();
        assert!(strategies.is_empty(), "{:?}", names(&strategies));

        let err = anyhow!("Could not resolve dependencies for project app");
        let strategies = provider.fix_strategies(&err, &Metadata::new()).await.unwrap();
        assert_eq!(names(&strategies), vec![DependencyFixProvider::CLEAR_CACHE]);
    }

    #[tokio::test]
    async fn unrelated_errors_yield_nothing() {
        let err = anyhow!("segmentation fault");
        let metadata = Metadata::new();

        assert!(DockerFixProvider::new().fix_strategies(&err, &metadata).await.unwrap().is_empty());
        assert!(ConfigFixProvider::new().fix_strategies(&err, &metadata).await.unwrap().is_empty());
        assert!(
            DependencyFixProvider::new()
                .fix_strategies(&err, &metadata)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn missing_key_picks_first_shouty_token() {
        assert_eq!(missing_key("env var API_TOKEN is not set"), Some("API_TOKEN".to_string()));
        assert_eq!(missing_key("config is missing"), None);
    }
}
