//! Fix providers: remediation between retry attempts
//!
//! A provider is registered per error category. When an attempt fails with
//! a retryable error, the coordinator classifies it, asks the matching
//! provider for candidate strategies and applies the first automated one
//! that succeeds. Remediation only ever rewrites the invocation's
//! [`Metadata`]; the wrapped closure reads it on its next attempt.

pub mod providers;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use providers::{ConfigFixProvider, DependencyFixProvider, DockerFixProvider};

/// Free-form per-invocation data shared between the closure and providers
pub type Metadata = HashMap<String, serde_json::Value>;

/// Metadata key listing the names of every strategy applied so far
pub const APPLIED_FIXES_KEY: &str = "applied_fixes";

/// One candidate remediation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixStrategy {
    /// Provider-specific strategy family, e.g. "cache" or "registry"
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    /// Lower values are tried first
    pub priority: i32,
    /// Only automated strategies are ever applied by the coordinator
    pub automated: bool,
    #[serde(default)]
    pub parameters: Metadata,
}

impl FixStrategy {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, priority: i32) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            description: String::new(),
            priority,
            automated: true,
            parameters: Metadata::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark the strategy as a suggestion a human has to act on.
    pub fn manual(mut self) -> Self {
        self.automated = false;
        self
    }

    pub fn automated(mut self, automated: bool) -> Self {
        self.automated = automated;
        self
    }

    pub fn parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Sort candidates so the lowest priority value comes first. Ties keep
/// the provider's order.
pub fn order_by_priority(strategies: &mut [FixStrategy]) {
    strategies.sort_by_key(|strategy| strategy.priority);
}

/// Source and executor of remediation strategies for one error category
#[async_trait]
pub trait FixProvider: Send + Sync {
    /// Candidate strategies for `err`. An empty list means nothing applies.
    async fn fix_strategies(
        &self,
        err: &anyhow::Error,
        metadata: &Metadata,
    ) -> anyhow::Result<Vec<FixStrategy>>;

    /// Apply one strategy by rewriting `metadata`.
    async fn apply_fix(&self, strategy: &FixStrategy, metadata: &mut Metadata)
    -> anyhow::Result<()>;

    fn name(&self) -> &str;
}

/// Append a strategy name to the `applied_fixes` list in `metadata`.
pub fn record_applied(metadata: &mut Metadata, strategy_name: &str) {
    let entry = metadata
        .entry(APPLIED_FIXES_KEY.to_string())
        .or_insert_with(|| serde_json::Value::Array(Vec::new()));

    match entry {
        serde_json::Value::Array(names) => names.push(strategy_name.into()),
        other => *other = serde_json::Value::Array(vec![strategy_name.into()]),
    }
}

/// Category → provider table
#[derive(Default)]
pub struct FixProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn FixProvider>>>,
}

impl FixProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` for `category`, replacing any earlier one.
    pub fn register(&self, category: impl Into<String>, provider: Arc<dyn FixProvider>) {
        let category = category.into();
        tracing::debug!(%category, provider = provider.name(), "Registered fix provider");
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(category, provider);
    }

    pub fn get(&self, category: &str) -> Option<Arc<dyn FixProvider>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(category)
            .cloned()
    }

    /// Registered categories, sorted.
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        categories.sort();
        categories
    }
}

impl std::fmt::Debug for FixProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixProviderRegistry")
            .field("categories", &self.categories())
            .finish()
    }
}

/// Result of one pass of the fix flow. Never surfaced as an error.
#[derive(Debug, Clone, PartialEq)]
pub enum FixOutcome {
    Applied(FixStrategy),
    /// No provider registered for the error's category
    NoProvider { category: String },
    /// The provider had nothing automated to offer
    NoStrategies { category: String },
    /// The provider failed while producing strategies
    StrategyLookupFailed { category: String, error: String },
    /// Every automated strategy failed to apply
    AllFailed { category: String, tried: usize },
    /// The invocation already used up its fix attempts
    BudgetExhausted,
}

impl FixOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, FixOutcome::Applied(_))
    }
}
