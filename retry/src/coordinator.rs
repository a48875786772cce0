//! Execution loop tying policy, backoff, classification, circuit breaking
//! and fix providers together
//!
//! Every invocation owns a fresh [`ExecutionContext`]. Shared state lives on
//! the [`Coordinator`] and is scoped to the instance: the policy table, the
//! breaker table, the delay cache and the provider registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use chrono::Utc;
use ckit_async_utils::{CancelErr, CancelScope};

use crate::backoff::{BackoffCalculator, DEFAULT_CACHE_CAPACITY};
use crate::circuit_breaker::{
    BreakerSettings, CircuitBreaker, CircuitBreakers, CircuitSnapshot, CircuitState,
};
use crate::classifier::ErrorClassifier;
use crate::config::ConfigError;
use crate::context::{AttemptResult, ExecutionContext};
use crate::error::{Result, RetryError};
use crate::fix::{FixOutcome, FixProvider, FixProviderRegistry, Metadata, order_by_priority};
use crate::policy::Policy;

/// Instance-wide tuning
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    /// Fixes are applied only while the attempt count is within this budget
    pub max_fix_attempts: usize,
    pub breaker: BreakerSettings,
    pub delay_cache_capacity: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_fix_attempts: 5,
            breaker: BreakerSettings::default(),
            delay_cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Retry and self-healing coordinator
#[derive(Debug)]
pub struct Coordinator {
    default_policy: RwLock<Arc<Policy>>,
    policies: RwLock<HashMap<String, Arc<Policy>>>,
    fix_providers: FixProviderRegistry,
    classifier: ErrorClassifier,
    breakers: CircuitBreakers,
    backoff: BackoffCalculator,
    settings: CoordinatorSettings,
}

impl Coordinator {
    pub fn new(settings: CoordinatorSettings) -> Self {
        Self {
            default_policy: RwLock::new(Arc::new(Policy::default())),
            policies: RwLock::new(HashMap::new()),
            fix_providers: FixProviderRegistry::new(),
            classifier: ErrorClassifier::new(),
            breakers: CircuitBreakers::new(settings.breaker),
            backoff: BackoffCalculator::with_capacity(settings.delay_cache_capacity),
            settings,
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffCalculator) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Register the policy for an operation class, replacing any earlier one.
    pub fn set_policy(
        &self,
        class: impl Into<String>,
        policy: Policy,
    ) -> std::result::Result<(), ConfigError> {
        let class = class.into();
        policy.validate(&class)?;
        tracing::debug!(
            operation = %class,
            max_attempts = policy.max_attempts,
            strategy = %policy.backoff_strategy,
            "Registered retry policy"
        );
        self.policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(class, Arc::new(policy));
        Ok(())
    }

    /// Replace the fallback used for unregistered classes.
    pub fn set_default_policy(&self, policy: Policy) -> std::result::Result<(), ConfigError> {
        policy.validate("default")?;
        *self
            .default_policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(policy);
        Ok(())
    }

    pub fn default_policy(&self) -> Arc<Policy> {
        Arc::clone(
            &self
                .default_policy
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Policy for `class`, or the default policy when none is registered.
    pub fn policy(&self, class: &str) -> Arc<Policy> {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(class)
            .cloned()
            .unwrap_or_else(|| self.default_policy())
    }

    /// Classes with an explicitly registered policy, sorted.
    pub fn registered_classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self
            .policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        classes.sort();
        classes
    }

    pub fn register_fix_provider(
        &self,
        category: impl Into<String>,
        provider: Arc<dyn FixProvider>,
    ) {
        self.fix_providers.register(category, provider);
    }

    pub fn fix_providers(&self) -> &FixProviderRegistry {
        &self.fix_providers
    }

    /// Context for a plain retry: no breaker, no fixes.
    pub fn context(&self, class: &str) -> ExecutionContext {
        ExecutionContext::new(class, self.policy(class))
    }

    /// Context for a fix-aware retry: breaker attached, fix budget from
    /// settings.
    pub fn fix_context(&self, class: &str) -> ExecutionContext {
        self.context(class)
            .with_max_fix_attempts(self.settings.max_fix_attempts)
            .with_circuit_breaker(self.breakers.get_or_create(class))
    }

    /// Retry `op` under the class policy. No breaker, no fixes.
    pub async fn execute<T, F, Fut>(&self, scope: &CancelScope, class: &str, mut op: F) -> Result<T>
    where
        F: FnMut(CancelScope) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut ctx = self.context(class);
        let result = self.run(scope, &mut ctx, |scope, _ctx| op(scope)).await;
        log_summary(&ctx, &result);
        result
    }

    /// Retry `op` with the class breaker and fix providers in play.
    ///
    /// `metadata` seeds the context; `op` sees it (and whatever fixes wrote
    /// into it) on every attempt.
    pub async fn execute_with_fix<T, F, Fut>(
        &self,
        scope: &CancelScope,
        class: &str,
        metadata: Metadata,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(CancelScope, &mut ExecutionContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut ctx = self.fix_context(class).with_metadata(metadata);
        let result = self.run(scope, &mut ctx, op).await;
        log_summary(&ctx, &result);
        result
    }

    /// Drive the attempt loop over a caller-owned context.
    ///
    /// `op` may read and write the context before returning its future; the
    /// future itself cannot borrow it.
    #[tracing::instrument(
        name = "retry",
        skip_all,
        fields(operation = %ctx.operation, operation_id = %ctx.operation_id)
    )]
    pub async fn run<T, F, Fut>(
        &self,
        scope: &CancelScope,
        ctx: &mut ExecutionContext,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(CancelScope, &mut ExecutionContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let policy = Arc::clone(&ctx.policy);
        let max_attempts = policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if let Err(cause) = scope.check() {
                return Err(cancelled(ctx, cause));
            }

            let permit = match &ctx.circuit_breaker {
                Some(breaker) => match breaker.try_acquire() {
                    Ok(permit) => Some(permit),
                    Err(retry_in) => {
                        tracing::warn!(
                            retry_in_ms = retry_in.as_millis() as u64,
                            "Circuit breaker open, refusing call"
                        );
                        return Err(RetryError::CircuitOpen {
                            operation: ctx.operation.clone(),
                            retry_in,
                        });
                    }
                },
                None => None,
            };

            if attempt > 1 {
                let delay = self.backoff.delay(&policy, attempt - 1);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                if let Err(cause) = scope.sleep(delay).await {
                    return Err(cancelled(ctx, cause));
                }
            }

            tracing::debug!(attempt, max_attempts, "Starting attempt");
            let timestamp = Utc::now();
            let started = Instant::now();
            let outcome = op(scope.clone(), ctx).await;
            let duration = started.elapsed();

            let err = match outcome {
                Ok(value) => {
                    ctx.record(AttemptResult::succeeded(attempt, duration, timestamp));
                    if let Some(permit) = permit {
                        permit.record_success();
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            ctx.record(AttemptResult::failed(attempt, &err, duration, timestamp));
            if let Some(permit) = permit {
                permit.record_failure();
            }

            tracing::warn!(
                attempt,
                max_attempts,
                duration_ms = duration.as_millis() as u64,
                error = %format!("{err:#}"),
                "Attempt failed"
            );

            if !self.classifier.is_retryable(&err, &policy) {
                return Err(RetryError::NonRetryable {
                    operation: ctx.operation.clone(),
                    attempts: ctx.attempts(),
                    source: err,
                });
            }

            if attempt == max_attempts {
                return Err(RetryError::Exhausted {
                    operation: ctx.operation.clone(),
                    attempts: ctx.attempts(),
                    last: err,
                });
            }

            if ctx.max_fix_attempts > 0 {
                match self.attempt_fixes(ctx, &err).await {
                    FixOutcome::Applied(strategy) => {
                        tracing::info!(
                            attempt,
                            strategy = %strategy.name,
                            "Applied fix before retry"
                        );
                    }
                    outcome => tracing::debug!(attempt, ?outcome, "No fix applied"),
                }
            }
        }

        Err(RetryError::Internal(format!(
            "{} left the attempt loop without a result",
            ctx.operation
        )))
    }

    /// One pass of the fix flow for `err`.
    ///
    /// Applies the first automated strategy, lowest priority value first,
    /// that the provider accepts. Never fails; the outcome says what
    /// happened.
    pub async fn attempt_fixes(
        &self,
        ctx: &mut ExecutionContext,
        err: &anyhow::Error,
    ) -> FixOutcome {
        if ctx.attempt_history.len() > ctx.max_fix_attempts {
            return FixOutcome::BudgetExhausted;
        }

        let category = self.classifier.classify(err);
        let Some(provider) = self.fix_providers.get(&category) else {
            return FixOutcome::NoProvider { category };
        };

        let mut strategies = match provider.fix_strategies(err, &ctx.metadata).await {
            Ok(strategies) => strategies,
            Err(lookup_err) => {
                let error = format!("{lookup_err:#}");
                tracing::warn!(
                    %category,
                    provider = provider.name(),
                    %error,
                    "Fix strategy lookup failed"
                );
                return FixOutcome::StrategyLookupFailed { category, error };
            }
        };
        order_by_priority(&mut strategies);

        let mut tried = 0;
        for strategy in strategies.into_iter().filter(|s| s.automated) {
            tried += 1;
            match provider.apply_fix(&strategy, &mut ctx.metadata).await {
                Ok(()) => {
                    ctx.record_fix(strategy.clone());
                    return FixOutcome::Applied(strategy);
                }
                Err(apply_err) => {
                    tracing::warn!(
                        %category,
                        strategy = %strategy.name,
                        error = %format!("{apply_err:#}"),
                        "Fix strategy failed to apply"
                    );
                }
            }
        }

        if tried == 0 {
            FixOutcome::NoStrategies { category }
        } else {
            FixOutcome::AllFailed { category, tried }
        }
    }

    /// Category label used for fix-provider dispatch.
    pub fn classify(&self, err: &anyhow::Error) -> String {
        self.classifier.classify(err)
    }

    /// Retry decision under the default policy.
    pub fn is_retryable(&self, err: &anyhow::Error) -> bool {
        self.classifier.is_retryable(err, &self.default_policy())
    }

    /// Retry decision under the policy registered for `class`.
    pub fn is_retryable_for(&self, err: &anyhow::Error, class: &str) -> bool {
        self.classifier.is_retryable(err, &self.policy(class))
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Breaker for `class`, created on first use.
    pub fn circuit_breaker(&self, class: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_or_create(class)
    }

    /// State of the breaker for `class`, if one was ever used.
    pub fn circuit_state(&self, class: &str) -> Option<CircuitState> {
        self.breakers.get(class).map(|breaker| breaker.state())
    }

    pub fn circuit_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.breakers.snapshots()
    }

    pub fn backoff(&self) -> &BackoffCalculator {
        &self.backoff
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(CoordinatorSettings::default())
    }
}

fn cancelled(ctx: &ExecutionContext, cause: CancelErr) -> RetryError {
    tracing::debug!(attempts = ctx.attempts(), %cause, "Scope ended, stopping retries");
    RetryError::Cancelled {
        operation: ctx.operation.clone(),
        attempts: ctx.attempts(),
        cause,
    }
}

fn log_summary<T>(ctx: &ExecutionContext, result: &Result<T>) {
    match result {
        Ok(_) => tracing::debug!(
            operation = %ctx.operation,
            operation_id = %ctx.operation_id,
            attempts = ctx.attempts(),
            fixes = ctx.fixes_applied(),
            "Operation succeeded"
        ),
        Err(err) => tracing::warn!(
            operation = %ctx.operation,
            operation_id = %ctx.operation_id,
            attempts = ctx.attempts(),
            fixes = ctx.fixes_applied(),
            error = %err,
            "Operation failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::DomainError;
    use crate::fix::FixStrategy;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> Policy {
        Policy::fixed(max_attempts, Duration::from_millis(1))
    }

    fn coordinator() -> Coordinator {
        let coordinator = Coordinator::default();
        coordinator.set_policy("fast", fast_policy(3)).unwrap();
        coordinator
    }

    struct RecordingProvider {
        applied: AtomicU32,
        fail_first: bool,
    }

    #[async_trait]
    impl FixProvider for RecordingProvider {
        async fn fix_strategies(
            &self,
            _err: &anyhow::Error,
            _metadata: &Metadata,
        ) -> anyhow::Result<Vec<FixStrategy>> {
            Ok(vec![
                FixStrategy::new("test", "suggest_only", 0).manual(),
                FixStrategy::new("test", "second", 2),
                FixStrategy::new("test", "first", 1),
            ])
        }

        async fn apply_fix(
            &self,
            strategy: &FixStrategy,
            metadata: &mut Metadata,
        ) -> anyhow::Result<()> {
            if self.fail_first && strategy.name == "first" {
                anyhow::bail!("first strategy is broken");
            }
            self.applied.fetch_add(1, Ordering::SeqCst);
            metadata.insert("fixed_by".into(), strategy.name.clone().into());
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    #[test]
    fn unknown_class_falls_back_to_default_policy() {
        let coordinator = coordinator();
        assert_eq!(coordinator.policy("fast").max_attempts, 3);
        assert_eq!(*coordinator.policy("nope"), Policy::default());
        assert_eq!(coordinator.registered_classes(), vec!["fast"]);
    }

    #[test]
    fn invalid_policy_is_rejected_at_registration() {
        let coordinator = Coordinator::default();
        let bad = Policy::linear(3, Duration::from_secs(5), Duration::from_secs(1));
        assert!(coordinator.set_policy("docker", bad).is_err());
        assert!(coordinator.registered_classes().is_empty());
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let coordinator = coordinator();
        let calls = AtomicU32::new(0);

        let value = coordinator
            .execute(&CancelScope::default(), "fast", |_scope| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(anyhow!("connection refused"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn plain_execute_never_touches_breakers() {
        let coordinator = coordinator();
        let _ = coordinator
            .execute(&CancelScope::default(), "fast", |_scope| async {
                Err::<(), _>(anyhow!("timeout"))
            })
            .await;

        assert!(coordinator.circuit_state("fast").is_none());
    }

    #[tokio::test]
    async fn fix_flow_applies_lowest_priority_automated_strategy() {
        let coordinator = coordinator();
        let provider = Arc::new(RecordingProvider {
            applied: AtomicU32::new(0),
            fail_first: false,
        });
        coordinator.register_fix_provider("test", provider.clone());

        let mut ctx = coordinator.fix_context("fast");
        ctx.record(AttemptResult::failed(1, &anyhow!("x"), Duration::ZERO, Utc::now()));
        let err = anyhow::Error::new(DomainError::retryable("test", "flaky"));

        let outcome = coordinator.attempt_fixes(&mut ctx, &err).await;

        assert!(matches!(&outcome, FixOutcome::Applied(s) if s.name == "first"));
        assert_eq!(ctx.metadata_str("fixed_by"), Some("first"));
        assert!(ctx.last_attempt().unwrap().applied);
    }

    #[tokio::test]
    async fn fix_flow_falls_through_failed_strategies() {
        let coordinator = coordinator();
        coordinator.register_fix_provider(
            "test",
            Arc::new(RecordingProvider {
                applied: AtomicU32::new(0),
                fail_first: true,
            }),
        );

        let mut ctx = coordinator.fix_context("fast");
        ctx.record(AttemptResult::failed(1, &anyhow!("x"), Duration::ZERO, Utc::now()));
        let err = anyhow::Error::new(DomainError::retryable("test", "flaky"));

        let outcome = coordinator.attempt_fixes(&mut ctx, &err).await;
        assert!(matches!(&outcome, FixOutcome::Applied(s) if s.name == "second"));
    }

    #[tokio::test]
    async fn fix_flow_soft_outcomes() {
        let coordinator = coordinator();
        let mut ctx = coordinator.fix_context("fast");
        ctx.record(AttemptResult::failed(1, &anyhow!("x"), Duration::ZERO, Utc::now()));

        let outcome = coordinator.attempt_fixes(&mut ctx, &anyhow!("segfault")).await;
        assert_eq!(
            outcome,
            FixOutcome::NoProvider {
                category: "unknown".to_string()
            }
        );

        ctx.max_fix_attempts = 0;
        let outcome = coordinator.attempt_fixes(&mut ctx, &anyhow!("docker")).await;
        assert_eq!(outcome, FixOutcome::BudgetExhausted);
    }

    #[tokio::test]
    async fn cancelled_scope_prevents_first_attempt() {
        let coordinator = coordinator();
        let scope = CancelScope::default();
        scope.cancel();
        let calls = AtomicU32::new(0);

        let err = coordinator
            .execute(&scope, "fast", |_scope| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.cancel_cause(), Some(CancelErr::Cancelled));
        assert_eq!(err.attempts(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
