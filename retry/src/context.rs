//! Per-invocation execution state

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreaker;
use crate::fix::{FixStrategy, Metadata};
use crate::policy::Policy;

/// Record of one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptResult {
    /// 1-based
    pub attempt: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    /// Remediation applied right after this attempt failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<FixStrategy>,
    pub applied: bool,
}

impl AttemptResult {
    pub fn succeeded(attempt: u32, duration: Duration, timestamp: DateTime<Utc>) -> Self {
        Self {
            attempt,
            success: true,
            error: None,
            duration,
            timestamp,
            strategy: None,
            applied: false,
        }
    }

    pub fn failed(
        attempt: u32,
        error: &anyhow::Error,
        duration: Duration,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            attempt,
            success: false,
            error: Some(format!("{error:#}")),
            duration,
            timestamp,
            strategy: None,
            applied: false,
        }
    }
}

/// State owned by one coordinated invocation
///
/// Never shared between invocations. The wrapped closure receives it by
/// `&mut` on every attempt and may read metadata rewritten by fixes.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub operation_id: String,
    /// Operation class the policy was resolved for
    pub operation: String,
    pub session_id: Option<String>,
    pub policy: Arc<Policy>,
    pub attempt_history: Vec<AttemptResult>,
    pub fix_strategies_tried: Vec<FixStrategy>,
    /// Zero disables the fix flow
    pub max_fix_attempts: usize,
    pub metadata: Metadata,
    pub circuit_breaker: Option<Arc<CircuitBreaker>>,
}

impl ExecutionContext {
    pub fn new(operation: impl Into<String>, policy: Arc<Policy>) -> Self {
        let operation = operation.into();
        Self {
            operation_id: format!("{operation}_{}", Uuid::new_v4().simple()),
            operation,
            session_id: None,
            policy,
            attempt_history: Vec::new(),
            fix_strategies_tried: Vec::new(),
            max_fix_attempts: 0,
            metadata: Metadata::new(),
            circuit_breaker: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn with_max_fix_attempts(mut self, max_fix_attempts: usize) -> Self {
        self.max_fix_attempts = max_fix_attempts;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    /// Attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        u32::try_from(self.attempt_history.len()).unwrap_or(u32::MAX)
    }

    pub fn last_attempt(&self) -> Option<&AttemptResult> {
        self.attempt_history.last()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(serde_json::Value::as_str)
    }

    pub fn metadata_flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Number of fixes applied during this invocation.
    pub fn fixes_applied(&self) -> usize {
        self.attempt_history.iter().filter(|a| a.applied).count()
    }

    pub(crate) fn record(&mut self, result: AttemptResult) {
        self.attempt_history.push(result);
    }

    /// Attach an applied remediation to the latest attempt.
    pub(crate) fn record_fix(&mut self, strategy: FixStrategy) {
        if let Some(last) = self.attempt_history.last_mut() {
            last.strategy = Some(strategy.clone());
            last.applied = true;
        }
        self.fix_strategies_tried.push(strategy);
    }
}
