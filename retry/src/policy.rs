//! Retry policies
//!
//! A [`Policy`] is immutable once registered: the coordinator hands out
//! `Arc<Policy>` and never mutates it. One policy maps to one operation
//! class ("docker", "network", ...).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Operation classes the coordinator service registers out of the box.
pub mod class {
    pub const NETWORK: &str = "network";
    pub const DOCKER: &str = "docker";
    pub const KUBERNETES: &str = "kubernetes";
    pub const GIT: &str = "git";
    pub const AI: &str = "ai";
    pub const BUILD: &str = "build";
    pub const DEPLOYMENT: &str = "deployment";
    pub const FILE: &str = "file";

    pub const ALL: [&str; 8] = [
        NETWORK, DOCKER, KUBERNETES, GIT, AI, BUILD, DEPLOYMENT, FILE,
    ];
}

/// Delay growth between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffStrategy::Fixed => write!(f, "fixed"),
            BackoffStrategy::Linear => write!(f, "linear"),
            BackoffStrategy::Exponential => write!(f, "exponential"),
        }
    }
}

/// Retry behavior for one operation class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Total attempts including the first one (>= 1)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Upper bound on the pre-jitter delay (>= `initial_delay`)
    pub max_delay: Duration,
    pub backoff_strategy: BackoffStrategy,
    /// Growth factor; only meaningful for the exponential strategy
    pub multiplier: f64,
    /// Add up to 10% random extra delay
    pub jitter: bool,
    /// Case-insensitive substrings that mark an error as retryable
    pub error_patterns: Vec<String>,
}

impl Policy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_strategy: BackoffStrategy::Fixed,
            multiplier: 1.0,
            jitter: false,
            error_patterns: Self::default_patterns(),
        }
    }

    pub fn linear(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_strategy: BackoffStrategy::Linear,
            multiplier: 1.0,
            jitter: false,
            error_patterns: Self::default_patterns(),
        }
    }

    pub fn exponential(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_strategy: BackoffStrategy::Exponential,
            multiplier,
            jitter: false,
            error_patterns: Self::default_patterns(),
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the pattern list. Patterns are stored lowercased.
    pub fn with_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.error_patterns = patterns
            .into_iter()
            .map(|p| p.as_ref().to_lowercase())
            .collect();
        self
    }

    /// Append patterns to the existing list, skipping duplicates.
    pub fn extend_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            let pattern = pattern.as_ref().to_lowercase();
            if !self.error_patterns.contains(&pattern) {
                self.error_patterns.push(pattern);
            }
        }
        self
    }

    /// Patterns shared by every built-in policy
    pub fn default_patterns() -> Vec<String> {
        [
            "timeout",
            "deadline exceeded",
            "connection refused",
            "temporary failure",
            "rate limit",
            "throttled",
            "service unavailable",
            "504",
            "503",
            "502",
        ]
        .into_iter()
        .map(str::to_string)
        .collect()
    }

    /// Reject policies that can never behave sensibly.
    pub fn validate(&self, class: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidPolicy {
            class: class.to_string(),
            reason,
        };

        if self.max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1".to_string()));
        }
        if self.max_delay < self.initial_delay {
            return Err(invalid(format!(
                "max_delay ({:?}) is shorter than initial_delay ({:?})",
                self.max_delay, self.initial_delay
            )));
        }
        if self.backoff_strategy == BackoffStrategy::Exponential
            && !(self.multiplier.is_finite() && self.multiplier > 0.0)
        {
            return Err(invalid(format!(
                "exponential multiplier must be a positive finite number, got {}",
                self.multiplier
            )));
        }
        if self.error_patterns.iter().any(|p| p.trim().is_empty()) {
            return Err(invalid("error_patterns must not contain blank entries".to_string()));
        }
        Ok(())
    }

    /// True when `text` (already lowercased) contains any pattern.
    pub(crate) fn matches_lowercase(&self, text: &str) -> bool {
        self.error_patterns
            .iter()
            .any(|pattern| text.contains(pattern.to_lowercase().as_str()))
    }
}

/// Fallback for operation classes without a registered policy.
impl Default for Policy {
    fn default() -> Self {
        Policy::exponential(3, Duration::from_secs(1), Duration::from_secs(10), 2.0)
            .with_jitter(true)
    }
}

/// Built-in policy for a well-known operation class.
pub fn builtin(class_name: &str) -> Option<Policy> {
    let secs = Duration::from_secs;
    let policy = match class_name {
        class::NETWORK => Policy::exponential(5, secs(1), secs(30), 2.0)
            .with_jitter(true)
            .extend_patterns([
                "connection reset",
                "network unreachable",
                "no route to host",
                "tls handshake timeout",
                "eof",
            ]),
        class::DOCKER => Policy::linear(3, secs(2), secs(30))
            .with_jitter(true)
            .extend_patterns([
                "pull access denied",
                "manifest unknown",
                "i/o timeout",
                "toomanyrequests",
                "error pulling image",
                "cannot connect to the docker daemon",
            ]),
        class::KUBERNETES => Policy::exponential(4, secs(2), secs(60), 2.0)
            .with_jitter(true)
            .extend_patterns([
                "the object has been modified",
                "etcdserver",
                "not ready",
                "too many requests",
                "unable to connect to the server",
            ]),
        class::GIT => Policy::fixed(3, secs(1))
            .with_jitter(false)
            .extend_patterns([
                "could not resolve host",
                "early eof",
                "remote end hung up",
                "index.lock",
            ]),
        class::AI => Policy::exponential(3, secs(2), secs(60), 3.0)
            .with_jitter(true)
            .extend_patterns(["429", "too many requests", "overloaded", "quota"]),
        class::BUILD => Policy::linear(4, secs(3), secs(45))
            .with_jitter(true)
            .extend_patterns(["no space left on device", "killed", "resource temporarily"]),
        class::DEPLOYMENT => Policy::exponential(3, secs(5), secs(60), 2.0)
            .with_jitter(true)
            .extend_patterns(["not ready", "pending", "progress deadline", "crashloopbackoff"]),
        class::FILE => Policy {
            max_delay: Duration::from_millis(500),
            ..Policy::fixed(2, Duration::from_millis(100))
        }
        .extend_patterns(["resource busy", "text file busy", "interrupted"]),
        _ => return None,
    };
    Some(policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builtin_table_matches_documented_shape() {
        let shape = |name: &str| {
            let p = builtin(name).expect("builtin policy");
            (p.max_attempts, p.backoff_strategy, p.jitter)
        };

        assert_eq!(shape(class::NETWORK), (5, BackoffStrategy::Exponential, true));
        assert_eq!(shape(class::DOCKER), (3, BackoffStrategy::Linear, true));
        assert_eq!(shape(class::KUBERNETES), (4, BackoffStrategy::Exponential, true));
        assert_eq!(shape(class::GIT), (3, BackoffStrategy::Fixed, false));
        assert_eq!(shape(class::AI), (3, BackoffStrategy::Exponential, true));
        assert_eq!(shape(class::BUILD), (4, BackoffStrategy::Linear, true));
        assert_eq!(shape(class::DEPLOYMENT), (3, BackoffStrategy::Exponential, true));
        assert_eq!(shape(class::FILE), (2, BackoffStrategy::Fixed, false));
    }

    #[test]
    fn every_builtin_policy_is_valid() {
        for name in class::ALL {
            let policy = builtin(name).expect("builtin policy");
            policy.validate(name).expect("builtin policy should validate");
        }
        assert!(builtin("quantum").is_none());
    }

    #[test]
    fn ai_policy_backs_off_harder_than_network() {
        let ai = builtin(class::AI).expect("ai");
        let network = builtin(class::NETWORK).expect("network");
        assert!(ai.multiplier > network.multiplier);
        assert!(ai.initial_delay > network.initial_delay);
    }

    #[test]
    fn rejects_max_delay_below_initial() {
        let policy = Policy::linear(3, Duration::from_secs(10), Duration::from_secs(1));
        let err = policy.validate("docker").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPolicy { ref class, .. } if class == "docker"));
    }

    #[test]
    fn rejects_zero_attempts_and_bad_multiplier() {
        let zero = Policy::fixed(0, Duration::from_millis(10));
        assert!(zero.validate("x").is_err());

        let nan = Policy::exponential(3, Duration::ZERO, Duration::from_secs(1), f64::NAN);
        assert!(nan.validate("x").is_err());
    }

    #[test]
    fn patterns_are_lowercased() {
        let policy = Policy::default().with_patterns(["Connection Refused", "HTTP 503"]);
        assert_eq!(policy.error_patterns, vec!["connection refused", "http 503"]);
        assert!(policy.matches_lowercase("dial tcp: connection refused"));
        assert!(!policy.matches_lowercase("permission denied"));
    }

    #[test]
    fn strategy_serializes_lowercase() {
        let json = serde_json::to_string(&BackoffStrategy::Exponential).unwrap();
        assert_eq!(json, "\"exponential\"");
    }
}
