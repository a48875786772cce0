//! Error classification for retry and fix-provider decisions
//!
//! Two independent questions are answered here:
//! - which category an error belongs to (selects a fix provider);
//! - whether an error may be retried under a given policy.
//!
//! Both work on the full context chain of an `anyhow::Error`, lowercased.

use serde::{Deserialize, Serialize};

use crate::policy::Policy;

/// Category labels understood by the built-in rules and providers.
pub mod category {
    pub const NETWORK: &str = "network";
    pub const DOCKER: &str = "docker";
    pub const KUBERNETES: &str = "kubernetes";
    pub const DEPENDENCY: &str = "dependency";
    pub const CONFIG: &str = "config";
    pub const GIT: &str = "git";
    pub const AI: &str = "ai";
    pub const FILE: &str = "file";
    /// No rule matched; no provider is expected for it
    pub const UNKNOWN: &str = "unknown";
}

/// Structured error carrying an explicit category and retry decision
///
/// Wrap it in `anyhow::Error` (directly or under `.context(...)`) to opt a
/// failure in or out of retries independent of its message text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct DomainError {
    pub category: String,
    pub message: String,
    pub retryable: bool,
}

impl DomainError {
    pub fn retryable(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// First `DomainError` found anywhere in the chain.
    pub fn find(err: &anyhow::Error) -> Option<&DomainError> {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<DomainError>())
    }
}

/// One classification rule: first matching rule wins
#[derive(Debug, Clone)]
struct Rule {
    category: String,
    patterns: Vec<String>,
}

/// Maps errors to category labels and decides retryability
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<Rule>,
}

impl ErrorClassifier {
    /// Classifier with the built-in rule set.
    pub fn new() -> Self {
        let mut classifier = Self::empty();
        for (name, patterns) in builtin_rules() {
            classifier = classifier.with_rule(name, patterns.iter().copied());
        }
        classifier
    }

    /// Classifier with no rules; everything without a `DomainError` is unknown.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule. Rules added later have lower precedence.
    pub fn with_rule<I, S>(mut self, category: impl Into<String>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.rules.push(Rule {
            category: category.into(),
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .collect(),
        });
        self
    }

    /// Category label for fix-provider dispatch.
    pub fn classify(&self, err: &anyhow::Error) -> String {
        if let Some(domain) = DomainError::find(err) {
            return domain.category.clone();
        }
        self.classify_text(&error_text(err))
    }

    /// Category label for a raw message.
    pub fn classify_text(&self, message: &str) -> String {
        let text = message.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.patterns.iter().any(|p| text.contains(p.as_str())))
            .map_or_else(|| category::UNKNOWN.to_string(), |rule| rule.category.clone())
    }

    /// Retry decision under `policy`.
    ///
    /// An explicit non-retryable `DomainError` always wins. Otherwise a
    /// policy pattern match, then an explicit retryable flag, make the
    /// error retryable; anything else is not.
    pub fn is_retryable(&self, err: &anyhow::Error, policy: &Policy) -> bool {
        let domain = DomainError::find(err);
        if let Some(DomainError {
            retryable: false, ..
        }) = domain
        {
            return false;
        }

        if policy.matches_lowercase(&error_text(err)) {
            return true;
        }

        domain.is_some_and(|d| d.retryable)
    }

    /// Retry decision under the fallback policy.
    pub fn is_retryable_default(&self, err: &anyhow::Error) -> bool {
        self.is_retryable(err, &Policy::default())
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Whole context chain, lowercased.
fn error_text(err: &anyhow::Error) -> String {
    format!("{err:#}").to_lowercase()
}

fn builtin_rules() -> [(&'static str, &'static [&'static str]); 8] {
    [
        (
            category::DEPENDENCY,
            &[
                "dependency",
                "dependencies",
                "lockfile",
                "lock file",
                "package-lock",
                "go.sum",
                "checksum mismatch",
                "npm err",
                "could not resolve dependenc",
                "unable to resolve dependency",
                "version conflict",
                "no matching version",
            ],
        ),
        (
            category::KUBERNETES,
            &[
                "kubectl",
                "kubernetes",
                "k8s",
                "crashloopbackoff",
                "imagepullbackoff",
                "namespace",
                "deployment.apps",
                "the object has been modified",
            ],
        ),
        (
            category::DOCKER,
            &[
                "docker",
                "dockerfile",
                "buildkit",
                "image",
                "container",
                "registry",
                "manifest unknown",
                "pull access denied",
            ],
        ),
        (
            category::CONFIG,
            &[
                "config",
                "configuration",
                "environment variable",
                "env var",
                "missing key",
                "invalid yaml",
                "invalid json",
                "not set",
            ],
        ),
        (
            category::GIT,
            &[
                "git ",
                "git:",
                "fatal: repository",
                "fatal: unable to access",
                "clone",
                "remote end hung up",
                "index.lock",
            ],
        ),
        (
            category::AI,
            &["429", "too many requests", "overloaded", "model", "tokens", "completion"],
        ),
        (
            category::NETWORK,
            &[
                "connection refused",
                "connection reset",
                "timeout",
                "timed out",
                "network",
                "no route to host",
                "could not resolve host",
                "dns",
                "tls",
                "eof",
                "rate limit",
                "service unavailable",
                "503",
                "502",
            ],
        ),
        (
            category::FILE,
            &[
                "no such file",
                "permission denied",
                "file",
                "directory",
                "disk",
                "read-only file system",
            ],
        ),
    ]
}
