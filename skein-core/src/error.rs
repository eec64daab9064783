//! Error taxonomy shared between the engine and its collaborators
//!
//! Failures are classified exactly once into an [`ErrorKind`]; the
//! resulting [`ErrorContext`] is immutable through the policy pipeline.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Unclassified failure
    Unknown,
    /// Input or schema validation failed
    Validation,
    /// Node body raised an error
    NodeExecution,
    /// Wall-clock budget exceeded
    Timeout,
    /// Transport-level failure
    Network,
    /// Dependency reported itself unavailable
    ServiceUnavailable,
    /// Dependency throttled the caller
    RateLimit,
    /// Credentials missing or rejected
    Authentication,
    /// Memory, queue, or stream capacity exhausted
    ResourceExhaustion,
    /// The graph itself is malformed or routing dead-ended
    GraphStructure,
    /// Execution was canceled cooperatively
    Cancellation,
    /// A circuit breaker short-circuited the call
    CircuitBreakerOpen,
    /// A resource budget was exhausted before the work ran
    BudgetExhausted,
}

impl ErrorKind {
    /// Whether failures of this kind are retried by default.
    pub fn retryable_by_default(&self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::ServiceUnavailable
                | Self::Timeout
                | Self::RateLimit
                | Self::ResourceExhaustion
        )
    }

    /// Whether this kind is considered transient by default.
    pub fn transient_by_default(&self) -> bool {
        self.retryable_by_default()
    }

    /// Severity assigned when no rule overrides it.
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::Validation | Self::RateLimit => Severity::Low,
            Self::Unknown | Self::NodeExecution | Self::Timeout | Self::Network => {
                Severity::Medium
            }
            Self::ServiceUnavailable
            | Self::ResourceExhaustion
            | Self::CircuitBreakerOpen
            | Self::BudgetExhausted
            | Self::Cancellation => Severity::High,
            Self::Authentication | Self::GraphStructure => Severity::Critical,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, CoreError> {
        let kind = match s {
            "Unknown" => Self::Unknown,
            "Validation" => Self::Validation,
            "NodeExecution" => Self::NodeExecution,
            "Timeout" => Self::Timeout,
            "Network" => Self::Network,
            "ServiceUnavailable" => Self::ServiceUnavailable,
            "RateLimit" => Self::RateLimit,
            "Authentication" => Self::Authentication,
            "ResourceExhaustion" => Self::ResourceExhaustion,
            "GraphStructure" => Self::GraphStructure,
            "Cancellation" => Self::Cancellation,
            "CircuitBreakerOpen" => Self::CircuitBreakerOpen,
            "BudgetExhausted" => Self::BudgetExhausted,
            other => {
                return Err(CoreError::Classifier(format!("unknown error kind {other:?}")))
            }
        };
        Ok(kind)
    }
}

/// How serious a classified failure is.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A classified failure, produced once per error and carried unchanged
/// through policy resolution, events, and metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Classified category
    pub kind: ErrorKind,
    /// Assigned severity
    pub severity: Severity,
    /// Whether a later attempt could plausibly succeed
    pub transient: bool,
    /// Human-readable message from the source error
    pub message: String,
    /// Node that failed, when known
    pub node_id: Option<String>,
    /// 1-based attempt number at the time of failure
    pub attempt: u32,
    /// When the failure was observed
    pub timestamp: DateTime<Utc>,
}

impl ErrorContext {
    /// Classify-free constructor; kind defaults drive severity and
    /// transience.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            transient: kind.transient_by_default(),
            message: message.into(),
            node_id: None,
            attempt: 1,
            timestamp: Utc::now(),
        }
    }

    /// Attach the failing node id.
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Set the attempt number.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Override the severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// A message-pattern classification rule.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    /// Pattern matched against the error message
    pub pattern: Regex,
    /// Kind assigned on match
    pub kind: ErrorKind,
    /// Optional transience override
    pub transient: Option<bool>,
}

impl ClassificationRule {
    /// Build a rule; invalid patterns are a caller bug surfaced as an error.
    pub fn new(pattern: &str, kind: ErrorKind) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| CoreError::Classifier(format!("invalid pattern {pattern:?}: {e}")))?;
        Ok(Self { pattern, kind, transient: None })
    }

    /// Override the kind's default transience for matches.
    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = Some(transient);
        self
    }
}

/// Maps raw errors to [`ErrorContext`]s.
///
/// Resolution order: an exact kind hint from the source error, then the
/// registered message patterns in order, then the default kind.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
    default_kind: ErrorKind,
}

impl ErrorClassifier {
    /// An empty classifier that maps everything to `default_kind`.
    pub fn new(default_kind: ErrorKind) -> Self {
        Self { rules: vec![], default_kind }
    }

    /// Classifier preloaded with patterns for common infrastructure
    /// failures (timeouts, transport errors, throttling, auth).
    pub fn with_default_rules() -> Self {
        let rules = [
            (r"(?i)timed?\s*out|deadline", ErrorKind::Timeout),
            (r"(?i)rate.?limit|too many requests|\b429\b", ErrorKind::RateLimit),
            (r"(?i)unavailable|\b503\b|overloaded", ErrorKind::ServiceUnavailable),
            (r"(?i)connection|network|dns|broken pipe|reset by peer", ErrorKind::Network),
            (r"(?i)unauthorized|forbidden|\b401\b|\b403\b|invalid.{0,8}key", ErrorKind::Authentication),
            (r"(?i)out of memory|resource.?exhaust|capacity", ErrorKind::ResourceExhaustion),
        ];

        let mut classifier = Self::new(ErrorKind::Unknown);
        for (pattern, kind) in rules {
            // Patterns above are literals known to compile.
            if let Ok(rule) = ClassificationRule::new(pattern, kind) {
                classifier.rules.push(rule);
            }
        }
        classifier
    }

    /// Append a rule; later rules lose to earlier ones.
    pub fn add_rule(&mut self, rule: ClassificationRule) -> &mut Self {
        self.rules.push(rule);
        self
    }

    /// Classify a failure message, honoring an exact kind hint when the
    /// source already knows its category.
    pub fn classify(&self, hint: Option<ErrorKind>, message: &str) -> ErrorContext {
        if let Some(kind) = hint {
            if kind != ErrorKind::Unknown {
                return ErrorContext::new(kind, message);
            }
        }

        for rule in &self.rules {
            if rule.pattern.is_match(message) {
                let mut ctx = ErrorContext::new(rule.kind, message);
                if let Some(transient) = rule.transient {
                    ctx.transient = transient;
                }
                return ctx;
            }
        }

        ErrorContext::new(self.default_kind, message)
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

/// Errors raised by collaborator adapters.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Function adapter error: {0}")]
    Function(String),

    #[error("Tool adapter error: {0}")]
    Tool(String),

    #[error("Secret resolver error: {0}")]
    Secret(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Checkpoint store error: {0}")]
    CheckpointStore(String),

    #[error("Human channel error: {0}")]
    HumanChannel(String),

    #[error("Embedding provider error: {0}")]
    Embedding(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl CoreError {
    /// Kind hint for the classifier; adapters that know better wrap their
    /// message so the pattern rules fire.
    pub fn kind_hint(&self) -> Option<ErrorKind> {
        match self {
            Self::Identity(_) => Some(ErrorKind::Authentication),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_defaults() {
        assert!(ErrorKind::Network.retryable_by_default());
        assert!(ErrorKind::RateLimit.retryable_by_default());
        assert!(!ErrorKind::Validation.retryable_by_default());
        assert!(!ErrorKind::Authentication.retryable_by_default());
        assert!(!ErrorKind::BudgetExhausted.retryable_by_default());
    }

    #[test]
    fn test_hint_wins_over_patterns() {
        let classifier = ErrorClassifier::with_default_rules();
        let ctx = classifier.classify(Some(ErrorKind::Validation), "connection refused");
        assert_eq!(ctx.kind, ErrorKind::Validation);
    }

    #[test]
    fn test_pattern_classification() {
        let classifier = ErrorClassifier::with_default_rules();
        assert_eq!(classifier.classify(None, "request timed out").kind, ErrorKind::Timeout);
        assert_eq!(
            classifier.classify(None, "429 Too Many Requests").kind,
            ErrorKind::RateLimit
        );
        assert_eq!(
            classifier.classify(None, "connection reset by peer").kind,
            ErrorKind::Network
        );
        assert_eq!(classifier.classify(None, "weird failure").kind, ErrorKind::Unknown);
    }

    #[test]
    fn test_transient_override() {
        let mut classifier = ErrorClassifier::new(ErrorKind::Unknown);
        classifier.add_rule(
            ClassificationRule::new("flaky", ErrorKind::NodeExecution)
                .unwrap()
                .with_transient(true),
        );
        let ctx = classifier.classify(None, "flaky downstream");
        assert_eq!(ctx.kind, ErrorKind::NodeExecution);
        assert!(ctx.transient);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
    }
}
