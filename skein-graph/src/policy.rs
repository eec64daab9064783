//! Error policy registry
//!
//! A failure is classified once, then resolved against the registered
//! rules. Precedence is per-node, then per-node-pattern, then per-kind,
//! then global; ties break on the rule's declared priority.

use rand::Rng;
use regex::Regex;
use skein_core::{ErrorClassifier, ErrorContext, ErrorKind};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Closed set of recovery actions a policy can choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryAction {
    /// Re-enter the execute step with an incremented attempt
    Retry,
    /// Treat the node as completed with no output
    Skip,
    /// Route to a declared alternative node
    Fallback,
    /// Restore the innermost transaction and re-route
    Rollback,
    /// End the execution, surfacing the classified kind
    Halt,
    /// Delegate to human approval
    Escalate,
    /// Open the node's circuit breaker
    CircuitBreaker,
    /// Proceed as if the node succeeded
    Continue,
}

/// Delay progression between retry attempts.
#[derive(Clone)]
pub enum RetryStrategy {
    NoRetry,
    FixedDelay,
    LinearBackoff,
    ExponentialBackoff,
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl std::fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoRetry => f.write_str("NoRetry"),
            Self::FixedDelay => f.write_str("FixedDelay"),
            Self::LinearBackoff => f.write_str("LinearBackoff"),
            Self::ExponentialBackoff => f.write_str("ExponentialBackoff"),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Jitter applied to computed delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterMode {
    /// Use the computed delay as-is
    None,
    /// Uniform random delay in `[0, computed]`
    #[default]
    Full,
}

/// How many times and how patiently a failure is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    /// Retries after the first attempt; 3 means up to 4 executions
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    pub jitter: JitterMode,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::ExponentialBackoff,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: JitterMode::Full,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self { strategy: RetryStrategy::NoRetry, max_retries: 0, ..Self::default() }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            strategy: RetryStrategy::FixedDelay,
            max_retries,
            base_delay: delay,
            ..Self::default()
        }
    }

    pub fn exponential(max_retries: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            strategy: RetryStrategy::ExponentialBackoff,
            max_retries,
            base_delay,
            backoff_multiplier: multiplier,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: JitterMode) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Whether another attempt is allowed after `failures` failures.
    pub fn should_retry(&self, failures: u32) -> bool {
        !matches!(self.strategy, RetryStrategy::NoRetry) && failures <= self.max_retries
    }

    /// Delay before retry number `attempt` (1-based: the delay after the
    /// first failure is `delay_for(1)`).
    pub fn delay_for<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let attempt = attempt.max(1);
        let raw = match &self.strategy {
            RetryStrategy::NoRetry => Duration::ZERO,
            RetryStrategy::FixedDelay => self.base_delay,
            RetryStrategy::LinearBackoff => self.base_delay.saturating_mul(attempt),
            RetryStrategy::ExponentialBackoff => {
                let factor = self.backoff_multiplier.powi(attempt as i32 - 1);
                Duration::from_secs_f64(
                    (self.base_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64()),
                )
            }
            RetryStrategy::Custom(f) => f(attempt),
        };
        let capped = raw.min(self.max_delay);

        match self.jitter {
            JitterMode::None => capped,
            JitterMode::Full if capped.is_zero() => capped,
            JitterMode::Full => {
                Duration::from_secs_f64(rng.gen_range(0.0..=capped.as_secs_f64()))
            }
        }
    }
}

/// What a rule applies to, in decreasing specificity.
#[derive(Debug, Clone)]
pub enum RuleMatch {
    /// Exact node id
    Node(String),
    /// Regex over node ids
    NodePattern(Regex),
    /// All failures of one kind
    Kind(ErrorKind),
    /// Everything
    Global,
}

impl RuleMatch {
    fn matches(&self, error: &ErrorContext, node_id: &str) -> bool {
        match self {
            Self::Node(id) => id == node_id,
            Self::NodePattern(pattern) => pattern.is_match(node_id),
            Self::Kind(kind) => *kind == error.kind,
            Self::Global => true,
        }
    }

    fn specificity(&self) -> u8 {
        match self {
            Self::Node(_) => 3,
            Self::NodePattern(_) => 2,
            Self::Kind(_) => 1,
            Self::Global => 0,
        }
    }
}

/// A registered recovery rule.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub matcher: RuleMatch,
    pub action: RecoveryAction,
    pub retry: RetryPolicy,
    /// Kinds this rule will retry; `None` falls back to the kind's
    /// default retryability
    pub retryable_kinds: Option<HashSet<ErrorKind>>,
    /// Target for `Fallback`
    pub fallback_node: Option<String>,
    /// Tie-break among rules of equal specificity; higher wins
    pub priority: i32,
}

impl PolicyRule {
    pub fn new(matcher: RuleMatch, action: RecoveryAction) -> Self {
        Self {
            matcher,
            action,
            retry: RetryPolicy::default(),
            retryable_kinds: None,
            fallback_node: None,
            priority: 0,
        }
    }

    pub fn for_node(node_id: &str, action: RecoveryAction) -> Self {
        Self::new(RuleMatch::Node(node_id.to_string()), action)
    }

    pub fn for_kind(kind: ErrorKind, action: RecoveryAction) -> Self {
        Self::new(RuleMatch::Kind(kind), action)
    }

    pub fn global(action: RecoveryAction) -> Self {
        Self::new(RuleMatch::Global, action)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retryable_kinds(mut self, kinds: &[ErrorKind]) -> Self {
        self.retryable_kinds = Some(kinds.iter().copied().collect());
        self
    }

    pub fn with_fallback(mut self, node_id: &str) -> Self {
        self.fallback_node = Some(node_id.to_string());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// The rule chosen for one failure.
#[derive(Debug, Clone)]
pub struct ResolvedPolicy {
    pub action: RecoveryAction,
    pub retry: RetryPolicy,
    pub fallback_node: Option<String>,
    /// Whether the failed kind is retryable under the chosen rule
    pub retryable: bool,
}

/// Instance-scoped registry of classification and recovery rules.
pub struct ErrorPolicyRegistry {
    classifier: ErrorClassifier,
    rules: Vec<PolicyRule>,
}

impl ErrorPolicyRegistry {
    pub fn new() -> Self {
        Self { classifier: ErrorClassifier::with_default_rules(), rules: vec![] }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn add_rule(&mut self, rule: PolicyRule) -> &mut Self {
        self.rules.push(rule);
        self
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Classify a raw failure message once.
    pub fn classify(&self, hint: Option<ErrorKind>, message: &str) -> ErrorContext {
        self.classifier.classify(hint, message)
    }

    /// Pick the highest-priority matching rule for a classified failure.
    ///
    /// Cancellation always halts; with no matching rule, retryable kinds
    /// retry under the default policy and everything else halts.
    pub fn resolve(&self, error: &ErrorContext, node_id: &str) -> ResolvedPolicy {
        if error.kind == ErrorKind::Cancellation {
            return ResolvedPolicy {
                action: RecoveryAction::Halt,
                retry: RetryPolicy::none(),
                fallback_node: None,
                retryable: false,
            };
        }

        let best = self
            .rules
            .iter()
            .filter(|rule| rule.matcher.matches(error, node_id))
            .max_by_key(|rule| (rule.matcher.specificity(), rule.priority));

        match best {
            Some(rule) => {
                let retryable = rule
                    .retryable_kinds
                    .as_ref()
                    .map_or_else(|| error.kind.retryable_by_default(), |set| set.contains(&error.kind));
                ResolvedPolicy {
                    action: rule.action,
                    retry: rule.retry.clone(),
                    fallback_node: rule.fallback_node.clone(),
                    retryable,
                }
            }
            None => {
                let retryable = error.kind.retryable_by_default();
                ResolvedPolicy {
                    action: if retryable { RecoveryAction::Retry } else { RecoveryAction::Halt },
                    retry: RetryPolicy::default(),
                    fallback_node: None,
                    retryable,
                }
            }
        }
    }
}

impl Default for ErrorPolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_exponential_delays_without_jitter() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(50), 2.0)
            .with_jitter(JitterMode::None);

        assert_eq!(policy.delay_for(1, &mut rng()), Duration::from_millis(50));
        assert_eq!(policy.delay_for(2, &mut rng()), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3, &mut rng()), Duration::from_millis(200));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::exponential(10, Duration::from_secs(1), 10.0)
            .with_jitter(JitterMode::None)
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_for(9, &mut rng()), Duration::from_secs(5));
    }

    #[test]
    fn test_full_jitter_stays_within_envelope() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(100));
        for attempt in 1..=3 {
            let delay = policy.delay_for(attempt, &mut rng());
            assert!(delay <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::exponential(2, Duration::from_millis(1), 2.0);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::none().should_retry(1));
    }

    #[test]
    fn test_precedence_node_beats_kind_beats_global() {
        let mut registry = ErrorPolicyRegistry::new();
        registry.add_rule(PolicyRule::global(RecoveryAction::Halt));
        registry.add_rule(PolicyRule::for_kind(ErrorKind::Network, RecoveryAction::Retry));
        registry.add_rule(PolicyRule::for_node("flaky", RecoveryAction::Skip));

        let error = ErrorContext::new(ErrorKind::Network, "connection reset");
        assert_eq!(registry.resolve(&error, "flaky").action, RecoveryAction::Skip);
        assert_eq!(registry.resolve(&error, "other").action, RecoveryAction::Retry);

        let other = ErrorContext::new(ErrorKind::NodeExecution, "boom");
        assert_eq!(registry.resolve(&other, "other").action, RecoveryAction::Halt);
    }

    #[test]
    fn test_pattern_rules_sit_between_node_and_kind() {
        let mut registry = ErrorPolicyRegistry::new();
        registry.add_rule(PolicyRule::for_kind(ErrorKind::Network, RecoveryAction::Retry));
        registry.add_rule(PolicyRule::new(
            RuleMatch::NodePattern(Regex::new("^api-").unwrap()),
            RecoveryAction::Fallback,
        ));

        let error = ErrorContext::new(ErrorKind::Network, "reset");
        assert_eq!(registry.resolve(&error, "api-search").action, RecoveryAction::Fallback);
        assert_eq!(registry.resolve(&error, "worker").action, RecoveryAction::Retry);
    }

    #[test]
    fn test_cancellation_always_halts() {
        let mut registry = ErrorPolicyRegistry::new();
        registry.add_rule(PolicyRule::global(RecoveryAction::Retry));

        let error = ErrorContext::new(ErrorKind::Cancellation, "canceled");
        let resolved = registry.resolve(&error, "any");
        assert_eq!(resolved.action, RecoveryAction::Halt);
        assert!(!resolved.retryable);
    }

    #[test]
    fn test_unmatched_retryable_kind_defaults_to_retry() {
        let registry = ErrorPolicyRegistry::new();
        let transient = ErrorContext::new(ErrorKind::Timeout, "slow");
        assert_eq!(registry.resolve(&transient, "n").action, RecoveryAction::Retry);

        let hard = ErrorContext::new(ErrorKind::Validation, "bad input");
        assert_eq!(registry.resolve(&hard, "n").action, RecoveryAction::Halt);
    }

    #[test]
    fn test_retryable_kind_override() {
        let mut registry = ErrorPolicyRegistry::new();
        registry.add_rule(
            PolicyRule::for_node("stubborn", RecoveryAction::Retry)
                .with_retryable_kinds(&[ErrorKind::NodeExecution]),
        );

        let error = ErrorContext::new(ErrorKind::NodeExecution, "boom");
        assert!(registry.resolve(&error, "stubborn").retryable);

        let network = ErrorContext::new(ErrorKind::Network, "reset");
        assert!(!registry.resolve(&network, "stubborn").retryable);
    }

    #[test]
    fn test_priority_breaks_ties() {
        let mut registry = ErrorPolicyRegistry::new();
        registry.add_rule(PolicyRule::for_node("n", RecoveryAction::Halt).with_priority(1));
        registry.add_rule(PolicyRule::for_node("n", RecoveryAction::Skip).with_priority(5));

        let error = ErrorContext::new(ErrorKind::NodeExecution, "boom");
        assert_eq!(registry.resolve(&error, "n").action, RecoveryAction::Skip);
    }
}
