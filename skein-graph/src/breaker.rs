//! Per-node circuit breakers
//!
//! Closed counts failures in a rolling window; Open short-circuits
//! executions; HalfOpen admits a bounded number of probes. Time is
//! tokio's clock so breaker behavior is testable under paused time.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// State transitions the executor turns into events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened,
    Closed,
    HalfOpened,
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that open the circuit
    pub failure_threshold: u32,
    /// Rolling window for failure counting
    pub failure_window: Duration,
    /// How long the circuit stays open before probing
    pub open_timeout: Duration,
    /// Successful probes required to close again
    pub half_open_probes: u32,
    /// Also count budget exhaustion as a breaker failure
    pub trigger_on_budget_exhaustion: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(10),
            open_timeout: Duration::from_secs(30),
            half_open_probes: 1,
            trigger_on_budget_exhaustion: false,
        }
    }
}

/// Admission decision for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    /// Circuit closed; proceed normally
    Allow,
    /// Circuit half-open; proceed, this call is a probe
    Probe,
    /// Circuit open; short-circuit with `CircuitBreakerOpen`
    Reject,
}

/// One node's breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probes_admitted: u32,
    probe_successes: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            probes_admitted: 0,
            probe_successes: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Gate one execution; may flip Open to HalfOpen when the open
    /// timeout has elapsed.
    pub fn admit(&mut self) -> (CircuitDecision, Option<CircuitTransition>) {
        match self.state {
            CircuitState::Closed => (CircuitDecision::Allow, None),
            CircuitState::Open => {
                let elapsed =
                    self.opened_at.map(|at| at.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.probes_admitted = 1;
                    self.probe_successes = 0;
                    (CircuitDecision::Probe, Some(CircuitTransition::HalfOpened))
                } else {
                    (CircuitDecision::Reject, None)
                }
            }
            CircuitState::HalfOpen => {
                if self.probes_admitted < self.config.half_open_probes {
                    self.probes_admitted += 1;
                    (CircuitDecision::Probe, None)
                } else {
                    (CircuitDecision::Reject, None)
                }
            }
        }
    }

    /// Record a successful execution.
    pub fn record_success(&mut self) -> Option<CircuitTransition> {
        match self.state {
            CircuitState::Closed => {
                self.trim_window();
                None
            }
            CircuitState::HalfOpen => {
                self.probe_successes += 1;
                if self.probe_successes >= self.config.half_open_probes {
                    self.reset();
                    Some(CircuitTransition::Closed)
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    /// Record a failed execution.
    pub fn record_failure(&mut self) -> Option<CircuitTransition> {
        match self.state {
            CircuitState::Closed => {
                self.failures.push_back(Instant::now());
                self.trim_window();
                if self.failures.len() as u32 >= self.config.failure_threshold {
                    self.open()
                } else {
                    None
                }
            }
            // Any probe failure reopens
            CircuitState::HalfOpen => self.open(),
            CircuitState::Open => None,
        }
    }

    /// Open unconditionally; used by the `CircuitBreaker` recovery
    /// action.
    pub fn force_open(&mut self) -> Option<CircuitTransition> {
        if self.state == CircuitState::Open {
            return None;
        }
        self.open()
    }

    fn open(&mut self) -> Option<CircuitTransition> {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.failures.clear();
        self.probes_admitted = 0;
        self.probe_successes = 0;
        Some(CircuitTransition::Opened)
    }

    fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.failures.clear();
        self.probes_admitted = 0;
        self.probe_successes = 0;
    }

    fn trim_window(&mut self) {
        if let Some(cutoff) = Instant::now().checked_sub(self.config.failure_window) {
            while self.failures.front().is_some_and(|t| *t < cutoff) {
                self.failures.pop_front();
            }
        }
    }
}

/// Executor-scoped breaker table, one breaker per configured node.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    configs: HashMap<String, CircuitBreakerConfig>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable a breaker for one node.
    pub fn configure(&mut self, node_id: &str, config: CircuitBreakerConfig) {
        self.configs.insert(node_id.to_string(), config);
    }

    /// Whether the node has a breaker at all.
    pub fn is_configured(&self, node_id: &str) -> bool {
        self.configs.contains_key(node_id)
    }

    /// Whether the node's breaker counts budget exhaustion.
    pub fn trips_on_budget(&self, node_id: &str) -> bool {
        self.configs.get(node_id).is_some_and(|c| c.trigger_on_budget_exhaustion)
    }

    /// Run `f` against the node's breaker, creating it lazily. Returns
    /// `None` when the node has no breaker configured.
    pub fn with_breaker<T>(
        &self,
        node_id: &str,
        f: impl FnOnce(&mut CircuitBreaker) -> T,
    ) -> Option<T> {
        let config = self.configs.get(node_id)?.clone();
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let breaker =
            breakers.entry(node_id.to_string()).or_insert_with(|| CircuitBreaker::new(config));
        Some(f(breaker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(10),
            open_timeout: Duration::from_millis(100),
            half_open_probes: 2,
            trigger_on_budget_exhaustion: false,
        }
    }

    #[tokio::test]
    async fn test_opens_at_threshold() {
        let mut breaker = CircuitBreaker::new(fast_config());
        assert_eq!(breaker.record_failure(), None);
        assert_eq!(breaker.record_failure(), None);
        assert_eq!(breaker.record_failure(), Some(CircuitTransition::Opened));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.admit().0, CircuitDecision::Reject);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout_then_closes() {
        let mut breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }

        tokio::time::advance(Duration::from_millis(150)).await;

        let (decision, transition) = breaker.admit();
        assert_eq!(decision, CircuitDecision::Probe);
        assert_eq!(transition, Some(CircuitTransition::HalfOpened));

        // First probe succeeds; still needs the second
        assert_eq!(breaker.record_success(), None);
        let (decision, _) = breaker.admit();
        assert_eq!(decision, CircuitDecision::Probe);
        assert_eq!(breaker.record_success(), Some(CircuitTransition::Closed));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens() {
        let mut breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_millis(150)).await;

        assert_eq!(breaker.admit().0, CircuitDecision::Probe);
        assert_eq!(breaker.record_failure(), Some(CircuitTransition::Opened));
        assert_eq!(breaker.admit().0, CircuitDecision::Reject);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_forgets_failures() {
        let mut breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_failure();

        // Old failures age out of the window
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(breaker.record_failure(), None);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_registry_scopes_per_node() {
        let mut registry = BreakerRegistry::new();
        registry.configure("api", fast_config());

        assert!(registry.is_configured("api"));
        assert!(!registry.is_configured("other"));
        assert_eq!(registry.with_breaker("other", |_| ()), None);

        registry.with_breaker("api", |b| {
            b.record_failure();
            b.record_failure();
            b.record_failure();
        });
        let state = registry.with_breaker("api", |b| b.state());
        assert_eq!(state, Some(CircuitState::Open));
    }
}
