//! Admission control
//!
//! A weighted token bucket with priority multipliers, starvation
//! protection, and load-adaptive throttling. Every node execution holds
//! a [`Lease`] for its duration; leases release on drop from any exit
//! path.

use crate::error::{GraphError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::System;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Priority of an acquire; adjusts the effective cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Multiplier applied to the acquire's weight.
    pub fn cost_multiplier(&self) -> f64 {
        match self {
            Self::Low => 1.5,
            Self::Normal => 1.0,
            Self::High => 0.6,
            Self::Critical => 0.5,
        }
    }

    /// One level up, used by starvation protection.
    pub fn escalated(&self) -> Priority {
        match self {
            Self::Low => Self::Normal,
            Self::Normal => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

/// One observation of host load.
#[derive(Debug, Clone, Copy)]
pub struct LoadSample {
    pub cpu_pct: f32,
    pub available_memory_mb: u64,
}

/// Source of load observations; swapped for a static one in tests.
pub trait LoadSampler: Send + Sync {
    fn sample(&self) -> LoadSample;
}

/// sysinfo-backed sampler reading CPU usage and available memory.
pub struct SystemLoadSampler {
    system: Mutex<System>,
}

impl SystemLoadSampler {
    pub fn new() -> Self {
        Self { system: Mutex::new(System::new()) }
    }
}

impl Default for SystemLoadSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for SystemLoadSampler {
    fn sample(&self) -> LoadSample {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_cpu_usage();
        system.refresh_memory();
        LoadSample {
            cpu_pct: system.global_cpu_usage(),
            available_memory_mb: system.available_memory() / (1024 * 1024),
        }
    }
}

/// Fixed sampler for tests and for disabling adaptation.
pub struct StaticLoadSampler(pub LoadSample);

impl LoadSampler for StaticLoadSampler {
    fn sample(&self) -> LoadSample {
        self.0
    }
}

/// Governor tuning.
#[derive(Clone)]
pub struct GovernorConfig {
    pub base_permits_per_second: f64,
    pub max_burst: f64,
    /// CPU percentage above which the rate scales down
    pub cpu_soft_limit_pct: f32,
    /// CPU percentage above which only Critical is admitted
    pub cpu_hard_watermark_pct: f32,
    /// Available-memory floor below which only Critical is admitted
    pub min_available_memory_mb: u64,
    /// How often the load sampler runs
    pub sample_interval: Duration,
    /// Queued time after which a request escalates one priority level
    pub starvation_threshold: Duration,
    /// Overall bound on one acquire
    pub acquire_timeout: Option<Duration>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            base_permits_per_second: 50.0,
            max_burst: 100.0,
            cpu_soft_limit_pct: 70.0,
            cpu_hard_watermark_pct: 90.0,
            min_available_memory_mb: 256,
            sample_interval: Duration::from_secs(1),
            starvation_threshold: Duration::from_secs(5),
            acquire_timeout: None,
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_sample: Option<(Instant, LoadSample)>,
}

/// Admission permit; releasing is dropping.
#[derive(Debug)]
pub struct Lease {
    in_flight: Arc<AtomicUsize>,
    pub weight: f64,
    pub priority: Priority,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Priority-aware token bucket with adaptive throttling.
pub struct ResourceGovernor {
    config: GovernorConfig,
    bucket: Mutex<Bucket>,
    sampler: Option<Arc<dyn LoadSampler>>,
    in_flight: Arc<AtomicUsize>,
}

impl ResourceGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            bucket: Mutex::new(Bucket {
                tokens: 0.0,
                last_refill: Instant::now(),
                last_sample: None,
            }),
            sampler: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Attach a load sampler; without one the governor never throttles
    /// adaptively.
    pub fn with_sampler(mut self, sampler: Arc<dyn LoadSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Leases currently held.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Acquire a permit of `weight` at `priority`, waiting for refill as
    /// needed. Fails with `Cancellation` or `Timeout`.
    pub async fn acquire(
        &self,
        weight: f64,
        priority: Priority,
        cancellation: &CancellationToken,
    ) -> Result<Lease> {
        let enqueued = Instant::now();
        let deadline = self.config.acquire_timeout.map(|t| enqueued + t);

        loop {
            if cancellation.is_cancelled() {
                return Err(GraphError::Canceled { node: None });
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(GraphError::Timeout { scope: "governor acquire".to_string() });
                }
            }

            // Starvation protection: long-queued requests climb one level.
            let effective_priority = if enqueued.elapsed() >= self.config.starvation_threshold {
                priority.escalated()
            } else {
                priority
            };

            let load = {
                let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
                self.observe_load(&mut bucket)
            };

            if let Some(load) = load {
                let overloaded = load.cpu_pct >= self.config.cpu_hard_watermark_pct
                    || load.available_memory_mb < self.config.min_available_memory_mb;
                if overloaded && effective_priority != Priority::Critical {
                    // Re-check after the next sample window
                    self.wait_or_cancel(self.config.sample_interval, cancellation).await?;
                    continue;
                }
            }

            let wait = {
                let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());

                let rate = self.effective_rate(load);
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.last_refill = Instant::now();
                bucket.tokens = (bucket.tokens + elapsed * rate).min(self.config.max_burst);

                let cost = weight * effective_priority.cost_multiplier();
                if bucket.tokens >= cost {
                    bucket.tokens -= cost;
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    return Ok(Lease {
                        in_flight: self.in_flight.clone(),
                        weight,
                        priority: effective_priority,
                    });
                }

                let deficit = cost - bucket.tokens;
                Duration::from_secs_f64(deficit / rate.max(f64::EPSILON))
            };

            self.wait_or_cancel(wait.min(Duration::from_millis(250)), cancellation).await?;
        }
    }

    fn observe_load(&self, bucket: &mut Bucket) -> Option<LoadSample> {
        let sampler = self.sampler.as_ref()?;
        let stale = bucket
            .last_sample
            .is_none_or(|(at, _)| at.elapsed() >= self.config.sample_interval);
        if stale {
            bucket.last_sample = Some((Instant::now(), sampler.sample()));
        }
        bucket.last_sample.map(|(_, sample)| sample)
    }

    /// Base rate scaled down proportionally once CPU crosses the soft
    /// limit.
    fn effective_rate(&self, load: Option<LoadSample>) -> f64 {
        let base = self.config.base_permits_per_second;
        let Some(load) = load else {
            return base;
        };
        let soft = self.config.cpu_soft_limit_pct;
        if load.cpu_pct <= soft {
            return base;
        }
        let headroom = (100.0 - soft).max(1.0);
        let over = (load.cpu_pct - soft).min(headroom);
        let scale = (1.0 - (over / headroom) as f64).max(0.1);
        base * scale
    }

    async fn wait_or_cancel(
        &self,
        wait: Duration,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            _ = cancellation.cancelled() => Err(GraphError::Canceled { node: None }),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }
}
